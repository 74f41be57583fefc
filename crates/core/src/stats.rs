//! Statistic entities for the replay telemetry pipeline.
//!
//! Each named statistic is a `Tally`, a `Level`, or a `Series`. Values
//! accumulate between reports; `report()` produces the windowed aggregates,
//! annotates each with its change since the previous report, and clears the
//! per-window buffers.

use std::collections::HashMap;

/// One line of a statistics report: aggregate label, formatted value, and a
/// signed delta against the previous report (empty on the first report, and
/// for unchanged integers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportLine {
    pub label: String,
    pub value: String,
    pub delta: String,
}

#[derive(Debug, Clone, Copy)]
enum Format {
    Integer,
    Float,
}

fn render(value: f64, format: Format) -> String {
    match format {
        Format::Integer => (value.round() as i64).to_string(),
        Format::Float => render_float(value),
    }
}

/// Four-ish significant digits without trailing zero noise.
fn render_float(value: f64) -> String {
    if !value.is_finite() {
        return format!("{value}");
    }
    let magnitude = value.abs();
    let decimals = if magnitude >= 1000.0 {
        0
    } else if magnitude >= 100.0 {
        1
    } else if magnitude >= 10.0 {
        2
    } else {
        3
    };
    let text = format!("{value:.decimals$}");
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text
    }
}

fn render_delta(delta: f64, format: Format) -> String {
    match format {
        Format::Integer => {
            let delta = delta.round() as i64;
            if delta == 0 {
                String::new()
            } else {
                format!("({delta:+})")
            }
        }
        Format::Float => {
            let sign = if delta < 0.0 { "-" } else { "+" };
            format!("({sign}{})", render_float(delta.abs()))
        }
    }
}

fn lines(
    current: Vec<(&'static str, f64, Format)>,
    last: &mut HashMap<&'static str, f64>,
) -> Vec<ReportLine> {
    let mut out = Vec::with_capacity(current.len());
    for (label, value, format) in &current {
        let delta = match last.get(label) {
            Some(previous) => render_delta(value - previous, *format),
            None => String::new(),
        };
        out.push(ReportLine {
            label: (*label).to_string(),
            value: render(*value, *format),
            delta,
        });
    }
    last.clear();
    last.extend(current.iter().map(|(label, value, _)| (*label, *value)));
    out
}

/// Min/max/median/mean/stdev of a sample window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Distribution {
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub mean: f64,
    pub stdev: f64,
}

pub fn distribution(values: &[f64]) -> Option<Distribution> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let median = if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    };
    let mean = sorted.iter().sum::<f64>() / n as f64;
    let sumsq = sorted.iter().map(|v| v * v).sum::<f64>();
    let stdev = (sumsq / n as f64 - mean * mean).max(0.0).sqrt();
    Some(Distribution {
        min: sorted[0],
        max: sorted[n - 1],
        median,
        mean,
        stdev,
    })
}

/// Counts occurrences: how many this window, how many in total.
#[derive(Debug, Default)]
pub struct Tally {
    period: u64,
    grand_total: u64,
    last: HashMap<&'static str, f64>,
}

impl Tally {
    pub fn add(&mut self) {
        self.period += 1;
    }

    pub fn report(&mut self) -> Vec<ReportLine> {
        self.grand_total += self.period;
        let current = vec![
            ("This Period", self.period as f64, Format::Integer),
            ("Total", self.grand_total as f64, Format::Integer),
        ];
        let out = lines(current, &mut self.last);
        self.period = 0;
        out
    }
}

/// Tracks a gauge moved by +1/-1 increments, sampling the gauge after every
/// move so the window distribution reflects every value it held.
#[derive(Debug)]
pub struct Level {
    current: i64,
    levels: Vec<i64>,
    last: HashMap<&'static str, f64>,
}

impl Default for Level {
    fn default() -> Self {
        Self {
            current: 0,
            levels: vec![0],
            last: HashMap::new(),
        }
    }
}

impl Level {
    pub fn add(&mut self, up: bool) {
        self.current += if up { 1 } else { -1 };
        self.levels.push(self.current);
    }

    pub fn current(&self) -> i64 {
        self.current
    }

    pub fn report(&mut self) -> Vec<ReportLine> {
        let window: Vec<f64> = self.levels.iter().map(|v| *v as f64).collect();
        let mut current = vec![("Current", self.current as f64, Format::Integer)];
        if let Some(d) = distribution(&window) {
            current.push(("Min", d.min, Format::Integer));
            current.push(("Max", d.max, Format::Integer));
            current.push(("Median", d.median, Format::Float));
            current.push(("Mean", d.mean, Format::Float));
            current.push(("Stdev", d.stdev, Format::Float));
        }
        let out = lines(current, &mut self.last);
        self.levels = vec![self.current];
        out
    }
}

/// Collects raw samples within a window.
#[derive(Debug, Default)]
pub struct Series {
    values: Vec<f64>,
    last_value: Option<f64>,
    last: HashMap<&'static str, f64>,
}

impl Series {
    pub fn add(&mut self, value: f64) {
        self.values.push(value);
        self.last_value = Some(value);
    }

    pub fn report(&mut self) -> Vec<ReportLine> {
        let mut current = Vec::new();
        if let Some(latest) = self.last_value {
            current.push(("Current", latest, Format::Float));
        }
        if let Some(d) = distribution(&self.values) {
            current.push(("Min", d.min, Format::Float));
            current.push(("Max", d.max, Format::Float));
            current.push(("Median", d.median, Format::Float));
            current.push(("Mean", d.mean, Format::Float));
            current.push(("Stdev", d.stdev, Format::Float));
        }
        let out = lines(current, &mut self.last);
        self.values.clear();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tally_reports_period_and_running_total() {
        let mut tally = Tally::default();
        tally.add();
        tally.add();

        let first = tally.report();
        assert_eq!(first[0].label, "This Period");
        assert_eq!(first[0].value, "2");
        assert_eq!(first[0].delta, "");
        assert_eq!(first[1].label, "Total");
        assert_eq!(first[1].value, "2");

        tally.add();
        let second = tally.report();
        assert_eq!(second[0].value, "1");
        assert_eq!(second[0].delta, "(-1)");
        assert_eq!(second[1].value, "3");
        assert_eq!(second[1].delta, "(+1)");
    }

    #[test]
    fn level_tracks_every_value_in_the_window() {
        let mut level = Level::default();
        level.add(true);
        level.add(true);
        level.add(false);

        let report = level.report();
        assert_eq!(report[0].label, "Current");
        assert_eq!(report[0].value, "1");
        assert_eq!(report[1].label, "Min");
        assert_eq!(report[1].value, "0");
        assert_eq!(report[2].label, "Max");
        assert_eq!(report[2].value, "2");

        // The window reseeds with the current value.
        let report = level.report();
        assert_eq!(report[1].value, "1");
        assert_eq!(report[2].value, "1");
    }

    #[test]
    fn series_window_clears_after_report() {
        let mut series = Series::default();
        series.add(10.0);
        series.add(20.0);

        let report = series.report();
        assert_eq!(report[0].label, "Current");
        assert_eq!(report[0].value, "20");
        let max = report.iter().find(|l| l.label == "Max").unwrap();
        assert_eq!(max.value, "20");

        // Nothing sampled since: only the current value remains.
        let report = series.report();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].label, "Current");
    }

    #[test]
    fn distribution_matches_hand_computation() {
        let d = distribution(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(d.min, 1.0);
        assert_eq!(d.max, 4.0);
        assert_eq!(d.median, 2.5);
        assert_eq!(d.mean, 2.5);
        assert!((d.stdev - 1.118).abs() < 0.001);
        assert!(distribution(&[]).is_none());
    }

    #[test]
    fn integer_deltas_suppress_zero() {
        let mut tally = Tally::default();
        tally.add();
        tally.report();
        tally.add();
        let report = tally.report();
        assert_eq!(report[0].delta, "");
        assert_eq!(report[1].delta, "(+1)");
    }

    #[test]
    fn float_rendering_keeps_useful_precision() {
        assert_eq!(render_float(0.25), "0.25");
        assert_eq!(render_float(1234.567), "1235");
        assert_eq!(render_float(12.5), "12.5");
        assert_eq!(render_float(0.0), "0");
    }
}
