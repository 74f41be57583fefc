//! The stats collector: aggregates telemetry from every worker and prints a
//! windowed report on a fixed period and at shutdown.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use apiary_core::report::{Align, Cell, format_table};
use apiary_core::stats::{Level, Series, Tally};

use crate::telemetry::{Sign, StatsMessage};

/// The timed dequeue: reports still fire while the channel is idle.
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

enum Entity {
    Tally(Tally),
    Level(Level),
    Series(Series),
}

impl Entity {
    fn kind(&self) -> &'static str {
        match self {
            Entity::Tally(_) => "tally",
            Entity::Level(_) => "level",
            Entity::Series(_) => "series",
        }
    }
}

#[derive(Default)]
struct Entities {
    by_name: BTreeMap<String, Entity>,
}

impl Entities {
    fn apply(&mut self, message: StatsMessage) {
        match message {
            StatsMessage::Tally(name) => self.tally(name),
            // Per-session failures are surfaced as a tally under their
            // message.
            StatsMessage::Error(message) => self.tally(message),
            StatsMessage::Level(name, sign) => {
                match self
                    .by_name
                    .entry(name)
                    .or_insert_with(|| Entity::Level(Level::default()))
                {
                    Entity::Level(level) => level.add(sign == Sign::Up),
                    other => tracing::warn!(
                        kind = other.kind(),
                        "level message for a statistic of another kind; ignoring"
                    ),
                }
            }
            StatsMessage::Series(name, value) => {
                match self
                    .by_name
                    .entry(name)
                    .or_insert_with(|| Entity::Series(Series::default()))
                {
                    Entity::Series(series) => series.add(value),
                    other => tracing::warn!(
                        kind = other.kind(),
                        "series message for a statistic of another kind; ignoring"
                    ),
                }
            }
            StatsMessage::Stop => {}
        }
    }

    fn tally(&mut self, name: String) {
        match self
            .by_name
            .entry(name)
            .or_insert_with(|| Entity::Tally(Tally::default()))
        {
            Entity::Tally(tally) => tally.add(),
            other => tracing::warn!(
                kind = other.kind(),
                "tally message for a statistic of another kind; ignoring"
            ),
        }
    }

    /// One table row per (entity, aggregate) pair: name, value, delta.
    fn report_rows(&mut self) -> Vec<Vec<Cell>> {
        let mut rows = Vec::new();
        for (name, entity) in self.by_name.iter_mut() {
            let lines = match entity {
                Entity::Tally(tally) => tally.report(),
                Entity::Level(level) => level.report(),
                Entity::Series(series) => series.report(),
            };
            for line in lines {
                rows.push(vec![
                    (Align::Right, format!("{name} - {}:", line.label)),
                    (Align::Right, line.value),
                    (Align::Left, line.delta),
                ]);
            }
        }
        rows
    }
}

fn print_report(entities: &mut Entities) {
    let rows = entities.report_rows();
    if rows.is_empty() {
        return;
    }
    println!();
    println!("{}", chrono::Local::now().format("%H:%M:%S"));
    print!("{}", format_table(&rows));
}

/// Runs until a `Stop` sentinel arrives (or every sender is gone), printing
/// a report every `interval` and a final one on the way out.
pub(crate) async fn run_stats_collector(
    mut rx: mpsc::UnboundedReceiver<StatsMessage>,
    interval: Duration,
) {
    let mut entities = Entities::default();
    let mut next_report = Instant::now() + interval;

    loop {
        let stop = match tokio::time::timeout(RECV_TIMEOUT, rx.recv()).await {
            Ok(Some(StatsMessage::Stop)) | Ok(None) => true,
            Ok(Some(message)) => {
                entities.apply(message);
                false
            }
            Err(_) => false,
        };

        if stop || Instant::now() >= next_report {
            print_report(&mut entities);
            next_report = Instant::now() + interval;
        }
        if stop {
            break;
        }
    }
    tracing::debug!("stats collector stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::stats_channel;

    #[test]
    fn entities_are_created_on_first_message() {
        let mut entities = Entities::default();
        entities.apply(StatsMessage::Tally("Job completed successfully".into()));
        entities.apply(StatsMessage::Level("Jobs Running".into(), Sign::Up));
        entities.apply(StatsMessage::Series("Request Duration (ms)".into(), 3.5));
        entities.apply(StatsMessage::Error("500 connect refused".into()));

        let rows = entities.report_rows();
        let names: Vec<&str> = rows.iter().map(|row| row[0].1.as_str()).collect();
        assert!(names.contains(&"500 connect refused - This Period:"));
        assert!(names.contains(&"Job completed successfully - Total:"));
        assert!(names.contains(&"Jobs Running - Current:"));
        assert!(names.contains(&"Request Duration (ms) - Max:"));
    }

    #[test]
    fn kind_mismatches_are_ignored() {
        let mut entities = Entities::default();
        entities.apply(StatsMessage::Tally("name".into()));
        entities.apply(StatsMessage::Series("name".into(), 1.0));

        let rows = entities.report_rows();
        // Still a tally: two aggregate rows, not six.
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn report_clears_the_window() {
        let mut entities = Entities::default();
        entities.apply(StatsMessage::Tally("t".into()));
        let first = entities.report_rows();
        assert_eq!(first[0][1].1, "1");

        let second = entities.report_rows();
        assert_eq!(second[0][1].1, "0");
        assert_eq!(second[0][2].1, "(-1)");
    }

    #[tokio::test]
    async fn collector_stops_on_sentinel() {
        let (telemetry, rx) = stats_channel();
        telemetry.tally("t");
        telemetry.stop();
        // Returns instead of waiting out the report interval.
        run_stats_collector(rx, Duration::from_secs(3600)).await;
    }
}
