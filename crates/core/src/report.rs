//! Plain-text column table formatting for statistics reports.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left,
    Right,
}

pub type Cell = (Align, String);

/// Formats rows of cells into aligned columns, one space between columns.
/// Column widths are taken from the widest cell in each column; short rows
/// are allowed.
pub fn format_table(rows: &[Vec<Cell>]) -> String {
    let columns = rows.iter().map(|r| r.len()).max().unwrap_or(0);
    let mut widths = vec![0usize; columns];
    for row in rows {
        for (i, (_, text)) in row.iter().enumerate() {
            widths[i] = widths[i].max(text.len());
        }
    }

    let mut out = String::new();
    for row in rows {
        let mut line = String::new();
        for (i, (align, text)) in row.iter().enumerate() {
            if i > 0 {
                line.push(' ');
            }
            match align {
                Align::Left => line.push_str(&format!("{text:<width$}", width = widths[i])),
                Align::Right => line.push_str(&format!("{text:>width$}", width = widths[i])),
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn right(text: &str) -> Cell {
        (Align::Right, text.to_string())
    }

    fn left(text: &str) -> Cell {
        (Align::Left, text.to_string())
    }

    #[test]
    fn aligns_columns() {
        let rows = vec![
            vec![right("name:"), right("1"), left("(+1)")],
            vec![right("a much longer name:"), right("12345"), left("")],
        ];
        let table = format_table(&rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "              name:     1 (+1)");
        assert_eq!(lines[1], "a much longer name: 12345");
    }

    #[test]
    fn empty_input_formats_to_nothing() {
        assert_eq!(format_table(&[]), "");
    }
}
