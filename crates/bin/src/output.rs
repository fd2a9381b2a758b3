//! Output formatting for human-readable and JSON output.

/// Output format selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
}

/// Print `rows` under `headers` with aligned columns. Prints nothing for an
/// empty table.
pub fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    if !rows.is_empty() {
        print!("{}", render_table(headers, rows));
    }
}

/// Render a table; cells past the header count are dropped and the last
/// column is not padded.
fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let render_line = |cells: Vec<&str>| {
        let last = cells.len().saturating_sub(1);
        let mut line = cells
            .iter()
            .zip(&widths)
            .enumerate()
            .map(|(i, (cell, width))| {
                if i == last {
                    cell.to_string()
                } else {
                    format!("{cell:<width$}")
                }
            })
            .collect::<Vec<_>>()
            .join("  ");
        line.truncate(line.trim_end().len());
        line.push('\n');
        line
    };

    let mut out = render_line(headers.to_vec());
    for row in rows {
        out.push_str(&render_line(row.iter().map(String::as_str).collect()));
    }
    out
}
