//! Result rendering as text tables, JSON or CSV

use clap::ValueEnum;
use serde_json::{Map, Value};
use std::io::Write;
use tabled::builder::Builder;
use tabled::settings::Style;

/// Output format for command results
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Aligned columns for humans
    #[default]
    Text,
    /// JSON array of objects
    Json,
    /// Comma-separated values with a header row
    Csv,
}

/// Anything that can be shown as rows of named columns
pub trait Tabular {
    /// Column names, in display order
    fn columns(&self) -> Vec<String>;
    /// Row cells, one value per column
    fn rows(&self) -> Vec<Vec<Value>>;
}

/// Cell text for text and CSV output; null renders empty
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Write `data` to `out` in the requested format
pub fn render<T, W>(format: OutputFormat, data: &T, out: &mut W) -> std::io::Result<()>
where
    T: Tabular + ?Sized,
    W: Write + ?Sized,
{
    match format {
        OutputFormat::Text => render_text(data, out),
        OutputFormat::Json => render_json(data, out),
        OutputFormat::Csv => render_csv(data, out),
    }
}

fn render_text<T: Tabular + ?Sized, W: Write + ?Sized>(data: &T, out: &mut W) -> std::io::Result<()> {
    let mut builder = Builder::default();
    builder.push_record(data.columns());
    for row in data.rows() {
        builder.push_record(row.iter().map(cell_text));
    }

    let mut table = builder.build();
    table.with(Style::psql());
    writeln!(out, "{}", table)
}

fn render_json<T: Tabular + ?Sized, W: Write + ?Sized>(data: &T, out: &mut W) -> std::io::Result<()> {
    let columns = data.columns();
    let objects: Vec<Value> = data
        .rows()
        .into_iter()
        .map(|row| {
            let map: Map<String, Value> = columns.iter().cloned().zip(row).collect();
            Value::Object(map)
        })
        .collect();
    serde_json::to_writer_pretty(&mut *out, &objects)?;
    writeln!(out)
}

fn render_csv<T: Tabular + ?Sized, W: Write + ?Sized>(data: &T, out: &mut W) -> std::io::Result<()> {
    let header: Vec<String> = data.columns().iter().map(|c| csv_field(c)).collect();
    writeln!(out, "{}", header.join(","))?;
    for row in data.rows() {
        let cells: Vec<String> = row.iter().map(|v| csv_field(&cell_text(v))).collect();
        writeln!(out, "{}", cells.join(","))?;
    }
    Ok(())
}

/// Quote a CSV field when it holds a separator, quote or line break
pub fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Render to a `String`, mostly for tests and log lines
pub fn render_to_string<T: Tabular + ?Sized>(format: OutputFormat, data: &T) -> String {
    let mut buf = Vec::new();
    // writing into a Vec cannot fail
    let _ = render(format, data, &mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixture;

    impl Tabular for Fixture {
        fn columns(&self) -> Vec<String> {
            vec!["name".into(), "count".into(), "note".into()]
        }

        fn rows(&self) -> Vec<Vec<Value>> {
            vec![
                vec![json!("alpha"), json!(3), Value::Null],
                vec![json!("beta, gamma"), json!(12), json!("say \"hi\"")],
            ]
        }
    }

    #[test]
    fn test_text_table_layout() {
        let text = render_to_string(OutputFormat::Text, &Fixture);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("name") && lines[0].contains("count") && lines[0].contains("note"));
        assert!(lines[1].starts_with('-') && lines[1].contains('+'));
        assert!(lines[2].contains("alpha") && lines[2].contains('3'));
        assert!(lines[3].contains("beta, gamma") && lines[3].contains("say \"hi\""));
    }

    #[test]
    fn test_text_columns_line_up() {
        let text = render_to_string(OutputFormat::Text, &Fixture);
        let bars: Vec<Vec<usize>> = text
            .lines()
            .filter(|l| !l.starts_with('-'))
            .map(|l| l.match_indices('|').map(|(i, _)| i).collect())
            .collect();
        assert!(bars.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_text_header_only_when_empty() {
        struct Empty;
        impl Tabular for Empty {
            fn columns(&self) -> Vec<String> {
                vec!["key".into(), "status".into()]
            }
            fn rows(&self) -> Vec<Vec<Value>> {
                Vec::new()
            }
        }

        let text = render_to_string(OutputFormat::Text, &Empty);
        assert!(text.lines().next().is_some_and(|l| l.contains("key") && l.contains("status")));
        assert!(!text.contains("alpha"));
    }

    #[test]
    fn test_json_objects() {
        let text = render_to_string(OutputFormat::Json, &Fixture);
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed[1]["count"], json!(12));
        assert_eq!(parsed[0]["note"], Value::Null);
    }

    #[test]
    fn test_csv_quoting() {
        let text = render_to_string(OutputFormat::Csv, &Fixture);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "name,count,note");
        assert_eq!(lines[1], "alpha,3,");
        assert_eq!(lines[2], "\"beta, gamma\",12,\"say \"\"hi\"\"\"");
    }
}
