//! Output rendering: Markdown tables by default, raw JSON with
//! `--format json`.

use serde_json::Value;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Markdown,
    Json,
}

/// Print a list of objects as a Markdown table (or JSON).
pub fn table(format: Format, columns: &[&str], rows: &[Value]) {
    if format == Format::Json {
        println!("{}", serde_json::to_string_pretty(rows).unwrap_or_default());
        return;
    }
    if rows.is_empty() {
        println!("_(none)_");
        return;
    }

    let widths: Vec<usize> = columns
        .iter()
        .map(|col| {
            rows.iter()
                .map(|row| cell(row, col).len())
                .chain(std::iter::once(col.len()))
                .max()
                .unwrap_or(col.len())
        })
        .collect();

    let header: Vec<String> = columns
        .iter()
        .zip(widths.iter().copied())
        .map(|(col, w)| format!("{col:w$}"))
        .collect();
    println!("| {} |", header.join(" | "));
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    println!("| {} |", rule.join(" | "));
    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .zip(widths.iter().copied())
            .map(|(col, w)| format!("{:w$}", cell(row, col)))
            .collect();
        println!("| {} |", cells.join(" | "));
    }
}

/// Print one object as a key/value list (or JSON).
pub fn object(format: Format, value: &Value) {
    if format == Format::Json {
        println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
        return;
    }
    match value.as_object() {
        Some(map) => {
            for (key, v) in map {
                println!("- **{key}**: {}", render(v));
            }
        }
        None => println!("{}", render(value)),
    }
}

fn cell(row: &Value, col: &str) -> String {
    render(row.get(col).unwrap_or(&Value::Null))
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cell_rendering() {
        let row = json!({"name": "blog", "files": 3, "missing": null});
        assert_eq!(cell(&row, "name"), "blog");
        assert_eq!(cell(&row, "files"), "3");
        assert_eq!(cell(&row, "missing"), "");
        assert_eq!(cell(&row, "absent"), "");
    }
}
