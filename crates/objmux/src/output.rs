use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

/// Two-column FIELD/VALUE table.
pub fn print_fields(rows: &[(&str, String)]) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["FIELD", "VALUE"]);
    for (field, value) in rows {
        table.add_row(vec![field.to_string(), value.clone()]);
    }
    println!("{table}");
}

/// `field: value` lines, padded to the longest field name.
pub fn print_pretty(title: &str, rows: &[(&str, String)]) {
    let width = rows.iter().map(|(field, _)| field.len()).max().unwrap_or(0) + 1;
    println!("{title}:");
    for (field, value) in rows {
        println!("  {:<width$} {value}", format!("{field}:"), width = width);
    }
}

/// Render `rows` in the table or pretty layouts; JSON and raw output are
/// handled by the caller.
pub fn print_rows(title: &str, rows: &[(&str, String)], format: OutputFormat) {
    match format {
        OutputFormat::Table => print_fields(rows),
        _ => print_pretty(title, rows),
    }
}
