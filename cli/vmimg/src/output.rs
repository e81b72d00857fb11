//! Output formatting for CLI commands.

use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use tabled::builder::Builder;
use tabled::{Table, Tabled};

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON format.
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputFormat::Json
        } else {
            OutputFormat::Table
        }
    }
}

/// Print rows in the specified format.
pub fn print_output<T: Serialize + Tabled>(data: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if data.is_empty() {
                println!("{}", "No items found.".dimmed());
            } else {
                println!("{}", Table::new(data));
            }
        }
        OutputFormat::Json => print_json(data),
    }
}

/// Print a value as pretty JSON.
pub fn print_json<T: Serialize + ?Sized>(data: &T) {
    let json = serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string());
    println!("{json}");
}

/// Table with one column per requested field of each JSON object.
///
/// Field names are keys of the objects; the header is their upper-cased
/// form. Missing fields render as `-`.
pub fn field_table(rows: &[Value], fields: &[String]) -> String {
    let mut builder = Builder::default();
    builder.push_record(fields.iter().map(|f| f.to_uppercase()));
    for row in rows {
        builder.push_record(fields.iter().map(|f| cell(row.get(f))));
    }
    builder.build().to_string()
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "-".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "Success:".green().bold(), message);
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "Info:".blue().bold(), message);
}

/// Print a warning on stderr.
pub fn print_warning(message: &str) {
    eprintln!("{} {}", "Warning:".yellow().bold(), message);
}
