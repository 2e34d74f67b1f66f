use std::{
    io::{self, IsTerminal},
    path::PathBuf,
};

use anyhow::Context;
use ingest::{ImportReport, SourceInspection};
use owo_colors::OwoColorize;
use store_sqlite::Row;

pub fn color_enabled() -> bool {
    io::stdout().is_terminal()
        && io::stderr().is_terminal()
        && std::env::var_os("NO_COLOR").is_none()
}

fn heading(text: &str) -> String {
    if color_enabled() {
        text.bold().to_string()
    } else {
        text.to_string()
    }
}

fn dim(text: &str) -> String {
    if color_enabled() {
        text.dimmed().to_string()
    } else {
        text.to_string()
    }
}

/// Cuts `input` to at most `max` characters, the last three of them `...`.
pub fn truncate_text(input: &str, max: usize) -> String {
    if input.chars().count() <= max {
        return input.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = input.chars().take(keep).collect();
    out.push_str("...");
    out
}

pub fn format_row(row: &Row) -> String {
    let values: Vec<String> = row
        .values
        .iter()
        .map(|v| match v {
            Some(v) => format!("{v:?}"),
            None => "NULL".to_string(),
        })
        .collect();
    format!("({})", values.join(", "))
}

pub fn print_table(name: &str, columns: &[String], rows: &[Row], width: usize) {
    println!("{}", heading(&format!("Table: {name}")));
    println!("{}", dim(&truncate_text(&format!("{columns:?}"), width)));
    for row in rows {
        println!("{}", truncate_text(&format_row(row), width));
    }
    println!();
}

pub fn print_import_report(report: &ImportReport) {
    println!(
        "sources: {} read, {} skipped",
        report.sources_read, report.sources_skipped
    );
    println!(
        "groups: {} written, {} failed",
        report.groups_written, report.groups_failed
    );
    println!(
        "rows: {} inserted, {} already present, {} rejected",
        report.rows_inserted, report.rows_ignored, report.rows_rejected
    );
    if !report.tables_created.is_empty() {
        println!("new tables: {}", report.tables_created.join(", "));
    }
}

pub fn print_inspection(items: &[SourceInspection]) {
    for item in items {
        match &item.table {
            Some(table) => println!("{} -> {}", heading(&item.origin), table),
            None => println!("{}", heading(&item.origin)),
        }
        for group in &item.groups {
            println!(
                "  {} records, key {}, fingerprint {}",
                group.records,
                group.identity.as_deref().unwrap_or("(none)"),
                dim(group.fingerprint.short())
            );
            println!("    columns: {}", group.columns.join(", "));
        }
        if let Some(problem) = &item.problem {
            let line = format!("  ! {problem}");
            if color_enabled() {
                println!("{}", line.yellow());
            } else {
                println!("{line}");
            }
        }
    }
}

pub fn resolve_output_dir(dir: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let base = if let Some(dir) = dir {
        dir
    } else {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatvault")
            .join("exports")
    };
    std::fs::create_dir_all(&base)
        .with_context(|| format!("creating output dir {}", base.display()))?;
    Ok(base)
}
