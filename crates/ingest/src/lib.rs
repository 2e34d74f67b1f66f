use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, bail};
use core_model::{Fingerprint, ImportError, Record, group_records, ident::default_aliases};
use serde_json::Value;
use store_sqlite::SqliteStore;
use tracing::{debug, info, warn};

pub mod html;
pub mod walk;

pub use html::ScriptData;
pub use walk::{Payload, PayloadFormat, SourceWalker};

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Key tables whose records carry no identity field on all columns
    /// instead of rejecting them.
    pub compound_keys: bool,
    pub aliases: HashMap<String, String>,
    pub html_variable: String,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            compound_keys: false,
            aliases: default_aliases(),
            html_variable: html::DEFAULT_VARIABLE.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ImportPhase {
    Source { origin: String, records: usize },
    Group { table: String, inserted: usize, ignored: usize },
    Done { rows_inserted: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub sources_read: usize,
    pub sources_skipped: usize,
    pub groups_written: usize,
    pub groups_failed: usize,
    pub tables_created: Vec<String>,
    pub rows_inserted: usize,
    pub rows_ignored: usize,
    pub rows_rejected: usize,
}

pub fn parse_payload(payload: &Payload, script: &ScriptData) -> core_model::Result<Vec<Record>> {
    let text = std::str::from_utf8(&payload.bytes)
        .map_err(|e| ImportError::malformed(&payload.origin, format!("not UTF-8: {e}")))?;
    let value = match payload.format {
        PayloadFormat::Json => serde_json::from_str::<Value>(text)
            .map_err(|e| ImportError::malformed(&payload.origin, format!("invalid JSON: {e}")))?,
        PayloadFormat::Html => script.extract(&payload.origin, text)?,
    };
    records_from_value(&payload.origin, value)
}

fn records_from_value(origin: &str, value: Value) -> core_model::Result<Vec<Record>> {
    match value {
        Value::Object(map) => Ok(vec![Record::from(map)]),
        Value::Array(items) => {
            let total = items.len();
            let records: Vec<Record> = items.into_iter().filter_map(Record::from_value).collect();
            if records.len() < total {
                warn!(
                    origin = %origin,
                    dropped = total - records.len(),
                    "dropping array elements that are not objects"
                );
            }
            Ok(records)
        }
        _ => Err(ImportError::malformed(
            origin,
            "expected an object or an array of objects",
        )),
    }
}

fn log_skip(err: &ImportError) {
    match err {
        ImportError::MalformedInput {
            excerpt: Some(excerpt),
            ..
        } => warn!(kind = err.kind(), excerpt = %excerpt, "{err}"),
        _ => warn!(kind = err.kind(), "{err}"),
    }
}

/// Imports everything under `root` (a file, a directory or an archive).
/// Problems with a single source, group or row are logged, counted and
/// skipped; only an unusable root or option set fails the run.
pub fn import_path(
    root: &Path,
    store: &mut SqliteStore,
    options: &ImportOptions,
    on_progress: impl Fn(ImportPhase),
) -> anyhow::Result<ImportReport> {
    if !root.exists() {
        bail!("import source {} does not exist", root.display());
    }
    let script = ScriptData::new(&options.html_variable)
        .with_context(|| format!("html variable {:?}", options.html_variable))?;
    let mut report = ImportReport::default();

    for item in SourceWalker::new(root).with_aliases(options.aliases.clone()) {
        let payload = match item {
            Ok(payload) => payload,
            Err(err) => {
                log_skip(&err);
                report.sources_skipped += 1;
                continue;
            }
        };
        let records = match parse_payload(&payload, &script) {
            Ok(records) => records,
            Err(err) => {
                log_skip(&err);
                report.sources_skipped += 1;
                continue;
            }
        };
        report.sources_read += 1;
        on_progress(ImportPhase::Source {
            origin: payload.origin.clone(),
            records: records.len(),
        });
        if records.is_empty() {
            debug!(origin = %payload.origin, "no records");
            continue;
        }

        let (groups, rejected) = group_records(&payload.suggested_name, records);
        for err in &rejected {
            log_skip(err);
        }
        report.rows_rejected += rejected.len();

        for group in groups {
            if group.shape.identity().is_none() && !options.compound_keys {
                let err = ImportError::SchemaRejected {
                    table: group.logical_name.clone(),
                    reason: "records have no id field".to_string(),
                };
                warn!(origin = %payload.origin, rows = group.records.len(), kind = err.kind(), "{err}");
                report.groups_failed += 1;
                report.rows_rejected += group.records.len();
                continue;
            }
            match store.write_group(&group) {
                Ok(outcome) => {
                    debug!(
                        origin = %payload.origin,
                        table = %outcome.table,
                        rows = outcome.inserted,
                        ignored = outcome.ignored,
                        "group written"
                    );
                    report.groups_written += 1;
                    report.rows_inserted += outcome.inserted;
                    report.rows_ignored += outcome.ignored;
                    report.rows_rejected += outcome.rejected;
                    if outcome.created {
                        report.tables_created.push(outcome.table.clone());
                    }
                    on_progress(ImportPhase::Group {
                        table: outcome.table,
                        inserted: outcome.inserted,
                        ignored: outcome.ignored,
                    });
                }
                Err(err) => {
                    warn!(
                        origin = %payload.origin,
                        table = %group.logical_name,
                        kind = err.kind(),
                        "group rolled back: {err}"
                    );
                    report.groups_failed += 1;
                }
            }
        }
    }

    info!(
        sources = report.sources_read,
        skipped = report.sources_skipped,
        rows = report.rows_inserted,
        ignored = report.rows_ignored,
        "import finished"
    );
    on_progress(ImportPhase::Done {
        rows_inserted: report.rows_inserted,
    });
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSummary {
    pub records: usize,
    pub columns: Vec<String>,
    pub identity: Option<String>,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone)]
pub struct SourceInspection {
    pub origin: String,
    pub table: Option<String>,
    pub groups: Vec<GroupSummary>,
    pub problem: Option<String>,
}

pub fn inspect_path(root: &Path, options: &ImportOptions) -> anyhow::Result<Vec<SourceInspection>> {
    if !root.exists() {
        bail!("inspect source {} does not exist", root.display());
    }
    let script = ScriptData::new(&options.html_variable)
        .with_context(|| format!("html variable {:?}", options.html_variable))?;
    let mut out = Vec::new();
    for item in SourceWalker::new(root).with_aliases(options.aliases.clone()) {
        let payload = match item {
            Ok(payload) => payload,
            Err(err) => {
                out.push(SourceInspection {
                    origin: origin_of(&err),
                    table: None,
                    groups: Vec::new(),
                    problem: Some(err.to_string()),
                });
                continue;
            }
        };
        let mut inspection = SourceInspection {
            origin: payload.origin.clone(),
            table: Some(payload.suggested_name.clone()),
            groups: Vec::new(),
            problem: None,
        };
        match parse_payload(&payload, &script) {
            Ok(records) => {
                let (groups, rejected) = group_records(&payload.suggested_name, records);
                inspection.groups = groups
                    .iter()
                    .map(|g| GroupSummary {
                        records: g.records.len(),
                        columns: g.shape.column_names(),
                        identity: g.shape.identity().map(str::to_string),
                        fingerprint: g.shape.fingerprint().clone(),
                    })
                    .collect();
                if let Some(err) = rejected.first() {
                    inspection.problem = Some(format!("{} record(s) rejected: {err}", rejected.len()));
                }
            }
            Err(err) => inspection.problem = Some(err.to_string()),
        }
        out.push(inspection);
    }
    Ok(out)
}

fn origin_of(err: &ImportError) -> String {
    match err {
        ImportError::MalformedInput { origin, .. } | ImportError::Skipped { origin, .. } => {
            origin.clone()
        }
        other => other.kind().to_string(),
    }
}
