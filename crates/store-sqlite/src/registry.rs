use std::collections::HashMap;

use chrono::{DateTime, Utc};
use core_model::{Fingerprint, TableBinding};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

pub const REGISTRY_TABLE: &str = "schema";

pub(crate) fn bootstrap(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema (
          fingerprint TEXT NOT NULL,
          table_name TEXT PRIMARY KEY COLLATE NOCASE,
          logical_name TEXT NOT NULL,
          column_names TEXT NOT NULL,
          created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS schema_logical_name ON schema (logical_name);
        "#,
    )
}

pub(crate) fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE)",
        params![name],
        |r| r.get(0),
    )
}

pub(crate) const BINDING_COLUMNS: &str =
    "fingerprint, table_name, logical_name, column_names, created_at";

pub(crate) fn binding_from_row(r: &Row<'_>) -> rusqlite::Result<TableBinding> {
    let fingerprint: String = r.get(0)?;
    let column_names: String = r.get(3)?;
    let created_at: String = r.get(4)?;
    Ok(TableBinding {
        fingerprint: Fingerprint::from_hex(fingerprint),
        table_name: r.get(1)?,
        logical_name: r.get(2)?,
        columns: column_names
            .split(',')
            .filter(|c| !c.is_empty())
            .map(ToOwned::to_owned)
            .collect(),
        created_at: parse_ts(&created_at),
    })
}

fn parse_ts(ts: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(ts)
        .map(|v| v.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub binding: TableBinding,
    /// The binding row was written by this resolution and is not committed yet.
    pub is_new: bool,
}

/// Resolves (logical name, fingerprint) pairs to table names.
///
/// Bindings never change once written, so the cache is filled lazily and never
/// invalidated. A binding created inside a transaction only enters the cache
/// through [`SchemaRegistry::remember`], after the caller has committed.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    cache: HashMap<String, TableBinding>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    pub fn remember(&mut self, binding: TableBinding) {
        self.cache
            .insert(binding.table_name.to_ascii_lowercase(), binding);
    }

    pub fn lookup(
        &mut self,
        conn: &Connection,
        table_name: &str,
    ) -> rusqlite::Result<Option<TableBinding>> {
        let key = table_name.to_ascii_lowercase();
        if let Some(binding) = self.cache.get(&key) {
            return Ok(Some(binding.clone()));
        }
        let found = conn
            .query_row(
                &format!("SELECT {BINDING_COLUMNS} FROM schema WHERE table_name = ?1"),
                params![table_name],
                binding_from_row,
            )
            .optional()?;
        if let Some(binding) = &found {
            self.cache.insert(key, binding.clone());
        }
        Ok(found)
    }

    /// Finds or allocates the table for a shape: the logical name itself when
    /// free or already holding this fingerprint, otherwise the first of
    /// `name_v2`, `name_v3`, ... that is free or holds this fingerprint.
    /// Tables that exist without a registry row are treated as taken.
    pub fn resolve(
        &mut self,
        conn: &Connection,
        logical_name: &str,
        fingerprint: &Fingerprint,
        columns: &[String],
    ) -> rusqlite::Result<Resolution> {
        let mut version: u32 = 1;
        loop {
            let candidate = if version == 1 {
                logical_name.to_string()
            } else {
                format!("{logical_name}_v{version}")
            };
            match self.lookup(conn, &candidate)? {
                Some(binding) if &binding.fingerprint == fingerprint => {
                    return Ok(Resolution {
                        binding,
                        is_new: false,
                    });
                }
                Some(binding) => {
                    debug!(
                        table = %candidate,
                        bound = %binding.fingerprint.short(),
                        wanted = %fingerprint.short(),
                        "table bound to another shape"
                    );
                }
                None if table_exists(conn, &candidate)? => {
                    debug!(table = %candidate, "name held by unregistered table");
                }
                None => {
                    let binding = TableBinding {
                        fingerprint: fingerprint.clone(),
                        logical_name: logical_name.to_string(),
                        table_name: candidate,
                        columns: columns.to_vec(),
                        created_at: Utc::now(),
                    };
                    conn.execute(
                        &format!("INSERT INTO schema ({BINDING_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                        params![
                            binding.fingerprint.as_str(),
                            binding.table_name,
                            binding.logical_name,
                            binding.columns.join(","),
                            binding.created_at.to_rfc3339()
                        ],
                    )?;
                    return Ok(Resolution {
                        binding,
                        is_new: true,
                    });
                }
            }
            version += 1;
        }
    }
}
