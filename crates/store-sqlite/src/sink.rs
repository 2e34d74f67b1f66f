use core_model::{ImportError, Record, Result, quote_identifier, sanitize_identifier, value_text};
use rusqlite::{Connection, params_from_iter};

use crate::registry::table_exists;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableKey {
    Identity(String),
    Compound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    pub name: String,
    pub columns: Vec<String>,
    pub key: TableKey,
}

impl TableLayout {
    pub fn new(name: &str, columns: Vec<String>, identity: Option<&str>) -> Self {
        let key = match identity {
            Some(id) => TableKey::Identity(id.to_string()),
            None => TableKey::Compound,
        };
        Self {
            name: name.to_string(),
            columns,
            key,
        }
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Ignored,
}

pub fn create_table(
    conn: &Connection,
    name: &str,
    identity: Option<&str>,
    columns: &[String],
) -> Result<bool> {
    let table = quote_identifier(name)?;
    if columns.is_empty() {
        return Err(ImportError::SchemaRejected {
            table: name.to_string(),
            reason: "no columns".to_string(),
        });
    }
    if let Some(id) = identity
        && !columns.iter().any(|c| c.eq_ignore_ascii_case(id))
    {
        return Err(ImportError::SchemaRejected {
            table: name.to_string(),
            reason: format!("identity field {id:?} is not a column"),
        });
    }

    let mut quoted = Vec::with_capacity(columns.len());
    let mut defs = Vec::with_capacity(columns.len() + 1);
    for column in columns {
        let q = quote_identifier(column)?;
        if identity.is_some_and(|id| id.eq_ignore_ascii_case(column)) {
            defs.push(format!("{q} TEXT PRIMARY KEY"));
        } else {
            defs.push(format!("{q} TEXT"));
        }
        quoted.push(q);
    }
    if identity.is_none() {
        defs.push(format!("PRIMARY KEY ({})", quoted.join(", ")));
    }

    let existed = table_exists(conn, name).map_err(|e| ImportError::storage(name, e))?;
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} ({})",
        defs.join(", ")
    ))
    .map_err(|e| ImportError::storage(name, e))?;
    Ok(!existed)
}

pub fn table_layout(conn: &Connection, name: &str) -> Result<Option<TableLayout>> {
    let table = quote_identifier(name)?;
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(|e| ImportError::storage(name, e))?;
    let infos = stmt
        .query_map([], |r| Ok((r.get::<_, String>(1)?, r.get::<_, i64>(5)?)))
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
        .map_err(|e| ImportError::storage(name, e))?;
    if infos.is_empty() {
        return Ok(None);
    }
    let columns: Vec<String> = infos.iter().map(|(c, _)| c.clone()).collect();
    let keyed: Vec<&String> = infos.iter().filter(|(_, pk)| *pk > 0).map(|(c, _)| c).collect();
    let key = match keyed.as_slice() {
        [single] if columns.len() > 1 || single.eq_ignore_ascii_case("id") => {
            TableKey::Identity((*single).clone())
        }
        _ => TableKey::Compound,
    };
    Ok(Some(TableLayout {
        name: name.to_string(),
        columns,
        key,
    }))
}

/// Insert-or-ignore one record. Records that do not line up with the table's
/// columns, or that carry no identity value, are `RowRejected`.
pub fn insert(conn: &Connection, layout: &TableLayout, record: &Record) -> Result<InsertOutcome> {
    let reject = |reason: String| ImportError::RowRejected {
        table: layout.name.clone(),
        reason,
    };
    if record.len() != layout.columns.len() {
        return Err(reject(format!(
            "record has {} values, table has {} columns",
            record.len(),
            layout.columns.len()
        )));
    }

    let mut values: Vec<Option<String>> = vec![None; layout.columns.len()];
    let mut filled = vec![false; layout.columns.len()];
    for (key, value) in record.iter() {
        let column = sanitize_identifier(key).map_err(|_| reject(format!("field {key:?} has no column")))?;
        let Some(i) = layout.column_index(&column) else {
            return Err(reject(format!("field {key:?} has no column")));
        };
        if filled[i] {
            return Err(reject(format!("column {column:?} given twice")));
        }
        filled[i] = true;
        values[i] = value_text(value);
    }

    match &layout.key {
        TableKey::Identity(id) => {
            let has_identity = layout
                .column_index(id)
                .and_then(|i| values[i].as_deref())
                .is_some_and(|v| !v.is_empty());
            if !has_identity {
                return Err(reject(format!("no value for identity field {id:?}")));
            }
        }
        TableKey::Compound => {
            for v in values.iter_mut() {
                v.get_or_insert_with(String::new);
            }
        }
    }

    let table = quote_identifier(&layout.name)?;
    let columns = layout
        .columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Result<Vec<_>>>()?;
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT OR IGNORE INTO {table} ({}) VALUES ({placeholders})",
        columns.join(", ")
    );
    let changed = conn
        .prepare_cached(&sql)
        .and_then(|mut stmt| stmt.execute(params_from_iter(values.iter())))
        .map_err(|e| ImportError::storage(&layout.name, e))?;
    Ok(if changed == 0 {
        InsertOutcome::Ignored
    } else {
        InsertOutcome::Inserted
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: serde_json::Value) -> Record {
        Record::from_value(v).unwrap()
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn identity_table_ignores_duplicate_keys() {
        let conn = Connection::open_in_memory().unwrap();
        let columns = cols(&["id", "email"]);
        assert!(create_table(&conn, "user", Some("id"), &columns).unwrap());
        assert!(!create_table(&conn, "user", Some("id"), &columns).unwrap());
        let layout = TableLayout::new("user", columns, Some("id"));

        let first = record(json!({"id": "a1", "email": "x@example.com"}));
        let dup = record(json!({"email": "changed@example.com", "id": "a1"}));
        assert_eq!(insert(&conn, &layout, &first).unwrap(), InsertOutcome::Inserted);
        assert_eq!(insert(&conn, &layout, &dup).unwrap(), InsertOutcome::Ignored);
        assert_eq!(count(&conn, "user"), 1);
        let email: String = conn
            .query_row("SELECT email FROM user WHERE id = 'a1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(email, "x@example.com", "first write wins");
    }

    #[test]
    fn compound_key_dedupes_identical_rows() {
        let conn = Connection::open_in_memory().unwrap();
        let columns = cols(&["message_id", "rating"]);
        create_table(&conn, "feedback", None, &columns).unwrap();
        let layout = TableLayout::new("feedback", columns, None);
        let a = record(json!({"message_id": "m1", "rating": null}));
        let b = record(json!({"message_id": "m1", "rating": "up"}));
        assert_eq!(insert(&conn, &layout, &a).unwrap(), InsertOutcome::Inserted);
        assert_eq!(insert(&conn, &layout, &a).unwrap(), InsertOutcome::Ignored);
        assert_eq!(insert(&conn, &layout, &b).unwrap(), InsertOutcome::Inserted);
        assert_eq!(count(&conn, "feedback"), 2);
    }

    #[test]
    fn mismatched_record_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        let columns = cols(&["id", "email"]);
        create_table(&conn, "user", Some("id"), &columns).unwrap();
        let layout = TableLayout::new("user", columns, Some("id"));

        let short = record(json!({"id": "a1"}));
        let wrong = record(json!({"id": "a1", "phone": "555"}));
        let no_id = record(json!({"id": null, "email": "e"}));
        for r in [short, wrong, no_id] {
            assert!(matches!(
                insert(&conn, &layout, &r),
                Err(ImportError::RowRejected { .. })
            ));
        }
        assert_eq!(count(&conn, "user"), 0);
    }

    #[test]
    fn nested_values_stored_as_json_text() {
        let conn = Connection::open_in_memory().unwrap();
        let columns = cols(&["id", "mapping", "flag"]);
        create_table(&conn, "conversations", Some("id"), &columns).unwrap();
        let layout = table_layout(&conn, "conversations").unwrap().unwrap();
        assert_eq!(layout.key, TableKey::Identity("id".to_string()));
        let r = record(json!({"id": "c1", "mapping": {"n1": {"parent": null}}, "flag": true}));
        insert(&conn, &layout, &r).unwrap();
        let (mapping, flag): (String, String) = conn
            .query_row("SELECT mapping, flag FROM conversations", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(mapping, r#"{"n1":{"parent":null}}"#);
        assert_eq!(flag, "true");
    }

    #[test]
    fn table_layout_reports_compound_key() {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn, "pairs", None, &cols(&["a", "b"])).unwrap();
        let layout = table_layout(&conn, "pairs").unwrap().unwrap();
        assert_eq!(layout.key, TableKey::Compound);
        assert!(table_layout(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn unsafe_identifiers_never_reach_sql() {
        let conn = Connection::open_in_memory().unwrap();
        let err = create_table(&conn, "x\"; DROP TABLE y; --", None, &cols(&["a"]));
        assert!(matches!(err, Err(ImportError::InvalidIdentifier(_))));
        let err = create_table(&conn, "ok", None, &cols(&["a b"]));
        assert!(matches!(err, Err(ImportError::InvalidIdentifier(_))));
    }
}
