use std::path::{Path, PathBuf};

use anyhow::Context;
use core_model::{ImportError, RecordGroup, TableBinding, quote_identifier};
use rusqlite::{Connection, Params, Statement, params, types::ValueRef};
use serde_json::{Map, Value};
use tracing::warn;

pub mod registry;
pub mod sink;

pub use registry::{REGISTRY_TABLE, Resolution, SchemaRegistry};
pub use sink::{InsertOutcome, TableKey, TableLayout};

pub struct SqliteStore {
    conn: Connection,
    registry: SchemaRegistry,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupOutcome {
    pub table: String,
    pub created: bool,
    pub inserted: usize,
    pub ignored: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub columns: Vec<String>,
    pub values: Vec<Option<String>>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values[i].as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().map(Option::as_deref))
    }

    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        for (column, value) in self.iter() {
            out.insert(
                column.to_string(),
                value.map_or(Value::Null, |v| Value::String(v.to_string())),
            );
        }
        Value::Object(out)
    }
}

impl SqliteStore {
    pub fn default_path() -> PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("chatvault").join("chatvault.db")
    }

    pub fn open_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating parent dir for {}", path.display()))?;
        }
        Self::open(path)
    }

    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("opening sqlite db {}", path.as_ref().display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Ok(Self {
            conn,
            registry: SchemaRegistry::new(),
        })
    }

    pub fn init_schema(&self) -> anyhow::Result<()> {
        registry::bootstrap(&self.conn).with_context(|| "bootstrapping schema registry")?;
        Ok(())
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Resolves a shape to its table outside of any group write, committing
    /// the binding immediately when a new one is allocated.
    pub fn resolve_table(
        &mut self,
        logical_name: &str,
        fingerprint: &core_model::Fingerprint,
        columns: &[String],
    ) -> core_model::Result<TableBinding> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| ImportError::storage(logical_name, e))?;
        let resolution = self
            .registry
            .resolve(&tx, logical_name, fingerprint, columns)
            .map_err(|e| ImportError::storage(logical_name, e))?;
        tx.commit()
            .map_err(|e| ImportError::storage(logical_name, e))?;
        if resolution.is_new {
            self.registry.remember(resolution.binding.clone());
        }
        Ok(resolution.binding)
    }

    pub fn create_table(
        &self,
        name: &str,
        identity: Option<&str>,
        columns: &[String],
    ) -> core_model::Result<bool> {
        sink::create_table(&self.conn, name, identity, columns)
    }

    pub fn insert(
        &self,
        table: &str,
        record: &core_model::Record,
    ) -> core_model::Result<InsertOutcome> {
        let layout = sink::table_layout(&self.conn, table)?.ok_or_else(|| {
            ImportError::RowRejected {
                table: table.to_string(),
                reason: "table does not exist".to_string(),
            }
        })?;
        sink::insert(&self.conn, &layout, record)
    }

    /// Writes one record group in its own transaction: bind, create, insert.
    /// Rejected rows are logged and counted; any storage failure rolls the
    /// whole group back, binding included.
    pub fn write_group(&mut self, group: &RecordGroup) -> core_model::Result<GroupOutcome> {
        let logical = group.logical_name.as_str();
        let identity = group.shape.identity();
        let columns = group.shape.column_names();

        let tx = self
            .conn
            .transaction()
            .map_err(|e| ImportError::storage(logical, e))?;
        let resolution = self
            .registry
            .resolve(&tx, logical, group.shape.fingerprint(), &columns)
            .map_err(|e| ImportError::storage(logical, e))?;
        let table = resolution.binding.table_name.clone();
        let created = sink::create_table(&tx, &table, identity, &resolution.binding.columns)?;
        let layout = TableLayout::new(&table, resolution.binding.columns.clone(), identity);

        let mut outcome = GroupOutcome {
            table: table.clone(),
            created,
            ..GroupOutcome::default()
        };
        for record in &group.records {
            match sink::insert(&tx, &layout, record) {
                Ok(InsertOutcome::Inserted) => outcome.inserted += 1,
                Ok(InsertOutcome::Ignored) => outcome.ignored += 1,
                Err(err @ ImportError::RowRejected { .. }) => {
                    warn!(table = %table, error = %err, "skipping record");
                    outcome.rejected += 1;
                }
                Err(err) => return Err(err),
            }
        }
        tx.commit().map_err(|e| ImportError::storage(&table, e))?;
        if resolution.is_new {
            self.registry.remember(resolution.binding);
        }
        Ok(outcome)
    }

    pub fn bindings(&self) -> anyhow::Result<Vec<TableBinding>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM schema ORDER BY logical_name, created_at",
            registry::BINDING_COLUMNS
        ))?;
        let rows = stmt.query_map([], registry::binding_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    pub fn tables_for_logical(&self, logical_name: &str) -> anyhow::Result<Vec<TableBinding>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM schema WHERE logical_name = ?1 ORDER BY created_at, table_name",
            registry::BINDING_COLUMNS
        ))?;
        let rows = stmt.query_map(params![logical_name], registry::binding_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    pub fn list_tables(&self) -> anyhow::Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    pub fn table_exists(&self, table: &str) -> anyhow::Result<bool> {
        registry::table_exists(&self.conn, table).map_err(Into::into)
    }

    pub fn table_columns(&self, table: &str) -> anyhow::Result<Vec<String>> {
        Ok(sink::table_layout(&self.conn, table)?
            .map(|layout| layout.columns)
            .unwrap_or_default())
    }

    pub fn row_count(&self, table: &str) -> anyhow::Result<i64> {
        let table = quote_identifier(table)?;
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .map_err(Into::into)
    }

    pub fn rows(&self, table: &str, limit: Option<usize>) -> anyhow::Result<Vec<Row>> {
        let table = quote_identifier(table)?;
        let limit = limit.map_or(-1, |l| l as i64);
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT * FROM {table} LIMIT ?1"))?;
        collect_rows(&mut stmt, params![limit])
    }

    pub fn row_by_key(&self, table: &str, column: &str, key: &str) -> anyhow::Result<Option<Row>> {
        let table = quote_identifier(table)?;
        let column = quote_identifier(column)?;
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT * FROM {table} WHERE {column} = ?1 LIMIT 1"))?;
        Ok(collect_rows(&mut stmt, params![key])?.into_iter().next())
    }

    pub fn rows_by_key_prefix(
        &self,
        table: &str,
        column: &str,
        prefix: &str,
    ) -> anyhow::Result<Vec<Row>> {
        let table = quote_identifier(table)?;
        let column = quote_identifier(column)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT * FROM {table} WHERE substr({column}, 1, ?2) = ?1 ORDER BY {column}"
        ))?;
        collect_rows(&mut stmt, params![prefix, prefix.chars().count() as i64])
    }

    pub fn integrity_check(&self) -> anyhow::Result<String> {
        self.conn
            .query_row("PRAGMA integrity_check;", [], |r| r.get(0))
            .map_err(Into::into)
    }
}

fn collect_rows<P: Params>(stmt: &mut Statement<'_>, params: P) -> anyhow::Result<Vec<Row>> {
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();
    let rows = stmt.query_map(params, |r| {
        (0..width)
            .map(|i| r.get_ref(i).map(text_of))
            .collect::<rusqlite::Result<Vec<_>>>()
    })?;
    let mut out = Vec::new();
    for values in rows {
        out.push(Row {
            columns: columns.clone(),
            values: values?,
        });
    }
    Ok(out)
}

fn text_of(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) | ValueRef::Blob(t) => Some(String::from_utf8_lossy(t).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_model::{Record, group_records};
    use serde_json::json;

    fn store() -> SqliteStore {
        let store = SqliteStore::open(":memory:").expect("open");
        store.init_schema().expect("schema");
        store
    }

    fn group(logical: &str, value: Value) -> RecordGroup {
        let records = match value {
            Value::Array(items) => items.into_iter().filter_map(Record::from_value).collect(),
            other => vec![Record::from_value(other).unwrap()],
        };
        let (mut groups, errors) = group_records(logical, records);
        assert!(errors.is_empty());
        assert_eq!(groups.len(), 1);
        groups.remove(0)
    }

    #[test]
    fn schema_and_integrity() {
        let store = store();
        assert_eq!(store.integrity_check().unwrap(), "ok");
        assert_eq!(store.list_tables().unwrap(), vec!["schema"]);
    }

    #[test]
    fn write_group_is_idempotent() {
        let mut store = store();
        let users = group(
            "user",
            json!([{"id":"a1","email":"x@example.com"},{"id":"a2","email":"y@example.com"}]),
        );
        let first = store.write_group(&users).unwrap();
        assert_eq!(first.table, "user");
        assert!(first.created);
        assert_eq!(first.inserted, 2);

        let second = store.write_group(&users).unwrap();
        assert!(!second.created);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.ignored, 2);
        assert_eq!(store.row_count("user").unwrap(), 2);
    }

    #[test]
    fn drifted_shape_gets_new_table_and_leaves_old_alone() {
        let mut store = store();
        store
            .write_group(&group("user", json!({"id":"a1","email":"x@example.com"})))
            .unwrap();
        let drift = store
            .write_group(&group(
                "user",
                json!({"id":"a2","email":"y@example.com","new_column":"cabbage"}),
            ))
            .unwrap();
        assert_eq!(drift.table, "user_v2");
        assert_eq!(store.table_columns("user").unwrap(), vec!["id", "email"]);
        assert_eq!(store.row_count("user").unwrap(), 1);
        assert_eq!(
            store.table_columns("user_v2").unwrap(),
            vec!["id", "email", "new_column"]
        );
        let tables = store.tables_for_logical("user").unwrap();
        assert_eq!(tables.len(), 2);
    }

    #[test]
    fn storage_failure_rolls_back_only_that_group() {
        let mut store = store();
        store
            .write_group(&group("user", json!({"id":"seed","email":"s"})))
            .unwrap();
        store
            .conn
            .execute_batch(
                "CREATE TRIGGER boom BEFORE INSERT ON user WHEN NEW.id = 'boom' BEGIN SELECT RAISE(ABORT, 'boom'); END;",
            )
            .unwrap();
        let bad = group("user", json!([{"id":"ok","email":"o"},{"id":"boom","email":"b"}]));
        let err = store.write_group(&bad).unwrap_err();
        assert!(matches!(err, ImportError::Storage { .. }));
        assert_eq!(store.row_count("user").unwrap(), 1);
        assert!(store.row_by_key("user", "id", "ok").unwrap().is_none());

        let later = store
            .write_group(&group("feedback", json!({"id":"f1","rating":"up"})))
            .unwrap();
        assert_eq!(later.inserted, 1);
    }

    #[test]
    fn failed_binding_is_not_cached() {
        let mut store = store();
        store
            .conn
            .execute_batch(
                "CREATE TRIGGER deny BEFORE INSERT ON schema WHEN NEW.logical_name = 'audit' BEGIN SELECT RAISE(ABORT, 'denied'); END;",
            )
            .unwrap();
        let audit = group("audit", json!({"id":"1","note":"n"}));
        assert!(store.write_group(&audit).is_err());
        assert!(store.tables_for_logical("audit").unwrap().is_empty());
        assert_eq!(store.registry().cached(), 0);

        store.conn.execute_batch("DROP TRIGGER deny;").unwrap();
        let outcome = store.write_group(&audit).unwrap();
        assert_eq!(outcome.table, "audit");
        assert_eq!(store.registry().cached(), 1);
    }

    #[test]
    fn compound_key_group_without_identity() {
        let mut store = store();
        let pairs = group(
            "model_comparisons",
            json!([{"model_a":"x","model_b":"y"},{"model_a":"x","model_b":"y"}]),
        );
        assert!(pairs.shape.identity().is_none());
        let outcome = store.write_group(&pairs).unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.ignored, 1);
    }

    #[test]
    fn bindings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");
        {
            let mut store = SqliteStore::open(&path).unwrap();
            store.init_schema().unwrap();
            store
                .write_group(&group("user", json!({"id":"a1","email":"e"})))
                .unwrap();
        }
        let mut store = SqliteStore::open(&path).unwrap();
        store.init_schema().unwrap();
        let bindings = store.bindings().unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].columns, vec!["id", "email"]);
        let again = store
            .write_group(&group("user", json!({"email":"f","id":"a2"})))
            .unwrap();
        assert_eq!(again.table, "user");
        assert_eq!(store.row_count("user").unwrap(), 2);
    }

    #[test]
    fn resolve_table_commits_binding() {
        let mut store = store();
        let columns = vec!["id".to_string(), "title".to_string()];
        let fp = core_model::fingerprint(&columns);
        let binding = store.resolve_table("conversations", &fp, &columns).unwrap();
        assert_eq!(binding.table_name, "conversations");
        assert_eq!(store.tables_for_logical("conversations").unwrap().len(), 1);
        assert!(store.create_table("conversations", Some("id"), &columns).unwrap());
        let rec = Record::from_value(json!({"id":"c1","title":"hello"})).unwrap();
        assert_eq!(store.insert("conversations", &rec).unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert("conversations", &rec).unwrap(), InsertOutcome::Ignored);
    }

    #[test]
    fn keyed_lookups() {
        let mut store = store();
        store
            .write_group(&group(
                "conversations",
                json!([{"id":"abc1","title":"one"},{"id":"abd2","title":"two"},{"id":"zzz","title":"three"}]),
            ))
            .unwrap();
        let row = store.row_by_key("conversations", "id", "zzz").unwrap().unwrap();
        assert_eq!(row.get("title"), Some("three"));
        assert_eq!(row.to_json(), json!({"id":"zzz","title":"three"}));
        let prefixed = store.rows_by_key_prefix("conversations", "id", "ab").unwrap();
        assert_eq!(prefixed.len(), 2);
        let narrowed = store.rows_by_key_prefix("conversations", "id", "abd").unwrap();
        assert_eq!(narrowed.len(), 1);
        assert_eq!(store.rows("conversations", Some(2)).unwrap().len(), 2);
        assert_eq!(store.rows("conversations", None).unwrap().len(), 3);
    }
}
