use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod error;
pub mod ident;

pub use error::{ImportError, Result};
pub use ident::{logical_table_name, quote_identifier, sanitize_identifier, validate_identifier};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn identity_field(&self) -> Option<&str> {
        self.keys().find(|k| k.eq_ignore_ascii_case("id"))
    }
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

/// Text form of a JSON value as stored in a column. `null` has none; nested
/// arrays and objects keep their compact JSON text.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn fingerprint<I, S>(columns: I) -> Fingerprint
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut names: Vec<String> = columns
        .into_iter()
        .map(|c| c.as_ref().to_string())
        .collect();
    names.sort();
    names.dedup();
    let mut hasher = blake3::Hasher::new();
    for name in &names {
        hasher.update(name.as_bytes());
        hasher.update(&[0x1f]);
    }
    Fingerprint(hasher.finalize().to_hex().to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub source_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordShape {
    columns: Vec<Column>,
    identity: Option<String>,
    fingerprint: Fingerprint,
}

impl RecordShape {
    pub fn of(record: &Record, table: &str) -> Result<Self> {
        let mut columns: Vec<Column> = Vec::with_capacity(record.len());
        for key in record.keys() {
            let name = sanitize_identifier(key).map_err(|_| ImportError::SchemaRejected {
                table: table.to_string(),
                reason: format!("field {key:?} has no usable column name"),
            })?;
            if let Some(existing) = columns
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(&name))
            {
                return Err(ImportError::SchemaRejected {
                    table: table.to_string(),
                    reason: format!(
                        "fields {:?} and {key:?} both map to column {name:?}",
                        existing.source_key
                    ),
                });
            }
            columns.push(Column {
                name,
                source_key: key.to_string(),
            });
        }
        let identity = record.identity_field().and_then(|key| {
            columns
                .iter()
                .find(|c| c.source_key == key)
                .map(|c| c.name.clone())
        });
        let fingerprint = fingerprint(columns.iter().map(|c| c.name.as_str()));
        Ok(Self {
            columns,
            identity,
            fingerprint,
        })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

#[derive(Debug, Clone)]
pub struct RecordGroup {
    pub logical_name: String,
    pub shape: RecordShape,
    pub records: Vec<Record>,
}

/// Partitions records by shape, groups in first-seen order. Records whose
/// shape cannot be derived come back as errors.
pub fn group_records(
    logical_name: &str,
    records: Vec<Record>,
) -> (Vec<RecordGroup>, Vec<ImportError>) {
    let mut groups: Vec<RecordGroup> = Vec::new();
    let mut index: HashMap<Fingerprint, usize> = HashMap::new();
    let mut errors = Vec::new();
    for record in records {
        if record.is_empty() {
            continue;
        }
        let shape = match RecordShape::of(&record, logical_name) {
            Ok(shape) => shape,
            Err(err) => {
                errors.push(err);
                continue;
            }
        };
        match index.get(shape.fingerprint()) {
            Some(&i) => groups[i].records.push(record),
            None => {
                index.insert(shape.fingerprint().clone(), groups.len());
                groups.push(RecordGroup {
                    logical_name: logical_name.to_string(),
                    shape,
                    records: vec![record],
                });
            }
        }
    }
    (groups, errors)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableBinding {
    pub fingerprint: Fingerprint,
    pub logical_name: String,
    pub table_name: String,
    pub columns: Vec<String>,
    pub created_at: DateTime<Utc>,
}
