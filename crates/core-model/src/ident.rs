use std::collections::HashMap;
use std::path::Path;

use crate::error::{ImportError, Result};

const RESERVED_PREFIX: &str = "sqlite_";

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Maps every character outside `[A-Za-z0-9_]` to `_` and trims leading and
/// trailing underscores. Names SQLite reserves for itself get a `t_` prefix.
pub fn sanitize_identifier(raw: &str) -> Result<String> {
    let replaced: String = raw
        .chars()
        .map(|c| if is_ident_char(c) { c } else { '_' })
        .collect();
    let trimmed = replaced.trim_matches('_');
    if trimmed.is_empty() {
        return Err(ImportError::InvalidIdentifier(raw.to_string()));
    }
    if trimmed.to_ascii_lowercase().starts_with(RESERVED_PREFIX) {
        return Ok(format!("t_{trimmed}"));
    }
    Ok(trimmed.to_string())
}

pub fn validate_identifier(name: &str) -> Result<&str> {
    if name.is_empty()
        || !name.chars().all(is_ident_char)
        || name.to_ascii_lowercase().starts_with(RESERVED_PREFIX)
    {
        return Err(ImportError::InvalidIdentifier(name.to_string()));
    }
    Ok(name)
}

pub fn quote_identifier(name: &str) -> Result<String> {
    let name = validate_identifier(name)?;
    Ok(format!("\"{name}\""))
}

pub fn logical_table_name(path: &Path, aliases: &HashMap<String, String>) -> Result<String> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = sanitize_identifier(&stem)?;
    match aliases.get(&name) {
        Some(alias) => sanitize_identifier(alias),
        None => Ok(name),
    }
}

pub fn default_aliases() -> HashMap<String, String> {
    HashMap::from([("chat".to_string(), "conversations".to_string())])
}
