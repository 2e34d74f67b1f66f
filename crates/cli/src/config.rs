use std::{collections::HashMap, path::PathBuf};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: Option<PathBuf>,
    /// Column budget for `show` output.
    pub truncate_width: usize,
    pub html_variable: String,
    /// Source file stem -> table name.
    pub table_aliases: HashMap<String, String>,
    pub conversation_table: String,
    pub export_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            truncate_width: 120,
            html_variable: ingest::html::DEFAULT_VARIABLE.to_string(),
            table_aliases: core_model::ident::default_aliases(),
            conversation_table: "conversations".to_string(),
            export_dir: None,
        }
    }
}

impl Config {
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatvault")
            .join("config.toml")
    }

    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::path();
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("reading config file {}", config_path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("parsing config file {}", config_path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }
}
