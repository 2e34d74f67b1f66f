use thiserror::Error;

/// Everything that can go wrong while importing. None of these abort a run;
/// each one names the unit (source, group or row) that gets skipped.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("malformed input in {origin}: {reason}")]
    MalformedInput {
        origin: String,
        reason: String,
        excerpt: Option<String>,
    },

    #[error("skipped {origin}: {reason}")]
    Skipped { origin: String, reason: String },

    #[error("schema rejected for table {table}: {reason}")]
    SchemaRejected { table: String, reason: String },

    #[error("row rejected for table {table}: {reason}")]
    RowRejected { table: String, reason: String },

    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),

    #[error("storage error on table {table}: {source}")]
    Storage {
        table: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ImportError {
    pub fn malformed(origin: impl Into<String>, reason: impl Into<String>) -> Self {
        ImportError::MalformedInput {
            origin: origin.into(),
            reason: reason.into(),
            excerpt: None,
        }
    }

    pub fn skipped(origin: impl Into<String>, reason: impl Into<String>) -> Self {
        ImportError::Skipped {
            origin: origin.into(),
            reason: reason.into(),
        }
    }

    pub fn storage<E>(table: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ImportError::Storage {
            table: table.into(),
            source: Box::new(source),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ImportError::MalformedInput { .. } => "malformed_input",
            ImportError::Skipped { .. } => "skipped",
            ImportError::SchemaRejected { .. } => "schema_rejected",
            ImportError::RowRejected { .. } => "row_rejected",
            ImportError::InvalidIdentifier(_) => "invalid_identifier",
            ImportError::Storage { .. } => "storage",
            ImportError::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, ImportError>;
