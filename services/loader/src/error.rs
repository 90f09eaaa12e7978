//! Error types for the loader library.
//!
//! Binaries wrap these in `anyhow` with context; the library keeps them typed
//! so the pipeline driver can decide which failures stop a run.

use thiserror::Error;

/// Failures reported by a warehouse adapter.
#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("cannot reach warehouse: {0}")]
    Connectivity(String),

    #[error("constraint violation on {table}: {message}")]
    Constraint { table: String, message: String },

    #[error("schema error on {table}: {message}")]
    Schema { table: String, message: String },

    #[error("statement failed on {table}: {message}")]
    Query { table: String, message: String },
}

impl WarehouseError {
    pub fn schema(table: &str, message: impl Into<String>) -> Self {
        WarehouseError::Schema {
            table: table.to_string(),
            message: message.into(),
        }
    }

    pub fn constraint(table: &str, message: impl Into<String>) -> Self {
        WarehouseError::Constraint {
            table: table.to_string(),
            message: message.into(),
        }
    }

    pub fn query(table: &str, message: impl Into<String>) -> Self {
        WarehouseError::Query {
            table: table.to_string(),
            message: message.into(),
        }
    }
}

/// A single record failed normalisation. The rest of the batch is unaffected.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransformError {
    #[error("field '{field}': cannot parse '{raw}' as {expected}")]
    Unparseable {
        field: String,
        raw: String,
        expected: &'static str,
    },

    #[error("exploded fields have mismatched lengths: {lengths:?}")]
    ExplodeLengthMismatch { lengths: Vec<(String, usize)> },

    #[error("column '{column}': expected {expected}, found '{found}'")]
    TypeMismatch {
        column: String,
        expected: &'static str,
        found: String,
    },

    #[error("column '{column}' does not accept nulls")]
    NullNotAllowed { column: String },

    #[error("column '{column}' is not part of table '{table}'")]
    UnknownColumn { table: String, column: String },
}

/// A pipeline definition refers to something that does not exist or is
/// ordered wrongly. Raised before any statement runs.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanError {
    #[error("{context}: column '{column}' is not defined on '{table}'")]
    UnknownColumn {
        context: String,
        table: String,
        column: String,
    },

    #[error("propagation into '{target}' reads '{key_column}' before any lookup fills it")]
    UnresolvedDependency { target: String, key_column: String },

    #[error("{0}")]
    Invalid(String),
}

/// Reading a landed blob or a local file into source records failed.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("spreadsheet: {0}")]
    Spreadsheet(String),

    #[error("record {position} is not a JSON object")]
    NotAnObject { position: usize },
}

impl From<calamine::Error> for SourceError {
    fn from(e: calamine::Error) -> Self {
        SourceError::Spreadsheet(e.to_string())
    }
}

/// Object-storage failures.
#[derive(Debug, Error)]
pub enum LandingError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid blob key '{0}'")]
    InvalidKey(String),

    #[error("blob '{0}' not found")]
    NotFound(String),
}

/// Why a pipeline stage failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("every record was rejected by the normalizer ({rejected} records)")]
    NothingStaged { rejected: usize },
}
