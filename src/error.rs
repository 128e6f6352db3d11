use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum NbiaError {
    #[error("invalid query: {0}")]
    #[diagnostic(help("add at least one filter such as collection, modality or patient id"))]
    InvalidQuery(String),

    #[error("filter {filter} is not supported by {endpoint}")]
    UnsupportedFilter { filter: String, endpoint: String },

    #[error("invalid value for filter {filter}: {value} ({reason})")]
    InvalidFilterValue {
        filter: String,
        value: String,
        reason: String,
    },

    #[error("invalid series instance UID: {0}")]
    InvalidSeriesUid(String),

    #[error("invalid SOP instance UID: {0}")]
    InvalidInstanceUid(String),

    #[error("invalid API host: {0}")]
    InvalidApiHost(String),

    #[error("NBIA request failed: {0}")]
    Http(String),

    #[error("NBIA returned status {status}: {message}")]
    RequestRejected { status: u16, message: String },

    #[error("transient NBIA failure: {message}")]
    Transient {
        status: Option<u16>,
        message: String,
    },

    #[error("unexpected NBIA response: {0}")]
    UnexpectedResponse(String),

    #[error("record is missing its natural key field {field}")]
    SchemaMismatch { field: String },

    #[error("{granularity} results do not carry {field}")]
    GranularityMismatch { granularity: String, field: String },

    #[error("unsupported manifest: {0}")]
    UnsupportedManifest(String),

    #[error("package integrity check failed: {0}")]
    Integrity(String),

    #[error("package extraction failed: {0}")]
    Extraction(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("cancelled")]
    Cancelled,
}

impl NbiaError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, NbiaError::Transient { .. })
    }
}
