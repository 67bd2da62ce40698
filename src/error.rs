use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PackagingError {
    #[error("invalid name {name:?}: {reason}")]
    #[diagnostic(help("names are dot-separated and start with a lab identifier, e.g. dicarlo.hvm"))]
    InvalidName { name: String, reason: String },

    #[error("invalid bucket name: {0}")]
    InvalidBucket(String),

    #[error("unknown attribute type: {0}")]
    InvalidAttributeType(String),

    #[error("source file not found: {0}")]
    MissingSource(PathBuf),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("upload of {bucket}/{key} failed: {message}")]
    Upload {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("object storage client error: {0}")]
    StorageClient(String),

    #[error("lookup database error: {0}")]
    Database(String),

    #[error("no matching record: {entity} {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("{entity} {key} already exists with {field} = {existing:?} (requested {requested:?})")]
    Conflict {
        entity: &'static str,
        key: String,
        field: &'static str,
        existing: String,
        requested: String,
    },

    #[error("stimulus set {0} is already packaged")]
    StimulusSetExists(String),

    #[error("assembly {0} is already packaged")]
    AssemblyExists(String),

    #[error("store {0} is already registered")]
    #[diagnostic(help("names differing only in '.' versus '_' map to the same store"))]
    StoreExists(String),

    #[error("attribute column {column} mixes {expected} and {found} values (row {row})")]
    HeterogeneousAttribute {
        column: String,
        expected: String,
        found: String,
        row: usize,
    },

    #[error("missing required column: {0}")]
    MissingColumn(String),

    #[error("invalid stimulus table: {0}")]
    InvalidTable(String),

    #[error("failed to read CSV: {0}")]
    Csv(String),

    #[error("invalid assembly: {0}")]
    InvalidAssembly(String),

    #[error("dimension {0} still has a multi-level index; call reset_index first")]
    MultiIndexNotFlattened(String),

    #[error("value out of range for {variable}: {value}")]
    ValueOutOfRange { variable: String, value: String },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),
}

impl From<rusqlite::Error> for PackagingError {
    fn from(err: rusqlite::Error) -> Self {
        PackagingError::Database(err.to_string())
    }
}
