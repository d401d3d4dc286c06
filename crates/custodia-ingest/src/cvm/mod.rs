// CVM open-data ingestion
//
// Keeps a local mirror of the CVM fund directory (register and daily
// position files) and turns each downloaded artifact into a typed,
// partitioned dataset.
//
// Architecture:
// - Listing: HTML directory index -> artifact descriptors
// - Catalog: SQLite journal of every remote artifact and its lifecycle
// - Downloader: conditional fetch, text transcoding, archive expansion
// - Registry: header fingerprints -> column mappings, with drift reconciliation
// - Reader: CSV -> staged SQL projection -> named converters -> partitions
// - Orchestrator: sync -> fetch -> reconcile -> read -> load
//
// Data source: https://dados.cvm.gov.br/dados/FI/

pub mod catalog;
pub mod converters;
pub mod downloader;
pub mod expressions;
pub mod filename;
pub mod listing;
pub mod models;
pub mod orchestrator;
pub mod reader;
pub mod registry;
pub mod timestamp;

pub use catalog::{Catalog, MergeStats};
pub use downloader::{DownloadOutcome, Downloader, OutcomeStatus, PayloadClass};
pub use filename::FileMetadata;
pub use listing::{ListingClient, ListingEntry};
pub use models::{ArtifactDescriptor, ArtifactKind, CatalogEntry, RemoteSource};
pub use orchestrator::{CycleReport, DriftSummary, Orchestrator, ReportEntry, ReportStatus};
pub use reader::{FileReader, ReadResult, Stage};
pub use registry::{MappingRow, Registry};

use custodia_common::CustodiaError;

/// Result type for CVM operations
pub type Result<T> = std::result::Result<T, CvmError>;

/// Error types for CVM ingestion
#[derive(Debug, thiserror::Error)]
pub enum CvmError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// The header fingerprint of a file is not in the mapping registry
    #[error("Schema drift in {file}: unknown header fingerprint {fingerprint}; reconcile and review the is_new rows of the mappings table")]
    SchemaDrift { file: String, fingerprint: String },

    #[error("No header template for kind '{0}'; add one to the templates table")]
    UnknownKind(String),

    #[error("No resolved mapping for fingerprint {0}")]
    UnknownFingerprint(String),

    #[error("Unknown converter '{0}'")]
    UnknownConverter(String),

    #[error("Conversion error in column '{column}': cannot convert '{value}'")]
    Conversion { column: String, value: String },

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Worker task failed: {0}")]
    Task(String),

    /// A reader stage failed; `source` holds the underlying error
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<CvmError>,
    },
}

impl CvmError {
    /// The underlying error with any stage wrappers removed
    pub fn root(&self) -> &CvmError {
        match self {
            CvmError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Errors that must fail a whole cycle instead of a single item
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root(),
            CvmError::Storage(_) | CvmError::Configuration(_)
        )
    }
}

/// Run file or CPU-bound work on the blocking pool
pub(crate) async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

impl From<reqwest::Error> for CvmError {
    fn from(err: reqwest::Error) -> Self {
        CvmError::Network(err.to_string())
    }
}

impl From<tokio::task::JoinError> for CvmError {
    fn from(err: tokio::task::JoinError) -> Self {
        CvmError::Task(err.to_string())
    }
}

impl From<zip::result::ZipError> for CvmError {
    fn from(err: zip::result::ZipError) -> Self {
        CvmError::CorruptArchive(err.to_string())
    }
}

impl From<url::ParseError> for CvmError {
    fn from(err: url::ParseError) -> Self {
        CvmError::Configuration(format!("invalid URL: {}", err))
    }
}

impl From<sqlx::migrate::MigrateError> for CvmError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CvmError::Storage(sqlx::Error::Migrate(Box::new(err)))
    }
}

impl From<CustodiaError> for CvmError {
    fn from(err: CustodiaError) -> Self {
        match err {
            CustodiaError::Io(e) => CvmError::Io(e),
            CustodiaError::InvalidName(msg) => CvmError::InvalidName(msg),
            CustodiaError::Parse { value, expected } => CvmError::Conversion {
                column: expected.to_string(),
                value,
            },
        }
    }
}

impl From<crate::sink::SinkError> for CvmError {
    fn from(err: crate::sink::SinkError) -> Self {
        use crate::sink::SinkError;
        match err {
            SinkError::Storage(e) => CvmError::Storage(e),
            SinkError::Io(e) => CvmError::Io(e),
            SinkError::Csv(e) => CvmError::Csv(e),
            SinkError::LoadMode(mode) => CvmError::Configuration(format!("invalid load mode '{}'", mode)),
        }
    }
}
