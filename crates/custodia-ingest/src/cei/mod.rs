// CEI custody statement ingestion
//
// Reads the spreadsheet extracts of a retail custody statement (transactions,
// events, trades and the position workbook) and normalizes every schema into
// a typed dataset written to the consumer store.
//
// Each workbook is opened once; a position workbook is dispatched per sheet
// to the schemas that share its file pattern.

pub mod processors;
pub mod product;
pub mod schemas;

pub use product::ProductIdRule;
pub use schemas::{Schema, SCHEMAS};

use custodia_common::names::{parse_dated_name, DatedName};
use custodia_common::{CustodiaError, Dataset};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::sheet::{SheetError, Workbook};
use crate::sink::{DatasetSink, DatasetTarget, SinkError};
use schemas::{schemas_for, SheetSelector};

/// Logical kind of every CEI dataset
pub const KIND: &str = "cei";

/// Result type for CEI operations
pub type Result<T> = std::result::Result<T, CeiError>;

#[derive(Debug, thiserror::Error)]
pub enum CeiError {
    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error(transparent)]
    Sheet(#[from] SheetError),

    #[error("Conversion error in {schema}.{column}: cannot convert '{value}'")]
    Conversion {
        schema: String,
        column: String,
        value: String,
    },

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker failed: {0}")]
    Task(String),
}

impl From<CustodiaError> for CeiError {
    fn from(err: CustodiaError) -> Self {
        match err {
            CustodiaError::Io(e) => CeiError::Io(e),
            other => CeiError::InvalidName(other.to_string()),
        }
    }
}

impl CeiError {
    /// Storage failures stop the whole load
    pub fn is_fatal(&self) -> bool {
        matches!(self, CeiError::Sink(SinkError::Storage(_)))
    }
}

/// One schema of one file
#[derive(Debug, Clone)]
pub struct CeiOutcome {
    pub file: String,
    pub schema: &'static str,
    pub rows: usize,
    pub error: Option<String>,
}

/// Read every schema that applies to a workbook, opening it once
pub fn read_workbook(path: &Path) -> Result<Vec<(&'static Schema, Result<Dataset>)>> {
    let file_name = file_name(path);
    let schemas = schemas_for(&file_name);
    if schemas.is_empty() {
        return Ok(Vec::new());
    }

    let name: DatedName = parse_dated_name(path)?;
    let mut workbook = Workbook::open(path)?;
    let mut results = Vec::with_capacity(schemas.len());

    for schema in schemas {
        let rows = match schema.sheet {
            SheetSelector::First => workbook.first_sheet().map(Some),
            SheetSelector::Named(sheet) => workbook.sheet(sheet),
        };
        let result = match rows {
            Ok(Some(rows)) => processors::process_rows(schema, &rows, &name, &file_name),
            Ok(None) => {
                info!(file = %file_name, schema = schema.name, "Sheet not present, skipping");
                continue;
            },
            Err(e) => Err(CeiError::from(e)),
        };
        results.push((schema, result));
    }
    Ok(results)
}

/// Process every recognised workbook of `input` and write its datasets
pub async fn load_folder(input: &Path, sinks: &[Arc<dyn DatasetSink>]) -> Result<Vec<CeiOutcome>> {
    let mut files: Vec<PathBuf> = Vec::new();
    let mut dir = tokio::fs::read_dir(input).await?;
    while let Some(item) = dir.next_entry().await? {
        let path = item.path();
        if item.file_type().await?.is_file() && !schemas_for(&file_name(&path)).is_empty() {
            files.push(path);
        }
    }
    files.sort();
    info!(input = %input.display(), files = files.len(), "Loading CEI extracts");

    let mut outcomes = Vec::new();
    for path in files {
        let name = file_name(&path);
        let stem = name.split('.').next().unwrap_or(&name).to_string();

        let worker_path = path.clone();
        let read = tokio::task::spawn_blocking(move || read_workbook(&worker_path))
            .await
            .map_err(|e| CeiError::Task(e.to_string()))?;
        let results = match read {
            Ok(results) => results,
            Err(e) => {
                warn!(file = %name, error = %e, "Cannot read workbook");
                outcomes.push(CeiOutcome {
                    file: name.clone(),
                    schema: "",
                    rows: 0,
                    error: Some(e.to_string()),
                });
                continue;
            },
        };

        for (schema, result) in results {
            let outcome = match result {
                Ok(dataset) => match write(sinks, schema, &stem, &dataset).await {
                    Ok(()) => CeiOutcome {
                        file: name.clone(),
                        schema: schema.name,
                        rows: dataset.len(),
                        error: None,
                    },
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => failed(&name, schema, e),
                },
                Err(e) => failed(&name, schema, e),
            };
            outcomes.push(outcome);
        }
    }
    Ok(outcomes)
}

async fn write(
    sinks: &[Arc<dyn DatasetSink>],
    schema: &Schema,
    stem: &str,
    dataset: &Dataset,
) -> Result<()> {
    let target = DatasetTarget::new(KIND, schema.name, stem);
    for sink in sinks {
        sink.write(&target, dataset).await?;
    }
    Ok(())
}

fn failed(file: &str, schema: &'static Schema, error: CeiError) -> CeiOutcome {
    warn!(file = %file, schema = schema.name, error = %error, "Schema failed");
    CeiOutcome {
        file: file.to_string(),
        schema: schema.name,
        rows: 0,
        error: Some(error.to_string()),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}
