//! History file reader
//!
//! Turns one downloaded CSV into a typed, partitioned dataset:
//!
//! 1. fingerprint the header and look up its resolved mapping rows
//! 2. parse the CSV (`;`, no quoting) in the target encoding
//! 3. stage the rows in an in-memory SQLite table and run the compiled
//!    projection over it, preserving row order
//! 4. apply the named converters column by column
//! 5. annotate metadata and partition columns
//!
//! A failure is reported together with the stage it happened in.

use chrono::{Datelike, NaiveDate};
use custodia_common::{Dataset, Value};
use encoding_rs::Encoding;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::expressions::{self, quote_ident, Projection};
use super::filename::{self, FileMetadata, SUB_KIND_REGISTER_CURRENT};
use super::models::ArtifactKind;
use super::registry::Registry;
use super::{blocking, CvmError, Result};

/// SQLite's default bound-parameter limit
const MAX_BINDS: usize = 999;

/// Pipeline stage of a file being read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    New,
    Decoded,
    Projected,
    Converted,
    Partitioned,
    Emitted,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::New => "new",
            Stage::Decoded => "decoded",
            Stage::Projected => "projected",
            Stage::Converted => "converted",
            Stage::Partitioned => "partitioned",
            Stage::Emitted => "emitted",
        })
    }
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: Stage) -> Result<T> {
        self.map_err(|source| CvmError::Stage {
            stage,
            source: Box::new(source),
        })
    }
}

/// A transformed file
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub kind: ArtifactKind,
    pub sub_kind: String,
    pub dataset: Dataset,
    pub partition_columns: Vec<String>,
    pub metadata: FileMetadata,
}

impl ReadResult {
    /// File name without extension, used to name side-car outputs
    pub fn source_stem(&self) -> String {
        self.metadata
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.metadata.name)
            .to_string()
    }
}

/// Parsed CSV: header plus string records of matching width
struct RawTable {
    header: Vec<String>,
    records: Vec<Vec<String>>,
}

/// Reads history files against a registry; cheap to clone into worker tasks
#[derive(Clone)]
pub struct FileReader {
    registry: Arc<Registry>,
    encoding: &'static Encoding,
    check_header: bool,
    today: NaiveDate,
}

impl FileReader {
    pub fn new(registry: Arc<Registry>, encoding: &'static Encoding, check_header: bool) -> Self {
        Self {
            registry,
            encoding,
            check_header,
            today: chrono::Local::now().date_naive(),
        }
    }

    /// Pin "today" (used for the live register snapshot)
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub async fn read(&self, path: &Path) -> Result<ReadResult> {
        let owned = path.to_path_buf();
        let metadata = blocking(move || filename::inspect(&owned)).await.at(Stage::New)?;
        if self.check_header && !self.registry.knows(&metadata.fingerprint) {
            return Err(CvmError::SchemaDrift {
                file: path.display().to_string(),
                fingerprint: metadata.fingerprint.clone(),
            })
            .at(Stage::New);
        }
        let rows = self
            .registry
            .rows_for(&metadata.fingerprint)
            .ok_or_else(|| CvmError::UnknownFingerprint(metadata.fingerprint.clone()))
            .at(Stage::New)?;
        let projection = expressions::build(rows).at(Stage::New)?;
        if projection.is_empty() {
            return Err(CvmError::Registry(format!(
                "fingerprint {} maps no target fields",
                metadata.fingerprint
            )))
            .at(Stage::New);
        }

        let encoding = self.encoding;
        let owned = path.to_path_buf();
        let raw = blocking(move || {
            let bytes = std::fs::read(&owned)?;
            parse_csv(encoding, &bytes, &owned)
        })
        .await
        .at(Stage::Decoded)?;

        let projected = project(&raw, &projection).await.at(Stage::Projected)?;
        let mut dataset = blocking(move || convert(&projection, projected))
            .await
            .at(Stage::Converted)?;

        let partition_columns = self.annotate(&mut dataset, &metadata);

        info!(
            file = %path.display(),
            kind = %metadata.kind,
            sub_kind = %metadata.sub_kind,
            rows = dataset.len(),
            stage = %Stage::Emitted,
            "Read history file"
        );
        Ok(ReadResult {
            kind: metadata.kind,
            sub_kind: metadata.sub_kind.clone(),
            dataset,
            partition_columns,
            metadata,
        })
    }

    /// Add metadata columns and partitions; returns the partition columns
    fn annotate(&self, dataset: &mut Dataset, metadata: &FileMetadata) -> Vec<String> {
        let file_date = metadata
            .date_token
            .as_deref()
            .and_then(date_from_token)
            .or_else(|| (metadata.sub_kind == SUB_KIND_REGISTER_CURRENT).then_some(self.today));

        dataset.add_constant_column("kind", Value::text(metadata.kind.as_str()));
        dataset.add_constant_column("sub_kind", Value::text(&metadata.sub_kind));
        let source_file = metadata
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        dataset.add_constant_column("source_file", Value::Text(source_file));
        dataset.add_constant_column(
            "reference_date",
            file_date.map_or(Value::Null, Value::Date),
        );
        dataset.mark_partition("kind");
        dataset.mark_partition("sub_kind");

        let row_date_column = ["position_date", "start_date"].into_iter().find(|column| {
            dataset
                .column(column)
                .is_some_and(|mut values| values.any(|v| v.as_date().is_some()))
        });

        if let Some(column) = row_date_column {
            let idx = dataset.column_index(column).unwrap_or_default();
            dataset.add_column_with("year", |row| {
                row[idx]
                    .as_date()
                    .map_or(Value::Null, |d| Value::Integer(i64::from(d.year())))
            });
            dataset.add_column_with("period", |row| {
                row[idx]
                    .as_date()
                    .map_or(Value::Null, |d| Value::text(d.format("%Y-%m").to_string()))
            });
            dataset.mark_partition("year");
            dataset.mark_partition("period");
        } else if metadata.sub_kind == SUB_KIND_REGISTER_CURRENT {
            if let Some(date) = file_date {
                dataset.add_constant_column("year", Value::Integer(i64::from(date.year())));
                dataset.add_constant_column("period", Value::text(date.format("%Y-%m").to_string()));
                dataset.add_constant_column("period_date", Value::Date(date));
                dataset.mark_partition("year");
                dataset.mark_partition("period");
                dataset.mark_partition("period_date");
            }
        }

        dataset.partition_columns.clone()
    }
}

/// Split the file into header and records (`;`, no quoting)
fn parse_csv(encoding: &'static Encoding, bytes: &[u8], path: &Path) -> Result<RawTable> {
    let text = encoding
        .decode_without_bom_handling_and_without_replacement(bytes)
        .ok_or_else(|| {
            CvmError::Decode(format!(
                "{} is not valid {}",
                path.display(),
                encoding.name()
            ))
        })?;
    let text = text.trim_start_matches('\u{feff}');

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .quoting(false)
        .flexible(true)
        .has_headers(true)
        .from_reader(text.as_bytes());

    let header: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();
    if header.len() == 1 && header[0].is_empty() {
        return Ok(RawTable {
            header: Vec::new(),
            records: Vec::new(),
        });
    }

    let mut records = Vec::new();
    let mut skipped = 0usize;
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() != header.len() {
            skipped += 1;
            warn!(
                file = %path.display(),
                line = line + 2,
                expected = header.len(),
                found = record.len(),
                "Skipping record with wrong field count"
            );
            continue;
        }
        records.push(record.iter().map(str::to_string).collect());
    }
    debug!(file = %path.display(), records = records.len(), skipped, "Parsed CSV");

    Ok(RawTable { header, records })
}

/// `YYYYMMDD`, `YYYYMM` (first of month) or `YYYY` (first of year)
pub fn date_from_token(token: &str) -> Option<NaiveDate> {
    let year: i32 = token.get(0..4)?.parse().ok()?;
    let month: u32 = match token.len() {
        4 => 1,
        6 | 8 => token.get(4..6)?.parse().ok()?,
        _ => return None,
    };
    let day: u32 = if token.len() == 8 {
        token.get(6..8)?.parse().ok()?
    } else {
        1
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Stage the raw records and run the projection; returns text cells in row order
async fn project(raw: &RawTable, projection: &Projection) -> Result<Vec<Vec<Option<String>>>> {
    if raw.header.is_empty() {
        return Ok(Vec::new());
    }

    let pool = staging_pool().await?;
    let columns: Vec<String> = raw.header.iter().map(|h| quote_ident(h)).collect();
    let create = format!(
        "CREATE TABLE raw ({})",
        columns
            .iter()
            .map(|c| format!("{} TEXT", c))
            .collect::<Vec<_>>()
            .join(", ")
    );
    sqlx::query(&create).execute(&pool).await?;

    let rows_per_insert = (MAX_BINDS / columns.len().max(1)).max(1);
    let mut tx = pool.begin().await?;
    for chunk in raw.records.chunks(rows_per_insert) {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("INSERT INTO raw ({}) ", columns.join(", ")));
        builder.push_values(chunk, |mut b, record| {
            for value in record {
                b.push_bind(value.as_str());
            }
        });
        builder.build().execute(&mut *tx).await?;
    }
    tx.commit().await?;

    let select = format!("SELECT {} FROM raw ORDER BY rowid", projection.select_list());
    let rows = sqlx::query(&select).fetch_all(&pool).await?;

    let width = projection.columns.len();
    let mut cells = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(row.try_get::<Option<String>, _>(i)?);
        }
        cells.push(values);
    }
    pool.close().await;
    Ok(cells)
}

async fn staging_pool() -> Result<SqlitePool> {
    Ok(SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?)
}

/// Apply converters column-wise; the first rejection aborts the file
fn convert(projection: &Projection, cells: Vec<Vec<Option<String>>>) -> Result<Dataset> {
    let mut dataset = Dataset::new(projection.columns.clone());
    for row in cells {
        let mut values = Vec::with_capacity(row.len());
        for (idx, cell) in row.iter().enumerate() {
            let converter = projection.converters[idx];
            let value = converter(cell.as_deref()).map_err(|_| CvmError::Conversion {
                column: projection.columns[idx].clone(),
                value: cell.clone().unwrap_or_default(),
            })?;
            values.push(value);
        }
        dataset.push_row(values);
    }
    for (column, column_type) in projection.columns.iter().zip(&projection.types) {
        if let Some(column_type) = column_type {
            dataset.declare_type(column, *column_type);
        }
    }
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cvm::filename::fingerprint;
    use crate::cvm::registry::MappingRow;
    use custodia_common::ColumnType;
    use encoding_rs::UTF_8;

    const HEADER: &str = "CNPJ_FUNDO;DT_COMPTC;VL_QUOTA;NR_COTST";

    fn row(order: i64, target: &str, source: &str, converter: &str) -> MappingRow {
        MappingRow {
            fingerprint: Some(fingerprint(ArtifactKind::Position, "position-daily", HEADER)),
            kind: "position".to_string(),
            sub_kind: Some("position-daily".to_string()),
            order,
            target_field: Some(target.to_string()),
            source_field: Some(source.to_string()),
            transformation_1: None,
            transformation_2: None,
            transformation_3: None,
            converter: Some(converter.to_string()),
            is_new: false,
        }
    }

    fn registry() -> Registry {
        let mut cnpj = row(1, "fund_cnpj", "CNPJ_FUNDO", "string");
        cnpj.transformation_1 = Some("REPLACE($X, '.', '')".to_string());
        Registry::from_rows(
            Vec::new(),
            vec![
                cnpj,
                row(2, "position_date", "DT_COMPTC", "date"),
                row(3, "quota_value", "VL_QUOTA", "decimal"),
                row(4, "holders", "NR_COTST", "integer"),
            ],
        )
    }

    fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_read_projects_converts_and_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "position.inf_diario_fi_202401.csv",
            &format!(
                "{}\n00.017.024/0001-53;2024-01-02;27.1234;152\nbroken;row\n00.017.024/0001-53;2024-01-03;27.2;-\n",
                HEADER
            ),
        );
        let registry = Arc::new(registry());
        let result = FileReader::new(registry.clone(), UTF_8, true).read(&path).await.unwrap();

        let ds = &result.dataset;
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.value(0, "fund_cnpj"), Some(&Value::text("00017024/0001-53")));
        assert_eq!(ds.value(0, "quota_value"), Some(&Value::Decimal(27.1234)));
        assert_eq!(ds.value(1, "holders"), Some(&Value::Null));
        assert_eq!(ds.declared_type("holders"), Some(ColumnType::Integer));
        assert_eq!(ds.declared_type("position_date"), Some(ColumnType::Date));
        assert_eq!(ds.value(1, "period"), Some(&Value::text("2024-01")));
        assert_eq!(ds.value(0, "year"), Some(&Value::Integer(2024)));
        assert_eq!(ds.value(0, "source_file"), Some(&Value::text("position.inf_diario_fi_202401.csv")));
        assert_eq!(
            result.partition_columns,
            vec!["kind", "sub_kind", "year", "period"]
        );
        assert_eq!(result.source_stem(), "position.inf_diario_fi_202401");
    }

    #[tokio::test]
    async fn test_unknown_header_is_schema_drift() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "position.inf_diario_fi_202402.csv", "CNPJ_FUNDO;NEW_COLUMN\n1;2\n");
        let registry = Arc::new(registry());

        let err = FileReader::new(registry.clone(), UTF_8, true).read(&path).await.unwrap_err();
        assert!(matches!(err.root(), CvmError::SchemaDrift { .. }));
        assert!(err.to_string().starts_with("new stage failed"));

        let err = FileReader::new(registry.clone(), UTF_8, false).read(&path).await.unwrap_err();
        assert!(matches!(err.root(), CvmError::UnknownFingerprint(_)));
    }

    #[tokio::test]
    async fn test_conversion_rejection_names_column_and_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "position.inf_diario_fi_202401.csv",
            &format!("{}\n1;2024-01-02;abc;1\n", HEADER),
        );
        let registry = Arc::new(registry());

        let err = FileReader::new(registry.clone(), UTF_8, true).read(&path).await.unwrap_err();
        match err.root() {
            CvmError::Conversion { column, value } => {
                assert_eq!(column, "quota_value");
                assert_eq!(value, "abc");
            },
            other => panic!("unexpected error {other:?}"),
        }
        assert!(matches!(err, CvmError::Stage { stage: Stage::Converted, .. }));
    }

    #[tokio::test]
    async fn test_header_only_file_yields_empty_dataset_with_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "position.inf_diario_fi_202401.csv", &format!("{}\n", HEADER));
        let registry = Arc::new(registry());

        let result = FileReader::new(registry.clone(), UTF_8, true).read(&path).await.unwrap();
        assert!(result.dataset.is_empty());
        assert!(result.dataset.has_column("quota_value"));
        assert_eq!(result.partition_columns, vec!["kind", "sub_kind"]);
    }

    #[tokio::test]
    async fn test_live_register_snapshot_uses_today() {
        let header = "CNPJ_FUNDO;SIT";
        let fp = fingerprint(ArtifactKind::Register, "register-current", header);
        let registry = Arc::new(Registry::from_rows(
            Vec::new(),
            vec![MappingRow {
                fingerprint: Some(fp),
                kind: "register".to_string(),
                sub_kind: Some("register-current".to_string()),
                order: 1,
                target_field: Some("situation".to_string()),
                source_field: Some("SIT".to_string()),
                transformation_1: Some("TRIM($X)".to_string()),
                transformation_2: None,
                transformation_3: None,
                converter: Some("string".to_string()),
                is_new: false,
            }],
        ));
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "register.cad_fi.csv", "CNPJ_FUNDO;SIT\n1; EM FUNCIONAMENTO NORMAL \n");
        let today = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();

        let result = FileReader::new(registry.clone(), UTF_8, true)
            .with_today(today)
            .read(&path)
            .await
            .unwrap();
        let ds = &result.dataset;
        assert_eq!(ds.value(0, "situation"), Some(&Value::text("EM FUNCIONAMENTO NORMAL")));
        assert_eq!(ds.value(0, "period_date"), Some(&Value::Date(today)));
        assert_eq!(ds.value(0, "period"), Some(&Value::text("2024-03")));
        assert!(result.partition_columns.contains(&"period_date".to_string()));
    }

    #[test]
    fn test_date_from_token() {
        assert_eq!(date_from_token("20240105"), NaiveDate::from_ymd_opt(2024, 1, 5));
        assert_eq!(date_from_token("202401"), NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(date_from_token("2019"), NaiveDate::from_ymd_opt(2019, 1, 1));
        assert_eq!(date_from_token("202413"), None);
        assert_eq!(date_from_token("20241"), None);
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::Projected.to_string(), "projected");
        assert_eq!(Stage::Emitted.to_string(), "emitted");
    }
}
