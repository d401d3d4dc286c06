//! Consumer store for transformed datasets
//!
//! Both pipelines hand their datasets to one or more [`DatasetSink`]s:
//! a SQLite table per `(kind, sub_kind)` and, optionally, CSV side-cars laid
//! out by partition.

use async_trait::async_trait;
use custodia_common::{ColumnType, Dataset, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

/// SQLite's default bound-parameter limit
const MAX_BINDS: usize = 999;

pub type Result<T> = std::result::Result<T, SinkError>;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid load mode '{0}' (expected append or replace)")]
    LoadMode(String),
}

/// How a write treats rows already stored for the same partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    Append,
    #[default]
    Replace,
}

impl FromStr for LoadMode {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "append" => Ok(LoadMode::Append),
            "replace" => Ok(LoadMode::Replace),
            other => Err(SinkError::LoadMode(other.to_string())),
        }
    }
}

impl std::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadMode::Append => write!(f, "append"),
            LoadMode::Replace => write!(f, "replace"),
        }
    }
}

/// Logical destination of a dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetTarget {
    pub kind: String,
    pub sub_kind: String,
    /// Source file name without extension; names the CSV side-car
    pub source_stem: String,
}

impl DatasetTarget {
    pub fn new(kind: impl Into<String>, sub_kind: impl Into<String>, source_stem: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            sub_kind: sub_kind.into(),
            source_stem: source_stem.into(),
        }
    }

    /// `<kind>__<sub_kind>`, sanitised
    pub fn table_name(&self) -> String {
        format!(
            "{}__{}",
            sanitize_identifier(&self.kind),
            sanitize_identifier(&self.sub_kind)
        )
    }
}

/// Lower-case, with every character outside `[a-z0-9_]` replaced by `_`
pub fn sanitize_identifier(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn quoted(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Destination for transformed datasets
#[async_trait]
pub trait DatasetSink: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Store one dataset; returns the number of rows written
    async fn write(&self, target: &DatasetTarget, dataset: &Dataset) -> Result<u64>;
}

/// SQLite table per `(kind, sub_kind)`
pub struct SqliteSink {
    pool: SqlitePool,
    mode: LoadMode,
}

impl SqliteSink {
    pub async fn connect(url: &str, mode: LoadMode) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(Self::from_pool(pool, mode))
    }

    pub fn from_pool(pool: SqlitePool, mode: LoadMode) -> Self {
        Self { pool, mode }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the table or add the columns it lacks
    async fn ensure_table(
        &self,
        conn: &mut sqlx::SqliteConnection,
        table: &str,
        dataset: &Dataset,
    ) -> Result<()> {
        let types: Vec<&'static str> = (0..dataset.width()).map(|i| column_type(dataset, i)).collect();

        let create = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quoted(table),
            dataset
                .columns
                .iter()
                .zip(&types)
                .map(|(c, t)| format!("{} {}", quoted(c), t))
                .collect::<Vec<_>>()
                .join(", ")
        );
        sqlx::query(&create).execute(&mut *conn).await?;

        let existing: Vec<String> = sqlx::query(&format!("PRAGMA table_info({})", quoted(table)))
            .fetch_all(&mut *conn)
            .await?
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<std::result::Result<_, _>>()?;

        for (column, sql_type) in dataset.columns.iter().zip(&types) {
            if !existing.iter().any(|c| c == column) {
                debug!(table = %table, column = %column, "Adding column");
                sqlx::query(&format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    quoted(table),
                    quoted(column),
                    sql_type
                ))
                .execute(&mut *conn)
                .await?;
            }
        }
        Ok(())
    }

    /// Delete rows this dataset supersedes: its periods, or else its source files
    async fn delete_superseded(
        &self,
        conn: &mut sqlx::SqliteConnection,
        table: &str,
        dataset: &Dataset,
    ) -> Result<u64> {
        let (column, values) = if dataset.partition_columns.iter().any(|c| c == "period") {
            ("period", dataset.distinct("period"))
        } else {
            ("source_file", dataset.distinct("source_file"))
        };
        if values.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "DELETE FROM {} WHERE {} IN (",
            quoted(table),
            quoted(column)
        ));
        let mut separated = builder.separated(", ");
        for value in values {
            separated.push_bind(value.to_field());
        }
        separated.push_unseparated(")");

        Ok(builder.build().execute(&mut *conn).await?.rows_affected())
    }
}

/// SQL type of a column: the declared type, else the first non-null value
fn column_type(dataset: &Dataset, idx: usize) -> &'static str {
    let declared = dataset
        .columns
        .get(idx)
        .and_then(|name| dataset.declared_type(name));
    let sampled = || {
        dataset
            .rows
            .iter()
            .map(|row| &row[idx])
            .find_map(|value| match value {
                Value::Null => None,
                Value::Bool(_) => Some(ColumnType::Bool),
                Value::Integer(_) => Some(ColumnType::Integer),
                Value::Decimal(_) => Some(ColumnType::Decimal),
                Value::Date(_) => Some(ColumnType::Date),
                Value::DateTime(_) => Some(ColumnType::DateTime),
                Value::Text(_) => Some(ColumnType::Text),
            })
    };
    match declared.or_else(sampled) {
        Some(ColumnType::Bool) | Some(ColumnType::Integer) => "INTEGER",
        Some(ColumnType::Decimal) => "REAL",
        _ => "TEXT",
    }
}

#[async_trait]
impl DatasetSink for SqliteSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn write(&self, target: &DatasetTarget, dataset: &Dataset) -> Result<u64> {
        let table = target.table_name();
        let mut tx = self.pool.begin().await?;

        self.ensure_table(&mut tx, &table, dataset).await?;
        let deleted = match self.mode {
            LoadMode::Replace => self.delete_superseded(&mut tx, &table, dataset).await?,
            LoadMode::Append => 0,
        };

        let columns = dataset
            .columns
            .iter()
            .map(|c| quoted(c))
            .collect::<Vec<_>>()
            .join(", ");
        let rows_per_insert = (MAX_BINDS / dataset.width().max(1)).max(1);
        let mut inserted = 0u64;

        for chunk in dataset.rows.chunks(rows_per_insert) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("INSERT INTO {} ({}) ", quoted(&table), columns));
            builder.push_values(chunk, |mut b, row| {
                for value in row {
                    match value {
                        Value::Null => b.push_bind(None::<String>),
                        Value::Bool(v) => b.push_bind(*v),
                        Value::Integer(v) => b.push_bind(*v),
                        Value::Decimal(v) => b.push_bind(*v),
                        other => b.push_bind(other.to_field()),
                    };
                }
            });
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        info!(
            table = %table,
            mode = %self.mode,
            deleted,
            inserted,
            "Wrote dataset"
        );
        Ok(inserted)
    }
}

/// CSV side-cars at `<root>/<kind>/<sub_kind>/[year=Y/][period=P/]<stem>.csv`
pub struct CsvPartitionSink {
    root: PathBuf,
}

impl CsvPartitionSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one row, from its `year` and `period` partition values
    fn partition_dir(&self, target: &DatasetTarget, dataset: &Dataset, row: &[Value]) -> PathBuf {
        let mut dir = self.root.join(&target.kind).join(&target.sub_kind);
        for column in ["year", "period"] {
            if !dataset.partition_columns.iter().any(|c| c == column) {
                continue;
            }
            if let Some(value) = dataset.column_index(column).map(|i| &row[i]) {
                if !value.is_null() {
                    dir = dir.join(format!("{}={}", column, value.to_field()));
                }
            }
        }
        dir
    }
}

#[async_trait]
impl DatasetSink for CsvPartitionSink {
    fn name(&self) -> &str {
        "csv"
    }

    async fn write(&self, target: &DatasetTarget, dataset: &Dataset) -> Result<u64> {
        let mut groups: BTreeMap<PathBuf, Vec<&Vec<Value>>> = BTreeMap::new();
        for row in &dataset.rows {
            groups
                .entry(self.partition_dir(target, dataset, row))
                .or_default()
                .push(row);
        }
        if groups.is_empty() {
            groups.insert(self.root.join(&target.kind).join(&target.sub_kind), Vec::new());
        }

        let file_name = format!("{}.csv", target.source_stem);
        let mut written = 0u64;
        for (dir, rows) in groups {
            let mut writer = csv::Writer::from_writer(Vec::new());
            writer.write_record(&dataset.columns)?;
            for row in &rows {
                writer.write_record(row.iter().map(Value::to_field))?;
            }
            let bytes = writer
                .into_inner()
                .map_err(|e| SinkError::Io(e.into_error()))?;

            tokio::fs::create_dir_all(&dir).await?;
            let path = dir.join(&file_name);
            tokio::fs::write(&path, bytes).await?;
            debug!(path = %path.display(), rows = rows.len(), "Wrote CSV side-car");
            written += rows.len() as u64;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    fn dataset(period: &str, source_file: &str, quotas: &[f64]) -> Dataset {
        let mut ds = Dataset::new(vec!["fund_cnpj".into(), "quota_value".into()]);
        for (i, quota) in quotas.iter().enumerate() {
            ds.push_row(vec![Value::text(format!("fund-{i}")), Value::Decimal(*quota)]);
        }
        ds.add_constant_column("source_file", Value::text(source_file));
        ds.add_constant_column("year", Value::Integer(2024));
        ds.add_constant_column("period", Value::text(period));
        ds.mark_partition("year");
        ds.mark_partition("period");
        ds
    }

    fn target() -> DatasetTarget {
        DatasetTarget::new("position", "position-daily", "position.inf_diario_fi_202401")
    }

    async fn count(pool: &SqlitePool, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quoted(table)))
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[test]
    fn test_table_name_is_sanitised() {
        assert_eq!(target().table_name(), "position__position_daily");
        assert_eq!(sanitize_identifier("Register Historical-Cnpj"), "register_historical_cnpj");
    }

    #[test]
    fn test_load_mode_parsing() {
        assert_eq!("Append".parse::<LoadMode>().unwrap(), LoadMode::Append);
        assert_eq!(" replace ".parse::<LoadMode>().unwrap(), LoadMode::Replace);
        assert!("upsert".parse::<LoadMode>().is_err());
    }

    #[tokio::test]
    async fn test_replace_supersedes_period() {
        let sink = SqliteSink::from_pool(memory_pool().await, LoadMode::Replace);
        let table = target().table_name();

        sink.write(&target(), &dataset("2024-01", "a.csv", &[1.0, 2.0])).await.unwrap();
        sink.write(&target(), &dataset("2024-02", "b.csv", &[3.0])).await.unwrap();
        assert_eq!(count(sink.pool(), &table).await, 3);

        sink.write(&target(), &dataset("2024-01", "a.csv", &[1.5])).await.unwrap();
        assert_eq!(count(sink.pool(), &table).await, 2);
    }

    #[tokio::test]
    async fn test_append_keeps_rows_and_adds_columns() {
        let sink = SqliteSink::from_pool(memory_pool().await, LoadMode::Append);
        let table = target().table_name();

        sink.write(&target(), &dataset("2024-01", "a.csv", &[1.0])).await.unwrap();
        let mut wider = dataset("2024-01", "a.csv", &[2.0]);
        wider.add_constant_column("holders", Value::Integer(10));
        sink.write(&target(), &wider).await.unwrap();

        assert_eq!(count(sink.pool(), &table).await, 2);
        let holders: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT holders FROM {} WHERE quota_value = 2.0",
            quoted(&table)
        ))
        .fetch_one(sink.pool())
        .await
        .unwrap();
        assert_eq!(holders, Some(10));
    }

    #[tokio::test]
    async fn test_declared_types_survive_all_null_first_write() {
        let sink = SqliteSink::from_pool(memory_pool().await, LoadMode::Append);
        let table = target().table_name();

        let mut first = dataset("2024-01", "a.csv", &[1.0]);
        first.add_constant_column("holders", Value::Null);
        first.declare_type("holders", ColumnType::Integer);
        sink.write(&target(), &first).await.unwrap();

        let mut second = dataset("2024-02", "b.csv", &[2.0]);
        second.add_constant_column("holders", Value::Integer(10));
        sink.write(&target(), &second).await.unwrap();

        let declared: String = sqlx::query_scalar(&format!(
            "SELECT type FROM pragma_table_info('{}') WHERE name = 'holders'",
            table
        ))
        .fetch_one(sink.pool())
        .await
        .unwrap();
        assert_eq!(declared, "INTEGER");

        let stored: String = sqlx::query_scalar(&format!(
            "SELECT typeof(holders) FROM {} WHERE period = '2024-02'",
            quoted(&table)
        ))
        .fetch_one(sink.pool())
        .await
        .unwrap();
        assert_eq!(stored, "integer");
    }

    #[tokio::test]
    async fn test_replace_without_period_uses_source_file() {
        let sink = SqliteSink::from_pool(memory_pool().await, LoadMode::Replace);
        let target = DatasetTarget::new("cei", "transactions", "movimentacao-2024-01-31");
        let mut ds = Dataset::new(vec!["date".into(), "source_file".into()]);
        let day = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        ds.push_row(vec![Value::Date(day), Value::text("movimentacao-2024-01-31.xlsx")]);

        sink.write(&target, &ds).await.unwrap();
        sink.write(&target, &ds).await.unwrap();
        assert_eq!(count(sink.pool(), "cei__transactions").await, 1);
    }

    #[tokio::test]
    async fn test_csv_side_cars_follow_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvPartitionSink::new(dir.path());

        let written = sink.write(&target(), &dataset("2024-01", "a.csv", &[1.0, 2.5])).await.unwrap();
        assert_eq!(written, 2);

        let path = dir
            .path()
            .join("position/position-daily/year=2024/period=2024-01/position.inf_diario_fi_202401.csv");
        let content = std::fs::read_to_string(path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("fund_cnpj,quota_value,source_file,year,period"));
        assert_eq!(lines.next(), Some("fund-0,1,a.csv,2024,2024-01"));
        assert_eq!(lines.count(), 1);
    }

    #[tokio::test]
    async fn test_csv_empty_dataset_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvPartitionSink::new(dir.path());
        let empty = Dataset::new(vec!["fund_cnpj".into()]);

        assert_eq!(sink.write(&target(), &empty).await.unwrap(), 0);
        let content = std::fs::read_to_string(
            dir.path().join("position/position-daily/position.inf_diario_fi_202401.csv"),
        )
        .unwrap();
        assert_eq!(content.trim(), "fund_cnpj");
    }
}
