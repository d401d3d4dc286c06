//! Custodia Ingest - custody and fund-filing ingestion tool

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use custodia_common::logging::{init_logging, LogConfig, LogLevel};
use custodia_ingest::cei::{self, CeiOutcome};
use custodia_ingest::config::IngestConfig;
use custodia_ingest::cvm::{CycleReport, DriftSummary, FileReader, Orchestrator, ReadResult, Registry};
use custodia_ingest::sink::{CsvPartitionSink, DatasetSink, SqliteSink};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "custodia-ingest")]
#[command(author, version, about = "Custody statement and CVM fund data ingestion")]
struct Cli {
    #[command(subcommand)]
    pipeline: Pipeline,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Pipeline {
    /// CVM open-data fund directory
    #[command(subcommand)]
    Cvm(CvmCommand),

    /// CEI custody statement extracts
    #[command(subcommand)]
    Cei(CeiCommand),
}

#[derive(Subcommand, Debug)]
enum CvmCommand {
    /// Run one sync cycle: list, download, reconcile, read and load
    Sync,

    /// Report history files whose header is not in the mappings table
    Drift {
        /// Reconcile unknown headers and persist the new mapping rows
        #[arg(long)]
        reconcile: bool,
    },

    /// Read one history file and print the resulting dataset shape
    Read {
        /// Path of a `<kind>.<name>[.<index>].<ext>` history file
        file: PathBuf,

        /// Also print the first N rows as JSON lines
        #[arg(long, default_value_t = 0)]
        sample: usize,
    },
}

#[derive(Subcommand, Debug)]
enum CeiCommand {
    /// Load every recognised workbook of the input folder
    Load {
        /// Input folder (defaults to <source root>/input)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Also write CSV side-cars under this folder
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // Reads .env too, so it comes before the logging variables
    let config = IngestConfig::from_env()?;

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("custodia-ingest")
        .build();
    let log_config = LogConfig::from_env_with(log_config)?;
    let _guard = init_logging(&log_config)?;

    match cli.pipeline {
        Pipeline::Cvm(CvmCommand::Sync) => {
            let mut orchestrator = Orchestrator::from_config(config).await?;
            let report = orchestrator.run_cycle().await?;
            print_cycle(&report);
            if report.is_failure() {
                anyhow::bail!("every attempted download failed");
            }
        },
        Pipeline::Cvm(CvmCommand::Drift { reconcile }) => {
            let mut orchestrator = Orchestrator::from_config(config).await?;
            let summary = orchestrator.check_drift(reconcile).await?;
            print_drift(&summary, reconcile);
        },
        Pipeline::Cvm(CvmCommand::Read { file, sample }) => {
            let registry = Registry::load(&config.templates_path, &config.mappings_path)?;
            let reader = FileReader::new(Arc::new(registry), config.target_encoding()?, config.check_header);
            let result = reader
                .read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            print_shape(&result);
            print_sample(&result, sample)?;
        },
        Pipeline::Cei(CeiCommand::Load { input, output }) => {
            let input = input.unwrap_or_else(|| config.input_folder.clone());
            let mut sinks: Vec<Arc<dyn DatasetSink>> = vec![Arc::new(
                SqliteSink::connect(&config.store_db_url, config.load_mode).await?,
            )];
            let output = output.or_else(|| config.write_csv.then(|| config.output_folder.clone()));
            if let Some(output) = output {
                sinks.push(Arc::new(CsvPartitionSink::new(output)));
            }

            let outcomes = cei::load_folder(&input, &sinks).await?;
            print_cei(&outcomes);
            if outcomes.iter().any(|o| o.error.is_some()) {
                anyhow::bail!("some CEI extracts failed to load");
            }
        },
    }

    info!("Done");
    Ok(())
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header);
    table
}

fn print_cycle(report: &CycleReport) {
    let mut table = new_table(vec!["Status", "Kind", "Name", "Rows", "Elapsed", "Message"]);
    for entry in &report.entries {
        table.add_row(vec![
            entry.status.to_string(),
            entry.kind.clone(),
            if entry.name.is_empty() { entry.url.clone() } else { entry.name.clone() },
            entry.rows.to_string(),
            format!("{:.1}s", entry.elapsed.as_secs_f64()),
            entry.message.clone().unwrap_or_default(),
        ]);
    }
    println!("{}", table);
    if report.halted {
        println!("Read phase halted: review the is_new rows of the mappings table.");
    }
}

fn print_drift(summary: &DriftSummary, reconciled: bool) {
    println!("Scanned {} history file(s)", summary.scanned);
    if summary.unknown.is_empty() {
        println!("All headers are mapped.");
        return;
    }

    let mut table = new_table(vec!["File", "Kind", "Sub-kind", "Fingerprint"]);
    for file in &summary.unknown {
        table.add_row(vec![
            file.path.display().to_string(),
            file.kind.to_string(),
            file.sub_kind.clone(),
            file.fingerprint.clone(),
        ]);
    }
    println!("{}", table);
    if reconciled {
        println!(
            "Persisted {} mapping row(s); {} new field(s) await review.",
            summary.persisted, summary.new_fields
        );
    }
}

fn print_shape(result: &ReadResult) {
    let mut table = new_table(vec!["Property", "Value"]);
    table.add_row(vec!["Kind".to_string(), result.kind.to_string()]);
    table.add_row(vec!["Sub-kind".to_string(), result.sub_kind.clone()]);
    table.add_row(vec!["Fingerprint".to_string(), result.metadata.fingerprint.clone()]);
    table.add_row(vec!["Rows".to_string(), result.dataset.len().to_string()]);
    table.add_row(vec!["Columns".to_string(), result.dataset.columns.join(", ")]);
    table.add_row(vec!["Partitions".to_string(), result.partition_columns.join(", ")]);
    println!("{}", table);
}

fn print_sample(result: &ReadResult, limit: usize) -> Result<()> {
    for row in result.dataset.rows.iter().take(limit) {
        let object: serde_json::Map<String, serde_json::Value> = result
            .dataset
            .columns
            .iter()
            .zip(row)
            .map(|(column, value)| serde_json::to_value(value).map(|v| (column.clone(), v)))
            .collect::<serde_json::Result<_>>()?;
        println!("{}", serde_json::Value::Object(object));
    }
    Ok(())
}

fn print_cei(outcomes: &[CeiOutcome]) {
    let mut table = new_table(vec!["File", "Schema", "Rows", "Error"]);
    for outcome in outcomes {
        table.add_row(vec![
            outcome.file.clone(),
            outcome.schema.to_string(),
            outcome.rows.to_string(),
            outcome.error.clone().unwrap_or_default(),
        ]);
    }
    println!("{}", table);
}
