//! Custodia ingestion library
//!
//! Ingests Brazilian securities-custody reports and investment-fund filings
//! into typed, partitioned tables.
//!
//! # Pipelines
//!
//! - **CVM**: mirrors the CVM open-data fund directory (register and daily
//!   positions) and transforms each artifact through a versioned
//!   header-mapping registry
//! - **CEI**: normalizes the spreadsheet extracts of a custody statement
//!
//! # Example
//!
//! ```no_run
//! use custodia_ingest::config::IngestConfig;
//! use custodia_ingest::cvm::Orchestrator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let mut orchestrator = Orchestrator::from_config(config).await?;
//!     let report = orchestrator.run_cycle().await?;
//!     println!("{} entries", report.entries.len());
//!     Ok(())
//! }
//! ```

pub mod cei;
pub mod config;
pub mod cvm;
pub mod sheet;
pub mod sink;
