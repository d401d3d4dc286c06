// CVM sync cycle orchestrator
//
// One cycle: list every remote source and merge it into the catalog, fetch
// pending artifacts in parallel, check the downloaded headers against the
// registry (reconciling new ones), read each file and load the datasets.
//
// Reading stops while any pending file has reconciled columns nobody has
// mapped yet. The mappings table is re-read at the start of every cycle, so
// filling `target_field` (or clearing `is_new`) releases the halt.
//
// Per-item failures become report entries; only storage and configuration
// errors abort the cycle.

use chrono::NaiveDateTime;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::catalog::Catalog;
use super::downloader::{DownloadOutcome, Downloader, OutcomeStatus};
use super::filename::{self, FileMetadata};
use super::listing::ListingClient;
use super::models::{ArtifactDescriptor, CatalogEntry, RemoteSource};
use super::reader::{FileReader, ReadResult};
use super::registry::{self, Registry};
use super::timestamp;
use super::{blocking, CvmError, Result};
use crate::config::IngestConfig;
use crate::sink::{CsvPartitionSink, DatasetSink, DatasetTarget, SqliteSink};

/// Final state of one URL (or listing page) in a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    Skipped,
    Processed,
    Halted,
    Error,
}

impl std::fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ReportStatus::Skipped => "skipped",
            ReportStatus::Processed => "processed",
            ReportStatus::Halted => "halted",
            ReportStatus::Error => "error",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReportEntry {
    pub url: String,
    pub status: ReportStatus,
    pub kind: String,
    pub name: String,
    pub message: Option<String>,
    pub rows: usize,
    pub elapsed: Duration,
}

/// Outcome of one cycle
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub entries: Vec<ReportEntry>,
    /// Reading was skipped because reconciliation found unmapped fields
    pub halted: bool,
    /// Number of URLs a download was attempted for
    pub attempted: usize,
    /// Attempted URLs whose download failed
    pub failed_downloads: usize,
}

impl CycleReport {
    /// The cycle failed when every attempted download errored
    pub fn is_failure(&self) -> bool {
        self.attempted > 0 && self.failed_downloads == self.attempted
    }

    pub fn count(&self, status: ReportStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }
}

/// Result of scanning the history folder for unknown headers
#[derive(Debug, Clone, Default)]
pub struct DriftSummary {
    pub scanned: usize,
    pub unknown: Vec<FileMetadata>,
    /// Rows written to the mappings table by reconciliation
    pub persisted: usize,
    /// Reconciled rows for source columns no template maps
    pub new_fields: usize,
}

/// Downloaded files of one URL, waiting to be read
struct FileGroup {
    entry: CatalogEntry,
    fetched_at: NaiveDateTime,
    files: Vec<PathBuf>,
    /// Header metadata of `files`, filled before reconciliation
    metadata: Vec<FileMetadata>,
    /// Why the group cannot be read this cycle
    failure: Option<String>,
    elapsed: Duration,
}

pub struct Orchestrator {
    config: IngestConfig,
    sources: Vec<RemoteSource>,
    listing: ListingClient,
    downloader: Downloader,
    catalog: Catalog,
    registry: Arc<Registry>,
    sinks: Vec<Arc<dyn DatasetSink>>,
    concurrency: usize,
}

impl Orchestrator {
    /// Connect the catalog and the consumer store and load the registry
    pub async fn from_config(config: IngestConfig) -> Result<Self> {
        let catalog = Catalog::connect(&config.catalog_db_url).await?;
        let registry = Registry::load(&config.templates_path, &config.mappings_path)?;

        let store: Arc<dyn DatasetSink> = if config.store_db_url == config.catalog_db_url {
            Arc::new(SqliteSink::from_pool(catalog.pool().clone(), config.load_mode))
        } else {
            Arc::new(SqliteSink::connect(&config.store_db_url, config.load_mode).await?)
        };
        let mut sinks = vec![store];
        if config.write_csv {
            sinks.push(Arc::new(CsvPartitionSink::new(&config.output_folder)));
        }

        Self::new(config, catalog, registry, sinks)
    }

    pub fn new(
        config: IngestConfig,
        catalog: Catalog,
        registry: Registry,
        sinks: Vec<Arc<dyn DatasetSink>>,
    ) -> Result<Self> {
        config.validate()?;
        let sources = RemoteSource::standard(&config.cvm_base_url)?;
        let listing = ListingClient::new(config.http_timeout())?;
        let downloader = Downloader::new(
            &config.history_folder,
            config.download_timeout(),
            config.source_encoding()?,
            config.target_encoding()?,
        )?;
        let concurrency = worker_count(config.parallelize);

        Ok(Self {
            config,
            sources,
            listing,
            downloader,
            catalog,
            registry: Arc::new(registry),
            sinks,
            concurrency,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run one full sync -> fetch -> reconcile -> read -> load cycle
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let started = Instant::now();
        let mut report = CycleReport::default();

        Arc::make_mut(&mut self.registry).reload_mappings(&self.config.mappings_path)?;
        self.sync_sources(&mut report).await?;
        let mut groups = self.download_pending(&mut report).await?;
        inspect_groups(&mut groups).await?;
        self.reconcile_groups(&mut groups)?;

        let (failed, groups): (Vec<FileGroup>, Vec<FileGroup>) =
            groups.into_iter().partition(|g| g.failure.is_some());
        for group in failed {
            error!(url = %group.entry.url, error = ?group.failure, "Cannot read artifact");
            report
                .entries
                .push(entry_for(&group.entry, ReportStatus::Error, group.failure, group.elapsed));
        }

        let unreviewed = self.unreviewed_fields(&groups);
        if self.config.halt_on_new_fields && !unreviewed.is_empty() {
            report.halted = true;
            warn!(
                mappings = %self.config.mappings_path.display(),
                fields = %unreviewed.join(", "),
                "Unmapped source fields; fill target_field (or clear is_new) in the mappings table to resume reading"
            );
            for group in &groups {
                report.entries.push(entry_for(
                    &group.entry,
                    ReportStatus::Halted,
                    Some("read skipped: new fields pending review".to_string()),
                    group.elapsed,
                ));
            }
        } else {
            self.process_groups(groups, &mut report).await?;
        }

        info!(
            elapsed_secs = started.elapsed().as_secs_f64(),
            processed = report.count(ReportStatus::Processed),
            skipped = report.count(ReportStatus::Skipped),
            errors = report.count(ReportStatus::Error),
            halted = report.halted,
            "CVM cycle complete"
        );
        Ok(report)
    }

    /// List each source and merge it into the catalog
    async fn sync_sources(&self, report: &mut CycleReport) -> Result<()> {
        for source in &self.sources {
            let started = Instant::now();
            let listed = match self.listing.list(&source.url).await {
                Ok(listed) => listed,
                Err(e) => {
                    // Without a listing the source keeps its catalog rows untouched
                    warn!(url = %source.url, error = %e, "Listing failed");
                    report.entries.push(ReportEntry {
                        url: source.url.to_string(),
                        status: ReportStatus::Error,
                        kind: source.kind.to_string(),
                        name: String::new(),
                        message: Some(e.to_string()),
                        rows: 0,
                        elapsed: started.elapsed(),
                    });
                    continue;
                },
            };

            let artifacts: Vec<ArtifactDescriptor> = listed
                .iter()
                .filter_map(|entry| ArtifactDescriptor::from_listing(source, entry))
                .collect();
            self.catalog
                .merge(source.url.as_str(), &artifacts, timestamp::now())
                .await?;
        }
        Ok(())
    }

    /// Fetch every pending entry and journal the fully successful ones
    async fn download_pending(&self, report: &mut CycleReport) -> Result<Vec<FileGroup>> {
        let pending = self.catalog.pending().await?;
        info!(
            pending = pending.len(),
            concurrency = self.concurrency,
            "Fetching pending artifacts"
        );

        let downloader = &self.downloader;
        let results: Vec<(CatalogEntry, Vec<DownloadOutcome>)> = stream::iter(pending)
            .map(|entry| async move {
                let outcomes = downloader.fetch(&entry).await;
                (entry, outcomes)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut groups = Vec::new();
        let mut downloaded = Vec::new();
        for (entry, outcomes) in results {
            let elapsed = outcomes.iter().map(|o| o.elapsed).max().unwrap_or_default();
            if outcomes.iter().all(|o| o.status == OutcomeStatus::Skipped) {
                report.entries.push(entry_for(&entry, ReportStatus::Skipped, None, elapsed));
                continue;
            }

            report.attempted += 1;
            if let Some(failed) = outcomes.iter().find(|o| !o.is_success()) {
                report.failed_downloads += 1;
                report
                    .entries
                    .push(entry_for(&entry, ReportStatus::Error, failed.message.clone(), elapsed));
                continue;
            }

            let fetched_at = outcomes
                .iter()
                .map(|o| o.fetched_at)
                .min()
                .unwrap_or_else(timestamp::now);
            downloaded.push((entry.url.clone(), fetched_at));
            groups.push(FileGroup {
                files: outcomes.into_iter().filter_map(|o| o.path).collect(),
                metadata: Vec::new(),
                failure: None,
                entry,
                fetched_at,
                elapsed,
            });
        }

        self.catalog.mark_downloaded(&downloaded).await?;
        groups.sort_by(|a, b| a.entry.url.cmp(&b.entry.url));
        Ok(groups)
    }

    /// Reconcile unknown headers among the downloaded files. A group whose
    /// header cannot be reconciled is marked failed with that error.
    fn reconcile_groups(&mut self, groups: &mut [FileGroup]) -> Result<()> {
        let metadata: Vec<FileMetadata> = groups.iter().flat_map(|g| g.metadata.clone()).collect();
        let unknown: Vec<FileMetadata> = self.registry.drift(&metadata).into_iter().cloned().collect();
        if unknown.is_empty() {
            return Ok(());
        }
        info!(unknown = unknown.len(), "Header drift detected");

        let registry = Arc::make_mut(&mut self.registry);
        let mut new_rows = Vec::new();
        for file in &unknown {
            match registry.reconcile_file(file) {
                Ok(rows) => new_rows.extend(rows),
                Err(e) => {
                    warn!(file = %file.path.display(), error = %e, "Cannot reconcile header");
                    let message = e.to_string();
                    for group in groups.iter_mut() {
                        if group.failure.is_none()
                            && group.metadata.iter().any(|m| m.fingerprint == file.fingerprint)
                        {
                            group.failure = Some(message.clone());
                        }
                    }
                },
            }
        }

        registry::persist(&new_rows, &self.config.mappings_path)?;
        Ok(())
    }

    /// `source_field`s still awaiting a target among the groups' headers
    fn unreviewed_fields(&self, groups: &[FileGroup]) -> Vec<String> {
        let mut fields: Vec<String> = groups
            .iter()
            .flat_map(|g| &g.metadata)
            .flat_map(|m| self.registry.unreviewed(&m.fingerprint))
            .filter_map(|row| row.source_field.clone())
            .collect();
        fields.sort();
        fields.dedup();
        fields
    }

    /// Read every group on worker tasks and write its datasets; journal
    /// fully loaded URLs
    async fn process_groups(&self, groups: Vec<FileGroup>, report: &mut CycleReport) -> Result<()> {
        let reader = FileReader::new(
            Arc::clone(&self.registry),
            self.config.target_encoding()?,
            self.config.check_header,
        );

        let read: Vec<(FileGroup, Duration, Result<Vec<ReadResult>>)> = stream::iter(groups)
            .map(|group| {
                let reader = reader.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    let mut results = Vec::with_capacity(group.files.len());
                    for path in &group.files {
                        match reader.read(path).await {
                            Ok(result) => results.push(result),
                            Err(e) => return (group, started.elapsed(), Err(e)),
                        }
                    }
                    (group, started.elapsed(), Ok(results))
                })
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<std::result::Result<_, _>>()?;

        let mut processed = Vec::new();
        for (group, read_elapsed, results) in read {
            let elapsed = group.elapsed + read_elapsed;
            let results = match results {
                Ok(results) => results,
                Err(e) => {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    error!(url = %group.entry.url, error = %e, "Read failed");
                    report
                        .entries
                        .push(entry_for(&group.entry, ReportStatus::Error, Some(e.to_string()), elapsed));
                    continue;
                },
            };

            let mut rows = 0;
            let mut failure = None;
            for result in &results {
                match self.load(result).await {
                    Ok(()) => rows += result.dataset.len(),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    },
                }
            }

            match failure {
                None => {
                    processed.push((group.entry.url.clone(), group.fetched_at));
                    let mut entry = entry_for(
                        &group.entry,
                        ReportStatus::Processed,
                        Some(format!("{} file(s)", results.len())),
                        elapsed,
                    );
                    entry.rows = rows;
                    report.entries.push(entry);
                },
                Some(e) => {
                    error!(url = %group.entry.url, error = %e, "Load failed");
                    report
                        .entries
                        .push(entry_for(&group.entry, ReportStatus::Error, Some(e.to_string()), elapsed));
                },
            }
        }

        self.catalog.mark_processed(&processed).await?;
        Ok(())
    }

    /// Write one dataset to every sink
    async fn load(&self, result: &ReadResult) -> Result<()> {
        let target = DatasetTarget::new(result.kind.as_str(), &result.sub_kind, result.source_stem());
        for sink in &self.sinks {
            sink.write(&target, &result.dataset).await?;
        }
        Ok(())
    }

    /// Scan the history folder for headers the registry does not know
    pub async fn check_drift(&mut self, reconcile: bool) -> Result<DriftSummary> {
        let files = history_files(&self.config.history_folder).await?;
        let inspected = blocking(move || {
            Ok(files
                .into_iter()
                .map(|path| {
                    let meta = filename::inspect(&path);
                    (path, meta)
                })
                .collect::<Vec<_>>())
        })
        .await?;
        let mut metadata = Vec::with_capacity(inspected.len());
        for (path, meta) in inspected {
            match meta {
                Ok(meta) => metadata.push(meta),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping file"),
            }
        }

        let mut summary = DriftSummary {
            scanned: metadata.len(),
            unknown: self.registry.drift(&metadata).into_iter().cloned().collect(),
            ..Default::default()
        };
        if reconcile && !summary.unknown.is_empty() {
            let rows = Arc::make_mut(&mut self.registry).reconcile(&summary.unknown)?;
            summary.new_fields = rows.iter().filter(|r| r.is_new).count();
            summary.persisted = registry::persist(&rows, &self.config.mappings_path)?;
        }
        Ok(summary)
    }
}

/// Workers for fetch and read phases
pub fn worker_count(parallelize: bool) -> usize {
    if !parallelize {
        return 1;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Read the header of every downloaded file; a file that cannot be
/// inspected fails its group
async fn inspect_groups(groups: &mut [FileGroup]) -> Result<()> {
    let paths: Vec<Vec<PathBuf>> = groups.iter().map(|g| g.files.clone()).collect();
    let inspected = blocking(move || {
        Ok(paths
            .iter()
            .map(|files| files.iter().map(|p| filename::inspect(p)).collect::<Result<Vec<_>>>())
            .collect::<Vec<_>>())
    })
    .await?;

    for (group, metadata) in groups.iter_mut().zip(inspected) {
        match metadata {
            Ok(metadata) => group.metadata = metadata,
            Err(e) => {
                warn!(url = %group.entry.url, error = %e, "Cannot inspect downloaded file");
                group.failure = Some(e.to_string());
            },
        }
    }
    Ok(())
}

/// Regular files of the history folder, sorted by name
async fn history_files(folder: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut dir = match tokio::fs::read_dir(folder).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(CvmError::from(e)),
    };
    while let Some(item) = dir.next_entry().await? {
        if item.file_type().await?.is_file() {
            files.push(item.path());
        }
    }
    files.sort();
    Ok(files)
}

fn entry_for(
    entry: &CatalogEntry,
    status: ReportStatus,
    message: Option<String>,
    elapsed: Duration,
) -> ReportEntry {
    ReportEntry {
        url: entry.url.clone(),
        status,
        kind: entry.kind.clone(),
        name: entry.name.clone(),
        message,
        rows: 0,
        elapsed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: ReportStatus) -> ReportEntry {
        ReportEntry {
            url: "https://x/a.csv".to_string(),
            status,
            kind: "position".to_string(),
            name: "a".to_string(),
            message: None,
            rows: 0,
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn test_failure_only_when_every_download_failed() {
        let mut report = CycleReport::default();
        assert!(!report.is_failure());

        report.attempted = 2;
        report.failed_downloads = 1;
        assert!(!report.is_failure());

        report.failed_downloads = 2;
        assert!(report.is_failure());
    }

    #[test]
    fn test_status_counts() {
        let report = CycleReport {
            entries: vec![
                entry(ReportStatus::Processed),
                entry(ReportStatus::Processed),
                entry(ReportStatus::Skipped),
            ],
            ..Default::default()
        };
        assert_eq!(report.count(ReportStatus::Processed), 2);
        assert_eq!(report.count(ReportStatus::Skipped), 1);
        assert_eq!(report.count(ReportStatus::Error), 0);
    }

    #[test]
    fn test_worker_count() {
        assert_eq!(worker_count(false), 1);
        assert!(worker_count(true) >= 1);
    }

    #[tokio::test]
    async fn test_history_files_missing_folder_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let files = history_files(&dir.path().join("missing")).await.unwrap();
        assert!(files.is_empty());

        std::fs::write(dir.path().join("b.csv"), "x").unwrap();
        std::fs::write(dir.path().join("a.csv"), "x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let files = history_files(dir.path()).await.unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a.csv"));
    }
}
