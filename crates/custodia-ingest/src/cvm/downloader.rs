//! Artifact downloader
//!
//! Fetches one catalog entry, classifies the payload, transcodes text to the
//! target encoding and expands archives member by member into the history
//! folder. Every failure becomes an outcome; nothing here aborts a cycle.

use chrono::NaiveDateTime;
use encoding_rs::{Encoding, UTF_8};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::filename;
use super::models::CatalogEntry;
use super::{blocking, timestamp, CvmError, Result};
use crate::cvm::listing::USER_AGENT;

const ZIP_LOCAL_HEADER: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_ARCHIVE: &[u8] = b"PK\x05\x06";

/// How a payload will be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadClass {
    Archive,
    Text,
    Unsupported,
}

/// Classify by magic bytes, then Content-Type, then URL extension
pub fn classify(bytes: &[u8], content_type: Option<&str>, url: &str) -> PayloadClass {
    if bytes.starts_with(ZIP_LOCAL_HEADER) || bytes.starts_with(ZIP_EMPTY_ARCHIVE) {
        return PayloadClass::Archive;
    }

    if let Some(mime) = content_type.and_then(|ct| ct.parse::<mime::Mime>().ok()) {
        match (mime.type_(), mime.subtype().as_str()) {
            (mime::APPLICATION, "zip") | (mime::APPLICATION, "x-zip-compressed") => {
                return PayloadClass::Archive
            },
            (mime::TEXT, _) | (mime::APPLICATION, "csv") => return PayloadClass::Text,
            _ => {},
        }
    }

    let path = url.split(['?', '#']).next().unwrap_or(url);
    let extension = path
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_lowercase());
    match extension.as_deref() {
        Some("zip") => PayloadClass::Archive,
        Some("csv") | Some("txt") => PayloadClass::Text,
        _ => PayloadClass::Unsupported,
    }
}

/// `<kind>.<name>.<ext>` or `<kind>.<name>.<NNNN>.<ext>` for archive members
pub fn history_name(kind: &str, name: &str, index: Option<usize>, extension: &str) -> String {
    let name = name.replace('.', "_");
    let extension = extension.to_lowercase();
    match index {
        Some(index) => format!("{}.{}.{:04}.{}", kind, name, index, extension),
        None => format!("{}.{}.{}", kind, name, extension),
    }
}

fn extension_of(name: &str) -> Option<String> {
    let file = name.rsplit(['/', '\\']).next().unwrap_or(name);
    file.rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
}

/// Final state of one downloaded (or skipped) item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Success,
    Skipped,
    Error,
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Skipped => "skipped",
            OutcomeStatus::Error => "error",
        })
    }
}

/// One outcome per written file (or one per URL when nothing was written)
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub url: String,
    pub status: OutcomeStatus,
    pub path: Option<PathBuf>,
    pub message: Option<String>,
    pub fetched_at: NaiveDateTime,
    pub elapsed: Duration,
}

impl DownloadOutcome {
    fn new(url: &str, status: OutcomeStatus, fetched_at: NaiveDateTime, started: Instant) -> Self {
        Self {
            url: url.to_string(),
            status,
            path: None,
            message: None,
            fetched_at,
            elapsed: started.elapsed(),
        }
    }

    fn error(url: &str, err: &CvmError, fetched_at: NaiveDateTime, started: Instant) -> Self {
        let mut outcome = Self::new(url, OutcomeStatus::Error, fetched_at, started);
        outcome.message = Some(err.to_string());
        outcome
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

/// Conditional fetcher writing into the history folder
pub struct Downloader {
    client: Client,
    history: PathBuf,
    source_encoding: &'static Encoding,
    target_encoding: &'static Encoding,
}

impl Downloader {
    pub fn new(
        history: impl Into<PathBuf>,
        timeout: Duration,
        source_encoding: &'static Encoding,
        target_encoding: &'static Encoding,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            history: history.into(),
            source_encoding,
            target_encoding,
        })
    }

    pub fn history(&self) -> &Path {
        &self.history
    }

    /// Fetch one entry; never fails, every problem is an outcome
    pub async fn fetch(&self, entry: &CatalogEntry) -> Vec<DownloadOutcome> {
        let started = Instant::now();
        let fetched_at = timestamp::now();

        if !entry.needs_processing {
            debug!(url = %entry.url, "Up to date, skipping");
            return vec![DownloadOutcome::new(
                &entry.url,
                OutcomeStatus::Skipped,
                fetched_at,
                started,
            )];
        }

        match self.try_fetch(entry, fetched_at, started).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!(url = %entry.url, error = %e, "Download failed");
                vec![DownloadOutcome::error(&entry.url, &e, fetched_at, started)]
            },
        }
    }

    async fn try_fetch(
        &self,
        entry: &CatalogEntry,
        fetched_at: NaiveDateTime,
        started: Instant,
    ) -> Result<Vec<DownloadOutcome>> {
        let response = self.client.get(&entry.url).send().await?;
        if !response.status().is_success() {
            return Err(CvmError::Network(format!(
                "HTTP {} for {}",
                response.status(),
                entry.url
            )));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?;

        tokio::fs::create_dir_all(&self.history).await?;

        match classify(&bytes, content_type.as_deref(), &entry.url) {
            PayloadClass::Text => {
                let extension = extension_of(&entry.url).unwrap_or_else(|| "csv".to_string());
                let name = history_name(&entry.kind, &entry.name, None, &extension);
                let path = self.history.join(name);
                let (source, target) = (self.source_encoding, self.target_encoding);
                let raw = bytes.clone();
                let encoded = blocking(move || transcode(&raw, source, target)).await?;
                tokio::fs::write(&path, encoded).await?;

                info!(url = %entry.url, path = %path.display(), bytes = bytes.len(), "Downloaded text artifact");
                let mut outcome =
                    DownloadOutcome::new(&entry.url, OutcomeStatus::Success, fetched_at, started);
                outcome.path = Some(path);
                Ok(vec![outcome])
            },
            PayloadClass::Archive => {
                let outcomes = self.expand_archive(entry, bytes.to_vec(), fetched_at, started).await?;
                info!(url = %entry.url, members = outcomes.len(), "Expanded archive");
                Ok(outcomes)
            },
            PayloadClass::Unsupported => Err(CvmError::Decode(format!(
                "unknown-mime: {} ({})",
                content_type.as_deref().unwrap_or("no content type"),
                entry.url
            ))),
        }
    }

    async fn expand_archive(
        &self,
        entry: &CatalogEntry,
        bytes: Vec<u8>,
        fetched_at: NaiveDateTime,
        started: Instant,
    ) -> Result<Vec<DownloadOutcome>> {
        let history = self.history.clone();
        let (kind, name) = (entry.kind.clone(), entry.name.clone());
        let (source, target) = (self.source_encoding, self.target_encoding);
        let members = blocking(move || expand_members(&history, &kind, &name, bytes, source, target)).await?;

        let mut outcomes = Vec::with_capacity(members.len());
        for member in members {
            match member {
                Ok((member_name, path)) => {
                    debug!(url = %entry.url, member = %member_name, path = %path.display(), "Wrote archive member");
                    let mut outcome =
                        DownloadOutcome::new(&entry.url, OutcomeStatus::Success, fetched_at, started);
                    outcome.path = Some(path);
                    outcomes.push(outcome);
                },
                Err((index, e)) => {
                    warn!(url = %entry.url, member = index, error = %e, "Archive member failed");
                    outcomes.push(DownloadOutcome::error(&entry.url, &e, fetched_at, started));
                },
            }
        }

        if outcomes.is_empty() {
            return Err(CvmError::CorruptArchive(format!(
                "{} contains no files",
                entry.url
            )));
        }
        Ok(outcomes)
    }
}

/// A written member (its archive name and history path), or its index and error
type MemberResult = std::result::Result<(String, PathBuf), (usize, CvmError)>;

/// Write every file member of an archive into `history`, recording each
/// member's name under [`filename::MEMBERS_DIR`]
fn expand_members(
    history: &Path,
    kind: &str,
    name: &str,
    bytes: Vec<u8>,
    source: &'static Encoding,
    target: &'static Encoding,
) -> Result<Vec<MemberResult>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    std::fs::create_dir_all(history.join(filename::MEMBERS_DIR))?;
    let mut members = Vec::new();
    let mut index = 0;

    for i in 0..archive.len() {
        let member = match archive.by_index(i) {
            Ok(file) if file.is_dir() => continue,
            Ok(mut file) => {
                let member_name = file.name().to_string();
                let mut raw = Vec::new();
                match file.read_to_end(&mut raw) {
                    Ok(_) => transcode(&raw, source, target).map(|content| (member_name, content)),
                    Err(e) => Err(CvmError::CorruptArchive(format!("{}: {}", member_name, e))),
                }
            },
            Err(e) => Err(CvmError::from(e)),
        };
        index += 1;

        let written = member.and_then(|(member_name, content)| -> Result<(String, PathBuf)> {
            let extension = extension_of(&member_name).unwrap_or_else(|| "csv".to_string());
            let path = history.join(history_name(kind, name, Some(index), &extension));
            std::fs::write(&path, content)?;
            if let Some(record) = filename::member_record(&path) {
                std::fs::write(record, &member_name)?;
            }
            Ok((member_name, path))
        });
        members.push(written.map_err(|e| (index, e)));
    }
    Ok(members)
}

/// Decode `bytes` strictly as `source`, else as UTF-8, then encode as `target`
pub fn transcode(bytes: &[u8], source: &'static Encoding, target: &'static Encoding) -> Result<Vec<u8>> {
    let text = source
        .decode_without_bom_handling_and_without_replacement(bytes)
        .or_else(|| UTF_8.decode_without_bom_handling_and_without_replacement(bytes))
        .ok_or_else(|| {
            CvmError::Decode(format!(
                "payload is neither {} nor UTF-8",
                source.name()
            ))
        })?;

    let (encoded, _, had_errors) = target.encode(&text);
    if had_errors {
        return Err(CvmError::Decode(format!(
            "payload has characters not representable in {}",
            target.name()
        )));
    }
    Ok(encoded.into_owned())
}

/// Resolve an encoding label such as `latin1` or `utf-8`
pub fn encoding_for(label: &str) -> Option<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
}
