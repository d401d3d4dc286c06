//! Metadata of downloaded CVM artifacts
//!
//! History files are named `<kind>.<name>[.<index>].<ext>`. The kind and
//! name give the sub-kind and the reference date token; the first line of
//! the file gives the header and its fingerprint.
//!
//! Archive members keep the archive's name plus an index, so the member's
//! own name is recorded under [`MEMBERS_DIR`] next to them. A recognised
//! member name decides the sub-kind (`cad_fi_hist.zip` holds one file per
//! historical register aspect).

use custodia_common::checksum;
use encoding_rs::{UTF_8, WINDOWS_1252};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use super::models::ArtifactKind;
use super::{CvmError, Result};

pub const SUB_KIND_REGISTER_CURRENT: &str = "register-current";
pub const SUB_KIND_REGISTER_HISTORICAL: &str = "register-historical";
pub const SUB_KIND_POSITION_DAILY: &str = "position-daily";

/// Sub-folder of the history folder holding archive member names
pub const MEMBERS_DIR: &str = ".members";

/// Everything the reader needs to know about a history file before parsing it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub path: PathBuf,
    pub kind: ArtifactKind,
    pub name: String,
    pub sub_kind: String,
    /// Trailing `YYYYMMDD`, `YYYYMM` or `YYYY` digits of the name
    pub date_token: Option<String>,
    /// First line without its terminator
    pub header: String,
    pub fingerprint: String,
}

/// Parsed pieces of a history file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryName {
    pub kind: ArtifactKind,
    pub name: String,
    pub index: Option<u32>,
    pub extension: String,
}

/// Split `<kind>.<name>[.<index>].<ext>`; never guesses
pub fn parse_history_name(path: &Path) -> Result<HistoryName> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CvmError::InvalidName(path.display().to_string()))?;
    let invalid = || {
        CvmError::InvalidName(format!(
            "'{}' is not <kind>.<name>[.<index>].<ext>",
            file_name
        ))
    };

    let tokens: Vec<&str> = file_name.split('.').collect();
    let (kind, name, index, extension) = match tokens.as_slice() {
        [kind, name, ext] => (*kind, *name, None, *ext),
        [kind, name, index, ext] => {
            if index.len() != 4 || !index.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            (*kind, *name, Some(index.parse::<u32>().map_err(|_| invalid())?), *ext)
        },
        _ => return Err(invalid()),
    };

    let kind = match kind {
        "register" => ArtifactKind::Register,
        "position" => ArtifactKind::Position,
        _ => return Err(invalid()),
    };
    if name.is_empty() || extension.is_empty() {
        return Err(invalid());
    }

    Ok(HistoryName {
        kind,
        name: name.to_string(),
        index,
        extension: extension.to_string(),
    })
}

/// Logical table of a file, derived from its base name
pub fn sub_kind_for(name: &str) -> String {
    known_sub_kind(name).unwrap_or_else(|| name.to_uppercase())
}

/// Sub-kind of one of the published file families, if `name` is one
fn known_sub_kind(name: &str) -> Option<String> {
    let lower = name.to_lowercase();
    if lower == "cad_fi" || lower.starts_with("inf_cadastral_fi") {
        Some(SUB_KIND_REGISTER_CURRENT.to_string())
    } else if lower.starts_with("inf_diario_fi") {
        Some(SUB_KIND_POSITION_DAILY.to_string())
    } else if let Some(aspect) = lower.strip_prefix("cad_fi_hist_") {
        Some(format!("{}-{}", SUB_KIND_REGISTER_HISTORICAL, aspect))
    } else if lower == "cad_fi_hist" {
        Some(SUB_KIND_REGISTER_HISTORICAL.to_string())
    } else {
        None
    }
}

/// Where the member name of an expanded history file is recorded
pub fn member_record(path: &Path) -> Option<PathBuf> {
    let file_name = path.file_name()?;
    Some(path.parent()?.join(MEMBERS_DIR).join(file_name))
}

/// Archive member a history file was expanded from, if recorded
pub fn archive_member(path: &Path) -> Option<String> {
    let record = member_record(path)?;
    let member = std::fs::read_to_string(record).ok()?;
    let member = member.trim();
    (!member.is_empty()).then(|| member.to_string())
}

/// Sub-kind from an archive member path such as `2023/cad_fi_hist_sit.csv`
fn member_sub_kind(member: &str) -> Option<String> {
    let file = member.rsplit(['/', '\\']).next().unwrap_or(member);
    let stem = file.rsplit_once('.').map_or(file, |(stem, _)| stem);
    known_sub_kind(stem)
}

/// Trailing date digits of a name (`inf_diario_fi_202401` -> `202401`)
pub fn date_token(name: &str) -> Option<&str> {
    let (_, tail) = name.rsplit_once('_')?;
    let is_date = matches!(tail.len(), 4 | 6 | 8) && tail.bytes().all(|b| b.is_ascii_digit());
    is_date.then_some(tail)
}

/// SHA-256 of `<kind>;<sub-kind>;<header>`
pub fn fingerprint(kind: ArtifactKind, sub_kind: &str, header: &str) -> String {
    checksum::hash(&format!("{};{};{}", kind.as_str(), sub_kind, header))
}

/// Decode a raw line as UTF-8, falling back to Latin-1
pub fn decode_header_line(bytes: &[u8]) -> String {
    let mut line = bytes;
    while let Some((last, rest)) = line.split_last() {
        if *last == b'\n' || *last == b'\r' {
            line = rest;
        } else {
            break;
        }
    }
    let text = match UTF_8.decode_without_bom_handling_and_without_replacement(line) {
        Some(text) => text.into_owned(),
        None => WINDOWS_1252.decode_without_bom_handling(line).0.into_owned(),
    };
    text.trim_start_matches('\u{feff}').to_string()
}

/// First line of a file; empty for an empty file
pub fn read_header(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line)?;
    Ok(decode_header_line(&line))
}

/// Name, sub-kind, header and fingerprint of a history file
pub fn inspect(path: &Path) -> Result<FileMetadata> {
    let parsed = parse_history_name(path)?;
    let sub_kind = archive_member(path)
        .and_then(|member| member_sub_kind(&member))
        .unwrap_or_else(|| sub_kind_for(&parsed.name));
    let header = read_header(path)?;
    let fingerprint = fingerprint(parsed.kind, &sub_kind, &header);

    Ok(FileMetadata {
        path: path.to_path_buf(),
        kind: parsed.kind,
        date_token: date_token(&parsed.name).map(str::to_string),
        name: parsed.name,
        sub_kind,
        header,
        fingerprint,
    })
}
