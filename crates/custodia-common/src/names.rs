//! File name grammar for dated extracts
//!
//! Custody statements are exported as `<type>-<date>[-a-<date>].xlsx`, where
//! each date is either `YYYY-MM-DD` or `YYYY-MM-DD-HH-MM-SS`. A range keeps
//! the upper bound as the reference date.

use crate::error::{CustodiaError, Result};
use chrono::{NaiveDate, NaiveDateTime};
use std::path::Path;

/// Kind and reference instant derived from a dated file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatedName {
    pub kind: String,
    pub reference: NaiveDateTime,
}

impl DatedName {
    pub fn reference_date(&self) -> NaiveDate {
        self.reference.date()
    }
}

/// File name without directory and without any extension
pub fn base_name(path: &Path) -> Result<&str> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CustodiaError::invalid_name(path.display().to_string()))?;
    Ok(file_name.split('.').next().unwrap_or(file_name))
}

fn is_separator(byte: u8) -> bool {
    matches!(byte, b'-' | b'_')
}

/// Byte offset of the first separator-delimited four-digit token
fn first_year_token(base: &str) -> Option<usize> {
    let bytes = base.as_bytes();
    (0..bytes.len().saturating_sub(3)).find(|&start| {
        let end = start + 4;
        (start == 0 || is_separator(bytes[start - 1]))
            && bytes[start..end].iter().all(u8::is_ascii_digit)
            && (end == bytes.len() || is_separator(bytes[end]))
    })
}

/// Parse one of the two accepted date layouts
fn parse_date_token(token: &str) -> Option<NaiveDateTime> {
    match token.len() {
        10 => NaiveDate::parse_from_str(token, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0)),
        19 => NaiveDateTime::parse_from_str(token, "%Y-%m-%d-%H-%M-%S").ok(),
        _ => None,
    }
}

/// Split a dated file name into its kind and reference instant.
///
/// Never guesses: any deviation from the grammar is `InvalidName`.
pub fn parse_dated_name(path: &Path) -> Result<DatedName> {
    let base = base_name(path)?;
    let invalid = || CustodiaError::invalid_name(format!("'{}' is not <type>-<date>", base));

    let year_at = first_year_token(base).filter(|&at| at > 0).ok_or_else(invalid)?;
    let kind = &base[..year_at - 1];
    let mut token = &base[year_at..];
    if let Some((_, upper)) = token.split_once("-a-") {
        token = upper;
    }

    let reference = parse_date_token(token).ok_or_else(invalid)?;
    Ok(DatedName {
        kind: kind.to_string(),
        reference,
    })
}
