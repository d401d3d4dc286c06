//! Conversion primitives
//!
//! Pure string coercions used by both ingestion subsystems. Brazilian
//! spreadsheets use `.` as thousands separator and `,` as decimal mark, dates
//! in `DD/MM/YYYY`, and `-` as the "no value" marker. CVM open-data files use
//! plain `.` decimals and ISO dates, so both dialects are exposed.
//!
//! Every coercion is null-propagating: a missing, blank, NaN-like or `-`
//! input yields `Ok(None)` rather than an error.

use crate::error::{CustodiaError, Result};
use chrono::{NaiveDate, NaiveDateTime};

/// Markers that spreadsheet exports use for "not a number"
const NAN_MARKERS: &[&str] = &["nan", "nat", "none", "null", "<na>"];

/// The dash placeholder used by CEI and CVM exports for "no value"
pub const DASH: &str = "-";

/// True for null, empty or blank text, and NaN-equivalent markers
pub fn is_nullish(value: Option<&str>) -> bool {
    match value {
        None => true,
        Some(v) => {
            let trimmed = v.trim();
            trimmed.is_empty()
                || NAN_MARKERS
                    .iter()
                    .any(|marker| trimmed.eq_ignore_ascii_case(marker))
        },
    }
}

/// True when a converter should yield null: nullish input or the `-` marker
pub fn is_absent(value: Option<&str>) -> bool {
    is_nullish(value) || value.map(str::trim) == Some(DASH)
}

/// Replace runs of spaces until no two consecutive spaces remain
pub fn collapse_double_spaces(text: &str) -> String {
    let mut out = text.to_string();
    while out.contains("  ") {
        out = out.replace("  ", " ");
    }
    out
}

fn present(value: Option<&str>) -> Option<&str> {
    if is_absent(value) {
        None
    } else {
        value.map(str::trim)
    }
}

/// `DD/MM/YYYY` shaped text (digits and slashes in the right places)
fn looks_like_br_date(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() == 10
        && bytes[2] == b'/'
        && bytes[5] == b'/'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 2 || i == 5 || b.is_ascii_digit())
}

/// `YYYY-MM-DD` shaped text
fn looks_like_iso_date(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit())
}

/// Parse a `DD/MM/YYYY` date.
///
/// Text that is not shaped like `DD/MM/YYYY` yields `None`; text that is
/// shaped like it but is not a calendar date (`31/02/2024`) is an error.
pub fn to_date(value: Option<&str>) -> Result<Option<NaiveDate>> {
    let Some(text) = present(value) else {
        return Ok(None);
    };
    if !looks_like_br_date(text) {
        return Ok(None);
    }
    NaiveDate::parse_from_str(text, "%d/%m/%Y")
        .map(Some)
        .map_err(|_| CustodiaError::parse(text, "date (DD/MM/YYYY)"))
}

/// Parse a `YYYY-MM-DD` date; anything else that is not absent is an error
pub fn to_iso_date(value: Option<&str>) -> Result<Option<NaiveDate>> {
    let Some(text) = present(value) else {
        return Ok(None);
    };
    if !looks_like_iso_date(text) {
        return Err(CustodiaError::parse(text, "date (YYYY-MM-DD)"));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| CustodiaError::parse(text, "date (YYYY-MM-DD)"))
}

/// Parse a date written either as `YYYY-MM-DD` or `DD/MM/YYYY`
pub fn to_any_date(value: Option<&str>) -> Result<Option<NaiveDate>> {
    let Some(text) = present(value) else {
        return Ok(None);
    };
    if looks_like_br_date(text) {
        return to_date(Some(text));
    }
    to_iso_date(Some(text))
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

/// Parse a date-time in ISO or Brazilian layout; a bare date means midnight
pub fn to_datetime(value: Option<&str>) -> Result<Option<NaiveDateTime>> {
    let Some(text) = present(value) else {
        return Ok(None);
    };
    for format in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(Some(parsed));
        }
    }
    match to_any_date(Some(text)) {
        Ok(Some(date)) => Ok(date.and_hms_opt(0, 0, 0)),
        _ => Err(CustodiaError::parse(text, "datetime")),
    }
}

fn parse_decimal(original: &str, cleaned: &str) -> Result<f64> {
    let numeric = !cleaned.is_empty()
        && cleaned.chars().any(|c| c.is_ascii_digit())
        && cleaned
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'));
    if !numeric {
        return Err(CustodiaError::parse(original, "number"));
    }
    cleaned
        .parse::<f64>()
        .map_err(|_| CustodiaError::parse(original, "number"))
}

/// Parse a number in Brazilian locale (`1.234,56`), tolerating an `R$` prefix
pub fn to_number(value: Option<&str>) -> Result<Option<f64>> {
    let Some(text) = present(value) else {
        return Ok(None);
    };
    let cleaned: String = text
        .trim_start_matches("R$")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '.')
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    parse_decimal(text, &cleaned).map(Some)
}

/// Parse a number with `.` as decimal mark and no grouping (`1234.56`)
pub fn to_plain_number(value: Option<&str>) -> Result<Option<f64>> {
    let Some(text) = present(value) else {
        return Ok(None);
    };
    parse_decimal(text, text).map(Some)
}

/// Brazilian-locale number truncated toward zero
pub fn to_integer(value: Option<&str>) -> Result<Option<i64>> {
    Ok(to_number(value)?.map(|n| n.trunc() as i64))
}

/// Plain number truncated toward zero
pub fn to_plain_integer(value: Option<&str>) -> Result<Option<i64>> {
    Ok(to_plain_number(value)?.map(|n| n.trunc() as i64))
}

/// Interpret `S`/`N` flags (and the usual spelled-out variants)
pub fn to_bool(value: Option<&str>) -> Result<Option<bool>> {
    let Some(text) = present(value) else {
        return Ok(None);
    };
    match text.to_lowercase().as_str() {
        "s" | "sim" | "y" | "yes" | "true" | "1" => Ok(Some(true)),
        "n" | "não" | "nao" | "no" | "false" | "0" => Ok(Some(false)),
        _ => Err(CustodiaError::parse(text, "boolean (S/N)")),
    }
}

/// Trimmed text with double spaces collapsed; absent values become `None`
pub fn to_clean_string(value: Option<&str>) -> Option<String> {
    present(value).map(collapse_double_spaces)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_to_date_brazilian() {
        assert_eq!(
            to_date(Some("05/01/2024")).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 5)
        );
        assert_eq!(to_date(Some("-")).unwrap(), None);
        assert_eq!(to_date(Some("")).unwrap(), None);
        assert_eq!(to_date(None).unwrap(), None);
        assert_eq!(to_date(Some("2024-01-05")).unwrap(), None);
        assert!(to_date(Some("31/02/2024")).is_err());
    }

    #[test]
    fn test_to_iso_date() {
        assert_eq!(
            to_iso_date(Some("2024-01-31")).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31)
        );
        assert!(to_iso_date(Some("31/01/2024")).is_err());
        assert_eq!(
            to_any_date(Some("31/01/2024")).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31)
        );
    }

    #[test]
    fn test_to_datetime_layouts() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 5)
            .unwrap()
            .and_hms_opt(10, 30, 0);
        assert_eq!(to_datetime(Some("2024-01-05 10:30:00")).unwrap(), expected);
        assert_eq!(to_datetime(Some("05/01/2024 10:30")).unwrap(), expected);
        assert!(to_datetime(Some("yesterday")).is_err());
    }

    #[test]
    fn test_to_number_brazilian_locale() {
        assert_eq!(to_number(Some("1.234,56")).unwrap(), Some(1234.56));
        assert_eq!(to_number(Some("R$ 10,00")).unwrap(), Some(10.0));
        assert_eq!(to_number(Some("-3,5")).unwrap(), Some(-3.5));
        assert_eq!(to_number(Some("-")).unwrap(), None);
        assert_eq!(to_number(Some("NaN")).unwrap(), None);
        assert!(to_number(Some("not-a-number")).is_err());
        assert!(to_number(Some("inf")).is_err());
    }

    #[test]
    fn test_to_plain_number() {
        assert_eq!(to_plain_number(Some("1.234567")).unwrap(), Some(1.234567));
        assert!(to_plain_number(Some("1,5")).is_err());
    }

    #[test]
    fn test_to_integer_truncates_toward_zero() {
        assert_eq!(to_integer(Some("10,9")).unwrap(), Some(10));
        assert_eq!(to_integer(Some("-10,9")).unwrap(), Some(-10));
        assert_eq!(to_plain_integer(Some("42")).unwrap(), Some(42));
        assert_eq!(to_integer(Some("")).unwrap(), None);
    }

    #[test]
    fn test_to_bool() {
        assert_eq!(to_bool(Some("S")).unwrap(), Some(true));
        assert_eq!(to_bool(Some("N")).unwrap(), Some(false));
        assert_eq!(to_bool(Some("-")).unwrap(), None);
        assert!(to_bool(Some("talvez")).is_err());
    }

    #[test]
    fn test_is_nullish() {
        assert!(is_nullish(None));
        assert!(is_nullish(Some("   ")));
        assert!(is_nullish(Some("NaN")));
        assert!(!is_nullish(Some("-")));
        assert!(is_absent(Some(" - ")));
        assert!(!is_nullish(Some("0")));
    }

    #[test]
    fn test_clean_string() {
        assert_eq!(
            to_clean_string(Some("  BANCO   DO  BRASIL ")),
            Some("BANCO DO BRASIL".to_string())
        );
        assert_eq!(to_clean_string(Some("-")), None);
    }

    proptest! {
        #[test]
        fn prop_collapse_is_idempotent(s in "[ a-z]{0,40}") {
            let once = collapse_double_spaces(&s);
            prop_assert!(!once.contains("  "));
            prop_assert_eq!(collapse_double_spaces(&once), once.clone());
        }

        #[test]
        fn prop_brazilian_numbers_round_trip(n in -1_000_000i64..1_000_000, cents in 0u32..100) {
            let text = format!("{},{:02}", n, cents);
            let parsed = to_number(Some(&text)).unwrap().unwrap();
            let expected = n as f64 + (cents as f64 / 100.0) * if n < 0 { -1.0 } else { 1.0 };
            prop_assert!((parsed - expected).abs() < 1e-6);
        }
    }
}
