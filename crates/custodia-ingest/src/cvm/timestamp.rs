//! Fixed-format instants stored in the catalog
//!
//! Every instant is written as `YYYY-MM-DD HH:MM:SS` text so that SQLite's
//! lexicographic comparison agrees with chronological order.

use super::{CvmError, Result};
use chrono::{NaiveDateTime, Timelike};

pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Length of every stored instant
pub const WIDTH: usize = 19;

/// Render an instant, dropping sub-second precision
pub fn format(instant: NaiveDateTime) -> String {
    instant.format(FORMAT).to_string()
}

/// Parse a stored instant; anything but the fixed layout is rejected
pub fn parse(text: &str) -> Result<NaiveDateTime> {
    if text.len() != WIDTH {
        return Err(CvmError::Storage(sqlx::Error::Decode(
            format!("'{}' is not a {} timestamp", text, FORMAT).into(),
        )));
    }
    NaiveDateTime::parse_from_str(text, FORMAT).map_err(|e| {
        CvmError::Storage(sqlx::Error::Decode(
            format!("'{}' is not a {} timestamp: {}", text, FORMAT, e).into(),
        ))
    })
}

/// Current wall-clock instant truncated to whole seconds
pub fn now() -> NaiveDateTime {
    let now = chrono::Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_format_is_fixed_width() {
        let instant = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_milli_opt(7, 5, 3, 999)
            .unwrap();
        let text = format(instant);
        assert_eq!(text, "2024-03-09 07:05:03");
        assert_eq!(text.len(), WIDTH);
    }

    #[test]
    fn test_parse_rejects_other_layouts() {
        assert!(parse("2024-03-09 07:05:03").is_ok());
        assert!(parse("2024-03-09T07:05:03").is_err());
        assert!(parse("2024-03-09 07:05:03.123").is_err());
        assert!(parse("2024-3-9 7:05:03").is_err());
    }

    #[test]
    fn test_lexicographic_order_is_chronological() {
        let a = format(NaiveDate::from_ymd_opt(2023, 12, 31).unwrap().and_hms_opt(23, 59, 59).unwrap());
        let b = format(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap());
        assert!(a < b);
    }

    #[test]
    fn test_now_has_no_subseconds() {
        assert_eq!(now().nanosecond(), 0);
    }
}
