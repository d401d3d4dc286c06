//! Named converters applied to projected columns
//!
//! Mapping rows refer to converters by name; the names resolve through a
//! static table of plain functions. Every converter maps `-`, the empty
//! string and NaN-like markers to [`Value::Null`].

use custodia_common::convert::{
    is_absent, to_any_date, to_bool, to_date, to_datetime, to_integer, to_number,
    to_plain_integer, to_plain_number,
};
use custodia_common::{ColumnType, Value};

use super::{CvmError, Result};

/// Raw text in, typed value out
pub type Converter = fn(Option<&str>) -> custodia_common::Result<Value>;

fn integer(raw: Option<&str>) -> custodia_common::Result<Value> {
    Ok(to_plain_integer(raw)?.map_or(Value::Null, Value::Integer))
}

fn integer_br(raw: Option<&str>) -> custodia_common::Result<Value> {
    Ok(to_integer(raw)?.map_or(Value::Null, Value::Integer))
}

fn decimal(raw: Option<&str>) -> custodia_common::Result<Value> {
    Ok(to_plain_number(raw)?.map_or(Value::Null, Value::Decimal))
}

fn decimal_br(raw: Option<&str>) -> custodia_common::Result<Value> {
    Ok(to_number(raw)?.map_or(Value::Null, Value::Decimal))
}

fn date(raw: Option<&str>) -> custodia_common::Result<Value> {
    Ok(to_any_date(raw)?.map_or(Value::Null, Value::Date))
}

fn date_br(raw: Option<&str>) -> custodia_common::Result<Value> {
    Ok(to_date(raw)?.map_or(Value::Null, Value::Date))
}

fn datetime(raw: Option<&str>) -> custodia_common::Result<Value> {
    Ok(to_datetime(raw)?.map_or(Value::Null, Value::DateTime))
}

fn string(raw: Option<&str>) -> custodia_common::Result<Value> {
    if is_absent(raw) {
        return Ok(Value::Null);
    }
    Ok(raw.map_or(Value::Null, |s| Value::text(s.trim())))
}

fn boolean(raw: Option<&str>) -> custodia_common::Result<Value> {
    Ok(to_bool(raw)?.map_or(Value::Null, Value::Bool))
}

/// Used for target columns without a converter
fn null(_: Option<&str>) -> custodia_common::Result<Value> {
    Ok(Value::Null)
}

const REGISTRY: &[(&str, ColumnType, Converter)] = &[
    ("integer", ColumnType::Integer, integer),
    ("decimal", ColumnType::Decimal, decimal),
    ("decimal_br", ColumnType::Decimal, decimal_br),
    ("integer_br", ColumnType::Integer, integer_br),
    ("date", ColumnType::Date, date),
    ("date_br", ColumnType::Date, date_br),
    ("datetime", ColumnType::DateTime, datetime),
    ("string", ColumnType::Text, string),
    ("boolean", ColumnType::Bool, boolean),
];

/// Names accepted in the `converter` column
pub fn names() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|(name, _, _)| *name)
}

fn find(name: &str) -> Option<&'static (&'static str, ColumnType, Converter)> {
    REGISTRY
        .iter()
        .find(|(registered, _, _)| registered.eq_ignore_ascii_case(name))
}

/// Type a converter produces; `None` for unnamed or unknown converters
pub fn column_type(name: Option<&str>) -> Option<ColumnType> {
    let name = name.map(str::trim).filter(|n| !n.is_empty())?;
    find(name).map(|(_, column_type, _)| *column_type)
}

/// Resolve a converter name; no name means a constant-null column
pub fn lookup(name: Option<&str>) -> Result<Converter> {
    let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
        return Ok(null);
    };
    find(name)
        .map(|(_, _, converter)| *converter)
        .ok_or_else(|| CvmError::UnknownConverter(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_every_converter_propagates_null() {
        for name in names() {
            let convert = lookup(Some(name)).unwrap();
            for raw in [None, Some(""), Some("-"), Some("  "), Some("NaN")] {
                assert_eq!(convert(raw).unwrap(), Value::Null, "{} on {:?}", name, raw);
            }
        }
    }

    #[test]
    fn test_lookup() {
        assert!(lookup(Some("DECIMAL")).is_ok());
        assert_eq!(lookup(None).unwrap()(Some("123")).unwrap(), Value::Null);
        assert!(matches!(
            lookup(Some("roman_numeral")),
            Err(CvmError::UnknownConverter(name)) if name == "roman_numeral"
        ));
    }

    #[test]
    fn test_column_types_follow_converter_names() {
        assert_eq!(column_type(Some("decimal_br")), Some(ColumnType::Decimal));
        assert_eq!(column_type(Some(" Integer ")), Some(ColumnType::Integer));
        assert_eq!(column_type(Some("boolean")), Some(ColumnType::Bool));
        assert_eq!(column_type(None), None);
        assert_eq!(column_type(Some("roman_numeral")), None);
    }

    #[test]
    fn test_typed_outputs() {
        let convert = |name: &str, raw: &str| lookup(Some(name)).unwrap()(Some(raw));
        assert_eq!(convert("decimal", "27.123456").unwrap(), Value::Decimal(27.123456));
        assert_eq!(convert("decimal_br", "1.234,5").unwrap(), Value::Decimal(1234.5));
        assert_eq!(convert("integer", "152").unwrap(), Value::Integer(152));
        assert_eq!(
            convert("date", "2024-01-31").unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap())
        );
        assert_eq!(convert("string", " EM FUNCIONAMENTO ").unwrap(), Value::text("EM FUNCIONAMENTO"));
        assert_eq!(convert("boolean", "S").unwrap(), Value::Bool(true));
        assert!(convert("decimal", "abc").is_err());
        assert!(convert("date", "2024-02-30").is_err());
    }
}
