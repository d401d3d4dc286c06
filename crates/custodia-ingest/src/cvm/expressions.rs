//! Projection compiler: mapping rows -> SQL select list + converters

use custodia_common::ColumnType;

use super::converters::{self, Converter};
use super::registry::MappingRow;
use super::Result;

/// Placeholder replaced by the inner expression in transformation templates
pub const PLACEHOLDER: &str = "$X";

/// Compiled form of one fingerprint's mapping rows
pub struct Projection {
    /// Target column names, lower-cased, in output order
    pub columns: Vec<String>,
    /// One `CAST(<chain> AS TEXT) AS "<target>"` per column
    pub expressions: Vec<String>,
    pub converters: Vec<Converter>,
    /// Storage type implied by each converter
    pub types: Vec<Option<ColumnType>>,
}

impl Projection {
    pub fn select_list(&self) -> String {
        self.expressions.join(", ")
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Lower-cased, double-quoted SQL identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.trim().to_lowercase().replace('"', "\"\""))
}

/// Expression for one row; `None` for rows without a target field
pub fn build_expression(row: &MappingRow) -> Option<String> {
    let target = row.target_field.as_deref()?.trim();
    if target.is_empty() {
        return None;
    }

    let mut chain = match row.source_field.as_deref() {
        Some(source) if !source.trim().is_empty() => quote_ident(source),
        _ => "NULL".to_string(),
    };
    for template in row.transformations() {
        chain = template.replace(PLACEHOLDER, &chain);
    }

    Some(format!("CAST({} AS TEXT) AS {}", chain, quote_ident(target)))
}

/// Compile rows (sorted by `order`) into a projection
pub fn build(rows: &[MappingRow]) -> Result<Projection> {
    let mut ordered: Vec<&MappingRow> = rows.iter().collect();
    ordered.sort_by_key(|r| r.order);

    let mut projection = Projection {
        columns: Vec::new(),
        expressions: Vec::new(),
        converters: Vec::new(),
        types: Vec::new(),
    };
    for row in ordered {
        let Some(expression) = build_expression(row) else {
            continue;
        };
        let target = row.target_field.as_deref().unwrap_or_default();
        projection.columns.push(target.trim().to_lowercase());
        projection.expressions.push(expression);
        projection.converters.push(converters::lookup(row.converter.as_deref())?);
        projection.types.push(converters::column_type(row.converter.as_deref()));
    }
    Ok(projection)
}
