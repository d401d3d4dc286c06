//! Sheet rows -> typed dataset, one schema at a time

use calamine::{Data, DataType};
use custodia_common::convert::{to_clean_string, to_date, to_integer, to_number};
use custodia_common::names::DatedName;
use custodia_common::{ColumnType, Dataset, Value};
use std::collections::HashMap;
use tracing::debug;

use super::schemas::{FieldType, Schema};
use super::{CeiError, Result};
use crate::sheet::{cell_text, normalize_label, row_is_empty};

/// A footer line: summary totals or a blank separator
fn is_footer(row: &[Data]) -> bool {
    if row_is_empty(row) {
        return true;
    }
    row.first()
        .and_then(cell_text)
        .is_some_and(|first| first.to_lowercase().starts_with("total"))
}

/// Normalize a worksheet into the schema's dataset.
///
/// The first non-empty row is the header. Missing headers project null;
/// extra headers are ignored.
pub fn process_rows(
    schema: &Schema,
    rows: &[Vec<Data>],
    name: &DatedName,
    source_file: &str,
) -> Result<Dataset> {
    let mut dataset = Dataset::new(schema.targets().map(str::to_string).collect());
    for field in schema.fields {
        dataset.declare_type(field.target, column_type(field.field_type));
    }

    let mut rows = rows.iter().skip_while(|r| row_is_empty(r));
    if let Some(header) = rows.next() {
        let positions: HashMap<String, usize> = header
            .iter()
            .enumerate()
            .filter_map(|(i, cell)| cell_text(cell).map(|label| (normalize_label(&label), i)))
            .collect();
        let columns: Vec<Option<usize>> = schema
            .fields
            .iter()
            .map(|f| positions.get(&normalize_label(f.header)).copied())
            .collect();

        let mut skipped = 0usize;
        for row in rows {
            if is_footer(row) {
                skipped += 1;
                continue;
            }
            let mut values = Vec::with_capacity(columns.len());
            for (field, column) in schema.fields.iter().zip(&columns) {
                let cell = column.and_then(|i| row.get(i)).unwrap_or(&Data::Empty);
                values.push(coerce(field.field_type, cell).map_err(|value| CeiError::Conversion {
                    schema: schema.name.to_string(),
                    column: field.target.to_string(),
                    value,
                })?);
            }
            dataset.push_row(values);
        }
        debug!(schema = schema.name, rows = dataset.len(), skipped, "Processed sheet");
    }

    dataset.add_constant_column("source_file", Value::text(source_file));
    dataset.add_constant_column("reference_date", Value::Date(name.reference_date()));
    schema.product_id.apply(&mut dataset);
    Ok(dataset)
}

fn column_type(field_type: FieldType) -> ColumnType {
    match field_type {
        FieldType::Text => ColumnType::Text,
        FieldType::Number => ColumnType::Decimal,
        FieldType::Integer => ColumnType::Integer,
        FieldType::Date => ColumnType::Date,
    }
}

/// Typed value of a cell; the error carries the offending text
fn coerce(field_type: FieldType, cell: &Data) -> std::result::Result<Value, String> {
    let text = cell_text(cell);
    let rejected = || text.clone().unwrap_or_default();

    match field_type {
        FieldType::Text => Ok(to_clean_string(text.as_deref()).map_or(Value::Null, Value::Text)),
        FieldType::Number => match cell {
            Data::Float(f) => Ok(Value::Decimal(*f)),
            Data::Int(i) => Ok(Value::Decimal(*i as f64)),
            _ => to_number(text.as_deref())
                .map(|n| n.map_or(Value::Null, Value::Decimal))
                .map_err(|_| rejected()),
        },
        FieldType::Integer => match cell {
            Data::Float(f) => Ok(Value::Integer(f.trunc() as i64)),
            Data::Int(i) => Ok(Value::Integer(*i)),
            _ => to_integer(text.as_deref())
                .map(|n| n.map_or(Value::Null, Value::Integer))
                .map_err(|_| rejected()),
        },
        FieldType::Date => match cell {
            Data::DateTime(_) | Data::DateTimeIso(_) => {
                Ok(cell.as_date().map_or(Value::Null, Value::Date))
            },
            _ => to_date(text.as_deref())
                .map(|d| d.map_or(Value::Null, Value::Date))
                .map_err(|_| rejected()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cei::schemas::schemas_for;
    use chrono::NaiveDate;
    use custodia_common::names::parse_dated_name;
    use std::path::Path;

    fn s(text: &str) -> Data {
        Data::String(text.to_string())
    }

    fn trades_rows() -> Vec<Vec<Data>> {
        vec![
            vec![Data::Empty, Data::Empty],
            vec![
                s("Data do Negócio"),
                s("Tipo de Movimentação"),
                s("Mercado"),
                s("Prazo/Vencimento"),
                s("Instituição"),
                s("Código de  Negociação"),
                s("Quantidade"),
                s("Preço"),
                s("Valor"),
            ],
            vec![
                s("02/01/2024"),
                s("Compra"),
                s("Mercado Fracionário"),
                s("-"),
                s("XP  INVESTIMENTOS"),
                s("PETR4F"),
                Data::Float(7.0),
                s("R$ 37,50"),
                s("262,50"),
            ],
            vec![s("Total"), Data::Empty, Data::Empty],
        ]
    }

    #[test]
    fn test_trades_sheet() {
        let schema = schemas_for("negociacao-2024-01-31.xlsx")[0];
        let name = parse_dated_name(Path::new("negociacao-2024-01-31.xlsx")).unwrap();
        let ds = process_rows(schema, &trades_rows(), &name, "negociacao-2024-01-31.xlsx").unwrap();

        assert_eq!(ds.len(), 1);
        assert_eq!(
            ds.value(0, "trade_date"),
            Some(&Value::Date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()))
        );
        assert_eq!(ds.value(0, "maturity"), Some(&Value::Null));
        assert_eq!(ds.value(0, "institution"), Some(&Value::text("XP INVESTIMENTOS")));
        assert_eq!(ds.value(0, "quantity"), Some(&Value::Decimal(7.0)));
        assert_eq!(ds.value(0, "price"), Some(&Value::Decimal(37.5)));
        assert_eq!(ds.value(0, "product_id"), Some(&Value::text("PETR4")));
        assert_eq!(
            ds.value(0, "reference_date"),
            Some(&Value::Date(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap()))
        );
    }

    #[test]
    fn test_missing_headers_project_null() {
        let schema = schemas_for("movimentacao-2024-01-31.xlsx")[0];
        let name = parse_dated_name(Path::new("movimentacao-2024-01-31.xlsx")).unwrap();
        let rows = vec![
            vec![s("Produto"), s("Quantidade")],
            vec![s("ITSA4 - ITAUSA S/A"), s("1.000")],
        ];
        let ds = process_rows(schema, &rows, &name, "movimentacao-2024-01-31.xlsx").unwrap();

        assert_eq!(ds.value(0, "direction"), Some(&Value::Null));
        assert_eq!(ds.value(0, "quantity"), Some(&Value::Decimal(1000.0)));
        assert_eq!(ds.value(0, "product_id"), Some(&Value::text("ITSA4")));
    }

    #[test]
    fn test_bad_number_names_schema_and_column() {
        let schema = schemas_for("movimentacao-2024-01-31.xlsx")[0];
        let name = parse_dated_name(Path::new("movimentacao-2024-01-31.xlsx")).unwrap();
        let rows = vec![vec![s("Quantidade")], vec![s("muitos")]];

        match process_rows(schema, &rows, &name, "m.xlsx") {
            Err(CeiError::Conversion { schema, column, value }) => {
                assert_eq!(schema, "transactions");
                assert_eq!(column, "quantity");
                assert_eq!(value, "muitos");
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_empty_sheet_keeps_schema() {
        let schema = schemas_for("eventos-2024-01-31.xlsx")[0];
        let name = parse_dated_name(Path::new("eventos-2024-01-31.xlsx")).unwrap();
        let ds = process_rows(schema, &[], &name, "eventos-2024-01-31.xlsx").unwrap();
        assert!(ds.is_empty());
        assert!(ds.has_column("net_amount"));
        assert!(ds.has_column("product_id"));
    }
}
