//! Header-mapping registry
//!
//! Two tables drive every CVM transformation:
//!
//! - **templates**: ordered mapping rows per kind (optionally per sub-kind),
//!   written by hand, with no fingerprint
//! - **mappings**: the same rows resolved for one concrete header fingerprint
//!
//! When a file arrives with an unknown fingerprint the registry reconciles
//! it against the template of its kind: template columns found in the header
//! keep their transformations, missing ones project NULL, and header columns
//! no template mentions are appended as `is_new` rows for an operator to map.

use rust_xlsxwriter::{Format, Workbook as XlsxWorkbook, XlsxError};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::Path;
use tracing::info;

use super::filename::FileMetadata;
use super::{CvmError, Result};
use crate::sheet::{cell_text, normalize_label, Workbook};

/// Templates shipped with the crate, used when no templates table is configured
pub const BUILTIN_TEMPLATES: &str = include_str!("../../templates/cvm_templates.csv");

/// Column order of the persisted tables
pub const COLUMNS: [&str; 11] = [
    "fingerprint",
    "kind",
    "sub_kind",
    "order",
    "target_field",
    "source_field",
    "transformation_1",
    "transformation_2",
    "transformation_3",
    "converter",
    "is_new",
];

/// One target column for one fingerprint (or one template line)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRow {
    pub fingerprint: Option<String>,
    pub kind: String,
    pub sub_kind: Option<String>,
    pub order: i64,
    pub target_field: Option<String>,
    pub source_field: Option<String>,
    pub transformation_1: Option<String>,
    pub transformation_2: Option<String>,
    pub transformation_3: Option<String>,
    pub converter: Option<String>,
    #[serde(deserialize_with = "flag")]
    pub is_new: bool,
}

impl MappingRow {
    pub fn transformations(&self) -> impl Iterator<Item = &str> {
        [
            &self.transformation_1,
            &self.transformation_2,
            &self.transformation_3,
        ]
        .into_iter()
        .filter_map(|t| t.as_deref())
    }

    /// Resolved copy of a template line for `file`
    fn resolve(&self, file: &FileMetadata, present: bool) -> MappingRow {
        MappingRow {
            fingerprint: Some(file.fingerprint.clone()),
            kind: file.kind.as_str().to_string(),
            sub_kind: Some(file.sub_kind.clone()),
            order: self.order,
            target_field: self.target_field.clone(),
            source_field: if present { self.source_field.clone() } else { None },
            transformation_1: if present { self.transformation_1.clone() } else { None },
            transformation_2: if present { self.transformation_2.clone() } else { None },
            transformation_3: if present { self.transformation_3.clone() } else { None },
            converter: if present { self.converter.clone() } else { None },
            is_new: false,
        }
    }

    fn from_cells(cells: &BTreeMap<&'static str, Option<String>>) -> Result<Self> {
        let get = |column: &str| cells.get(column).cloned().flatten();
        let order = get("order")
            .ok_or_else(|| CvmError::Registry("mapping row without order".to_string()))?;
        let order = order
            .trim()
            .parse::<f64>()
            .map_err(|_| CvmError::Registry(format!("invalid order '{}'", order)))?
            as i64;

        Ok(MappingRow {
            fingerprint: get("fingerprint"),
            kind: get("kind")
                .ok_or_else(|| CvmError::Registry("mapping row without kind".to_string()))?,
            sub_kind: get("sub_kind"),
            order,
            target_field: get("target_field"),
            source_field: get("source_field"),
            transformation_1: get("transformation_1"),
            transformation_2: get("transformation_2"),
            transformation_3: get("transformation_3"),
            converter: get("converter"),
            is_new: get("is_new").map(|v| parse_flag(&v)).unwrap_or(false),
        })
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "y" | "s" | "sim"
    )
}

fn flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.map(|v| parse_flag(&v)).unwrap_or(false))
}

/// Templates and resolved mappings loaded at startup
#[derive(Debug, Clone, Default)]
pub struct Registry {
    /// (kind, sub_kind) -> ordered rows; a `None` sub-kind covers the whole kind
    templates: BTreeMap<(String, Option<String>), Vec<MappingRow>>,
    /// fingerprint -> ordered rows
    mappings: BTreeMap<String, Vec<MappingRow>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(templates: Vec<MappingRow>, mappings: Vec<MappingRow>) -> Self {
        let mut registry = Self::new();
        for row in templates {
            let key = (row.kind.clone(), row.sub_kind.clone());
            registry.templates.entry(key).or_default().push(row);
        }
        for rows in registry.templates.values_mut() {
            rows.sort_by_key(|r| r.order);
        }
        registry.merge(mappings);
        registry
    }

    /// Load both tables. A missing templates table falls back to the
    /// shipped one; a missing mappings table is empty.
    pub fn load(templates_path: &Path, mappings_path: &Path) -> Result<Self> {
        let templates = if templates_path.exists() {
            read_rows(templates_path)?
        } else {
            info!(path = %templates_path.display(), "Templates table not found, using the shipped templates");
            builtin_templates()?
        };
        let mappings = if mappings_path.exists() {
            read_rows(mappings_path)?
        } else {
            Vec::new()
        };

        let registry = Self::from_rows(templates, mappings);
        info!(
            templates = registry.templates.len(),
            fingerprints = registry.mappings.len(),
            "Loaded header-mapping registry"
        );
        Ok(registry)
    }

    /// Add resolved rows, keeping the first row seen for each (fingerprint, order)
    pub fn merge(&mut self, rows: Vec<MappingRow>) {
        for row in rows {
            let Some(fingerprint) = row.fingerprint.clone() else {
                continue;
            };
            let entry = self.mappings.entry(fingerprint).or_default();
            if !entry.iter().any(|r| r.order == row.order) {
                entry.push(row);
            }
        }
        for rows in self.mappings.values_mut() {
            rows.sort_by_key(|r| r.order);
        }
    }

    /// Replace the resolved rows with the mappings table on disk, picking up
    /// operator edits; a missing table keeps what is in memory
    pub fn reload_mappings(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let rows = read_rows(path)?;
        self.mappings.clear();
        self.merge(rows);
        Ok(())
    }

    pub fn knows(&self, fingerprint: &str) -> bool {
        self.mappings.contains_key(fingerprint)
    }

    /// Resolved rows of a fingerprint, in order
    pub fn rows_for(&self, fingerprint: &str) -> Option<&[MappingRow]> {
        self.mappings.get(fingerprint).map(Vec::as_slice)
    }

    /// Columns appended by reconciliation that still have no target field
    pub fn unreviewed(&self, fingerprint: &str) -> Vec<&MappingRow> {
        self.rows_for(fingerprint)
            .unwrap_or_default()
            .iter()
            .filter(|r| r.is_new && r.target_field.as_deref().is_none_or(|t| t.trim().is_empty()))
            .collect()
    }

    /// Template for a kind, preferring one written for the exact sub-kind
    pub fn template(&self, kind: &str, sub_kind: &str) -> Option<&[MappingRow]> {
        self.templates
            .get(&(kind.to_string(), Some(sub_kind.to_string())))
            .or_else(|| self.templates.get(&(kind.to_string(), None)))
            .map(Vec::as_slice)
    }

    /// Files whose fingerprint is unknown, one per fingerprint
    pub fn drift<'a>(&self, files: &'a [FileMetadata]) -> Vec<&'a FileMetadata> {
        let mut seen = HashSet::new();
        files
            .iter()
            .filter(|f| !self.knows(&f.fingerprint))
            .filter(|f| seen.insert(f.fingerprint.as_str()))
            .collect()
    }

    /// Resolve one file's header against its template and remember the result
    pub fn reconcile_file(&mut self, file: &FileMetadata) -> Result<Vec<MappingRow>> {
        if let Some(existing) = self.rows_for(&file.fingerprint) {
            return Ok(existing.to_vec());
        }
        let template = self
            .template(file.kind.as_str(), &file.sub_kind)
            .ok_or_else(|| CvmError::UnknownKind(format!("{}/{}", file.kind, file.sub_kind)))?;

        let tokens: Vec<&str> = file
            .header
            .split(';')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        let token_keys: HashSet<String> = tokens.iter().map(|t| t.to_lowercase()).collect();

        let mut rows: Vec<MappingRow> = template
            .iter()
            .map(|line| {
                let present = line
                    .source_field
                    .as_ref()
                    .is_some_and(|s| token_keys.contains(&s.trim().to_lowercase()));
                line.resolve(file, present)
            })
            .collect();

        let referenced: HashSet<String> = template
            .iter()
            .filter_map(|line| line.source_field.as_ref())
            .map(|s| s.trim().to_lowercase())
            .collect();
        let mut next_order = template.iter().map(|r| r.order).max().unwrap_or(0);
        for token in tokens {
            if referenced.contains(&token.to_lowercase()) {
                continue;
            }
            next_order += 1;
            rows.push(MappingRow {
                fingerprint: Some(file.fingerprint.clone()),
                kind: file.kind.as_str().to_string(),
                sub_kind: Some(file.sub_kind.clone()),
                order: next_order,
                target_field: None,
                source_field: Some(token.to_string()),
                transformation_1: None,
                transformation_2: None,
                transformation_3: None,
                converter: None,
                is_new: true,
            });
        }

        info!(
            file = %file.path.display(),
            fingerprint = %file.fingerprint,
            new_fields = rows.iter().filter(|r| r.is_new).count(),
            "Reconciled header against template"
        );
        self.merge(rows.clone());
        Ok(rows)
    }

    /// Reconcile every unknown fingerprint among `files`
    pub fn reconcile(&mut self, files: &[FileMetadata]) -> Result<Vec<MappingRow>> {
        let unknown: Vec<FileMetadata> = self.drift(files).into_iter().cloned().collect();
        let mut rows = Vec::new();
        for file in &unknown {
            rows.extend(self.reconcile_file(file)?);
        }
        Ok(rows)
    }
}

/// Read a mapping table from CSV or from the first sheet of a workbook
pub fn read_rows(path: &Path) -> Result<Vec<MappingRow>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "xlsx" | "xlsm" | "xls" | "ods" => read_workbook_rows(path),
        _ => read_csv_rows(path),
    }
}

/// Rows of the templates table shipped with the crate
pub fn builtin_templates() -> Result<Vec<MappingRow>> {
    csv_rows(BUILTIN_TEMPLATES.as_bytes())
}

fn read_csv_rows(path: &Path) -> Result<Vec<MappingRow>> {
    csv_rows(std::fs::File::open(path)?)
}

fn csv_rows<R: Read>(source: R) -> Result<Vec<MappingRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(source);
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}

fn read_workbook_rows(path: &Path) -> Result<Vec<MappingRow>> {
    let mut workbook = Workbook::open(path).map_err(|e| CvmError::Registry(e.to_string()))?;
    let sheet = workbook
        .first_sheet()
        .map_err(|e| CvmError::Registry(e.to_string()))?;
    let Some((header, body)) = sheet.split_first() else {
        return Ok(Vec::new());
    };

    let positions: Vec<(&'static str, usize)> = COLUMNS
        .iter()
        .filter_map(|column| {
            header
                .iter()
                .position(|cell| {
                    cell_text(cell).map(|t| normalize_label(&t)).as_deref() == Some(*column)
                })
                .map(|idx| (*column, idx))
        })
        .collect();

    let mut rows = Vec::new();
    for line in body {
        let cells: BTreeMap<&'static str, Option<String>> = positions
            .iter()
            .map(|(column, idx)| (*column, line.get(*idx).and_then(cell_text)))
            .collect();
        if cells.values().all(Option::is_none) {
            continue;
        }
        rows.push(MappingRow::from_cells(&cells)?);
    }
    Ok(rows)
}

/// Mapping tables can be written as CSV or as an `.xlsx` workbook
pub fn is_writable(path: &Path) -> bool {
    matches!(table_format(path), Some(TableFormat::Csv | TableFormat::Xlsx))
}

enum TableFormat {
    Csv,
    Xlsx,
}

fn table_format(path: &Path) -> Option<TableFormat> {
    let extension = path.extension().and_then(|e| e.to_str())?.to_lowercase();
    match extension.as_str() {
        "csv" => Some(TableFormat::Csv),
        "xlsx" => Some(TableFormat::Xlsx),
        _ => None,
    }
}

/// Write the combined resolved-mapping table.
///
/// Rows already in the file win over new rows with the same
/// (fingerprint, order). Returns the number of rows added.
pub fn persist(rows: &[MappingRow], path: &Path) -> Result<usize> {
    let format = table_format(path).ok_or_else(|| {
        CvmError::Registry(format!(
            "mappings can be written as .csv or .xlsx, not '{}'",
            path.display()
        ))
    })?;
    let existing = if path.exists() {
        if rows.is_empty() {
            return Ok(0);
        }
        read_rows(path)?
    } else {
        Vec::new()
    };

    let mut seen: HashSet<(Option<String>, i64)> = HashSet::new();
    let mut combined = Vec::with_capacity(existing.len() + rows.len());
    for row in existing.iter().chain(rows.iter()) {
        if seen.insert((row.fingerprint.clone(), row.order)) {
            combined.push(row);
        }
    }
    let added = combined.len() - existing.len().min(combined.len());

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let staging = path.with_extension("tmp");
    match format {
        TableFormat::Csv => write_csv(&combined, &staging)?,
        TableFormat::Xlsx => write_xlsx(&combined, &staging)
            .map_err(|e| CvmError::Registry(format!("writing {}: {}", path.display(), e)))?,
    }
    std::fs::rename(&staging, path)?;

    info!(path = %path.display(), added, "Persisted resolved mappings");
    Ok(added)
}

fn write_csv(rows: &[&MappingRow], path: &Path) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    writer.write_record(COLUMNS)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// One sheet, bold header row frozen above the rows
fn write_xlsx(rows: &[&MappingRow], path: &Path) -> std::result::Result<(), XlsxError> {
    let mut workbook = XlsxWorkbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("mappings")?;

    let bold = Format::new().set_bold();
    for (col, column) in COLUMNS.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, *column, &bold)?;
    }
    sheet.set_freeze_panes(1, 0)?;

    for (idx, row) in rows.iter().enumerate() {
        let line = idx as u32 + 1;
        let text = [
            (0, &row.fingerprint),
            (2, &row.sub_kind),
            (4, &row.target_field),
            (5, &row.source_field),
            (6, &row.transformation_1),
            (7, &row.transformation_2),
            (8, &row.transformation_3),
            (9, &row.converter),
        ];
        for (col, value) in text {
            if let Some(value) = value {
                sheet.write_string(line, col, value.as_str())?;
            }
        }
        sheet.write_string(line, 1, row.kind.as_str())?;
        sheet.write_number(line, 3, row.order as f64)?;
        sheet.write_boolean(line, 10, row.is_new)?;
    }

    workbook.save(path)?;
    Ok(())
}
