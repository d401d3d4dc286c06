//! Spreadsheet access shared by the CEI loaders and the mapping registry

use calamine::{open_workbook_auto, Data, DataType, Reader, Sheets};
use custodia_common::convert::collapse_double_spaces;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Error raised while opening or reading a workbook
#[derive(Debug, thiserror::Error)]
#[error("workbook {path}: {message}")]
pub struct SheetError {
    pub path: String,
    pub message: String,
}

impl SheetError {
    fn new(path: &Path, message: impl ToString) -> Self {
        Self {
            path: path.display().to_string(),
            message: message.to_string(),
        }
    }
}

/// Raw cell rows of one worksheet, header row included
pub type Rows = Vec<Vec<Data>>;

/// An open workbook; each sheet is read at most once per call
pub struct Workbook {
    path: String,
    sheets: Sheets<BufReader<File>>,
}

impl Workbook {
    pub fn open(path: &Path) -> Result<Self, SheetError> {
        let sheets = open_workbook_auto(path).map_err(|e| SheetError::new(path, e))?;
        Ok(Self {
            path: path.display().to_string(),
            sheets,
        })
    }

    pub fn sheet_names(&self) -> Vec<String> {
        self.sheets.sheet_names()
    }

    /// Rows of the first worksheet; an empty workbook has no rows
    pub fn first_sheet(&mut self) -> Result<Rows, SheetError> {
        match self.sheets.worksheet_range_at(0) {
            Some(range) => {
                let range = range.map_err(|e| self.error(e))?;
                Ok(range.rows().map(|r| r.to_vec()).collect())
            },
            None => Ok(Vec::new()),
        }
    }

    /// Rows of the sheet whose name matches `wanted` after normalization
    pub fn sheet(&mut self, wanted: &str) -> Result<Option<Rows>, SheetError> {
        let key = normalize_label(wanted);
        let Some(name) = self
            .sheets
            .sheet_names()
            .into_iter()
            .find(|name| normalize_label(name) == key)
        else {
            return Ok(None);
        };
        let range = self.sheets.worksheet_range(&name).map_err(|e| self.error(e))?;
        Ok(Some(range.rows().map(|r| r.to_vec()).collect()))
    }

    fn error(&self, message: impl ToString) -> SheetError {
        SheetError {
            path: self.path.clone(),
            message: message.to_string(),
        }
    }
}

/// Trimmed, space-collapsed, lower-case form used to match labels
pub fn normalize_label(label: &str) -> String {
    collapse_double_spaces(label.trim()).to_lowercase()
}

/// Text of a cell; empty cells and blank strings are `None`.
///
/// Whole floats render without a fractional part so that codes typed as
/// numbers (`123.0`) read back as `123`.
pub fn cell_text(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty => None,
        Data::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        },
        Data::Int(i) => Some(i.to_string()),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => Some(format!("{}", *f as i64)),
        Data::Float(f) => Some(f.to_string()),
        Data::Bool(b) => Some(b.to_string()),
        Data::DateTime(_) => cell
            .as_datetime()
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string()),
        Data::Error(_) => None,
        other => other.as_string(),
    }
}

/// True when every cell of a row is empty or blank
pub fn row_is_empty(row: &[Data]) -> bool {
    row.iter().all(|c| cell_text(c).is_none())
}
