//! Contracts the hosting document must satisfy: addressable cells and a
//! small persisted key-value state. Both use 1-based row/column addressing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("sheet not found: {0}")]
    SheetNotFound(String),
    #[error("invalid cell address row={row} col={col} (1-based)")]
    InvalidAddress { row: u32, col: u32 },
    #[error("backend error: {0}")]
    Backend(String),
    #[error("state serialization error: {0}")]
    Serialization(String),
}

/// A rectangular block of cells starting at (`row`, `col`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CellRange {
    pub row: u32,
    pub col: u32,
    pub rows: u32,
    pub cols: u32,
}

impl CellRange {
    pub fn new(row: u32, col: u32, rows: u32, cols: u32) -> Self {
        Self {
            row,
            col,
            rows,
            cols,
        }
    }

    /// Single column from `row` through `last_row` inclusive.
    pub fn column(col: u32, row: u32, last_row: u32) -> Self {
        Self {
            row,
            col,
            rows: last_row.saturating_add(1).saturating_sub(row),
            cols: 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    pub fn validate(&self) -> Result<(), HostError> {
        if self.row == 0 || self.col == 0 {
            return Err(HostError::InvalidAddress {
                row: self.row,
                col: self.col,
            });
        }
        Ok(())
    }
}

/// Result of [`TabularStore::append_row_if_absent`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Appended {
    Written(u32),
    KeyExists(u32),
}

/// Cell-level access to a workbook. Empty cells read back as `""`.
pub trait TabularStore {
    /// Last row holding any non-empty cell, 0 for an empty sheet.
    fn last_row(&self, sheet: &str) -> Result<u32, HostError>;

    /// Last column holding any non-empty cell, 0 for an empty sheet.
    fn last_column(&self, sheet: &str) -> Result<u32, HostError>;

    /// Always returns exactly `range.rows` rows of `range.cols` values.
    fn get_range(&self, sheet: &str, range: CellRange) -> Result<Vec<Vec<String>>, HostError>;

    fn set_range(
        &self,
        sheet: &str,
        row: u32,
        col: u32,
        values: &[Vec<String>],
    ) -> Result<(), HostError>;

    /// Writes `values` into `row` starting at column 1.
    fn write_row(&self, sheet: &str, row: u32, values: &[String]) -> Result<(), HostError> {
        self.set_range(sheet, row, 1, &[values.to_vec()])
    }

    /// Writes `values` into the row after the last used one (never above
    /// `first_row`), unless column `key_col` already holds `key` at or below
    /// `first_row`. Never overwrites a used row. This default reads then
    /// writes; backings shared between processes must do both under one lock.
    fn append_row_if_absent(
        &self,
        sheet: &str,
        first_row: u32,
        key_col: u32,
        key: &str,
        values: &[String],
    ) -> Result<Appended, HostError> {
        let last_row = self.last_row(sheet)?;
        if last_row >= first_row {
            let column = self.get_range(sheet, CellRange::column(key_col, first_row, last_row))?;
            let found = column.iter().position(|cells| {
                cells
                    .first()
                    .is_some_and(|value| crate::normalize_cell(value) == key)
            });
            if let Some(offset) = found {
                return Ok(Appended::KeyExists(first_row + offset as u32));
            }
        }
        let row = (last_row + 1).max(first_row);
        self.write_row(sheet, row, values)?;
        Ok(Appended::Written(row))
    }
}

/// Document-scoped persisted state. Values are opaque strings; only
/// single-key atomicity is assumed.
pub trait KeyValueState {
    fn get(&self, key: &str) -> Result<Option<String>, HostError>;

    fn set(&self, key: &str, value: &str) -> Result<(), HostError>;

    fn delete(&self, key: &str) -> Result<(), HostError>;

    /// Read-modify-write of one key. `apply` returns the replacement value,
    /// or `None` to delete the key. Backings that can hold a write lock
    /// across the read and the write should override this.
    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<String>) -> Result<Option<String>, HostError>,
    ) -> Result<Option<String>, HostError> {
        let current = self.get(key)?;
        let next = apply(current)?;
        match next.as_deref() {
            Some(value) => self.set(key, value)?,
            None => self.delete(key)?,
        }
        Ok(next)
    }
}
