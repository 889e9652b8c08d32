use casebook_core::{CellRange, HostError, KeyValueState, TabularStore};
use std::cell::RefCell;
use std::collections::BTreeMap;

type SheetCells = BTreeMap<(u32, u32), String>;

/// Process-local workbook and state. Single-threaded; useful for tests and
/// dry runs.
#[derive(Debug, Default)]
pub struct MemoryWorkbook {
    sheets: RefCell<BTreeMap<String, SheetCells>>,
    state: RefCell<BTreeMap<String, String>>,
}

impl MemoryWorkbook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sheet(&self, name: &str) {
        self.sheets
            .borrow_mut()
            .entry(name.to_string())
            .or_default();
    }

    /// Creates (or replaces) `name` with `rows` starting at row 1, column 1.
    pub fn with_sheet(self, name: &str, rows: &[&[&str]]) -> Self {
        let mut cells = SheetCells::new();
        for (r, row) in rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                if !value.is_empty() {
                    cells.insert((r as u32 + 1, c as u32 + 1), value.to_string());
                }
            }
        }
        self.sheets.borrow_mut().insert(name.to_string(), cells);
        self
    }

    /// Shifts every cell at or right of `at` one column to the right, like
    /// inserting a column in a spreadsheet editor.
    pub fn insert_column(&self, sheet: &str, at: u32) -> Result<(), HostError> {
        let mut sheets = self.sheets.borrow_mut();
        let cells = sheets
            .get_mut(sheet)
            .ok_or_else(|| HostError::SheetNotFound(sheet.to_string()))?;
        let shifted = std::mem::take(cells)
            .into_iter()
            .map(|((row, col), value)| {
                let col = if col >= at { col + 1 } else { col };
                ((row, col), value)
            })
            .collect();
        *cells = shifted;
        Ok(())
    }

    pub fn cell(&self, sheet: &str, row: u32, col: u32) -> String {
        self.sheets
            .borrow()
            .get(sheet)
            .and_then(|cells| cells.get(&(row, col)).cloned())
            .unwrap_or_default()
    }

    /// Full contents for whole-sheet comparisons in tests.
    pub fn snapshot_cells(&self, sheet: &str) -> BTreeMap<(u32, u32), String> {
        self.sheets
            .borrow()
            .get(sheet)
            .cloned()
            .unwrap_or_default()
    }

    pub fn state_keys(&self) -> Vec<String> {
        self.state.borrow().keys().cloned().collect()
    }

    fn extent(&self, sheet: &str, pick: fn(&(u32, u32)) -> u32) -> Result<u32, HostError> {
        let sheets = self.sheets.borrow();
        let cells = sheets
            .get(sheet)
            .ok_or_else(|| HostError::SheetNotFound(sheet.to_string()))?;
        Ok(cells.keys().map(pick).max().unwrap_or(0))
    }
}

impl TabularStore for MemoryWorkbook {
    fn last_row(&self, sheet: &str) -> Result<u32, HostError> {
        self.extent(sheet, |(row, _)| *row)
    }

    fn last_column(&self, sheet: &str) -> Result<u32, HostError> {
        self.extent(sheet, |(_, col)| *col)
    }

    fn get_range(&self, sheet: &str, range: CellRange) -> Result<Vec<Vec<String>>, HostError> {
        range.validate()?;
        let sheets = self.sheets.borrow();
        let cells = sheets
            .get(sheet)
            .ok_or_else(|| HostError::SheetNotFound(sheet.to_string()))?;
        Ok((0..range.rows)
            .map(|r| {
                (0..range.cols)
                    .map(|c| {
                        cells
                            .get(&(range.row + r, range.col + c))
                            .cloned()
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .collect())
    }

    fn set_range(
        &self,
        sheet: &str,
        row: u32,
        col: u32,
        values: &[Vec<String>],
    ) -> Result<(), HostError> {
        CellRange::new(row, col, 1, 1).validate()?;
        let mut sheets = self.sheets.borrow_mut();
        let cells = sheets
            .get_mut(sheet)
            .ok_or_else(|| HostError::SheetNotFound(sheet.to_string()))?;
        for (r, row_values) in values.iter().enumerate() {
            for (c, value) in row_values.iter().enumerate() {
                let key = (row + r as u32, col + c as u32);
                if value.is_empty() {
                    cells.remove(&key);
                } else {
                    cells.insert(key, value.clone());
                }
            }
        }
        Ok(())
    }
}

impl KeyValueState for MemoryWorkbook {
    fn get(&self, key: &str) -> Result<Option<String>, HostError> {
        Ok(self.state.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), HostError> {
        self.state
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), HostError> {
        self.state.borrow_mut().remove(key);
        Ok(())
    }
}
