use casebook_core::{
    normalize_cell, Appended, CellRange, HostError, KeyValueState, TabularStore,
};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod memory;

pub use memory::MemoryWorkbook;

pub const CASEBOOK_SCHEMA_VERSION: i64 = 2;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("sheet not found: {0}")]
    SheetNotFound(String),
    #[error("invalid cell address row={row} col={col}")]
    InvalidAddress { row: u32, col: u32 },
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

impl From<StorageError> for HostError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::SheetNotFound(sheet) => HostError::SheetNotFound(sheet),
            StorageError::InvalidAddress { row, col } => HostError::InvalidAddress { row, col },
            other => HostError::Backend(other.to_string()),
        }
    }
}

/// One SQLite file acting as the document: sheets of cells plus the
/// document-scoped key-value state.
pub struct CaseStore {
    conn: Connection,
}

impl CaseStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON")?;

        let mut current = self.schema_version()?;
        if current > CASEBOOK_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: CASEBOOK_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_casebook_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_document_state.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 2", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Returns `false` when the sheet already existed.
    pub fn create_sheet(&self, name: &str) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "INSERT OR IGNORE INTO sheets (name, created_at) VALUES (?1, ?2)",
            params![name, Utc::now().to_rfc3339()],
        )?;
        Ok(changes > 0)
    }

    pub fn has_sheet(&self, name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row("SELECT 1 FROM sheets WHERE name = ?1", [name], |_| Ok(()))
            .optional()?;
        Ok(exists.is_some())
    }

    pub fn sheet_names(&self) -> Result<Vec<String>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sheets ORDER BY created_at, name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    pub fn clear_sheet(&self, name: &str) -> Result<usize, StorageError> {
        self.require_sheet(name)?;
        Ok(self
            .conn
            .execute("DELETE FROM sheet_cells WHERE sheet = ?1", [name])?)
    }

    fn require_sheet(&self, name: &str) -> Result<(), StorageError> {
        if self.has_sheet(name)? {
            Ok(())
        } else {
            Err(StorageError::SheetNotFound(name.to_string()))
        }
    }

    fn max_coordinate(&self, sheet: &str, column: &str) -> Result<u32, StorageError> {
        self.require_sheet(sheet)?;
        let sql = format!("SELECT MAX({column}) FROM sheet_cells WHERE sheet = ?1");
        let max = self
            .conn
            .query_row(&sql, [sheet], |row| row.get::<_, Option<i64>>(0))?;
        Ok(max.unwrap_or(0).max(0) as u32)
    }

    pub fn cells_in_range(
        &self,
        sheet: &str,
        range: CellRange,
    ) -> Result<Vec<Vec<String>>, StorageError> {
        self.require_sheet(sheet)?;
        if range.row == 0 || range.col == 0 {
            return Err(StorageError::InvalidAddress {
                row: range.row,
                col: range.col,
            });
        }

        let mut grid = vec![vec![String::new(); range.cols as usize]; range.rows as usize];
        if range.is_empty() {
            return Ok(grid);
        }

        let last_row = i64::from(range.row) + i64::from(range.rows) - 1;
        let last_col = i64::from(range.col) + i64::from(range.cols) - 1;
        let mut stmt = self.conn.prepare(
            "
            SELECT row, col, value
            FROM sheet_cells
            WHERE sheet = ?1 AND row BETWEEN ?2 AND ?3 AND col BETWEEN ?4 AND ?5
            ",
        )?;
        let cells = stmt.query_map(
            params![sheet, range.row, last_row, range.col, last_col],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )?;

        for cell in cells {
            let (row, col, value) = cell?;
            let r = (row - i64::from(range.row)) as usize;
            let c = (col - i64::from(range.col)) as usize;
            grid[r][c] = value;
        }

        Ok(grid)
    }

    pub fn write_cells(
        &self,
        sheet: &str,
        row: u32,
        col: u32,
        values: &[Vec<String>],
    ) -> Result<(), StorageError> {
        self.require_sheet(sheet)?;
        if row == 0 || col == 0 {
            return Err(StorageError::InvalidAddress { row, col });
        }

        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        write_cells_on(&tx, sheet, row, col, values)?;
        tx.commit()?;
        Ok(())
    }

    /// Key check and append under one write lock, so two processes
    /// appending at once land on different rows.
    pub fn append_if_key_absent(
        &self,
        sheet: &str,
        first_row: u32,
        key_col: u32,
        key: &str,
        values: &[String],
    ) -> Result<Appended, StorageError> {
        self.require_sheet(sheet)?;
        if first_row == 0 || key_col == 0 {
            return Err(StorageError::InvalidAddress {
                row: first_row,
                col: key_col,
            });
        }

        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let existing = {
            let mut stmt = tx.prepare(
                "
                SELECT row, value
                FROM sheet_cells
                WHERE sheet = ?1 AND col = ?2 AND row >= ?3
                ORDER BY row
                ",
            )?;
            let mut rows = stmt.query(params![sheet, key_col, first_row])?;
            let mut found = None;
            while let Some(cell) = rows.next()? {
                let value: String = cell.get(1)?;
                if normalize_cell(&value) == key {
                    found = Some(cell.get::<_, i64>(0)? as u32);
                    break;
                }
            }
            found
        };
        if let Some(row) = existing {
            return Ok(Appended::KeyExists(row));
        }

        let last_row = tx
            .query_row(
                "SELECT MAX(row) FROM sheet_cells WHERE sheet = ?1",
                [sheet],
                |row| row.get::<_, Option<i64>>(0),
            )?
            .unwrap_or(0)
            .max(0) as u32;
        let row = (last_row + 1).max(first_row);
        write_cells_on(&tx, sheet, row, 1, &[values.to_vec()])?;
        tx.commit()?;
        Ok(Appended::Written(row))
    }

    pub fn state_value(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM document_state WHERE key = ?1",
                [key],
                |row| row.get::<_, String>(0),
            )
            .optional()?)
    }

    pub fn put_state_value(&self, key: &str, value: &str) -> Result<(), StorageError> {
        put_state_on(&self.conn, key, value)
    }

    pub fn delete_state_value(&self, key: &str) -> Result<(), StorageError> {
        self.conn
            .execute("DELETE FROM document_state WHERE key = ?1", [key])?;
        Ok(())
    }

    pub fn state_keys(&self) -> Result<Vec<String>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM document_state ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}

fn write_cells_on(
    conn: &Connection,
    sheet: &str,
    row: u32,
    col: u32,
    values: &[Vec<String>],
) -> Result<(), StorageError> {
    for (row_offset, row_values) in values.iter().enumerate() {
        let target_row = i64::from(row) + row_offset as i64;
        for (col_offset, value) in row_values.iter().enumerate() {
            let target_col = i64::from(col) + col_offset as i64;
            if value.is_empty() {
                conn.execute(
                    "DELETE FROM sheet_cells WHERE sheet = ?1 AND row = ?2 AND col = ?3",
                    params![sheet, target_row, target_col],
                )?;
            } else {
                conn.execute(
                    "
                    INSERT INTO sheet_cells (sheet, row, col, value)
                    VALUES (?1, ?2, ?3, ?4)
                    ON CONFLICT(sheet, row, col) DO UPDATE SET value=excluded.value
                    ",
                    params![sheet, target_row, target_col, value],
                )?;
            }
        }
    }
    Ok(())
}

fn put_state_on(conn: &Connection, key: &str, value: &str) -> Result<(), StorageError> {
    conn.execute(
        "
        INSERT INTO document_state (key, value, updated_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(key) DO UPDATE SET
            value=excluded.value,
            updated_at=excluded.updated_at
        ",
        params![key, value, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

impl TabularStore for CaseStore {
    fn last_row(&self, sheet: &str) -> Result<u32, HostError> {
        Ok(self.max_coordinate(sheet, "row")?)
    }

    fn last_column(&self, sheet: &str) -> Result<u32, HostError> {
        Ok(self.max_coordinate(sheet, "col")?)
    }

    fn get_range(&self, sheet: &str, range: CellRange) -> Result<Vec<Vec<String>>, HostError> {
        Ok(self.cells_in_range(sheet, range)?)
    }

    fn set_range(
        &self,
        sheet: &str,
        row: u32,
        col: u32,
        values: &[Vec<String>],
    ) -> Result<(), HostError> {
        Ok(self.write_cells(sheet, row, col, values)?)
    }

    fn append_row_if_absent(
        &self,
        sheet: &str,
        first_row: u32,
        key_col: u32,
        key: &str,
        values: &[String],
    ) -> Result<Appended, HostError> {
        Ok(self.append_if_key_absent(sheet, first_row, key_col, key, values)?)
    }
}

impl KeyValueState for CaseStore {
    fn get(&self, key: &str) -> Result<Option<String>, HostError> {
        Ok(self.state_value(key)?)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), HostError> {
        Ok(self.put_state_value(key, value)?)
    }

    fn delete(&self, key: &str) -> Result<(), HostError> {
        Ok(self.delete_state_value(key)?)
    }

    /// Holds the SQLite write lock from the read through the write, so two
    /// processes updating the same key serialize instead of losing a write.
    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<String>) -> Result<Option<String>, HostError>,
    ) -> Result<Option<String>, HostError> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .map_err(StorageError::from)?;
        let current = tx
            .query_row(
                "SELECT value FROM document_state WHERE key = ?1",
                [key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(StorageError::from)?;

        let next = apply(current)?;
        match next.as_deref() {
            Some(value) => put_state_on(&tx, key, value)?,
            None => {
                tx.execute("DELETE FROM document_state WHERE key = ?1", [key])
                    .map_err(StorageError::from)?;
            }
        }
        tx.commit().map_err(StorageError::from)?;
        Ok(next)
    }
}
