use anyhow::{Context, Result};
use casebook_core::{CellRange, TabularStore};
use casebook_storage::CaseStore;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Clear the sheet and write the file from row 1.
    Replace,
    /// Write below the last used row, dropping the file's first `skip_rows`
    /// lines (usually its two header rows).
    Append { skip_rows: usize },
}

/// Loads a CSV file into `sheet`, creating the sheet when needed. Returns
/// the number of rows written.
pub fn import_csv(store: &CaseStore, sheet: &str, path: &Path, mode: ImportMode) -> Result<usize> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let skip = match mode {
        ImportMode::Replace => 0,
        ImportMode::Append { skip_rows } => skip_rows,
    };
    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("bad csv record {}", index + 1))?;
        if index < skip {
            continue;
        }
        let mut values = record.iter().map(str::to_string).collect::<Vec<_>>();
        while values.last().is_some_and(|value| value.is_empty()) {
            values.pop();
        }
        rows.push(values);
    }

    store.create_sheet(sheet)?;
    let start = match mode {
        ImportMode::Replace => {
            store.clear_sheet(sheet)?;
            1
        }
        ImportMode::Append { .. } => store.last_row(sheet)? + 1,
    };
    if !rows.is_empty() {
        store
            .set_range(sheet, start, 1, &rows)
            .with_context(|| format!("failed to write rows into {sheet}"))?;
    }
    info!(
        event = "csv_imported",
        sheet = %sheet,
        path = %path.display(),
        first_row = start,
        rows = rows.len()
    );
    Ok(rows.len())
}

/// Writes every row up to the last used one. Blank rows are kept so row
/// numbers survive a round trip through the file.
pub fn export_csv(store: &dyn TabularStore, sheet: &str, path: &Path) -> Result<usize> {
    let last_row = store.last_row(sheet)?;
    let last_col = store.last_column(sheet)?;
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;

    if last_row > 0 && last_col > 0 {
        let grid = store.get_range(sheet, CellRange::new(1, 1, last_row, last_col))?;
        for mut record in grid {
            let used = record
                .iter()
                .rposition(|value| !value.is_empty())
                .map(|index| index + 1)
                .unwrap_or(1);
            record.truncate(used);
            writer.write_record(&record)?;
        }
    }
    writer.flush()?;
    info!(event = "csv_exported", sheet = %sheet, path = %path.display(), rows = last_row);
    Ok(last_row as usize)
}
