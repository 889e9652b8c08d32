pub mod case_contracts;
pub mod host;

pub use case_contracts::{
    BatchCounters, BatchJob, CompletionError, CompletionFailureKind, CompletionGuardrails,
    CompletionOutput, CompletionRequest, CompletionService, ContractError, Field, JobMode,
    Outcome, OutputRecord, ReconciliationResult, RowErrorKind, SchemaSnapshot, WorkItem,
};
pub use host::{Appended, CellRange, HostError, KeyValueState, TabularStore};

/// Row 1 carries category labels, row 2 field labels.
pub const CATEGORY_HEADER_ROW: u32 = 1;
pub const FIELD_HEADER_ROW: u32 = 2;
pub const FIRST_DATA_ROW: u32 = 3;

/// Written when the model omits an optional field that has no better
/// default. Distinct from a legitimate zero.
pub const UNKNOWN_SENTINEL: &str = "unknown";

/// Cell text as compared for identity: surrounding whitespace ignored.
pub fn normalize_cell(value: &str) -> &str {
    value.trim()
}

/// Truncated row list for status lines, e.g. `[3, 4, 5, ...]`.
pub fn preview_rows(rows: &[u32], limit: usize) -> String {
    let shown = rows
        .iter()
        .take(limit)
        .map(|row| row.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    if rows.len() > limit {
        format!("[{shown}, ...]")
    } else {
        format!("[{shown}]")
    }
}
