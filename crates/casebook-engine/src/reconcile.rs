use crate::identity::{IdentityMatcher, MatchTier};
use crate::schema::{require_column, SchemaError, SchemaResolver};
use crate::{EngineConfig, EngineError};
use casebook_core::{
    normalize_cell, CellRange, HostError, KeyValueState, ReconciliationResult, SchemaSnapshot,
    TabularStore,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub const RECONCILE_REPORT_KEY: &str = "casebook.reconcile.last_report";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub applied: usize,
    pub not_found: usize,
    pub errors: usize,
    /// Of `applied`, how many resolved only through the secondary key.
    pub secondary_matches: usize,
    pub not_found_keys: Vec<String>,
    pub error_details: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

impl ReconciliationReport {
    fn new() -> Self {
        Self {
            applied: 0,
            not_found: 0,
            errors: 0,
            secondary_matches: 0,
            not_found_keys: Vec::new(),
            error_details: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    pub fn status_line(&self) -> String {
        format!(
            "applied={} not_found={} errors={}",
            self.applied, self.not_found, self.errors
        )
    }

    fn fail(&mut self, label: &str, reason: String) {
        warn!(event = "reconcile_result_rejected", result = %label, reason = %reason);
        self.errors += 1;
        self.error_details.push(format!("{label}: {reason}"));
    }
}

/// Writes externally computed values into rows that already exist. Never
/// appends a row; a result whose fields do not all resolve writes nothing.
pub struct ReconciliationApplier<'a> {
    store: &'a dyn TabularStore,
    state: &'a dyn KeyValueState,
    config: &'a EngineConfig,
}

impl<'a> ReconciliationApplier<'a> {
    pub fn new(
        store: &'a dyn TabularStore,
        state: &'a dyn KeyValueState,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            store,
            state,
            config,
        }
    }

    pub fn apply(
        &self,
        results: &[ReconciliationResult],
    ) -> Result<ReconciliationReport, EngineError> {
        let identity = &self.config.identity;
        let sheet = self.config.output_sheet.as_str();
        let snapshot = SchemaResolver::new(self.store, self.state).refresh(sheet)?;
        require_column(&snapshot, &identity.primary_field)?;
        let matcher = IdentityMatcher::load(
            self.store,
            &snapshot,
            &identity.primary_field,
            identity.secondary_field.as_deref(),
            identity.lookup_order,
        )?;

        let mut report = ReconciliationReport::new();
        for result in results {
            let primary = normalize_cell(&result.primary_key);
            let secondary = result
                .secondary_key
                .as_deref()
                .map(normalize_cell)
                .filter(|key| !key.is_empty());
            let label = match (primary.is_empty(), secondary) {
                (false, _) => primary.to_string(),
                (true, Some(secondary)) => secondary.to_string(),
                (true, None) => {
                    report.fail("<blank>", "result has no primary or secondary key".to_string());
                    continue;
                }
            };

            let Some(found) = matcher.find_row_with_fallback(primary, secondary) else {
                warn!(
                    event = "reconcile_not_found",
                    primary_key = %primary,
                    secondary_key = secondary.unwrap_or("")
                );
                report.not_found += 1;
                report.not_found_keys.push(label);
                continue;
            };

            let cells = match self.resolve_patch(&snapshot, result) {
                Ok(cells) => cells,
                Err(reason) => {
                    report.fail(&label, reason);
                    continue;
                }
            };

            if let Err(err) = self.write_cells(sheet, found.row, &cells) {
                report.fail(&label, format!("write to row {} failed: {err}", found.row));
                continue;
            }
            if found.tier == MatchTier::Secondary {
                report.secondary_matches += 1;
            }
            debug!(
                event = "reconcile_applied",
                key = %label,
                row = found.row,
                tier = ?found.tier,
                fields = cells.len()
            );
            report.applied += 1;
        }

        report.completed_at = Utc::now();
        let encoded = serde_json::to_string(&report)
            .map_err(|err| HostError::Serialization(err.to_string()))?;
        self.state.set(RECONCILE_REPORT_KEY, &encoded)?;
        info!(
            event = "reconcile_complete",
            sheet = %sheet,
            results = results.len(),
            applied = report.applied,
            not_found = report.not_found,
            errors = report.errors,
            secondary_matches = report.secondary_matches
        );
        Ok(report)
    }

    pub fn last_report(&self) -> Result<Option<ReconciliationReport>, EngineError> {
        let Some(raw) = self.state.get(RECONCILE_REPORT_KEY)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| HostError::Serialization(err.to_string()).into())
    }

    /// Reads the results sheet: one header row, then one result per row.
    /// Rows without a key or without any non-blank mapped value are skipped.
    pub fn load_results_from_sheet(&self) -> Result<Vec<ReconciliationResult>, EngineError> {
        let settings = &self.config.reconcile;
        let sheet = settings.results_sheet.as_str();
        let last_row = self.store.last_row(sheet)?;
        let last_col = self.store.last_column(sheet)?;
        if last_row <= settings.header_row || last_col == 0 {
            return Ok(Vec::new());
        }

        let headers = self
            .store
            .get_range(sheet, CellRange::new(settings.header_row, 1, 1, last_col))?
            .into_iter()
            .next()
            .unwrap_or_default();
        let position = |name: &str| headers.iter().position(|header| header.trim() == name.trim());

        let primary_index = position(settings.primary_column.as_str()).ok_or_else(|| {
            SchemaError::MissingField {
                sheet: sheet.to_string(),
                field: settings.primary_column.clone(),
            }
        })?;
        let secondary_index = settings
            .secondary_column
            .as_deref()
            .and_then(|name| position(name));

        let mut mapped = Vec::new();
        for (header, field) in &settings.columns {
            match position(header.as_str()) {
                Some(index) => mapped.push((index, field.clone())),
                None => warn!(event = "reconcile_column_missing", sheet = %sheet, header = %header),
            }
        }
        if mapped.is_empty() {
            return Err(SchemaError::NoMappedColumns {
                sheet: sheet.to_string(),
            }
            .into());
        }

        let data_start = settings.header_row + 1;
        let rows = self.store.get_range(
            sheet,
            CellRange::new(data_start, 1, last_row - settings.header_row, last_col),
        )?;

        let cell = |row: &[String], index: usize| {
            row.get(index)
                .map(|value| normalize_cell(value).to_string())
                .unwrap_or_default()
        };
        let mut results = Vec::new();
        for (offset, row) in rows.iter().enumerate() {
            let primary_key = cell(row.as_slice(), primary_index);
            let secondary_key = secondary_index
                .map(|index| cell(row.as_slice(), index))
                .filter(|value| !value.is_empty());
            let patch = mapped
                .iter()
                .map(|(index, field)| (field.clone(), cell(row.as_slice(), *index)))
                .filter(|(_, value)| !value.is_empty())
                .collect::<BTreeMap<_, _>>();

            if (primary_key.is_empty() && secondary_key.is_none()) || patch.is_empty() {
                debug!(
                    event = "reconcile_row_skipped",
                    sheet = %sheet,
                    row = data_start + offset as u32
                );
                continue;
            }
            results.push(ReconciliationResult {
                primary_key,
                secondary_key,
                patch,
            });
        }
        Ok(results)
    }

    fn resolve_patch(
        &self,
        snapshot: &SchemaSnapshot,
        result: &ReconciliationResult,
    ) -> Result<Vec<(u32, String)>, String> {
        let mut cells = Vec::new();
        for (name, value) in &result.patch {
            let name = name.trim();
            if self.config.identity.is_key_field(name) {
                return Err(format!("key field {name} cannot be patched"));
            }
            let column = snapshot
                .column_index(name)
                .ok_or_else(|| format!("unknown field {name}"))?;
            let value = value.trim();
            if !value.is_empty() {
                cells.push((column, value.to_string()));
            }
        }
        if cells.is_empty() {
            return Err("patch has no values".to_string());
        }
        Ok(cells)
    }

    fn write_cells(&self, sheet: &str, row: u32, cells: &[(u32, String)]) -> Result<(), HostError> {
        for (column, value) in cells {
            self.store
                .set_range(sheet, row, *column, &[vec![value.clone()]])?;
        }
        Ok(())
    }
}
