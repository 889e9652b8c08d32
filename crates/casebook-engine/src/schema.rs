use casebook_core::{
    CellRange, Field, HostError, KeyValueState, SchemaSnapshot, TabularStore,
    CATEGORY_HEADER_ROW, FIELD_HEADER_ROW,
};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info, warn};

const SCHEMA_CACHE_PREFIX: &str = "casebook.schema.";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("host error: {0}")]
    Host(#[from] HostError),
    #[error("sheet {sheet} has no mapped columns (two header rows required)")]
    NoMappedColumns { sheet: String },
    #[error("sheet {sheet} has no column for field {field}")]
    MissingField { sheet: String, field: String },
    #[error("cached schema for {sheet} is unreadable: {reason}")]
    Cache { sheet: String, reason: String },
}

pub fn schema_cache_key(sheet: &str) -> String {
    format!("{SCHEMA_CACHE_PREFIX}{sheet}")
}

/// Rebuilds header snapshots from the sheet itself. The persisted copy is
/// for display and version numbering only; callers always work from the
/// snapshot `refresh` returns.
pub struct SchemaResolver<'a> {
    store: &'a dyn TabularStore,
    state: &'a dyn KeyValueState,
}

impl<'a> SchemaResolver<'a> {
    pub fn new(store: &'a dyn TabularStore, state: &'a dyn KeyValueState) -> Self {
        Self { store, state }
    }

    pub fn refresh(&self, sheet: &str) -> Result<SchemaSnapshot, SchemaError> {
        let last_row = self.store.last_row(sheet)?;
        let (fields, duplicate_names) = if last_row < FIELD_HEADER_ROW {
            (Vec::new(), Vec::new())
        } else {
            let last_col = self.store.last_column(sheet)?;
            let headers = self.store.get_range(
                sheet,
                CellRange::new(CATEGORY_HEADER_ROW, 1, 2, last_col),
            )?;
            let empty = Vec::new();
            let categories = headers.first().unwrap_or(&empty);
            let labels = headers.get(1).unwrap_or(&empty);
            merge_header_rows(categories, labels)
        };

        for name in &duplicate_names {
            warn!(
                event = "schema_duplicate_field",
                sheet = %sheet,
                field = %name,
                "duplicate header ignored; first occurrence wins"
            );
        }

        let fingerprint = fingerprint_fields(&fields);
        let previous = match self.cached(sheet) {
            Ok(previous) => previous,
            Err(err) => {
                warn!(event = "schema_cache_unreadable", sheet = %sheet, error = %err);
                None
            }
        };
        let version = match previous.as_ref() {
            Some(previous) if previous.fingerprint == fingerprint => previous.version,
            Some(previous) => {
                info!(
                    event = "schema_changed",
                    sheet = %sheet,
                    from_version = previous.version,
                    to_version = previous.version + 1,
                    fields = fields.len()
                );
                previous.version + 1
            }
            None => 1,
        };

        let snapshot = SchemaSnapshot {
            sheet: sheet.to_string(),
            version,
            fingerprint,
            fields,
            duplicate_names,
        };

        let encoded = serde_json::to_string(&snapshot).map_err(|err| SchemaError::Cache {
            sheet: sheet.to_string(),
            reason: err.to_string(),
        })?;
        self.state.set(&schema_cache_key(sheet), &encoded)?;
        debug!(
            event = "schema_refreshed",
            sheet = %sheet,
            version = snapshot.version,
            fields = snapshot.len()
        );

        Ok(snapshot)
    }

    pub fn cached(&self, sheet: &str) -> Result<Option<SchemaSnapshot>, SchemaError> {
        let Some(raw) = self.state.get(&schema_cache_key(sheet))? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| SchemaError::Cache {
                sheet: sheet.to_string(),
                reason: err.to_string(),
            })
    }
}

/// Merges category and field label rows into `category_field` names.
/// Columns with either label blank are skipped; on duplicate names the
/// first column wins and the name is reported.
pub fn merge_header_rows(categories: &[String], labels: &[String]) -> (Vec<Field>, Vec<String>) {
    let mut seen = BTreeSet::new();
    let mut fields = Vec::new();
    let mut duplicates = Vec::new();

    for (index, category) in categories.iter().enumerate() {
        let category = category.trim();
        let label = labels.get(index).map(|value| value.trim()).unwrap_or("");
        if category.is_empty() || label.is_empty() {
            continue;
        }

        let logical_name = format!("{category}_{label}");
        if !seen.insert(logical_name.clone()) {
            duplicates.push(logical_name);
            continue;
        }

        fields.push(Field {
            logical_name,
            category_label: category.to_string(),
            sub_label: label.to_string(),
            column: index as u32 + 1,
        });
    }

    (fields, duplicates)
}

pub fn column_index(snapshot: &SchemaSnapshot, logical_name: &str) -> Option<u32> {
    snapshot.column_index(logical_name)
}

/// Hard stop for any unit of work that would otherwise run blind.
pub fn require_mapped(snapshot: &SchemaSnapshot) -> Result<(), SchemaError> {
    if snapshot.is_empty() {
        return Err(SchemaError::NoMappedColumns {
            sheet: snapshot.sheet.clone(),
        });
    }
    Ok(())
}

pub fn require_column(snapshot: &SchemaSnapshot, logical_name: &str) -> Result<u32, SchemaError> {
    require_mapped(snapshot)?;
    snapshot
        .column_index(logical_name)
        .ok_or_else(|| SchemaError::MissingField {
            sheet: snapshot.sheet.clone(),
            field: logical_name.to_string(),
        })
}

fn fingerprint_fields(fields: &[Field]) -> String {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field.logical_name.as_bytes());
        hasher.update(b"@");
        hasher.update(field.column.to_string().as_bytes());
        hasher.update(b"|");
    }
    let digest = hasher.finalize();
    let mut output = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
