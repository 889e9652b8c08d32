use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("invalid work item: {reason}")]
    InvalidWorkItem { reason: String },
}

/// One resolved output column. `logical_name` is `category_sub`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Field {
    pub logical_name: String,
    pub category_label: String,
    pub sub_label: String,
    pub column: u32,
}

/// Immutable header mapping of one sheet at one point in time. A refresh
/// builds a new snapshot; nothing mutates an existing one.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaSnapshot {
    pub sheet: String,
    pub version: u64,
    pub fingerprint: String,
    pub fields: Vec<Field>,
    #[serde(default)]
    pub duplicate_names: Vec<String>,
}

impl SchemaSnapshot {
    pub fn empty(sheet: impl Into<String>) -> Self {
        Self {
            sheet: sheet.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn field(&self, logical_name: &str) -> Option<&Field> {
        let wanted = logical_name.trim();
        self.fields
            .iter()
            .find(|field| field.logical_name == wanted)
    }

    pub fn column_index(&self, logical_name: &str) -> Option<u32> {
        self.field(logical_name).map(|field| field.column)
    }

    pub fn contains(&self, logical_name: &str) -> bool {
        self.field(logical_name).is_some()
    }

    pub fn max_column(&self) -> u32 {
        self.fields
            .iter()
            .map(|field| field.column)
            .max()
            .unwrap_or(0)
    }

    pub fn logical_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.logical_name.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkItem {
    pub source_row: u32,
    pub primary_key: String,
    #[serde(default)]
    pub secondary_key: Option<String>,
}

impl WorkItem {
    pub fn new(
        source_row: u32,
        primary_key: impl Into<String>,
        secondary_key: Option<String>,
    ) -> Result<Self, ContractError> {
        if source_row < crate::FIRST_DATA_ROW {
            return Err(ContractError::InvalidWorkItem {
                reason: format!(
                    "row {source_row} is above the first data row {}",
                    crate::FIRST_DATA_ROW
                ),
            });
        }
        let primary_key = primary_key.into().trim().to_string();
        if primary_key.is_empty() {
            return Err(ContractError::InvalidWorkItem {
                reason: format!("row {source_row} has an empty primary key"),
            });
        }
        Ok(Self {
            source_row,
            primary_key,
            secondary_key: secondary_key
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
        })
    }

    pub fn identity_label(&self) -> String {
        match self.secondary_key.as_deref() {
            Some(secondary) => format!("{} ({secondary})", self.primary_key),
            None => self.primary_key.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    NextN,
    All,
    Explicit,
}

impl JobMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NextN => "next_n",
            Self::All => "all",
            Self::Explicit => "explicit",
        }
    }
}

impl std::fmt::Display for JobMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchCounters {
    pub created: u64,
    pub skipped: u64,
    pub duplicate: u64,
    pub error: u64,
}

impl BatchCounters {
    /// Exactly one counter moves per outcome.
    pub fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Created { .. } => self.created += 1,
            Outcome::Skipped { .. } => self.skipped += 1,
            Outcome::Duplicate { .. } => self.duplicate += 1,
            Outcome::Error { .. } => self.error += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.created + self.skipped + self.duplicate + self.error
    }
}

impl std::fmt::Display for BatchCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "created={} skipped={} duplicate={} error={}",
            self.created, self.skipped, self.duplicate, self.error
        )
    }
}

/// The whole persisted job: queue, counters and stop flag travel together
/// as one value so every mutation is a single write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchJob {
    pub job_id: String,
    pub mode: JobMode,
    pub input_sheet: String,
    pub output_sheet: String,
    pub items: VecDeque<WorkItem>,
    pub total_queued: usize,
    pub counters: BatchCounters,
    pub stop_requested: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchJob {
    pub fn new(
        mode: JobMode,
        input_sheet: impl Into<String>,
        output_sheet: impl Into<String>,
        items: Vec<WorkItem>,
        now: DateTime<Utc>,
    ) -> Self {
        let total_queued = items.len();
        Self {
            job_id: Uuid::new_v4().to_string(),
            mode,
            input_sheet: input_sheet.into(),
            output_sheet: output_sheet.into(),
            items: items.into(),
            total_queued,
            counters: BatchCounters::default(),
            stop_requested: false,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn remaining(&self) -> usize {
        self.items.len()
    }

    pub fn to_json(&self) -> Result<String, ContractError> {
        serde_json::to_string(self).map_err(|err| ContractError::Serialization(err.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, ContractError> {
        serde_json::from_str(raw).map_err(|err| ContractError::Serialization(err.to_string()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputRecord {
    pub primary_key: String,
    #[serde(default)]
    pub secondary_key: Option<String>,
    pub fields: BTreeMap<String, String>,
}

/// Externally computed values for an existing row.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconciliationResult {
    #[serde(alias = "primaryKey")]
    pub primary_key: String,
    #[serde(default, alias = "secondaryKey")]
    pub secondary_key: Option<String>,
    pub patch: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RowErrorKind {
    Validation,
    Timeout,
    Service,
    Store,
    Schema,
}

impl RowErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Timeout => "timeout",
            Self::Service => "service",
            Self::Store => "store",
            Self::Schema => "schema",
        }
    }
}

impl std::fmt::Display for RowErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Created {
        row: u32,
        record: OutputRecord,
    },
    Skipped {
        reason: String,
    },
    Duplicate {
        primary_key: String,
        existing_row: Option<u32>,
    },
    Error {
        kind: RowErrorKind,
        message: String,
    },
}

impl Outcome {
    pub fn error(kind: RowErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Skipped { .. } => "skipped",
            Self::Duplicate { .. } => "duplicate",
            Self::Error { .. } => "error",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            Self::Created { row, .. } => format!("output row {row}"),
            Self::Skipped { reason } => reason.clone(),
            Self::Duplicate {
                primary_key,
                existing_row,
            } => match existing_row {
                Some(row) => format!("{primary_key} already at output row {row}"),
                None => format!("{primary_key} already present"),
            },
            Self::Error { kind, message } => format!("{kind}: {message}"),
        }
    }
}

/// Everything the completion service sees for one input row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionRequest {
    pub prompt_version: String,
    pub source_sheet: String,
    pub source_row: u32,
    pub primary_key: String,
    pub secondary_key: Option<String>,
    pub input_fields: BTreeMap<String, String>,
    pub target_fields: Vec<String>,
    pub required_fields: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletionOutput {
    pub fields: BTreeMap<String, Value>,
}

impl CompletionOutput {
    pub fn from_json_object(raw: &str) -> Result<Self, CompletionError> {
        let value: Value = serde_json::from_str(raw.trim()).map_err(|err| {
            CompletionError::new(
                CompletionFailureKind::InvalidOutput,
                format!("output is not json: {err}"),
            )
        })?;
        let Value::Object(map) = value else {
            return Err(CompletionError::new(
                CompletionFailureKind::InvalidOutput,
                "output must be a json object of field to value",
            ));
        };
        Ok(Self {
            fields: map.into_iter().collect(),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionFailureKind {
    Timeout,
    InvalidOutput,
    ProviderError,
    Transport,
}

impl CompletionFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::InvalidOutput => "invalid_output",
            Self::ProviderError => "provider_error",
            Self::Transport => "transport",
        }
    }
}

impl std::fmt::Display for CompletionFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("completion failed ({kind}): {message}")]
pub struct CompletionError {
    pub kind: CompletionFailureKind,
    pub message: String,
}

impl CompletionError {
    pub fn new(kind: CompletionFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionGuardrails {
    pub timeout_ms: u64,
}

impl Default for CompletionGuardrails {
    fn default() -> Self {
        Self { timeout_ms: 60_000 }
    }
}

pub trait CompletionService {
    fn service_name(&self) -> &str;

    fn complete(
        &self,
        request: &CompletionRequest,
        guardrails: &CompletionGuardrails,
    ) -> Result<CompletionOutput, CompletionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn work_item_rejects_header_rows_and_blank_keys() {
        assert!(WorkItem::new(2, "CASE-1", None).is_err());
        assert!(WorkItem::new(3, "   ", None).is_err());

        let item = WorkItem::new(3, " CASE-1 ", Some("  ".to_string())).expect("valid item");
        assert_eq!(item.primary_key, "CASE-1");
        assert_eq!(item.secondary_key, None);
    }

    #[test]
    fn counters_move_exactly_one_bucket_per_outcome() {
        let mut counters = BatchCounters::default();
        counters.record(&Outcome::Created {
            row: 3,
            record: OutputRecord::default(),
        });
        counters.record(&Outcome::skipped("blank"));
        counters.record(&Outcome::Duplicate {
            primary_key: "Z".to_string(),
            existing_row: Some(4),
        });
        counters.record(&Outcome::error(RowErrorKind::Timeout, "slow"));

        assert_eq!(counters.total(), 4);
        assert_eq!(counters.created, 1);
        assert_eq!(counters.error, 1);
        assert_eq!(
            counters.to_string(),
            "created=1 skipped=1 duplicate=1 error=1"
        );
    }

    #[test]
    fn batch_job_survives_persisted_json() {
        let items = vec![
            WorkItem::new(3, "A", None).expect("item"),
            WorkItem::new(5, "B", Some("legacy-b".to_string())).expect("item"),
        ];
        let job = BatchJob::new(JobMode::NextN, "Input", "Output", items, ts());
        let raw = job.to_json().expect("encode");
        let decoded = BatchJob::from_json(&raw).expect("decode");

        assert_eq!(decoded, job);
        assert_eq!(decoded.remaining(), 2);
        assert_eq!(decoded.total_queued, 2);
        assert!(raw.contains("\"mode\":\"next_n\""));
    }

    #[test]
    fn reconciliation_result_accepts_camel_case_keys() {
        let raw = r#"{"primaryKey":"X","patch":{"symptom":"S1"}}"#;
        let result: ReconciliationResult = serde_json::from_str(raw).expect("decode");
        assert_eq!(result.primary_key, "X");
        assert_eq!(result.secondary_key, None);
        assert_eq!(result.patch.get("symptom").map(String::as_str), Some("S1"));
    }

    #[test]
    fn completion_output_requires_json_object() {
        let err = CompletionOutput::from_json_object("[1,2]").expect_err("array rejected");
        assert_eq!(err.kind, CompletionFailureKind::InvalidOutput);

        let output =
            CompletionOutput::from_json_object(r#"{"Case_Summary": "chest pain", "Age": 0}"#)
                .expect("object accepted");
        assert_eq!(output.fields.len(), 2);
    }

    #[test]
    fn snapshot_lookup_trims_requested_name() {
        let snapshot = SchemaSnapshot {
            sheet: "Output".to_string(),
            version: 1,
            fingerprint: "abc".to_string(),
            fields: vec![Field {
                logical_name: "Case_Organization_Case_ID".to_string(),
                category_label: "Case_Organization".to_string(),
                sub_label: "Case_ID".to_string(),
                column: 4,
            }],
            duplicate_names: Vec::new(),
        };
        assert_eq!(
            snapshot.column_index(" Case_Organization_Case_ID "),
            Some(4)
        );
        assert_eq!(snapshot.column_index("missing"), None);
        assert_eq!(snapshot.max_column(), 4);
    }
}
