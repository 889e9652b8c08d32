pub mod driver;
pub mod identity;
pub mod processor;
pub mod queue;
pub mod reconcile;
pub mod scanner;
pub mod schema;

use casebook_core::{
    CompletionService, HostError, KeyValueState, ReconciliationResult, SchemaSnapshot,
    TabularStore, UNKNOWN_SENTINEL,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub use driver::{BatchDriver, DriverState, JobSummary, QueueStatus, TickRecord, TickSummary};
pub use identity::{DuplicateKey, IdentityMatcher, LookupOrder, MatchTier, RowMatch};
pub use processor::RowProcessor;
pub use queue::{BatchQueue, FinishedJob, JobEnd, Recorded};
pub use reconcile::{ReconciliationApplier, ReconciliationReport};
pub use scanner::{RowScanner, ScanReport, ScanRequest};
pub use schema::{SchemaError, SchemaResolver};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("host error: {0}")]
    Host(#[from] HostError),
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("job {job_id} is still running with {remaining} queued item(s); stop it first")]
    JobAlreadyRunning { job_id: String, remaining: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IdentityConfig {
    pub primary_field: String,
    pub secondary_field: Option<String>,
    /// Input-sheet key fields; default to the output names.
    pub input_primary_field: Option<String>,
    pub input_secondary_field: Option<String>,
    pub lookup_order: LookupOrder,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            primary_field: "Case_Organization_Case_ID".to_string(),
            secondary_field: Some("Case_Organization_Legacy_Case_ID".to_string()),
            input_primary_field: None,
            input_secondary_field: None,
            lookup_order: LookupOrder::PrimaryFirst,
        }
    }
}

impl IdentityConfig {
    pub fn input_primary(&self) -> &str {
        self.input_primary_field
            .as_deref()
            .unwrap_or(&self.primary_field)
    }

    pub fn input_secondary(&self) -> Option<&str> {
        self.input_secondary_field
            .as_deref()
            .or(self.secondary_field.as_deref())
    }

    pub fn is_key_field(&self, logical_name: &str) -> bool {
        logical_name == self.primary_field
            || self.secondary_field.as_deref() == Some(logical_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProcessingConfig {
    pub required_fields: Vec<String>,
    /// Written when the model omits the field. Only applies to fields the
    /// output sheet actually has.
    pub defaults: BTreeMap<String, String>,
    pub timeout_ms: u64,
    pub prompt_version: String,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        let defaults = [
            "Patient_Demographics_and_Clinical_Data_Age",
            "Patient_Demographics_and_Clinical_Data_Gender",
            "Case_Organization_Difficulty_Level",
            "Developer_and_QA_Metadata_Simulation_Quality_Score",
        ]
        .into_iter()
        .map(|name| (name.to_string(), UNKNOWN_SENTINEL.to_string()))
        .collect();

        Self {
            required_fields: vec![
                "Case_Organization_Spark_Title".to_string(),
                "Case_Organization_Reveal_Title".to_string(),
            ],
            defaults,
            timeout_ms: 60_000,
            prompt_version: "case-convert-v1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconcileConfig {
    pub results_sheet: String,
    pub header_row: u32,
    pub primary_column: String,
    pub secondary_column: Option<String>,
    /// Results-sheet header to logical output field.
    pub columns: BTreeMap<String, String>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        let columns = [
            ("Final_Symptom_Code", "Case_Organization_Symptom_Code"),
            ("Final_System_Code", "Case_Organization_System_Code"),
            ("Final_Symptom_Name", "Case_Organization_Symptom_Name"),
            ("Final_System_Name", "Case_Organization_System_Name"),
        ]
        .into_iter()
        .map(|(header, field)| (header.to_string(), field.to_string()))
        .collect();

        Self {
            results_sheet: "AI_Categorization_Results".to_string(),
            header_row: 1,
            primary_column: "Case_Organization_Case_ID".to_string(),
            secondary_column: Some("Legacy_Case_ID".to_string()),
            columns,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub input_sheet: String,
    pub output_sheet: String,
    pub next_n: usize,
    pub identity: IdentityConfig,
    pub processing: ProcessingConfig,
    pub reconcile: ReconcileConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            input_sheet: "Input".to_string(),
            output_sheet: "Master Scenario Convert".to_string(),
            next_n: 25,
            identity: IdentityConfig::default(),
            processing: ProcessingConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

/// Entry points a host exposes: the batch driver trigger and the
/// reconciliation trigger. Holds no document state of its own.
pub struct CaseEngine<C> {
    config: EngineConfig,
    service: C,
}

impl<C: CompletionService> CaseEngine<C> {
    pub fn new(config: EngineConfig, service: C) -> Self {
        Self { config, service }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn service(&self) -> &C {
        &self.service
    }

    pub fn driver<'a>(
        &'a self,
        store: &'a dyn TabularStore,
        state: &'a dyn KeyValueState,
    ) -> BatchDriver<'a> {
        BatchDriver::new(store, state, &self.service, &self.config)
    }

    pub fn start_job(
        &self,
        store: &dyn TabularStore,
        state: &dyn KeyValueState,
        request: &ScanRequest,
    ) -> Result<JobSummary, EngineError> {
        self.driver(store, state).start_job(request)
    }

    pub fn tick(
        &self,
        store: &dyn TabularStore,
        state: &dyn KeyValueState,
    ) -> Result<TickSummary, EngineError> {
        self.driver(store, state).tick()
    }

    pub fn stop_job(&self, state: &dyn KeyValueState) -> Result<bool, EngineError> {
        BatchQueue::new(state).request_stop()
    }

    pub fn queue_status(&self, state: &dyn KeyValueState) -> Result<QueueStatus, EngineError> {
        driver::queue_status(state)
    }

    pub fn apply_reconciliation(
        &self,
        store: &dyn TabularStore,
        state: &dyn KeyValueState,
        results: &[ReconciliationResult],
    ) -> Result<ReconciliationReport, EngineError> {
        ReconciliationApplier::new(store, state, &self.config).apply(results)
    }

    pub fn reconcile_from_sheet(
        &self,
        store: &dyn TabularStore,
        state: &dyn KeyValueState,
    ) -> Result<ReconciliationReport, EngineError> {
        let applier = ReconciliationApplier::new(store, state, &self.config);
        let results = applier.load_results_from_sheet()?;
        applier.apply(&results)
    }

    pub fn refresh_schema(
        &self,
        store: &dyn TabularStore,
        state: &dyn KeyValueState,
        sheet: &str,
    ) -> Result<SchemaSnapshot, EngineError> {
        Ok(SchemaResolver::new(store, state).refresh(sheet)?)
    }

    /// Primary keys that occur on more than one data row of `sheet`.
    pub fn duplicate_report(
        &self,
        store: &dyn TabularStore,
        state: &dyn KeyValueState,
        sheet: &str,
    ) -> Result<Vec<DuplicateKey>, EngineError> {
        let snapshot = SchemaResolver::new(store, state).refresh(sheet)?;
        let (primary, secondary) = if sheet == self.config.input_sheet {
            (
                self.config.identity.input_primary(),
                self.config.identity.input_secondary(),
            )
        } else {
            (
                self.config.identity.primary_field.as_str(),
                self.config.identity.secondary_field.as_deref(),
            )
        };
        let matcher = IdentityMatcher::load(
            store,
            &snapshot,
            primary,
            secondary,
            self.config.identity.lookup_order,
        )?;
        Ok(matcher.duplicate_keys())
    }
}
