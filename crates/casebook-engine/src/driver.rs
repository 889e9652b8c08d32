use crate::identity::IdentityMatcher;
use crate::processor::RowProcessor;
use crate::queue::{BatchQueue, FinishedJob, JobEnd, Recorded};
use crate::scanner::{RowScanner, ScanRequest};
use crate::schema::{require_column, SchemaResolver};
use crate::{EngineConfig, EngineError};
use casebook_core::{
    preview_rows, BatchCounters, CompletionService, JobMode, KeyValueState, Outcome, RowErrorKind,
    TabularStore,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

const PREVIEW_ROWS: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickRecord {
    pub source_row: u32,
    pub identity: String,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickSummary {
    pub state: DriverState,
    pub job_id: Option<String>,
    pub processed: Option<TickRecord>,
    pub remaining: usize,
    pub counters: BatchCounters,
    pub finished: Option<FinishedJob>,
    pub status_line: String,
}

impl TickSummary {
    fn closed(state: DriverState, finished: Option<FinishedJob>, fallback: &str) -> Self {
        let status_line = finished
            .as_ref()
            .map(FinishedJob::status_line)
            .unwrap_or_else(|| fallback.to_string());
        Self {
            state,
            job_id: finished.as_ref().map(|job| job.job_id.clone()),
            processed: None,
            remaining: finished.as_ref().map(|job| job.unprocessed).unwrap_or(0),
            counters: finished.as_ref().map(|job| job.counters).unwrap_or_default(),
            finished,
            status_line,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobSummary {
    pub job_id: Option<String>,
    pub mode: JobMode,
    pub queued: usize,
    pub rows: Vec<u32>,
    pub skipped_blank: Vec<u32>,
    pub unresolved: Vec<String>,
    pub already_processed: usize,
    pub status_line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStatus {
    pub state: DriverState,
    pub job_id: Option<String>,
    pub mode: Option<JobMode>,
    pub remaining: usize,
    pub total_queued: usize,
    pub counters: BatchCounters,
    pub stop_requested: bool,
    pub last_finished: Option<FinishedJob>,
}

pub fn queue_status(state: &dyn KeyValueState) -> Result<QueueStatus, EngineError> {
    let queue = BatchQueue::new(state);
    let last_finished = queue.last_summary()?;
    Ok(match queue.load()? {
        Some(job) => QueueStatus {
            state: if job.stop_requested {
                DriverState::Stopped
            } else {
                DriverState::Running
            },
            job_id: Some(job.job_id.clone()),
            mode: Some(job.mode),
            remaining: job.remaining(),
            total_queued: job.total_queued,
            counters: job.counters,
            stop_requested: job.stop_requested,
            last_finished,
        },
        None => QueueStatus {
            state: DriverState::Idle,
            job_id: None,
            mode: None,
            remaining: 0,
            total_queued: 0,
            counters: BatchCounters::default(),
            stop_requested: false,
            last_finished,
        },
    })
}

/// One-row-per-tick state machine. Nothing is carried between ticks except
/// the persisted job record.
pub struct BatchDriver<'a> {
    store: &'a dyn TabularStore,
    state: &'a dyn KeyValueState,
    service: &'a dyn CompletionService,
    config: &'a EngineConfig,
}

impl<'a> BatchDriver<'a> {
    pub fn new(
        store: &'a dyn TabularStore,
        state: &'a dyn KeyValueState,
        service: &'a dyn CompletionService,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            store,
            state,
            service,
            config,
        }
    }

    pub fn start_job(&self, request: &ScanRequest) -> Result<JobSummary, EngineError> {
        let identity = &self.config.identity;
        let resolver = SchemaResolver::new(self.store, self.state);
        let input_schema = resolver.refresh(&self.config.input_sheet)?;
        let output_schema = resolver.refresh(&self.config.output_sheet)?;
        require_column(&input_schema, identity.input_primary())?;
        require_column(&output_schema, &identity.primary_field)?;

        let input = IdentityMatcher::load(
            self.store,
            &input_schema,
            identity.input_primary(),
            identity.input_secondary(),
            identity.lookup_order,
        )?;
        let output = IdentityMatcher::load(
            self.store,
            &output_schema,
            &identity.primary_field,
            identity.secondary_field.as_deref(),
            identity.lookup_order,
        )?;
        let report = RowScanner::new(&input, &output).scan(request);
        let rows = report.rows();
        let mode = request.mode();

        if report.items.is_empty() {
            let status_line = format!(
                "{mode}: nothing to queue ({} already processed, {} blank, {} unresolved)",
                report.already_processed,
                report.skipped_blank.len(),
                report.unresolved.len()
            );
            info!(event = "batch_nothing_to_queue", mode = %mode);
            return Ok(JobSummary {
                job_id: None,
                mode,
                queued: 0,
                rows,
                skipped_blank: report.skipped_blank,
                unresolved: report.unresolved,
                already_processed: report.already_processed,
                status_line,
            });
        }

        let job = BatchQueue::new(self.state).enqueue(
            mode,
            &self.config.input_sheet,
            &self.config.output_sheet,
            report.items,
            Utc::now(),
        )?;
        let status_line = format!(
            "job {} ({mode}) queued {} row(s) {}",
            job.job_id,
            job.total_queued,
            preview_rows(&rows, PREVIEW_ROWS)
        );
        info!(
            event = "batch_started",
            job_id = %job.job_id,
            mode = %mode,
            queued = job.total_queued,
            rows = %preview_rows(&rows, PREVIEW_ROWS)
        );

        Ok(JobSummary {
            job_id: Some(job.job_id),
            mode,
            queued: job.total_queued,
            rows,
            skipped_blank: report.skipped_blank,
            unresolved: report.unresolved,
            already_processed: report.already_processed,
            status_line,
        })
    }

    /// Advances the job by at most one row.
    pub fn tick(&self) -> Result<TickSummary, EngineError> {
        let queue = BatchQueue::new(self.state);
        let Some(job) = queue.load()? else {
            return Ok(TickSummary::closed(DriverState::Idle, None, "idle: no active job"));
        };

        if job.stop_requested {
            let finished = queue.finish(&job.job_id, JobEnd::Stopped, Utc::now())?;
            info!(event = "batch_stopped", job_id = %job.job_id, counters = %job.counters);
            return Ok(TickSummary::closed(DriverState::Stopped, finished, "stopped"));
        }

        let Some(item) = job.items.front().cloned() else {
            let finished = queue.finish(&job.job_id, JobEnd::Completed, Utc::now())?;
            info!(event = "batch_completed", job_id = %job.job_id, counters = %job.counters);
            return Ok(TickSummary::closed(DriverState::Idle, finished, "idle"));
        };

        let processor = RowProcessor::new(
            self.store,
            self.state,
            self.service,
            &self.config.identity,
            &self.config.processing,
        );
        let outcome = match processor.process_one(&job.input_sheet, &job.output_sheet, &item) {
            Ok(outcome) => outcome,
            Err(err) => {
                let failed = Outcome::error(RowErrorKind::Schema, err.to_string());
                queue.record_outcome(&job.job_id, &item, &failed)?;
                queue.finish(&job.job_id, JobEnd::Aborted, Utc::now())?;
                error!(
                    event = "batch_aborted",
                    job_id = %job.job_id,
                    row = item.source_row,
                    error = %err
                );
                return Err(err.into());
            }
        };

        let (remaining, counters) = match queue.record_outcome(&job.job_id, &item, &outcome)? {
            Recorded::Counted(updated) => (updated.remaining(), updated.counters),
            Recorded::AlreadyCounted | Recorded::JobGone => queue
                .load()?
                .filter(|current| current.job_id == job.job_id)
                .map(|current| (current.remaining(), current.counters))
                .unwrap_or((0, job.counters)),
        };
        let identity = item.identity_label();
        if let Outcome::Error { kind, message } = &outcome {
            warn!(
                event = "batch_row_error",
                job_id = %job.job_id,
                row = item.source_row,
                kind = kind.as_str(),
                message = %message
            );
        }
        info!(
            event = "batch_tick",
            job_id = %job.job_id,
            row = item.source_row,
            identity = %identity,
            outcome = outcome.label(),
            detail = %outcome.detail(),
            remaining,
            counters = %counters
        );

        let status_line = format!(
            "row {} {identity}: {} ({}); {remaining} remaining; {counters}",
            item.source_row,
            outcome.label(),
            outcome.detail()
        );
        Ok(TickSummary {
            state: DriverState::Running,
            job_id: Some(job.job_id),
            processed: Some(TickRecord {
                source_row: item.source_row,
                identity,
                outcome,
            }),
            remaining,
            counters,
            finished: None,
            status_line,
        })
    }

    pub fn stop(&self) -> Result<bool, EngineError> {
        BatchQueue::new(self.state).request_stop()
    }

    pub fn status(&self) -> Result<QueueStatus, EngineError> {
        queue_status(self.state)
    }
}
