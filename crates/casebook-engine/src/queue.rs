use crate::EngineError;
use casebook_core::{
    BatchCounters, BatchJob, HostError, JobMode, KeyValueState, Outcome, WorkItem,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const JOB_STATE_KEY: &str = "casebook.batch.job";
pub const LAST_SUMMARY_KEY: &str = "casebook.batch.last_summary";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobEnd {
    Completed,
    Stopped,
    Aborted,
}

impl JobEnd {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Aborted => "aborted",
        }
    }
}

/// What is left of a job once its record is cleared.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FinishedJob {
    pub job_id: String,
    pub mode: JobMode,
    pub input_sheet: String,
    pub output_sheet: String,
    pub total_queued: usize,
    pub unprocessed: usize,
    pub counters: BatchCounters,
    pub end: JobEnd,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl FinishedJob {
    pub fn status_line(&self) -> String {
        format!(
            "job {} {} ({}): {} of {} processed, {}",
            self.job_id,
            self.end.as_str(),
            self.mode,
            self.counters.total(),
            self.total_queued,
            self.counters
        )
    }
}

fn decode(raw: &str) -> Result<BatchJob, HostError> {
    BatchJob::from_json(raw).map_err(|err| HostError::Serialization(err.to_string()))
}

fn encode(job: &BatchJob) -> Result<String, HostError> {
    job.to_json()
        .map_err(|err| HostError::Serialization(err.to_string()))
}

/// Result of [`BatchQueue::record_outcome`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Counted(BatchJob),
    /// An overlapping tick already popped and counted the item.
    AlreadyCounted,
    /// The job was finished or replaced while the item ran.
    JobGone,
}

/// The persisted job record. Queue, counters and stop flag live in one
/// value under [`JOB_STATE_KEY`]; each method is one `update` of that key.
pub struct BatchQueue<'a> {
    state: &'a dyn KeyValueState,
}

impl<'a> BatchQueue<'a> {
    pub fn new(state: &'a dyn KeyValueState) -> Self {
        Self { state }
    }

    pub fn load(&self) -> Result<Option<BatchJob>, EngineError> {
        match self.state.get(JOB_STATE_KEY)? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Persists a new job. A job that still has queued items and no stop
    /// request is never replaced.
    pub fn enqueue(
        &self,
        mode: JobMode,
        input_sheet: &str,
        output_sheet: &str,
        items: Vec<WorkItem>,
        now: DateTime<Utc>,
    ) -> Result<BatchJob, EngineError> {
        let job = BatchJob::new(mode, input_sheet, output_sheet, items, now);
        let encoded = encode(&job)?;
        let mut conflict: Option<(String, usize)> = None;
        let mut replaced: Option<String> = None;

        self.state.update(JOB_STATE_KEY, &mut |current| {
            if let Some(raw) = current.as_deref() {
                let existing = decode(raw)?;
                if existing.remaining() > 0 && !existing.stop_requested {
                    conflict = Some((existing.job_id.clone(), existing.remaining()));
                    return Ok(Some(raw.to_string()));
                }
                replaced = Some(existing.job_id);
            }
            Ok(Some(encoded.clone()))
        })?;

        if let Some((job_id, remaining)) = conflict {
            return Err(EngineError::JobAlreadyRunning { job_id, remaining });
        }
        if let Some(previous) = replaced {
            warn!(event = "batch_job_replaced", previous_job_id = %previous, job_id = %job.job_id);
        }
        info!(
            event = "batch_enqueued",
            job_id = %job.job_id,
            mode = %job.mode,
            queued = job.total_queued
        );
        Ok(job)
    }

    /// The item the next tick works on. It stays queued until
    /// [`BatchQueue::record_outcome`] pops it, so a tick that dies mid-call
    /// leaves it for the next one.
    pub fn peek_next(&self) -> Result<Option<(String, WorkItem)>, EngineError> {
        Ok(self.load()?.and_then(|job| {
            let item = job.items.front().cloned()?;
            Some((job.job_id, item))
        }))
    }

    /// Pops `item` and moves exactly one counter, in one update. Nothing is
    /// counted unless `job_id` is still the stored job and `item` is still
    /// at its front.
    pub fn record_outcome(
        &self,
        job_id: &str,
        item: &WorkItem,
        outcome: &Outcome,
    ) -> Result<Recorded, EngineError> {
        let mut recorded = Recorded::JobGone;
        self.state.update(JOB_STATE_KEY, &mut |current| {
            let Some(raw) = current else {
                return Ok(None);
            };
            let mut job = decode(&raw)?;
            if job.job_id != job_id {
                recorded = Recorded::JobGone;
                return Ok(Some(raw));
            }
            if job.items.front() != Some(item) {
                recorded = Recorded::AlreadyCounted;
                return Ok(Some(raw));
            }
            job.items.pop_front();
            job.counters.record(outcome);
            job.updated_at = Utc::now();
            let encoded = encode(&job)?;
            recorded = Recorded::Counted(job);
            Ok(Some(encoded))
        })?;

        match &recorded {
            Recorded::Counted(_) => {}
            Recorded::AlreadyCounted => warn!(
                event = "batch_item_already_counted",
                job_id = %job_id,
                row = item.source_row,
                outcome = outcome.label()
            ),
            Recorded::JobGone => warn!(
                event = "batch_outcome_without_job",
                job_id = %job_id,
                row = item.source_row,
                outcome = outcome.label(),
                "job no longer active; outcome not counted"
            ),
        }
        Ok(recorded)
    }

    /// Observed at the next tick boundary. Returns false when no job exists.
    pub fn request_stop(&self) -> Result<bool, EngineError> {
        let mut found = false;
        self.state.update(JOB_STATE_KEY, &mut |current| {
            let Some(raw) = current else {
                return Ok(None);
            };
            let mut job = decode(&raw)?;
            job.stop_requested = true;
            job.updated_at = Utc::now();
            found = true;
            encode(&job).map(Some)
        })?;
        if found {
            info!(event = "batch_stop_requested");
        }
        Ok(found)
    }

    pub fn is_empty(&self) -> Result<bool, EngineError> {
        Ok(self
            .load()?
            .map(|job| job.items.is_empty())
            .unwrap_or(true))
    }

    /// Deletes the record of `job_id` and keeps its summary under
    /// [`LAST_SUMMARY_KEY`]. A different stored job is left alone.
    pub fn finish(
        &self,
        job_id: &str,
        end: JobEnd,
        now: DateTime<Utc>,
    ) -> Result<Option<FinishedJob>, EngineError> {
        let mut cleared = None;
        self.state.update(JOB_STATE_KEY, &mut |current| {
            let Some(raw) = current else {
                return Ok(None);
            };
            let job = decode(&raw)?;
            if job.job_id != job_id {
                return Ok(Some(raw));
            }
            cleared = Some(job);
            Ok(None)
        })?;

        let Some(job) = cleared else {
            return Ok(None);
        };
        let summary = FinishedJob {
            job_id: job.job_id,
            mode: job.mode,
            input_sheet: job.input_sheet,
            output_sheet: job.output_sheet,
            total_queued: job.total_queued,
            unprocessed: job.items.len(),
            counters: job.counters,
            end,
            started_at: job.started_at,
            finished_at: now,
        };
        let encoded = serde_json::to_string(&summary)
            .map_err(|err| HostError::Serialization(err.to_string()))?;
        self.state.set(LAST_SUMMARY_KEY, &encoded)?;
        debug!(event = "batch_cleared", job_id = %summary.job_id, end = summary.end.as_str());
        Ok(Some(summary))
    }

    pub fn last_summary(&self) -> Result<Option<FinishedJob>, EngineError> {
        let Some(raw) = self.state.get(LAST_SUMMARY_KEY)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| HostError::Serialization(err.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casebook_core::{OutputRecord, RowErrorKind};
    use casebook_storage::MemoryWorkbook;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn items(keys: &[&str]) -> Vec<WorkItem> {
        keys.iter()
            .enumerate()
            .map(|(offset, key)| WorkItem::new(3 + offset as u32, *key, None).expect("item"))
            .collect()
    }

    fn created(row: u32) -> Outcome {
        Outcome::Created {
            row,
            record: OutputRecord::default(),
        }
    }

    #[test]
    fn items_leave_the_queue_only_when_counted() {
        let book = MemoryWorkbook::new();
        let queue = BatchQueue::new(&book);
        let job = queue
            .enqueue(JobMode::All, "Input", "Output", items(&["A", "B"]), ts())
            .expect("enqueue");

        let (job_id, first) = queue.peek_next().expect("peek").expect("item");
        assert_eq!(job_id, job.job_id);
        assert_eq!(first.primary_key, "A");

        let reopened = BatchQueue::new(&book);
        let (_, again) = reopened.peek_next().expect("peek").expect("item");
        assert_eq!(again, first);
        assert_eq!(reopened.load().expect("load").expect("job").remaining(), 2);

        let Recorded::Counted(updated) = reopened
            .record_outcome(&job_id, &first, &created(10))
            .expect("record")
        else {
            panic!("outcome should be counted");
        };
        assert_eq!(updated.remaining(), 1);
        assert_eq!(
            reopened.peek_next().expect("peek").map(|(_, item)| item.primary_key),
            Some("B".to_string())
        );
        assert!(!reopened.is_empty().expect("is_empty"));
    }

    #[test]
    fn overlapping_ticks_count_an_item_once() {
        let book = MemoryWorkbook::new();
        let queue = BatchQueue::new(&book);
        queue
            .enqueue(JobMode::All, "Input", "Output", items(&["A", "B"]), ts())
            .expect("enqueue");
        let (job_id, item) = queue.peek_next().expect("peek").expect("item");

        assert!(matches!(
            queue.record_outcome(&job_id, &item, &created(10)).expect("first"),
            Recorded::Counted(_)
        ));
        assert_eq!(
            queue
                .record_outcome(
                    &job_id,
                    &item,
                    &Outcome::Duplicate {
                        primary_key: "A".to_string(),
                        existing_row: Some(10),
                    },
                )
                .expect("second"),
            Recorded::AlreadyCounted
        );

        let job = queue.load().expect("load").expect("job");
        assert_eq!(job.counters.total(), 1);
        assert_eq!(job.counters.created, 1);
        assert_eq!(job.remaining(), 1);
    }

    #[test]
    fn outcome_for_a_replaced_job_is_not_credited_to_the_new_one() {
        let book = MemoryWorkbook::new();
        let queue = BatchQueue::new(&book);
        queue
            .enqueue(JobMode::All, "Input", "Output", items(&["A"]), ts())
            .expect("enqueue");
        let (old_id, item) = queue.peek_next().expect("peek").expect("item");

        assert!(queue.request_stop().expect("stop"));
        let replacement = queue
            .enqueue(JobMode::All, "Input", "Output", items(&["A"]), ts())
            .expect("replace stopped job");

        assert_eq!(
            queue.record_outcome(&old_id, &item, &created(10)).expect("record"),
            Recorded::JobGone
        );
        assert!(queue.finish(&old_id, JobEnd::Aborted, ts()).expect("finish").is_none());

        let current = queue.load().expect("load").expect("job");
        assert_eq!(current.job_id, replacement.job_id);
        assert_eq!(current.counters, BatchCounters::default());
        assert_eq!(current.remaining(), 1);
    }

    #[test]
    fn enqueue_refuses_to_replace_a_running_job() {
        let book = MemoryWorkbook::new();
        let queue = BatchQueue::new(&book);
        let running = queue
            .enqueue(JobMode::NextN, "Input", "Output", items(&["A"]), ts())
            .expect("enqueue");

        let err = queue
            .enqueue(JobMode::All, "Input", "Output", items(&["B"]), ts())
            .expect_err("second job rejected");
        match err {
            EngineError::JobAlreadyRunning { job_id, remaining } => {
                assert_eq!(job_id, running.job_id);
                assert_eq!(remaining, 1);
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(queue.request_stop().expect("stop"));
        let replacement = queue
            .enqueue(JobMode::All, "Input", "Output", items(&["B"]), ts())
            .expect("stopped job can be replaced");
        assert_ne!(replacement.job_id, running.job_id);
    }

    #[test]
    fn record_outcome_moves_one_counter_and_finish_keeps_summary() {
        let book = MemoryWorkbook::new();
        let queue = BatchQueue::new(&book);
        let started = queue
            .enqueue(JobMode::All, "Input", "Output", items(&["A", "B", "C"]), ts())
            .expect("enqueue");

        let (job_id, item) = queue.peek_next().expect("peek").expect("item");
        queue.record_outcome(&job_id, &item, &created(3)).expect("record");
        let (job_id, item) = queue.peek_next().expect("peek").expect("item");
        let failed = Outcome::error(RowErrorKind::Validation, "missing title");
        let Recorded::Counted(job) = queue.record_outcome(&job_id, &item, &failed).expect("record")
        else {
            panic!("outcome should be counted");
        };
        assert_eq!(job.counters.total(), 2);
        assert_eq!(job.counters.created, 1);
        assert_eq!(job.counters.error, 1);

        let summary = queue
            .finish(&started.job_id, JobEnd::Stopped, ts())
            .expect("finish")
            .expect("summary");
        assert_eq!(summary.unprocessed, 1);
        assert_eq!(summary.end, JobEnd::Stopped);
        assert!(queue.load().expect("load").is_none());
        assert_eq!(book.state_keys(), vec![LAST_SUMMARY_KEY.to_string()]);
        assert_eq!(queue.last_summary().expect("summary"), Some(summary));
    }

    #[test]
    fn outcomes_without_a_job_are_not_counted() {
        let book = MemoryWorkbook::new();
        let queue = BatchQueue::new(&book);
        let item = items(&["A"]).remove(0);
        assert_eq!(
            queue
                .record_outcome("missing", &item, &Outcome::skipped("blank"))
                .expect("record"),
            Recorded::JobGone
        );
        assert!(queue.peek_next().expect("peek").is_none());
        assert!(!queue.request_stop().expect("stop"));
        assert!(queue
            .finish("missing", JobEnd::Completed, ts())
            .expect("finish")
            .is_none());
        assert!(book.state_keys().is_empty());
    }
}
