use casebook_core::{
    CompletionError, CompletionGuardrails, CompletionOutput, CompletionRequest, CompletionService,
    CellRange, KeyValueState, Outcome, ReconciliationResult, RowErrorKind, TabularStore,
};
use casebook_engine::{
    CaseEngine, DriverState, EngineConfig, EngineError, IdentityMatcher, LookupOrder, ScanRequest,
    SchemaResolver,
};
use casebook_storage::{CaseStore, MemoryWorkbook};
use serde_json::{json, Value};
use std::cell::Cell;
use std::collections::BTreeMap;
use tempfile::NamedTempFile;

const PRIMARY: &str = "Case_Organization_Case_ID";

/// Answers every request with a title derived from the key, unless the key
/// is listed in `omit_title`.
#[derive(Default)]
struct TitleService {
    omit_title: Vec<String>,
    calls: Cell<usize>,
}

impl CompletionService for TitleService {
    fn service_name(&self) -> &str {
        "title"
    }

    fn complete(
        &self,
        request: &CompletionRequest,
        _guardrails: &CompletionGuardrails,
    ) -> Result<CompletionOutput, CompletionError> {
        self.calls.set(self.calls.get() + 1);
        let mut fields = BTreeMap::new();
        if !self.omit_title.contains(&request.primary_key) {
            fields.insert(
                "Case_Organization_Spark_Title".to_string(),
                Value::String(format!("Spark {}", request.primary_key)),
            );
        }
        fields.insert(
            "Case_Organization_Reveal_Title".to_string(),
            Value::String(format!("Reveal {}", request.primary_key)),
        );
        fields.insert(
            "Patient_Demographics_and_Clinical_Data_Age".to_string(),
            json!(0),
        );
        Ok(CompletionOutput { fields })
    }
}

/// Writes the same key into the output sheet from inside the service call,
/// the way an overlapping job would.
struct RacingService<'a> {
    book: &'a MemoryWorkbook,
}

impl CompletionService for RacingService<'_> {
    fn service_name(&self) -> &str {
        "racing"
    }

    fn complete(
        &self,
        request: &CompletionRequest,
        _guardrails: &CompletionGuardrails,
    ) -> Result<CompletionOutput, CompletionError> {
        let next = self.book.last_row("Output").expect("last row") + 1;
        self.book
            .write_row("Output", next, &[request.primary_key.clone()])
            .expect("competing write");
        CompletionOutput::from_json_object(
            r#"{"Case_Organization_Spark_Title":"s","Case_Organization_Reveal_Title":"r"}"#,
        )
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        input_sheet: "Input".to_string(),
        output_sheet: "Output".to_string(),
        ..EngineConfig::default()
    }
}

const OUTPUT_CATEGORIES: &[&str] = &[
    "Case_Organization",
    "Case_Organization",
    "Case_Organization",
    "Case_Organization",
    "Patient_Demographics_and_Clinical_Data",
    "Patient_Demographics_and_Clinical_Data",
    "Case_Organization",
];
const OUTPUT_FIELDS: &[&str] = &[
    "Case_ID",
    "Legacy_Case_ID",
    "Spark_Title",
    "Reveal_Title",
    "Age",
    "Gender",
    "Symptom_Code",
];

fn workbook(input_keys: &[&str], output_keys: &[&str]) -> MemoryWorkbook {
    let mut input: Vec<Vec<&str>> = vec![
        vec!["Case_Organization", "Case_Organization", "Submission"],
        vec!["Case_ID", "Legacy_Case_ID", "Raw_Text"],
    ];
    for key in input_keys {
        input.push(vec![*key, "", "free text"]);
    }
    let mut output: Vec<Vec<&str>> = vec![OUTPUT_CATEGORIES.to_vec(), OUTPUT_FIELDS.to_vec()];
    for key in output_keys {
        output.push(vec![*key]);
    }

    let input_rows = input.iter().map(Vec::as_slice).collect::<Vec<_>>();
    let output_rows = output.iter().map(Vec::as_slice).collect::<Vec<_>>();
    MemoryWorkbook::new()
        .with_sheet("Input", &input_rows)
        .with_sheet("Output", &output_rows)
}

fn drain<C: CompletionService>(
    engine: &CaseEngine<C>,
    store: &dyn TabularStore,
    state: &dyn KeyValueState,
) -> Vec<Outcome> {
    let mut outcomes = Vec::new();
    for _ in 0..100 {
        let summary = engine.tick(store, state).expect("tick");
        match summary.processed {
            Some(record) => outcomes.push(record.outcome),
            None => {
                assert_ne!(summary.state, DriverState::Running);
                return outcomes;
            }
        }
    }
    panic!("job did not finish within 100 ticks");
}

fn output_keys(book: &MemoryWorkbook) -> Vec<String> {
    let snapshot = SchemaResolver::new(book, book)
        .refresh("Output")
        .expect("snapshot");
    IdentityMatcher::load(book, &snapshot, PRIMARY, None, LookupOrder::PrimaryFirst)
        .expect("matcher")
        .rows()
        .iter()
        .map(|row| row.primary_key.clone())
        .collect()
}

#[test]
fn next_n_queues_only_undone_rows() {
    let book = workbook(&["A", "B", "C"], &["A"]);
    let engine = CaseEngine::new(config(), TitleService::default());

    let summary = engine
        .start_job(&book, &book, &ScanRequest::NextN(2))
        .expect("start");
    assert_eq!(summary.rows, vec![4, 5]);

    let outcomes = drain(&engine, &book, &book);
    assert!(outcomes
        .iter()
        .all(|outcome| matches!(outcome, Outcome::Created { .. })));
    assert_eq!(output_keys(&book), vec!["A", "B", "C"]);
}

#[test]
fn missing_required_field_appends_nothing() {
    let book = workbook(&["A"], &[]);
    let service = TitleService {
        omit_title: vec!["A".to_string()],
        ..TitleService::default()
    };
    let engine = CaseEngine::new(config(), service);

    engine
        .start_job(&book, &book, &ScanRequest::All)
        .expect("start");
    let outcomes = drain(&engine, &book, &book);

    assert!(matches!(
        outcomes.as_slice(),
        [Outcome::Error { kind: RowErrorKind::Validation, .. }]
    ));
    assert!(output_keys(&book).is_empty());
    let last = engine
        .queue_status(&book)
        .expect("status")
        .last_finished
        .expect("finished job");
    assert_eq!(last.counters.error, 1);
    assert_eq!(last.counters.created, 0);
}

#[test]
fn every_tick_moves_exactly_one_counter() {
    let book = workbook(&["A", "", "B", "C"], &["C"]);
    let service = TitleService {
        omit_title: vec!["B".to_string()],
        ..TitleService::default()
    };
    let engine = CaseEngine::new(config(), service);
    engine
        .start_job(&book, &book, &ScanRequest::explicit("3-6"))
        .expect("start");

    let mut previous = 0;
    loop {
        let summary = engine.tick(&book, &book).expect("tick");
        if summary.processed.is_none() {
            break;
        }
        assert_eq!(summary.counters.total(), previous + 1);
        previous = summary.counters.total();
    }

    let finished = engine
        .queue_status(&book)
        .expect("status")
        .last_finished
        .expect("finished");
    assert_eq!(finished.counters.created, 1);
    assert_eq!(finished.counters.error, 1);
    assert_eq!(finished.counters.duplicate, 1);
    assert_eq!(finished.total_queued, 3);
}

#[test]
fn scans_after_a_run_find_nothing_new() {
    let book = workbook(&["A", "B"], &[]);
    let engine = CaseEngine::new(config(), TitleService::default());
    engine
        .start_job(&book, &book, &ScanRequest::All)
        .expect("start");
    drain(&engine, &book, &book);

    let again = engine
        .start_job(&book, &book, &ScanRequest::All)
        .expect("rescan");
    assert!(again.job_id.is_none());
    assert_eq!(again.already_processed, 2);
    assert_eq!(engine.service().calls.get(), 2);
}

#[test]
fn overlapping_write_is_reported_as_duplicate() {
    let book = workbook(&["Z"], &[]);
    let engine = CaseEngine::new(config(), RacingService { book: &book });
    engine
        .start_job(&book, &book, &ScanRequest::All)
        .expect("start");

    let outcomes = drain(&engine, &book, &book);
    assert_eq!(
        outcomes,
        vec![Outcome::Duplicate {
            primary_key: "Z".to_string(),
            existing_row: Some(3),
        }]
    );
    assert_eq!(output_keys(&book), vec!["Z"]);
}

#[test]
fn second_job_is_rejected_while_the_first_runs() {
    let book = workbook(&["A", "B"], &[]);
    let engine = CaseEngine::new(config(), TitleService::default());
    engine
        .start_job(&book, &book, &ScanRequest::NextN(1))
        .expect("start");
    let err = engine
        .start_job(&book, &book, &ScanRequest::All)
        .expect_err("running job");
    assert!(matches!(err, EngineError::JobAlreadyRunning { remaining: 1, .. }));
}

#[test]
fn reconciliation_reports_absent_keys_and_is_idempotent() {
    let book = workbook(&[], &["A", "B"]);
    let engine = CaseEngine::new(config(), TitleService::default());
    let before = book.snapshot_cells("Output");

    let missing = engine
        .apply_reconciliation(
            &book,
            &book,
            &[ReconciliationResult {
                primary_key: "X".to_string(),
                secondary_key: None,
                patch: BTreeMap::from([(
                    "Case_Organization_Symptom_Code".to_string(),
                    "CP".to_string(),
                )]),
            }],
        )
        .expect("apply");
    assert_eq!((missing.applied, missing.not_found, missing.errors), (0, 1, 0));
    assert_eq!(book.snapshot_cells("Output"), before);

    let results: Vec<ReconciliationResult> = serde_json::from_value(json!([
        {
            "primaryKey": "B",
            "secondaryKey": "stale",
            "patch": {"Case_Organization_Symptom_Code": "SOB"}
        }
    ]))
    .expect("results");
    engine
        .apply_reconciliation(&book, &book, &results)
        .expect("first");
    let once = book.snapshot_cells("Output");
    engine
        .apply_reconciliation(&book, &book, &results)
        .expect("second");
    assert_eq!(book.snapshot_cells("Output"), once);
    assert_eq!(book.cell("Output", 4, 7), "SOB");
}

#[test]
fn inserted_column_mid_job_still_writes_by_name() {
    let book = workbook(&["A", "B"], &[]);
    let engine = CaseEngine::new(config(), TitleService::default());
    engine
        .start_job(&book, &book, &ScanRequest::All)
        .expect("start");
    engine.tick(&book, &book).expect("first row");

    book.insert_column("Output", 1).expect("insert column");
    book.set_range(
        "Output",
        1,
        1,
        &[vec!["Review".to_string()], vec!["Status".to_string()]],
    )
    .expect("label new column");
    drain(&engine, &book, &book);

    assert_eq!(book.cell("Output", 3, 2), "A");
    assert_eq!(book.cell("Output", 4, 2), "B");
    assert_eq!(book.cell("Output", 4, 4), "Spark B");
    assert_eq!(book.cell("Output", 4, 6), "0");
    assert_eq!(book.cell("Output", 4, 7), "unknown");
    assert_eq!(book.cell("Output", 4, 1), "");

    let snapshot = engine
        .refresh_schema(&book, &book, "Output")
        .expect("refresh");
    assert_eq!(snapshot.version, 2);
}

#[test]
fn sqlite_backed_job_resumes_across_reopen() {
    let file = NamedTempFile::new().expect("temp db");
    let seed = workbook(&["A", "B"], &[]);
    {
        let store = CaseStore::open(file.path()).expect("open");
        for sheet in ["Input", "Output"] {
            store.create_sheet(sheet).expect("create sheet");
            let cells = seed.snapshot_cells(sheet);
            for ((row, col), value) in cells {
                store
                    .set_range(sheet, row, col, &[vec![value]])
                    .expect("seed cell");
            }
        }
        let engine = CaseEngine::new(config(), TitleService::default());
        engine
            .start_job(&store, &store, &ScanRequest::All)
            .expect("start");
        engine.tick(&store, &store).expect("tick");
    }

    let store = CaseStore::open(file.path()).expect("reopen");
    let engine = CaseEngine::new(config(), TitleService::default());
    let status = engine.queue_status(&store).expect("status");
    assert_eq!(status.state, DriverState::Running);
    assert_eq!(status.remaining, 1);
    assert_eq!(status.counters.created, 1);

    let outcomes = drain(&engine, &store, &store);
    assert_eq!(outcomes.len(), 1);
    assert_eq!(engine.service().calls.get(), 1);
    assert_eq!(
        store.get_range("Output", CellRange::new(3, 1, 2, 1))
            .expect("keys"),
        vec![vec!["A".to_string()], vec!["B".to_string()]]
    );
}
