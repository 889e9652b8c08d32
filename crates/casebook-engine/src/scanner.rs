use crate::identity::{IdentityMatcher, KeyedRow};
use casebook_core::{JobMode, WorkItem, FIRST_DATA_ROW};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanRequest {
    NextN(usize),
    All,
    Explicit(Vec<String>),
}

impl ScanRequest {
    /// Parses an operator row list such as `5, 10-12; CASE-7`.
    pub fn explicit(spec: &str) -> Self {
        Self::Explicit(parse_explicit(spec))
    }

    pub fn mode(&self) -> JobMode {
        match self {
            Self::NextN(_) => JobMode::NextN,
            Self::All => JobMode::All,
            Self::Explicit(_) => JobMode::Explicit,
        }
    }
}

pub fn parse_explicit(spec: &str) -> Vec<String> {
    spec.split([',', ';', '\n'])
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Row(u32),
    Range(u32, u32),
    Key(String),
}

fn classify(token: &str) -> Token {
    if let Ok(row) = token.parse::<u32>() {
        return Token::Row(row);
    }
    if let Some((start, end)) = token.split_once('-') {
        if let (Ok(start), Ok(end)) = (start.trim().parse::<u32>(), end.trim().parse::<u32>()) {
            return Token::Range(start.min(end), start.max(end));
        }
    }
    Token::Key(token.to_string())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanReport {
    pub items: Vec<WorkItem>,
    pub skipped_blank: Vec<u32>,
    pub unresolved: Vec<String>,
    pub duplicate_input: Vec<u32>,
    pub already_processed: usize,
}

impl ScanReport {
    pub fn rows(&self) -> Vec<u32> {
        self.items.iter().map(|item| item.source_row).collect()
    }
}

/// Decides which input rows still need work. The processed set is the
/// output sheet's primary keys at construction time.
pub struct RowScanner<'a> {
    input: &'a IdentityMatcher,
    processed: BTreeSet<String>,
}

impl<'a> RowScanner<'a> {
    pub fn new(input: &'a IdentityMatcher, output: &IdentityMatcher) -> Self {
        Self {
            input,
            processed: output.primary_keys(),
        }
    }

    pub fn scan(&self, request: &ScanRequest) -> ScanReport {
        let report = match request {
            ScanRequest::NextN(limit) => self.walk(Some(*limit)),
            ScanRequest::All => self.walk(None),
            ScanRequest::Explicit(tokens) => self.explicit(tokens),
        };
        info!(
            event = "scan_complete",
            sheet = %self.input.sheet(),
            mode = %request.mode(),
            queued = report.items.len(),
            skipped_blank = report.skipped_blank.len(),
            unresolved = report.unresolved.len(),
            already_processed = report.already_processed
        );
        report
    }

    pub fn next_n(&self, limit: usize) -> Vec<WorkItem> {
        self.scan(&ScanRequest::NextN(limit)).items
    }

    pub fn all(&self) -> Vec<WorkItem> {
        self.scan(&ScanRequest::All).items
    }

    fn walk(&self, limit: Option<usize>) -> ScanReport {
        let mut report = ScanReport::default();
        let mut seen = BTreeSet::new();
        if limit == Some(0) {
            return report;
        }

        for row in self.input.rows() {
            if row.primary_key.is_empty() {
                self.note_blank(row.row, &mut report);
                continue;
            }
            if self.processed.contains(&row.primary_key) {
                report.already_processed += 1;
                continue;
            }
            if !seen.insert(row.primary_key.clone()) {
                debug!(
                    event = "scan_repeated_key",
                    sheet = %self.input.sheet(),
                    row = row.row,
                    key = %row.primary_key
                );
                report.duplicate_input.push(row.row);
                continue;
            }

            self.push_item(row, &mut report);
            if limit.is_some_and(|limit| report.items.len() >= limit) {
                break;
            }
        }
        report
    }

    /// Explicit selection ignores the processed set so operators can force
    /// a re-run; the write-time guard still reports an existing key.
    fn explicit(&self, tokens: &[String]) -> ScanReport {
        let mut report = ScanReport::default();
        let mut selected = BTreeSet::new();
        let last_row = self.input.last_row();

        for token in tokens {
            match classify(token) {
                Token::Row(row) if (FIRST_DATA_ROW..=last_row).contains(&row) => {
                    selected.insert(row);
                }
                Token::Range(start, end) => {
                    let start = start.max(FIRST_DATA_ROW);
                    let end = end.min(last_row);
                    if start > end {
                        report.unresolved.push(token.clone());
                    } else {
                        selected.extend(start..=end);
                    }
                }
                Token::Key(key) => match self.input.find_row(&key) {
                    Some(row) => {
                        selected.insert(row);
                    }
                    None => report.unresolved.push(token.clone()),
                },
                Token::Row(_) => report.unresolved.push(token.clone()),
            }
        }

        for token in &report.unresolved {
            warn!(
                event = "scan_unresolved_token",
                sheet = %self.input.sheet(),
                token = %token,
                last_row
            );
        }

        for row in selected {
            match self.input.key_row(row) {
                Some(keyed) if !keyed.primary_key.is_empty() => self.push_item(keyed, &mut report),
                _ => self.note_blank(row, &mut report),
            }
        }
        report
    }

    fn push_item(&self, row: &KeyedRow, report: &mut ScanReport) {
        match WorkItem::new(row.row, row.primary_key.clone(), row.secondary_key.clone()) {
            Ok(item) => report.items.push(item),
            Err(err) => {
                warn!(event = "scan_invalid_row", row = row.row, error = %err);
                report.skipped_blank.push(row.row);
            }
        }
    }

    fn note_blank(&self, row: u32, report: &mut ScanReport) {
        info!(
            event = "scan_blank_key",
            sheet = %self.input.sheet(),
            row,
            "row has no primary key; not queued"
        );
        report.skipped_blank.push(row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LookupOrder;
    use crate::schema::SchemaResolver;
    use casebook_core::TabularStore;
    use casebook_storage::MemoryWorkbook;

    const PRIMARY: &str = "Case_Organization_Case_ID";
    const SECONDARY: &str = "Case_Organization_Legacy_Case_ID";

    fn load(book: &MemoryWorkbook, sheet: &str) -> IdentityMatcher {
        let snapshot = SchemaResolver::new(book, book).refresh(sheet).expect("snapshot");
        IdentityMatcher::load(book, &snapshot, PRIMARY, Some(SECONDARY), LookupOrder::PrimaryFirst)
            .expect("matcher")
    }

    fn book(input_keys: &[&str], output_keys: &[&str]) -> MemoryWorkbook {
        let book = MemoryWorkbook::new();
        for (sheet, keys) in [("Input", input_keys), ("Output", output_keys)] {
            book.add_sheet(sheet);
            book.write_row(
                sheet,
                1,
                &["Case_Organization".to_string(), "Case_Organization".to_string()],
            )
            .expect("category row");
            book.write_row(sheet, 2, &["Case_ID".to_string(), "Legacy_Case_ID".to_string()])
                .expect("field row");
            for (offset, key) in keys.iter().enumerate() {
                book.write_row(
                    sheet,
                    FIRST_DATA_ROW + offset as u32,
                    &[key.to_string(), format!("legacy-{offset}")],
                )
                .expect("data row");
            }
        }
        book
    }

    #[test]
    fn next_n_skips_rows_already_in_output() {
        let book = book(&["A", "B", "C"], &["A"]);
        let input = load(&book, "Input");
        let output = load(&book, "Output");
        let report = RowScanner::new(&input, &output).scan(&ScanRequest::NextN(2));

        let keys = report.items.iter().map(|item| item.primary_key.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["B", "C"]);
        assert_eq!(report.rows(), vec![4, 5]);
        assert_eq!(report.already_processed, 1);
        assert_eq!(report.items[0].secondary_key.as_deref(), Some("legacy-1"));
    }

    #[test]
    fn all_skips_blank_keys_and_repeated_input() {
        let book = book(&["A", "", "B", "A", "C"], &[]);
        let input = load(&book, "Input");
        let output = load(&book, "Output");
        let report = RowScanner::new(&input, &output).scan(&ScanRequest::All);

        assert_eq!(report.rows(), vec![3, 5, 7]);
        assert_eq!(report.skipped_blank, vec![4]);
        assert_eq!(report.duplicate_input, vec![6]);
    }

    #[test]
    fn next_zero_queues_nothing() {
        let book = book(&["A"], &[]);
        let input = load(&book, "Input");
        let output = load(&book, "Output");
        assert!(RowScanner::new(&input, &output).next_n(0).is_empty());
    }

    #[test]
    fn explicit_forces_processed_rows_and_collapses_repeats() {
        let book = book(&["A", "B", "", "D"], &["A", "B"]);
        let input = load(&book, "Input");
        let output = load(&book, "Output");
        let request = ScanRequest::explicit("6, 3-4; B\n1, 99, 40-50, NOPE, 5");
        let report = RowScanner::new(&input, &output).scan(&request);

        assert_eq!(report.rows(), vec![3, 4, 6]);
        assert_eq!(report.skipped_blank, vec![5]);
        assert_eq!(
            report.unresolved,
            vec!["1".to_string(), "99".to_string(), "40-50".to_string(), "NOPE".to_string()]
        );
    }

    #[test]
    fn token_classification() {
        assert_eq!(classify("12"), Token::Row(12));
        assert_eq!(classify("9-5"), Token::Range(5, 9));
        assert_eq!(classify("GI-12"), Token::Key("GI-12".to_string()));
        assert_eq!(parse_explicit(" 3 ,, 4 ;"), vec!["3".to_string(), "4".to_string()]);
    }
}
