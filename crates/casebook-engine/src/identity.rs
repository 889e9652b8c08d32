use crate::schema::{require_column, SchemaError};
use casebook_core::{normalize_cell, CellRange, SchemaSnapshot, TabularStore, FIRST_DATA_ROW};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LookupOrder {
    #[default]
    PrimaryFirst,
    SecondaryFirst,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowMatch {
    pub row: u32,
    pub tier: MatchTier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedRow {
    pub row: u32,
    pub primary_key: String,
    pub secondary_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DuplicateKey {
    pub key: String,
    pub rows: Vec<u32>,
}

/// Key columns of one sheet, read once from the current snapshot. Data rows
/// with a blank primary key are kept so callers can report them.
#[derive(Debug, Clone)]
pub struct IdentityMatcher {
    sheet: String,
    order: LookupOrder,
    rows: Vec<KeyedRow>,
    last_row: u32,
}

impl IdentityMatcher {
    pub fn load(
        store: &dyn TabularStore,
        snapshot: &SchemaSnapshot,
        primary_field: &str,
        secondary_field: Option<&str>,
        order: LookupOrder,
    ) -> Result<Self, SchemaError> {
        let sheet = snapshot.sheet.as_str();
        let primary_col = require_column(snapshot, primary_field)?;
        let secondary_col = secondary_field.and_then(|name| snapshot.column_index(name));
        let last_row = store.last_row(sheet)?;

        let mut rows = Vec::new();
        if last_row >= FIRST_DATA_ROW {
            let primary = store.get_range(
                sheet,
                CellRange::column(primary_col, FIRST_DATA_ROW, last_row),
            )?;
            let secondary = match secondary_col {
                Some(col) => Some(store.get_range(
                    sheet,
                    CellRange::column(col, FIRST_DATA_ROW, last_row),
                )?),
                None => None,
            };

            for (offset, cells) in primary.iter().enumerate() {
                let secondary_key = secondary
                    .as_ref()
                    .and_then(|column| column.get(offset))
                    .and_then(|cells| cells.first())
                    .map(|value| normalize_cell(value).to_string())
                    .filter(|value| !value.is_empty());
                rows.push(KeyedRow {
                    row: FIRST_DATA_ROW + offset as u32,
                    primary_key: cells
                        .first()
                        .map(|value| normalize_cell(value).to_string())
                        .unwrap_or_default(),
                    secondary_key,
                });
            }
        }

        Ok(Self {
            sheet: sheet.to_string(),
            order,
            rows,
            last_row,
        })
    }

    pub fn sheet(&self) -> &str {
        &self.sheet
    }

    pub fn last_row(&self) -> u32 {
        self.last_row
    }

    pub fn rows(&self) -> &[KeyedRow] {
        &self.rows
    }

    pub fn key_row(&self, row: u32) -> Option<&KeyedRow> {
        row.checked_sub(FIRST_DATA_ROW)
            .and_then(|offset| self.rows.get(offset as usize))
    }

    pub fn find_row(&self, primary_key: &str) -> Option<u32> {
        self.find_by(primary_key, "primary", |row| Some(row.primary_key.as_str()))
    }

    pub fn find_row_by_secondary(&self, secondary_key: &str) -> Option<u32> {
        self.find_by(secondary_key, "secondary", |row| row.secondary_key.as_deref())
    }

    /// Tiered lookup. A stale key on the fallback tier never blocks a match
    /// on the preferred tier.
    pub fn find_row_with_fallback(
        &self,
        primary_key: &str,
        secondary_key: Option<&str>,
    ) -> Option<RowMatch> {
        let by_primary = || {
            self.find_row(primary_key).map(|row| RowMatch {
                row,
                tier: MatchTier::Primary,
            })
        };
        let by_secondary = || {
            secondary_key
                .and_then(|key| self.find_row_by_secondary(key))
                .map(|row| RowMatch {
                    row,
                    tier: MatchTier::Secondary,
                })
        };

        match self.order {
            LookupOrder::PrimaryFirst => by_primary().or_else(by_secondary),
            LookupOrder::SecondaryFirst => by_secondary().or_else(by_primary),
        }
    }

    pub fn contains_primary(&self, primary_key: &str) -> bool {
        let wanted = normalize_cell(primary_key);
        !wanted.is_empty() && self.rows.iter().any(|row| row.primary_key == wanted)
    }

    pub fn primary_keys(&self) -> BTreeSet<String> {
        self.rows
            .iter()
            .filter(|row| !row.primary_key.is_empty())
            .map(|row| row.primary_key.clone())
            .collect()
    }

    pub fn duplicate_keys(&self) -> Vec<DuplicateKey> {
        let mut grouped: BTreeMap<&str, Vec<u32>> = BTreeMap::new();
        for row in &self.rows {
            if !row.primary_key.is_empty() {
                grouped.entry(row.primary_key.as_str()).or_default().push(row.row);
            }
        }
        grouped
            .into_iter()
            .filter(|(_, rows)| rows.len() > 1)
            .map(|(key, rows)| DuplicateKey {
                key: key.to_string(),
                rows,
            })
            .collect()
    }

    fn find_by(
        &self,
        key: &str,
        tier: &'static str,
        pick: impl Fn(&KeyedRow) -> Option<&str>,
    ) -> Option<u32> {
        let wanted = normalize_cell(key);
        if wanted.is_empty() {
            return None;
        }

        let mut matches = self
            .rows
            .iter()
            .filter(|row| pick(row) == Some(wanted))
            .map(|row| row.row);
        let first = matches.next()?;
        let extra = matches.count();
        if extra > 0 {
            warn!(
                event = "identity_duplicate_key",
                sheet = %self.sheet,
                tier,
                key = %wanted,
                first_row = first,
                other_rows = extra,
                "duplicate key; using first match"
            );
        }
        Some(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaResolver;
    use casebook_storage::MemoryWorkbook;

    const PRIMARY: &str = "Case_Organization_Case_ID";
    const SECONDARY: &str = "Case_Organization_Legacy_Case_ID";

    fn book() -> MemoryWorkbook {
        MemoryWorkbook::new().with_sheet(
            "Output",
            &[
                &["Case_Organization", "Case_Organization", "Case_Organization"],
                &["Case_ID", "Legacy_Case_ID", "Spark_Title"],
                &["A", "old-a", "Alpha"],
                &[" B ", "old-b", "Beta"],
                &["", "orphan", "Nobody"],
                &["A", "old-a2", "Alpha again"],
            ],
        )
    }

    fn matcher(book: &MemoryWorkbook, order: LookupOrder) -> IdentityMatcher {
        let snapshot = SchemaResolver::new(book, book)
            .refresh("Output")
            .expect("snapshot");
        IdentityMatcher::load(book, &snapshot, PRIMARY, Some(SECONDARY), order).expect("matcher")
    }

    #[test]
    fn primary_lookup_trims_and_returns_first_duplicate() {
        let book = book();
        let matcher = matcher(&book, LookupOrder::PrimaryFirst);

        assert_eq!(matcher.find_row("B"), Some(4));
        assert_eq!(matcher.find_row(" A"), Some(3));
        assert_eq!(matcher.find_row(""), None);
        assert_eq!(matcher.find_row("missing"), None);
        assert_eq!(matcher.last_row(), 6);
    }

    #[test]
    fn stale_secondary_key_does_not_block_primary_match() {
        let book = book();
        let matcher = matcher(&book, LookupOrder::PrimaryFirst);

        let found = matcher
            .find_row_with_fallback("B", Some("no-longer-valid"))
            .expect("primary match");
        assert_eq!(
            found,
            RowMatch {
                row: 4,
                tier: MatchTier::Primary
            }
        );

        let fallback = matcher
            .find_row_with_fallback("renamed", Some("orphan"))
            .expect("secondary match");
        assert_eq!(
            fallback,
            RowMatch {
                row: 5,
                tier: MatchTier::Secondary
            }
        );

        assert!(matcher.find_row_with_fallback("renamed", None).is_none());
    }

    #[test]
    fn secondary_first_prefers_legacy_key() {
        let book = book();
        let matcher = matcher(&book, LookupOrder::SecondaryFirst);

        let found = matcher
            .find_row_with_fallback("A", Some("old-b"))
            .expect("match");
        assert_eq!(
            found,
            RowMatch {
                row: 4,
                tier: MatchTier::Secondary
            }
        );
    }

    #[test]
    fn duplicate_keys_and_key_sets_ignore_blank_rows() {
        let book = book();
        let matcher = matcher(&book, LookupOrder::PrimaryFirst);

        assert_eq!(
            matcher.duplicate_keys(),
            vec![DuplicateKey {
                key: "A".to_string(),
                rows: vec![3, 6]
            }]
        );
        assert_eq!(
            matcher.primary_keys().into_iter().collect::<Vec<_>>(),
            vec!["A".to_string(), "B".to_string()]
        );
        let blank = matcher.key_row(5).expect("row 5");
        assert!(blank.primary_key.is_empty());
        assert_eq!(blank.secondary_key.as_deref(), Some("orphan"));
        assert!(matcher.key_row(2).is_none());
    }

    #[test]
    fn header_only_sheet_has_no_rows() {
        let book = MemoryWorkbook::new().with_sheet(
            "Output",
            &[&["Case_Organization"], &["Case_ID"]],
        );
        let snapshot = SchemaResolver::new(&book, &book)
            .refresh("Output")
            .expect("snapshot");
        let matcher = IdentityMatcher::load(
            &book,
            &snapshot,
            PRIMARY,
            Some(SECONDARY),
            LookupOrder::PrimaryFirst,
        )
        .expect("matcher");
        assert!(matcher.rows().is_empty());
        assert!(!matcher.contains_primary("A"));
    }
}
