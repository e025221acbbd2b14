//! Core data model and merge semantics for the puzzle rating ledger.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "pzl-core";

const DATE_KEY_FORMAT: &str = "%Y-%m-%d";

/// Canonical calendar-date key. Always rendered as ISO 8601 `YYYY-MM-DD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DateKey(NaiveDate);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid date key {input:?}: expected YYYY-MM-DD")]
pub struct DateKeyError {
    pub input: String,
}

impl DateKey {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl From<NaiveDate> for DateKey {
    fn from(date: NaiveDate) -> Self {
        Self(date)
    }
}

impl fmt::Display for DateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(DATE_KEY_FORMAT))
    }
}

impl FromStr for DateKey {
    type Err = DateKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // chrono accepts unpadded fields; keys in the file must be exactly one spelling.
        let well_formed = s.len() == 10
            && s.bytes().enumerate().all(|(i, b)| match i {
                4 | 7 => b == b'-',
                _ => b.is_ascii_digit(),
            });
        if !well_formed {
            return Err(DateKeyError { input: s.to_string() });
        }
        NaiveDate::parse_from_str(s, DATE_KEY_FORMAT)
            .map(Self)
            .map_err(|_| DateKeyError { input: s.to_string() })
    }
}

impl TryFrom<String> for DateKey {
    type Error = DateKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DateKey> for String {
    fn from(key: DateKey) -> Self {
        key.to_string()
    }
}

/// Stored statistics for one day: puzzles attempted and the rating recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PuzzleStats {
    pub amount: u32,
    pub score: i64,
}

/// Normalized record handed from the extractor to the merger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingEntry {
    pub date: DateKey,
    pub stats: PuzzleStats,
}

impl RatingEntry {
    pub fn new(date: DateKey, amount: u32, score: i64) -> Self {
        Self {
            date,
            stats: PuzzleStats { amount, score },
        }
    }
}

/// Persisted dataset: one entry per calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Dataset {
    pub entries: BTreeMap<DateKey, PuzzleStats>,
}

impl Dataset {
    pub fn get(&self, date: &DateKey) -> Option<&PuzzleStats> {
        self.entries.get(date)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = RatingEntry> + '_ {
        self.entries.iter().map(|(date, stats)| RatingEntry {
            date: *date,
            stats: *stats,
        })
    }
}

impl FromIterator<RatingEntry> for Dataset {
    fn from_iter<I: IntoIterator<Item = RatingEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|e| (e.date, e.stats)).collect(),
        }
    }
}

/// What happens when an incoming entry's date is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
    /// The latest fetch is authoritative for a date.
    #[default]
    Overwrite,
    /// Stored entries are never touched; only unseen dates are added.
    KeepExisting,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown merge policy {0:?}: expected `overwrite` or `keep-existing`")]
pub struct MergePolicyError(pub String);

impl FromStr for MergePolicy {
    type Err = MergePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(Self::Overwrite),
            "keep-existing" | "keep_existing" => Ok(Self::KeepExisting),
            other => Err(MergePolicyError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub dataset: Dataset,
    /// Dates absent before the merge, in first-seen order.
    pub newly_added: Vec<DateKey>,
    /// Previously stored dates whose stats changed.
    pub updated: Vec<DateKey>,
}

/// Fold incoming entries into `existing`. Pure: no I/O, no shared state.
///
/// Keys not present in `incoming` are carried over untouched. Applying the same
/// batch twice yields the same dataset and an empty `newly_added` the second time.
pub fn merge<I>(existing: Dataset, incoming: I, policy: MergePolicy) -> MergeOutcome
where
    I: IntoIterator<Item = RatingEntry>,
{
    let mut dataset = existing;
    let mut newly_added = Vec::new();
    let mut updated = Vec::new();

    for entry in incoming {
        match dataset.entries.get_mut(&entry.date) {
            None => {
                dataset.entries.insert(entry.date, entry.stats);
                newly_added.push(entry.date);
            }
            Some(stored) => {
                if policy == MergePolicy::KeepExisting || *stored == entry.stats {
                    continue;
                }
                *stored = entry.stats;
                if !newly_added.contains(&entry.date) && !updated.contains(&entry.date) {
                    updated.push(entry.date);
                }
            }
        }
    }

    MergeOutcome {
        dataset,
        newly_added,
        updated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> DateKey {
        s.parse().expect("date key")
    }

    fn entry(date: &str, amount: u32, score: i64) -> RatingEntry {
        RatingEntry::new(key(date), amount, score)
    }

    fn dataset(entries: &[RatingEntry]) -> Dataset {
        entries.iter().copied().collect()
    }

    #[test]
    fn date_key_accepts_only_canonical_spelling() {
        assert_eq!(key("2024-01-02").to_string(), "2024-01-02");
        assert!("2024-1-2".parse::<DateKey>().is_err());
        assert!("2024-02-30".parse::<DateKey>().is_err());
        assert!("02/01/2024".parse::<DateKey>().is_err());
        assert!(" 2024-01-02".parse::<DateKey>().is_err());
    }

    #[test]
    fn dataset_serializes_to_entries_object() {
        let ds = dataset(&[entry("2024-01-01", 5, 1500)]);
        let value = serde_json::to_value(&ds).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"entries": {"2024-01-01": {"amount": 5, "score": 1500}}})
        );

        let back: Dataset = serde_json::from_value(value).unwrap();
        assert_eq!(back, ds);
    }

    #[test]
    fn dataset_rejects_negative_amount_and_bad_keys() {
        let negative = serde_json::json!({"entries": {"2024-01-01": {"amount": -1, "score": 1}}});
        assert!(serde_json::from_value::<Dataset>(negative).is_err());

        let bad_key = serde_json::json!({"entries": {"yesterday": {"amount": 1, "score": 1}}});
        assert!(serde_json::from_value::<Dataset>(bad_key).is_err());
    }

    #[test]
    fn new_date_is_added_and_reported() {
        let existing = dataset(&[entry("2024-01-01", 5, 1500)]);
        let outcome = merge(existing, [entry("2024-01-02", 3, 1510)], MergePolicy::Overwrite);

        assert_eq!(outcome.dataset.len(), 2);
        assert_eq!(
            outcome.dataset.get(&key("2024-01-01")),
            Some(&PuzzleStats { amount: 5, score: 1500 })
        );
        assert_eq!(
            outcome.dataset.get(&key("2024-01-02")),
            Some(&PuzzleStats { amount: 3, score: 1510 })
        );
        assert_eq!(outcome.newly_added, vec![key("2024-01-02")]);
        assert!(outcome.updated.is_empty());
    }

    #[test]
    fn conflicting_date_is_overwritten_by_incoming() {
        let existing = dataset(&[entry("2024-01-01", 5, 1500)]);
        let outcome = merge(existing, [entry("2024-01-01", 7, 1490)], MergePolicy::Overwrite);

        assert_eq!(
            outcome.dataset.get(&key("2024-01-01")),
            Some(&PuzzleStats { amount: 7, score: 1490 })
        );
        assert!(outcome.newly_added.is_empty());
        assert_eq!(outcome.updated, vec![key("2024-01-01")]);
    }

    #[test]
    fn keep_existing_never_alters_stored_dates() {
        let existing = dataset(&[entry("2024-01-01", 5, 1500)]);
        let outcome = merge(
            existing.clone(),
            [entry("2024-01-01", 7, 1490), entry("2024-01-03", 1, 1400)],
            MergePolicy::KeepExisting,
        );

        assert_eq!(outcome.dataset.get(&key("2024-01-01")), existing.get(&key("2024-01-01")));
        assert_eq!(outcome.newly_added, vec![key("2024-01-03")]);
        assert!(outcome.updated.is_empty());
    }

    #[test]
    fn merge_is_idempotent() {
        let existing = dataset(&[entry("2024-01-01", 5, 1500), entry("2024-01-04", 2, 1450)]);
        let incoming = vec![
            entry("2024-01-01", 6, 1505),
            entry("2024-01-02", 3, 1510),
            entry("2024-01-03", 0, -4),
        ];

        for policy in [MergePolicy::Overwrite, MergePolicy::KeepExisting] {
            let first = merge(existing.clone(), incoming.clone(), policy);
            let second = merge(first.dataset.clone(), incoming.clone(), policy);
            assert_eq!(second.dataset, first.dataset);
            assert!(second.newly_added.is_empty());
            assert!(second.updated.is_empty());
        }
    }

    #[test]
    fn keys_outside_incoming_are_preserved() {
        let existing = dataset(&[
            entry("2023-12-30", 9, 1600),
            entry("2023-12-31", 4, 1590),
            entry("2024-01-01", 5, 1500),
        ]);
        let outcome = merge(existing.clone(), [entry("2024-01-01", 1, 1)], MergePolicy::Overwrite);

        for untouched in ["2023-12-30", "2023-12-31"] {
            assert_eq!(
                outcome.dataset.get(&key(untouched)),
                existing.get(&key(untouched))
            );
        }
    }

    #[test]
    fn repeated_date_in_one_batch_is_reported_once_and_last_wins() {
        let outcome = merge(
            Dataset::default(),
            [entry("2024-01-02", 3, 1510), entry("2024-01-02", 4, 1520)],
            MergePolicy::Overwrite,
        );

        assert_eq!(outcome.newly_added, vec![key("2024-01-02")]);
        assert!(outcome.updated.is_empty());
        assert_eq!(
            outcome.dataset.get(&key("2024-01-02")),
            Some(&PuzzleStats { amount: 4, score: 1520 })
        );
    }

    #[test]
    fn merge_policy_parses_from_config_strings() {
        assert_eq!("overwrite".parse::<MergePolicy>().unwrap(), MergePolicy::Overwrite);
        assert_eq!(" Keep-Existing ".parse::<MergePolicy>().unwrap(), MergePolicy::KeepExisting);
        assert!("newest".parse::<MergePolicy>().is_err());
    }
}
