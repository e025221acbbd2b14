//! Rating extraction from rendered profile pages + normalization into ledger entries.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use ego_tree::NodeRef;
use pzl_core::{DateKey, RatingEntry};
use pzl_storage::{FetchError, HttpClientConfig, HttpFetcher};
use scraper::{ElementRef, Html, Node, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "pzl-extract";

pub const DEFAULT_MARKER_SELECTOR: &str = "rating";
pub const DEFAULT_CATEGORY_LABEL: &str = "tactical puzzles";
/// Marker -> four ascents -> two first-child descents -> `datetime`.
pub const DEFAULT_DATE_PATH: &str = "parent/parent/parent/parent/child/child/@datetime";

/// Anything that can turn a URL into a navigable document.
///
/// `Html` is not `Send`, so implementations are driven on the caller's task.
#[async_trait(?Send)]
pub trait DocumentSource {
    async fn fetch(&self, url: &str) -> Result<Html, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpDocumentSource {
    http: HttpFetcher,
}

impl HttpDocumentSource {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(config)?,
        })
    }
}

#[async_trait(?Send)]
impl DocumentSource for HttpDocumentSource {
    async fn fetch(&self, url: &str) -> Result<Html, FetchError> {
        let page = self.http.fetch_text(url).await?;
        Ok(Html::parse_document(&page.body))
    }
}

/// Unvalidated strings pulled out of the document for one rating marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub date_text: String,
    pub amount_text: String,
    pub score_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathStep {
    Parent,
    FirstChild,
}

/// Where the date attribute sits relative to a rating marker, as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathDescriptor {
    steps: Vec<PathStep>,
    attribute: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("path descriptor is empty")]
    Empty,
    #[error("unknown path step {0:?}: expected `parent`, `child` or `@attribute`")]
    UnknownStep(String),
    #[error("path descriptor must end with exactly one `@attribute` step")]
    AttributeNotLast,
    #[error("attribute step has an empty name")]
    EmptyAttributeName,
}

impl PathDescriptor {
    pub fn new(
        steps: Vec<PathStep>,
        attribute: impl Into<String>,
    ) -> Result<Self, DescriptorError> {
        let attribute = attribute.into();
        if attribute.trim().is_empty() {
            return Err(DescriptorError::EmptyAttributeName);
        }
        Ok(Self { steps, attribute })
    }

    pub fn steps(&self) -> &[PathStep] {
        &self.steps
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Walk the steps from `start` and read the final attribute.
    pub fn resolve(&self, start: NodeRef<'_, Node>) -> Result<String, SkipReason> {
        let mut current = start;
        for (step, kind) in self.steps.iter().enumerate() {
            current = match kind {
                PathStep::Parent => current.parent().ok_or(SkipReason::NoParent { step })?,
                PathStep::FirstChild => current.first_child().ok_or(SkipReason::NoChild { step })?,
            };
        }

        let step = self.steps.len();
        let element = current
            .value()
            .as_element()
            .ok_or(SkipReason::NotAnElement { step })?;
        element
            .attr(&self.attribute)
            .map(ToString::to_string)
            .ok_or_else(|| SkipReason::MissingAttribute {
                step,
                name: self.attribute.clone(),
            })
    }
}

impl Default for PathDescriptor {
    fn default() -> Self {
        use PathStep::{FirstChild, Parent};
        Self {
            steps: vec![Parent, Parent, Parent, Parent, FirstChild, FirstChild],
            attribute: "datetime".to_string(),
        }
    }
}

impl FromStr for PathDescriptor {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').map(str::trim).filter(|p| !p.is_empty()).collect();
        let Some((last, rest)) = parts.split_last() else {
            return Err(DescriptorError::Empty);
        };
        let Some(attribute) = last.strip_prefix('@') else {
            return Err(DescriptorError::AttributeNotLast);
        };

        let steps = rest
            .iter()
            .map(|part| match part.to_ascii_lowercase().as_str() {
                "parent" | ".." => Ok(PathStep::Parent),
                "child" | "first-child" => Ok(PathStep::FirstChild),
                _ if part.starts_with('@') => Err(DescriptorError::AttributeNotLast),
                _ => Err(DescriptorError::UnknownStep(part.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(steps, attribute)
    }
}

impl fmt::Display for PathDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.steps {
            match step {
                PathStep::Parent => f.write_str("parent/")?,
                PathStep::FirstChild => f.write_str("child/")?,
            }
        }
        write!(f, "@{}", self.attribute)
    }
}

/// Why an accepted marker produced no candidate. Local to one marker; the scan continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("rating marker has no parent node")]
    MarkerWithoutParent,
    #[error("category text contains no digits")]
    NoAmount,
    #[error("rating marker has no child node holding the score")]
    NoScoreNode,
    #[error("date path step {step}: no parent node")]
    NoParent { step: usize },
    #[error("date path step {step}: no child node")]
    NoChild { step: usize },
    #[error("date path step {step}: node is not an element")]
    NotAnElement { step: usize },
    #[error("date path step {step}: attribute {name:?} missing")]
    MissingAttribute { step: usize, name: String },
}

#[derive(Debug, Error)]
pub enum ExtractorConfigError {
    #[error("invalid marker selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error("category label must not be empty")]
    EmptyLabel,
}

#[derive(Debug, Clone)]
pub struct RatingExtractor {
    marker: Selector,
    category_label: String,
    date_path: PathDescriptor,
}

impl RatingExtractor {
    pub fn new(
        marker_selector: &str,
        category_label: impl Into<String>,
        date_path: PathDescriptor,
    ) -> Result<Self, ExtractorConfigError> {
        let marker = Selector::parse(marker_selector).map_err(|e| ExtractorConfigError::Selector {
            selector: marker_selector.to_string(),
            message: e.to_string(),
        })?;
        let category_label = category_label.into();
        if category_label.is_empty() {
            return Err(ExtractorConfigError::EmptyLabel);
        }
        Ok(Self {
            marker,
            category_label,
            date_path,
        })
    }

    /// Tactical-puzzle markers laid out the way the profile activity feed renders them.
    pub fn tactical_puzzles() -> Result<Self, ExtractorConfigError> {
        Self::new(
            DEFAULT_MARKER_SELECTOR,
            DEFAULT_CATEGORY_LABEL,
            PathDescriptor::default(),
        )
    }

    pub fn category_label(&self) -> &str {
        &self.category_label
    }

    pub fn date_path(&self) -> &PathDescriptor {
        &self.date_path
    }

    /// One lazy pass over the document. Markers outside the category are not yielded.
    pub fn candidates<'a>(
        &'a self,
        document: &'a Html,
    ) -> impl Iterator<Item = Result<RawCandidate, SkipReason>> + 'a {
        document
            .select(&self.marker)
            .filter_map(move |marker| self.candidate_for(marker))
    }

    fn candidate_for(&self, marker: ElementRef<'_>) -> Option<Result<RawCandidate, SkipReason>> {
        let Some(parent) = marker.parent() else {
            return Some(Err(SkipReason::MarkerWithoutParent));
        };
        let parent_text = text_content(parent);
        if !parent_text.contains(&self.category_label) {
            return None;
        }
        Some(self.read_candidate(marker, &parent_text))
    }

    fn read_candidate(
        &self,
        marker: ElementRef<'_>,
        parent_text: &str,
    ) -> Result<RawCandidate, SkipReason> {
        let amount_text = first_digit_run(parent_text)
            .ok_or(SkipReason::NoAmount)?
            .to_string();
        let score_node = marker.first_child().ok_or(SkipReason::NoScoreNode)?;
        let score_text = text_content(score_node);
        let date_text = self.date_path.resolve(*marker)?;

        Ok(RawCandidate {
            date_text,
            amount_text,
            score_text,
        })
    }
}

fn text_content(node: NodeRef<'_, Node>) -> String {
    node.descendants()
        .filter_map(|n| n.value().as_text().map(|t| &**t))
        .collect()
}

fn first_digit_run(text: &str) -> Option<&str> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let rest = &text[start..];
    let len = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    Some(&rest[..len])
}

/// Why a candidate was dropped during normalization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("amount {text:?} is not a non-negative integer")]
    Amount { text: String },
    #[error("score {text:?} is not an integer")]
    Score { text: String },
    #[error("date {text:?} is not a recognizable calendar date")]
    Date { text: String },
}

pub fn normalize(raw: &RawCandidate) -> Result<RatingEntry, Rejection> {
    let amount = raw
        .amount_text
        .trim()
        .parse::<u32>()
        .map_err(|_| Rejection::Amount {
            text: raw.amount_text.clone(),
        })?;
    let score = raw
        .score_text
        .trim()
        .parse::<i64>()
        .map_err(|_| Rejection::Score {
            text: raw.score_text.clone(),
        })?;
    let date = parse_calendar_date(&raw.date_text).ok_or_else(|| Rejection::Date {
        text: raw.date_text.clone(),
    })?;

    Ok(RatingEntry::new(DateKey::new(date), amount, score))
}

const OFFSET_DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"];

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%d %b %Y",
];

/// Tolerant date parsing for timestamp attributes and their display forms.
///
/// Timestamps carrying an offset resolve to their UTC calendar date, so one instant
/// always lands on one key whatever offset it was written in. This differs from
/// formatting the instant in the host's local time zone, which can shift the day.
/// Years outside `0..=9999` are refused: they have no four-digit key spelling.
pub fn parse_calendar_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    parse_date_forms(text).filter(|date| (0..=9999).contains(&date.year()))
}

fn parse_date_forms(text: &str) -> Option<NaiveDate> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc).date_naive());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
        return Some(dt.with_timezone(&Utc).date_naive());
    }
    for format in OFFSET_DATETIME_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return Some(dt.with_timezone(&Utc).date_naive());
        }
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt.date());
        }
    }
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionStats {
    pub markers_accepted: usize,
    pub skipped: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHistory {
    /// Valid entries in document order.
    pub entries: Vec<RatingEntry>,
    pub stats: ExtractionStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "no valid rating entries on page ({} markers matched, {} skipped, {} rejected)",
    .stats.markers_accepted, .stats.skipped, .stats.rejected
)]
pub struct ParseFailure {
    pub stats: ExtractionStats,
}

/// Extract and normalize in one pass. A page yielding nothing usable is an error,
/// not an empty history.
pub fn parse_rating_history(
    extractor: &RatingExtractor,
    document: &Html,
) -> Result<ParsedHistory, ParseFailure> {
    let mut stats = ExtractionStats::default();
    let mut entries = Vec::new();

    for candidate in extractor.candidates(document) {
        stats.markers_accepted += 1;
        let raw = match candidate {
            Ok(raw) => raw,
            Err(reason) => {
                debug!(%reason, "skipping rating marker");
                stats.skipped += 1;
                continue;
            }
        };
        match normalize(&raw) {
            Ok(entry) => entries.push(entry),
            Err(rejection) => {
                debug!(%rejection, ?raw, "rejecting rating candidate");
                stats.rejected += 1;
            }
        }
    }

    if entries.is_empty() {
        return Err(ParseFailure { stats });
    }
    if stats.skipped + stats.rejected > 0 {
        warn!(
            skipped = stats.skipped,
            rejected = stats.rejected,
            "dropped malformed rating candidates"
        );
    }
    info!(
        entries = entries.len(),
        markers = stats.markers_accepted,
        "parsed rating history"
    );

    Ok(ParsedHistory { entries, stats })
}
