//! Run controller: fetch -> extract -> load -> merge -> persist -> report, once.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pzl_core::{merge, DateKey, MergePolicy, RatingEntry};
use pzl_extract::{
    parse_rating_history, DocumentSource, ExtractionStats, HttpDocumentSource, ParseFailure,
    PathDescriptor, RatingExtractor, DEFAULT_CATEGORY_LABEL, DEFAULT_MARKER_SELECTOR,
};
use pzl_storage::{DatasetStore, FetchError, HttpClientConfig, JsonFileStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pzl-sync";

pub const DEFAULT_PROFILE_URL: &str = "https://lichess.org/@/zube";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub profile_url: String,
    pub dataset_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub merge_policy: MergePolicy,
    pub category_label: String,
    pub date_path: PathDescriptor,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            profile_url: DEFAULT_PROFILE_URL.to_string(),
            dataset_path: PathBuf::from("./ratings.json"),
            user_agent: "pzl-bot/0.1".to_string(),
            http_timeout_secs: 20,
            merge_policy: MergePolicy::default(),
            category_label: DEFAULT_CATEGORY_LABEL.to_string(),
            date_path: PathDescriptor::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults, malformed ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let http_timeout_secs = match lookup("PZL_HTTP_TIMEOUT_SECS") {
            Some(v) => v
                .trim()
                .parse::<u64>()
                .with_context(|| format!("parsing PZL_HTTP_TIMEOUT_SECS={v:?}"))?,
            None => defaults.http_timeout_secs,
        };
        let merge_policy = match lookup("PZL_MERGE_POLICY") {
            Some(v) => v.parse::<MergePolicy>().context("parsing PZL_MERGE_POLICY")?,
            None => defaults.merge_policy,
        };
        let date_path = match lookup("PZL_DATE_PATH") {
            Some(v) => v
                .parse::<PathDescriptor>()
                .with_context(|| format!("parsing PZL_DATE_PATH={v:?}"))?,
            None => defaults.date_path,
        };

        Ok(Self {
            profile_url: lookup("PZL_PROFILE_URL").unwrap_or(defaults.profile_url),
            dataset_path: lookup("PZL_DATASET_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.dataset_path),
            user_agent: lookup("PZL_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs,
            merge_policy,
            category_label: lookup("PZL_CATEGORY_LABEL").unwrap_or(defaults.category_label),
            date_path,
        })
    }

    pub fn extractor(&self) -> Result<RatingExtractor> {
        RatingExtractor::new(
            DEFAULT_MARKER_SELECTOR,
            self.category_label.clone(),
            self.date_path.clone(),
        )
        .context("building rating extractor")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    FetchFailure,
    ParseFailure,
    ReadFailure,
    WriteFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FetchFailure => "FetchFailure",
            Self::ParseFailure => "ParseFailure",
            Self::ReadFailure => "ReadFailure",
            Self::WriteFailure => "WriteFailure",
        };
        f.write_str(name)
    }
}

/// The four ways a run can end badly. Each one terminates the run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("fetching profile page: {0}")]
    Fetch(#[source] FetchError),
    #[error("parsing profile page: {0}")]
    Parse(#[source] ParseFailure),
    #[error("loading dataset: {0}")]
    Read(#[source] StoreError),
    #[error("saving dataset: {0}")]
    Write(#[source] StoreError),
}

impl RunError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(_) => ErrorKind::FetchFailure,
            Self::Parse(_) => ErrorKind::ParseFailure,
            Self::Read(_) => ErrorKind::ReadFailure,
            Self::Write(_) => ErrorKind::WriteFailure,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub profile_url: String,
    pub extraction: ExtractionStats,
    pub fetched_entries: usize,
    pub new_entries: Vec<RatingEntry>,
    pub updated_dates: Vec<DateKey>,
    pub total_entries: usize,
}

/// The only place run outcomes are presented. Exactly one of `success` / `failure`
/// is called per run.
pub trait Reporter {
    fn new_entry(&mut self, entry: &RatingEntry);
    fn no_new_entries(&mut self);
    fn success(&mut self, summary: &SyncRunSummary);
    fn failure(&mut self, error: &RunError);
}

pub struct SyncPipeline<S, D> {
    source: S,
    store: D,
    extractor: RatingExtractor,
    profile_url: String,
    merge_policy: MergePolicy,
}

impl SyncPipeline<HttpDocumentSource, JsonFileStore> {
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let source = HttpDocumentSource::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let store = JsonFileStore::new(config.dataset_path.clone());
        Ok(Self::new(source, store, config.extractor()?, config.profile_url.clone())
            .with_merge_policy(config.merge_policy))
    }
}

impl<S, D> SyncPipeline<S, D>
where
    S: DocumentSource,
    D: DatasetStore,
{
    pub fn new(
        source: S,
        store: D,
        extractor: RatingExtractor,
        profile_url: impl Into<String>,
    ) -> Self {
        Self {
            source,
            store,
            extractor,
            profile_url: profile_url.into(),
            merge_policy: MergePolicy::default(),
        }
    }

    pub fn with_merge_policy(mut self, merge_policy: MergePolicy) -> Self {
        self.merge_policy = merge_policy;
        self
    }

    pub fn store(&self) -> &D {
        &self.store
    }

    pub async fn run_once(&self, reporter: &mut dyn Reporter) -> Result<SyncRunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, url = %self.profile_url);
        let result = self.execute(run_id).instrument(span).await;

        match &result {
            Ok(summary) => {
                if summary.new_entries.is_empty() {
                    reporter.no_new_entries();
                }
                for entry in &summary.new_entries {
                    reporter.new_entry(entry);
                }
                reporter.success(summary);
            }
            Err(err) => reporter.failure(err),
        }
        result
    }

    async fn execute(&self, run_id: Uuid) -> Result<SyncRunSummary, RunError> {
        let started_at = Utc::now();

        let history = {
            let document = self
                .source
                .fetch(&self.profile_url)
                .await
                .map_err(RunError::Fetch)?;
            parse_rating_history(&self.extractor, &document).map_err(RunError::Parse)?
        };

        let existing = self.store.load().await.map_err(RunError::Read)?;
        let previous_len = existing.len();
        let outcome = merge(existing, history.entries.iter().copied(), self.merge_policy);

        self.store
            .save(&outcome.dataset)
            .await
            .map_err(RunError::Write)?;

        let new_entries: Vec<RatingEntry> = outcome
            .newly_added
            .iter()
            .filter_map(|date| {
                outcome.dataset.get(date).map(|stats| RatingEntry {
                    date: *date,
                    stats: *stats,
                })
            })
            .collect();

        info!(
            previous = previous_len,
            total = outcome.dataset.len(),
            added = new_entries.len(),
            updated = outcome.updated.len(),
            "dataset merged and saved"
        );

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            profile_url: self.profile_url.clone(),
            extraction: history.stats,
            fetched_entries: history.entries.len(),
            new_entries,
            updated_dates: outcome.updated,
            total_entries: outcome.dataset.len(),
        })
    }
}
