//! Dataset persistence + HTTP fetch utilities for the puzzle ledger.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use pzl_core::Dataset;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pzl-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("dataset file {path} does not exist")]
    NotFound { path: PathBuf },
    #[error("dataset file {path} is not a valid dataset: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing dataset: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Whole-blob load/save of the persisted dataset.
#[async_trait]
pub trait DatasetStore: Send + Sync {
    async fn load(&self) -> Result<Dataset, StoreError>;
    async fn save(&self, dataset: &Dataset) -> Result<(), StoreError>;
}

/// Pretty-printed JSON file holding `{"entries": {...}}`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn decode(path: &Path, text: &str) -> Result<Dataset, StoreError> {
        serde_json::from_str(text).map_err(|source| StoreError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn encode(dataset: &Dataset) -> Result<Vec<u8>, StoreError> {
        let mut bytes = serde_json::to_vec_pretty(dataset).map_err(StoreError::Serialize)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    fn io_error(&self, action: &'static str, path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Replace the file through a sibling temp file and rename, so readers never see a
    /// half-written dataset.
    async fn write_atomically(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| self.io_error("creating directory", &parent, e))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let written = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await
                .map_err(|e| self.io_error("opening temp file", &temp_path, e))?;
            file.write_all(bytes)
                .await
                .map_err(|e| self.io_error("writing temp file", &temp_path, e))?;
            file.flush()
                .await
                .map_err(|e| self.io_error("flushing temp file", &temp_path, e))?;
            file.sync_all()
                .await
                .map_err(|e| self.io_error("syncing temp file", &temp_path, e))?;
            drop(file);
            fs::rename(&temp_path, &self.path)
                .await
                .map_err(|e| self.io_error("renaming temp file onto", &self.path, e))
        }
        .await;

        if written.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        written
    }
}

#[async_trait]
impl DatasetStore for JsonFileStore {
    async fn load(&self) -> Result<Dataset, StoreError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    path: self.path.clone(),
                })
            }
            Err(err) => return Err(self.io_error("reading", &self.path, err)),
        };
        let dataset = Self::decode(&self.path, &text)?;
        debug!(path = %self.path.display(), entries = dataset.len(), "loaded dataset");
        Ok(dataset)
    }

    async fn save(&self, dataset: &Dataset) -> Result<(), StoreError> {
        let bytes = Self::encode(dataset)?;
        self.write_atomically(&bytes).await?;
        debug!(
            path = %self.path.display(),
            entries = dataset.len(),
            bytes = bytes.len(),
            "saved dataset"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-shot page fetcher. Retries are deliberately left to whatever wraps a run.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.text().await?;
            debug!(%status, bytes = body.len(), "fetched page");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
