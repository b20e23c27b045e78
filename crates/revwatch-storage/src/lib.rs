//! Durable per-app review records + HTTP fetch utilities for revwatch.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use revwatch_core::{is_valid_app_id, App, Review, StoredReviews};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "revwatch-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid app id {0:?}")]
    InvalidAppId(String),
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt review record {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding review record for app {app_id}: {source}")]
    Encode {
        app_id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    fn io(action: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no reviews recorded for app {0}")]
    NotFound(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One JSON file per app under `root`, replaced atomically on every merge.
///
/// Clones share the per-app writer locks, so merges for the same app never
/// interleave even when several pollers hold the store.
#[derive(Debug, Clone)]
pub struct ReviewStore {
    root: PathBuf,
    writers: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ReviewStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn record_path(&self, app_id: &str) -> Result<PathBuf, StorageError> {
        if !is_valid_app_id(app_id) {
            return Err(StorageError::InvalidAppId(app_id.to_string()));
        }
        Ok(self.root.join(format!("reviews_{app_id}.json")))
    }

    /// Read the persisted record, `None` when the app has never been stored.
    pub async fn load(&self, app_id: &str) -> Result<Option<StoredReviews>, StorageError> {
        let path = self.record_path(app_id)?;
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StorageError::io("reading", &path, err)),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| StorageError::Corrupt { path, source })
    }

    /// Persist a record using a temp file in the same directory and an atomic rename.
    pub async fn save(&self, record: &StoredReviews) -> Result<PathBuf, StorageError> {
        let path = self.record_path(&record.id)?;
        let bytes = serde_json::to_vec_pretty(record).map_err(|source| StorageError::Encode {
            app_id: record.id.clone(),
            source,
        })?;

        fs::create_dir_all(&self.root)
            .await
            .map_err(|err| StorageError::io("creating data directory", &self.root, err))?;

        let temp_path = self
            .root
            .join(format!(".reviews_{}.{}.tmp", record.id, Uuid::new_v4()));
        if let Err(err) = write_new_file(&temp_path, &bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(path),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StorageError::io("replacing review record", &path, err))
            }
        }
    }

    /// Merge a fetched batch into the app's record and persist it, stamping
    /// `lastPolled` with the current time.
    pub async fn merge(
        &self,
        app: &App,
        incoming: Vec<Review>,
    ) -> Result<StoredReviews, StorageError> {
        self.merge_at(app, incoming, Utc::now()).await
    }

    pub async fn merge_at(
        &self,
        app: &App,
        incoming: Vec<Review>,
        polled_at: DateTime<Utc>,
    ) -> Result<StoredReviews, StorageError> {
        let writer = self.writer_lock(&app.id).await;
        let _guard = writer.lock().await;

        let existing = self
            .load(&app.id)
            .await?
            .unwrap_or_else(|| StoredReviews::empty(app));
        let before = existing.reviews.len();
        let incoming_len = incoming.len();
        let merged = existing.absorb(app, incoming, polled_at);
        self.save(&merged).await?;

        debug!(
            app_id = %app.id,
            incoming = incoming_len,
            stored_before = before,
            stored_after = merged.reviews.len(),
            "merged review batch"
        );
        Ok(merged)
    }

    /// Reviews for `app_id` published within the last `hours`, newest first.
    pub async fn query(&self, app_id: &str, hours: u32) -> Result<Vec<Review>, QueryError> {
        self.query_at(app_id, hours, Utc::now()).await
    }

    pub async fn query_at(
        &self,
        app_id: &str,
        hours: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Review>, QueryError> {
        Ok(self.query_app_at(app_id, hours, now).await?.reviews)
    }

    /// Like [`ReviewStore::query`] but keeps the record envelope (name, last poll).
    pub async fn query_app(&self, app_id: &str, hours: u32) -> Result<StoredReviews, QueryError> {
        self.query_app_at(app_id, hours, Utc::now()).await
    }

    pub async fn query_app_at(
        &self,
        app_id: &str,
        hours: u32,
        now: DateTime<Utc>,
    ) -> Result<StoredReviews, QueryError> {
        let record = match self.load(app_id).await {
            Ok(Some(record)) => record,
            Ok(None) | Err(StorageError::InvalidAppId(_)) => {
                return Err(QueryError::NotFound(app_id.to_string()))
            }
            Err(err) => return Err(QueryError::Storage(err)),
        };
        let reviews = record.within_window(hours, now);
        Ok(StoredReviews { reviews, ..record })
    }

    async fn writer_lock(&self, app_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.writers.lock().await;
        map.entry(app_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .map_err(|err| StorageError::io("opening temp record", path, err))?;
    file.write_all(bytes)
        .await
        .map_err(|err| StorageError::io("writing temp record", path, err))?;
    file.flush()
        .await
        .map_err(|err| StorageError::io("flushing temp record", path, err))?;
    file.sync_all()
        .await
        .map_err(|err| StorageError::io("syncing temp record", path, err))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Capped exponential backoff used by callers that choose to retry.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
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
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

/// Single-attempt GET with a bounded timeout. Retrying is left to the caller.
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

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, HttpError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self
                .client
                .get(url)
                .header(reqwest::header::ACCEPT, "application/json")
                .send()
                .await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(HttpError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedResponse { final_url, body })
        }
        .instrument(span)
        .await
    }
}
