//! Poll orchestration: configuration, the tracked-app registry and the recurring
//! [`Poller`] that drives fetch + merge for every app.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use revwatch_adapters::{AppStoreFeedClient, FeedClient, FetchError};
use revwatch_core::{is_valid_app_id, App, Review};
use revwatch_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, RetryDisposition, ReviewStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "revwatch-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub apps_file: PathBuf,
    pub app_ids: Option<String>,
    pub poll_interval_minutes: u64,
    pub feed_base_url: String,
    pub feed_country: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub fetch_retries: usize,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("REVWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            apps_file: std::env::var("REVWATCH_APPS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./apps.yaml")),
            app_ids: std::env::var("APP_IDS").ok().filter(|v| !v.trim().is_empty()),
            poll_interval_minutes: std::env::var("REVWATCH_POLL_INTERVAL_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15),
            feed_base_url: std::env::var("REVWATCH_FEED_BASE_URL")
                .unwrap_or_else(|_| revwatch_adapters::DEFAULT_FEED_BASE_URL.to_string()),
            feed_country: std::env::var("REVWATCH_FEED_COUNTRY")
                .unwrap_or_else(|_| revwatch_adapters::DEFAULT_FEED_COUNTRY.to_string()),
            http_timeout_secs: std::env::var("REVWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("REVWATCH_USER_AGENT")
                .unwrap_or_else(|_| "revwatch/0.1".to_string()),
            fetch_retries: std::env::var("REVWATCH_FETCH_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            web_port: std::env::var("REVWATCH_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3001),
        }
    }

    /// The schedule period, rejected up front when it would never fire.
    pub fn poll_interval(&self) -> Result<Duration, PollerError> {
        match self.poll_interval_minutes.checked_mul(60) {
            Some(0) | None => Err(PollerError::InvalidInterval),
            Some(secs) => Ok(Duration::from_secs(secs)),
        }
    }

    pub fn retry_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.fetch_retries,
            ..BackoffPolicy::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppRegistry {
    pub apps: Vec<App>,
}

/// Parse `APP_IDS`-style input: comma separated `id` or `id:name` items.
pub fn parse_app_ids(raw: &str) -> Vec<App> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once(':') {
            Some((id, name)) if !name.trim().is_empty() => App::new(id.trim(), name.trim()),
            Some((id, _)) => App::new(id.trim(), id.trim()),
            None => App::new(item, item),
        })
        .collect()
}

/// Tracked apps from the registry file, falling back to `APP_IDS`.
pub async fn load_apps(config: &SyncConfig) -> Result<Vec<App>> {
    let path = &config.apps_file;
    let apps = if fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let registry: AppRegistry =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        registry.apps
    } else if let Some(raw) = &config.app_ids {
        parse_app_ids(raw)
    } else {
        Vec::new()
    };

    if apps.is_empty() {
        bail!(
            "no apps configured: add them to {} or set APP_IDS",
            path.display()
        );
    }
    validate_apps(&apps)?;
    Ok(apps)
}

pub fn validate_apps(apps: &[App]) -> Result<()> {
    let mut seen = HashSet::new();
    for app in apps {
        if !is_valid_app_id(&app.id) {
            bail!("invalid app id {:?}", app.id);
        }
        if !seen.insert(app.id.as_str()) {
            bail!("app id {} configured more than once", app.id);
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Polling(String),
    Stopped,
}

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("poller is already running")]
    AlreadyRunning,
    #[error("poller has been stopped")]
    Stopped,
    #[error("poll interval must be a positive number of minutes")]
    InvalidInterval,
    #[error("scheduler error: {0}")]
    Scheduler(#[from] JobSchedulerError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AppPollStatus {
    Updated,
    /// The fetch failed; the record was still touched so `lastPolled` advanced.
    FetchFailed { error: String },
    StorageFailed { error: String },
    /// Stop was requested before this app was reached.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppPollOutcome {
    pub app_id: String,
    pub fetched: usize,
    pub stored: Option<usize>,
    #[serde(flatten)]
    pub status: AppPollStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollCycleSummary {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<AppPollOutcome>,
}

impl PollCycleSummary {
    pub fn updated(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == AppPollStatus::Updated)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| {
                matches!(
                    o.status,
                    AppPollStatus::FetchFailed { .. } | AppPollStatus::StorageFailed { .. }
                )
            })
            .count()
    }
}

struct PollerCore {
    feed: Arc<dyn FeedClient>,
    store: ReviewStore,
    retry: BackoffPolicy,
    cycle_lock: Mutex<()>,
    stop_requested: AtomicBool,
    state: Mutex<PollerState>,
}

impl PollerCore {
    fn is_stopped(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    async fn set_state(&self, next: PollerState) {
        let mut state = self.state.lock().await;
        if *state != PollerState::Stopped {
            *state = next;
        }
    }

    async fn run_cycle(&self, apps: &[App]) -> PollCycleSummary {
        let _cycle = self.cycle_lock.lock().await;
        self.run_cycle_locked(apps).await
    }

    /// Timer entry point: a tick that lands while a cycle is still running is
    /// dropped instead of queueing a second cycle.
    async fn run_scheduled_cycle(&self, apps: &[App]) -> Option<PollCycleSummary> {
        if self.is_stopped() {
            return None;
        }
        let Ok(_cycle) = self.cycle_lock.try_lock() else {
            warn!("previous poll cycle still running; skipping tick");
            return None;
        };
        Some(self.run_cycle_locked(apps).await)
    }

    async fn run_cycle_locked(&self, apps: &[App]) -> PollCycleSummary {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("poll_cycle", %cycle_id, apps = apps.len());
        async {
            let started_at = Utc::now();
            let mut outcomes = Vec::with_capacity(apps.len());

            for app in apps {
                if self.is_stopped() {
                    outcomes.push(AppPollOutcome {
                        app_id: app.id.clone(),
                        fetched: 0,
                        stored: None,
                        status: AppPollStatus::Skipped,
                    });
                    continue;
                }
                self.set_state(PollerState::Polling(app.id.clone())).await;
                outcomes.push(self.poll_app(app).await);
            }
            self.set_state(PollerState::Idle).await;

            let summary = PollCycleSummary {
                cycle_id,
                started_at,
                finished_at: Utc::now(),
                outcomes,
            };
            info!(
                updated = summary.updated(),
                failed = summary.failed(),
                "poll cycle finished"
            );
            summary
        }
        .instrument(span)
        .await
    }

    async fn poll_app(&self, app: &App) -> AppPollOutcome {
        let (batch, fetch_error) = match self.fetch_with_retry(&app.id).await {
            Ok(batch) => (batch, None),
            Err(err) => {
                warn!(
                    app_id = %app.id,
                    error = %err,
                    "fetching reviews failed; recording poll attempt only"
                );
                (Vec::new(), Some(err.to_string()))
            }
        };
        let fetched = batch.len();

        match self.store.merge(app, batch).await {
            Ok(record) => {
                info!(
                    app_id = %app.id,
                    fetched,
                    stored = record.reviews.len(),
                    "polled and stored reviews"
                );
                AppPollOutcome {
                    app_id: app.id.clone(),
                    fetched,
                    stored: Some(record.reviews.len()),
                    status: match fetch_error {
                        Some(error) => AppPollStatus::FetchFailed { error },
                        None => AppPollStatus::Updated,
                    },
                }
            }
            Err(err) => {
                warn!(app_id = %app.id, error = %err, "storing reviews failed");
                AppPollOutcome {
                    app_id: app.id.clone(),
                    fetched,
                    stored: None,
                    status: AppPollStatus::StorageFailed {
                        error: err.to_string(),
                    },
                }
            }
        }
    }

    async fn fetch_with_retry(&self, app_id: &str) -> Result<Vec<Review>, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.feed.fetch(app_id).await {
                Ok(reviews) => return Ok(reviews),
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < self.retry.max_retries =>
                {
                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(app_id, attempt, ?delay, error = %err, "retrying feed fetch");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Owns the recurring schedule. `Idle -> Polling(app) -> Idle` per app and
/// cycle; `Stopped` is terminal.
pub struct Poller {
    core: Arc<PollerCore>,
    scheduler: Mutex<Option<JobScheduler>>,
}

impl Poller {
    pub fn new(feed: Arc<dyn FeedClient>, store: ReviewStore, retry: BackoffPolicy) -> Self {
        Self {
            core: Arc::new(PollerCore {
                feed,
                store,
                retry,
                cycle_lock: Mutex::new(()),
                stop_requested: AtomicBool::new(false),
                state: Mutex::new(PollerState::Idle),
            }),
            scheduler: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &ReviewStore {
        &self.core.store
    }

    pub async fn state(&self) -> PollerState {
        self.core.state.lock().await.clone()
    }

    /// One full pass over `apps`, in order. Waits for any running cycle first.
    pub async fn run_cycle(&self, apps: &[App]) -> PollCycleSummary {
        self.core.run_cycle(apps).await
    }

    pub async fn start(
        &self,
        apps: Vec<App>,
        interval_minutes: u64,
    ) -> Result<PollCycleSummary, PollerError> {
        self.start_with_interval(apps, Duration::from_secs(interval_minutes.saturating_mul(60)))
            .await
    }

    /// Run one cycle now, then repeat it every `interval` until [`Poller::stop`].
    pub async fn start_with_interval(
        &self,
        apps: Vec<App>,
        interval: Duration,
    ) -> Result<PollCycleSummary, PollerError> {
        if interval.is_zero() {
            return Err(PollerError::InvalidInterval);
        }
        let mut slot = self.scheduler.lock().await;
        if self.core.is_stopped() {
            return Err(PollerError::Stopped);
        }
        if slot.is_some() {
            return Err(PollerError::AlreadyRunning);
        }

        let apps: Arc<[App]> = apps.into();
        let first = self.core.run_cycle(&apps).await;
        if self.core.is_stopped() {
            return Ok(first);
        }

        let sched = JobScheduler::new().await?;
        let core = Arc::clone(&self.core);
        let job = Job::new_repeated_async(interval, move |_uuid, _l| {
            let core = Arc::clone(&core);
            let apps = Arc::clone(&apps);
            Box::pin(async move {
                let _ = core.run_scheduled_cycle(&apps).await;
            })
        })?;
        sched.add(job).await?;
        sched.start().await?;
        *slot = Some(sched);

        info!(interval_secs = interval.as_secs(), "poller scheduled");
        Ok(first)
    }

    /// Cancel the schedule. An app that is mid-poll finishes; nothing new starts.
    pub async fn stop(&self) -> Result<(), PollerError> {
        self.core.stop_requested.store(true, Ordering::SeqCst);
        *self.core.state.lock().await = PollerState::Stopped;

        let mut slot = self.scheduler.lock().await;
        if let Some(mut sched) = slot.take() {
            sched.shutdown().await?;
        }
        info!("polling stopped");
        Ok(())
    }
}

pub fn build_poller(config: &SyncConfig) -> Result<Poller> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;
    let feed = AppStoreFeedClient::new(http)
        .with_base_url(config.feed_base_url.clone())
        .with_country(config.feed_country.clone());
    Ok(Poller::new(
        Arc::new(feed),
        ReviewStore::new(config.data_dir.clone()),
        config.retry_policy(),
    ))
}

pub async fn run_poll_once_from_env() -> Result<PollCycleSummary> {
    let config = SyncConfig::from_env();
    let apps = load_apps(&config).await?;
    let poller = build_poller(&config)?;
    Ok(poller.run_cycle(&apps).await)
}
