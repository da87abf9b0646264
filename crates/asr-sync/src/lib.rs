//! Polling pipeline: fetch reviews newer than the stored boundary, merge them into the store.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use asr_core::{DEFAULT_WINDOW_HOURS, MAX_WINDOW_HOURS, MIN_WINDOW_HOURS};
use asr_feed::{FeedClient, FeedConfig, FetchContext, ReviewSource, DEFAULT_FEED_BASE_URL};
use asr_storage::{HttpClientConfig, HttpFetcher, ReviewStore};
use serde::Serialize;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

pub const CRATE_NAME: &str = "asr-sync";

pub const DEFAULT_APP_ID: &str = "835599320";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub polling_interval: Duration,
    pub app_id: String,
    pub storage_file_path: PathBuf,
    pub feed_base_url: String,
    pub default_hours: u32,
    pub http_timeout: Duration,
    pub page_delay: Duration,
    pub max_pages: u32,
    pub user_agent: String,
    pub shutdown_grace: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or blank keys take their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let polling_secs: u64 = parse_or(&get, "POLLING_INTERVAL_SECONDS", 15)?;
        if polling_secs == 0 {
            return Err(invalid("POLLING_INTERVAL_SECONDS", "0", "must be greater than zero"));
        }

        let default_hours: u32 = parse_or(&get, "DEFAULT_HOURS", DEFAULT_WINDOW_HOURS)?;
        if !(MIN_WINDOW_HOURS..=MAX_WINDOW_HOURS).contains(&default_hours) {
            return Err(invalid(
                "DEFAULT_HOURS",
                &default_hours.to_string(),
                &format!("must be between {MIN_WINDOW_HOURS} and {MAX_WINDOW_HOURS}"),
            ));
        }

        let max_pages: u32 = parse_or(&get, "FEED_MAX_PAGES", asr_feed::DEFAULT_MAX_PAGES)?;
        if max_pages == 0 {
            return Err(invalid("FEED_MAX_PAGES", "0", "must be greater than zero"));
        }

        let http_timeout_secs: u64 = parse_or(&get, "HTTP_TIMEOUT_SECS", 10)?;
        if http_timeout_secs == 0 {
            return Err(invalid("HTTP_TIMEOUT_SECS", "0", "must be greater than zero"));
        }

        Ok(Self {
            port: parse_or(&get, "PORT", 8080)?,
            polling_interval: Duration::from_secs(polling_secs),
            app_id: get("APP_ID").unwrap_or_else(|| DEFAULT_APP_ID.to_string()),
            storage_file_path: get("STORAGE_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/reviews.json")),
            feed_base_url: get("FEED_BASE_URL").unwrap_or_else(|| DEFAULT_FEED_BASE_URL.to_string()),
            default_hours,
            http_timeout: Duration::from_secs(http_timeout_secs),
            page_delay: Duration::from_millis(parse_or(&get, "FEED_PAGE_DELAY_MS", 200)?),
            max_pages,
            user_agent: get("FEED_USER_AGENT").unwrap_or_else(|| "asr-poller/0.1".to_string()),
            shutdown_grace: Duration::from_secs(parse_or(&get, "SHUTDOWN_GRACE_SECS", 5)?),
        })
    }

    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            base_url: self.feed_base_url.clone(),
            max_pages: self.max_pages,
            page_delay: self.page_delay,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| invalid(key, &raw, &e.to_string())),
        None => Ok(default),
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// What a single poll cycle did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    FetchFailed { error: String },
    NoNewReviews,
    Merged { fetched: usize, added: usize },
    PersistFailed { fetched: usize, error: String },
}

/// Sole writer of the [`ReviewStore`]. Cycles run strictly one after another.
pub struct Poller {
    app_id: String,
    interval: Duration,
    source: Arc<dyn ReviewSource>,
    store: Arc<ReviewStore>,
}

impl Poller {
    pub fn new(
        app_id: impl Into<String>,
        interval: Duration,
        source: Arc<dyn ReviewSource>,
        store: Arc<ReviewStore>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            interval: interval.max(Duration::from_millis(1)),
            source,
            store,
        }
    }

    /// Poller backed by the real feed client described by `config`.
    pub fn from_config(config: &AppConfig, store: Arc<ReviewStore>) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config()).context("building feed http client")?;
        let feed = FeedClient::new(http, config.feed_config());
        Ok(Self::new(
            config.app_id.clone(),
            config.polling_interval,
            Arc::new(feed),
            store,
        ))
    }

    pub fn store(&self) -> &Arc<ReviewStore> {
        &self.store
    }

    /// Run cycles until `cancel` fires. The first cycle starts immediately;
    /// cancellation is only observed between cycles.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(app_id = %self.app_id, interval_secs = self.interval.as_secs_f64(), "poller started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }

        info!("poller stopping");
    }

    pub async fn run_cycle(&self) -> CycleOutcome {
        let ctx = FetchContext::new(self.app_id.clone());
        let span = info_span!("poll_cycle", cycle_id = %ctx.cycle_id, app_id = %self.app_id);
        self.process_latest_reviews(&ctx).instrument(span).await
    }

    async fn process_latest_reviews(&self, ctx: &FetchContext) -> CycleOutcome {
        let boundary = self.store.latest_review().await.map(|r| r.id);
        match &boundary {
            Some(id) => info!(boundary = %id, "polling for reviews newer than latest stored"),
            None => info!("no stored reviews, fetching every reachable page"),
        }

        let reviews = match self.source.fetch_reviews(ctx, boundary.as_deref()).await {
            Ok(reviews) => reviews,
            Err(err) => {
                // Retried on the next tick.
                error!(error = %err, "fetching reviews failed");
                return CycleOutcome::FetchFailed {
                    error: err.to_string(),
                };
            }
        };

        if reviews.is_empty() {
            info!("no new reviews");
            return CycleOutcome::NoNewReviews;
        }

        let fetched = reviews.len();
        info!(fetched, first_id = %reviews[0].id, "fetched reviews");

        match self.store.add_batch(reviews).await {
            Ok(added) => {
                if added > 0 {
                    info!(added, "added new reviews");
                } else {
                    info!("all fetched reviews were already stored");
                }
                CycleOutcome::Merged { fetched, added }
            }
            Err(err) => {
                error!(error = %err, "persisting reviews failed");
                CycleOutcome::PersistFailed {
                    fetched,
                    error: err.to_string(),
                }
            }
        }
    }
}

/// Load config + store from the environment and run exactly one cycle.
pub async fn run_cycle_once_from_env() -> Result<CycleOutcome> {
    let config = AppConfig::from_env()?;
    let store = Arc::new(ReviewStore::load(config.storage_file_path.clone()).await);
    let poller = Poller::from_config(&config, store)?;
    Ok(poller.run_cycle().await)
}
