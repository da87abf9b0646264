//! App Store customer-reviews feed: envelope decoding + paginated fetching.

use std::time::Duration;

use asr_core::{Review, MAX_STAR_RATING};
use asr_storage::{HttpError, HttpFetcher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "asr-feed";

pub const DEFAULT_FEED_BASE_URL: &str = "https://itunes.apple.com/us/rss/customerreviews";
/// The feed provider refuses to paginate past this page.
pub const DEFAULT_MAX_PAGES: u32 = 10;
pub const DEFAULT_PAGE_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
#[error("decoding review feed: {0}")]
pub struct ParseError(#[from] serde_json::Error);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetching page {page}: {source}")]
    Http {
        page: u32,
        #[source]
        source: HttpError,
    },
    #[error("parsing reviews on page {page}: {source}")]
    Parse {
        page: u32,
        #[source]
        source: ParseError,
    },
}

impl FetchError {
    pub fn page(&self) -> u32 {
        match self {
            Self::Http { page, .. } | Self::Parse { page, .. } => *page,
        }
    }
}

// Vendor envelope. Every scalar is wrapped as {"label": "..."}.

// Missing and `null` both decode to `None`.
#[derive(Debug, Deserialize)]
struct FeedEnvelope {
    #[serde(default)]
    feed: Option<FeedBody>,
}

#[derive(Debug, Deserialize)]
struct FeedBody {
    #[serde(default)]
    entry: Option<OneOrMany<FeedEntry>>,
}

/// The feed collapses a one-element `entry` array into a bare object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::Many(items) => items,
            Self::One(item) => vec![item],
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct Label {
    #[serde(default)]
    label: String,
}

#[derive(Debug, Default, Deserialize)]
struct FeedAuthor {
    #[serde(default)]
    name: Label,
}

#[derive(Debug, Deserialize)]
struct FeedEntry {
    #[serde(default)]
    id: Label,
    #[serde(default)]
    title: Label,
    #[serde(default)]
    content: Label,
    #[serde(default)]
    author: FeedAuthor,
    #[serde(rename = "im:rating", default)]
    rating: Label,
    #[serde(default)]
    updated: Label,
}

/// Decode one feed page into reviews, in feed order.
///
/// A bad rating label degrades to `0`. An entry with an unreadable `updated`
/// timestamp is dropped, since it cannot be ordered against the rest.
pub fn parse_feed_page(bytes: &[u8]) -> Result<Vec<Review>, ParseError> {
    let envelope: FeedEnvelope = serde_json::from_slice(bytes)?;
    let entries = envelope
        .feed
        .and_then(|feed| feed.entry)
        .map(OneOrMany::into_vec)
        .unwrap_or_default();

    let mut reviews = Vec::with_capacity(entries.len());
    for entry in entries {
        let id = entry.id.label;
        let rating = parse_rating(&id, &entry.rating.label);
        let updated_at = match DateTime::parse_from_rfc3339(entry.updated.label.trim()) {
            Ok(ts) => ts.with_timezone(&Utc),
            Err(err) => {
                warn!(id = %id, updated = %entry.updated.label, error = %err, "skipping review with unparsable timestamp");
                continue;
            }
        };
        reviews.push(Review {
            id,
            title: entry.title.label,
            content: entry.content.label,
            author: entry.author.name.label,
            rating,
            updated_at,
        });
    }
    Ok(reviews)
}

fn parse_rating(id: &str, label: &str) -> u8 {
    match label.trim().parse::<u8>() {
        Ok(rating) if rating <= MAX_STAR_RATING => rating,
        Ok(rating) => {
            warn!(id, rating, "rating out of range, storing 0");
            0
        }
        Err(err) => {
            warn!(id, label, error = %err, "parsing rating failed, storing 0");
            0
        }
    }
}

/// Per-cycle identity handed to a [`ReviewSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchContext {
    pub cycle_id: Uuid,
    pub app_id: String,
}

impl FetchContext {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            app_id: app_id.into(),
        }
    }
}

/// Anything that can produce the reviews newer than a known boundary.
#[async_trait]
pub trait ReviewSource: Send + Sync {
    /// Reviews newer than `latest_known_id`, newest first as the feed orders
    /// them. `None` fetches everything reachable.
    async fn fetch_reviews(
        &self,
        ctx: &FetchContext,
        latest_known_id: Option<&str>,
    ) -> Result<Vec<Review>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub base_url: String,
    pub max_pages: u32,
    /// Slept between consecutive page requests.
    pub page_delay: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_FEED_BASE_URL.to_string(),
            max_pages: DEFAULT_MAX_PAGES,
            page_delay: DEFAULT_PAGE_DELAY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedClient {
    http: HttpFetcher,
    config: FeedConfig,
}

impl FeedClient {
    pub fn new(http: HttpFetcher, config: FeedConfig) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn page_url(&self, app_id: &str, page: u32) -> String {
        format!(
            "{}/id={app_id}/sortBy=mostRecent/page={page}/json",
            self.config.base_url.trim_end_matches('/')
        )
    }

    pub async fn fetch_page(&self, ctx: &FetchContext, page: u32) -> Result<Vec<Review>, FetchError> {
        let url = self.page_url(&ctx.app_id, page);
        debug!(page, %url, "fetching feed page");
        let response = self
            .http
            .fetch_bytes(ctx.cycle_id, &url)
            .await
            .map_err(|source| FetchError::Http { page, source })?;
        if response.final_url != url {
            debug!(page, final_url = %response.final_url, "feed page redirected");
        }
        parse_feed_page(&response.body).map_err(|source| FetchError::Parse { page, source })
    }
}

#[async_trait]
impl ReviewSource for FeedClient {
    async fn fetch_reviews(
        &self,
        ctx: &FetchContext,
        latest_known_id: Option<&str>,
    ) -> Result<Vec<Review>, FetchError> {
        let mut collected = Vec::new();

        for page in 1..=self.config.max_pages {
            if page > 1 && !self.config.page_delay.is_zero() {
                tokio::time::sleep(self.config.page_delay).await;
            }

            let reviews = self.fetch_page(ctx, page).await?;
            if reviews.is_empty() {
                debug!(page, "empty page, stopping pagination");
                return Ok(collected);
            }

            for review in reviews {
                if latest_known_id == Some(review.id.as_str()) {
                    debug!(page, boundary = %review.id, "reached known review, stopping pagination");
                    return Ok(collected);
                }
                collected.push(review);
            }
        }

        debug!(max_pages = self.config.max_pages, "page cap reached");
        Ok(collected)
    }
}
