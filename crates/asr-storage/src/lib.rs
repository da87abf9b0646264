//! File-backed review store + HTTP fetch primitive for App Store Review Radar.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use asr_core::{sort_newest_first, Review};
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "asr-storage";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("serializing reviews for {}: {source}", .path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PersistenceError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Ordered, deduplicated review collection mirrored to a JSON file.
///
/// The collection is kept sorted newest first after every mutation; both
/// [`ReviewStore::latest_review`] and the window scan in
/// [`ReviewStore::list_latest_at`] depend on that ordering.
#[derive(Debug)]
pub struct ReviewStore {
    path: PathBuf,
    reviews: RwLock<Vec<Review>>,
}

impl ReviewStore {
    /// Empty store backed by `path`. Nothing is written until the first batch adds a review.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reviews: RwLock::new(Vec::new()),
        }
    }

    /// Load the persisted collection. Never fails: a missing file starts empty,
    /// an unreadable or malformed one is logged and also starts empty.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let reviews = match read_reviews_file(&path).await {
            Ok(Some(mut reviews)) => {
                sort_newest_first(&mut reviews);
                info!(path = %path.display(), count = reviews.len(), "loaded persisted reviews");
                reviews
            }
            Ok(None) => {
                info!(path = %path.display(), "no persisted reviews yet, starting empty");
                Vec::new()
            }
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{err:#}"), "could not load persisted reviews, starting empty");
                Vec::new()
            }
        };
        Self {
            path,
            reviews: RwLock::new(reviews),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> usize {
        self.reviews.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.reviews.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<Review> {
        self.reviews.read().await.clone()
    }

    /// Most recently updated review, used as the pagination boundary.
    pub async fn latest_review(&self) -> Option<Review> {
        self.reviews.read().await.first().cloned()
    }

    pub async fn list_latest(&self, hours: u32, rating: Option<u8>) -> Vec<Review> {
        self.list_latest_at(Utc::now(), hours, rating).await
    }

    /// Reviews updated strictly after `now - hours`, optionally narrowed to one rating.
    pub async fn list_latest_at(
        &self,
        now: DateTime<Utc>,
        hours: u32,
        rating: Option<u8>,
    ) -> Vec<Review> {
        let cutoff = now - TimeDelta::hours(i64::from(hours));
        self.reviews
            .read()
            .await
            .iter()
            .take_while(|r| r.updated_at > cutoff)
            .filter(|r| r.matches_rating(rating))
            .cloned()
            .collect()
    }

    /// Merge `candidates` into the collection, skipping ids already present
    /// (first seen wins), then re-sort and persist if anything was added.
    ///
    /// Returns the number of reviews added. On a write failure the in-memory
    /// collection keeps the new reviews; the next successful write rewrites
    /// the whole file.
    pub async fn add_batch(&self, candidates: Vec<Review>) -> Result<usize, PersistenceError> {
        let mut reviews = self.reviews.write().await;
        let mut known: HashSet<String> = reviews.iter().map(|r| r.id.clone()).collect();
        let before = reviews.len();

        for candidate in candidates {
            if known.insert(candidate.id.clone()) {
                reviews.push(candidate);
            }
        }

        let added = reviews.len() - before;
        sort_newest_first(&mut reviews);

        if added > 0 {
            write_reviews_file(&self.path, &reviews).await?;
            debug!(path = %self.path.display(), added, total = reviews.len(), "persisted reviews");
        }

        Ok(added)
    }
}

async fn read_reviews_file(path: &Path) -> anyhow::Result<Option<Vec<Review>>> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    let reviews = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(reviews))
}

/// Overwrite `path` with the pretty-printed collection via a temp file + rename.
async fn write_reviews_file(path: &Path, reviews: &[Review]) -> Result<(), PersistenceError> {
    let bytes = serde_json::to_vec_pretty(reviews).map_err(|source| PersistenceError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(|e| PersistenceError::io("creating directory", &parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "reviews".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| PersistenceError::io("opening temp file", &temp_path, e))?;
    if let Err(err) = file.write_all(&bytes).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(PersistenceError::io("writing temp file", &temp_path, err));
    }
    if let Err(err) = file.flush().await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(PersistenceError::io("flushing temp file", &temp_path, err));
    }
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(PersistenceError::io("replacing", path, err));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

/// Body of a `200 OK` response, plus the URL it was served from after redirects.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status code {status} for {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },
}

/// Single-shot GET client. No retries: a failed request is reported to the
/// caller, which decides when to try again.
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

    pub async fn fetch_bytes(&self, cycle_id: Uuid, url: &str) -> Result<FetchedResponse, HttpError> {
        let span = info_span!("http_fetch", %cycle_id, url);
        async move {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if status != StatusCode::OK {
                let body = resp.text().await.unwrap_or_default();
                return Err(HttpError::Status {
                    status: status.as_u16(),
                    url: final_url,
                    body,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn review(id: &str, rating: u8, updated_at: DateTime<Utc>) -> Review {
        Review {
            id: id.to_string(),
            title: format!("Title {id}"),
            content: format!("Content {id}"),
            author: format!("Author {id}"),
            rating,
            updated_at,
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    /// Reviews aged 1h, 3h, 25h and 48h with ratings 5, 4, 3, 2.
    fn aged_reviews(now: DateTime<Utc>) -> Vec<Review> {
        vec![
            review("review-1", 5, now - TimeDelta::hours(1)),
            review("review-2", 4, now - TimeDelta::hours(3)),
            review("review-3", 3, now - TimeDelta::hours(25)),
            review("review-4", 2, now - TimeDelta::hours(48)),
        ]
    }

    async fn seeded_store(dir: &Path, reviews: Vec<Review>) -> ReviewStore {
        let file = dir.join("reviews.json");
        std::fs::write(&file, serde_json::to_vec_pretty(&reviews).unwrap()).unwrap();
        ReviewStore::load(&file).await
    }

    fn ids(reviews: &[Review]) -> Vec<&str> {
        reviews.iter().map(|r| r.id.as_str()).collect()
    }

    fn assert_sorted_newest_first(reviews: &[Review]) {
        for pair in reviews.windows(2) {
            assert!(pair[0].updated_at >= pair[1].updated_at, "{} before {}", pair[0].id, pair[1].id);
        }
    }

    #[tokio::test]
    async fn load_missing_file_starts_empty() {
        let dir = tempdir().expect("tempdir");
        let store = ReviewStore::load(dir.path().join("nope.json")).await;
        assert!(store.is_empty().await);
        assert!(store.latest_review().await.is_none());
    }

    #[tokio::test]
    async fn load_malformed_file_starts_empty() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("broken.json");
        std::fs::write(&file, r#"{"invalid": json content without proper closing"#).unwrap();
        let store = ReviewStore::load(&file).await;
        assert!(store.is_empty().await);
        assert_eq!(store.path(), file.as_path());
    }

    #[tokio::test]
    async fn load_resorts_out_of_order_file() {
        let dir = tempdir().expect("tempdir");
        let mut reviews = aged_reviews(fixed_now());
        reviews.reverse();
        let store = seeded_store(dir.path(), reviews).await;
        let snapshot = store.snapshot().await;
        assert_eq!(ids(&snapshot), ["review-1", "review-2", "review-3", "review-4"]);
        assert_eq!(store.latest_review().await.unwrap().id, "review-1");
    }

    #[tokio::test]
    async fn window_query_respects_cutoff_and_rating() {
        let dir = tempdir().expect("tempdir");
        let now = fixed_now();
        let store = seeded_store(dir.path(), aged_reviews(now)).await;

        assert_eq!(ids(&store.list_latest_at(now, 2, None).await), ["review-1"]);
        assert_eq!(ids(&store.list_latest_at(now, 5, None).await), ["review-1", "review-2"]);
        assert_eq!(ids(&store.list_latest_at(now, 24, None).await), ["review-1", "review-2"]);
        assert_eq!(store.list_latest_at(now, 50, None).await.len(), 4);
        assert!(store.list_latest_at(now, 0, None).await.is_empty());

        assert_eq!(ids(&store.list_latest_at(now, 50, Some(2)).await), ["review-4"]);
        assert!(store.list_latest_at(now, 50, Some(1)).await.is_empty());
        assert_eq!(ids(&store.list_latest_at(now, 5, Some(4)).await), ["review-2"]);
        assert!(store.list_latest_at(now, 2, Some(4)).await.is_empty());
    }

    #[tokio::test]
    async fn window_query_against_wall_clock() {
        let dir = tempdir().expect("tempdir");
        let store = seeded_store(dir.path(), aged_reviews(Utc::now())).await;
        assert_eq!(ids(&store.list_latest(5, None).await), ["review-1", "review-2"]);
    }

    #[tokio::test]
    async fn add_batch_adds_sorts_and_persists() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("nested/data/reviews.json");
        let store = ReviewStore::new(&file);
        let now = fixed_now();

        let added = store
            .add_batch(vec![
                review("old", 3, now - TimeDelta::hours(2)),
                review("newest", 5, now),
                review("middle", 4, now - TimeDelta::hours(1)),
            ])
            .await
            .expect("add batch");

        assert_eq!(added, 3);
        let snapshot = store.snapshot().await;
        assert_eq!(ids(&snapshot), ["newest", "middle", "old"]);

        let on_disk: Vec<Review> = serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
        assert_eq!(on_disk, snapshot);
        let leftovers = std::fs::read_dir(file.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn add_batch_twice_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = ReviewStore::new(dir.path().join("reviews.json"));
        let batch = aged_reviews(fixed_now());

        assert_eq!(store.add_batch(batch.clone()).await.unwrap(), 4);
        let first = store.snapshot().await;
        assert_eq!(store.add_batch(batch).await.unwrap(), 0);
        assert_eq!(store.snapshot().await, first);
    }

    #[tokio::test]
    async fn duplicate_ids_count_once_and_first_seen_wins() {
        let dir = tempdir().expect("tempdir");
        let now = fixed_now();
        let store = seeded_store(dir.path(), aged_reviews(now)).await;

        let mut updated = review("review-1", 1, now);
        updated.title = "Updated Great App".into();
        let added = store
            .add_batch(vec![
                updated,
                review("brand-new", 4, now - TimeDelta::minutes(30)),
                review("brand-new", 2, now - TimeDelta::minutes(10)),
            ])
            .await
            .unwrap();

        assert_eq!(added, 1);
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.len(), 5);
        let kept = snapshot.iter().find(|r| r.id == "review-1").unwrap();
        assert_eq!(kept.title, "Title review-1");
        let brand_new = snapshot.iter().find(|r| r.id == "brand-new").unwrap();
        assert_eq!(brand_new.rating, 4);
    }

    #[tokio::test]
    async fn sort_invariant_holds_across_interleaved_batches() {
        let dir = tempdir().expect("tempdir");
        let store = ReviewStore::new(dir.path().join("reviews.json"));
        let now = fixed_now();

        for (offset, chunk) in [[7, 1, 4], [2, 9, 0], [5, 3, 8]].iter().enumerate() {
            let batch = chunk
                .iter()
                .map(|h| review(&format!("r{offset}-{h}"), 3, now - TimeDelta::hours(*h)))
                .collect();
            store.add_batch(batch).await.unwrap();
            assert_sorted_newest_first(&store.snapshot().await);
        }
        assert_eq!(store.len().await, 9);
        assert_eq!(store.latest_review().await.unwrap().id, "r1-0");
    }

    #[tokio::test]
    async fn empty_or_fully_known_batch_does_not_touch_the_file() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("reviews.json");
        let store = ReviewStore::new(&file);
        assert_eq!(store.add_batch(vec![]).await.unwrap(), 0);
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn persisted_file_round_trips_through_load() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("reviews.json");
        let store = ReviewStore::new(&file);
        store.add_batch(aged_reviews(Utc::now())).await.unwrap();

        let reloaded = ReviewStore::load(&file).await;
        assert_eq!(reloaded.snapshot().await, store.snapshot().await);
    }

    #[tokio::test]
    async fn write_failure_surfaces_error_and_keeps_memory() {
        let dir = tempdir().expect("tempdir");
        let dir_path = dir.path().join("should_be_file");
        std::fs::create_dir_all(&dir_path).unwrap();
        let store = ReviewStore::new(&dir_path);

        let err = store
            .add_batch(vec![review("test-review", 5, fixed_now())])
            .await
            .expect_err("writing over a directory must fail");
        assert!(matches!(err, PersistenceError::Io { .. }));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn fetch_bytes_returns_body_on_ok() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let resp = http
            .fetch_bytes(Uuid::new_v4(), &format!("{}/feed", server.uri()))
            .await
            .expect("fetch");
        assert_eq!(resp.final_url, format!("{}/feed", server.uri()));
        assert_eq!(resp.body, b"hello");
    }

    #[tokio::test]
    async fn fetch_bytes_reports_status_and_body_on_non_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = http
            .fetch_bytes(Uuid::new_v4(), &server.uri())
            .await
            .expect_err("500 must fail");
        match err {
            HttpError::Status { status, body, .. } => {
                assert_eq!(status, 500);
                assert_eq!(body, "Internal Server Error");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn fetch_bytes_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_millis(50),
            user_agent: Some("asr-test".into()),
        })
        .unwrap();
        let err = http
            .fetch_bytes(Uuid::new_v4(), &server.uri())
            .await
            .expect_err("slow response must time out");
        match err {
            HttpError::Request(e) => assert!(e.is_timeout()),
            other => panic!("unexpected error: {other}"),
        }
    }
}
