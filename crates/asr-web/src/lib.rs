//! Axum JSON API over the review store.

use std::sync::Arc;

use asr_core::{is_star_rating, Review, MAX_WINDOW_HOURS, MIN_WINDOW_HOURS};
use asr_storage::ReviewStore;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};

pub const CRATE_NAME: &str = "asr-web";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid rating parameter")]
    InvalidRating,
    #[error("Invalid hours parameter")]
    InvalidHours,
    #[error("Hours parameter must be between {} and {}", MIN_WINDOW_HOURS, MAX_WINDOW_HOURS)]
    HoursOutOfRange,
}

impl IntoResponse for ValidationError {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

/// Raw query string values. Kept as text so malformed numbers become our own 400.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReviewsQuery {
    pub rating: Option<String>,
    pub hours: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewsPage {
    pub app_id: String,
    pub count: usize,
    pub reviews: Vec<Review>,
    pub last_hours: u32,
}

/// Read-only facade: validates window parameters, then asks the store.
#[derive(Debug, Clone)]
pub struct ReviewQueryService {
    store: Arc<ReviewStore>,
    app_id: String,
    default_hours: u32,
}

impl ReviewQueryService {
    pub fn new(store: Arc<ReviewStore>, app_id: impl Into<String>, default_hours: u32) -> Self {
        Self {
            store,
            app_id: app_id.into(),
            default_hours,
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Resolve `(hours, rating)` from the query, applying the default window.
    pub fn validate(&self, query: &ReviewsQuery) -> Result<(u32, Option<u8>), ValidationError> {
        let rating = match non_empty(&query.rating) {
            Some(raw) => {
                let rating = raw
                    .parse::<i64>()
                    .ok()
                    .and_then(|v| u8::try_from(v).ok())
                    .filter(|v| is_star_rating(*v))
                    .ok_or(ValidationError::InvalidRating)?;
                Some(rating)
            }
            None => None,
        };

        let hours = match non_empty(&query.hours) {
            Some(raw) => {
                let hours = raw.parse::<i64>().map_err(|_| ValidationError::InvalidHours)?;
                if !(i64::from(MIN_WINDOW_HOURS)..=i64::from(MAX_WINDOW_HOURS)).contains(&hours) {
                    return Err(ValidationError::HoursOutOfRange);
                }
                hours as u32
            }
            None => self.default_hours,
        };

        Ok((hours, rating))
    }

    pub async fn list_latest(&self, query: &ReviewsQuery) -> Result<ReviewsPage, ValidationError> {
        let (hours, rating) = self.validate(query)?;
        let reviews = self.store.list_latest(hours, rating).await;
        Ok(ReviewsPage {
            app_id: self.app_id.clone(),
            count: reviews.len(),
            reviews,
            last_hours: hours,
        })
    }
}

// Only an empty value counts as absent; whitespace is left for the parser to reject.
fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

#[derive(Clone)]
pub struct AppState {
    pub reviews: ReviewQueryService,
}

impl AppState {
    pub fn new(reviews: ReviewQueryService) -> Self {
        Self { reviews }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/reviews", get(reviews_handler))
        .route("/api/v1/reviews", get(reviews_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` is cancelled, then drain in-flight requests.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "http server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("http server stopped");
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn reviews_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReviewsQuery>,
) -> Response {
    match state.reviews.list_latest(&query).await {
        Ok(page) => {
            debug!(count = page.count, hours = page.last_hours, "served reviews");
            Json(page).into_response()
        }
        Err(err) => {
            debug!(error = %err, ?query, "rejected reviews query");
            err.into_response()
        }
    }
}
