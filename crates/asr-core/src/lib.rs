//! Core domain model for App Store Review Radar.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "asr-core";

/// Lowest star rating a customer can leave. A stored rating of `0` means the
/// feed value could not be parsed.
pub const MIN_STAR_RATING: u8 = 1;
pub const MAX_STAR_RATING: u8 = 5;

/// Bounds of the read window, in hours.
pub const MIN_WINDOW_HOURS: u32 = 1;
pub const MAX_WINDOW_HOURS: u32 = 96;
pub const DEFAULT_WINDOW_HOURS: u32 = 48;

/// A single customer review as published by the upstream feed.
///
/// `id` is the identity: two reviews with the same id are the same review,
/// regardless of the other fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub id: String,
    pub title: String,
    pub content: String,
    pub author: String,
    pub rating: u8,
    pub updated_at: DateTime<Utc>,
}

impl Review {
    pub fn matches_rating(&self, rating: Option<u8>) -> bool {
        rating.map_or(true, |r| self.rating == r)
    }
}

pub fn is_star_rating(value: u8) -> bool {
    (MIN_STAR_RATING..=MAX_STAR_RATING).contains(&value)
}

/// Orders reviews newest first. Ties keep their relative order.
pub fn sort_newest_first(reviews: &mut [Review]) {
    reviews.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}
