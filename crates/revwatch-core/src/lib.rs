//! Core domain model for revwatch: tracked apps, normalized reviews and the
//! per-app persisted record, plus the merge and recency-window rules.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "revwatch-core";

/// Recency window applied when a caller does not pass one.
pub const DEFAULT_WINDOW_HOURS: u32 = 48;

/// A tracked application. `id` is the upstream feed identifier and the storage key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub id: String,
    pub name: String,
}

impl App {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// One normalized review. `date` is the upstream publication time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub id: String,
    pub app_id: String,
    pub author: String,
    pub title: String,
    pub content: String,
    pub rating: u8,
    pub date: DateTime<Utc>,
}

/// Durable per-app record. `reviews` is unique by id and sorted newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredReviews {
    pub id: String,
    pub name: String,
    pub last_polled: Option<DateTime<Utc>>,
    pub reviews: Vec<Review>,
}

impl StoredReviews {
    /// Starting point for an app that has never been persisted.
    pub fn empty(app: &App) -> Self {
        Self {
            id: app.id.clone(),
            name: app.name.clone(),
            last_polled: None,
            reviews: Vec::new(),
        }
    }

    /// Fold a freshly fetched batch into this record and stamp the poll time.
    ///
    /// The batch may be empty (a failed fetch still records the attempt).
    pub fn absorb(self, app: &App, incoming: Vec<Review>, polled_at: DateTime<Utc>) -> Self {
        Self {
            id: app.id.clone(),
            name: app.name.clone(),
            last_polled: Some(polled_at),
            reviews: merge_reviews(self.reviews, incoming),
        }
    }

    /// Reviews published within the last `hours`, in stored order.
    pub fn within_window(&self, hours: u32, now: DateTime<Utc>) -> Vec<Review> {
        reviews_within_window(&self.reviews, hours, now)
    }
}

/// Concatenate `existing` and `incoming`, keep one review per id and sort by
/// date descending.
///
/// On a duplicate id the later occurrence replaces the content in place, so the
/// first occurrence fixes the pre-sort position. The sort is stable.
pub fn merge_reviews(existing: Vec<Review>, incoming: Vec<Review>) -> Vec<Review> {
    let capacity = existing.len() + incoming.len();
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(capacity);
    let mut merged: Vec<Review> = Vec::with_capacity(capacity);

    for review in existing.into_iter().chain(incoming) {
        match positions.get(&review.id) {
            Some(&idx) => merged[idx] = review,
            None => {
                positions.insert(review.id.clone(), merged.len());
                merged.push(review);
            }
        }
    }

    merged.sort_by(|a, b| b.date.cmp(&a.date));
    merged
}

/// Inclusive lower bound of a recency window ending at `now`. Saturates at the
/// earliest representable instant for very large windows.
pub fn window_cutoff(hours: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    now.checked_sub_signed(Duration::hours(i64::from(hours)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub fn reviews_within_window(reviews: &[Review], hours: u32, now: DateTime<Utc>) -> Vec<Review> {
    let cutoff = window_cutoff(hours, now);
    reviews
        .iter()
        .filter(|review| review.date >= cutoff)
        .cloned()
        .collect()
}

/// Whether `id` is usable as a storage key (a single safe path component).
pub fn is_valid_app_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
