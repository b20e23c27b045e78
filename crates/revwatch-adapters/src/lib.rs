//! Review feed adapter contract + the App Store customer-reviews implementation.
//!
//! The upstream wire format wraps every scalar in a `{"label": ...}` object. All
//! knowledge of that shape stays in this crate; callers only see [`Review`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use revwatch_core::Review;
use revwatch_storage::{HttpError, HttpFetcher, RetryDisposition};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "revwatch-adapters";

pub const DEFAULT_FEED_BASE_URL: &str = "https://itunes.apple.com";
pub const DEFAULT_FEED_COUNTRY: &str = "us";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("feed body is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unexpected feed shape: {0}")]
    Schema(String),
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Http(err) => err.disposition(),
            Self::Parse(_) | Self::Schema(_) => RetryDisposition::NonRetryable,
        }
    }
}

/// Why a single feed entry was dropped during normalization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntrySkip {
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("rating {0:?} is not an integer in 1..=5")]
    Rating(String),
    #[error("timestamp {0:?} is not RFC 3339")]
    Timestamp(String),
}

#[async_trait]
pub trait FeedClient: Send + Sync {
    /// Fetch the most-recent-first page for `app_id`. One request, no retries.
    async fn fetch(&self, app_id: &str) -> Result<Vec<Review>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct AppStoreFeedClient {
    http: HttpFetcher,
    base_url: String,
    country: String,
}

impl AppStoreFeedClient {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            http,
            base_url: DEFAULT_FEED_BASE_URL.to_string(),
            country: DEFAULT_FEED_COUNTRY.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = country.into();
        self
    }

    pub fn feed_url(&self, app_id: &str) -> String {
        format!(
            "{}/{}/rss/customerreviews/id={}/sortBy=mostRecent/page=1/json",
            self.base_url.trim_end_matches('/'),
            self.country,
            app_id
        )
    }
}

#[async_trait]
impl FeedClient for AppStoreFeedClient {
    async fn fetch(&self, app_id: &str) -> Result<Vec<Review>, FetchError> {
        let url = self.feed_url(app_id);
        let resp = self.http.fetch_bytes(&url).await?;
        if resp.final_url != url {
            debug!(app_id, final_url = %resp.final_url, "feed request was redirected");
        }
        parse_feed(&resp.body, app_id)
    }
}

/// Normalize a raw feed document. Malformed entries are skipped; only a body that
/// is not a feed document at all is an error.
pub fn parse_feed(body: &[u8], app_id: &str) -> Result<Vec<Review>, FetchError> {
    let doc: JsonValue = serde_json::from_slice(body)?;
    let feed = doc
        .get("feed")
        .filter(|feed| feed.is_object())
        .ok_or_else(|| FetchError::Schema("missing `feed` object".to_string()))?;

    // A page holding a single review arrives as a bare object.
    let entries: Vec<&JsonValue> = match feed.get("entry") {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::Array(items)) => items.iter().collect(),
        Some(entry @ JsonValue::Object(_)) => vec![entry],
        Some(other) => {
            return Err(FetchError::Schema(format!(
                "`feed.entry` must be an array or object, got {}",
                json_kind(other)
            )))
        }
    };

    let mut reviews = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        match normalize_entry(entry, app_id) {
            Ok(review) => reviews.push(review),
            Err(reason) => debug!(app_id, index, %reason, "skipping feed entry"),
        }
    }
    Ok(reviews)
}

pub fn normalize_entry(entry: &JsonValue, app_id: &str) -> Result<Review, EntrySkip> {
    let id = label(entry, &["id", "label"], "id")?;
    if id.trim().is_empty() {
        return Err(EntrySkip::Missing("id"));
    }
    let author = label(entry, &["author", "name", "label"], "author.name")?;
    let title = label(entry, &["title", "label"], "title")?;
    let content = label(entry, &["content", "label"], "content")?;
    let rating = parse_rating(label(entry, &["im:rating", "label"], "im:rating")?)?;
    let date = parse_timestamp(label(entry, &["updated", "label"], "updated")?)?;

    Ok(Review {
        id: id.to_string(),
        app_id: app_id.to_string(),
        author: author.to_string(),
        title: title.to_string(),
        content: content.to_string(),
        rating,
        date,
    })
}

fn label<'a>(
    entry: &'a JsonValue,
    path: &[&str],
    field: &'static str,
) -> Result<&'a str, EntrySkip> {
    json_str(entry, path).ok_or(EntrySkip::Missing(field))
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn parse_rating(raw: &str) -> Result<u8, EntrySkip> {
    match raw.trim().parse::<u8>() {
        Ok(rating) if (1..=5).contains(&rating) => Ok(rating),
        _ => Err(EntrySkip::Rating(raw.to_string())),
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, EntrySkip> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| EntrySkip::Timestamp(raw.to_string()))
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use revwatch_storage::HttpClientConfig;
    use serde_json::json;
    use std::path::{Path, PathBuf};

    fn fixture_path() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/app-store/customerreviews.json")
    }

    fn entry(id: &str, rating: &str, updated: &str) -> JsonValue {
        json!({
            "id": { "label": id },
            "title": { "label": "Great app!" },
            "content": { "label": "I love this application", "attributes": { "type": "text" } },
            "im:rating": { "label": rating },
            "author": { "name": { "label": "Gabriele" } },
            "updated": { "label": updated }
        })
    }

    #[test]
    fn recorded_feed_normalizes_valid_entries_and_skips_the_rest() {
        let body = std::fs::read(fixture_path()).unwrap();
        let reviews = parse_feed(&body, "595068606").unwrap();

        let ids: Vec<_> = reviews.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["13001122334", "13001122335", "13001122338"]);

        let first = &reviews[0];
        assert_eq!(first.app_id, "595068606");
        assert_eq!(first.author, "Gabriele");
        assert_eq!(first.title, "Great app!");
        assert_eq!(first.content, "I love this application");
        assert_eq!(first.rating, 5);
        assert_eq!(
            first.date,
            Utc.with_ymd_and_hms(2025, 10, 1, 10, 12, 44).single().unwrap()
        );
    }

    #[test]
    fn single_entry_object_is_accepted() {
        let body = json!({ "feed": { "entry": entry("review_123", "5", "2025-10-01T00:00:00Z") } });
        let reviews = parse_feed(body.to_string().as_bytes(), "123456789").unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].id, "review_123");
        assert_eq!(reviews[0].app_id, "123456789");
    }

    #[test]
    fn feed_without_entries_is_empty_not_an_error() {
        let body = json!({ "feed": { "author": { "name": { "label": "iTunes Store" } } } });
        assert!(parse_feed(body.to_string().as_bytes(), "1").unwrap().is_empty());
    }

    #[test]
    fn non_feed_documents_are_fetch_errors() {
        assert!(matches!(parse_feed(b"<html>", "1"), Err(FetchError::Parse(_))));
        assert!(matches!(parse_feed(b"{}", "1"), Err(FetchError::Schema(_))));
        assert!(matches!(
            parse_feed(br#"{"feed": {"entry": "nope"}}"#, "1"),
            Err(FetchError::Schema(_))
        ));
    }

    #[test]
    fn bad_rating_or_timestamp_skips_only_that_entry() {
        assert_eq!(
            normalize_entry(&entry("a", "five", "2025-10-01T00:00:00Z"), "1"),
            Err(EntrySkip::Rating("five".to_string()))
        );
        assert_eq!(
            normalize_entry(&entry("a", "0", "2025-10-01T00:00:00Z"), "1"),
            Err(EntrySkip::Rating("0".to_string()))
        );
        assert_eq!(
            normalize_entry(&entry("a", "3", "yesterday"), "1"),
            Err(EntrySkip::Timestamp("yesterday".to_string()))
        );

        let body = json!({ "feed": { "entry": [
            entry("bad", "9", "2025-10-01T00:00:00Z"),
            entry("good", "3", "2025-10-01T00:00:00Z"),
        ] } });
        let reviews = parse_feed(body.to_string().as_bytes(), "1").unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].id, "good");
    }

    #[test]
    fn missing_fields_are_reported_by_name() {
        let mut value = entry("a", "3", "2025-10-01T00:00:00Z");
        value.as_object_mut().unwrap().remove("author");
        assert_eq!(normalize_entry(&value, "1"), Err(EntrySkip::Missing("author.name")));

        let blank_id = entry("  ", "3", "2025-10-01T00:00:00Z");
        assert_eq!(normalize_entry(&blank_id, "1"), Err(EntrySkip::Missing("id")));
    }

    #[test]
    fn feed_url_follows_the_most_recent_first_template() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let client = AppStoreFeedClient::new(http.clone());
        assert_eq!(
            client.feed_url("123456789"),
            "https://itunes.apple.com/us/rss/customerreviews/id=123456789/sortBy=mostRecent/page=1/json"
        );

        let client = AppStoreFeedClient::new(http)
            .with_base_url("http://127.0.0.1:9000/")
            .with_country("gb");
        assert_eq!(
            client.feed_url("1"),
            "http://127.0.0.1:9000/gb/rss/customerreviews/id=1/sortBy=mostRecent/page=1/json"
        );
    }

    #[test]
    fn only_transport_failures_are_retryable() {
        let status = FetchError::Http(HttpError::HttpStatus {
            status: 500,
            url: "u".into(),
        });
        assert_eq!(status.disposition(), RetryDisposition::Retryable);
        assert_eq!(
            FetchError::Schema("x".into()).disposition(),
            RetryDisposition::NonRetryable
        );
    }
}
