//! Feed sources (RSS/Atom and JSON Feed over HTTP) and fetch retry.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Document format served at a feed URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    /// RSS 0.9x/1.0/2.0 or Atom.
    #[default]
    #[serde(alias = "atom")]
    Rss,
    /// JSON Feed 1.x.
    Json,
}

/// A configured feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSource {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub format: FeedFormat,
}

/// One entry pulled from a feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub summary: String,
    pub categories: Vec<String>,
    /// Publication time in unix seconds, when the feed carries one.
    pub published_at: Option<u64>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("http request failed: {0}")]
    Http(String),
    #[error("http status {0}")]
    Status(u16),
    #[error("failed to decode feed: {0}")]
    Decode(String),
    #[error("fetch task failed: {0}")]
    Task(String),
}

#[async_trait]
pub trait SourceFeed: Send + Sync {
    fn source(&self) -> &FeedSource;
    async fn fetch(&self) -> Result<Vec<FeedItem>, FeedError>;
}

/// HTTP feed source; the body is parsed according to [`FeedSource::format`].
pub struct HttpFeedSource {
    source: FeedSource,
    agent: ureq::Agent,
}

impl HttpFeedSource {
    pub fn new(source: FeedSource, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .user_agent(concat!("feedcast/", env!("CARGO_PKG_VERSION")))
            .build();
        Self { source, agent }
    }
}

#[async_trait]
impl SourceFeed for HttpFeedSource {
    fn source(&self) -> &FeedSource {
        &self.source
    }

    async fn fetch(&self) -> Result<Vec<FeedItem>, FeedError> {
        let agent = self.agent.clone();
        let url = self.source.url.clone();
        let format = self.source.format;
        tokio::task::spawn_blocking(move || {
            let body = fetch_body(&agent, &url)?;
            match format {
                FeedFormat::Rss => parse_syndication_feed(&body),
                FeedFormat::Json => parse_json_feed(&body),
            }
        })
        .await
        .map_err(|err| FeedError::Task(err.to_string()))?
    }
}

fn fetch_body(agent: &ureq::Agent, url: &str) -> Result<String, FeedError> {
    let response = agent.get(url).call().map_err(|err| match err {
        ureq::Error::Status(code, _) => FeedError::Status(code),
        other => FeedError::Http(other.to_string()),
    })?;
    response
        .into_string()
        .map_err(|err| FeedError::Http(err.to_string()))
}

/// Maps an RSS or Atom document to items. Entries without a link are dropped.
pub fn parse_syndication_feed(body: &str) -> Result<Vec<FeedItem>, FeedError> {
    let feed = feed_rs::parser::parse(body.as_bytes())
        .map_err(|err| FeedError::Decode(err.to_string()))?;
    let items = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let link = entry.links.first()?.href.trim().to_string();
            if link.is_empty() {
                return None;
            }
            let summary = entry
                .summary
                .map(|text| text.content)
                .or_else(|| entry.content.and_then(|content| content.body))
                .map(|raw| strip_html(&raw))
                .unwrap_or_default();
            let published_at = entry
                .published
                .or(entry.updated)
                .and_then(|dt| u64::try_from(dt.timestamp()).ok());
            Some(FeedItem {
                title: entry
                    .title
                    .map(|text| text.content.trim().to_string())
                    .unwrap_or_default(),
                link,
                summary: summary.trim().to_string(),
                categories: entry
                    .categories
                    .into_iter()
                    .map(|category| category.term.trim().to_string())
                    .filter(|term| !term.is_empty())
                    .collect(),
                published_at,
            })
        })
        .collect();
    Ok(items)
}

#[derive(Debug, Deserialize)]
struct JsonFeedDocument {
    #[serde(default)]
    items: Vec<JsonFeedEntry>,
}

#[derive(Debug, Deserialize)]
struct JsonFeedEntry {
    title: Option<String>,
    url: Option<String>,
    external_url: Option<String>,
    summary: Option<String>,
    content_text: Option<String>,
    content_html: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    date_published: Option<String>,
}

/// Maps a JSON Feed document to items. Entries without a link are dropped.
pub fn parse_json_feed(body: &str) -> Result<Vec<FeedItem>, FeedError> {
    let doc: JsonFeedDocument =
        serde_json::from_str(body).map_err(|err| FeedError::Decode(err.to_string()))?;
    let items = doc
        .items
        .into_iter()
        .filter_map(|entry| {
            let link = entry.url.or(entry.external_url)?;
            let summary = entry
                .summary
                .or(entry.content_text)
                .or_else(|| entry.content_html.as_deref().map(strip_html))
                .unwrap_or_default();
            let published_at = entry.date_published.as_deref().and_then(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .ok()
                    .and_then(|dt| u64::try_from(dt.timestamp()).ok())
            });
            Some(FeedItem {
                title: entry.title.unwrap_or_default().trim().to_string(),
                link: link.trim().to_string(),
                summary: summary.trim().to_string(),
                categories: entry.tags,
                published_at,
            })
        })
        .collect();
    Ok(items)
}

/// Drops markup and decodes the handful of entities common in feed bodies.
pub fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Fixed items, or a fixed failure. Counts fetches.
pub struct StaticFeed {
    source: FeedSource,
    result: Result<Vec<FeedItem>, FeedError>,
    fetches: AtomicU32,
}

impl StaticFeed {
    pub fn new(source: FeedSource, items: Vec<FeedItem>) -> Self {
        Self {
            source,
            result: Ok(items),
            fetches: AtomicU32::new(0),
        }
    }

    pub fn failing(source: FeedSource, error: FeedError) -> Self {
        Self {
            source,
            result: Err(error),
            fetches: AtomicU32::new(0),
        }
    }

    pub fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SourceFeed for StaticFeed {
    fn source(&self) -> &FeedSource {
        &self.source
    }

    async fn fetch(&self) -> Result<Vec<FeedItem>, FeedError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.result.clone()
    }
}

/// Exponential backoff for feed fetches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt `index` (0-based).
    pub fn delay_for(&self, index: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(index as i32);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// Runs `op` until it succeeds or `policy.max_attempts` is spent, returning
/// the last error.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut index = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if index + 1 >= attempts => return Err(err),
            Err(err) => {
                let delay = policy.delay_for(index);
                debug!(
                    attempt = index + 1,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after error: {err}"
                );
                tokio::time::sleep(delay).await;
                index += 1;
            }
        }
    }
}

/// Fetches one source with retry, keeping at most `limit` items.
pub async fn fetch_items(
    feed: &dyn SourceFeed,
    policy: RetryPolicy,
    limit: usize,
) -> Result<Vec<FeedItem>, FeedError> {
    let mut items = retry_with_backoff(policy, || feed.fetch())
        .await
        .inspect_err(|err| warn!(feed = %feed.source().name, "fetch failed: {err}"))?;
    items.truncate(limit);
    Ok(items)
}
