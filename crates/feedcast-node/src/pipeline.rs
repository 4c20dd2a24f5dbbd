//! One fetch/filter/dedup/sign/publish pass over every configured feed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use feedcast_core::link::is_valid_url;
use feedcast_core::text::{slugify, slugify_with, truncate_text, SlugOptions};
use feedcast_core::{now_unix_secs, UnsignedEvent, KIND_METADATA, KIND_TEXT_NOTE};
use feedcast_crypto::{EventSigner, SigningError};
use feedcast_store::DedupStore;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::feed::{fetch_items, FeedItem, RetryPolicy, SourceFeed};
use crate::filter::ItemFilter;
use crate::monitor::Monitor;
use crate::publish::{Coordinator, PublishReport};

const MIN_POST_DELAY: Duration = Duration::from_millis(100);
const MAX_NOTE_TITLE_CHARS: usize = 280;

#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub items_per_feed: usize,
    pub max_stored_links: usize,
    /// Pause between successful posts; zero disables it.
    pub post_delay: Duration,
    pub post_jitter_percent: u32,
    pub retry: RetryPolicy,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            items_per_feed: 5,
            max_stored_links: 1000,
            post_delay: Duration::ZERO,
            post_jitter_percent: 30,
            retry: RetryPolicy::default(),
        }
    }
}

/// Everything one cycle needs, built once at startup.
pub struct PipelineContext {
    pub feeds: Vec<Arc<dyn SourceFeed>>,
    pub filter: Arc<dyn ItemFilter>,
    pub store: Arc<Mutex<DedupStore>>,
    pub signer: Arc<dyn EventSigner>,
    pub coordinator: Coordinator,
    pub monitor: Arc<Mutex<Monitor>>,
    pub settings: CycleSettings,
}

impl PipelineContext {
    fn store(&self) -> std::sync::MutexGuard<'_, DedupStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn monitor(&self) -> std::sync::MutexGuard<'_, Monitor> {
        self.monitor.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub published: usize,
    pub failed: usize,
    pub feed_errors: usize,
}

/// Note body and tags for one item: `title`, link, then the category
/// hashtag when there is one.
pub fn compose_note(item: &FeedItem, category: &str, created_at: u64) -> UnsignedEvent {
    let title = truncate_text(item.title.trim(), MAX_NOTE_TITLE_CHARS);
    let hashtag = slugify_with(
        category,
        SlugOptions {
            hashtag_friendly: true,
        },
    );
    let content = if hashtag.is_empty() {
        format!("{title}\n{}", item.link.trim())
    } else {
        format!("{title}\n{}\n\n#{hashtag}", item.link.trim())
    };
    let mut note = UnsignedEvent::new(KIND_TEXT_NOTE, content, created_at);
    let topic = slugify(category);
    if !topic.is_empty() {
        note = note.with_tag(["t", topic.as_str()]);
    }
    note
}

/// `base` shifted by a uniform random amount of up to `percent` either way,
/// never below 100ms.
pub fn jittered_delay(base: Duration, percent: u32, rng: &mut impl Rng) -> Duration {
    let base_ms = base.as_millis() as f64;
    let spread = base_ms * f64::from(percent) / 100.0;
    let offset = if spread > 0.0 {
        rng.gen_range(-spread..=spread)
    } else {
        0.0
    };
    let ms = (base_ms + offset).max(MIN_POST_DELAY.as_millis() as f64);
    Duration::from_millis(ms as u64)
}

/// Runs one pass over every feed. Publish failures never stop the loop.
pub async fn run_cycle(ctx: &PipelineContext) -> CycleReport {
    ctx.monitor().record_cycle_start();
    let mut report = CycleReport::default();

    for feed in &ctx.feeds {
        let source = feed.source();
        let items = match fetch_items(
            feed.as_ref(),
            ctx.settings.retry,
            ctx.settings.items_per_feed,
        )
        .await
        {
            Ok(items) => items,
            Err(err) => {
                report.feed_errors += 1;
                ctx.monitor()
                    .record_error(format!("feed fetch failed: {err}"), source.name.clone());
                continue;
            }
        };
        debug!(feed = %source.name, items = items.len(), "fetched feed");
        report.fetched += items.len();

        for item in items {
            if !is_valid_url(&item.link) {
                debug!(feed = %source.name, link = %item.link, "skipping item with invalid link");
                report.rejected += 1;
                continue;
            }
            let verdict = ctx.filter.evaluate(&item);
            if verdict.rejected {
                debug!(
                    feed = %source.name,
                    title = %item.title,
                    "filtered: {}",
                    verdict.reason.as_deref().unwrap_or("rejected")
                );
                report.rejected += 1;
                continue;
            }
            if ctx.store().was_published(&item.link, Some(&item.title)) {
                report.duplicates += 1;
                continue;
            }

            let category = if source.category.is_empty() {
                item.categories.first().cloned().unwrap_or_default()
            } else {
                source.category.clone()
            };
            let topic = slugify(&category);
            let note = match ctx.signer.sign(compose_note(&item, &category, now_unix_secs())) {
                Ok(note) => note,
                Err(err) => {
                    error!(feed = %source.name, "failed to sign note: {err}");
                    report.failed += 1;
                    ctx.monitor().record_error(err.to_string(), item.link.clone());
                    continue;
                }
            };

            let outcome = ctx.coordinator.publish(&note).await;
            {
                let mut monitor = ctx.monitor();
                monitor.record_report(&outcome);
                monitor.record_post(outcome.success, Some(&source.name));
            }
            if !outcome.success {
                warn!(feed = %source.name, link = %item.link, "item not published to any relay");
                report.failed += 1;
                ctx.monitor()
                    .record_error("publish failed on every relay", item.link.clone());
                continue;
            }

            ctx.store().add_published_link(
                &item.link,
                ctx.settings.max_stored_links,
                &topic,
                &source.name,
                &item.title,
            );
            report.published += 1;
            info!(
                feed = %source.name,
                relays = outcome.success_count(),
                "published: {}",
                item.title
            );

            if !ctx.settings.post_delay.is_zero() {
                let wait = jittered_delay(
                    ctx.settings.post_delay,
                    ctx.settings.post_jitter_percent,
                    &mut rand::thread_rng(),
                );
                tokio::time::sleep(wait).await;
            }
        }
    }

    let summary = {
        let mut monitor = ctx.monitor();
        monitor.record_cycle_end();
        monitor.summary()
    };
    info!(
        fetched = report.fetched,
        rejected = report.rejected,
        duplicates = report.duplicates,
        published = report.published,
        failed = report.failed,
        "cycle finished"
    );
    debug!("metrics\n{summary}");
    report
}

/// Profile metadata announced once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub name: String,
    pub about: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to encode profile: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to sign profile: {0}")]
    Sign(#[from] SigningError),
}

pub fn profile_note(profile: &Profile, created_at: u64) -> Result<UnsignedEvent, ProfileError> {
    let content = serde_json::to_string(profile)?;
    Ok(UnsignedEvent::new(KIND_METADATA, content, created_at))
}

/// Signs and fans out the profile metadata event.
pub async fn publish_profile(
    profile: &Profile,
    signer: &dyn EventSigner,
    coordinator: &Coordinator,
) -> Result<PublishReport, ProfileError> {
    let event = signer.sign(profile_note(profile, now_unix_secs())?)?;
    let report = coordinator.publish(&event).await;
    if report.success {
        info!(relays = report.success_count(), "profile published");
    } else {
        warn!("profile was not accepted by any relay");
    }
    Ok(report)
}
