use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use feedcast_core::{canonical_url, content_hash, now_unix_secs};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::persistence::{load_json_or_default, save_json, PersistenceError};

const LINKS_FILE: &str = "published.json";
const STATS_FILE: &str = "stats.json";
const RESPONDED_FILE: &str = "responded_events.json";

/// Default lifetime of a responded-event record.
pub const DEFAULT_RESPONDED_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// One broadcast item as kept in the item log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredItem {
    pub url: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub feed: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub timestamp: u64,
}

/// Running counters, persisted separately from the item log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Stats {
    pub total_published: u64,
    pub total_responded: u64,
    pub last_run: Option<u64>,
    pub feed_stats: BTreeMap<String, u64>,
}

/// [`Stats`] plus values derived from the in-memory collections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_published: u64,
    pub total_responded: u64,
    pub last_run: Option<u64>,
    pub feed_stats: BTreeMap<String, u64>,
    pub total_stored: usize,
    pub responded_events_stored: usize,
}

/// Whole-store dump used for backup and migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExportedData {
    pub published_links: Vec<StoredItem>,
    pub responded_events: Vec<(String, u64)>,
    pub stats: Stats,
    pub exported_at: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LinksDisk {
    #[serde(default)]
    links: Vec<StoredItem>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RespondedDisk {
    #[serde(default)]
    events: Vec<(String, u64)>,
}

#[derive(Debug, Clone)]
struct StorePaths {
    links: PathBuf,
    stats: PathBuf,
    responded: PathBuf,
}

impl StorePaths {
    fn in_dir(dir: &Path) -> Self {
        Self {
            links: dir.join(LINKS_FILE),
            stats: dir.join(STATS_FILE),
            responded: dir.join(RESPONDED_FILE),
        }
    }
}

/// Tunables for [`DedupStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub responded_ttl: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            responded_ttl: DEFAULT_RESPONDED_TTL,
        }
    }
}

/// Deduplication store: bounded FIFO item log, stats and responded events.
///
/// Every mutating call rewrites the affected files. Write failures are
/// logged and leave the in-memory state as mutated.
#[derive(Debug)]
pub struct DedupStore {
    links: VecDeque<StoredItem>,
    stats: Stats,
    responded: HashMap<String, u64>,
    paths: Option<StorePaths>,
    responded_ttl_secs: u64,
}

impl DedupStore {
    /// Opens the store rooted at `data_dir`, loading whatever state is there.
    pub fn open(data_dir: impl AsRef<Path>, options: StoreOptions) -> Self {
        let paths = StorePaths::in_dir(data_dir.as_ref());
        let links: LinksDisk = load_json_or_default(&paths.links);
        let stats: Stats = load_json_or_default(&paths.stats);
        let responded: RespondedDisk = load_json_or_default(&paths.responded);

        let mut store = Self::empty(Some(paths), options);
        store.stats = stats;
        let mut seen = HashSet::new();
        for item in links.links {
            if seen.insert(item.url.to_lowercase()) {
                store.links.push_back(item);
            }
        }
        store.responded = responded.events.into_iter().collect();

        let pruned = store.prune_responded(now_unix_secs());
        if pruned > 0 {
            info!(pruned, "cleaned up expired responded events");
            store.persist_responded();
        }
        info!(
            links = store.links.len(),
            responded = store.responded.len(),
            "loaded dedup store"
        );
        store
    }

    /// A store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self::empty(None, StoreOptions::default())
    }

    fn empty(paths: Option<StorePaths>, options: StoreOptions) -> Self {
        Self {
            links: VecDeque::new(),
            stats: Stats::default(),
            responded: HashMap::new(),
            paths,
            responded_ttl_secs: options.responded_ttl.as_secs(),
        }
    }

    /// Whether the link (or the same title under a noisy link) was broadcast.
    pub fn was_published(&self, url: &str, title: Option<&str>) -> bool {
        let canonical = canonical_url(url);
        let hash = title.map(|t| content_hash(t.trim(), url));
        self.links.iter().any(|item| {
            item.url.eq_ignore_ascii_case(&canonical)
                || hash.as_deref().is_some_and(|h| item.hash == h)
        })
    }

    /// Records a broadcast item, evicting the oldest entries beyond
    /// `max_retained`, and persists the item log and stats. A bound of zero
    /// keeps no entries; stats still count the item.
    pub fn add_published_link(
        &mut self,
        url: &str,
        max_retained: usize,
        category: &str,
        source_label: &str,
        title: &str,
    ) {
        let canonical = canonical_url(url);
        let title = title.trim();
        let now = now_unix_secs();

        let before = self.links.len();
        self.links
            .retain(|item| !item.url.eq_ignore_ascii_case(&canonical));
        if self.links.len() != before {
            debug!(url = %canonical, "replacing stored entry with same canonical url");
        }

        self.links.push_back(StoredItem {
            hash: content_hash(title, url),
            url: canonical,
            category: category.trim().to_string(),
            feed: source_label.trim().to_string(),
            title: title.to_string(),
            timestamp: now,
        });
        while self.links.len() > max_retained {
            self.links.pop_front();
        }

        self.stats.total_published = self.stats.total_published.saturating_add(1);
        self.stats.last_run = Some(now);
        let label = source_label.trim();
        if !label.is_empty() {
            *self.stats.feed_stats.entry(label.to_string()).or_insert(0) += 1;
        }

        self.persist_links();
        self.persist_stats();
    }

    /// Newest-first `"title\nurl"` lines matching `filter_key`.
    ///
    /// Matches on category, or on the source label when `match_by_source`
    /// is set. An empty key selects everything.
    pub fn fetch_latest_news(
        &self,
        filter_key: &str,
        limit: usize,
        match_by_source: bool,
    ) -> Vec<String> {
        let key = filter_key.trim();
        let matching: Vec<&StoredItem> = self
            .links
            .iter()
            .filter(|item| {
                if key.is_empty() {
                    return true;
                }
                let field = if match_by_source {
                    &item.feed
                } else {
                    &item.category
                };
                field.eq_ignore_ascii_case(key)
            })
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching[skip..]
            .iter()
            .rev()
            .map(|item| format!("{}\n{}", item.title, item.url))
            .collect()
    }

    /// Distinct non-empty categories.
    pub fn get_categories(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.links
            .iter()
            .filter(|item| !item.category.is_empty())
            .filter(|item| seen.insert(item.category.clone()))
            .map(|item| item.category.clone())
            .collect()
    }

    pub fn was_responded(&self, event_id: &str) -> bool {
        self.responded.contains_key(event_id)
    }

    /// Remembers that `event_id` was answered.
    pub fn add_responded_event(&mut self, event_id: &str) {
        self.add_responded_event_at(event_id, now_unix_secs());
    }

    /// As [`Self::add_responded_event`] with an explicit timestamp.
    pub fn add_responded_event_at(&mut self, event_id: &str, at: u64) {
        self.prune_responded(at);
        self.responded.insert(event_id.to_string(), at);
        self.stats.total_responded = self.stats.total_responded.saturating_add(1);
        self.persist_responded();
        self.persist_stats();
    }

    /// Drops responded events older than the TTL relative to `now`.
    /// Returns how many were removed.
    pub fn prune_responded(&mut self, now: u64) -> usize {
        let cutoff = now.saturating_sub(self.responded_ttl_secs);
        let before = self.responded.len();
        self.responded.retain(|_, ts| *ts >= cutoff);
        before - self.responded.len()
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_published: self.stats.total_published,
            total_responded: self.stats.total_responded,
            last_run: self.stats.last_run,
            feed_stats: self.stats.feed_stats.clone(),
            total_stored: self.links.len(),
            responded_events_stored: self.responded.len(),
        }
    }

    pub fn get_feed_stats(&self) -> BTreeMap<String, u64> {
        self.stats.feed_stats.clone()
    }

    /// Stored items, oldest first.
    pub fn published_links(&self) -> impl Iterator<Item = &StoredItem> + '_ {
        self.links.iter()
    }

    pub fn export_data(&self) -> ExportedData {
        ExportedData {
            published_links: self.links.iter().cloned().collect(),
            responded_events: self.sorted_responded(),
            stats: self.stats.clone(),
            exported_at: now_unix_secs(),
        }
    }

    /// Replaces the store contents with `data` and persists everything.
    pub fn import_data(&mut self, data: ExportedData) {
        let mut seen = HashSet::new();
        self.links = data
            .published_links
            .into_iter()
            .filter(|item| seen.insert(item.url.to_lowercase()))
            .collect();
        self.responded = data.responded_events.into_iter().collect();
        self.stats = data.stats;
        info!(
            links = self.links.len(),
            responded = self.responded.len(),
            "imported store data"
        );
        self.persist_links();
        self.persist_stats();
        self.persist_responded();
    }

    fn sorted_responded(&self) -> Vec<(String, u64)> {
        let mut events: Vec<(String, u64)> = self
            .responded
            .iter()
            .map(|(id, ts)| (id.clone(), *ts))
            .collect();
        events.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        events
    }

    fn persist_links(&self) {
        let Some(paths) = &self.paths else {
            return;
        };
        let disk = LinksDisk {
            links: self.links.iter().cloned().collect(),
        };
        report(&paths.links, save_json(&paths.links, &disk));
    }

    fn persist_stats(&self) {
        let Some(paths) = &self.paths else {
            return;
        };
        report(&paths.stats, save_json(&paths.stats, &self.stats));
    }

    fn persist_responded(&self) {
        let Some(paths) = &self.paths else {
            return;
        };
        let disk = RespondedDisk {
            events: self.sorted_responded(),
        };
        report(&paths.responded, save_json(&paths.responded, &disk));
    }
}

fn report(path: &Path, result: Result<(), PersistenceError>) {
    if let Err(err) = result {
        error!("failed to persist {}: {err}", path.display());
    }
}
