//! Run-time counters for cycles, posts and relay health.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use feedcast_core::now_unix_secs;
use feedcast_core::text::format_timestamp;
use feedcast_store::persistence::{load_json_or_default, save_json};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::publish::PublishReport;

const EWMA_ALPHA: f64 = 0.2;
const MAX_STORED_ERRORS: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Health {
    pub successes: u64,
    pub failures: u64,
    pub last_success: Option<u64>,
    pub last_failure: Option<u64>,
}

impl Health {
    fn record(&mut self, success: bool, now: u64) {
        if success {
            self.successes += 1;
            self.last_success = Some(now);
        } else {
            self.failures += 1;
            self.last_failure = Some(now);
        }
    }

    pub fn total(&self) -> u64 {
        self.successes + self.failures
    }

    /// Percentage in `[0, 100]`; 0 with no samples.
    pub fn success_rate(&self) -> f64 {
        percentage(self.successes, self.total())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Metrics {
    pub started_at: u64,
    pub cycles: u64,
    pub successful_posts: u64,
    pub failed_posts: u64,
    pub total_errors: u64,
    pub relay_health: BTreeMap<String, Health>,
    pub feed_health: BTreeMap<String, Health>,
    pub last_cycle_ms: Option<u64>,
    pub average_cycle_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEntry {
    pub timestamp: u64,
    pub message: String,
    pub context: String,
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 * 100.0 / total as f64
}

#[derive(Debug)]
pub struct Monitor {
    metrics: Metrics,
    errors: VecDeque<ErrorEntry>,
    path: Option<PathBuf>,
    cycle_started: Option<Instant>,
}

impl Monitor {
    /// Loads counters from `path` (missing or malformed starts fresh). The
    /// uptime clock always restarts.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut metrics: Metrics = load_json_or_default(&path);
        metrics.started_at = now_unix_secs();
        Self {
            metrics,
            errors: VecDeque::new(),
            path: Some(path),
            cycle_started: None,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            metrics: Metrics {
                started_at: now_unix_secs(),
                ..Metrics::default()
            },
            errors: VecDeque::new(),
            path: None,
            cycle_started: None,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn save(&self) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(err) = save_json(path, &self.metrics) {
            error!("failed to save metrics to {}: {err}", path.display());
        }
    }

    pub fn record_cycle_start(&mut self) {
        self.cycle_started = Some(Instant::now());
        self.metrics.cycles += 1;
    }

    pub fn record_cycle_end(&mut self) {
        let Some(started) = self.cycle_started.take() else {
            return;
        };
        self.record_cycle_duration(started.elapsed());
        self.save();
    }

    /// Folds one cycle duration into the last/average figures.
    pub fn record_cycle_duration(&mut self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.metrics.last_cycle_ms = Some(ms);
        self.metrics.average_cycle_ms = if self.metrics.average_cycle_ms == 0.0 {
            ms as f64
        } else {
            self.metrics.average_cycle_ms * (1.0 - EWMA_ALPHA) + ms as f64 * EWMA_ALPHA
        };
    }

    pub fn record_post(&mut self, success: bool, feed: Option<&str>) {
        let now = now_unix_secs();
        if success {
            self.metrics.successful_posts += 1;
        } else {
            self.metrics.failed_posts += 1;
        }
        if let Some(feed) = feed {
            self.metrics
                .feed_health
                .entry(feed.to_string())
                .or_default()
                .record(success, now);
        }
    }

    pub fn record_relay_publish(&mut self, relay: &str, success: bool) {
        self.metrics
            .relay_health
            .entry(relay.to_string())
            .or_default()
            .record(success, now_unix_secs());
    }

    /// Records every per-relay outcome of a fan-out.
    pub fn record_report(&mut self, report: &PublishReport) {
        for outcome in &report.outcomes {
            self.record_relay_publish(&outcome.address, outcome.success);
        }
    }

    pub fn record_error(&mut self, message: impl Into<String>, context: impl Into<String>) {
        self.metrics.total_errors += 1;
        self.errors.push_front(ErrorEntry {
            timestamp: now_unix_secs(),
            message: message.into(),
            context: context.into(),
        });
        self.errors.truncate(MAX_STORED_ERRORS);
        self.save();
    }

    pub fn success_rate(&self) -> f64 {
        percentage(
            self.metrics.successful_posts,
            self.metrics.successful_posts + self.metrics.failed_posts,
        )
    }

    /// Most recent first.
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorEntry> {
        self.errors.iter().take(limit).cloned().collect()
    }

    /// Relays ordered by total attempts, busiest first.
    pub fn relay_health_report(&self) -> Vec<(String, Health)> {
        let mut report: Vec<(String, Health)> = self
            .metrics
            .relay_health
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        report.sort_by(|a, b| b.1.total().cmp(&a.1.total()));
        report
    }

    /// Feeds ordered by successful posts.
    pub fn feed_health_report(&self) -> Vec<(String, Health)> {
        let mut report: Vec<(String, Health)> = self
            .metrics
            .feed_health
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        report.sort_by(|a, b| b.1.successes.cmp(&a.1.successes));
        report
    }

    pub fn reset(&mut self) {
        self.metrics = Metrics {
            started_at: now_unix_secs(),
            ..Metrics::default()
        };
        self.errors.clear();
        self.save();
    }

    /// Plain-text dashboard.
    pub fn summary(&self) -> String {
        let m = &self.metrics;
        let mut out = String::new();
        let _ = writeln!(out, "uptime: {}", format_uptime(now_unix_secs().saturating_sub(m.started_at)));
        let _ = writeln!(out, "cycles: {}", m.cycles);
        let _ = writeln!(
            out,
            "posts: {} successful, {} failed ({:.2}% success)",
            m.successful_posts,
            m.failed_posts,
            self.success_rate()
        );
        let _ = writeln!(out, "errors: {}", m.total_errors);
        match m.last_cycle_ms {
            Some(last) => {
                let _ = writeln!(
                    out,
                    "cycle time: last {:.2}s, avg {:.2}s",
                    last as f64 / 1000.0,
                    m.average_cycle_ms / 1000.0
                );
            }
            None => {
                let _ = writeln!(out, "cycle time: n/a");
            }
        }
        for (relay, health) in self.relay_health_report().iter().take(5) {
            let _ = writeln!(
                out,
                "relay {relay}: {:.1}% of {}",
                health.success_rate(),
                health.total()
            );
        }
        for (feed, health) in self.feed_health_report().iter().take(5) {
            let _ = writeln!(
                out,
                "feed {feed}: {} posts ({:.1}%)",
                health.successes,
                health.success_rate()
            );
        }
        for entry in self.recent_errors(3) {
            let _ = writeln!(
                out,
                "error [{}] {}",
                format_timestamp(entry.timestamp),
                entry.message
            );
        }
        out
    }
}

/// Compact `1d 2h` / `3h 4m` / `5m 6s` / `7s` rendering.
pub fn format_uptime(secs: u64) -> String {
    let minutes = secs / 60;
    let hours = minutes / 60;
    let days = hours / 24;
    if days > 0 {
        format!("{days}d {}h", hours % 24)
    } else if hours > 0 {
        format!("{hours}h {}m", minutes % 60)
    } else if minutes > 0 {
        format!("{minutes}m {}s", secs % 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{format_uptime, Monitor};
    use crate::publish::{PublishOutcome, PublishReport};

    #[test]
    fn cycle_average_is_exponentially_weighted() {
        let mut monitor = Monitor::in_memory();
        monitor.record_cycle_duration(Duration::from_millis(1000));
        assert_eq!(monitor.metrics().average_cycle_ms, 1000.0);
        monitor.record_cycle_duration(Duration::from_millis(2000));
        assert!((monitor.metrics().average_cycle_ms - 1200.0).abs() < 1e-9);
        assert_eq!(monitor.metrics().last_cycle_ms, Some(2000));
    }

    #[test]
    fn posts_and_relays_are_tallied() {
        let mut monitor = Monitor::in_memory();
        monitor.record_post(true, Some("Feed A"));
        monitor.record_post(true, Some("Feed A"));
        monitor.record_post(false, Some("Feed B"));
        monitor.record_report(&PublishReport {
            success: true,
            outcomes: vec![
                PublishOutcome {
                    address: "wss://a".to_string(),
                    success: true,
                    error: None,
                },
                PublishOutcome {
                    address: "wss://b".to_string(),
                    success: false,
                    error: Some("timeout".to_string()),
                },
            ],
        });

        assert!((monitor.success_rate() - 66.666).abs() < 0.01);
        let feeds = monitor.feed_health_report();
        assert_eq!(feeds[0].0, "Feed A");
        assert_eq!(feeds[0].1.successes, 2);
        assert_eq!(monitor.metrics().relay_health["wss://b"].failures, 1);
        assert!(monitor.summary().contains("relay wss://a: 100.0% of 1"));
    }

    #[test]
    fn error_list_is_bounded_newest_first() {
        let mut monitor = Monitor::in_memory();
        for i in 0..60 {
            monitor.record_error(format!("error {i}"), "test");
        }
        assert_eq!(monitor.metrics().total_errors, 60);
        let recent = monitor.recent_errors(100);
        assert_eq!(recent.len(), 50);
        assert_eq!(recent[0].message, "error 59");
    }

    #[test]
    fn metrics_persist_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("metrics.json");
        {
            let mut monitor = Monitor::open(&path);
            monitor.record_cycle_start();
            monitor.record_post(true, None);
            monitor.record_cycle_end();
        }
        let monitor = Monitor::open(&path);
        assert_eq!(monitor.metrics().cycles, 1);
        assert_eq!(monitor.metrics().successful_posts, 1);
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(5), "5s");
        assert_eq!(format_uptime(125), "2m 5s");
        assert_eq!(format_uptime(3 * 3600 + 120), "3h 2m");
        assert_eq!(format_uptime(2 * 86400 + 3600), "2d 1h");
    }
}
