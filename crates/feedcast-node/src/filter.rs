//! Content filters applied to feed items before deduplication.

use feedcast_core::link::extract_domain;
use feedcast_core::now_unix_secs;
use serde::{Deserialize, Serialize};

use crate::feed::FeedItem;

const SUMMARY_SCAN_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub exclude_keywords: Vec<String>,
    pub include_keywords: Vec<String>,
    pub exclude_categories: Vec<String>,
    pub include_categories: Vec<String>,
    pub exclude_domains: Vec<String>,
    pub min_title_length: usize,
    pub max_title_length: usize,
    pub max_age_hours: Option<u64>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            exclude_keywords: Vec::new(),
            include_keywords: Vec::new(),
            exclude_categories: Vec::new(),
            include_categories: Vec::new(),
            exclude_domains: Vec::new(),
            min_title_length: 10,
            max_title_length: 500,
            max_age_hours: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterVerdict {
    pub rejected: bool,
    pub reason: Option<String>,
}

impl FilterVerdict {
    pub fn accept() -> Self {
        Self::default()
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            rejected: true,
            reason: Some(reason.into()),
        }
    }
}

pub trait ItemFilter: Send + Sync {
    fn evaluate(&self, item: &FeedItem) -> FilterVerdict;
}

/// Rule-based filter. Rules run in a fixed order and the first rejection
/// wins. All comparisons are case-insensitive.
#[derive(Debug, Clone)]
pub struct FilterEngine {
    exclude_keywords: Vec<String>,
    include_keywords: Vec<String>,
    exclude_categories: Vec<String>,
    include_categories: Vec<String>,
    exclude_domains: Vec<String>,
    min_title_length: usize,
    max_title_length: usize,
    max_age_hours: Option<u64>,
}

fn lowered(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

fn contains_any(text: &str, keywords: &[String]) -> bool {
    keywords.iter().any(|kw| text.contains(kw.as_str()))
}

impl FilterEngine {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            exclude_keywords: lowered(&config.exclude_keywords),
            include_keywords: lowered(&config.include_keywords),
            exclude_categories: lowered(&config.exclude_categories),
            include_categories: lowered(&config.include_categories),
            exclude_domains: lowered(&config.exclude_domains)
                .into_iter()
                .map(|d| d.trim_start_matches("www.").to_string())
                .collect(),
            min_title_length: config.min_title_length,
            max_title_length: config.max_title_length,
            max_age_hours: config.max_age_hours,
        }
    }

    /// Evaluates `item` as of `now` (unix seconds).
    pub fn evaluate_at(&self, item: &FeedItem, now: u64) -> FilterVerdict {
        let title = item.title.to_lowercase();
        let summary: String = item
            .summary
            .to_lowercase()
            .chars()
            .take(SUMMARY_SCAN_CHARS)
            .collect();
        let categories = lowered(&item.categories);

        let checks = [
            self.check_exclude_keywords(&title, &summary, &categories),
            self.check_include_keywords(&title, &summary),
            self.check_categories(&categories),
            self.check_domain(&item.link),
            self.check_title_length(&item.title),
            self.check_age(item.published_at, now),
        ];
        checks
            .into_iter()
            .find_map(|check| check.err())
            .map(FilterVerdict::reject)
            .unwrap_or_else(FilterVerdict::accept)
    }

    fn check_exclude_keywords(
        &self,
        title: &str,
        summary: &str,
        categories: &[String],
    ) -> Result<(), String> {
        if self.exclude_keywords.is_empty() {
            return Ok(());
        }
        if contains_any(title, &self.exclude_keywords) {
            return Err("excluded keyword in title".to_string());
        }
        if contains_any(summary, &self.exclude_keywords) {
            return Err("excluded keyword in description".to_string());
        }
        match categories
            .iter()
            .find(|c| contains_any(c, &self.exclude_keywords))
        {
            Some(category) => Err(format!("excluded keyword in category: {category}")),
            None => Ok(()),
        }
    }

    fn check_include_keywords(&self, title: &str, summary: &str) -> Result<(), String> {
        if self.include_keywords.is_empty()
            || contains_any(title, &self.include_keywords)
            || contains_any(summary, &self.include_keywords)
        {
            return Ok(());
        }
        Err("does not match required keywords".to_string())
    }

    fn check_categories(&self, categories: &[String]) -> Result<(), String> {
        if let Some(category) = categories
            .iter()
            .find(|c| self.exclude_categories.contains(c))
        {
            return Err(format!("excluded category: {category}"));
        }
        if !self.include_categories.is_empty()
            && !categories.is_empty()
            && !categories.iter().any(|c| self.include_categories.contains(c))
        {
            return Err("category not in whitelist".to_string());
        }
        Ok(())
    }

    fn check_domain(&self, link: &str) -> Result<(), String> {
        if self.exclude_domains.is_empty() {
            return Ok(());
        }
        let domain = extract_domain(link).unwrap_or_default().to_lowercase();
        if self.exclude_domains.contains(&domain) {
            return Err(format!("excluded domain: {domain}"));
        }
        Ok(())
    }

    fn check_title_length(&self, title: &str) -> Result<(), String> {
        let len = title.trim().chars().count();
        if len < self.min_title_length {
            return Err(format!("title too short ({len} chars)"));
        }
        if len > self.max_title_length {
            return Err(format!("title too long ({len} chars)"));
        }
        Ok(())
    }

    fn check_age(&self, published_at: Option<u64>, now: u64) -> Result<(), String> {
        let (Some(max_hours), Some(published)) = (self.max_age_hours, published_at) else {
            return Ok(());
        };
        let age_secs = now.saturating_sub(published);
        if age_secs > max_hours.saturating_mul(3600) {
            return Err(format!("too old ({:.1} hours)", age_secs as f64 / 3600.0));
        }
        Ok(())
    }
}

impl ItemFilter for FilterEngine {
    fn evaluate(&self, item: &FeedItem) -> FilterVerdict {
        self.evaluate_at(item, now_unix_secs())
    }
}
