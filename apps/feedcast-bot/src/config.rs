use config::{Config, ConfigError, Environment, File};
use feedcast_node::feed::{FeedSource, RetryPolicy};
use feedcast_node::filter::FilterConfig;
use feedcast_node::pipeline::{CycleSettings, Profile};
use feedcast_node::responder::ResponderConfig;
use feedcast_node::{FanOutMode, PoolConfig};
use feedcast_store::StoreOptions;
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct BotConfig {
    pub data_dir: PathBuf,
    #[serde(deserialize_with = "deserialize_list")]
    pub relays: Vec<String>,
    #[serde(default)]
    pub feeds: Vec<FeedSource>,
    pub items_per_feed: usize,
    pub max_stored_links: usize,
    #[serde(with = "humantime_serde")]
    pub cycle_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub post_delay: Duration,
    pub post_jitter_percent: u32,
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    pub fetch_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub publish_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    pub max_retries: u32,
    pub max_publish_errors: u32,
    pub fanout: FanOutMode,
    pub bot_name: String,
    pub bot_description: String,
    pub nip05: Option<String>,
    pub client_tag: String,
    pub private_key: Option<String>,
    pub private_key_path: PathBuf,
    #[serde(default)]
    pub filters: FilterConfig,
    pub responder_enabled: bool,
    #[serde(with = "humantime_serde")]
    pub responded_ttl: Duration,
}

fn deserialize_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ListVisitor;

    impl<'de> Visitor<'de> for ListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a sequence of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value
                .split(|c| c == ',' || c == ';')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect())
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: de::SeqAccess<'de>,
        {
            let mut vec = Vec::new();
            while let Some(element) = seq.next_element()? {
                vec.push(element);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(ListVisitor)
}

impl BotConfig {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("data_dir", "data")?
            .set_default("relays", Vec::<String>::new())?
            .set_default("items_per_feed", 5)?
            .set_default("max_stored_links", 1000)?
            .set_default("cycle_interval", "30m")?
            .set_default("post_delay", "0s")?
            .set_default("post_jitter_percent", 30)?
            .set_default("fetch_timeout", "15s")?
            .set_default("fetch_attempts", 3)?
            .set_default("connect_timeout", "10s")?
            .set_default("publish_timeout", "5s")?
            .set_default("reconnect_delay", "5s")?
            .set_default("max_retries", 3)?
            .set_default("max_publish_errors", 3)?
            .set_default("fanout", "sequential")?
            .set_default("bot_name", "Feedcast")?
            .set_default("bot_description", "Automated news feed broadcaster")?
            .set_default("nip05", None::<String>)?
            .set_default("client_tag", "feedcast")?
            .set_default("private_key", None::<String>)?
            .set_default("private_key_path", "data/bot.key")?
            .set_default("responder_enabled", true)?
            .set_default("responded_ttl", "24h")?;

        if let Some(path) = config_path {
            if path.extension().and_then(|ext| ext.to_str()) == Some("env") {
                // Values from a .env file reach the FEEDCAST_ source below.
                match dotenvy::from_path(&path) {
                    Ok(_) => tracing::info!("loaded environment from {}", path.display()),
                    Err(err) => {
                        tracing::warn!("failed to load .env from {}: {}", path.display(), err)
                    }
                }
            } else {
                builder = builder.add_source(File::from(path));
            }
        }

        builder = builder.add_source(Environment::with_prefix("FEEDCAST").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            reconnect_delay: self.reconnect_delay,
            max_retries: self.max_retries,
            connect_timeout: self.connect_timeout,
            publish_timeout: self.publish_timeout,
            max_publish_errors: self.max_publish_errors,
            fanout: self.fanout,
            ..PoolConfig::default()
        }
    }

    pub fn cycle_settings(&self) -> CycleSettings {
        CycleSettings {
            items_per_feed: self.items_per_feed,
            max_stored_links: self.max_stored_links,
            post_delay: self.post_delay,
            post_jitter_percent: self.post_jitter_percent,
            retry: RetryPolicy {
                max_attempts: self.fetch_attempts,
                ..RetryPolicy::default()
            },
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            responded_ttl: self.responded_ttl,
        }
    }

    pub fn responder_config(&self) -> ResponderConfig {
        ResponderConfig {
            bot_name: self.bot_name.clone(),
            client_tag: self.client_tag.clone(),
            nip05: self.nip05.clone(),
            feeds: self.feeds.clone(),
        }
    }

    pub fn profile(&self) -> Profile {
        Profile {
            name: self.bot_name.clone(),
            about: self.bot_description.clone(),
            nip05: self.nip05.clone(),
        }
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.data_dir.join("metrics.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedcast_node::feed::FeedFormat;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env<F>(vars: &[(&str, &str)], test: F)
    where
        F: FnOnce(),
    {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut old = Vec::new();
        for (k, v) in vars {
            old.push((k.to_string(), env::var(k).ok()));
            env::set_var(k, v);
        }

        test();

        for (k, maybe_old) in old {
            match maybe_old {
                Some(val) => env::set_var(k, val),
                None => env::remove_var(k),
            }
        }
    }

    #[test]
    fn defaults_are_applied() {
        with_env(&[], || {
            let cfg = BotConfig::new(None).expect("failed to build config");

            assert_eq!(cfg.data_dir, PathBuf::from("data"));
            assert!(cfg.relays.is_empty());
            assert!(cfg.feeds.is_empty());
            assert_eq!(cfg.items_per_feed, 5);
            assert_eq!(cfg.max_stored_links, 1000);
            assert_eq!(cfg.cycle_interval, Duration::from_secs(1800));
            assert_eq!(cfg.post_delay, Duration::ZERO);
            assert_eq!(cfg.reconnect_delay, Duration::from_secs(5));
            assert_eq!(cfg.max_retries, 3);
            assert_eq!(cfg.max_publish_errors, 3);
            assert_eq!(cfg.fanout, FanOutMode::Sequential);
            assert_eq!(cfg.nip05, None);
            assert!(cfg.responder_enabled);
            assert_eq!(cfg.filters, FilterConfig::default());
            assert_eq!(cfg.responded_ttl, Duration::from_secs(86_400));
        });
    }

    #[test]
    fn env_vars_override_defaults() {
        with_env(
            &[
                ("FEEDCAST_BOT_NAME", "Night Desk"),
                ("FEEDCAST_MAX_RETRIES", "7"),
                ("FEEDCAST_FANOUT", "concurrent"),
                ("FEEDCAST_RESPONDER_ENABLED", "false"),
                ("FEEDCAST_PUBLISH_TIMEOUT", "1500ms"),
                ("FEEDCAST_RELAYS", "wss://one.example, wss://two.example;wss://three.example"),
            ],
            || {
                let cfg = BotConfig::new(None).expect("failed to build config");
                assert_eq!(cfg.bot_name, "Night Desk");
                assert_eq!(cfg.max_retries, 7);
                assert_eq!(cfg.fanout, FanOutMode::Concurrent);
                assert!(!cfg.responder_enabled);
                assert_eq!(cfg.publish_timeout, Duration::from_millis(1500));
                assert_eq!(
                    cfg.relays,
                    vec![
                        "wss://one.example".to_string(),
                        "wss://two.example".to_string(),
                        "wss://three.example".to_string()
                    ]
                );

                let pool = cfg.pool_config();
                assert_eq!(pool.max_retries, 7);
                assert_eq!(pool.publish_timeout, Duration::from_millis(1500));
            },
        );
    }

    #[test]
    fn file_supplies_feeds_and_filters() {
        use std::io::Write;

        let mut tmp = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        writeln!(
            tmp,
            r#"
relays = ["wss://relay.example"]
cycle_interval = "10m"
max_publish_errors = 5

[[feeds]]
name = "Tech Daily"
url = "https://tech.example/feed.json"
category = "tech"

[[feeds]]
name = "World"
url = "https://world.example/feed.json"
format = "json"

[filters]
exclude_keywords = ["sponsored"]
max_age_hours = 48
"#
        )
        .expect("write to temp file");

        with_env(&[("FEEDCAST_MAX_PUBLISH_ERRORS", "9")], || {
            let cfg = BotConfig::new(Some(PathBuf::from(tmp.path()))).expect("load config");
            assert_eq!(cfg.relays, vec!["wss://relay.example".to_string()]);
            assert_eq!(cfg.cycle_interval, Duration::from_secs(600));
            assert_eq!(cfg.max_publish_errors, 9);
            assert_eq!(cfg.feeds.len(), 2);
            assert_eq!(cfg.feeds[0].category, "tech");
            assert_eq!(cfg.feeds[1].category, "");
            assert_eq!(cfg.feeds[0].format, FeedFormat::Rss);
            assert_eq!(cfg.feeds[1].format, FeedFormat::Json);
            assert_eq!(cfg.filters.exclude_keywords, vec!["sponsored".to_string()]);
            assert_eq!(cfg.filters.max_age_hours, Some(48));
            assert_eq!(cfg.filters.min_title_length, 10);

            let responder = cfg.responder_config();
            assert_eq!(responder.feeds.len(), 2);
            assert_eq!(responder.bot_name, "Feedcast");
        });
    }
}
