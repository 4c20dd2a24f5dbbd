//! Answers `!command` mentions with replies threaded under the mention.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use feedcast_core::text::{format_timestamp, slugify};
use feedcast_core::{now_unix_secs, Event, UnsignedEvent, KIND_TEXT_NOTE};
use feedcast_crypto::EventSigner;
use feedcast_store::DedupStore;
use feedcast_transport::RelayFilter;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::feed::FeedSource;
use crate::publish::Coordinator;
use crate::supervisor::{InboundMessage, Supervisor};

/// Subscription id used for mention tracking on every relay.
pub const MENTIONS_SUBSCRIPTION: &str = "feedcast-mentions";

const IN_FLIGHT_HOLD: Duration = Duration::from_secs(10);
const LATEST_LIMIT: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub command: String,
    pub arg: Option<String>,
}

fn strip_mention(token: &str) -> &str {
    let rest = token.strip_prefix("nostr:").unwrap_or(token);
    let Some(key) = rest.strip_prefix("npub") else {
        return token;
    };
    let body = key
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(key.len());
    if body == 0 {
        return token;
    }
    &key[body..]
}

/// Extracts `!command [arg]` from a note, ignoring `npub…` mentions.
///
/// The command is lower-cased; the argument keeps its case.
pub fn parse_command(content: &str) -> Option<ParsedCommand> {
    let cleaned: Vec<&str> = content
        .split_whitespace()
        .map(strip_mention)
        .filter(|t| !t.is_empty())
        .collect();
    let cleaned = cleaned.join(" ");

    let body = cleaned.strip_prefix('!')?;
    let end = body
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(body.len());
    if end == 0 {
        return None;
    }
    let command = body[..end].to_lowercase();
    let rest = &body[end..];
    let arg = rest
        .starts_with(char::is_whitespace)
        .then(|| rest.trim())
        .filter(|a| !a.is_empty())
        .map(str::to_string);
    Some(ParsedCommand { command, arg })
}

/// NIP-10 reply tags: `e` root (and reply when threaded) followed by the
/// de-duplicated `p` tags of the root author, mentioned keys and the author.
pub fn thread_tags(event: &Event, relay_url: &str) -> Vec<Vec<String>> {
    let tag = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<String>>();
    let e_tags: Vec<&Vec<String>> = event.tags_named("e").collect();
    let p_keys: Vec<&str> = event
        .tags_named("p")
        .filter_map(|t| t.get(1).map(String::as_str))
        .collect();

    let mut tags = Vec::new();
    let mut root_author: Option<&str> = None;
    if e_tags.is_empty() {
        root_author = Some(event.pubkey.as_str());
        tags.push(tag(&["e", event.id.as_str(), relay_url, "root"]));
    } else {
        let root = e_tags
            .iter()
            .find(|t| t.get(3).map(String::as_str) == Some("root"))
            .unwrap_or(&e_tags[0]);
        let root_id = root.get(1).map(String::as_str).unwrap_or_default();
        let root_relay = root.get(2).map(String::as_str).unwrap_or_default();
        tags.push(tag(&["e", root_id, root_relay, "root"]));
        tags.push(tag(&["e", event.id.as_str(), relay_url, "reply"]));
        root_author = p_keys.first().copied().or(root_author);
    }

    let mut seen = HashSet::new();
    let ordered = root_author
        .into_iter()
        .chain(p_keys.iter().copied())
        .chain(std::iter::once(event.pubkey.as_str()))
        .filter(|key| !key.is_empty() && seen.insert(*key));
    for key in ordered {
        tags.push(tag(&["p", key]));
    }
    tags
}

/// Why an inbound event produced no reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ignored {
    OwnEvent,
    AlreadyAnswered,
    InFlight,
    NotACommand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    Ignored(Ignored),
    Replied { relays: usize },
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub bot_name: String,
    pub client_tag: String,
    pub nip05: Option<String>,
    pub feeds: Vec<FeedSource>,
}

pub struct Responder {
    config: ResponderConfig,
    signer: Arc<dyn EventSigner>,
    coordinator: Coordinator,
    store: Arc<Mutex<DedupStore>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Responder {
    pub fn new(
        config: ResponderConfig,
        signer: Arc<dyn EventSigner>,
        coordinator: Coordinator,
        store: Arc<Mutex<DedupStore>>,
    ) -> Self {
        Self {
            config,
            signer,
            coordinator,
            store,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Text notes mentioning the bot, from `since` onward.
    pub fn mention_filter(&self, since: u64) -> RelayFilter {
        RelayFilter {
            kinds: Some(vec![KIND_TEXT_NOTE]),
            mentions: Some(vec![self.signer.public_key_hex()]),
            since: Some(since),
            limit: None,
        }
    }

    /// Opens the mention subscription on every connected relay. Returns how
    /// many relays accepted it.
    pub async fn subscribe_all(&self, supervisor: &Supervisor) -> usize {
        let filter = self.mention_filter(now_unix_secs());
        let mut subscribed = 0;
        for address in supervisor.connected_peers() {
            let Some(transport) = supervisor.transport(&address) else {
                continue;
            };
            match transport.subscribe(MENTIONS_SUBSCRIPTION, &filter).await {
                Ok(()) => {
                    info!(relay = %address, "listening for mentions");
                    subscribed += 1;
                }
                Err(err) => warn!(relay = %address, "failed to subscribe: {err}"),
            }
        }
        subscribed
    }

    /// Handles inbound messages until the channel closes.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundMessage>) {
        while let Some(message) = inbound.recv().await {
            if message.subscription != MENTIONS_SUBSCRIPTION {
                continue;
            }
            let responder = Arc::clone(&self);
            tokio::spawn(async move {
                responder
                    .handle_event(&message.event, &message.relay)
                    .await;
            });
        }
    }

    fn lock_store(&self) -> std::sync::MutexGuard<'_, DedupStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn handle_event(&self, event: &Event, relay_url: &str) -> HandleOutcome {
        if event.pubkey == self.signer.public_key_hex() {
            return HandleOutcome::Ignored(Ignored::OwnEvent);
        }
        if self.lock_store().was_responded(&event.id) {
            return HandleOutcome::Ignored(Ignored::AlreadyAnswered);
        }
        let Some(command) = parse_command(&event.content) else {
            return HandleOutcome::Ignored(Ignored::NotACommand);
        };
        if !self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(event.id.clone())
        {
            debug!(event = %event.short_id(), "skipping duplicate delivery");
            return HandleOutcome::Ignored(Ignored::InFlight);
        }

        info!(
            event = %event.short_id(),
            author = %event.pubkey.get(..8).unwrap_or(&event.pubkey),
            "command received: !{}",
            command.command
        );
        let outcome = self.reply(event, relay_url, &command).await;
        self.release_in_flight(&event.id);
        outcome
    }

    fn release_in_flight(&self, id: &str) {
        let in_flight = Arc::clone(&self.in_flight);
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(IN_FLIGHT_HOLD).await;
            in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
        });
    }

    async fn reply(&self, event: &Event, relay_url: &str, command: &ParsedCommand) -> HandleOutcome {
        let content = self.execute(command);
        let mut unsigned = UnsignedEvent::new(KIND_TEXT_NOTE, content, now_unix_secs());
        unsigned.tags = thread_tags(event, relay_url);
        unsigned.tags.push(vec!["client".to_string(), self.config.client_tag.clone()]);
        if let Some(nip05) = &self.config.nip05 {
            unsigned.tags.push(vec!["nip05".to_string(), nip05.clone()]);
        }
        let reply = match self.signer.sign(unsigned) {
            Ok(reply) => reply,
            Err(err) => {
                error!(event = %event.short_id(), "failed to sign reply: {err}");
                return HandleOutcome::Failed(err.to_string());
            }
        };

        let report = self.coordinator.publish(&reply).await;
        if report.success {
            self.lock_store().add_responded_event(&event.id);
            info!(
                event = %event.short_id(),
                "replied on {} relays",
                report.success_count()
            );
            HandleOutcome::Replied {
                relays: report.success_count(),
            }
        } else {
            error!(event = %event.short_id(), "failed to send reply");
            HandleOutcome::Failed("no relay accepted the reply".to_string())
        }
    }

    /// Builds the reply text for `command`.
    pub fn execute(&self, command: &ParsedCommand) -> String {
        match command.command.as_str() {
            "feeds" => self.feeds_reply(),
            "latest" => self.latest_reply(command.arg.as_deref()),
            "categories" => self.categories_reply(),
            "stats" => self.stats_reply(),
            "help" => self.help_reply(),
            other => format!("Unknown command: !{other}\n\nUse !help to see available commands."),
        }
    }

    fn feeds_reply(&self) -> String {
        let list: Vec<String> = self
            .config
            .feeds
            .iter()
            .map(|f| format!("• {}", f.name))
            .collect();
        format!(
            "Available feeds ({}):\n\n{}",
            self.config.feeds.len(),
            list.join("\n")
        )
    }

    fn latest_reply(&self, arg: Option<&str>) -> String {
        let Some(arg) = arg else {
            return "Please specify a feed name or category.\nExample: !latest bitcoin-magazine"
                .to_string();
        };
        let slug = slugify(arg);
        let feed = self
            .config
            .feeds
            .iter()
            .find(|f| slugify(&f.name) == slug);
        let items = {
            let store = self.lock_store();
            match feed {
                Some(feed) => store.fetch_latest_news(&feed.name, LATEST_LIMIT, true),
                None => store.fetch_latest_news(&slug, LATEST_LIMIT, false),
            }
        };
        if items.is_empty() {
            return format!("No news found for \"{arg}\".\n\nTry !feeds to see available sources.");
        }
        format!("Latest news from \"{arg}\":\n\n{}", items.join("\n\n"))
    }

    fn categories_reply(&self) -> String {
        let mut categories = self.lock_store().get_categories();
        if categories.is_empty() {
            return "No categories found yet.".to_string();
        }
        categories.sort();
        let list: Vec<String> = categories.iter().map(|c| format!("• #{c}")).collect();
        format!(
            "Available categories ({}):\n\n{}",
            categories.len(),
            list.join("\n")
        )
    }

    fn stats_reply(&self) -> String {
        let stats = self.lock_store().get_stats();
        let mut top: Vec<(&String, &u64)> = stats.feed_stats.iter().collect();
        top.sort_by(|a, b| b.1.cmp(a.1));
        let top: Vec<String> = top
            .into_iter()
            .take(5)
            .map(|(feed, count)| format!("• {feed}: {count}"))
            .collect();

        let mut lines = vec![
            format!("{} statistics:\n", self.config.bot_name),
            format!("• Total published: {}", stats.total_published),
            format!("• Total responses: {}", stats.total_responded),
            format!("• Stored items: {}", stats.total_stored),
            format!(
                "• Last run: {}",
                stats
                    .last_run
                    .map(format_timestamp)
                    .unwrap_or_else(|| "never".to_string())
            ),
        ];
        if !top.is_empty() {
            lines.push(format!("\nTop feeds:\n{}", top.join("\n")));
        }
        lines.join("\n")
    }

    fn help_reply(&self) -> String {
        [
            format!("{} commands:\n", self.config.bot_name),
            "• !feeds: list the feeds I follow".to_string(),
            "• !latest <name>: latest 3 items from a feed or category".to_string(),
            "  Example: !latest coindesk".to_string(),
            "• !categories: list available categories".to_string(),
            "• !stats: show bot statistics".to_string(),
            "• !help: show this message".to_string(),
            "\nMention me with a command to interact.".to_string(),
        ]
        .join("\n")
    }
}
