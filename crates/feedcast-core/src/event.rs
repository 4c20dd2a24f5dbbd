//! Broadcast message model (NIP-01 event layout).

use serde::{Deserialize, Serialize};

/// Profile metadata event kind.
pub const KIND_METADATA: u32 = 0;
/// Short text note event kind.
pub const KIND_TEXT_NOTE: u32 = 1;

/// Event content and tags before an id and signature are attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    pub fn new(kind: u32, content: impl Into<String>, created_at: u64) -> Self {
        Self {
            created_at,
            kind,
            tags: Vec::new(),
            content: content.into(),
        }
    }

    pub fn with_tag<I, S>(mut self, tag: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.push(tag.into_iter().map(Into::into).collect());
        self
    }

    /// Canonical serialization hashed into the event id:
    /// `[0, pubkey, created_at, kind, tags, content]`.
    pub fn id_preimage(&self, pubkey_hex: &str) -> String {
        serde_json::json!([
            0,
            pubkey_hex,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ])
        .to_string()
    }
}

/// A signed event as exchanged with relays. Opaque to the publish path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Tags whose first element equals `name`.
    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Vec<String>> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
    }

    /// Short id prefix for log lines.
    pub fn short_id(&self) -> &str {
        self.id.get(..8).unwrap_or(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preimage_matches_nip01_layout() {
        let unsigned = UnsignedEvent::new(KIND_TEXT_NOTE, "hi \"there\"", 1_700_000_000)
            .with_tag(["t", "news"]);
        assert_eq!(
            unsigned.id_preimage("ab"),
            r#"[0,"ab",1700000000,1,[["t","news"]],"hi \"there\""]"#
        );
    }

    #[test]
    fn filters_tags_by_name() {
        let event = Event {
            id: "0123456789abcdef".to_string(),
            pubkey: "pk".to_string(),
            created_at: 1,
            kind: KIND_TEXT_NOTE,
            tags: vec![
                vec!["e".to_string(), "root".to_string()],
                vec!["p".to_string(), "alice".to_string()],
                vec!["e".to_string(), "reply".to_string()],
            ],
            content: String::new(),
            sig: String::new(),
        };
        assert_eq!(event.tags_named("e").count(), 2);
        assert_eq!(event.tags_named("p").count(), 1);
        assert_eq!(event.short_id(), "01234567");
    }
}
