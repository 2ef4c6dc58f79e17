use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

/// Kind of the self-encrypted bootstrap event carrying the sync secret.
pub const BOOTSTRAP_KIND: Kind = Kind::Custom(10477);

/// Kind of the outer envelope event that carries an encrypted conversation event.
pub const CHAT_SYNC_KIND: Kind = Kind::Custom(1477);

/// Sentinel prevEventId marking a conversation root.
pub const ROOT_SENTINEL: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Events that can be processed by the Backchannel event processing loop.
#[derive(Debug)]
pub enum ProcessableEvent {
    /// A Nostr event with the subscription ID it arrived on.
    NostrEvent {
        event: Event,
        subscription_id: Option<String>,
    },
    /// End-of-stored-events marker for a subscription.
    EndOfStoredEvents { subscription_id: String },
    /// Any other relay message, kept for logging/monitoring.
    RelayMessage(RelayUrl, String),
}

impl ProcessableEvent {
    pub fn new_nostr_event(event: Event, subscription_id: Option<String>) -> Self {
        Self::NostrEvent {
            event,
            subscription_id,
        }
    }
}

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// A single part of structured message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Message content is either a plain string or a list of typed parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Plain-text rendering used for conversation titles.
    pub fn as_plain_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_role_serde() {
        assert_eq!(
            serde_json::to_string(&MessageRole::Assistant).unwrap(),
            "\"assistant\""
        );
        let role: MessageRole = serde_json::from_str("\"user\"").unwrap();
        assert_eq!(role, MessageRole::User);
    }

    #[test]
    fn test_message_content_untagged() {
        let plain: MessageContent = serde_json::from_str("\"hello\"").unwrap();
        assert_eq!(plain, MessageContent::Text("hello".to_string()));

        let parts: MessageContent = serde_json::from_str(
            r#"[{"type":"text","text":"describe this"},{"type":"image_url","url":"https://example.com/a.png"}]"#,
        )
        .unwrap();
        match &parts {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 2);
                assert_eq!(parts[0].kind, "text");
                assert_eq!(parts[1].url.as_deref(), Some("https://example.com/a.png"));
            }
            _ => panic!("expected structured content"),
        }
        assert_eq!(parts.as_plain_text(), "describe this");
    }

    #[test]
    fn test_root_sentinel_is_64_hex_zeros() {
        assert_eq!(ROOT_SENTINEL.len(), 64);
        assert!(ROOT_SENTINEL.chars().all(|c| c == '0'));
    }
}
