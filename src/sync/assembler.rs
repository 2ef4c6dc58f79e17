//! Conversation reconstruction from decrypted sync events.
//!
//! A conversation is never deserialized from a single event; it is the
//! reduction of every inner event sharing hash-chain linkage. Events arrive
//! in arbitrary order from multiple relays, possibly duplicated, so apply is
//! idempotent per event id and children that arrive before their parent are
//! parked as orphans until the parent shows up.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::sync::codec::InnerConversationEvent;
use crate::types::{MessageContent, MessageRole};

/// One message in an assembled conversation.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub event_id: String,
    /// Parent event id; `None` for a conversation root.
    pub prev_id: Option<String>,
    pub created_at: u64,
    pub role: MessageRole,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    /// Sats paid for this (assistant) message, recorded after a spend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sats_spent: Option<u64>,
}

/// An assembled conversation: id, derived title and messages in insertion
/// order. Use [`Conversation::sorted_messages`] for rendering order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Messages in deterministic rendering order: chain depth first, then
    /// `created_at` ascending, ties broken by event id. Depth ordering keeps
    /// sibling "versions" (messages sharing a prev_id) adjacent and in a
    /// stable order regardless of network delivery order.
    pub fn sorted_messages(&self) -> Vec<&Message> {
        let depths = self.depths();
        let mut ordered: Vec<&Message> = self.messages.iter().collect();
        ordered.sort_by(|a, b| {
            let da = depths.get(a.event_id.as_str()).copied().unwrap_or(0);
            let db = depths.get(b.event_id.as_str()).copied().unwrap_or(0);
            da.cmp(&db)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
        ordered
    }

    fn depths(&self) -> HashMap<&str, usize> {
        let by_id: HashMap<&str, &Message> = self
            .messages
            .iter()
            .map(|m| (m.event_id.as_str(), m))
            .collect();
        let mut depths: HashMap<&str, usize> = HashMap::new();
        for message in &self.messages {
            let mut depth = 0;
            let mut cursor = message.prev_id.as_deref();
            // Chains are short; walking per message is fine
            while let Some(prev) = cursor {
                match by_id.get(prev) {
                    Some(parent) => {
                        depth += 1;
                        cursor = parent.prev_id.as_deref();
                    }
                    None => break,
                }
            }
            depths.insert(message.event_id.as_str(), depth);
        }
        depths
    }
}

const TITLE_MAX_CHARS: usize = 60;

/// Merges decrypted inner events into per-conversation message lists.
#[derive(Debug, Default)]
pub struct ConversationAssembler {
    conversations: HashMap<String, Conversation>,
    /// Event ids already applied. Also retained after deletion so a relay
    /// re-delivering a deleted event cannot resurrect it.
    processed: HashSet<String>,
    /// Known message event ids, for parent lookups across the whole session.
    known_ids: HashSet<String>,
    /// Children waiting for their parent, keyed by the missing prev id.
    orphans: HashMap<String, Vec<(String, InnerConversationEvent)>>,
}

impl ConversationAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one decrypted inner event.
    ///
    /// Idempotent per `event_id`: the processed check and the mark are one
    /// step under `&mut self`, so two relays delivering the same event cannot
    /// double-apply it. Events referencing an unseen parent are retained as
    /// orphans and linked when the parent arrives.
    pub fn apply(&mut self, inner: InnerConversationEvent, event_id: &str) {
        if !self.processed.insert(event_id.to_string()) {
            return;
        }

        if inner.is_root() || self.known_ids.contains(inner.parent_id().unwrap_or_default()) {
            self.link(inner, event_id.to_string());
        } else {
            let parent = inner.parent_id().unwrap_or_default().to_string();
            tracing::debug!(
                target: "backchannel::sync::assembler",
                "Parking orphan {} waiting for parent {}",
                event_id,
                parent
            );
            self.orphans
                .entry(parent)
                .or_default()
                .push((event_id.to_string(), inner));
        }
    }

    /// Insert a message and drain any orphans that were waiting on it,
    /// transitively.
    fn link(&mut self, inner: InnerConversationEvent, event_id: String) {
        let mut queue = vec![(event_id, inner)];
        while let Some((event_id, inner)) = queue.pop() {
            self.insert_message(&inner, &event_id);
            if let Some(children) = self.orphans.remove(&event_id) {
                queue.extend(
                    children
                        .into_iter()
                        .map(|(child_id, child)| (child_id, child)),
                );
            }
        }
    }

    fn insert_message(&mut self, inner: &InnerConversationEvent, event_id: &str) {
        self.known_ids.insert(event_id.to_string());

        let conversation = self
            .conversations
            .entry(inner.conversation_id.clone())
            .or_insert_with(|| Conversation {
                id: inner.conversation_id.clone(),
                ..Default::default()
            });

        conversation.messages.push(Message {
            event_id: event_id.to_string(),
            prev_id: inner.parent_id().map(str::to_string),
            created_at: inner.created_at,
            role: inner.role,
            content: inner.content.clone(),
            model_id: inner.model_id.clone(),
            sats_spent: None,
        });

        if conversation.title.is_empty() && inner.role == MessageRole::User {
            conversation.title = derive_title(&inner.content);
        }
    }

    /// Record the sats spent on a message after a successful payment.
    pub fn record_spend(&mut self, conversation_id: &str, event_id: &str, sats: u64) {
        if let Some(conversation) = self.conversations.get_mut(conversation_id) {
            if let Some(message) = conversation
                .messages
                .iter_mut()
                .find(|m| m.event_id == event_id)
            {
                message.sats_spent = Some(sats);
            }
        }
    }

    pub fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    pub fn conversations(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.values()
    }

    pub fn is_processed(&self, event_id: &str) -> bool {
        self.processed.contains(event_id)
    }

    /// Mark an event id processed without applying anything.
    ///
    /// Used for envelopes that fail to decrypt: re-delivery is expected and
    /// must not trigger endless reprocessing. Returns `false` if the id was
    /// already processed.
    pub fn mark_processed(&mut self, event_id: &str) -> bool {
        self.processed.insert(event_id.to_string())
    }

    /// Remove a conversation, returning the event ids of its messages.
    ///
    /// Processed ids are kept so re-delivered events stay no-ops; pending
    /// orphans of the removed conversation are dropped.
    pub fn remove_conversation(&mut self, id: &str) -> Vec<String> {
        let Some(conversation) = self.conversations.remove(id) else {
            return Vec::new();
        };
        let ids: Vec<String> = conversation
            .messages
            .iter()
            .map(|m| m.event_id.clone())
            .collect();
        for event_id in &ids {
            self.known_ids.remove(event_id);
            self.orphans.remove(event_id);
        }
        self.orphans
            .retain(|_, children| {
                children.retain(|(_, inner)| inner.conversation_id != id);
                !children.is_empty()
            });
        ids
    }
}

fn derive_title(content: &MessageContent) -> String {
    let text = content.as_plain_text();
    let trimmed = text.trim();
    if trimmed.chars().count() <= TITLE_MAX_CHARS {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
        format!("{}…", cut.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ROOT_SENTINEL;

    fn inner(
        conversation_id: &str,
        role: MessageRole,
        prev: Option<&str>,
        created_at: u64,
        text: &str,
    ) -> InnerConversationEvent {
        InnerConversationEvent {
            conversation_id: conversation_id.to_string(),
            role,
            prev_event_id: prev.map(str::to_string),
            created_at,
            model_id: None,
            content: MessageContent::text(text),
        }
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut assembler = ConversationAssembler::new();
        let root = inner("c1", MessageRole::User, Some(ROOT_SENTINEL), 100, "hi");

        assembler.apply(root.clone(), "e1");
        assembler.apply(root, "e1");

        assert_eq!(assembler.conversation("c1").unwrap().messages.len(), 1);
    }

    #[test]
    fn test_order_independence() {
        let root = inner("c1", MessageRole::User, Some(ROOT_SENTINEL), 100, "hi");
        let child = inner("c1", MessageRole::Assistant, Some("e1"), 101, "hello");

        let mut forward = ConversationAssembler::new();
        forward.apply(root.clone(), "e1");
        forward.apply(child.clone(), "e2");

        let mut reverse = ConversationAssembler::new();
        reverse.apply(child, "e2");
        reverse.apply(root, "e1");

        let order = |assembler: &ConversationAssembler| {
            assembler
                .conversation("c1")
                .unwrap()
                .sorted_messages()
                .iter()
                .map(|m| m.event_id.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(order(&forward), vec!["e1", "e2"]);
        assert_eq!(order(&forward), order(&reverse));
    }

    #[test]
    fn test_orphan_is_retained_until_parent_arrives() {
        let mut assembler = ConversationAssembler::new();
        let child = inner("c1", MessageRole::Assistant, Some("e1"), 101, "hello");
        assembler.apply(child, "e2");

        // Parent not yet seen: no conversation materialized, but nothing lost
        assert!(assembler.conversation("c1").is_none());
        assert!(assembler.is_processed("e2"));

        let root = inner("c1", MessageRole::User, Some(ROOT_SENTINEL), 100, "hi");
        assembler.apply(root, "e1");
        assert_eq!(assembler.conversation("c1").unwrap().messages.len(), 2);
    }

    #[test]
    fn test_orphan_chain_relinks_transitively() {
        let mut assembler = ConversationAssembler::new();
        assembler.apply(
            inner("c1", MessageRole::User, Some("e2"), 102, "third"),
            "e3",
        );
        assembler.apply(
            inner("c1", MessageRole::Assistant, Some("e1"), 101, "second"),
            "e2",
        );
        assert!(assembler.conversation("c1").is_none());

        assembler.apply(
            inner("c1", MessageRole::User, Some(ROOT_SENTINEL), 100, "first"),
            "e1",
        );
        assert_eq!(assembler.conversation("c1").unwrap().messages.len(), 3);
    }

    #[test]
    fn test_sibling_versions_sorted_by_created_at_then_id() {
        let mut assembler = ConversationAssembler::new();
        assembler.apply(
            inner("c1", MessageRole::User, Some(ROOT_SENTINEL), 100, "hi"),
            "e1",
        );
        // Two assistant "versions" answering the same parent
        assembler.apply(
            inner("c1", MessageRole::Assistant, Some("e1"), 103, "v2"),
            "a2",
        );
        assembler.apply(
            inner("c1", MessageRole::Assistant, Some("e1"), 102, "v1"),
            "a9",
        );
        // Tie on created_at: id breaks it
        assembler.apply(
            inner("c1", MessageRole::Assistant, Some("e1"), 103, "v3"),
            "a1",
        );

        let order: Vec<&str> = assembler
            .conversation("c1")
            .unwrap()
            .sorted_messages()
            .iter()
            .map(|m| m.event_id.as_str())
            .collect();
        assert_eq!(order, vec!["e1", "a9", "a1", "a2"]);
    }

    #[test]
    fn test_title_from_first_user_message() {
        let mut assembler = ConversationAssembler::new();
        assembler.apply(
            inner(
                "c1",
                MessageRole::User,
                Some(ROOT_SENTINEL),
                100,
                "What is the capital of France?",
            ),
            "e1",
        );
        assert_eq!(
            assembler.conversation("c1").unwrap().title,
            "What is the capital of France?"
        );

        let long = "x".repeat(200);
        let mut other = ConversationAssembler::new();
        other.apply(
            inner("c2", MessageRole::User, Some(ROOT_SENTINEL), 100, &long),
            "e1",
        );
        assert!(other.conversation("c2").unwrap().title.chars().count() <= TITLE_MAX_CHARS + 1);
    }

    #[test]
    fn test_record_spend() {
        let mut assembler = ConversationAssembler::new();
        assembler.apply(
            inner("c1", MessageRole::Assistant, Some(ROOT_SENTINEL), 100, "hi"),
            "e1",
        );
        assembler.record_spend("c1", "e1", 42);
        assert_eq!(
            assembler.conversation("c1").unwrap().messages[0].sats_spent,
            Some(42)
        );
    }

    #[test]
    fn test_remove_conversation_keeps_processed_ids() {
        let mut assembler = ConversationAssembler::new();
        let root = inner("c1", MessageRole::User, Some(ROOT_SENTINEL), 100, "hi");
        assembler.apply(root.clone(), "e1");

        let removed = assembler.remove_conversation("c1");
        assert_eq!(removed, vec!["e1"]);
        assert!(assembler.conversation("c1").is_none());

        // Re-delivery after deletion must not resurrect the message
        assembler.apply(root, "e1");
        assert!(assembler.conversation("c1").is_none());
    }
}
