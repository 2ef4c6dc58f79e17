//! Inner conversation event codec.
//!
//! Conversation events never travel in the clear: the inner JSON payload is
//! NIP-44 encrypted under a sync keypair and wrapped in an outer envelope
//! event of [`CHAT_SYNC_KIND`]. NIP-44 uses a fresh nonce per encryption, so
//! publishing logically identical content twice yields distinct ciphertexts
//! and therefore distinct event ids; relays dedup by id, and a resent message
//! must never collide with the original.

use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::sync::keys::SyncKeypair;
use crate::types::{MessageContent, MessageRole, CHAT_SYNC_KIND, ROOT_SENTINEL};

/// The decrypted payload of a conversation-sync envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InnerConversationEvent {
    pub conversation_id: String,
    pub role: MessageRole,
    /// Hash-chain parent, or the all-zero sentinel / absent for a root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_event_id: Option<String>,
    /// Unix seconds.
    pub created_at: u64,
    /// Present on assistant messages only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub content: MessageContent,
}

impl InnerConversationEvent {
    /// Whether this event starts a conversation.
    pub fn is_root(&self) -> bool {
        match self.prev_event_id.as_deref() {
            None => true,
            Some(prev) => prev == ROOT_SENTINEL,
        }
    }

    /// The parent event id, unless this is a root.
    pub fn parent_id(&self) -> Option<&str> {
        self.prev_event_id
            .as_deref()
            .filter(|prev| *prev != ROOT_SENTINEL)
    }
}

/// Encrypt an inner event into a signed outer envelope.
///
/// The envelope is signed by the sync keypair and carries the conversation id
/// as a `d` tag so relays can serve per-conversation filters.
pub async fn encrypt_outer(inner: &InnerConversationEvent, keypair: &SyncKeypair) -> Result<Event> {
    let plaintext = serde_json::to_string(inner)?;
    let ciphertext = keypair
        .keys
        .nip44_encrypt(&keypair.public_key(), &plaintext)
        .await?;

    let event = EventBuilder::new(CHAT_SYNC_KIND, ciphertext)
        .tags([Tag::custom(
            TagKind::d(),
            [inner.conversation_id.clone()],
        )])
        .sign(&keypair.keys)
        .await?;

    Ok(event)
}

/// Decrypt the inner event out of an outer envelope.
///
/// Returns `None` on any decryption or parse failure (wrong key, corrupted
/// MAC, malformed payload). The caller must still mark the envelope as
/// processed so it is never reprocessed.
pub async fn decrypt_inner(outer: &Event, keypair: &SyncKeypair) -> Option<InnerConversationEvent> {
    let plaintext = match keypair
        .keys
        .nip44_decrypt(&keypair.public_key(), &outer.content)
        .await
    {
        Ok(plaintext) => plaintext,
        Err(e) => {
            tracing::debug!(
                target: "backchannel::sync::codec",
                "Failed to decrypt envelope {}: {}",
                outer.id,
                e
            );
            return None;
        }
    };

    match serde_json::from_str(&plaintext) {
        Ok(inner) => Some(inner),
        Err(e) => {
            tracing::debug!(
                target: "backchannel::sync::codec",
                "Malformed inner payload in envelope {}: {}",
                outer.id,
                e
            );
            None
        }
    }
}
