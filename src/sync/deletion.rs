//! Deletion propagation for conversations.
//!
//! Deleting a conversation publishes one NIP-09 deletion request referencing
//! every event of that conversation, then clears local state. Publishing is
//! best-effort: an unreachable relay must not keep the conversation alive
//! locally.

use nostr_sdk::prelude::*;

use crate::error::Result;
use crate::event_store::EventStore;
use crate::relays::RelayManager;
use crate::sync::assembler::ConversationAssembler;
use crate::sync::keys::SyncKeypair;

pub struct DeletionCoordinator<'a> {
    pub store: &'a EventStore,
    pub relay_manager: &'a RelayManager,
    pub relays: &'a [RelayUrl],
}

impl<'a> DeletionCoordinator<'a> {
    /// Delete a conversation: publish a deletion envelope for all of its
    /// event ids, remove them from the event store and drop the assembled
    /// conversation. Events of other conversations are untouched.
    ///
    /// Returns the deleted event ids (empty if the conversation is unknown).
    pub async fn delete_conversation(
        &self,
        assembler: &mut ConversationAssembler,
        keypair: &SyncKeypair,
        conversation_id: &str,
    ) -> Result<Vec<EventId>> {
        let message_ids = assembler.remove_conversation(conversation_id);
        self.publish_deletion(keypair, conversation_id, &message_ids)
            .await
    }

    /// Publish the deletion request for already-removed message ids and drop
    /// them from the event store.
    pub async fn publish_deletion(
        &self,
        keypair: &SyncKeypair,
        conversation_id: &str,
        message_ids: &[String],
    ) -> Result<Vec<EventId>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }

        let event_ids: Vec<EventId> = message_ids
            .iter()
            .filter_map(|id| EventId::parse(id).ok())
            .collect();

        // Locally-only messages (never published) have synthetic ids that do
        // not parse; there is nothing to delete for them on relays.
        if !event_ids.is_empty() {
            let mut request = EventDeletionRequest::new();
            for id in &event_ids {
                request = request.id(*id);
            }
            let event = EventBuilder::delete(request).sign(&keypair.keys).await?;

            match self.relay_manager.publish(&event, self.relays).await {
                Ok(output) => {
                    tracing::debug!(
                        target: "backchannel::sync::deletion",
                        "Published deletion of {} event(s) for conversation {} to {} relay(s)",
                        event_ids.len(),
                        conversation_id,
                        output.success.len()
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        target: "backchannel::sync::deletion",
                        "Failed to publish deletion for conversation {}: {}",
                        conversation_id,
                        e
                    );
                }
            }

            self.store.remove_ids(&event_ids);
        }

        Ok(event_ids)
    }
}
