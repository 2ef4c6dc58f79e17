//! Conversation sync orchestration.
//!
//! Per-session state machine: `Idle → SyncingBootstrap → DerivingKeys →
//! SyncingConversations → Ready`. `Ready` is not terminal; live
//! subscriptions keep delivering events indefinitely, it only means the
//! initial backlog has been processed once. A manual resync re-enters
//! `SyncingConversations` with a fresh subscription and without resetting
//! derived keys; prior subscriptions are left to complete on their own, last
//! write wins on the shared event store.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use nostr_sdk::prelude::*;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::event_store::{EventQuery, EventStore};
use crate::relays::RelayManager;
use crate::types::{
    MessageContent, MessageRole, ProcessableEvent, BOOTSTRAP_KIND, CHAT_SYNC_KIND, ROOT_SENTINEL,
};

pub mod assembler;
pub mod codec;
pub mod deletion;
pub mod keys;

use assembler::{Conversation, ConversationAssembler, Message};
use codec::InnerConversationEvent;
use deletion::DeletionCoordinator;
use keys::KeyDerivationService;

/// How long a publish waits for the canonical sync keypair before falling
/// back to local-only visibility.
const CANONICAL_KEY_WAIT: Duration = Duration::from_secs(5);
const CANONICAL_KEY_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    SyncingBootstrap,
    DerivingKeys,
    SyncingConversations,
    Ready,
}

pub struct SyncEngine {
    identity: Keys,
    relays: Vec<RelayUrl>,
    relay_manager: Arc<RelayManager>,
    store: Arc<EventStore>,
    keys: Arc<KeyDerivationService>,
    assembler: Mutex<ConversationAssembler>,
    phase: RwLock<SyncPhase>,
    bootstrap_subscriptions: Mutex<HashSet<String>>,
    conversation_subscriptions: Mutex<HashSet<String>>,
}

impl SyncEngine {
    pub fn new(
        identity: Keys,
        relays: Vec<RelayUrl>,
        relay_manager: Arc<RelayManager>,
        store: Arc<EventStore>,
    ) -> Self {
        Self {
            identity,
            relays,
            relay_manager,
            store,
            keys: Arc::new(KeyDerivationService::new()),
            assembler: Mutex::new(ConversationAssembler::new()),
            phase: RwLock::new(SyncPhase::Idle),
            bootstrap_subscriptions: Mutex::new(HashSet::new()),
            conversation_subscriptions: Mutex::new(HashSet::new()),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.read().expect("phase lock poisoned")
    }

    fn set_phase(&self, phase: SyncPhase) {
        tracing::debug!(target: "backchannel::sync", "Phase -> {:?}", phase);
        *self.phase.write().expect("phase lock poisoned") = phase;
    }

    /// Begin the initial sync: subscribe to the identity's bootstrap events.
    ///
    /// Returns the bootstrap subscription id.
    pub async fn start(&self) -> Result<String> {
        let filter = Filter::new()
            .kind(BOOTSTRAP_KIND)
            .author(self.identity.public_key());
        let subscription_id = self
            .relay_manager
            .subscribe(&self.relays, &self.identity.public_key(), "bootstrap", filter)
            .await?;
        self.bootstrap_subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .insert(subscription_id.clone());
        self.set_phase(SyncPhase::SyncingBootstrap);
        Ok(subscription_id)
    }

    /// Route one event or marker from the relay channel.
    pub async fn handle_event(&self, event: ProcessableEvent) {
        match event {
            ProcessableEvent::NostrEvent { event, .. } => {
                // Unconditional write; the store dedups by id
                self.store.insert(event.clone());
                self.route_event(&event).await;
            }
            ProcessableEvent::EndOfStoredEvents { subscription_id } => {
                self.handle_eose(&subscription_id).await;
            }
            ProcessableEvent::RelayMessage(relay_url, message) => {
                tracing::debug!(
                    target: "backchannel::sync",
                    "Relay message from {}: {}",
                    relay_url,
                    message
                );
            }
        }
    }

    async fn route_event(&self, event: &Event) {
        if event.kind == BOOTSTRAP_KIND && event.pubkey == self.identity.public_key() {
            // During the initial bootstrap phase the event is only stored;
            // ensure_bootstrap ingests the whole set once EOSE arrives.
            if self.phase() != SyncPhase::SyncingBootstrap {
                if let Some(public_key) = self.keys.ingest(&self.identity, event).await {
                    tracing::info!(
                        target: "backchannel::sync",
                        "New sync keypair {} discovered live",
                        public_key
                    );
                    if let Err(e) = self.subscribe_conversations().await {
                        tracing::warn!(
                            target: "backchannel::sync",
                            "Failed to extend conversation subscription: {}",
                            e
                        );
                    }
                }
            }
        } else if event.kind == CHAT_SYNC_KIND {
            self.process_sync_event(event).await;
        }
    }

    /// Decrypt and apply one conversation envelope.
    ///
    /// Envelopes signed by unknown keys are ignored (they may belong to a
    /// keypair not yet derived); decrypt failures are marked processed so
    /// re-delivery stays cheap.
    async fn process_sync_event(&self, event: &Event) {
        let Some(keypair) = self.keys.get(&event.pubkey) else {
            return;
        };
        let event_id = event.id.to_hex();

        {
            let assembler = self.assembler.lock().expect("assembler lock poisoned");
            if assembler.is_processed(&event_id) {
                return;
            }
        }

        match codec::decrypt_inner(event, &keypair).await {
            Some(inner) => {
                let mut assembler = self.assembler.lock().expect("assembler lock poisoned");
                assembler.apply(inner, &event_id);
            }
            None => {
                let mut assembler = self.assembler.lock().expect("assembler lock poisoned");
                assembler.mark_processed(&event_id);
            }
        }
    }

    /// Handle one EOSE marker.
    ///
    /// Relays each send their own EOSE for the same subscription id, but the
    /// state machine must advance only once per subscription: the id is
    /// consumed on the first marker, later per-relay markers are no-ops.
    /// Otherwise a second relay's bootstrap EOSE would re-run the bootstrap
    /// step (possibly minting a second secret) and open duplicate
    /// conversation subscriptions, and a late conversation EOSE would drag
    /// the phase back out of `Ready` without a manual resync.
    async fn handle_eose(&self, subscription_id: &str) {
        let is_bootstrap = self
            .bootstrap_subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .remove(subscription_id);
        if is_bootstrap {
            if let Err(e) = self.on_bootstrap_eose().await {
                tracing::error!(
                    target: "backchannel::sync",
                    "Bootstrap processing failed: {}",
                    e
                );
            }
            return;
        }

        let is_conversation = self
            .conversation_subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .remove(subscription_id);
        if is_conversation {
            self.set_phase(SyncPhase::Ready);
        }
    }

    async fn on_bootstrap_eose(&self) -> Result<()> {
        self.set_phase(SyncPhase::DerivingKeys);
        self.keys
            .ensure_bootstrap(&self.identity, &self.store, &self.relay_manager, &self.relays)
            .await?;
        self.subscribe_conversations().await?;
        self.set_phase(SyncPhase::SyncingConversations);

        // Envelopes that arrived before the keys were derived are already in
        // the store; replay them now.
        let backlog = self.store.query(
            &EventQuery::new()
                .kind(CHAT_SYNC_KIND)
                .authors(self.keys.public_keys()),
        );
        for event in &backlog {
            self.process_sync_event(event).await;
        }
        Ok(())
    }

    async fn subscribe_conversations(&self) -> Result<String> {
        let authors = self.keys.public_keys();
        let filter = Filter::new().kind(CHAT_SYNC_KIND).authors(authors);
        let subscription_id = self
            .relay_manager
            .subscribe(
                &self.relays,
                &self.identity.public_key(),
                "conversations",
                filter,
            )
            .await?;
        self.conversation_subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .insert(subscription_id.clone());
        Ok(subscription_id)
    }

    /// Manually re-sync conversation events.
    ///
    /// Opens an entirely new subscription without cancelling in-flight ones
    /// and without resetting derived keys; relay subscriptions are not
    /// guaranteed reusable after completion.
    pub async fn resync(&self) -> Result<String> {
        let subscription_id = self.subscribe_conversations().await?;
        self.set_phase(SyncPhase::SyncingConversations);
        Ok(subscription_id)
    }

    /// Wait up to `timeout` for the canonical sync keypair to appear.
    async fn wait_for_canonical(&self, timeout: Duration) -> Option<keys::SyncKeypair> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(keypair) = self.keys.canonical() {
                return Some(keypair);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(CANONICAL_KEY_POLL).await;
        }
    }

    /// Compose and publish a conversation message.
    ///
    /// Waits up to 5 seconds for the canonical sync keypair; on timeout the
    /// message is applied locally only (with a synthetic event id) and will
    /// not replicate. Publish failures are logged, not fatal.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: MessageContent,
        prev_event_id: Option<String>,
        model_id: Option<String>,
    ) -> Result<Message> {
        self.send_message_with_wait(
            conversation_id,
            role,
            content,
            prev_event_id,
            model_id,
            CANONICAL_KEY_WAIT,
        )
        .await
    }

    async fn send_message_with_wait(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: MessageContent,
        prev_event_id: Option<String>,
        model_id: Option<String>,
        wait: Duration,
    ) -> Result<Message> {
        let inner = InnerConversationEvent {
            conversation_id: conversation_id.to_string(),
            role,
            prev_event_id: Some(prev_event_id.unwrap_or_else(|| ROOT_SENTINEL.to_string())),
            created_at: Timestamp::now().as_u64(),
            model_id,
            content,
        };

        let event_id = match self.wait_for_canonical(wait).await {
            Some(keypair) => {
                let outer = codec::encrypt_outer(&inner, &keypair).await?;
                let event_id = outer.id.to_hex();
                self.store.insert(outer.clone());
                match self.relay_manager.publish(&outer, &self.relays).await {
                    Ok(output) => {
                        tracing::debug!(
                            target: "backchannel::sync",
                            "Published message {} to {} relay(s)",
                            output.id(),
                            output.success.len()
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            target: "backchannel::sync",
                            "Failed to publish message: {}",
                            e
                        );
                    }
                }
                event_id
            }
            None => {
                tracing::warn!(
                    target: "backchannel::sync",
                    "No sync keypair available; message is local-only"
                );
                synthetic_event_id(&inner)
            }
        };

        let message = Message {
            event_id: event_id.clone(),
            prev_id: inner.parent_id().map(str::to_string),
            created_at: inner.created_at,
            role: inner.role,
            content: inner.content.clone(),
            model_id: inner.model_id.clone(),
            sats_spent: None,
        };
        {
            let mut assembler = self.assembler.lock().expect("assembler lock poisoned");
            assembler.apply(inner, &event_id);
        }
        Ok(message)
    }

    /// Delete a conversation locally and propagate the deletion to relays.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<Vec<EventId>> {
        match self.keys.canonical() {
            Some(keypair) => {
                let message_ids = {
                    let mut assembler = self.assembler.lock().expect("assembler lock poisoned");
                    assembler.remove_conversation(conversation_id)
                };
                let coordinator = DeletionCoordinator {
                    store: &self.store,
                    relay_manager: &self.relay_manager,
                    relays: &self.relays,
                };
                coordinator
                    .publish_deletion(&keypair, conversation_id, &message_ids)
                    .await
            }
            None => {
                // No signing key: clear local state only
                let ids: Vec<EventId> = {
                    let mut assembler = self.assembler.lock().expect("assembler lock poisoned");
                    assembler
                        .remove_conversation(conversation_id)
                        .iter()
                        .filter_map(|id| EventId::parse(id).ok())
                        .collect()
                };
                self.store.remove_ids(&ids);
                Ok(ids)
            }
        }
    }

    /// Record the sats spent for an assistant message.
    pub fn record_spend(&self, conversation_id: &str, event_id: &str, sats: u64) {
        let mut assembler = self.assembler.lock().expect("assembler lock poisoned");
        assembler.record_spend(conversation_id, event_id, sats);
    }

    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        self.assembler
            .lock()
            .expect("assembler lock poisoned")
            .conversation(id)
            .cloned()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.assembler
            .lock()
            .expect("assembler lock poisoned")
            .conversations()
            .cloned()
            .collect()
    }

    pub fn sync_keys(&self) -> &KeyDerivationService {
        &self.keys
    }

    /// Drop all relay subscriptions and signer state.
    pub async fn shutdown(&self) -> Result<()> {
        self.relay_manager.shutdown().await?;
        Ok(())
    }

    #[cfg(test)]
    fn conversation_subscription_ids(&self) -> Vec<String> {
        self.conversation_subscriptions
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect()
    }
}

/// Synthetic id for a message that never got signed (no sync keypair within
/// the wait budget). Not a valid relay event id on purpose.
fn synthetic_event_id(inner: &InnerConversationEvent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(inner.conversation_id.as_bytes());
    hasher.update(inner.created_at.to_be_bytes());
    hasher.update(inner.content.as_plain_text().as_bytes());
    hasher.update(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos()
            .to_be_bytes(),
    );
    format!("local-{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn test_engine() -> (Arc<SyncEngine>, mpsc::Receiver<ProcessableEvent>) {
        let (sender, receiver) = mpsc::channel(128);
        let relay_manager = Arc::new(RelayManager::new(sender).await.unwrap());
        let store = Arc::new(EventStore::new());
        // Unreachable relay: the pool registers subscriptions without a
        // live connection, which is all these tests need.
        let relays = vec![RelayUrl::parse("ws://127.0.0.1:48998").unwrap()];
        let engine = Arc::new(SyncEngine::new(
            Keys::generate(),
            relays,
            relay_manager,
            store,
        ));
        (engine, receiver)
    }

    #[tokio::test]
    async fn test_bootstrap_eose_derives_keys_and_advances_phase() {
        let (engine, _rx) = test_engine().await;
        assert_eq!(engine.phase(), SyncPhase::Idle);

        let bootstrap_sub = engine.start().await.unwrap();
        assert_eq!(engine.phase(), SyncPhase::SyncingBootstrap);

        engine
            .handle_event(ProcessableEvent::EndOfStoredEvents {
                subscription_id: bootstrap_sub,
            })
            .await;

        // Bootstrap was absent: exactly one event created, keypair derived
        // within the same step.
        assert_eq!(engine.phase(), SyncPhase::SyncingConversations);
        assert_eq!(engine.sync_keys().len(), 1);
        assert!(engine.sync_keys().canonical().is_some());
        assert_eq!(
            engine
                .store
                .query(&EventQuery::new().kind(BOOTSTRAP_KIND))
                .len(),
            1
        );

        let conversation_sub = engine.conversation_subscription_ids().pop().unwrap();
        engine
            .handle_event(ProcessableEvent::EndOfStoredEvents {
                subscription_id: conversation_sub,
            })
            .await;
        assert_eq!(engine.phase(), SyncPhase::Ready);
    }

    #[tokio::test]
    async fn test_repeated_eose_for_same_subscription_is_a_noop() {
        let (engine, _rx) = test_engine().await;
        let bootstrap_sub = engine.start().await.unwrap();
        engine
            .handle_event(ProcessableEvent::EndOfStoredEvents {
                subscription_id: bootstrap_sub.clone(),
            })
            .await;
        let conversation_sub = engine.conversation_subscription_ids().pop().unwrap();
        engine
            .handle_event(ProcessableEvent::EndOfStoredEvents {
                subscription_id: conversation_sub.clone(),
            })
            .await;
        assert_eq!(engine.phase(), SyncPhase::Ready);
        let subs_before = engine.conversation_subscription_ids().len();

        // A second relay reports EOSE for the same subscriptions: no extra
        // bootstrap run, no duplicate subscription, no phase regression
        engine
            .handle_event(ProcessableEvent::EndOfStoredEvents {
                subscription_id: bootstrap_sub,
            })
            .await;
        engine
            .handle_event(ProcessableEvent::EndOfStoredEvents {
                subscription_id: conversation_sub,
            })
            .await;

        assert_eq!(engine.phase(), SyncPhase::Ready);
        assert_eq!(engine.conversation_subscription_ids().len(), subs_before);
        assert_eq!(engine.sync_keys().len(), 1);
        assert_eq!(
            engine
                .store
                .query(&EventQuery::new().kind(BOOTSTRAP_KIND))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_send_message_publishes_and_applies() {
        let (engine, _rx) = test_engine().await;
        let bootstrap_sub = engine.start().await.unwrap();
        engine
            .handle_event(ProcessableEvent::EndOfStoredEvents {
                subscription_id: bootstrap_sub,
            })
            .await;

        let message = engine
            .send_message(
                "conv-1",
                MessageRole::User,
                MessageContent::text("hello"),
                None,
                None,
            )
            .await
            .unwrap();

        assert!(message.prev_id.is_none());
        let conversation = engine.conversation("conv-1").unwrap();
        assert_eq!(conversation.messages.len(), 1);
        // The envelope landed in the store under the derived key
        let envelopes = engine.store.query(
            &EventQuery::new()
                .kind(CHAT_SYNC_KIND)
                .authors(engine.sync_keys().public_keys()),
        );
        assert_eq!(envelopes.len(), 1);
    }

    #[tokio::test]
    async fn test_send_message_without_keypair_is_local_only() {
        let (engine, _rx) = test_engine().await;

        let message = engine
            .send_message_with_wait(
                "conv-1",
                MessageRole::User,
                MessageContent::text("offline"),
                None,
                None,
                Duration::from_millis(10),
            )
            .await
            .unwrap();

        assert!(message.event_id.starts_with("local-"));
        assert_eq!(engine.conversation("conv-1").unwrap().messages.len(), 1);
        assert!(engine
            .store
            .query(&EventQuery::new().kind(CHAT_SYNC_KIND))
            .is_empty());
    }

    #[tokio::test]
    async fn test_incoming_envelope_roundtrip_and_dedup() {
        let (engine, _rx) = test_engine().await;
        let bootstrap_sub = engine.start().await.unwrap();
        engine
            .handle_event(ProcessableEvent::EndOfStoredEvents {
                subscription_id: bootstrap_sub,
            })
            .await;

        let keypair = engine.sync_keys().canonical().unwrap();
        let inner = InnerConversationEvent {
            conversation_id: "conv-9".to_string(),
            role: MessageRole::Assistant,
            prev_event_id: Some(ROOT_SENTINEL.to_string()),
            created_at: 123,
            model_id: Some("test-model".to_string()),
            content: MessageContent::text("reply"),
        };
        let outer = codec::encrypt_outer(&inner, &keypair).await.unwrap();

        // Two relays deliver the same event
        engine
            .handle_event(ProcessableEvent::new_nostr_event(outer.clone(), None))
            .await;
        engine
            .handle_event(ProcessableEvent::new_nostr_event(outer, None))
            .await;

        let conversation = engine.conversation("conv-9").unwrap();
        assert_eq!(conversation.messages.len(), 1);
        assert_eq!(conversation.messages[0].model_id.as_deref(), Some("test-model"));
    }

    #[tokio::test]
    async fn test_backlog_envelopes_are_replayed_after_key_derivation() {
        let (engine, _rx) = test_engine().await;
        let bootstrap_sub = engine.start().await.unwrap();

        // Pre-derive what the canonical keypair will be by bootstrapping a
        // sibling engine over the same store.
        let sibling = KeyDerivationService::new();
        sibling
            .ensure_bootstrap(
                &engine.identity,
                &engine.store,
                &engine.relay_manager,
                &[],
            )
            .await
            .unwrap();
        let keypair = sibling.canonical().unwrap();

        // Envelope arrives before our engine has derived any key
        let inner = InnerConversationEvent {
            conversation_id: "early".to_string(),
            role: MessageRole::User,
            prev_event_id: None,
            created_at: 50,
            model_id: None,
            content: MessageContent::text("early bird"),
        };
        let outer = codec::encrypt_outer(&inner, &keypair).await.unwrap();
        engine
            .handle_event(ProcessableEvent::new_nostr_event(outer, None))
            .await;
        assert!(engine.conversation("early").is_none());

        // EOSE: keys derived from the store's bootstrap event, backlog replayed
        engine
            .handle_event(ProcessableEvent::EndOfStoredEvents {
                subscription_id: bootstrap_sub,
            })
            .await;
        assert_eq!(engine.conversation("early").unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn test_resync_opens_fresh_subscription_and_keeps_keys() {
        let (engine, _rx) = test_engine().await;
        let bootstrap_sub = engine.start().await.unwrap();
        engine
            .handle_event(ProcessableEvent::EndOfStoredEvents {
                subscription_id: bootstrap_sub.clone(),
            })
            .await;
        let first_subs = engine.conversation_subscription_ids();
        let keys_before = engine.sync_keys().public_keys();

        let resync_sub = engine.resync().await.unwrap();
        assert!(!first_subs.contains(&resync_sub));
        assert_eq!(engine.phase(), SyncPhase::SyncingConversations);
        assert_eq!(engine.sync_keys().public_keys(), keys_before);

        engine
            .handle_event(ProcessableEvent::EndOfStoredEvents {
                subscription_id: resync_sub,
            })
            .await;
        assert_eq!(engine.phase(), SyncPhase::Ready);
    }

    #[tokio::test]
    async fn test_delete_conversation_clears_store_and_model() {
        let (engine, _rx) = test_engine().await;
        let bootstrap_sub = engine.start().await.unwrap();
        engine
            .handle_event(ProcessableEvent::EndOfStoredEvents {
                subscription_id: bootstrap_sub,
            })
            .await;

        let root = engine
            .send_message(
                "conv-1",
                MessageRole::User,
                MessageContent::text("hi"),
                None,
                None,
            )
            .await
            .unwrap();
        engine
            .send_message(
                "conv-1",
                MessageRole::Assistant,
                MessageContent::text("hello"),
                Some(root.event_id.clone()),
                Some("test-model".to_string()),
            )
            .await
            .unwrap();

        let deleted = engine.delete_conversation("conv-1").await.unwrap();
        assert_eq!(deleted.len(), 2);
        assert!(engine.conversation("conv-1").is_none());
        assert!(engine
            .store
            .query(&EventQuery::new().kind(CHAT_SYNC_KIND))
            .is_empty());
    }
}
