//! Relay subscription management.
//!
//! Wraps the nostr-sdk client: opens concurrent subscriptions against a
//! configurable relay set, forwards every received event and every EOSE
//! marker into the processing channel, and publishes signed events. A relay
//! that never answers surfaces nothing here; the absence of an EOSE marker is
//! treated as "still pending" by the sync engine.

use std::sync::atomic::{AtomicU64, Ordering};

use ::rand::RngCore;
use nostr_sdk::prelude::*;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc::Sender;

use crate::types::ProcessableEvent;

#[derive(Error, Debug)]
pub enum RelayManagerError {
    #[error("Client Error: {0}")]
    Client(#[from] nostr_sdk::client::Error),
    #[error("Signer Error: {0}")]
    Signer(#[from] nostr_sdk::signer::SignerError),
    #[error("Nostr Event error: {0}")]
    NostrEventBuilder(#[from] nostr_sdk::event::builder::Error),
    #[error("Failed to queue event: {0}")]
    FailedToQueueEvent(String),
    #[error("No relays configured")]
    NoRelaysConfigured,
}

pub type Result<T> = std::result::Result<T, RelayManagerError>;

#[derive(Debug, Clone)]
pub struct RelayManager {
    pub(crate) client: Client,
    session_salt: [u8; 16],
    /// Bumped for every new subscription so a resync never reuses a
    /// possibly-completed subscription id.
    generation: std::sync::Arc<AtomicU64>,
}

impl RelayManager {
    /// Create a new relay manager.
    ///
    /// Spawns a background task that forwards relay notifications into
    /// `event_sender`: events as [`ProcessableEvent::NostrEvent`], EOSE
    /// markers as [`ProcessableEvent::EndOfStoredEvents`], everything else as
    /// a logged [`ProcessableEvent::RelayMessage`].
    pub async fn new(event_sender: Sender<ProcessableEvent>) -> Result<Self> {
        let opts = ClientOptions::default();
        let client = Client::builder().opts(opts).build();

        // Random per-session salt for subscription id hashing
        let mut session_salt = [0u8; 16];
        ::rand::rng().fill_bytes(&mut session_salt);

        let client_clone = client.clone();
        let event_sender_clone = event_sender.clone();
        tokio::spawn(async move {
            if let Err(e) = client_clone
                .handle_notifications(move |notification| {
                    let sender = event_sender_clone.clone();
                    async move {
                        match notification {
                            RelayPoolNotification::Message { relay_url, message } => {
                                match message {
                                    RelayMessage::Event {
                                        subscription_id,
                                        event,
                                    } => {
                                        if sender
                                            .send(ProcessableEvent::new_nostr_event(
                                                event.as_ref().clone(),
                                                Some(subscription_id.to_string()),
                                            ))
                                            .await
                                            .is_err()
                                        {
                                            // Channel closed, exit gracefully
                                            tracing::debug!(
                                                target: "backchannel::relays::handle_notifications",
                                                "Event channel closed, exiting notification handler"
                                            );
                                            return Ok(true);
                                        }
                                    }
                                    RelayMessage::EndOfStoredEvents(subscription_id) => {
                                        if sender
                                            .send(ProcessableEvent::EndOfStoredEvents {
                                                subscription_id: subscription_id.to_string(),
                                            })
                                            .await
                                            .is_err()
                                        {
                                            tracing::debug!(
                                                target: "backchannel::relays::handle_notifications",
                                                "Event channel closed, exiting notification handler"
                                            );
                                            return Ok(true);
                                        }
                                    }
                                    _ => {
                                        let message_str = match message {
                                            RelayMessage::Ok { .. } => "Ok".to_string(),
                                            RelayMessage::Notice { .. } => "Notice".to_string(),
                                            RelayMessage::Closed { .. } => "Closed".to_string(),
                                            RelayMessage::Auth { .. } => "Auth".to_string(),
                                            RelayMessage::Count { .. } => "Count".to_string(),
                                            _ => "Unknown".to_string(),
                                        };
                                        if sender
                                            .send(ProcessableEvent::RelayMessage(
                                                relay_url,
                                                message_str,
                                            ))
                                            .await
                                            .is_err()
                                        {
                                            return Ok(true);
                                        }
                                    }
                                }
                                Ok(false)
                            }
                            RelayPoolNotification::Shutdown => {
                                tracing::debug!(
                                    target: "backchannel::relays::handle_notifications",
                                    "Relay pool shutdown"
                                );
                                Ok(true)
                            }
                            _ => Ok(false),
                        }
                    }
                })
                .await
            {
                tracing::error!(
                    target: "backchannel::relays::handle_notifications",
                    "Notification handler error: {:?}",
                    e
                );
            }
        });

        Ok(Self {
            client,
            session_salt,
            generation: std::sync::Arc::new(AtomicU64::new(0)),
        })
    }

    /// Create a short hash from a pubkey for use in subscription IDs.
    /// Salted per session for privacy and collision resistance.
    fn create_pubkey_hash(&self, pubkey: &PublicKey) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.session_salt);
        hasher.update(pubkey.to_bytes());
        let hash = hasher.finalize();
        format!("{:x}", hash)[..12].to_string()
    }

    /// Open a subscription for `filter` on the given relays.
    ///
    /// Every call opens an entirely new subscription (the id embeds a
    /// monotonically increasing generation), so a manual resync never reuses
    /// a subscription that a relay may already consider complete. In-flight
    /// subscriptions are left alone; last write wins on the shared event
    /// store.
    ///
    /// Returns the subscription id so callers can route EOSE markers.
    pub async fn subscribe(
        &self,
        relays: &[RelayUrl],
        author: &PublicKey,
        label: &str,
        filter: Filter,
    ) -> Result<String> {
        if relays.is_empty() {
            return Err(RelayManagerError::NoRelaysConfigured);
        }
        self.ensure_relays_connected(relays).await?;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let id = format!(
            "{}_{}_{}",
            self.create_pubkey_hash(author),
            label,
            generation
        );
        let subscription_id = SubscriptionId::new(id.clone());

        self.client
            .subscribe_with_id_to(relays.to_vec(), subscription_id, filter, None)
            .await?;

        tracing::debug!(
            target: "backchannel::relays::subscribe",
            "Opened subscription {} on {} relays",
            id,
            relays.len()
        );

        Ok(id)
    }

    /// Publishes a signed event to the specified relays.
    ///
    /// Ensures the client is connected to all target relays before
    /// publishing.
    pub async fn publish(&self, event: &Event, relays: &[RelayUrl]) -> Result<Output<EventId>> {
        if relays.is_empty() {
            return Err(RelayManagerError::NoRelaysConfigured);
        }
        self.ensure_relays_connected(relays).await?;
        Ok(self.client.send_event_to(relays.to_vec(), event).await?)
    }

    /// Ensures the client is connected to all the specified relays.
    ///
    /// Individual relay failures are logged but don't fail the call; partial
    /// connectivity is acceptable.
    pub(crate) async fn ensure_relays_connected(&self, relays: &[RelayUrl]) -> Result<()> {
        if relays.is_empty() {
            return Ok(());
        }

        for url in relays {
            if self.client.relay(url.clone()).await.is_ok() {
                continue;
            }
            match self.client.add_relay(url.clone()).await {
                Ok(_) => {
                    tracing::debug!(
                        target: "backchannel::relays::ensure_relays_connected",
                        "Added relay: {}",
                        url
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        target: "backchannel::relays::ensure_relays_connected",
                        "Failed to add relay {}: {}",
                        url,
                        e
                    );
                }
            }
        }

        self.client.connect().await;
        Ok(())
    }

    /// Unset signer state and drop all subscriptions.
    pub async fn shutdown(&self) -> Result<()> {
        self.client.unset_signer().await;
        self.client.unsubscribe_all().await;
        Ok(())
    }
}
