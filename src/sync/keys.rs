//! Sync keypair bootstrap and derivation.
//!
//! The conversation history is encrypted under a secondary "sync" keypair
//! derived from a self-custodied bootstrap secret, decoupling it from the
//! user's primary identity key. The secret travels between devices inside a
//! bootstrap event whose content is NIP-44 encrypted to the user's own
//! public key, so only the user can ever read it back.

use dashmap::DashMap;
use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BackchannelError, Result};
use crate::event_store::{EventQuery, EventStore};
use crate::relays::RelayManager;
use crate::types::BOOTSTRAP_KIND;

/// Salt of the canonical sync keypair.
///
/// Freshly generated bootstrap secrets carry an empty salt, and the keypair
/// derived with this salt is the one preferred for new publications. Other
/// salts may appear after key rotation.
pub const CANONICAL_SALT: &str = "";

/// Decrypted content of a bootstrap event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapSecretPayload {
    /// Hex-encoded secret key material.
    pub secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
}

/// A derived secondary keypair used to sign and encrypt sync events.
#[derive(Debug, Clone)]
pub struct SyncKeypair {
    pub keys: Keys,
    pub salt: String,
}

impl SyncKeypair {
    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn is_canonical(&self) -> bool {
        self.salt == CANONICAL_SALT
    }
}

/// Accumulates sync keypairs discovered from bootstrap events.
///
/// Keys are held in memory only and never removed within a session; the map
/// can always be rebuilt from the bootstrap events in the [`EventStore`].
#[derive(Debug, Default)]
pub struct KeyDerivationService {
    keypairs: DashMap<PublicKey, SyncKeypair>,
}

impl KeyDerivationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministically derive a sync keypair from (secret, salt).
    ///
    /// Pure function: the same inputs always yield the same key material, so
    /// the canonical salt reproduces identical keys across sessions and
    /// devices without further coordination.
    pub fn derive(secret_hex: &str, salt: &str) -> Result<SyncKeypair> {
        let secret_bytes = hex::decode(secret_hex)
            .map_err(|e| BackchannelError::Configuration(format!("invalid secret hex: {}", e)))?;

        // Hash down to a valid secp256k1 scalar. A digest outside the curve
        // order is astronomically unlikely but not impossible, so re-hash
        // with a counter until one is accepted.
        let mut counter: u8 = 0;
        loop {
            let mut hasher = Sha256::new();
            hasher.update(&secret_bytes);
            hasher.update(salt.as_bytes());
            if counter > 0 {
                hasher.update([counter]);
            }
            let digest = hasher.finalize();
            if let Ok(secret_key) = SecretKey::from_slice(&digest) {
                return Ok(SyncKeypair {
                    keys: Keys::new(secret_key),
                    salt: salt.to_string(),
                });
            }
            counter = counter.checked_add(1).ok_or_else(|| {
                BackchannelError::Configuration("key derivation exhausted".to_string())
            })?;
        }
    }

    /// Number of discovered keypairs.
    pub fn len(&self) -> usize {
        self.keypairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypairs.is_empty()
    }

    /// All derived public keys, used to filter conversation subscriptions.
    pub fn public_keys(&self) -> Vec<PublicKey> {
        self.keypairs.iter().map(|entry| *entry.key()).collect()
    }

    pub fn get(&self, public_key: &PublicKey) -> Option<SyncKeypair> {
        self.keypairs.get(public_key).map(|entry| entry.clone())
    }

    /// The keypair derived with [`CANONICAL_SALT`], preferred for new
    /// publications.
    ///
    /// Two devices bootstrapping concurrently can each mint an empty-salt
    /// keypair; ties break on the lowest derived public key so every device
    /// converges on the same choice instead of following map iteration
    /// order.
    pub fn canonical(&self) -> Option<SyncKeypair> {
        self.keypairs
            .iter()
            .filter(|entry| entry.is_canonical())
            .min_by_key(|entry| entry.public_key().to_bytes())
            .map(|entry| entry.clone())
    }

    /// Decrypt one bootstrap event and accumulate the derived keypair.
    ///
    /// Malformed or foreign payloads are dropped silently so they never block
    /// the rest of the set; the caller must not retry the same event.
    pub async fn ingest(&self, identity: &Keys, event: &Event) -> Option<PublicKey> {
        let plaintext = match identity
            .nip44_decrypt(&identity.public_key(), &event.content)
            .await
        {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::debug!(
                    target: "backchannel::sync::keys",
                    "Dropping undecryptable bootstrap event {}: {}",
                    event.id,
                    e
                );
                return None;
            }
        };

        let payload: BootstrapSecretPayload = match serde_json::from_str(&plaintext) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!(
                    target: "backchannel::sync::keys",
                    "Dropping malformed bootstrap payload in event {}: {}",
                    event.id,
                    e
                );
                return None;
            }
        };

        let salt = payload.salt.unwrap_or_default();
        let keypair = match Self::derive(&payload.secret, &salt) {
            Ok(keypair) => keypair,
            Err(e) => {
                tracing::debug!(
                    target: "backchannel::sync::keys",
                    "Dropping underivable bootstrap payload in event {}: {}",
                    event.id,
                    e
                );
                return None;
            }
        };

        let public_key = keypair.public_key();
        self.keypairs.insert(public_key, keypair);
        Some(public_key)
    }

    /// Ensure a bootstrap event exists, creating and publishing one if not.
    ///
    /// Called once the bootstrap subscription reaches EOSE. If the store has
    /// no bootstrap events for the identity, a fresh secret is generated,
    /// self-encrypted, signed, published to all configured relays and added
    /// to the store; the sync keypair is derived in the same step. Publish
    /// failures are logged, not fatal: the local keypair still works and the
    /// event can be re-synced later.
    pub async fn ensure_bootstrap(
        &self,
        identity: &Keys,
        store: &EventStore,
        relay_manager: &RelayManager,
        relays: &[RelayUrl],
    ) -> Result<()> {
        let existing = store.query(
            &EventQuery::new()
                .kind(BOOTSTRAP_KIND)
                .author(identity.public_key()),
        );

        if !existing.is_empty() {
            for event in &existing {
                self.ingest(identity, event).await;
            }
            tracing::debug!(
                target: "backchannel::sync::keys",
                "Derived {} sync keypair(s) from {} bootstrap event(s)",
                self.len(),
                existing.len()
            );
            return Ok(());
        }

        tracing::info!(
            target: "backchannel::sync::keys",
            "No bootstrap event found, creating one"
        );

        let secret = SecretKey::generate();
        let payload = BootstrapSecretPayload {
            secret: secret.to_secret_hex(),
            salt: None,
        };
        let plaintext = serde_json::to_string(&payload)?;
        let ciphertext = identity
            .nip44_encrypt(&identity.public_key(), &plaintext)
            .await?;

        let event = EventBuilder::new(BOOTSTRAP_KIND, ciphertext)
            .sign(identity)
            .await?;

        match relay_manager.publish(&event, relays).await {
            Ok(output) => {
                tracing::debug!(
                    target: "backchannel::sync::keys",
                    "Published bootstrap event {} to {} relay(s)",
                    output.id(),
                    output.success.len()
                );
            }
            Err(e) => {
                tracing::warn!(
                    target: "backchannel::sync::keys",
                    "Failed to publish bootstrap event: {}",
                    e
                );
            }
        }

        store.insert(event);

        let keypair = Self::derive(&payload.secret, CANONICAL_SALT)?;
        self.keypairs.insert(keypair.public_key(), keypair);

        Ok(())
    }
}
