//! Pending token cache and refund reconciliation.
//!
//! A spend issues a token before the recipient consumes it; until then the
//! token is "pending" value that still belongs to the user. At most one live
//! token exists per recipient. The cache is write-through to sqlite so
//! pending value survives restarts.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use sqlx::Row;
use tokio::sync::Mutex;

use crate::database::Database;

use super::wallet::{MintClient, WalletBackend};
use super::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingToken {
    pub recipient_base_url: String,
    pub token: String,
    /// Sats.
    pub amount: u64,
    pub mint_url: String,
}

/// Outcome of a refund attempt. Refund failure is non-fatal for balance
/// aggregation, but callers must confirm it explicitly before discarding
/// anything tied to the token.
#[derive(Debug, Clone)]
pub struct RefundOutcome {
    pub success: bool,
    pub message: String,
}

#[derive(Debug)]
pub struct PendingTokenStore {
    database: Database,
    cache: DashMap<String, PendingToken>,
    /// One writer in flight per recipient; a second spend for the same
    /// recipient queues here instead of racing.
    recipient_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PendingTokenStore {
    /// Load the persisted pending set into the cache.
    pub async fn load(database: Database) -> Result<Self> {
        let rows = sqlx::query(
            "SELECT recipient_base_url, token, amount, mint_url FROM pending_tokens",
        )
        .fetch_all(&database.pool)
        .await?;

        let cache = DashMap::new();
        for row in rows {
            let pending = PendingToken {
                recipient_base_url: row.get("recipient_base_url"),
                token: row.get("token"),
                amount: row.get::<i64, _>("amount") as u64,
                mint_url: row.get("mint_url"),
            };
            cache.insert(pending.recipient_base_url.clone(), pending);
        }

        Ok(Self {
            database,
            cache,
            recipient_locks: DashMap::new(),
        })
    }

    /// The per-recipient writer lock. Hold it across a whole spend attempt.
    pub fn recipient_lock(&self, recipient_base_url: &str) -> Arc<Mutex<()>> {
        self.recipient_locks
            .entry(recipient_base_url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn get(&self, recipient_base_url: &str) -> Option<PendingToken> {
        self.cache
            .get(recipient_base_url)
            .map(|entry| entry.clone())
    }

    pub fn all(&self) -> Vec<PendingToken> {
        self.cache.iter().map(|entry| entry.clone()).collect()
    }

    /// Pending value across all recipients, in sats.
    pub fn total_sats(&self) -> u64 {
        self.cache.iter().map(|entry| entry.amount).sum()
    }

    pub async fn set(&self, pending: PendingToken) -> Result<()> {
        sqlx::query(
            "INSERT INTO pending_tokens (recipient_base_url, token, amount, mint_url, created_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(recipient_base_url) DO UPDATE SET \
             token = excluded.token, amount = excluded.amount, \
             mint_url = excluded.mint_url, created_at = excluded.created_at",
        )
        .bind(&pending.recipient_base_url)
        .bind(&pending.token)
        .bind(pending.amount as i64)
        .bind(&pending.mint_url)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.database.pool)
        .await?;

        self.cache
            .insert(pending.recipient_base_url.clone(), pending);
        Ok(())
    }

    pub async fn clear(&self, recipient_base_url: &str) -> Result<()> {
        sqlx::query("DELETE FROM pending_tokens WHERE recipient_base_url = ?")
            .bind(recipient_base_url)
            .execute(&self.database.pool)
            .await?;
        self.cache.remove(recipient_base_url);
        Ok(())
    }

    /// Reclaim a recipient's pending token back into the wallet.
    ///
    /// On success the entry is cleared; on failure the entry stays so the
    /// value is never silently dropped. Works identically for both wallet
    /// modes.
    pub async fn refund(
        &self,
        client: &dyn MintClient,
        wallet: &mut WalletBackend,
        recipient_base_url: &str,
    ) -> RefundOutcome {
        let Some(pending) = self.get(recipient_base_url) else {
            return RefundOutcome {
                success: true,
                message: "No pending token to refund".to_string(),
            };
        };

        match wallet.receive(client, &pending.token).await {
            Ok(amount) => {
                if let Err(e) = self.clear(recipient_base_url).await {
                    tracing::warn!(
                        target: "backchannel::payments::pending",
                        "Refunded token but failed to clear pending entry for {}: {}",
                        recipient_base_url,
                        e
                    );
                }
                RefundOutcome {
                    success: true,
                    message: format!("Refunded {} sats", amount),
                }
            }
            Err(e) => {
                tracing::warn!(
                    target: "backchannel::payments::pending",
                    "Refund failed for {}: {}",
                    recipient_base_url,
                    e
                );
                RefundOutcome {
                    success: false,
                    message: format!("Refund failed: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::test_support::{proof, MockMint};
    use crate::payments::wallet::encode_token_v3;
    use tempfile::TempDir;

    async fn test_store() -> (PendingTokenStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let database = Database::new(dir.path().join("backchannel.sqlite"))
            .await
            .unwrap();
        (PendingTokenStore::load(database).await.unwrap(), dir)
    }

    fn pending(recipient: &str, amount: u64) -> PendingToken {
        PendingToken {
            recipient_base_url: recipient.to_string(),
            token: encode_token_v3(
                "https://mint.a/",
                "sat",
                &[proof("https://mint.a/", amount, "pend")],
            ),
            amount,
            mint_url: "https://mint.a/".to_string(),
        }
    }

    #[tokio::test]
    async fn test_set_get_clear() {
        let (store, _dir) = test_store().await;

        store.set(pending("https://api.x/", 150)).await.unwrap();
        assert_eq!(store.get("https://api.x/").unwrap().amount, 150);
        assert_eq!(store.total_sats(), 150);

        // Superseding replaces rather than accumulating
        store.set(pending("https://api.x/", 80)).await.unwrap();
        assert_eq!(store.total_sats(), 80);

        store.clear("https://api.x/").await.unwrap();
        assert!(store.get("https://api.x/").is_none());
    }

    #[tokio::test]
    async fn test_pending_tokens_survive_reload() {
        let dir = TempDir::new().unwrap();
        let database = Database::new(dir.path().join("backchannel.sqlite"))
            .await
            .unwrap();

        let store = PendingTokenStore::load(database.clone()).await.unwrap();
        store.set(pending("https://api.x/", 42)).await.unwrap();
        drop(store);

        let reloaded = PendingTokenStore::load(database).await.unwrap();
        assert_eq!(reloaded.get("https://api.x/").unwrap().amount, 42);
    }

    #[tokio::test]
    async fn test_refund_returns_value_and_clears_entry() {
        let (store, _dir) = test_store().await;
        let mint = MockMint::new();
        let mut wallet = WalletBackend::MultiMint { proofs: vec![] };

        store.set(pending("https://api.x/", 150)).await.unwrap();
        let outcome = store.refund(&mint, &mut wallet, "https://api.x/").await;

        assert!(outcome.success);
        assert!(store.get("https://api.x/").is_none());
        let total: u64 = wallet.all_proofs().iter().map(|p| p.amount).sum();
        assert_eq!(total, 150);
    }

    #[tokio::test]
    async fn test_failed_refund_keeps_entry() {
        let (store, _dir) = test_store().await;
        let mint = MockMint::new();
        mint.fail_redeems();
        let mut wallet = WalletBackend::MultiMint { proofs: vec![] };

        store.set(pending("https://api.x/", 150)).await.unwrap();
        let outcome = store.refund(&mint, &mut wallet, "https://api.x/").await;

        assert!(!outcome.success);
        // Value is not silently dropped
        assert_eq!(store.get("https://api.x/").unwrap().amount, 150);
    }
}
