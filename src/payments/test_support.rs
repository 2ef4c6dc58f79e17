//! Shared test doubles for the payments modules.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::wallet::{
    decode_token_v3, encode_token_v3, MintClient, MintError, Proof, SendOutcome,
};

pub fn proof(mint_url: &str, amount: u64, secret: &str) -> Proof {
    Proof {
        mint_url: mint_url.to_string(),
        unit: "sat".to_string(),
        amount,
        keyset_id: "009a1f293253e41e".to_string(),
        secret: secret.to_string(),
        c: "02deadbeef".to_string(),
    }
}

pub fn msat_proof(mint_url: &str, amount_msat: u64, secret: &str) -> Proof {
    Proof {
        unit: "msat".to_string(),
        amount: amount_msat,
        ..proof(mint_url, 0, secret)
    }
}

/// In-memory mint. Configurable failures, call counting, exact-amount swaps
/// with a single change proof.
#[derive(Default)]
pub struct MockMint {
    network_failures: Mutex<HashSet<String>>,
    spent_secrets: Mutex<HashSet<String>>,
    redeem_fails: std::sync::atomic::AtomicBool,
    insufficient_once: Mutex<HashSet<String>>,
    send_calls: AtomicUsize,
    redeem_calls: AtomicUsize,
    counter: AtomicUsize,
}

impl MockMint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_network(&self, mint_url: &str) {
        self.network_failures
            .lock()
            .unwrap()
            .insert(mint_url.to_string());
    }

    pub fn restore_network(&self, mint_url: &str) {
        self.network_failures.lock().unwrap().remove(mint_url);
    }

    pub fn mark_spent(&self, secret: &str) {
        self.spent_secrets.lock().unwrap().insert(secret.to_string());
    }

    pub fn fail_redeems(&self) {
        self.redeem_fails.store(true, Ordering::Relaxed);
    }

    /// The next send at `mint_url` reports insufficient funds once, the way
    /// a mint does when the wallet still holds already-spent proofs.
    pub fn fail_insufficient_once(&self, mint_url: &str) {
        self.insufficient_once
            .lock()
            .unwrap()
            .insert(mint_url.to_string());
    }

    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::Relaxed)
    }

    pub fn redeem_calls(&self) -> usize {
        self.redeem_calls.load(Ordering::Relaxed)
    }

    fn fresh_secret(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.counter.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl MintClient for MockMint {
    async fn create_send_token(
        &self,
        mint_url: &str,
        proofs: Vec<Proof>,
        amount: u64,
        _lock_to: Option<&str>,
    ) -> Result<SendOutcome, MintError> {
        self.send_calls.fetch_add(1, Ordering::Relaxed);
        if self.network_failures.lock().unwrap().contains(mint_url) {
            return Err(MintError::Network("connection refused".to_string()));
        }
        if self.insufficient_once.lock().unwrap().remove(mint_url) {
            return Err(MintError::InsufficientFunds);
        }

        let total: u64 = proofs
            .iter()
            .map(|p| {
                if p.unit == "msat" {
                    p.amount / 1000
                } else {
                    p.amount
                }
            })
            .sum();
        if total < amount {
            return Err(MintError::InsufficientFunds);
        }

        let sent = proof(mint_url, amount, &self.fresh_secret("sent"));
        let token = encode_token_v3(mint_url, "sat", &[sent]);
        let change = if total > amount {
            vec![proof(mint_url, total - amount, &self.fresh_secret("change"))]
        } else {
            Vec::new()
        };
        Ok(SendOutcome { token, change })
    }

    async fn redeem_token(&self, token: &str) -> Result<Vec<Proof>, MintError> {
        self.redeem_calls.fetch_add(1, Ordering::Relaxed);
        if self.redeem_fails.load(Ordering::Relaxed) {
            return Err(MintError::Network("connection refused".to_string()));
        }
        let decoded =
            decode_token_v3(token).map_err(|e| MintError::Rejected(e.to_string()))?;
        Ok(decoded.proofs)
    }

    async fn filter_unspent(
        &self,
        mint_url: &str,
        proofs: Vec<Proof>,
    ) -> Result<Vec<Proof>, MintError> {
        if self.network_failures.lock().unwrap().contains(mint_url) {
            return Err(MintError::Network("connection refused".to_string()));
        }
        let spent = self.spent_secrets.lock().unwrap();
        Ok(proofs
            .into_iter()
            .filter(|p| !spent.contains(&p.secret))
            .collect())
    }
}
