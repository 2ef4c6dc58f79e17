//! Wallet backends and the cashu token codec.
//!
//! Two wallet modes share one spend/receive contract: the multi-mint mode
//! tracks proofs across independent mints, the legacy mode owns a single
//! proof set bound to one mint. Mint-side network operations go through the
//! [`MintClient`] trait so the selection logic can be exercised without a
//! live mint.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{PaymentError, Result};

const TOKEN_V3_PREFIX: &str = "cashuA";

/// Errors from mint-side operations, classified by how the selector reacts.
#[derive(Error, Debug)]
pub enum MintError {
    /// Mint unreachable or request timed out; the mint gets excluded and
    /// selection retries elsewhere.
    #[error("Mint unreachable: {0}")]
    Network(String),
    /// Local proofs do not cover the ask; may resolve after a spent-proof
    /// cleanup pass.
    #[error("Insufficient funds at mint")]
    InsufficientFunds,
    /// The mint refused the operation outright.
    #[error("Mint rejected operation: {0}")]
    Rejected(String),
}

/// One ecash proof, tagged with the mint that issued it.
///
/// The cryptographic fields are opaque here; only amount, unit and mint
/// membership matter to balance aggregation and selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    pub mint_url: String,
    /// "sat" or "msat".
    pub unit: String,
    pub amount: u64,
    pub keyset_id: String,
    pub secret: String,
    pub c: String,
}

/// Result of a mint swap: the serialized token to hand out plus the change
/// proofs to keep.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub token: String,
    pub change: Vec<Proof>,
}

/// Network seam to a cashu mint.
#[async_trait]
pub trait MintClient: Send + Sync {
    /// Swap `proofs` at the mint for a sendable token worth exactly
    /// `amount`, optionally P2PK-locked to `lock_to`.
    async fn create_send_token(
        &self,
        mint_url: &str,
        proofs: Vec<Proof>,
        amount: u64,
        lock_to: Option<&str>,
    ) -> std::result::Result<SendOutcome, MintError>;

    /// Redeem a serialized token back into fresh proofs.
    async fn redeem_token(&self, token: &str) -> std::result::Result<Vec<Proof>, MintError>;

    /// Return the subset of `proofs` the mint still considers unspent.
    async fn filter_unspent(
        &self,
        mint_url: &str,
        proofs: Vec<Proof>,
    ) -> std::result::Result<Vec<Proof>, MintError>;
}

/// The two wallet modes, one contract.
#[derive(Debug, Clone)]
pub enum WalletBackend {
    /// NIP-60 style wallet: proofs carry their own mint and unit.
    MultiMint { proofs: Vec<Proof> },
    /// Single proof set bound to one mint.
    Legacy {
        mint_url: String,
        unit: String,
        proofs: Vec<Proof>,
    },
}

impl WalletBackend {
    /// All proofs with mint and unit stamped, regardless of mode.
    pub fn all_proofs(&self) -> Vec<Proof> {
        match self {
            WalletBackend::MultiMint { proofs } => proofs.clone(),
            WalletBackend::Legacy {
                mint_url,
                unit,
                proofs,
            } => proofs
                .iter()
                .map(|p| Proof {
                    mint_url: mint_url.clone(),
                    unit: unit.clone(),
                    ..p.clone()
                })
                .collect(),
        }
    }

    /// Distinct mints currently holding value.
    pub fn mint_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        for proof in self.all_proofs() {
            if !urls.contains(&proof.mint_url) {
                urls.push(proof.mint_url);
            }
        }
        urls
    }

    fn proofs_for_mint(&self, mint_url: &str) -> Vec<Proof> {
        self.all_proofs()
            .into_iter()
            .filter(|p| p.mint_url == mint_url)
            .collect()
    }

    fn remove_proofs(&mut self, removed: &[Proof]) {
        let secrets: Vec<&str> = removed.iter().map(|p| p.secret.as_str()).collect();
        let proofs = match self {
            WalletBackend::MultiMint { proofs } => proofs,
            WalletBackend::Legacy { proofs, .. } => proofs,
        };
        proofs.retain(|p| !secrets.contains(&p.secret.as_str()));
    }

    fn add_proofs(&mut self, added: Vec<Proof>) {
        match self {
            WalletBackend::MultiMint { proofs } => proofs.extend(added),
            WalletBackend::Legacy { proofs, .. } => proofs.extend(added),
        }
    }

    /// Swap proofs at `mint_url` into a sendable token worth `amount` sats.
    ///
    /// On success the consumed proofs are replaced by the mint's change. No
    /// local state changes on failure.
    pub async fn spend(
        &mut self,
        client: &dyn MintClient,
        mint_url: &str,
        amount: u64,
        lock_to: Option<&str>,
    ) -> std::result::Result<String, MintError> {
        let candidates = self.proofs_for_mint(mint_url);
        let available: u64 = candidates.iter().map(|p| normalized_amount(p)).sum();
        if available < amount {
            return Err(MintError::InsufficientFunds);
        }

        let outcome = client
            .create_send_token(mint_url, candidates.clone(), amount, lock_to)
            .await?;

        self.remove_proofs(&candidates);
        self.add_proofs(outcome.change);
        Ok(outcome.token)
    }

    /// Redeem a token back into the wallet, returning its sat value.
    pub async fn receive(
        &mut self,
        client: &dyn MintClient,
        token: &str,
    ) -> std::result::Result<u64, MintError> {
        let proofs = client.redeem_token(token).await?;
        let amount = proofs.iter().map(normalized_amount).sum();
        self.add_proofs(proofs);
        Ok(amount)
    }

    /// Drop proofs the mint reports as already spent. Returns how many were
    /// removed.
    pub async fn clean_spent(
        &mut self,
        client: &dyn MintClient,
        mint_url: &str,
    ) -> std::result::Result<usize, MintError> {
        let candidates = self.proofs_for_mint(mint_url);
        let before = candidates.len();
        let unspent = client.filter_unspent(mint_url, candidates.clone()).await?;

        self.remove_proofs(&candidates);
        let removed = before - unspent.len();
        self.add_proofs(unspent);
        if removed > 0 {
            tracing::debug!(
                target: "backchannel::payments::wallet",
                "Dropped {} spent proof(s) at {}",
                removed,
                mint_url
            );
        }
        Ok(removed)
    }
}

fn normalized_amount(proof: &Proof) -> u64 {
    if proof.unit == "msat" {
        proof.amount / 1000
    } else {
        proof.amount
    }
}

#[derive(Serialize, Deserialize)]
struct TokenProof {
    id: String,
    amount: u64,
    secret: String,
    #[serde(rename = "C")]
    c: String,
}

#[derive(Serialize, Deserialize)]
struct TokenEntry {
    mint: String,
    proofs: Vec<TokenProof>,
}

#[derive(Serialize, Deserialize)]
struct TokenV3 {
    token: Vec<TokenEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    memo: Option<String>,
}

/// A decoded cashu token: one mint, its proofs, and the summed value.
#[derive(Debug, Clone)]
pub struct DecodedToken {
    pub mint_url: String,
    pub unit: String,
    pub amount: u64,
    pub proofs: Vec<Proof>,
}

/// Serialize proofs into a V3 cashu token (`cashuA` + base64 JSON).
pub fn encode_token_v3(mint_url: &str, unit: &str, proofs: &[Proof]) -> String {
    let entry = TokenEntry {
        mint: mint_url.to_string(),
        proofs: proofs
            .iter()
            .map(|p| TokenProof {
                id: p.keyset_id.clone(),
                amount: p.amount,
                secret: p.secret.clone(),
                c: p.c.clone(),
            })
            .collect(),
    };
    let token = TokenV3 {
        token: vec![entry],
        unit: Some(unit.to_string()),
        memo: None,
    };
    // Serialization of a struct with no non-string keys cannot fail
    let json = serde_json::to_string(&token).unwrap_or_default();
    format!("{}{}", TOKEN_V3_PREFIX, URL_SAFE.encode(json))
}

/// Parse a V3 cashu token.
pub fn decode_token_v3(token: &str) -> Result<DecodedToken> {
    let encoded = token
        .strip_prefix(TOKEN_V3_PREFIX)
        .ok_or_else(|| PaymentError::MalformedToken("missing cashuA prefix".to_string()))?;
    let json = URL_SAFE
        .decode(encoded)
        .map_err(|e| PaymentError::MalformedToken(format!("invalid base64: {}", e)))?;
    let parsed: TokenV3 = serde_json::from_slice(&json)?;

    let entry = parsed
        .token
        .into_iter()
        .next()
        .ok_or_else(|| PaymentError::MalformedToken("empty token".to_string()))?;
    let unit = parsed.unit.unwrap_or_else(|| "sat".to_string());

    let proofs: Vec<Proof> = entry
        .proofs
        .into_iter()
        .map(|p| Proof {
            mint_url: entry.mint.clone(),
            unit: unit.clone(),
            amount: p.amount,
            keyset_id: p.id,
            secret: p.secret,
            c: p.c,
        })
        .collect();
    let amount = proofs.iter().map(normalized_amount).sum();

    Ok(DecodedToken {
        mint_url: entry.mint,
        unit,
        amount,
        proofs,
    })
}
