//! Mint selection and the spend retry policy.
//!
//! A spend walks an explicit bounded loop: reuse or refund the recipient's
//! pending token, check total spendable value, pick a mint, attempt the swap,
//! and on transient failure exclude the mint and try again. The loop bound
//! is derived from the number of distinct mints so the termination condition
//! is auditable. Failures come back as structured results, never panics.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::balance::{balances_by_mint, largest_mint_sats, msat_to_sat_ceil, total_sats, MintBalance};
use super::history::{TransactionDirection, TransactionHistory};
use super::pending::{PendingToken, PendingTokenStore};
use super::recipient::RecipientDirectory;
use super::wallet::{MintClient, MintError, WalletBackend};

/// Flat surcharge applied when the only covering mint is not on the
/// recipient's accepted list, to absorb the recipient-side swap fee.
/// TODO: replace with the mint's actual fee schedule once the recipient
/// exposes it; the flat constant is unverified against real swap costs.
const SWAP_FEE_SURCHARGE_SATS: u64 = 2;

#[derive(Debug, Clone)]
pub struct SpendRequest {
    /// Whole sats; round fractional asks up before building the request.
    pub amount_sats: u64,
    pub preferred_mint: Option<String>,
    pub recipient_base_url: String,
    /// Reuse the recipient's pending token when it still covers the ask.
    pub reuse_token: bool,
    /// P2PK-lock the issued token to this pubkey.
    pub lock_to_pubkey: Option<String>,
}

impl SpendRequest {
    pub fn new(amount_sats: u64, recipient_base_url: impl Into<String>) -> Self {
        Self {
            amount_sats,
            preferred_mint: None,
            recipient_base_url: recipient_base_url.into(),
            reuse_token: false,
            lock_to_pubkey: None,
        }
    }

    /// Build a request from a msat-priced ask, rounding up to whole sats.
    pub fn from_msat(amount_msat: u64, recipient_base_url: impl Into<String>) -> Self {
        Self::new(msat_to_sat_ceil(amount_msat), recipient_base_url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SpendResult {
    pub status: SpendStatus,
    pub token: Option<String>,
    /// Sat value of the returned token.
    pub amount: u64,
    pub error: Option<String>,
}

impl SpendResult {
    fn success(token: String, amount: u64) -> Self {
        Self {
            status: SpendStatus::Success,
            token: Some(token),
            amount,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            status: SpendStatus::Failed,
            token: None,
            amount: 0,
            error: Some(error.into()),
        }
    }
}

/// The highest-balance mint whose normalized balance covers `amount`.
pub fn select_mint_with_balance(
    balances: &HashMap<String, MintBalance>,
    amount: u64,
) -> Option<String> {
    balances
        .iter()
        .filter(|(_, balance)| balance.normalized_sats() >= amount)
        .max_by(|a, b| {
            a.1.normalized_sats()
                .cmp(&b.1.normalized_sats())
                // Deterministic on ties
                .then_with(|| b.0.cmp(a.0))
        })
        .map(|(url, _)| url.clone())
}

/// Pick a mint for `amount`, honoring preference, acceptance and exclusions.
///
/// Returns the mint plus a surcharge: zero normally, the swap surcharge when
/// no accepted mint covers the amount and a non-accepted one must be used.
/// `accepted = None` or an empty list means unrestricted.
fn choose_mint(
    balances: &HashMap<String, MintBalance>,
    amount: u64,
    preferred: Option<&str>,
    accepted: Option<&[String]>,
    excluded: &HashSet<String>,
) -> Option<(String, u64)> {
    let is_accepted = |mint: &str| match accepted {
        Some(list) if !list.is_empty() => list.iter().any(|m| m == mint),
        _ => true,
    };
    let candidates: HashMap<String, MintBalance> = balances
        .iter()
        .filter(|(url, _)| !excluded.contains(*url))
        .map(|(url, balance)| (url.clone(), balance.clone()))
        .collect();

    // Preferred mint wins when it covers and is accepted
    if let Some(preferred) = preferred {
        if let Some(balance) = candidates.get(preferred) {
            if balance.normalized_sats() >= amount && is_accepted(preferred) {
                return Some((preferred.to_string(), 0));
            }
        }
    }

    // Highest-balance accepted mint that covers
    let accepted_candidates: HashMap<String, MintBalance> = candidates
        .iter()
        .filter(|(url, _)| is_accepted(url))
        .map(|(url, balance)| (url.clone(), balance.clone()))
        .collect();
    if let Some(mint) = select_mint_with_balance(&accepted_candidates, amount) {
        return Some((mint, 0));
    }

    // Nothing accepted covers: fall back to any covering mint, surcharged to
    // absorb the cross-mint swap
    select_mint_with_balance(&candidates, amount + SWAP_FEE_SURCHARGE_SATS)
        .map(|mint| (mint, SWAP_FEE_SURCHARGE_SATS))
}

pub struct PaymentSelector {
    mint_client: Arc<dyn MintClient>,
    recipients: Arc<RecipientDirectory>,
    pending: Arc<PendingTokenStore>,
    history: TransactionHistory,
}

impl PaymentSelector {
    pub fn new(
        mint_client: Arc<dyn MintClient>,
        recipients: Arc<RecipientDirectory>,
        pending: Arc<PendingTokenStore>,
        history: TransactionHistory,
    ) -> Self {
        Self {
            mint_client,
            recipients,
            pending,
            history,
        }
    }

    /// Produce a token worth at least `request.amount_sats` for the
    /// recipient.
    ///
    /// Serialized per recipient: a second spend for the same recipient waits
    /// on the first instead of racing the pending-token entry.
    pub async fn spend(&self, wallet: &mut WalletBackend, request: &SpendRequest) -> SpendResult {
        let lock = self.pending.recipient_lock(&request.recipient_base_url);
        let _guard = lock.lock().await;
        self.spend_locked(wallet, request).await
    }

    async fn spend_locked(
        &self,
        wallet: &mut WalletBackend,
        request: &SpendRequest,
    ) -> SpendResult {
        let amount = request.amount_sats;

        // Reuse or refund the recipient's outstanding token first; a stale
        // token must not silently leak value.
        if let Some(pending) = self.pending.get(&request.recipient_base_url) {
            if request.reuse_token && pending.amount >= amount {
                tracing::debug!(
                    target: "backchannel::payments::selector",
                    "Reusing pending token of {} sats for {}",
                    pending.amount,
                    request.recipient_base_url
                );
                return SpendResult::success(pending.token, pending.amount);
            }
            let outcome = self
                .pending
                .refund(
                    self.mint_client.as_ref(),
                    wallet,
                    &request.recipient_base_url,
                )
                .await;
            if !outcome.success {
                tracing::warn!(
                    target: "backchannel::payments::selector",
                    "Stale pending token refund failed, continuing: {}",
                    outcome.message
                );
            }
        }

        let accepted = match self
            .recipients
            .accepted_mints(&request.recipient_base_url)
            .await
        {
            Ok(mints) => Some(mints),
            Err(e) => {
                tracing::warn!(
                    target: "backchannel::payments::selector",
                    "Recipient info unavailable for {}, treating as unrestricted: {}",
                    request.recipient_base_url,
                    e
                );
                None
            }
        };

        let mut excluded: HashSet<String> = HashSet::new();
        let mut cleaned: HashSet<String> = HashSet::new();
        let mut refunded_pending = false;
        // Each mint gets at most a network exclusion plus one cleanup retry,
        // plus one pass after refunding pendings
        let attempt_budget = wallet.mint_urls().len().max(1) * 2 + 1;

        for _ in 0..attempt_budget {
            let balances = balances_by_mint(&wallet.all_proofs(), &[]);
            let total = total_sats(&balances) + self.pending.total_sats();
            if total < amount {
                return SpendResult::failed(format!(
                    "Insufficient balance: {} sats requested, largest mint holds {} sats",
                    amount,
                    largest_mint_sats(&balances)
                ));
            }

            let Some((mint_url, surcharge)) = choose_mint(
                &balances,
                amount,
                request.preferred_mint.as_deref(),
                accepted.as_deref(),
                &excluded,
            ) else {
                // Total is sufficient only once pending value returns to the
                // wallet: refund everything best-effort and retry once
                if !refunded_pending && self.pending.total_sats() > 0 {
                    refunded_pending = true;
                    self.refund_all_pending(wallet).await;
                    continue;
                }
                return SpendResult::failed(format!(
                    "No single mint can cover {} sats for this recipient",
                    amount
                ));
            };

            let ask = amount + surcharge;
            match wallet
                .spend(
                    self.mint_client.as_ref(),
                    &mint_url,
                    ask,
                    request.lock_to_pubkey.as_deref(),
                )
                .await
            {
                Ok(token) => {
                    return self
                        .finish_spend(wallet, request, token, &mint_url, ask)
                        .await;
                }
                Err(MintError::Network(e)) => {
                    tracing::warn!(
                        target: "backchannel::payments::selector",
                        "Mint {} unreachable, excluding and retrying: {}",
                        mint_url,
                        e
                    );
                    excluded.insert(mint_url);
                }
                Err(MintError::InsufficientFunds) => {
                    if cleaned.insert(mint_url.clone()) {
                        // The wallet may hold proofs the mint already saw
                        // spent; clean up locally and retry the same mint once
                        match wallet.clean_spent(self.mint_client.as_ref(), &mint_url).await {
                            Ok(removed) => {
                                tracing::debug!(
                                    target: "backchannel::payments::selector",
                                    "Cleaned {} spent proof(s) at {}, retrying",
                                    removed,
                                    mint_url
                                );
                            }
                            Err(e) => {
                                tracing::warn!(
                                    target: "backchannel::payments::selector",
                                    "Spent-proof cleanup failed at {}: {}",
                                    mint_url,
                                    e
                                );
                                excluded.insert(mint_url);
                            }
                        }
                    } else {
                        excluded.insert(mint_url);
                    }
                }
                Err(MintError::Rejected(e)) => {
                    tracing::warn!(
                        target: "backchannel::payments::selector",
                        "Mint {} rejected the spend, excluding: {}",
                        mint_url,
                        e
                    );
                    excluded.insert(mint_url);
                }
            }
        }

        SpendResult::failed("Spend retry budget exhausted")
    }

    async fn finish_spend(
        &self,
        wallet: &WalletBackend,
        request: &SpendRequest,
        token: String,
        mint_url: &str,
        token_amount: u64,
    ) -> SpendResult {
        if let Err(e) = self
            .pending
            .set(PendingToken {
                recipient_base_url: request.recipient_base_url.clone(),
                token: token.clone(),
                amount: token_amount,
                mint_url: mint_url.to_string(),
            })
            .await
        {
            tracing::warn!(
                target: "backchannel::payments::selector",
                "Failed to persist pending token for {}: {}",
                request.recipient_base_url,
                e
            );
        }

        let balance_after = total_sats(&balances_by_mint(&wallet.all_proofs(), &[]));
        if let Err(e) = self
            .history
            .record(TransactionDirection::Spent, token_amount, balance_after)
            .await
        {
            tracing::warn!(
                target: "backchannel::payments::selector",
                "Failed to record transaction: {}",
                e
            );
        }

        SpendResult::success(token, token_amount)
    }

    async fn refund_all_pending(&self, wallet: &mut WalletBackend) {
        for pending in self.pending.all() {
            let outcome = self
                .pending
                .refund(
                    self.mint_client.as_ref(),
                    wallet,
                    &pending.recipient_base_url,
                )
                .await;
            if !outcome.success {
                tracing::warn!(
                    target: "backchannel::payments::selector",
                    "Pending refund for {} failed, continuing: {}",
                    pending.recipient_base_url,
                    outcome.message
                );
            }
        }
    }
}
