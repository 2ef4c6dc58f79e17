//! Multi-mint ecash payments.
//!
//! Tracks balances across independent mints, selects a mint able to cover a
//! requested spend (respecting the recipient's accepted-mint list), reuses or
//! refunds previously issued but unspent tokens, and retries transient
//! failures under a bounded budget. Selection failures are structured
//! results, never panics; the caller renders them.

use thiserror::Error;

pub mod balance;
pub mod history;
pub mod pending;
pub mod recipient;
pub mod selector;
pub mod wallet;

#[cfg(test)]
pub(crate) mod test_support;

pub use balance::{balances_by_mint, msat_to_sat_ceil, total_sats, MintBalance};
pub use history::{TransactionDirection, TransactionEntry, TransactionHistory};
pub use pending::{PendingToken, PendingTokenStore, RefundOutcome};
pub use recipient::RecipientDirectory;
pub use selector::{PaymentSelector, SpendRequest, SpendResult, SpendStatus};
pub use wallet::{MintClient, MintError, Proof, WalletBackend};

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Mint error: {0}")]
    Mint(#[from] wallet::MintError),

    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLx error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, PaymentError>;
