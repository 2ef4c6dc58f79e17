use crate::database::DatabaseError;
use crate::payments::PaymentError;
use crate::relays::RelayManagerError;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, BackchannelError>;

#[derive(Error, Debug)]
pub enum BackchannelError {
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Nostr Event error: {0}")]
    NostrEventBuilder(#[from] nostr_sdk::event::builder::Error),

    #[error("Nostr client error: {0}")]
    NostrClient(#[from] nostr_sdk::client::Error),

    #[error("Nostr key error: {0}")]
    NostrKey(#[from] nostr_sdk::key::Error),

    #[error("Nostr signer error: {0}")]
    NostrSigner(#[from] nostr_sdk::signer::SignerError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("SQLx error: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Relay manager error: {0}")]
    RelayManager(#[from] RelayManagerError),

    #[error("Payment error: {0}")]
    Payment(#[from] PaymentError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<Box<dyn std::error::Error + Send + Sync>> for BackchannelError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        BackchannelError::Other(anyhow::anyhow!(err.to_string()))
    }
}
