//! Recipient (payment-accepting provider) metadata.
//!
//! Recipients declare which mints they accept via `GET {base}v1/info`. The
//! answer is cached per base URL for 20 minutes. A fetch failure yields no
//! whitelist at all; callers treat that as "unrestricted" rather than
//! blocking every spend on a flaky info endpoint.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Deserialize;

use super::Result;

const INFO_CACHE_TTL: Duration = Duration::from_secs(20 * 60);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
pub struct RecipientInfo {
    #[serde(default)]
    pub mints: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WalletInfoResponse {
    balance: u64,
}

#[derive(Debug, Clone)]
struct CachedInfo {
    info: RecipientInfo,
    fetched_at: Instant,
}

#[derive(Debug)]
pub struct RecipientDirectory {
    http: reqwest::Client,
    cache: DashMap<String, CachedInfo>,
    ttl: Duration,
}

impl Default for RecipientDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl RecipientDirectory {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
            cache: DashMap::new(),
            ttl: INFO_CACHE_TTL,
        }
    }

    #[cfg(test)]
    fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Self::new()
        }
    }

    /// The recipient's accepted-mint list, cached per base URL.
    ///
    /// `base_url` must end with a slash.
    pub async fn accepted_mints(&self, base_url: &str) -> Result<Vec<String>> {
        if let Some(cached) = self.cache.get(base_url) {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.info.mints.clone());
            }
        }

        let url = format!("{}v1/info", base_url);
        let info: RecipientInfo = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        tracing::debug!(
            target: "backchannel::payments::recipient",
            "Recipient {} accepts {} mint(s)",
            base_url,
            info.mints.len()
        );
        self.cache.insert(
            base_url.to_string(),
            CachedInfo {
                info: info.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(info.mints)
    }

    /// Whether the recipient accepts `mint_url`. Unreachable info endpoint
    /// or an empty declared list count as unrestricted.
    pub async fn accepts(&self, base_url: &str, mint_url: &str) -> bool {
        match self.accepted_mints(base_url).await {
            Ok(mints) => mints.is_empty() || mints.iter().any(|m| m == mint_url),
            Err(e) => {
                tracing::warn!(
                    target: "backchannel::payments::recipient",
                    "Failed to fetch recipient info from {}, treating as unrestricted: {}",
                    base_url,
                    e
                );
                true
            }
        }
    }

    /// Remaining account balance at the recipient, for credential
    /// verification after a top-up.
    pub async fn wallet_balance(&self, base_url: &str, api_key: &str) -> Result<u64> {
        let url = format!("{}v1/wallet/info", base_url);
        let info: WalletInfoResponse = self
            .http
            .get(&url)
            .bearer_auth(api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(info.balance)
    }
}
