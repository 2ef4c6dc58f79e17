//! Per-mint balance aggregation.
//!
//! Pure functions over the wallet's proof set. Balances keep their original
//! unit; msat→sat normalization happens only where cross-mint comparison
//! needs it, so msat-only mints never lose sub-sat precision inside the map
//! itself.

use std::collections::HashMap;

use super::wallet::Proof;

/// Balance of one mint in its own unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintBalance {
    pub balance: u64,
    /// "sat" or "msat", as the mint reports it.
    pub unit: String,
}

impl MintBalance {
    /// Balance in sats, rounding msat down.
    pub fn normalized_sats(&self) -> u64 {
        if self.unit == "msat" {
            self.balance / 1000
        } else {
            self.balance
        }
    }
}

/// Sum the proof set per mint. Mints listed in `known_mints` appear even
/// with zero proofs so callers can render them.
pub fn balances_by_mint(proofs: &[Proof], known_mints: &[String]) -> HashMap<String, MintBalance> {
    let mut balances: HashMap<String, MintBalance> = HashMap::new();
    for mint_url in known_mints {
        balances.insert(
            mint_url.clone(),
            MintBalance {
                balance: 0,
                unit: "sat".to_string(),
            },
        );
    }
    for proof in proofs {
        let entry = balances
            .entry(proof.mint_url.clone())
            .or_insert_with(|| MintBalance {
                balance: 0,
                unit: proof.unit.clone(),
            });
        if entry.balance == 0 {
            entry.unit = proof.unit.clone();
            entry.balance = proof.amount;
        } else if entry.unit == proof.unit {
            entry.balance += proof.amount;
        } else {
            // A mint holding both sat and msat proofs: collapse the whole
            // entry to sats rather than summing raw amounts across units
            let normalized = entry.normalized_sats()
                + if proof.unit == "msat" {
                    proof.amount / 1000
                } else {
                    proof.amount
                };
            entry.balance = normalized;
            entry.unit = "sat".to_string();
        }
    }
    balances
}

/// Total spendable value across all mints, in sats.
pub fn total_sats(balances: &HashMap<String, MintBalance>) -> u64 {
    balances.values().map(MintBalance::normalized_sats).sum()
}

/// The single largest mint balance in sats, for insufficient-balance
/// messages.
pub fn largest_mint_sats(balances: &HashMap<String, MintBalance>) -> u64 {
    balances
        .values()
        .map(MintBalance::normalized_sats)
        .max()
        .unwrap_or(0)
}

/// Round a msat amount up to whole sats.
pub fn msat_to_sat_ceil(msat: u64) -> u64 {
    msat.div_ceil(1000)
}
