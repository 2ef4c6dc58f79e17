//! Append-only transaction history.

use chrono::Utc;
use sqlx::Row;

use crate::database::Database;

use super::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionDirection {
    Send,
    Receive,
    Spent,
}

impl TransactionDirection {
    fn as_str(&self) -> &'static str {
        match self {
            TransactionDirection::Send => "send",
            TransactionDirection::Receive => "receive",
            TransactionDirection::Spent => "spent",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "send" => TransactionDirection::Send,
            "receive" => TransactionDirection::Receive,
            _ => TransactionDirection::Spent,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransactionEntry {
    pub id: i64,
    pub direction: TransactionDirection,
    pub amount: u64,
    pub timestamp_ms: i64,
    pub balance_after: u64,
}

/// Append-only log over the `transactions` table. Trimming is left to
/// external storage policy.
#[derive(Debug, Clone)]
pub struct TransactionHistory {
    database: Database,
}

impl TransactionHistory {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    pub async fn record(
        &self,
        direction: TransactionDirection,
        amount: u64,
        balance_after: u64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO transactions (direction, amount, timestamp_ms, balance_after) VALUES (?, ?, ?, ?)",
        )
        .bind(direction.as_str())
        .bind(amount as i64)
        .bind(Utc::now().timestamp_millis())
        .bind(balance_after as i64)
        .execute(&self.database.pool)
        .await?;
        Ok(())
    }

    /// Most recent entries, newest first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<TransactionEntry>> {
        let rows = sqlx::query(
            "SELECT id, direction, amount, timestamp_ms, balance_after FROM transactions ORDER BY timestamp_ms DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.database.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| TransactionEntry {
                id: row.get("id"),
                direction: TransactionDirection::parse(row.get("direction")),
                amount: row.get::<i64, _>("amount") as u64,
                timestamp_ms: row.get("timestamp_ms"),
                balance_after: row.get::<i64, _>("balance_after") as u64,
            })
            .collect())
    }
}
