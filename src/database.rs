use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{migrate::MigrateDatabase, Sqlite, SqlitePool};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const MIGRATION_FILES: &[(&str, &[u8])] = &[(
    "0001_init.sql",
    include_bytes!("../db_migrations/0001_init.sql"),
)];

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Migrate error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Clone, Debug)]
pub struct Database {
    pub pool: SqlitePool,
    #[allow(unused)]
    pub path: PathBuf,
}

impl Database {
    pub async fn new(db_path: PathBuf) -> Result<Self, DatabaseError> {
        // Create parent directories if they don't exist
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("{}", db_path.display());

        tracing::debug!("Checking if DB exists...{:?}", db_url);
        if Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            tracing::debug!("DB exists");
        } else {
            tracing::debug!("DB does not exist, creating...");
            Sqlite::create_database(&db_url).await.map_err(|e| {
                tracing::error!("Error creating DB: {:?}", e);
                DatabaseError::Sqlx(e)
            })?;
        }

        let pool = SqlitePoolOptions::new()
            .acquire_timeout(Duration::from_secs(5))
            .max_connections(10)
            .after_connect(|conn, _| {
                Box::pin(async move {
                    let conn = &mut *conn;
                    // Enable WAL mode
                    sqlx::query("PRAGMA journal_mode=WAL")
                        .execute(&mut *conn)
                        .await?;
                    // Set busy timeout
                    sqlx::query("PRAGMA busy_timeout=5000")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA foreign_keys = ON;")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&format!("{}?mode=rwc", db_url))
            .await?;

        tracing::debug!("Running migrations...");

        let data_dir = db_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        // Always use embedded migrations by copying them to a temporary directory
        let temp_dir = data_dir.join("temp_migrations");
        if temp_dir.exists() {
            fs::remove_dir_all(&temp_dir)?;
        }
        fs::create_dir_all(&temp_dir)?;

        for (filename, content) in MIGRATION_FILES {
            tracing::debug!("Writing migration file: {}", filename);
            fs::write(temp_dir.join(filename), content)?;
        }

        let migration_result = match sqlx::migrate::Migrator::new(temp_dir.clone()).await {
            Ok(migrator) => {
                let result = migrator.run(&pool).await;
                if result.is_ok() {
                    tracing::debug!("Migrations applied successfully");
                }
                result.map_err(DatabaseError::from)
            }
            Err(e) => {
                tracing::error!("Failed to create migrator: {:?}", e);
                Err(DatabaseError::Migrate(e))
            }
        };

        // Always clean up temp migrations directory
        if let Err(e) = fs::remove_dir_all(&temp_dir) {
            tracing::warn!("Failed to remove temp migrations directory: {:?}", e);
        }

        migration_result?;

        Ok(Self {
            pool,
            path: db_path,
        })
    }

    pub async fn delete_all_data(&self) -> Result<(), DatabaseError> {
        let mut txn = self.pool.begin().await?;

        sqlx::query("DELETE FROM pending_tokens")
            .execute(&mut *txn)
            .await?;
        sqlx::query("DELETE FROM transactions")
            .execute(&mut *txn)
            .await?;

        txn.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_new_creates_and_migrates() {
        let dir = TempDir::new().unwrap();
        let database = Database::new(dir.path().join("backchannel.sqlite"))
            .await
            .unwrap();

        // Both tables exist and are empty
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pending_tokens")
            .fetch_one(&database.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM transactions")
            .fetch_one(&database.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn test_delete_all_data() {
        let dir = TempDir::new().unwrap();
        let database = Database::new(dir.path().join("backchannel.sqlite"))
            .await
            .unwrap();

        sqlx::query(
            "INSERT INTO transactions (direction, amount, timestamp_ms, balance_after) VALUES ('send', 10, 0, 90)",
        )
        .execute(&database.pool)
        .await
        .unwrap();

        database.delete_all_data().await.unwrap();

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM transactions")
            .fetch_one(&database.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }
}
