// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Database connection management with PRAGMA setup, WAL mode, and lifecycle.
//!
//! All writes are serialized through tokio-rusqlite's single background
//! thread. Do NOT create additional Connection instances for writes.

use cauce_core::CauceError;
use tracing::debug;

/// Handle to the SQLite database used by every durable component.
#[derive(Clone)]
pub struct Database {
    conn: tokio_rusqlite::Connection,
}

impl Database {
    /// Open (or create) the database at `path`, run pending migrations, and
    /// apply the standard PRAGMAs.
    pub async fn open(path: &str) -> Result<Self, CauceError> {
        // Migrations run on a short-lived blocking connection so refinery
        // sees a plain rusqlite handle.
        let migration_path = path.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), CauceError> {
            let mut conn =
                rusqlite::Connection::open(&migration_path).map_err(|e| CauceError::Storage {
                    source: Box::new(e),
                })?;
            crate::migrations::run_migrations(&mut conn)
        })
        .await
        .map_err(|e| CauceError::Internal(format!("migration task panicked: {e}")))??;

        let conn = tokio_rusqlite::Connection::open(path)
            .await
            .map_err(map_tr_err)?;

        conn.call(|conn| -> Result<(), tokio_rusqlite::Error> {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA busy_timeout=5000;
                 PRAGMA foreign_keys=ON;",
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)?;

        debug!(path, "database opened");
        Ok(Self { conn })
    }

    /// Returns the shared tokio-rusqlite connection.
    pub fn connection(&self) -> &tokio_rusqlite::Connection {
        &self.conn
    }

    /// Cheap liveness probe for the health endpoint.
    pub async fn ping(&self) -> Result<(), CauceError> {
        self.conn
            .call(|conn| -> Result<(), tokio_rusqlite::Error> {
                conn.execute_batch("SELECT 1;")?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }

    /// Checkpoint the WAL before shutdown.
    pub async fn close(&self) -> Result<(), CauceError> {
        self.conn
            .call(|conn| -> Result<(), tokio_rusqlite::Error> {
                conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)?;
        debug!("WAL checkpoint complete");
        Ok(())
    }
}

/// Map a tokio-rusqlite error into the shared error type.
pub fn map_tr_err(e: tokio_rusqlite::Error) -> CauceError {
    CauceError::Storage {
        source: Box::new(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn open_creates_database_and_schema() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("open.db");
        let db = Database::open(db_path.to_str().unwrap()).await.unwrap();
        assert!(db_path.exists());

        // Migrations created the queue table.
        let count: i64 = db
            .connection()
            .call(|conn| -> Result<i64, tokio_rusqlite::Error> {
                conn.query_row("SELECT COUNT(*) FROM message_queue", [], |row| row.get(0))
                    .map_err(Into::into)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn ping_succeeds_on_open_database() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("ping.db");
        let db = Database::open(db_path.to_str().unwrap()).await.unwrap();
        db.ping().await.unwrap();
    }

    #[tokio::test]
    async fn reopen_is_idempotent() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("reopen.db");
        {
            let db = Database::open(db_path.to_str().unwrap()).await.unwrap();
            db.close().await.unwrap();
        }
        // Second open must not re-apply migrations destructively.
        let db = Database::open(db_path.to_str().unwrap()).await.unwrap();
        db.ping().await.unwrap();
    }
}
