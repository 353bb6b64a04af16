// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Best-effort persistence of admission rate-bucket windows.
//!
//! The live counters are in-memory (see `cauce-dispatch::admission`); the
//! admission control mirrors each closed window here for inspection and
//! continuity across restarts.

use cauce_core::CauceError;
use rusqlite::params;

use crate::database::{map_tr_err, Database};

/// Record the request count for a closed window.
pub async fn record_window(
    db: &Database,
    identifier: &str,
    window_start_epoch: i64,
    request_count: u32,
) -> Result<(), CauceError> {
    let identifier = identifier.to_string();
    db.connection()
        .call(move |conn| -> Result<(), tokio_rusqlite::Error> {
            conn.execute(
                "INSERT INTO rate_limits (identifier, window_start, request_count)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(identifier, window_start) DO UPDATE SET
                    request_count = excluded.request_count",
                params![identifier, window_start_epoch, request_count],
            )?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
}

/// Drop windows older than `before_epoch`.
pub async fn prune(db: &Database, before_epoch: i64) -> Result<usize, CauceError> {
    db.connection()
        .call(move |conn| -> Result<usize, tokio_rusqlite::Error> {
            let n = conn.execute(
                "DELETE FROM rate_limits WHERE window_start < ?1",
                params![before_epoch],
            )?;
            Ok(n)
        })
        .await
        .map_err(map_tr_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn record_and_prune_windows() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("rb.db").to_str().unwrap())
            .await
            .unwrap();

        record_window(&db, "user:5493515550000", 1_750_000_000, 7)
            .await
            .unwrap();
        record_window(&db, "user:5493515550000", 1_750_000_000, 9)
            .await
            .unwrap();

        let pruned = prune(&db, 1_750_000_100).await.unwrap();
        assert_eq!(pruned, 1);
    }
}
