use crate::transfer::error::TransferResult;
use parking_lot::Mutex;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;

/// At-most-one-in-flight guard per file id, persisted so a restart cannot
/// start a duplicate transfer for a file that was mid-flight.
///
/// The in-memory set is authoritative for the atomic check-and-set; the
/// table mirrors it for crash recovery.
pub struct InFlightGuard {
    pool: SqlitePool,
    active: Mutex<HashSet<String>>,
}

impl InFlightGuard {
    pub async fn new(pool: SqlitePool) -> TransferResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS in_flight_downloads (
                file_id TEXT PRIMARY KEY
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows = sqlx::query("SELECT file_id FROM in_flight_downloads")
            .fetch_all(&pool)
            .await?;
        let active = rows
            .into_iter()
            .map(|r| r.try_get::<String, _>("file_id"))
            .collect::<Result<HashSet<_>, _>>()?;

        Ok(Self {
            pool,
            active: Mutex::new(active),
        })
    }

    /// Atomically claims the slot for `file_id`. Returns false when a
    /// transfer for this id is already in flight; the caller must then skip,
    /// not queue a duplicate.
    pub async fn try_begin(&self, file_id: &str) -> TransferResult<bool> {
        {
            let mut active = self.active.lock();
            if !active.insert(file_id.to_string()) {
                return Ok(false);
            }
        }
        // Persist after the in-memory claim; a failure rolls the claim back.
        let persisted = sqlx::query("INSERT OR IGNORE INTO in_flight_downloads (file_id) VALUES (?)")
            .bind(file_id)
            .execute(&self.pool)
            .await;
        if let Err(e) = persisted {
            self.active.lock().remove(file_id);
            return Err(e.into());
        }
        Ok(true)
    }

    /// Releases the slot. Safe to call for ids that are not claimed.
    pub async fn finish(&self, file_id: &str) -> TransferResult<()> {
        self.active.lock().remove(file_id);
        sqlx::query("DELETE FROM in_flight_downloads WHERE file_id = ?")
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn is_in_flight(&self, file_id: &str) -> bool {
        self.active.lock().contains(file_id)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.active.lock().iter().cloned().collect()
    }

    /// Clears every slot (used on clean shutdown).
    pub async fn clear(&self) -> TransferResult<()> {
        self.active.lock().clear();
        sqlx::query("DELETE FROM in_flight_downloads")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
