use crate::domain::error::{AppError, Result};
use sqlx::sqlite::SqlitePool;

use super::TrainingDb;

/// Owns the active-version pointer (`model_actives`, one row per model).
///
/// The swap is a single transaction: un-flag the previous active version,
/// flag the new one, repoint. Callers serialize swaps per model with the
/// model lock; the transaction keeps the rows consistent under crash.
pub struct ActiveVersionRepository {
    pool: SqlitePool,
}

impl ActiveVersionRepository {
    pub fn new(db: &TrainingDb) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn get_active_version_id(&self, model_id: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, Option<String>>(
            "SELECT version_id FROM model_actives WHERE model_id = ?",
        )
        .bind(model_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to get active version: {e}")))?;

        Ok(value.flatten())
    }

    /// Atomically make `version_id` the active version of `model_id`.
    /// Returns the previously-active version id, if any.
    ///
    /// `annotate_rolled_back_run` additionally marks the previous version's
    /// producing run as rolled back inside the same transaction (used by the
    /// rollback path only).
    pub async fn swap_active(
        &self,
        model_id: &str,
        version_id: &str,
        annotate_rolled_back_run: bool,
    ) -> Result<Option<String>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to begin swap: {e}")))?;

        let previous: Option<String> = sqlx::query_scalar::<_, Option<String>>(
            "SELECT version_id FROM model_actives WHERE model_id = ?",
        )
        .bind(model_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to read active pointer: {e}")))?
        .flatten();

        sqlx::query("UPDATE model_versions SET is_promoted = 0 WHERE model_id = ? AND is_promoted = 1")
            .bind(model_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to unset promoted flag: {e}")))?;

        sqlx::query(
            "UPDATE model_versions SET is_promoted = 1, promoted_at = CURRENT_TIMESTAMP WHERE version_id = ?",
        )
        .bind(version_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to set promoted flag: {e}")))?;

        sqlx::query(
            "INSERT INTO model_actives (model_id, version_id) VALUES (?, ?) \
             ON CONFLICT(model_id) DO UPDATE SET version_id = excluded.version_id, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(model_id)
        .bind(version_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to repoint active version: {e}")))?;

        if annotate_rolled_back_run {
            if let Some(prev_id) = &previous {
                let run_id: Option<String> = sqlx::query_scalar::<_, Option<String>>(
                    "SELECT run_id FROM model_versions WHERE version_id = ?",
                )
                .bind(prev_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(format!("Failed to read previous version run: {e}"))
                })?
                .flatten();

                if let Some(run_id) = run_id {
                    super::TrainingRunRepository::mark_rolled_back_tx(&mut tx, &run_id).await?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to commit swap: {e}")))?;

        Ok(previous)
    }
}
