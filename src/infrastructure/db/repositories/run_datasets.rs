use crate::domain::error::{AppError, Result};
use sqlx::sqlite::SqlitePool;

use super::run_corrections::{RunSelection, RunSelectionEntity};
use super::TrainingDb;

pub struct RunDatasetsRepository {
    pool: SqlitePool,
}

impl RunDatasetsRepository {
    pub fn new(db: &TrainingDb) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn add_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        run_id: &str,
        selection: &RunSelection,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO run_datasets (run_id, dataset_id, split, weight) VALUES (?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(&selection.id)
        .bind(selection.split.as_db())
        .bind(selection.weight)
        .execute(&mut **tx)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to attach dataset to run: {e}")))?;
        Ok(())
    }

    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<RunSelection>> {
        let rows = sqlx::query_as::<_, RunSelectionEntity>(
            "SELECT dataset_id AS id, split, weight FROM run_datasets \
             WHERE run_id = ? ORDER BY dataset_id, split",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to list run datasets: {e}")))?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }
}
