use crate::domain::error::{AppError, Result};
use crate::domain::training::Split;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;

use super::TrainingDb;

/// One frozen training-data selection: which example a run used, in which
/// split, at what weight. Written once at run start; the audit trail that
/// lets the run's data be reconstructed exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSelection {
    pub id: String,
    pub split: Split,
    pub weight: f64,
}

impl RunSelection {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(AppError::ValidationError(
                "Selection id must not be empty".to_string(),
            ));
        }
        if !(self.weight > 0.0) {
            return Err(AppError::ValidationError(format!(
                "Selection weight must be positive, got {} for {}",
                self.weight, self.id
            )));
        }
        Ok(())
    }
}

pub struct RunCorrectionsRepository {
    pool: SqlitePool,
}

impl RunCorrectionsRepository {
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
            "INSERT INTO run_corrections (run_id, correction_id, split, weight) VALUES (?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(&selection.id)
        .bind(selection.split.as_db())
        .bind(selection.weight)
        .execute(&mut **tx)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to attach correction to run: {e}")))?;
        Ok(())
    }

    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<RunSelection>> {
        let rows = sqlx::query_as::<_, RunSelectionEntity>(
            "SELECT correction_id AS id, split, weight FROM run_corrections \
             WHERE run_id = ? ORDER BY correction_id, split",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to list run corrections: {e}")))?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct RunSelectionEntity {
    pub(super) id: String,
    pub(super) split: String,
    pub(super) weight: f64,
}

impl TryFrom<RunSelectionEntity> for RunSelection {
    type Error = AppError;

    fn try_from(entity: RunSelectionEntity) -> Result<Self> {
        Ok(Self {
            id: entity.id,
            split: Split::from_db(&entity.split)?,
            weight: entity.weight,
        })
    }
}
