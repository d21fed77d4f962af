use crate::domain::error::{AppError, Result};
use crate::domain::training::{Hyperparams, TrainingMethod, TrainingStatus};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;

use super::TrainingDb;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingRun {
    pub run_id: String,
    pub student_model_id: String,
    pub base_version_id: Option<String>,
    pub teacher_model_id: Option<String>,
    pub method: TrainingMethod,
    pub status: TrainingStatus,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub hyperparams: Hyperparams,
    pub seed: Option<i64>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingRunInput {
    pub run_id: String,
    pub student_model_id: String,
    pub base_version_id: Option<String>,
    pub teacher_model_id: Option<String>,
    pub method: TrainingMethod,
    pub hyperparams: Hyperparams,
    pub seed: Option<i64>,
}

pub struct TrainingRunRepository {
    pool: SqlitePool,
}

impl TrainingRunRepository {
    pub fn new(db: &TrainingDb) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn insert(&self, run: &TrainingRunInput) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to begin insert: {e}")))?;
        Self::insert_tx(&mut tx, run).await?;
        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to commit insert: {e}")))?;
        Ok(())
    }

    /// Runs in the caller's transaction so a run and its frozen data
    /// selection land atomically.
    pub async fn insert_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        run: &TrainingRunInput,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO training_runs (run_id, student_model_id, base_version_id, teacher_model_id, method, status, hyperparams_json, seed) \
             VALUES (?, ?, ?, ?, ?, 'queued', ?, ?)",
        )
        .bind(&run.run_id)
        .bind(&run.student_model_id)
        .bind(&run.base_version_id)
        .bind(&run.teacher_model_id)
        .bind(run.method.as_db())
        .bind(run.hyperparams.to_json_string()?)
        .bind(run.seed)
        .execute(&mut **tx)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to insert training run: {e}")))?;
        Ok(())
    }

    /// Advance the run state machine. Illegal transitions (including any
    /// write to a terminal run) are rejected; terminal rows stay immutable.
    pub async fn transition(
        &self,
        run_id: &str,
        next: TrainingStatus,
        end_time: Option<String>,
        failure_reason: Option<String>,
    ) -> Result<()> {
        let current = self.get(run_id).await?.status;
        if current == next {
            // Repeated terminal notification: backfill end_time if the first
            // writer did not carry one.
            if let Some(end_time) = end_time {
                sqlx::query(
                    "UPDATE training_runs SET end_time = COALESCE(end_time, ?) WHERE run_id = ?",
                )
                .bind(end_time)
                .bind(run_id)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(format!("Failed to backfill run end time: {e}"))
                })?;
            }
            return Ok(());
        }
        if !current.can_transition_to(next) {
            return Err(AppError::ValidationError(format!(
                "Illegal run transition for {}: {} -> {}",
                run_id,
                current.as_db(),
                next.as_db()
            )));
        }

        let result = sqlx::query(
            "UPDATE training_runs SET status = ?, end_time = COALESCE(?, end_time), failure_reason = ? \
             WHERE run_id = ? AND status = ?",
        )
        .bind(next.as_db())
        .bind(end_time)
        .bind(failure_reason)
        .bind(run_id)
        .bind(current.as_db())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to update training run: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(AppError::ValidationError(format!(
                "Run {} left {} concurrently, transition to {} not applied",
                run_id,
                current.as_db(),
                next.as_db()
            )));
        }

        Ok(())
    }

    pub async fn get(&self, run_id: &str) -> Result<TrainingRun> {
        let run = sqlx::query_as::<_, TrainingRunEntity>(
            "SELECT run_id, student_model_id, base_version_id, teacher_model_id, method, status, start_time, end_time, hyperparams_json, seed, failure_reason \
             FROM training_runs WHERE run_id = ?",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to fetch training run: {e}")))?;

        match run {
            Some(entity) => entity.try_into(),
            None => Err(AppError::NotFound(format!(
                "Training run not found: {}",
                run_id
            ))),
        }
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<TrainingRun>> {
        let rows = sqlx::query_as::<_, TrainingRunEntity>(
            "SELECT run_id, student_model_id, base_version_id, teacher_model_id, method, status, start_time, end_time, hyperparams_json, seed, failure_reason \
             FROM training_runs ORDER BY start_time DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to list training runs: {e}")))?;

        rows.into_iter().map(|e| e.try_into()).collect()
    }

    /// Post-hoc annotation when a completed run's version is rolled back.
    /// Runs in the caller's transaction so the annotation and the pointer
    /// swap land together.
    pub async fn mark_rolled_back_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        run_id: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE training_runs SET status = 'rolled_back' WHERE run_id = ? AND status = 'completed'")
            .bind(run_id)
            .execute(&mut **tx)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to annotate rolled-back run: {e}")))?;
        Ok(())
    }

    /// Delete a run and every dependent row. The schema has no cascades;
    /// referential integrity is this transaction's job.
    pub async fn delete(&self, run_id: &str) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to begin delete: {e}")))?;

        for table in [
            "run_soft_labels",
            "run_artifacts",
            "training_logs",
            "run_datasets",
            "run_corrections",
        ] {
            let sql = format!("DELETE FROM {} WHERE run_id = ?", table);
            sqlx::query(&sql)
                .bind(run_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(format!("Failed to delete from {table}: {e}"))
                })?;
        }

        let result = sqlx::query("DELETE FROM training_runs WHERE run_id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to delete training run: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to commit delete: {e}")))?;

        Ok(result.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct TrainingRunEntity {
    run_id: String,
    student_model_id: String,
    base_version_id: Option<String>,
    teacher_model_id: Option<String>,
    method: String,
    status: String,
    start_time: String,
    end_time: Option<String>,
    hyperparams_json: String,
    seed: Option<i64>,
    failure_reason: Option<String>,
}

impl TryFrom<TrainingRunEntity> for TrainingRun {
    type Error = AppError;

    fn try_from(entity: TrainingRunEntity) -> Result<Self> {
        let method = match entity.method.as_str() {
            "fine_tune" => TrainingMethod::FineTune,
            "knowledge_distillation" => TrainingMethod::KnowledgeDistillation,
            "hybrid" => TrainingMethod::Hybrid,
            other => {
                return Err(AppError::DatabaseError(format!(
                    "Unknown training method in store: {other}"
                )))
            }
        };

        Ok(Self {
            run_id: entity.run_id,
            student_model_id: entity.student_model_id,
            base_version_id: entity.base_version_id,
            teacher_model_id: entity.teacher_model_id,
            method,
            status: TrainingStatus::from_db(&entity.status)?,
            start_time: Some(entity.start_time),
            end_time: entity.end_time,
            hyperparams: Hyperparams::parse(&entity.hyperparams_json)?,
            seed: entity.seed,
            failure_reason: entity.failure_reason,
        })
    }
}
