use crate::domain::error::{AppError, Result};
use crate::domain::training::SoftLabelPayload;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;

use super::TrainingDb;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoftLabel {
    pub soft_label_id: String,
    pub prompt: String,
    pub prompt_hash: String,
    pub teacher_model_id: String,
    pub teacher_output: String,
    #[serde(flatten)]
    pub payload: SoftLabelPayload,
    pub temperature: f64,
    pub metadata_json: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoftLabelInput {
    pub soft_label_id: String,
    pub prompt: String,
    pub prompt_hash: String,
    pub teacher_model_id: String,
    pub teacher_output: String,
    #[serde(flatten)]
    pub payload: SoftLabelPayload,
    pub temperature: f64,
    pub metadata_json: Option<String>,
}

/// Content-addressed store of teacher outputs, keyed by
/// `(teacher_model_id, prompt_hash)`.
pub struct SoftLabelRepository {
    pool: SqlitePool,
}

impl SoftLabelRepository {
    pub fn new(db: &TrainingDb) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn find_by_teacher_and_hash(
        &self,
        teacher_model_id: &str,
        prompt_hash: &str,
    ) -> Result<Option<SoftLabel>> {
        let row = sqlx::query_as::<_, SoftLabelEntity>(
            "SELECT soft_label_id, prompt, prompt_hash, teacher_model_id, teacher_output, soft_label_type, soft_labels_blob, temperature, metadata_json, created_at \
             FROM soft_labels WHERE teacher_model_id = ? AND prompt_hash = ?",
        )
        .bind(teacher_model_id)
        .bind(prompt_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to look up soft label: {e}")))?;

        row.map(|e| e.try_into()).transpose()
    }

    /// Insert unless a label with the same dedup key already exists, then
    /// return whatever row won. The unique index on
    /// `(teacher_model_id, prompt_hash)` makes the racing case safe: the
    /// losing insert is a no-op and the re-read sees the winner, so a write
    /// race degrades to a cache hit.
    ///
    /// Returns the stored label and whether this call inserted it.
    pub async fn insert_if_absent(&self, label: &SoftLabelInput) -> Result<(SoftLabel, bool)> {
        let result = sqlx::query(
            "INSERT INTO soft_labels (soft_label_id, prompt, prompt_hash, teacher_model_id, teacher_output, soft_label_type, soft_labels_blob, temperature, metadata_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(teacher_model_id, prompt_hash) DO NOTHING",
        )
        .bind(&label.soft_label_id)
        .bind(&label.prompt)
        .bind(&label.prompt_hash)
        .bind(&label.teacher_model_id)
        .bind(&label.teacher_output)
        .bind(label.payload.type_name())
        .bind(label.payload.blob())
        .bind(label.temperature)
        .bind(&label.metadata_json)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to insert soft label: {e}")))?;

        let inserted = result.rows_affected() > 0;

        let stored = self
            .find_by_teacher_and_hash(&label.teacher_model_id, &label.prompt_hash)
            .await?
            .ok_or_else(|| {
                AppError::DatabaseError(
                    "Soft label vanished between insert and read-back".to_string(),
                )
            })?;

        Ok((stored, inserted))
    }

    pub async fn get(&self, soft_label_id: &str) -> Result<SoftLabel> {
        let row = sqlx::query_as::<_, SoftLabelEntity>(
            "SELECT soft_label_id, prompt, prompt_hash, teacher_model_id, teacher_output, soft_label_type, soft_labels_blob, temperature, metadata_json, created_at \
             FROM soft_labels WHERE soft_label_id = ?",
        )
        .bind(soft_label_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to fetch soft label: {e}")))?;

        match row {
            Some(entity) => entity.try_into(),
            None => Err(AppError::NotFound(format!(
                "Soft label not found: {}",
                soft_label_id
            ))),
        }
    }

    pub async fn list_for_teacher(&self, teacher_model_id: &str) -> Result<Vec<SoftLabel>> {
        let rows = sqlx::query_as::<_, SoftLabelEntity>(
            "SELECT soft_label_id, prompt, prompt_hash, teacher_model_id, teacher_output, soft_label_type, soft_labels_blob, temperature, metadata_json, created_at \
             FROM soft_labels WHERE teacher_model_id = ? ORDER BY created_at, soft_label_id",
        )
        .bind(teacher_model_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to list soft labels: {e}")))?;

        rows.into_iter().map(|e| e.try_into()).collect()
    }

    pub async fn link_correction(&self, correction_id: &str, soft_label_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO correction_soft_labels (correction_id, soft_label_id) VALUES (?, ?) \
             ON CONFLICT(correction_id, soft_label_id) DO NOTHING",
        )
        .bind(correction_id)
        .bind(soft_label_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to link soft label to correction: {e}")))?;

        Ok(())
    }

    pub async fn link_dataset_item(&self, item_id: &str, soft_label_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO dataset_item_soft_labels (item_id, soft_label_id) VALUES (?, ?) \
             ON CONFLICT(item_id, soft_label_id) DO NOTHING",
        )
        .bind(item_id)
        .bind(soft_label_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to link soft label to item: {e}")))?;

        Ok(())
    }

    pub async fn link_run(&self, run_id: &str, soft_label_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO run_soft_labels (run_id, soft_label_id) VALUES (?, ?) \
             ON CONFLICT(run_id, soft_label_id) DO NOTHING",
        )
        .bind(run_id)
        .bind(soft_label_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to link soft label to run: {e}")))?;

        Ok(())
    }

    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<SoftLabel>> {
        let rows = sqlx::query_as::<_, SoftLabelEntity>(
            "SELECT s.soft_label_id, s.prompt, s.prompt_hash, s.teacher_model_id, s.teacher_output, s.soft_label_type, s.soft_labels_blob, s.temperature, s.metadata_json, s.created_at \
             FROM soft_labels s \
             JOIN run_soft_labels rs ON rs.soft_label_id = s.soft_label_id \
             WHERE rs.run_id = ? ORDER BY s.created_at, s.soft_label_id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to list run soft labels: {e}")))?;

        rows.into_iter().map(|e| e.try_into()).collect()
    }

    pub async fn count_for_teacher(&self, teacher_model_id: &str) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM soft_labels WHERE teacher_model_id = ?")
            .bind(teacher_model_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to count soft labels: {e}")))
    }
}

#[derive(sqlx::FromRow)]
struct SoftLabelEntity {
    soft_label_id: String,
    prompt: String,
    prompt_hash: String,
    teacher_model_id: String,
    teacher_output: String,
    soft_label_type: String,
    soft_labels_blob: Option<Vec<u8>>,
    temperature: f64,
    metadata_json: Option<String>,
    created_at: String,
}

impl TryFrom<SoftLabelEntity> for SoftLabel {
    type Error = AppError;

    fn try_from(entity: SoftLabelEntity) -> Result<Self> {
        let payload =
            SoftLabelPayload::from_parts(&entity.soft_label_type, entity.soft_labels_blob)?;
        Ok(Self {
            soft_label_id: entity.soft_label_id,
            prompt: entity.prompt,
            prompt_hash: entity.prompt_hash,
            teacher_model_id: entity.teacher_model_id,
            teacher_output: entity.teacher_output,
            payload,
            temperature: entity.temperature,
            metadata_json: entity.metadata_json,
            created_at: Some(entity.created_at),
        })
    }
}
