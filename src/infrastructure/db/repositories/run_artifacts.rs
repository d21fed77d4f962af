use crate::domain::error::{AppError, Result};
use crate::domain::training::ArtifactKind;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;

use super::TrainingDb;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunArtifact {
    pub artifact_id: String,
    pub run_id: String,
    pub kind: ArtifactKind,
    pub path: String,
    pub hash: Option<String>,
    pub size_bytes: Option<i64>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunArtifactInput {
    pub artifact_id: String,
    pub run_id: String,
    pub kind: ArtifactKind,
    pub path: String,
    pub hash: Option<String>,
    pub size_bytes: Option<i64>,
}

pub struct RunArtifactsRepository {
    pool: SqlitePool,
}

impl RunArtifactsRepository {
    pub fn new(db: &TrainingDb) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn insert(&self, artifact: &RunArtifactInput) -> Result<()> {
        sqlx::query(
            "INSERT INTO run_artifacts (artifact_id, run_id, kind, path, hash, size_bytes) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&artifact.artifact_id)
        .bind(&artifact.run_id)
        .bind(artifact.kind.as_db())
        .bind(&artifact.path)
        .bind(&artifact.hash)
        .bind(artifact.size_bytes)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to insert run artifact: {e}")))?;

        Ok(())
    }

    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<RunArtifact>> {
        let rows = sqlx::query_as::<_, RunArtifactEntity>(
            "SELECT artifact_id, run_id, kind, path, hash, size_bytes, created_at \
             FROM run_artifacts WHERE run_id = ? ORDER BY created_at",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to list run artifacts: {e}")))?;

        rows.into_iter().map(|e| e.try_into()).collect()
    }

    pub async fn list_by_kind(&self, run_id: &str, kind: ArtifactKind) -> Result<Vec<RunArtifact>> {
        let rows = sqlx::query_as::<_, RunArtifactEntity>(
            "SELECT artifact_id, run_id, kind, path, hash, size_bytes, created_at \
             FROM run_artifacts WHERE run_id = ? AND kind = ? ORDER BY created_at",
        )
        .bind(run_id)
        .bind(kind.as_db())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to list run artifacts by kind: {e}")))?;

        rows.into_iter().map(|e| e.try_into()).collect()
    }
}

#[derive(sqlx::FromRow)]
struct RunArtifactEntity {
    artifact_id: String,
    run_id: String,
    kind: String,
    path: String,
    hash: Option<String>,
    size_bytes: Option<i64>,
    created_at: String,
}

impl TryFrom<RunArtifactEntity> for RunArtifact {
    type Error = AppError;

    fn try_from(entity: RunArtifactEntity) -> Result<Self> {
        let kind = ArtifactKind::from_worker(&entity.kind).ok_or_else(|| {
            AppError::DatabaseError(format!("Unknown artifact kind in store: {}", entity.kind))
        })?;
        Ok(Self {
            artifact_id: entity.artifact_id,
            run_id: entity.run_id,
            kind,
            path: entity.path,
            hash: entity.hash,
            size_bytes: entity.size_bytes,
            created_at: Some(entity.created_at),
        })
    }
}
