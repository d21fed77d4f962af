use crate::domain::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;

use super::TrainingDb;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub tag_id: i64,
    pub name: String,
}

pub struct TagRepository {
    pool: SqlitePool,
}

impl TagRepository {
    pub fn new(db: &TrainingDb) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Get-or-create by name. Tag names are unique, concurrent callers
    /// converge on the same row.
    pub async fn ensure(&self, name: &str) -> Result<Tag> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(AppError::ValidationError(
                "Tag name must not be empty".to_string(),
            ));
        }

        sqlx::query("INSERT INTO tags (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
            .bind(trimmed)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to insert tag: {e}")))?;

        let entity =
            sqlx::query_as::<_, TagEntity>("SELECT tag_id, name FROM tags WHERE name = ?")
                .bind(trimmed)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(format!("Failed to fetch tag: {e}")))?;

        Ok(entity.into())
    }

    pub async fn list_all(&self) -> Result<Vec<Tag>> {
        let rows = sqlx::query_as::<_, TagEntity>("SELECT tag_id, name FROM tags ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to list tags: {e}")))?;

        Ok(rows.into_iter().map(|e| e.into()).collect())
    }

    pub async fn attach(&self, correction_id: &str, tag_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO correction_tags (correction_id, tag_id) VALUES (?, ?) \
             ON CONFLICT(correction_id, tag_id) DO NOTHING",
        )
        .bind(correction_id)
        .bind(tag_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to attach tag: {e}")))?;

        Ok(())
    }

    pub async fn list_for_correction(&self, correction_id: &str) -> Result<Vec<Tag>> {
        let rows = sqlx::query_as::<_, TagEntity>(
            "SELECT t.tag_id, t.name FROM tags t \
             JOIN correction_tags ct ON ct.tag_id = t.tag_id \
             WHERE ct.correction_id = ? ORDER BY t.name",
        )
        .bind(correction_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to list correction tags: {e}")))?;

        Ok(rows.into_iter().map(|e| e.into()).collect())
    }
}

#[derive(sqlx::FromRow)]
struct TagEntity {
    tag_id: i64,
    name: String,
}

impl From<TagEntity> for Tag {
    fn from(entity: TagEntity) -> Self {
        Self {
            tag_id: entity.tag_id,
            name: entity.name,
        }
    }
}
