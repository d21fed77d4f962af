//! Rollback coordinator: backup, then repoint the active version.

use crate::application::locks::KeyedLocks;
use crate::domain::error::{AppError, Result};
use crate::infrastructure::artifact_store::{backup_before_rollback, BackupConfig};
use crate::infrastructure::config::ControlPlaneConfig;
use crate::infrastructure::db::repositories::{
    ActiveVersionRepository, ModelVersionRepository, TrainingDb,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResult {
    pub model_id: String,
    pub target_version_id: String,
    pub previous_version_id: Option<String>,
    pub backup_created: bool,
}

pub struct RollbackCoordinator {
    db: TrainingDb,
    config: Arc<ControlPlaneConfig>,
    model_locks: Arc<KeyedLocks>,
}

impl RollbackCoordinator {
    pub fn new(db: TrainingDb, config: Arc<ControlPlaneConfig>, model_locks: Arc<KeyedLocks>) -> Self {
        Self {
            db,
            config,
            model_locks,
        }
    }

    /// Repoint the active version of `model_id` to `target_version_id`.
    /// The displaced version is not deleted or mutated beyond its promoted
    /// flag; the run that produced it is annotated `rolled_back` in the same
    /// transaction as the pointer swap.
    pub async fn rollback(&self, model_id: &str, target_version_id: &str) -> Result<RollbackResult> {
        let versions = ModelVersionRepository::new(&self.db);
        let target = versions.get(target_version_id).await.map_err(|e| match e {
            AppError::NotFound(_) => {
                AppError::NotFound(format!("Unknown version: {target_version_id}"))
            }
            other => other,
        })?;
        if target.model_id != model_id {
            return Err(AppError::ValidationError(format!(
                "Version {} does not belong to model {}",
                target_version_id, model_id
            )));
        }

        let lock = self.model_locks.get(model_id);
        let _guard = lock.lock().await;

        let backup_config = BackupConfig::new(&self.config.data_dir, self.config.max_daily_backups);
        let backup_created =
            match backup_before_rollback(&self.config.db_path(), &backup_config, model_id) {
                Ok(result) => {
                    info!(model_id, backup = %result.backup_path.display(), "rollback backup written");
                    true
                }
                Err(e) => {
                    warn!(model_id, "rollback backup failed: {e}");
                    false
                }
            };

        let actives = ActiveVersionRepository::new(&self.db);
        let previous = actives.swap_active(model_id, target_version_id, true).await?;

        info!(
            model_id,
            target_version_id,
            previous = previous.as_deref().unwrap_or("none"),
            "rolled back active version"
        );
        Ok(RollbackResult {
            model_id: model_id.to_string(),
            target_version_id: target_version_id.to_string(),
            previous_version_id: previous,
            backup_created,
        })
    }
}
