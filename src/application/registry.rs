//! Version registry: lineage and artifact metadata for model versions.
//!
//! The registry records versions and answers "which version is live", but it
//! never moves the active pointer itself. Promotion and rollback own that.

use crate::domain::error::{AppError, Result};
use crate::infrastructure::artifact_store::sha256_hex_file;
use crate::infrastructure::db::repositories::{
    ActiveVersionRepository, ModelRepository, ModelVersion, ModelVersionInput,
    ModelVersionRepository, TrainingDb,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactDescriptor {
    pub path: String,
    pub hash: Option<String>,
    pub size_bytes: Option<i64>,
}

pub struct VersionRegistry {
    models: ModelRepository,
    versions: ModelVersionRepository,
    actives: ActiveVersionRepository,
}

impl VersionRegistry {
    pub fn new(db: &TrainingDb) -> Self {
        Self {
            models: ModelRepository::new(db),
            versions: ModelVersionRepository::new(db),
            actives: ActiveVersionRepository::new(db),
        }
    }

    /// Register the version produced by a run. The artifact must exist on
    /// disk; a missing hash is computed here so every registered version is
    /// fingerprinted.
    pub async fn register_version(
        &self,
        run_id: Option<&str>,
        model_id: &str,
        parent_version_id: Option<&str>,
        artifact: ArtifactDescriptor,
        notes: Option<String>,
    ) -> Result<ModelVersion> {
        self.models.get(model_id).await?;

        if artifact.path.trim().is_empty() {
            return Err(AppError::ValidationError(
                "Artifact path is required to register a version".to_string(),
            ));
        }
        let path = Path::new(&artifact.path);
        if !path.exists() {
            return Err(AppError::ValidationError(format!(
                "Artifact does not exist: {}",
                artifact.path
            )));
        }

        if let Some(parent_id) = parent_version_id {
            let parent = self.versions.get(parent_id).await?;
            if parent.model_id != model_id {
                return Err(AppError::ValidationError(format!(
                    "Parent version {} belongs to a different model",
                    parent_id
                )));
            }
        }

        let hash = match artifact.hash {
            Some(h) => h,
            None => sha256_hex_file(path)?,
        };
        let size_bytes = match artifact.size_bytes {
            Some(s) => Some(s),
            None => path.metadata().ok().map(|m| m.len() as i64),
        };

        let version_id = Uuid::new_v4().to_string();
        let input = ModelVersionInput {
            version_id: version_id.clone(),
            model_id: model_id.to_string(),
            run_id: run_id.map(|r| r.to_string()),
            parent_version_id: parent_version_id.map(|p| p.to_string()),
            artifact_path: artifact.path,
            artifact_hash: Some(hash),
            artifact_size_bytes: size_bytes,
            notes,
        };
        self.versions.insert(&input).await?;

        info!(version_id, model_id, "registered model version");
        self.versions.get(&version_id).await
    }

    pub async fn get_active(&self, model_id: &str) -> Result<Option<ModelVersion>> {
        match self.actives.get_active_version_id(model_id).await? {
            Some(version_id) => Ok(Some(self.versions.get(&version_id).await?)),
            None => Ok(None),
        }
    }

    /// Newest first.
    pub async fn list_versions(&self, model_id: &str) -> Result<Vec<ModelVersion>> {
        self.versions.list_by_model(model_id).await
    }

    pub async fn get_version(&self, version_id: &str) -> Result<ModelVersion> {
        self.versions.get(version_id).await
    }

    pub async fn find_by_run(&self, run_id: &str) -> Result<Option<ModelVersion>> {
        self.versions.find_by_run_id(run_id).await
    }

    /// Parent chain of a version, nearest ancestor first.
    pub async fn lineage(&self, version_id: &str, limit: usize) -> Result<Vec<ModelVersion>> {
        self.versions.ancestry(version_id, limit).await
    }
}
