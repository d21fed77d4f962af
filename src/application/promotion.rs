//! Promotion guard: guardrail evaluation plus the atomic pointer swap.
//!
//! A failed guardrail is not an error. The caller gets the full per-metric
//! report with `success: false` and nothing in the store changes; only
//! malformed requests and unknown references are rejected up front.

use crate::application::locks::KeyedLocks;
use crate::domain::error::{AppError, Result};
use crate::infrastructure::artifact_store::{backup_before_promotion, BackupConfig};
use crate::infrastructure::config::ControlPlaneConfig;
use crate::infrastructure::db::repositories::{
    ActiveVersionRepository, EvaluationMetric, EvaluationMetricsRepository, ModelVersionRepository,
    TrainingDb,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

pub const METRIC_EXACT_MATCH: &str = "exact_match";
pub const METRIC_BLEU: &str = "bleu";
pub const METRIC_F1: &str = "f1";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Guardrails {
    pub min_exact_match: Option<f64>,
    pub min_bleu: Option<f64>,
    pub min_f1: Option<f64>,
    #[serde(default)]
    pub require_evaluation: bool,
    #[serde(default)]
    pub force: bool,
}

impl Guardrails {
    fn thresholds(&self) -> Vec<(&'static str, f64)> {
        [
            (METRIC_EXACT_MATCH, self.min_exact_match),
            (METRIC_BLEU, self.min_bleu),
            (METRIC_F1, self.min_f1),
        ]
        .into_iter()
        .filter_map(|(name, min)| min.map(|m| (name, m)))
        .collect()
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in self.thresholds() {
            if !(0.0..=1.0).contains(&value) {
                return Err(AppError::ValidationError(format!(
                    "Guardrail threshold {name} must be within [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailCheck {
    pub metric_name: String,
    pub required: f64,
    pub actual: Option<f64>,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionResult {
    pub success: bool,
    pub guardrail_checks: Vec<GuardrailCheck>,
    pub previous_version_id: Option<String>,
}

pub struct PromotionGuard {
    db: TrainingDb,
    config: Arc<ControlPlaneConfig>,
    model_locks: Arc<KeyedLocks>,
}

impl PromotionGuard {
    pub fn new(db: TrainingDb, config: Arc<ControlPlaneConfig>, model_locks: Arc<KeyedLocks>) -> Self {
        Self {
            db,
            config,
            model_locks,
        }
    }

    pub async fn promote(
        &self,
        model_id: &str,
        candidate_version_id: &str,
        guardrails: &Guardrails,
    ) -> Result<PromotionResult> {
        guardrails.validate()?;

        let versions = ModelVersionRepository::new(&self.db);
        let candidate = versions.get(candidate_version_id).await?;
        if candidate.model_id != model_id {
            return Err(AppError::ValidationError(format!(
                "Version {} does not belong to model {}",
                candidate_version_id, model_id
            )));
        }
        if !versions.verify_artifact_exists(candidate_version_id).await? {
            return Err(AppError::ValidationError(format!(
                "Artifact for version {} is missing on disk",
                candidate_version_id
            )));
        }

        let metrics = self.load_guardrail_metrics(candidate_version_id).await?;
        let checks = evaluate_guardrails(guardrails, &metrics);

        if guardrails.require_evaluation && metrics.is_empty() && !guardrails.force {
            warn!(model_id, candidate_version_id, "promotion blocked: no evaluation data");
            return Ok(PromotionResult {
                success: false,
                guardrail_checks: checks,
                previous_version_id: None,
            });
        }

        let all_passed = checks.iter().all(|c| c.passed);
        if !all_passed && !guardrails.force {
            warn!(model_id, candidate_version_id, "promotion blocked by guardrails");
            return Ok(PromotionResult {
                success: false,
                guardrail_checks: checks,
                previous_version_id: None,
            });
        }

        // Swap under the model lock so concurrent promote/rollback on the
        // same model serialize around the pointer.
        let lock = self.model_locks.get(model_id);
        let _guard = lock.lock().await;

        let backup_config = BackupConfig::new(&self.config.data_dir, self.config.max_daily_backups);
        if let Err(e) =
            backup_before_promotion(&self.config.db_path(), &backup_config, candidate_version_id)
        {
            warn!(model_id, "pre-promotion backup failed: {e}");
        }

        let actives = ActiveVersionRepository::new(&self.db);
        let previous = actives
            .swap_active(model_id, candidate_version_id, false)
            .await?;

        info!(
            model_id,
            candidate_version_id,
            previous = previous.as_deref().unwrap_or("none"),
            "promoted version"
        );
        Ok(PromotionResult {
            success: true,
            guardrail_checks: checks,
            previous_version_id: previous,
        })
    }

    /// Metrics that gate promotion. With a configured guardrail dataset only
    /// that dataset's rows count; otherwise every recorded metric for the
    /// candidate does.
    async fn load_guardrail_metrics(&self, version_id: &str) -> Result<Vec<EvaluationMetric>> {
        let metrics = EvaluationMetricsRepository::new(&self.db);
        match &self.config.guardrail_dataset_id {
            Some(dataset_id) => {
                metrics
                    .list_for_version_and_dataset(version_id, dataset_id)
                    .await
            }
            None => metrics.list_for_version(version_id).await,
        }
    }
}

fn evaluate_guardrails(guardrails: &Guardrails, metrics: &[EvaluationMetric]) -> Vec<GuardrailCheck> {
    guardrails
        .thresholds()
        .into_iter()
        .map(|(name, required)| {
            let actual = metrics
                .iter()
                .find(|m| m.metric_name == name)
                .map(|m| m.metric_value);
            GuardrailCheck {
                metric_name: name.to_string(),
                required,
                actual,
                passed: actual.map(|a| a >= required).unwrap_or(false),
            }
        })
        .collect()
}
