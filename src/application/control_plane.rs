//! The command surface of the control plane.
//!
//! One facade owning every component, constructed once per process from a
//! [`ControlPlaneConfig`]. All state is explicit here; there is no global
//! singleton behind these methods.

use crate::application::events::{EventBus, WorkerEvent};
use crate::application::evaluation::{EvaluationConfig, EvaluationRecorder};
use crate::application::locks::KeyedLocks;
use crate::application::promotion::{Guardrails, PromotionGuard, PromotionResult};
use crate::application::registry::{ArtifactDescriptor, VersionRegistry};
use crate::application::rollback::{RollbackCoordinator, RollbackResult};
use crate::application::run_manager::{RunContext, RunSpec, StartOptions, TrainingRunManager};
use crate::application::soft_labels::{
    SoftLabelCache, SoftLabelGenerationResult, SoftLabelKind, TeacherClient,
};
use crate::domain::error::Result;
use crate::infrastructure::artifact_store::{ensure_daily_backup, ArtifactLayout, BackupConfig};
use crate::infrastructure::config::ControlPlaneConfig;
use crate::infrastructure::db::repositories::{
    Correction, CorrectionInput, CorrectionRepository, Dataset, DatasetInput, DatasetItem,
    DatasetItemInput, DatasetRepository, EvaluationMetric, Model, ModelInput, ModelRepository,
    ModelVersion, RunArtifact, RunArtifactsRepository, RunCorrectionsRepository,
    RunDatasetsRepository, RunSelection, Tag, TagRepository, TrainingDb, TrainingLog,
    TrainingLogRepository, TrainingRun, TrainingRunRepository,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

pub struct ControlPlane {
    db: TrainingDb,
    events: Arc<EventBus>,
    registry: VersionRegistry,
    runs: TrainingRunManager,
    promotion: PromotionGuard,
    rollback: RollbackCoordinator,
    soft_labels: SoftLabelCache,
    evaluations: EvaluationRecorder,
}

impl ControlPlane {
    /// Connect the database, prepare the on-disk layout and take the daily
    /// backup if one is due.
    pub async fn connect(
        config: ControlPlaneConfig,
        teacher: Arc<dyn TeacherClient>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            crate::domain::error::AppError::IoError(format!(
                "Failed to create data dir {}: {e}",
                config.data_dir.display()
            ))
        })?;

        let db = TrainingDb::connect(&config.db_path()).await?;
        ArtifactLayout::new(&config.data_dir).ensure()?;

        let backup_config = BackupConfig::new(&config.data_dir, config.max_daily_backups);
        if let Err(e) = ensure_daily_backup(&config.db_path(), &backup_config) {
            warn!("daily backup skipped: {e}");
        }

        let events = Arc::new(EventBus::new());
        let model_locks = Arc::new(KeyedLocks::new());

        Ok(Self {
            registry: VersionRegistry::new(&db),
            runs: TrainingRunManager::new(db.clone(), config.clone(), events.clone()),
            promotion: PromotionGuard::new(db.clone(), config.clone(), model_locks.clone()),
            rollback: RollbackCoordinator::new(db.clone(), config.clone(), model_locks),
            soft_labels: SoftLabelCache::new(db.clone(), teacher),
            evaluations: EvaluationRecorder::new(db.clone(), config, events.clone()),
            db,
            events,
        })
    }

    // --- models & versions ---

    pub async fn register_model(&self, model: &ModelInput) -> Result<Model> {
        let models = ModelRepository::new(&self.db);
        models.insert(model).await?;
        models.get(&model.model_id).await
    }

    pub async fn register_version(
        &self,
        run_id: Option<&str>,
        model_id: &str,
        parent_version_id: Option<&str>,
        artifact: ArtifactDescriptor,
        notes: Option<String>,
    ) -> Result<ModelVersion> {
        self.registry
            .register_version(run_id, model_id, parent_version_id, artifact, notes)
            .await
    }

    pub async fn list_model_versions(&self, model_id: &str) -> Result<Vec<ModelVersion>> {
        self.registry.list_versions(model_id).await
    }

    pub async fn get_active_version(&self, model_id: &str) -> Result<Option<ModelVersion>> {
        self.registry.get_active(model_id).await
    }

    pub async fn version_lineage(
        &self,
        version_id: &str,
        limit: usize,
    ) -> Result<Vec<ModelVersion>> {
        self.registry.lineage(version_id, limit).await
    }

    // --- training runs ---

    pub async fn create_run(&self, spec: RunSpec) -> Result<String> {
        self.runs.create_run(spec).await
    }

    pub async fn start_training(&self, run_id: &str, options: StartOptions) -> Result<RunContext> {
        self.runs.start(run_id, options).await
    }

    pub async fn cancel_training(&self, run_id: &str) -> Result<()> {
        self.runs.cancel(run_id).await
    }

    pub async fn get_run(&self, run_id: &str) -> Result<TrainingRun> {
        TrainingRunRepository::new(&self.db).get(run_id).await
    }

    /// The frozen data selection of a run: (corrections, datasets).
    pub async fn run_selections(
        &self,
        run_id: &str,
    ) -> Result<(Vec<RunSelection>, Vec<RunSelection>)> {
        let corrections = RunCorrectionsRepository::new(&self.db)
            .list_for_run(run_id)
            .await?;
        let datasets = RunDatasetsRepository::new(&self.db)
            .list_for_run(run_id)
            .await?;
        Ok((corrections, datasets))
    }

    pub async fn list_recent_runs(&self, limit: i64) -> Result<Vec<TrainingRun>> {
        TrainingRunRepository::new(&self.db).list_recent(limit).await
    }

    /// Per-step telemetry of a run, chronological, at most `limit` rows.
    pub async fn run_logs(&self, run_id: &str, limit: i64) -> Result<Vec<TrainingLog>> {
        TrainingLogRepository::new(&self.db)
            .list_for_run(run_id, limit)
            .await
    }

    pub async fn run_artifacts(&self, run_id: &str) -> Result<Vec<RunArtifact>> {
        RunArtifactsRepository::new(&self.db).list_for_run(run_id).await
    }

    /// Delete a terminal run and all of its dependent rows. Runs that are
    /// still queued or running must be cancelled first.
    pub async fn delete_run(&self, run_id: &str) -> Result<u64> {
        let runs = TrainingRunRepository::new(&self.db);
        let run = runs.get(run_id).await?;
        if !run.status.is_terminal() {
            return Err(crate::domain::error::AppError::ValidationError(format!(
                "Run {} is {}, only finished runs can be deleted",
                run_id,
                run.status.as_db()
            )));
        }
        runs.delete(run_id).await
    }

    // --- training corpus ---

    pub async fn record_correction(&self, correction: &CorrectionInput) -> Result<Correction> {
        let corrections = CorrectionRepository::new(&self.db);
        corrections.insert(correction).await?;
        corrections.get(&correction.correction_id).await
    }

    pub async fn list_recent_corrections(&self, limit: i64) -> Result<Vec<Correction>> {
        CorrectionRepository::new(&self.db).list_recent(limit).await
    }

    pub async fn delete_correction(&self, correction_id: &str) -> Result<u64> {
        CorrectionRepository::new(&self.db).delete(correction_id).await
    }

    /// Get-or-create the tag and attach it to the correction.
    pub async fn tag_correction(&self, correction_id: &str, tag_name: &str) -> Result<Tag> {
        CorrectionRepository::new(&self.db).get(correction_id).await?;
        let tags = TagRepository::new(&self.db);
        let tag = tags.ensure(tag_name).await?;
        tags.attach(correction_id, tag.tag_id).await?;
        Ok(tag)
    }

    pub async fn correction_tags(&self, correction_id: &str) -> Result<Vec<Tag>> {
        TagRepository::new(&self.db)
            .list_for_correction(correction_id)
            .await
    }

    pub async fn create_dataset(&self, dataset: &DatasetInput) -> Result<Dataset> {
        let datasets = DatasetRepository::new(&self.db);
        datasets.insert(dataset).await?;
        datasets.get(&dataset.dataset_id).await
    }

    pub async fn list_datasets(&self) -> Result<Vec<Dataset>> {
        DatasetRepository::new(&self.db).list_all().await
    }

    pub async fn add_dataset_item(&self, item: &DatasetItemInput) -> Result<()> {
        DatasetRepository::new(&self.db).insert_item(item).await
    }

    pub async fn list_dataset_items(&self, dataset_id: &str) -> Result<Vec<DatasetItem>> {
        DatasetRepository::new(&self.db).list_items(dataset_id).await
    }

    pub async fn delete_dataset(&self, dataset_id: &str) -> Result<u64> {
        DatasetRepository::new(&self.db).delete(dataset_id).await
    }

    // --- promotion & rollback ---

    pub async fn promote_version(
        &self,
        model_id: &str,
        version_id: &str,
        guardrails: &Guardrails,
    ) -> Result<PromotionResult> {
        self.promotion.promote(model_id, version_id, guardrails).await
    }

    pub async fn rollback_version(
        &self,
        model_id: &str,
        target_version_id: &str,
    ) -> Result<RollbackResult> {
        self.rollback.rollback(model_id, target_version_id).await
    }

    // --- evaluation ---

    pub async fn evaluate_version(
        &self,
        version_id: &str,
        dataset_id: &str,
        config: &EvaluationConfig,
    ) -> Result<String> {
        self.evaluations.evaluate(version_id, dataset_id, config).await
    }

    pub async fn cancel_evaluation(&self, eval_id: &str) -> Result<()> {
        self.evaluations.cancel(eval_id).await
    }

    pub async fn list_version_metrics(&self, version_id: &str) -> Result<Vec<EvaluationMetric>> {
        self.evaluations.list_metrics(version_id).await
    }

    // --- soft labels ---

    pub async fn generate_soft_labels(
        &self,
        prompts: &[String],
        teacher_model_id: &str,
        temperature: f64,
        kind: SoftLabelKind,
    ) -> Result<SoftLabelGenerationResult> {
        self.soft_labels
            .generate(prompts, teacher_model_id, temperature, kind)
            .await
    }

    pub fn soft_labels(&self) -> &SoftLabelCache {
        &self.soft_labels
    }

    // --- events ---

    /// Subscribe to the event stream of a run or evaluation.
    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe(job_id)
    }

    pub fn db(&self) -> &TrainingDb {
        &self.db
    }
}
