mod active_versions;
mod corrections;
mod datasets;
mod db;
mod evaluation_metrics;
mod model_versions;
mod models;
mod run_artifacts;
mod run_corrections;
mod run_datasets;
mod soft_labels;
mod tags;
mod training_logs;
mod training_runs;

pub use active_versions::ActiveVersionRepository;
pub use corrections::{Correction, CorrectionInput, CorrectionRepository};
pub use datasets::{Dataset, DatasetInput, DatasetItem, DatasetItemInput, DatasetRepository};
pub use db::TrainingDb;
pub use evaluation_metrics::{EvaluationMetric, EvaluationMetricInput, EvaluationMetricsRepository};
pub use model_versions::{ModelVersion, ModelVersionInput, ModelVersionRepository};
pub use models::{Model, ModelInput, ModelRepository};
pub use run_artifacts::{RunArtifact, RunArtifactInput, RunArtifactsRepository};
pub use run_corrections::{RunCorrectionsRepository, RunSelection};
pub use run_datasets::RunDatasetsRepository;
pub use soft_labels::{SoftLabel, SoftLabelInput, SoftLabelRepository};
pub use tags::{Tag, TagRepository};
pub use training_logs::{TrainingLog, TrainingLogInput, TrainingLogRepository};
pub use training_runs::{TrainingRun, TrainingRunInput, TrainingRunRepository};
