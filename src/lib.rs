//! Model-distillation control plane.
//!
//! Orchestrates training runs that turn corrections and soft labels into new
//! model versions, tracks version lineage, enforces a single active version
//! per model, gates promotion behind guardrails, and supports safe rollback.
//! The numerical training itself happens in external worker processes; this
//! crate supervises them.

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::{
    ArtifactDescriptor, ControlPlane, EvaluationConfig, EventBus, GuardrailCheck, Guardrails,
    PromotionResult, RollbackResult, RunContext, RunSpec, SoftLabelGenerationResult, SoftLabelKind,
    StartOptions, TeacherClient, TeacherOutput, WorkerEvent,
};
pub use domain::error::{AppError, Result};
pub use domain::training::{
    ArtifactKind, Hyperparams, ModelProvider, SoftLabelPayload, Split, TrainingMethod,
    TrainingStatus,
};
pub use infrastructure::config::ControlPlaneConfig;
pub use infrastructure::db::repositories::{
    EvaluationMetric, Model, ModelInput, ModelVersion, RunSelection, TrainingRun,
};

/// Install the default log subscriber. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
}
