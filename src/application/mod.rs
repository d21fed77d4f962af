pub mod control_plane;
pub mod evaluation;
pub mod events;
pub mod locks;
pub mod promotion;
pub mod registry;
pub mod rollback;
pub mod run_manager;
pub mod soft_labels;

pub use control_plane::ControlPlane;
pub use evaluation::{EvaluationConfig, EvaluationRecorder};
pub use events::{EventBus, ResourceSample, WorkerEvent};
pub use locks::KeyedLocks;
pub use promotion::{GuardrailCheck, Guardrails, PromotionGuard, PromotionResult};
pub use registry::{ArtifactDescriptor, VersionRegistry};
pub use rollback::{RollbackCoordinator, RollbackResult};
pub use run_manager::{RunContext, RunSpec, StartOptions, TrainingRunManager};
pub use soft_labels::{
    prompt_hash, SoftLabelCache, SoftLabelGenerationResult, SoftLabelKind, TeacherClient,
    TeacherOutput,
};
