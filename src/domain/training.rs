//! Core typed entities of the distillation control plane.
use crate::domain::error::{AppError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMethod {
    FineTune,
    KnowledgeDistillation,
    Hybrid,
}

impl TrainingMethod {
    pub fn as_db(&self) -> &'static str {
        match self {
            TrainingMethod::FineTune => "fine_tune",
            TrainingMethod::KnowledgeDistillation => "knowledge_distillation",
            TrainingMethod::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

impl TrainingStatus {
    pub fn as_db(&self) -> &'static str {
        match self {
            TrainingStatus::Queued => "queued",
            TrainingStatus::Running => "running",
            TrainingStatus::Completed => "completed",
            TrainingStatus::Failed => "failed",
            TrainingStatus::Cancelled => "cancelled",
            TrainingStatus::RolledBack => "rolled_back",
        }
    }

    pub fn from_db(value: &str) -> Result<Self> {
        match value {
            "queued" => Ok(TrainingStatus::Queued),
            "running" => Ok(TrainingStatus::Running),
            "completed" => Ok(TrainingStatus::Completed),
            "failed" => Ok(TrainingStatus::Failed),
            "cancelled" => Ok(TrainingStatus::Cancelled),
            "rolled_back" => Ok(TrainingStatus::RolledBack),
            other => Err(AppError::ValidationError(format!(
                "Unknown training status: {other}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TrainingStatus::Completed
                | TrainingStatus::Failed
                | TrainingStatus::Cancelled
                | TrainingStatus::RolledBack
        )
    }

    /// Legal forward transitions of the run state machine. `RolledBack` is a
    /// post-hoc annotation applied to completed runs, not a transition source.
    pub fn can_transition_to(&self, next: TrainingStatus) -> bool {
        match (self, next) {
            (TrainingStatus::Queued, TrainingStatus::Running) => true,
            (TrainingStatus::Queued, TrainingStatus::Cancelled) => true,
            (TrainingStatus::Queued, TrainingStatus::Failed) => true,
            (TrainingStatus::Running, TrainingStatus::Completed) => true,
            (TrainingStatus::Running, TrainingStatus::Failed) => true,
            (TrainingStatus::Running, TrainingStatus::Cancelled) => true,
            (TrainingStatus::Completed, TrainingStatus::RolledBack) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub fn as_db(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }

    pub fn from_db(value: &str) -> Result<Self> {
        match value {
            "train" => Ok(Split::Train),
            "val" => Ok(Split::Val),
            "test" => Ok(Split::Test),
            other => Err(AppError::ValidationError(format!("Unknown split: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelProvider {
    Local,
    Api,
}

impl ModelProvider {
    pub fn as_db(&self) -> &'static str {
        match self {
            ModelProvider::Local => "local",
            ModelProvider::Api => "api",
        }
    }

    pub fn from_db(value: &str) -> Result<Self> {
        match value {
            "local" => Ok(ModelProvider::Local),
            "api" => Ok(ModelProvider::Api),
            other => Err(AppError::ValidationError(format!(
                "Unknown model provider: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Config,
    Log,
    Checkpoint,
    Adapter,
    MergedModel,
    Gguf,
}

impl ArtifactKind {
    pub fn as_db(&self) -> &'static str {
        match self {
            ArtifactKind::Config => "config",
            ArtifactKind::Log => "log",
            ArtifactKind::Checkpoint => "checkpoint",
            ArtifactKind::Adapter => "adapter",
            ArtifactKind::MergedModel => "merged_model",
            ArtifactKind::Gguf => "gguf",
        }
    }

    /// Maps a worker-reported artifact kind onto the stored taxonomy.
    /// Workers sometimes emit legacy aliases ("model", "result").
    pub fn from_worker(value: &str) -> Option<Self> {
        match value {
            "config" => Some(ArtifactKind::Config),
            "log" | "result" => Some(ArtifactKind::Log),
            "checkpoint" => Some(ArtifactKind::Checkpoint),
            "adapter" => Some(ArtifactKind::Adapter),
            "merged_model" | "model" => Some(ArtifactKind::MergedModel),
            "gguf" => Some(ArtifactKind::Gguf),
            _ => None,
        }
    }
}

/// Teacher output payload, chosen at construction time. The store encodes it
/// as a `soft_label_type` column plus a nullable blob, but the invalid
/// combinations (a blob on a text-only label, a logits label without one)
/// cannot be represented here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "blob", rename_all = "snake_case")]
pub enum SoftLabelPayload {
    /// Full distribution, serialized float32 array `[seq_len, vocab_size]`.
    Logits(Vec<u8>),
    /// One-hot token targets.
    OneHot(Vec<u8>),
    /// Text completion only, no distribution available.
    TextOnly,
}

impl SoftLabelPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            SoftLabelPayload::Logits(_) => "logits",
            SoftLabelPayload::OneHot(_) => "one_hot",
            SoftLabelPayload::TextOnly => "text_only",
        }
    }

    pub fn blob(&self) -> Option<&[u8]> {
        match self {
            SoftLabelPayload::Logits(b) | SoftLabelPayload::OneHot(b) => Some(b),
            SoftLabelPayload::TextOnly => None,
        }
    }

    /// Reassemble from the stored column pair.
    pub fn from_parts(type_name: &str, blob: Option<Vec<u8>>) -> Result<Self> {
        match (type_name, blob) {
            ("logits", Some(b)) => Ok(SoftLabelPayload::Logits(b)),
            ("one_hot", Some(b)) => Ok(SoftLabelPayload::OneHot(b)),
            ("text_only", None) => Ok(SoftLabelPayload::TextOnly),
            ("logits", None) | ("one_hot", None) => Err(AppError::ValidationError(format!(
                "Soft label of type {type_name} is missing its distribution blob"
            ))),
            ("text_only", Some(_)) => Err(AppError::ValidationError(
                "Text-only soft label must not carry a blob".to_string(),
            )),
            (other, _) => Err(AppError::ValidationError(format!(
                "Unknown soft label type: {other}"
            ))),
        }
    }
}

/// Typed training hyperparameters, parsed once at the command boundary.
///
/// `schema_version` is the migration hook: bump it when the shape changes and
/// teach `parse` to upgrade older payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hyperparams {
    #[serde(default = "Hyperparams::current_schema_version")]
    pub schema_version: u32,
    pub learning_rate: Option<f64>,
    pub batch_size: Option<i64>,
    pub epochs: Option<i64>,
    pub max_steps: Option<i64>,
    pub warmup_steps: Option<i64>,
    pub gradient_accumulation: Option<i64>,
    pub lora_rank: Option<i64>,
    /// Distillation softmax temperature.
    pub distill_temperature: Option<f64>,
    /// Blend between distillation loss and hard-label loss.
    pub distill_alpha: Option<f64>,
}

impl Default for Hyperparams {
    fn default() -> Self {
        Self {
            schema_version: Self::SCHEMA_VERSION,
            learning_rate: None,
            batch_size: None,
            epochs: None,
            max_steps: None,
            warmup_steps: None,
            gradient_accumulation: None,
            lora_rank: None,
            distill_temperature: None,
            distill_alpha: None,
        }
    }
}

impl Hyperparams {
    pub const SCHEMA_VERSION: u32 = 1;

    fn current_schema_version() -> u32 {
        Self::SCHEMA_VERSION
    }

    pub fn parse(json: &str) -> Result<Self> {
        let parsed: Hyperparams = serde_json::from_str(json)
            .map_err(|e| AppError::ValidationError(format!("Invalid hyperparams: {e}")))?;
        if parsed.schema_version == 0 || parsed.schema_version > Self::SCHEMA_VERSION {
            return Err(AppError::ValidationError(format!(
                "Unsupported hyperparams schema version: {}",
                parsed.schema_version
            )));
        }
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(lr) = self.learning_rate {
            if !(lr > 0.0) {
                return Err(AppError::ValidationError(
                    "learning_rate must be positive".to_string(),
                ));
            }
        }
        if let Some(alpha) = self.distill_alpha {
            if !(0.0..=1.0).contains(&alpha) {
                return Err(AppError::ValidationError(
                    "distill_alpha must be within [0, 1]".to_string(),
                ));
            }
        }
        for (name, value) in [
            ("batch_size", self.batch_size),
            ("epochs", self.epochs),
            ("max_steps", self.max_steps),
            ("lora_rank", self.lora_rank),
        ] {
            if let Some(v) = value {
                if v <= 0 {
                    return Err(AppError::ValidationError(format!(
                        "{name} must be positive"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| AppError::Internal(format!("Failed to serialize hyperparams: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions() {
        assert!(TrainingStatus::Queued.can_transition_to(TrainingStatus::Running));
        assert!(TrainingStatus::Running.can_transition_to(TrainingStatus::Completed));
        assert!(TrainingStatus::Running.can_transition_to(TrainingStatus::Cancelled));
        assert!(TrainingStatus::Completed.can_transition_to(TrainingStatus::RolledBack));
        assert!(!TrainingStatus::Completed.can_transition_to(TrainingStatus::Running));
        assert!(!TrainingStatus::Failed.can_transition_to(TrainingStatus::Completed));
        assert!(!TrainingStatus::Cancelled.can_transition_to(TrainingStatus::Running));
    }

    #[test]
    fn soft_label_payload_round_trip() {
        let payload = SoftLabelPayload::Logits(vec![1, 2, 3]);
        let rebuilt =
            SoftLabelPayload::from_parts(payload.type_name(), payload.blob().map(|b| b.to_vec()))
                .unwrap();
        assert_eq!(payload, rebuilt);

        assert!(SoftLabelPayload::from_parts("logits", None).is_err());
        assert!(SoftLabelPayload::from_parts("text_only", Some(vec![1])).is_err());
        assert!(SoftLabelPayload::from_parts("nope", None).is_err());
    }

    #[test]
    fn hyperparams_parse_defaults_version() {
        let hp = Hyperparams::parse(r#"{"learningRate": 0.0003, "batchSize": 8}"#).unwrap();
        assert_eq!(hp.schema_version, Hyperparams::SCHEMA_VERSION);
        assert_eq!(hp.learning_rate, Some(0.0003));
    }

    #[test]
    fn hyperparams_rejects_bad_values() {
        assert!(Hyperparams::parse(r#"{"learningRate": -1.0}"#).is_err());
        assert!(Hyperparams::parse(r#"{"distillAlpha": 1.5}"#).is_err());
        assert!(Hyperparams::parse(r#"{"schemaVersion": 99}"#).is_err());
        assert!(Hyperparams::parse("not json").is_err());
    }
}
