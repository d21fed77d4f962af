//! Content-addressed cache of teacher-model outputs.
//!
//! Teacher calls are the expensive part of distillation data prep, so every
//! output is stored once per `(teacher_model_id, prompt_hash)` and reused.
//! Generation is per-prompt independent: one bad prompt is reported, not
//! fatal to the batch.

use crate::domain::error::{AppError, Result};
use crate::domain::training::SoftLabelPayload;
use crate::infrastructure::db::repositories::{
    ModelRepository, SoftLabel, SoftLabelInput, SoftLabelRepository, TrainingDb,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftLabelKind {
    Logits,
    OneHot,
    TextOnly,
}

impl SoftLabelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SoftLabelKind::Logits => "logits",
            SoftLabelKind::OneHot => "one_hot",
            SoftLabelKind::TextOnly => "text_only",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TeacherOutput {
    pub text: String,
    pub payload: SoftLabelPayload,
}

/// Boundary to the actual teacher model (local inference or remote API).
/// The cache only ever calls this on a confirmed miss.
#[async_trait]
pub trait TeacherClient: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        temperature: f64,
        kind: SoftLabelKind,
    ) -> Result<TeacherOutput>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoftLabelGenerationResult {
    pub soft_label_ids: Vec<String>,
    pub cached_count: usize,
    pub generated_count: usize,
    pub failed_count: usize,
    pub errors: Vec<SoftLabelError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoftLabelError {
    pub prompt_index: usize,
    pub message: String,
}

/// Stable dedup key: SHA-256 over the whitespace-normalized prompt, so
/// incidental formatting differences still hit the cache.
pub fn prompt_hash(prompt: &str) -> String {
    let normalized = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

pub struct SoftLabelCache {
    db: TrainingDb,
    teacher: Arc<dyn TeacherClient>,
}

impl SoftLabelCache {
    pub fn new(db: TrainingDb, teacher: Arc<dyn TeacherClient>) -> Self {
        Self { db, teacher }
    }

    pub async fn generate(
        &self,
        prompts: &[String],
        teacher_model_id: &str,
        temperature: f64,
        kind: SoftLabelKind,
    ) -> Result<SoftLabelGenerationResult> {
        if !(temperature > 0.0) {
            return Err(AppError::ValidationError(
                "Temperature must be positive".to_string(),
            ));
        }
        ModelRepository::new(&self.db).get(teacher_model_id).await?;

        let labels = SoftLabelRepository::new(&self.db);
        let mut result = SoftLabelGenerationResult {
            soft_label_ids: Vec::new(),
            cached_count: 0,
            generated_count: 0,
            failed_count: 0,
            errors: Vec::new(),
        };

        for (index, prompt) in prompts.iter().enumerate() {
            let hash = prompt_hash(prompt);

            match labels.find_by_teacher_and_hash(teacher_model_id, &hash).await? {
                Some(existing) => {
                    debug!(teacher_model_id, hash, "soft label cache hit");
                    result.soft_label_ids.push(existing.soft_label_id);
                    result.cached_count += 1;
                    continue;
                }
                None => {}
            }

            let output = match self.teacher.generate(prompt, temperature, kind).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(teacher_model_id, prompt_index = index, "teacher call failed: {e}");
                    result.failed_count += 1;
                    result.errors.push(SoftLabelError {
                        prompt_index: index,
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            if output.payload.type_name() != kind.as_str() {
                result.failed_count += 1;
                result.errors.push(SoftLabelError {
                    prompt_index: index,
                    message: format!(
                        "Teacher returned {} payload, expected {}",
                        output.payload.type_name(),
                        kind.as_str()
                    ),
                });
                continue;
            }

            let input = SoftLabelInput {
                soft_label_id: Uuid::new_v4().to_string(),
                prompt: prompt.clone(),
                prompt_hash: hash,
                teacher_model_id: teacher_model_id.to_string(),
                teacher_output: output.text,
                payload: output.payload,
                temperature,
                metadata_json: None,
            };
            // A concurrent writer may have stored the same key between our
            // lookup and this insert; either way the stored row wins and the
            // race is counted as a hit.
            let (stored, inserted) = labels.insert_if_absent(&input).await?;
            result.soft_label_ids.push(stored.soft_label_id);
            if inserted {
                result.generated_count += 1;
            } else {
                result.cached_count += 1;
            }
        }

        Ok(result)
    }

    pub async fn link_to_run(&self, run_id: &str, soft_label_ids: &[String]) -> Result<()> {
        let labels = SoftLabelRepository::new(&self.db);
        for id in soft_label_ids {
            labels.link_run(run_id, id).await?;
        }
        Ok(())
    }

    pub async fn link_to_correction(
        &self,
        correction_id: &str,
        soft_label_ids: &[String],
    ) -> Result<()> {
        let labels = SoftLabelRepository::new(&self.db);
        for id in soft_label_ids {
            labels.link_correction(correction_id, id).await?;
        }
        Ok(())
    }

    /// JSONL export for a trainer that wants the cached labels on disk.
    /// Binary distributions travel base64-encoded.
    pub async fn export_jsonl(&self, teacher_model_id: &str) -> Result<String> {
        let labels = SoftLabelRepository::new(&self.db);
        let rows = labels.list_for_teacher(teacher_model_id).await?;
        render_jsonl(&rows)
    }

    pub async fn export_run_jsonl(&self, run_id: &str) -> Result<String> {
        let labels = SoftLabelRepository::new(&self.db);
        let rows = labels.list_for_run(run_id).await?;
        render_jsonl(&rows)
    }
}

fn render_jsonl(rows: &[SoftLabel]) -> Result<String> {
    let mut out = String::new();
    for label in rows {
        let line = serde_json::json!({
            "soft_label_id": label.soft_label_id,
            "prompt": label.prompt,
            "prompt_hash": label.prompt_hash,
            "teacher_model_id": label.teacher_model_id,
            "teacher_output": label.teacher_output,
            "soft_label_type": label.payload.type_name(),
            "soft_labels_b64": label.payload.blob().map(|b| BASE64.encode(b)),
            "temperature": label.temperature,
        });
        let encoded = serde_json::to_string(&line)
            .map_err(|e| AppError::Internal(format!("Failed to encode soft label: {e}")))?;
        out.push_str(&encoded);
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_normalizes_whitespace() {
        assert_eq!(prompt_hash("a  b\n c"), prompt_hash("a b c"));
        assert_ne!(prompt_hash("a b c"), prompt_hash("a b d"));
    }

    #[test]
    fn hash_is_hex_sha256() {
        assert_eq!(prompt_hash("x").len(), 64);
    }
}
