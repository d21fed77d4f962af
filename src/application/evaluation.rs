//! Evaluation supervision and metric recording.
//!
//! An evaluation scores one registered version against one dataset by
//! spawning the external evaluator and upserting the `metric` events it
//! reports. Re-running an evaluation overwrites prior values for the same
//! `(version, dataset, metric)` key instead of accumulating rows.

use crate::application::events::{EventBus, WorkerEvent};
use crate::domain::error::{AppError, Result};
use crate::infrastructure::artifact_store::ArtifactLayout;
use crate::infrastructure::config::ControlPlaneConfig;
use crate::infrastructure::db::repositories::{
    DatasetRepository, EvaluationMetricInput, EvaluationMetricsRepository, ModelVersionRepository,
    TrainingDb,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

const CANCEL_FLAG: &str = "cancel.flag";
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationConfig {
    pub max_samples: Option<i64>,
    pub max_new_tokens: Option<i64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    #[serde(default)]
    pub compute_teacher_agreement: bool,
}

struct EvalHandle {
    child: Arc<AsyncMutex<Child>>,
    eval_dir: PathBuf,
}

pub struct EvaluationRecorder {
    db: TrainingDb,
    config: Arc<ControlPlaneConfig>,
    layout: ArtifactLayout,
    events: Arc<EventBus>,
    workers: Arc<Mutex<HashMap<String, EvalHandle>>>,
}

impl EvaluationRecorder {
    pub fn new(db: TrainingDb, config: Arc<ControlPlaneConfig>, events: Arc<EventBus>) -> Self {
        let layout = ArtifactLayout::new(&config.data_dir);
        Self {
            db,
            config,
            layout,
            events,
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn the evaluator for `version_id` against `dataset_id`. Returns
    /// the evaluation id; progress and metrics stream through the event bus
    /// under that id.
    pub async fn evaluate(
        &self,
        version_id: &str,
        dataset_id: &str,
        config: &EvaluationConfig,
    ) -> Result<String> {
        let version = ModelVersionRepository::new(&self.db).get(version_id).await?;
        DatasetRepository::new(&self.db).get(dataset_id).await?;

        self.layout.ensure()?;
        let eval_id = Uuid::new_v4().to_string();
        let eval_dir = self.layout.evaluation_dir(&eval_id);
        std::fs::create_dir_all(&eval_dir).map_err(|e| {
            AppError::IoError(format!(
                "Failed to create eval dir {}: {e}",
                eval_dir.display()
            ))
        })?;

        let config_path = eval_dir.join("evaluator_config.json");
        let worker_config = serde_json::json!({
            "eval_id": eval_id,
            "eval_dir": eval_dir.to_string_lossy(),
            "version_id": version_id,
            "dataset_id": dataset_id,
            "artifact_path": version.artifact_path,
            "db_path": self.config.db_path().to_string_lossy(),
            "max_samples": config.max_samples,
            "max_new_tokens": config.max_new_tokens,
            "temperature": config.temperature,
            "top_p": config.top_p,
            "compute_teacher_agreement": config.compute_teacher_agreement,
        });
        let config_bytes = serde_json::to_vec_pretty(&worker_config)
            .map_err(|e| AppError::Internal(format!("Failed to encode evaluator config: {e}")))?;
        std::fs::write(&config_path, config_bytes).map_err(|e| {
            AppError::IoError(format!("Failed to write {}: {e}", config_path.display()))
        })?;

        let mut cmd = crate::application::run_manager::worker_command(&self.config.evaluator_command)?;
        cmd.arg("--config")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| AppError::WorkerFailure(format!("Failed to spawn evaluator: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::WorkerFailure("Evaluator stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::WorkerFailure("Evaluator stderr unavailable".to_string()))?;

        let child = Arc::new(AsyncMutex::new(child));
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                eval_id.clone(),
                EvalHandle {
                    child: child.clone(),
                    eval_dir: eval_dir.clone(),
                },
            );

        self.spawn_stdout_handler(
            eval_id.clone(),
            version_id.to_string(),
            dataset_id.to_string(),
            stdout,
        );
        self.spawn_stderr_handler(eval_id.clone(), stderr);
        self.spawn_exit_monitor(eval_id.clone(), eval_dir, child);

        info!(eval_id, version_id, dataset_id, "evaluator spawned");
        Ok(eval_id)
    }

    /// Best-effort cooperative cancel, same discipline as training runs.
    pub async fn cancel(&self, eval_id: &str) -> Result<()> {
        let child = {
            let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            let Some(handle) = workers.get(eval_id) else {
                // Already finished; cancel is idempotent.
                return Ok(());
            };
            let flag = handle.eval_dir.join(CANCEL_FLAG);
            std::fs::write(&flag, b"cancel\n").map_err(|e| {
                AppError::IoError(format!("Failed to write {}: {e}", flag.display()))
            })?;
            handle.child.clone()
        };

        info!(eval_id, "evaluation cancel requested");
        let grace = Duration::from_secs(self.config.cancel_grace_secs);
        tokio::spawn(async move {
            let deadline = Instant::now() + grace;
            loop {
                let exited = {
                    let mut guard = child.lock().await;
                    matches!(guard.try_wait(), Ok(Some(_)) | Err(_))
                };
                if exited {
                    break;
                }
                if Instant::now() >= deadline {
                    let _ = child.lock().await.kill().await;
                    break;
                }
                sleep(EXIT_POLL_INTERVAL).await;
            }
        });
        Ok(())
    }

    pub async fn list_metrics(&self, version_id: &str) -> Result<Vec<crate::infrastructure::db::repositories::EvaluationMetric>> {
        EvaluationMetricsRepository::new(&self.db)
            .list_for_version(version_id)
            .await
    }

    fn spawn_stdout_handler(
        &self,
        eval_id: String,
        version_id: String,
        dataset_id: String,
        stdout: tokio::process::ChildStdout,
    ) {
        let db = self.db.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let metrics = EvaluationMetricsRepository::new(&db);
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Some(event) = WorkerEvent::parse_line(&line) else {
                    continue;
                };
                events.publish(&eval_id, event.clone());

                if let WorkerEvent::Metric {
                    dataset_id: reported_dataset,
                    name,
                    value,
                } = event
                {
                    // Workers may omit the dataset; the evaluation's own
                    // dataset is authoritative either way.
                    let dataset = if reported_dataset.is_empty() {
                        dataset_id.clone()
                    } else {
                        reported_dataset
                    };
                    if dataset != dataset_id {
                        warn!(eval_id, dataset, "metric for unexpected dataset, skipping");
                        continue;
                    }
                    if let Err(e) = metrics
                        .upsert(&EvaluationMetricInput {
                            version_id: version_id.clone(),
                            dataset_id: dataset,
                            metric_name: name,
                            metric_value: value,
                        })
                        .await
                    {
                        error!(eval_id, "failed to record metric: {e}");
                    }
                }
            }
        });
    }

    fn spawn_stderr_handler(&self, eval_id: String, stderr: tokio::process::ChildStderr) {
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    events.publish(&eval_id, WorkerEvent::Stderr { message: line });
                }
            }
        });
    }

    fn spawn_exit_monitor(&self, eval_id: String, eval_dir: PathBuf, child: Arc<AsyncMutex<Child>>) {
        let events = self.events.clone();
        let workers = self.workers.clone();
        tokio::spawn(async move {
            let outcome = loop {
                let waited = {
                    let mut guard = child.lock().await;
                    match guard.try_wait() {
                        Ok(Some(status)) => Some(Ok(status)),
                        Ok(None) => None,
                        Err(err) => Some(Err(err)),
                    }
                };
                match waited {
                    Some(v) => break v,
                    None => sleep(EXIT_POLL_INTERVAL).await,
                }
            };

            let cancelled = eval_dir.join(CANCEL_FLAG).exists();
            let success = matches!(outcome, Ok(status) if status.success()) && !cancelled;

            workers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&eval_id);
            events.publish(&eval_id, WorkerEvent::Exited { cancelled, success });
            events.close(&eval_id);
            info!(eval_id, cancelled, success, "evaluator exited");
        });
    }
}
