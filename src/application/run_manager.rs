//! Training run supervision.
//!
//! The control plane never trains anything itself. It freezes the run's data
//! selection, launches an external trainer process, ingests the trainer's
//! JSONL event stream, and drives the run state machine from what the worker
//! actually reports. Cancellation is cooperative: a flag file signals the
//! worker, and the run only becomes `cancelled` once the exit monitor sees
//! the process stop with the flag set.

use crate::application::events::{EventBus, WorkerEvent};
use crate::application::registry::{ArtifactDescriptor, VersionRegistry};
use crate::domain::error::{AppError, Result};
use crate::domain::training::{ArtifactKind, TrainingStatus};
use crate::infrastructure::artifact_store::{sha256_hex_file, ArtifactLayout};
use crate::infrastructure::config::ControlPlaneConfig;
use crate::infrastructure::db::repositories::{
    RunArtifactInput, RunArtifactsRepository, RunCorrectionsRepository, RunDatasetsRepository,
    RunSelection, TrainingDb, TrainingLogInput, TrainingLogRepository, TrainingRunInput,
    TrainingRunRepository,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

const CANCEL_FLAG: &str = "cancel.flag";
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Everything needed to create a run: identity, frozen data selection and
/// frozen hyperparameters. Nothing here may change after `create_run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSpec {
    pub student_model_id: String,
    pub base_version_id: Option<String>,
    pub teacher_model_id: Option<String>,
    pub method: crate::domain::training::TrainingMethod,
    pub hyperparams: crate::domain::training::Hyperparams,
    pub seed: Option<i64>,
    #[serde(default)]
    pub corrections: Vec<RunSelection>,
    #[serde(default)]
    pub datasets: Vec<RunSelection>,
}

/// Worker knobs that shape execution without touching the frozen selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    pub steps: Option<i64>,
    pub emit_every: Option<i64>,
}

/// Request-scoped handle returned by `start`. Callers pass it (or its
/// `run_id`) to every follow-up call for this run; there is no process-wide
/// "current run".
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub config_path: PathBuf,
}

struct WorkerHandle {
    child: Arc<AsyncMutex<Child>>,
    run_dir: PathBuf,
}

/// Reserves a run id in the launch set until the worker handle is installed,
/// so two concurrent `start` calls for the same run cannot both spawn.
struct LaunchGuard {
    workers: Arc<Mutex<HashMap<String, WorkerHandle>>>,
    launches: Arc<Mutex<HashSet<String>>>,
    run_id: String,
    active: bool,
}

impl LaunchGuard {
    fn reserve(
        workers: Arc<Mutex<HashMap<String, WorkerHandle>>>,
        launches: Arc<Mutex<HashSet<String>>>,
        run_id: &str,
    ) -> Result<Self> {
        if workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(run_id)
        {
            return Err(AppError::ValidationError(format!(
                "Worker already running for run {}",
                run_id
            )));
        }
        {
            let mut launches = launches.lock().unwrap_or_else(|e| e.into_inner());
            if !launches.insert(run_id.to_string()) {
                return Err(AppError::ValidationError(format!(
                    "Worker already starting for run {}",
                    run_id
                )));
            }
        }
        Ok(Self {
            workers,
            launches,
            run_id: run_id.to_string(),
            active: true,
        })
    }

    fn install(&mut self, handle: WorkerHandle) -> Result<()> {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if workers.contains_key(&self.run_id) {
            return Err(AppError::ValidationError(format!(
                "Worker already running for run {}",
                self.run_id
            )));
        }
        workers.insert(self.run_id.clone(), handle);
        self.launches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.run_id);
        self.active = false;
        Ok(())
    }
}

impl Drop for LaunchGuard {
    fn drop(&mut self) {
        if self.active {
            self.launches
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.run_id);
        }
    }
}

pub struct TrainingRunManager {
    db: TrainingDb,
    config: Arc<ControlPlaneConfig>,
    layout: ArtifactLayout,
    events: Arc<EventBus>,
    workers: Arc<Mutex<HashMap<String, WorkerHandle>>>,
    launches: Arc<Mutex<HashSet<String>>>,
}

impl TrainingRunManager {
    pub fn new(db: TrainingDb, config: Arc<ControlPlaneConfig>, events: Arc<EventBus>) -> Self {
        let layout = ArtifactLayout::new(&config.data_dir);
        Self {
            db,
            config,
            layout,
            events,
            workers: Arc::new(Mutex::new(HashMap::new())),
            launches: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Create a queued run, freezing its data selection and hyperparameters
    /// in one transaction. The selection tables are the audit trail that
    /// makes the run reproducible; nothing appends to them afterwards.
    pub async fn create_run(&self, spec: RunSpec) -> Result<String> {
        spec.hyperparams.validate()?;
        if spec.corrections.is_empty() && spec.datasets.is_empty() {
            return Err(AppError::ValidationError(
                "A run needs at least one correction or dataset selection".to_string(),
            ));
        }
        for selection in spec.corrections.iter().chain(spec.datasets.iter()) {
            selection.validate()?;
        }

        let run_id = Uuid::new_v4().to_string();
        let input = TrainingRunInput {
            run_id: run_id.clone(),
            student_model_id: spec.student_model_id,
            base_version_id: spec.base_version_id,
            teacher_model_id: spec.teacher_model_id,
            method: spec.method,
            hyperparams: spec.hyperparams,
            seed: spec.seed,
        };

        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to begin run creation: {e}")))?;
        TrainingRunRepository::insert_tx(&mut tx, &input).await?;
        for selection in &spec.corrections {
            RunCorrectionsRepository::add_tx(&mut tx, &run_id, selection).await?;
        }
        for selection in &spec.datasets {
            RunDatasetsRepository::add_tx(&mut tx, &run_id, selection).await?;
        }
        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to commit run creation: {e}")))?;

        info!(run_id, "created training run");
        Ok(run_id)
    }

    /// Launch the trainer for a queued run. At most one worker per run id.
    pub async fn start(&self, run_id: &str, options: StartOptions) -> Result<RunContext> {
        let run_id = run_id.trim();
        if run_id.is_empty() {
            return Err(AppError::ValidationError("run_id is required".to_string()));
        }

        let mut launch_guard =
            LaunchGuard::reserve(self.workers.clone(), self.launches.clone(), run_id)?;

        let runs = TrainingRunRepository::new(&self.db);
        let run = runs.get(run_id).await?;
        if run.status != TrainingStatus::Queued {
            return Err(AppError::ValidationError(format!(
                "Run {} is {}, only queued runs can start",
                run_id,
                run.status.as_db()
            )));
        }

        self.layout.ensure()?;
        let run_dir = self.layout.run_dir(run_id);
        std::fs::create_dir_all(&run_dir).map_err(|e| {
            AppError::IoError(format!(
                "Failed to create run dir {}: {e}",
                run_dir.display()
            ))
        })?;
        let _ = std::fs::remove_file(run_dir.join(CANCEL_FLAG));

        let config_path = run_dir.join("trainer_config.json");
        let worker_config = serde_json::json!({
            "run_id": run_id,
            "run_dir": run_dir.to_string_lossy(),
            "mode": run.method.as_db(),
            "seed": run.seed,
            "steps": options.steps,
            "emit_every": options.emit_every.unwrap_or(1),
            "db_path": self.config.db_path().to_string_lossy(),
            "dataset_source": "db",
            "hyperparams": run.hyperparams,
        });
        let config_bytes = serde_json::to_vec_pretty(&worker_config)
            .map_err(|e| AppError::Internal(format!("Failed to encode worker config: {e}")))?;
        if let Err(e) = std::fs::write(&config_path, config_bytes) {
            let err = AppError::IoError(format!(
                "Failed to write {}: {e}",
                config_path.display()
            ));
            let _ = runs
                .transition(
                    run_id,
                    TrainingStatus::Failed,
                    Some(chrono::Utc::now().to_rfc3339()),
                    Some(err.to_string()),
                )
                .await;
            return Err(err);
        }

        let stdout_log = run_dir.join("trainer_stdout.log");
        let stderr_log = run_dir.join("trainer_stderr.log");
        let metrics_log = run_dir.join("trainer_metrics.jsonl");
        self.record_baseline_artifacts(run_id, &config_path, &stdout_log, &stderr_log)
            .await;

        let mut cmd = worker_command(&self.config.trainer_command)?;
        cmd.arg("--config")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = AppError::WorkerFailure(format!("Failed to spawn trainer: {e}"));
                let _ = runs
                    .transition(
                        run_id,
                        TrainingStatus::Failed,
                        Some(chrono::Utc::now().to_rfc3339()),
                        Some(err.to_string()),
                    )
                    .await;
                return Err(err);
            }
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::WorkerFailure("Trainer stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::WorkerFailure("Trainer stderr unavailable".to_string()))?;

        let child = Arc::new(AsyncMutex::new(child));
        if let Err(e) = launch_guard.install(WorkerHandle {
            child: child.clone(),
            run_dir: run_dir.clone(),
        }) {
            let child_to_kill = child.clone();
            tokio::spawn(async move {
                let _ = child_to_kill.lock().await.kill().await;
            });
            return Err(e);
        }

        let last_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        self.spawn_stdout_handler(
            run_id.to_string(),
            run_dir.clone(),
            stdout_log,
            metrics_log,
            stdout,
            last_error.clone(),
        );
        self.spawn_stderr_handler(run_id.to_string(), stderr_log, stderr, last_error.clone());
        self.spawn_exit_monitor(run_id.to_string(), run_dir.clone(), child, last_error);

        info!(run_id, "trainer spawned");
        Ok(RunContext {
            run_id: run_id.to_string(),
            run_dir,
            config_path,
        })
    }

    /// Cooperative cancel: drop a flag file into the run dir and let the
    /// worker wind down. The run stays `running` until the exit monitor
    /// confirms the process is gone; after a grace period the process is
    /// killed outright. A queued run with no worker is cancelled directly;
    /// cancelling a run that already reached a terminal state is a no-op.
    pub async fn cancel(&self, run_id: &str) -> Result<()> {
        let runs = TrainingRunRepository::new(&self.db);
        let run = runs.get(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }

        let child = {
            let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            match workers.get(run_id) {
                Some(handle) => {
                    let flag = handle.run_dir.join(CANCEL_FLAG);
                    std::fs::write(&flag, b"cancel\n").map_err(|e| {
                        AppError::IoError(format!("Failed to write {}: {e}", flag.display()))
                    })?;
                    Some(handle.child.clone())
                }
                None => None,
            }
        };

        let Some(child) = child else {
            // Nothing was ever spawned for this run, so there is no process
            // to wind down; the run goes terminal right here.
            runs.transition(
                run_id,
                TrainingStatus::Cancelled,
                Some(chrono::Utc::now().to_rfc3339()),
                None,
            )
            .await?;
            info!(run_id, "cancelled before start");
            return Ok(());
        };

        info!(run_id, "cancel requested");

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

    pub fn has_active_worker(&self, run_id: &str) -> bool {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(run_id)
    }

    async fn record_baseline_artifacts(
        &self,
        run_id: &str,
        config_path: &Path,
        stdout_log: &Path,
        stderr_log: &Path,
    ) {
        let artifacts = RunArtifactsRepository::new(&self.db);
        for (kind, path) in [
            (ArtifactKind::Config, config_path),
            (ArtifactKind::Log, stdout_log),
            (ArtifactKind::Log, stderr_log),
        ] {
            let _ = artifacts
                .insert(&RunArtifactInput {
                    artifact_id: Uuid::new_v4().to_string(),
                    run_id: run_id.to_string(),
                    kind,
                    path: path.to_string_lossy().to_string(),
                    hash: None,
                    size_bytes: None,
                })
                .await;
        }
    }

    fn spawn_stdout_handler(
        &self,
        run_id: String,
        run_dir: PathBuf,
        stdout_log_path: PathBuf,
        metrics_log_path: PathBuf,
        stdout: tokio::process::ChildStdout,
        last_error: Arc<Mutex<Option<String>>>,
    ) {
        let db = self.db.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let logs = TrainingLogRepository::new(&db);
            let runs = TrainingRunRepository::new(&db);
            let artifacts = RunArtifactsRepository::new(&db);

            let mut stdout_log = match OpenOptions::new()
                .create(true)
                .append(true)
                .open(&stdout_log_path)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    error!(run_id, "failed to open stdout log: {e}");
                    return;
                }
            };
            let mut metrics_log = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&metrics_log_path)
                .await
                .ok();

            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = stdout_log.write_all(line.as_bytes()).await;
                let _ = stdout_log.write_all(b"\n").await;

                let Some(event) = WorkerEvent::parse_line(&line) else {
                    continue;
                };
                events.publish(&run_id, event.clone());

                match event {
                    WorkerEvent::Status {
                        level,
                        message,
                        trace,
                    } => {
                        if level.eq_ignore_ascii_case("started") {
                            let _ = runs
                                .transition(&run_id, TrainingStatus::Running, None, None)
                                .await;
                        } else if level.eq_ignore_ascii_case("error") {
                            *last_error.lock().unwrap_or_else(|e| e.into_inner()) =
                                Some(message.clone());
                            if let Some(trace) = trace {
                                let _ = tokio::fs::write(
                                    run_dir.join("trainer_error.trace"),
                                    trace,
                                )
                                .await;
                            }
                            let _ = runs
                                .transition(
                                    &run_id,
                                    TrainingStatus::Failed,
                                    Some(chrono::Utc::now().to_rfc3339()),
                                    Some(message),
                                )
                                .await;
                        }
                    }
                    WorkerEvent::Progress {
                        epoch,
                        step,
                        loss,
                        lr,
                        temperature,
                        resources,
                    } => {
                        let resources = resources.as_ref();
                        let _ = logs
                            .insert(&TrainingLogInput {
                                run_id: run_id.clone(),
                                epoch,
                                step,
                                loss,
                                lr,
                                temperature,
                                cpu_util: resources.and_then(|r| r.cpu_percent),
                                ram_usage_mb: resources
                                    .and_then(|r| r.ram_rss_bytes)
                                    .map(|b| b / (1024 * 1024)),
                                gpu_util: resources.and_then(|r| r.gpu_util_percent),
                            })
                            .await;
                    }
                    WorkerEvent::Artifact {
                        kind,
                        path,
                        hash,
                        size_bytes,
                    } => {
                        let Some(kind) = ArtifactKind::from_worker(&kind) else {
                            warn!(run_id, kind, "unknown artifact kind from worker");
                            continue;
                        };
                        if path.trim().is_empty() {
                            continue;
                        }
                        let _ = artifacts
                            .insert(&RunArtifactInput {
                                artifact_id: Uuid::new_v4().to_string(),
                                run_id: run_id.clone(),
                                kind,
                                path,
                                hash,
                                size_bytes,
                            })
                            .await;
                    }
                    WorkerEvent::Metric { .. } => {
                        if let Some(file) = metrics_log.as_mut() {
                            let _ = file.write_all(line.as_bytes()).await;
                            let _ = file.write_all(b"\n").await;
                        }
                    }
                    // env/model/dataset reports are informational; they reach
                    // subscribers through the bus and need no persistence.
                    _ => {}
                }
            }
        });
    }

    fn spawn_stderr_handler(
        &self,
        run_id: String,
        stderr_log_path: PathBuf,
        stderr: tokio::process::ChildStderr,
        last_error: Arc<Mutex<Option<String>>>,
    ) {
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut stderr_log = match OpenOptions::new()
                .create(true)
                .append(true)
                .open(&stderr_log_path)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    error!(run_id, "failed to open stderr log: {e}");
                    return;
                }
            };

            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = stderr_log.write_all(line.as_bytes()).await;
                let _ = stderr_log.write_all(b"\n").await;

                if line.trim().is_empty() {
                    continue;
                }
                {
                    let mut guard = last_error.lock().unwrap_or_else(|e| e.into_inner());
                    if guard.is_none() {
                        *guard = Some(clip_message(&line, 400));
                    }
                }
                events.publish(&run_id, WorkerEvent::Stderr { message: line });
            }
        });
    }

    fn spawn_exit_monitor(
        &self,
        run_id: String,
        run_dir: PathBuf,
        child: Arc<AsyncMutex<Child>>,
        last_error: Arc<Mutex<Option<String>>>,
    ) {
        let db = self.db.clone();
        let events = self.events.clone();
        let workers = self.workers.clone();
        tokio::spawn(async move {
            let runs = TrainingRunRepository::new(&db);

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

            let cancelled = run_dir.join(CANCEL_FLAG).exists();
            let end_time = Some(chrono::Utc::now().to_rfc3339());
            let mut success = false;

            match outcome {
                Ok(status) => {
                    let final_status = if cancelled {
                        TrainingStatus::Cancelled
                    } else if status.success() {
                        TrainingStatus::Completed
                    } else {
                        TrainingStatus::Failed
                    };

                    let failure_reason = if final_status == TrainingStatus::Failed {
                        let guard = last_error.lock().unwrap_or_else(|e| e.into_inner());
                        guard
                            .clone()
                            .or_else(|| Some(format!("Trainer exited: {status}")))
                    } else {
                        None
                    };

                    if let Err(e) = runs
                        .transition(&run_id, final_status, end_time, failure_reason)
                        .await
                    {
                        error!(run_id, "failed to finalize run status: {e}");
                    }

                    // The stdout handler may already have finalized the run
                    // (an error-level status event moves it to failed, and
                    // failed is sticky); what the store says wins.
                    match runs.get(&run_id).await {
                        Ok(run) => {
                            success = run.status == TrainingStatus::Completed;
                            if success {
                                register_completed_run_version(&db, &run_id).await;
                            }
                        }
                        Err(e) => error!(run_id, "failed to read back run status: {e}"),
                    }
                }
                Err(err) => {
                    let failure = {
                        let guard = last_error.lock().unwrap_or_else(|e| e.into_inner());
                        guard
                            .clone()
                            .unwrap_or_else(|| format!("Trainer wait failed: {err}"))
                    };
                    let _ = runs
                        .transition(&run_id, TrainingStatus::Failed, end_time, Some(failure))
                        .await;
                }
            }

            workers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&run_id);

            events.publish(&run_id, WorkerEvent::Exited { cancelled, success });
            events.close(&run_id);
            info!(run_id, cancelled, success, "trainer exited");
        });
    }
}

/// Split a configured command line ("python3 -m worker.train") into a
/// spawnable command.
pub(crate) fn worker_command(command_line: &str) -> Result<Command> {
    let mut parts = command_line.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| AppError::ValidationError("Worker command is empty".to_string()))?;
    let mut cmd = Command::new(program);
    cmd.args(parts);
    Ok(cmd)
}

/// Clip a log line to at most `max` bytes without splitting a character,
/// marking the cut with an ellipsis.
fn clip_message(line: &str, max: usize) -> String {
    if line.len() <= max {
        return line.to_string();
    }
    let mut cut = max;
    while !line.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &line[..cut])
}

/// A completed run becomes a registered version automatically, preferring
/// the most usable artifact the worker produced.
async fn register_completed_run_version(db: &TrainingDb, run_id: &str) {
    let registry = VersionRegistry::new(db);
    match registry.find_by_run(run_id).await {
        Ok(Some(_)) => return,
        Ok(None) => {}
        Err(e) => {
            error!(run_id, "failed to check existing version: {e}");
            return;
        }
    }

    let runs = TrainingRunRepository::new(db);
    let artifacts = RunArtifactsRepository::new(db);
    let Ok(run) = runs.get(run_id).await else {
        return;
    };
    let Ok(run_artifacts) = artifacts.list_for_run(run_id).await else {
        return;
    };

    let preferred = [
        ArtifactKind::MergedModel,
        ArtifactKind::Adapter,
        ArtifactKind::Gguf,
    ];
    let picked = preferred
        .iter()
        .find_map(|kind| run_artifacts.iter().find(|a| a.kind == *kind));
    let Some(artifact) = picked else {
        warn!(run_id, "completed run produced no registrable artifact");
        return;
    };

    let hash = match &artifact.hash {
        Some(h) => Some(h.clone()),
        None => match sha256_hex_file(Path::new(&artifact.path)) {
            Ok(h) => Some(h),
            Err(e) => {
                error!(run_id, "failed to hash artifact {}: {e}", artifact.path);
                return;
            }
        },
    };

    let descriptor = ArtifactDescriptor {
        path: artifact.path.clone(),
        hash,
        size_bytes: artifact.size_bytes,
    };
    match registry
        .register_version(
            Some(run_id),
            &run.student_model_id,
            run.base_version_id.as_deref(),
            descriptor,
            Some(format!("Registered from run {run_id}")),
        )
        .await
    {
        Ok(version) => info!(run_id, version_id = %version.version_id, "registered version"),
        Err(e) => error!(run_id, "failed to register version: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_lines_pass_through_unclipped() {
        assert_eq!(clip_message("loss diverged", 400), "loss diverged");
    }

    #[test]
    fn clip_never_splits_a_character() {
        // 200 two-byte characters; byte 399 falls inside the last one.
        let line = "é".repeat(200);
        let clipped = clip_message(&line, 399);
        assert!(clipped.ends_with("..."));
        assert_eq!(clipped.trim_end_matches("..."), "é".repeat(199));
    }

    #[test]
    fn worker_command_rejects_empty_lines() {
        assert!(worker_command("   ").is_err());
    }
}
