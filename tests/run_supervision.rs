//! End-to-end tests for trainer supervision: a shell-script worker stands in
//! for the real trainer and emits the JSONL protocol on stdout, so the whole
//! spawn / ingest / finalize path runs against a real process.

use distill_control::application::soft_labels::{TeacherClient, TeacherOutput};
use distill_control::infrastructure::db::repositories::{CorrectionInput, ModelInput};
use distill_control::{
    ControlPlane, ControlPlaneConfig, Hyperparams, ModelProvider, Result, RunSpec, SoftLabelKind,
    SoftLabelPayload, Split, StartOptions, TrainingMethod, TrainingRun, TrainingStatus,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use uuid::Uuid;

struct NullTeacher;

#[async_trait::async_trait]
impl TeacherClient for NullTeacher {
    async fn generate(
        &self,
        prompt: &str,
        _temperature: f64,
        _kind: SoftLabelKind,
    ) -> Result<TeacherOutput> {
        Ok(TeacherOutput {
            text: format!("echo: {prompt}"),
            payload: SoftLabelPayload::TextOnly,
        })
    }
}

struct TestEnv {
    plane: ControlPlane,
    data_dir: PathBuf,
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.data_dir);
    }
}

/// Build a control plane whose trainer is `sh <script>`, with a short kill
/// grace so cancellation tests stay fast.
async fn env_with_worker(script_body: &str) -> TestEnv {
    let data_dir = std::env::temp_dir().join(format!("distill-sup-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&data_dir).unwrap();
    let script = data_dir.join("worker.sh");
    std::fs::write(&script, script_body).unwrap();

    let config = ControlPlaneConfig {
        data_dir: data_dir.clone(),
        trainer_command: format!("sh {}", script.display()),
        cancel_grace_secs: 1,
        ..Default::default()
    };
    let plane = ControlPlane::connect(config, Arc::new(NullTeacher)).await.unwrap();
    TestEnv { plane, data_dir }
}

async fn queued_run(env: &TestEnv) -> String {
    env.plane
        .register_model(&ModelInput {
            model_id: "student-1".to_string(),
            display_name: "Student".to_string(),
            provider: ModelProvider::Local,
            model_family: None,
            default_artifact_path: None,
        })
        .await
        .unwrap();
    env.plane
        .record_correction(&CorrectionInput {
            correction_id: "c1".to_string(),
            prompt: "prompt".to_string(),
            student_output: "wrong".to_string(),
            corrected_output: "right".to_string(),
            accuracy_rating: 2,
            relevance_rating: None,
            safety_rating: None,
            domain_notes: None,
        })
        .await
        .unwrap();

    env.plane
        .create_run(RunSpec {
            student_model_id: "student-1".to_string(),
            base_version_id: None,
            teacher_model_id: None,
            method: TrainingMethod::FineTune,
            hyperparams: Hyperparams::default(),
            seed: Some(7),
            corrections: vec![distill_control::RunSelection {
                id: "c1".to_string(),
                split: Split::Train,
                weight: 1.0,
            }],
            datasets: vec![],
        })
        .await
        .unwrap()
}

async fn wait_for_terminal(env: &TestEnv, run_id: &str) -> TrainingRun {
    wait_for(env, run_id, |run| run.status.is_terminal()).await
}

async fn wait_for(
    env: &TestEnv,
    run_id: &str,
    predicate: impl Fn(&TrainingRun) -> bool,
) -> TrainingRun {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let run = env.plane.get_run(run_id).await.unwrap();
        if predicate(&run) {
            return run;
        }
        if Instant::now() >= deadline {
            panic!("run {run_id} stuck in {:?}", run.status);
        }
        sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn completed_run_registers_a_version() {
    let data_dir = std::env::temp_dir().join(format!("distill-sup-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&data_dir).unwrap();
    let artifact = data_dir.join("merged.bin");
    std::fs::write(&artifact, b"merged-weights").unwrap();

    let script = format!(
        concat!(
            "echo '{{\"kind\":\"status\",\"payload\":{{\"level\":\"started\",\"message\":\"warmup\"}}}}'\n",
            "echo '{{\"kind\":\"progress\",\"payload\":{{\"epoch\":1,\"step\":1,\"loss\":0.8}}}}'\n",
            "echo '{{\"kind\":\"artifact\",\"payload\":{{\"kind\":\"model\",\"path\":\"{}\"}}}}'\n",
            "sleep 1\n",
            "exit 0\n",
        ),
        artifact.display()
    );
    let env = env_with_worker(&script).await;
    let run_id = queued_run(&env).await;

    env.plane
        .start_training(&run_id, StartOptions::default())
        .await
        .unwrap();
    let run = wait_for_terminal(&env, &run_id).await;

    assert_eq!(run.status, TrainingStatus::Completed);
    assert!(run.end_time.is_some());
    assert!(run.failure_reason.is_none());

    // The worker reported one progress row and the hand-off registered the
    // merged model as a version of the student.
    let logs = env.plane.run_logs(&run_id, 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].step, 1);

    let versions = env.plane.list_model_versions("student-1").await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].run_id.as_deref(), Some(run_id.as_str()));
    assert_eq!(versions[0].artifact_path, artifact.display().to_string());
    assert_eq!(versions[0].artifact_hash.as_ref().unwrap().len(), 64);

    let _ = std::fs::remove_dir_all(&data_dir);
}

#[tokio::test]
async fn error_report_fails_the_run_without_a_version() {
    let script = concat!(
        "echo '{\"kind\":\"status\",\"payload\":{\"level\":\"started\",\"message\":\"warmup\"}}'\n",
        "echo '{\"kind\":\"status\",\"payload\":{\"level\":\"error\",\"message\":\"loss exploded\"}}'\n",
        "sleep 1\n",
        "exit 0\n",
    );
    let env = env_with_worker(script).await;
    let run_id = queued_run(&env).await;

    env.plane
        .start_training(&run_id, StartOptions::default())
        .await
        .unwrap();
    let run = wait_for_terminal(&env, &run_id).await;

    // A clean exit code does not outvote the worker's own error report, and
    // a run that did not complete never becomes a version.
    assert_eq!(run.status, TrainingStatus::Failed);
    assert_eq!(run.failure_reason.as_deref(), Some("loss exploded"));
    assert!(run.end_time.is_some());
    assert!(env
        .plane
        .list_model_versions("student-1")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn crashed_trainer_fails_with_stderr_reason() {
    let script = concat!(
        "echo '{\"kind\":\"status\",\"payload\":{\"level\":\"started\",\"message\":\"warmup\"}}'\n",
        "echo 'CUDA out of memory' >&2\n",
        "sleep 1\n",
        "exit 3\n",
    );
    let env = env_with_worker(script).await;
    let run_id = queued_run(&env).await;

    env.plane
        .start_training(&run_id, StartOptions::default())
        .await
        .unwrap();
    let run = wait_for_terminal(&env, &run_id).await;

    assert_eq!(run.status, TrainingStatus::Failed);
    assert!(run
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("CUDA out of memory"));
    assert!(run.end_time.is_some());

    // The raw stream survives on disk next to the run.
    let stderr_log = stderr_log_path(&env, &run_id);
    let contents = std::fs::read_to_string(stderr_log).unwrap();
    assert!(contents.contains("CUDA out of memory"));
}

#[tokio::test]
async fn cancel_stops_a_running_trainer() {
    let script = concat!(
        "echo '{\"kind\":\"status\",\"payload\":{\"level\":\"started\",\"message\":\"warmup\"}}'\n",
        "sleep 30\n",
    );
    let env = env_with_worker(script).await;
    let run_id = queued_run(&env).await;

    env.plane
        .start_training(&run_id, StartOptions::default())
        .await
        .unwrap();
    wait_for(&env, &run_id, |run| run.status == TrainingStatus::Running).await;

    // A second launch for the same run is refused while the worker lives.
    assert!(env
        .plane
        .start_training(&run_id, StartOptions::default())
        .await
        .is_err());

    env.plane.cancel_training(&run_id).await.unwrap();
    let run = wait_for_terminal(&env, &run_id).await;
    assert_eq!(run.status, TrainingStatus::Cancelled);
    assert!(run.end_time.is_some());

    // Cancelling a finished run stays a no-op.
    env.plane.cancel_training(&run_id).await.unwrap();
}

fn stderr_log_path(env: &TestEnv, run_id: &str) -> PathBuf {
    Path::new(&env.data_dir)
        .join("artifacts")
        .join("runs")
        .join(run_id)
        .join("trainer_stderr.log")
}
