//! End-to-end tests for the control-plane command surface, exercising the
//! real sqlite store against a file-backed temporary database.

use distill_control::application::soft_labels::{TeacherClient, TeacherOutput};
use distill_control::infrastructure::db::repositories::{
    CorrectionInput, DatasetInput, DatasetItemInput, DatasetRepository, EvaluationMetricInput,
    EvaluationMetricsRepository, ModelInput, SoftLabelRepository, TrainingRunRepository,
};
use distill_control::{
    ArtifactDescriptor, ControlPlane, ControlPlaneConfig, Guardrails, Hyperparams, ModelProvider,
    ModelVersion, Result, RunSpec, SoftLabelKind, SoftLabelPayload, Split, TrainingMethod,
    TrainingStatus,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

struct StubTeacher {
    calls: AtomicUsize,
}

impl StubTeacher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl TeacherClient for StubTeacher {
    async fn generate(
        &self,
        prompt: &str,
        _temperature: f64,
        kind: SoftLabelKind,
    ) -> Result<TeacherOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if prompt.contains("boom") {
            return Err(distill_control::AppError::WorkerFailure(
                "teacher unavailable".to_string(),
            ));
        }
        let payload = match kind {
            SoftLabelKind::Logits => SoftLabelPayload::Logits(vec![1, 2, 3, 4]),
            SoftLabelKind::OneHot => SoftLabelPayload::OneHot(vec![0, 1]),
            SoftLabelKind::TextOnly => SoftLabelPayload::TextOnly,
        };
        Ok(TeacherOutput {
            text: format!("echo: {prompt}"),
            payload,
        })
    }
}

struct TestEnv {
    plane: ControlPlane,
    teacher: Arc<StubTeacher>,
    data_dir: PathBuf,
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.data_dir);
    }
}

async fn test_env() -> TestEnv {
    let data_dir = std::env::temp_dir().join(format!("distill-plane-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&data_dir).unwrap();
    let config = ControlPlaneConfig {
        data_dir: data_dir.clone(),
        ..Default::default()
    };
    let teacher = StubTeacher::new();
    let plane = ControlPlane::connect(config, teacher.clone()).await.unwrap();
    TestEnv {
        plane,
        teacher,
        data_dir,
    }
}

async fn register_model(env: &TestEnv, model_id: &str) {
    env.plane
        .register_model(&ModelInput {
            model_id: model_id.to_string(),
            display_name: format!("Model {model_id}"),
            provider: ModelProvider::Local,
            model_family: Some("test-family".to_string()),
            default_artifact_path: None,
        })
        .await
        .unwrap();
}

async fn register_version(env: &TestEnv, model_id: &str, tag: &str) -> ModelVersion {
    let artifact_path = env.data_dir.join(format!("artifact-{tag}.bin"));
    std::fs::write(&artifact_path, format!("weights-{tag}")).unwrap();
    env.plane
        .register_version(
            None,
            model_id,
            None,
            ArtifactDescriptor {
                path: artifact_path.to_string_lossy().to_string(),
                hash: None,
                size_bytes: None,
            },
            None,
        )
        .await
        .unwrap()
}

async fn record_metric(env: &TestEnv, version_id: &str, dataset_id: &str, name: &str, value: f64) {
    let datasets = DatasetRepository::new(env.plane.db());
    if datasets.get(dataset_id).await.is_err() {
        datasets
            .insert(&DatasetInput {
                dataset_id: dataset_id.to_string(),
                name: format!("Dataset {dataset_id}"),
                dataset_type: "golden".to_string(),
                description: None,
            })
            .await
            .unwrap();
    }
    EvaluationMetricsRepository::new(env.plane.db())
        .upsert(&EvaluationMetricInput {
            version_id: version_id.to_string(),
            dataset_id: dataset_id.to_string(),
            metric_name: name.to_string(),
            metric_value: value,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn promotion_moves_pointer_when_guardrails_pass() {
    let env = test_env().await;
    register_model(&env, "m1").await;
    let v1 = register_version(&env, "m1", "v1").await;
    let v2 = register_version(&env, "m1", "v2").await;

    let forced = Guardrails {
        force: true,
        ..Default::default()
    };
    env.plane
        .promote_version("m1", &v1.version_id, &forced)
        .await
        .unwrap();

    record_metric(&env, &v2.version_id, "d1", "exact_match", 0.75).await;
    let result = env
        .plane
        .promote_version(
            "m1",
            &v2.version_id,
            &Guardrails {
                min_exact_match: Some(0.7),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.guardrail_checks.len(), 1);
    assert!(result.guardrail_checks[0].passed);
    assert_eq!(result.previous_version_id, Some(v1.version_id.clone()));

    let active = env.plane.get_active_version("m1").await.unwrap().unwrap();
    assert_eq!(active.version_id, v2.version_id);
    assert!(active.is_promoted);

    // The displaced version loses its promoted flag.
    let versions = env.plane.list_model_versions("m1").await.unwrap();
    let old = versions
        .iter()
        .find(|v| v.version_id == v1.version_id)
        .unwrap();
    assert!(!old.is_promoted);
}

#[tokio::test]
async fn failed_promotion_leaves_state_untouched() {
    let env = test_env().await;
    register_model(&env, "m1").await;
    let v2 = register_version(&env, "m1", "v2").await;
    let v3 = register_version(&env, "m1", "v3").await;

    let forced = Guardrails {
        force: true,
        ..Default::default()
    };
    env.plane
        .promote_version("m1", &v2.version_id, &forced)
        .await
        .unwrap();

    record_metric(&env, &v3.version_id, "d1", "exact_match", 0.6).await;
    let result = env
        .plane
        .promote_version(
            "m1",
            &v3.version_id,
            &Guardrails {
                min_exact_match: Some(0.9),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.guardrail_checks.len(), 1);
    let check = &result.guardrail_checks[0];
    assert_eq!(check.metric_name, "exact_match");
    assert_eq!(check.required, 0.9);
    assert_eq!(check.actual, Some(0.6));
    assert!(!check.passed);

    let active = env.plane.get_active_version("m1").await.unwrap().unwrap();
    assert_eq!(active.version_id, v2.version_id);
    let v3_reloaded = env.plane.list_model_versions("m1").await.unwrap();
    let candidate = v3_reloaded
        .iter()
        .find(|v| v.version_id == v3.version_id)
        .unwrap();
    assert!(!candidate.is_promoted);
}

#[tokio::test]
async fn promotion_without_metrics_blocked_when_evaluation_required() {
    let env = test_env().await;
    register_model(&env, "m1").await;
    let v1 = register_version(&env, "m1", "v1").await;

    let result = env
        .plane
        .promote_version(
            "m1",
            &v1.version_id,
            &Guardrails {
                require_evaluation: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!result.success);
    assert!(env.plane.get_active_version("m1").await.unwrap().is_none());
}

#[tokio::test]
async fn rollback_backs_up_and_repoints() {
    let env = test_env().await;
    register_model(&env, "m1").await;
    let v1 = register_version(&env, "m1", "v1").await;
    let v2 = register_version(&env, "m1", "v2").await;

    let forced = Guardrails {
        force: true,
        ..Default::default()
    };
    env.plane
        .promote_version("m1", &v2.version_id, &forced)
        .await
        .unwrap();

    let result = env
        .plane
        .rollback_version("m1", &v1.version_id)
        .await
        .unwrap();

    assert!(result.backup_created);
    assert_eq!(result.previous_version_id, Some(v2.version_id.clone()));
    let active = env.plane.get_active_version("m1").await.unwrap().unwrap();
    assert_eq!(active.version_id, v1.version_id);

    let backups = std::fs::read_dir(env.data_dir.join("backups"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains("pre_rollback"))
        .count();
    assert_eq!(backups, 1);
}

#[tokio::test]
async fn rollback_to_unknown_version_is_rejected() {
    let env = test_env().await;
    register_model(&env, "m1").await;
    assert!(env.plane.rollback_version("m1", "no-such").await.is_err());

    // A version of another model is not a valid rollback target either.
    register_model(&env, "m2").await;
    let other = register_version(&env, "m2", "v1").await;
    assert!(env
        .plane
        .rollback_version("m1", &other.version_id)
        .await
        .is_err());
}

#[tokio::test]
async fn soft_label_generation_is_idempotent() {
    let env = test_env().await;
    register_model(&env, "teacher-1").await;

    let prompts = vec!["What is distillation?".to_string()];
    let first = env
        .plane
        .generate_soft_labels(&prompts, "teacher-1", 2.0, SoftLabelKind::Logits)
        .await
        .unwrap();
    assert_eq!(first.generated_count, 1);
    assert_eq!(first.cached_count, 0);
    assert_eq!(first.failed_count, 0);

    let second = env
        .plane
        .generate_soft_labels(&prompts, "teacher-1", 2.0, SoftLabelKind::Logits)
        .await
        .unwrap();
    assert_eq!(second.generated_count, 0);
    assert_eq!(second.cached_count, 1);
    assert_eq!(second.soft_label_ids, first.soft_label_ids);

    // The teacher was invoked exactly once across both calls.
    assert_eq!(env.teacher.calls.load(Ordering::SeqCst), 1);
    let count = SoftLabelRepository::new(env.plane.db())
        .count_for_teacher("teacher-1")
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn whitespace_variants_share_one_soft_label() {
    let env = test_env().await;
    register_model(&env, "teacher-1").await;

    env.plane
        .generate_soft_labels(
            &["a  question\n here".to_string()],
            "teacher-1",
            1.0,
            SoftLabelKind::TextOnly,
        )
        .await
        .unwrap();
    let second = env
        .plane
        .generate_soft_labels(
            &["a question here".to_string()],
            "teacher-1",
            1.0,
            SoftLabelKind::TextOnly,
        )
        .await
        .unwrap();
    assert_eq!(second.cached_count, 1);
    assert_eq!(second.generated_count, 0);
}

#[tokio::test]
async fn soft_label_batch_survives_single_failure() {
    let env = test_env().await;
    register_model(&env, "teacher-1").await;

    let prompts = vec![
        "fine".to_string(),
        "boom goes the teacher".to_string(),
        "also fine".to_string(),
    ];
    let result = env
        .plane
        .generate_soft_labels(&prompts, "teacher-1", 1.5, SoftLabelKind::TextOnly)
        .await
        .unwrap();

    assert_eq!(result.generated_count, 2);
    assert_eq!(result.failed_count, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].prompt_index, 1);
    assert_eq!(result.soft_label_ids.len(), 2);
}

#[tokio::test]
async fn evaluation_metrics_upsert_instead_of_duplicating() {
    let env = test_env().await;
    register_model(&env, "m1").await;
    let v1 = register_version(&env, "m1", "v1").await;

    record_metric(&env, &v1.version_id, "d1", "exact_match", 0.5).await;
    record_metric(&env, &v1.version_id, "d1", "exact_match", 0.8).await;

    let metrics = env.plane.list_version_metrics(&v1.version_id).await.unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].metric_value, 0.8);
}

#[tokio::test]
async fn run_selection_is_frozen_and_reproducible() {
    let env = test_env().await;
    register_model(&env, "student-1").await;

    let datasets = DatasetRepository::new(env.plane.db());
    datasets
        .insert(&DatasetInput {
            dataset_id: "d1".to_string(),
            name: "golden set".to_string(),
            dataset_type: "golden".to_string(),
            description: None,
        })
        .await
        .unwrap();

    let spec = RunSpec {
        student_model_id: "student-1".to_string(),
        base_version_id: None,
        teacher_model_id: None,
        method: TrainingMethod::FineTune,
        hyperparams: Hyperparams {
            learning_rate: Some(3e-4),
            epochs: Some(2),
            ..Default::default()
        },
        seed: Some(42),
        corrections: vec![],
        datasets: vec![
            distill_control::RunSelection {
                id: "d1".to_string(),
                split: Split::Train,
                weight: 1.0,
            },
            distill_control::RunSelection {
                id: "d1".to_string(),
                split: Split::Val,
                weight: 0.25,
            },
        ],
    };
    let run_id = env.plane.create_run(spec.clone()).await.unwrap();

    let (corrections, dataset_selections) = env.plane.run_selections(&run_id).await.unwrap();
    assert!(corrections.is_empty());
    assert_eq!(dataset_selections, spec.datasets);

    let run = env.plane.get_run(&run_id).await.unwrap();
    assert_eq!(run.seed, Some(42));
    assert_eq!(run.hyperparams.learning_rate, Some(3e-4));
}

#[tokio::test]
async fn run_creation_requires_a_selection() {
    let env = test_env().await;
    register_model(&env, "student-1").await;

    let spec = RunSpec {
        student_model_id: "student-1".to_string(),
        base_version_id: None,
        teacher_model_id: None,
        method: TrainingMethod::FineTune,
        hyperparams: Hyperparams::default(),
        seed: None,
        corrections: vec![],
        datasets: vec![],
    };
    assert!(env.plane.create_run(spec).await.is_err());
}

#[tokio::test]
async fn registration_requires_artifact_on_disk() {
    let env = test_env().await;
    register_model(&env, "m1").await;

    let missing = env.data_dir.join("does-not-exist.bin");
    let result = env
        .plane
        .register_version(
            None,
            "m1",
            None,
            ArtifactDescriptor {
                path: missing.to_string_lossy().to_string(),
                hash: None,
                size_bytes: None,
            },
            None,
        )
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn registered_version_is_fingerprinted() {
    let env = test_env().await;
    register_model(&env, "m1").await;
    let v1 = register_version(&env, "m1", "v1").await;

    let hash = v1.artifact_hash.unwrap();
    assert_eq!(hash.len(), 64);
    assert!(v1.artifact_size_bytes.unwrap() > 0);
}

fn correction_input(id: &str) -> CorrectionInput {
    CorrectionInput {
        correction_id: id.to_string(),
        prompt: format!("prompt for {id}"),
        student_output: "wrong answer".to_string(),
        corrected_output: "right answer".to_string(),
        accuracy_rating: 2,
        relevance_rating: Some(4),
        safety_rating: None,
        domain_notes: None,
    }
}

#[tokio::test]
async fn corrections_can_be_tagged() {
    let env = test_env().await;
    let correction = env
        .plane
        .record_correction(&correction_input("c1"))
        .await
        .unwrap();
    assert_eq!(correction.accuracy_rating, 2);

    env.plane.tag_correction("c1", "hallucination").await.unwrap();
    env.plane.tag_correction("c1", "formatting").await.unwrap();
    // Tagging twice with the same name attaches the same tag once.
    env.plane.tag_correction("c1", "hallucination").await.unwrap();

    let tags = env.plane.correction_tags("c1").await.unwrap();
    let names: Vec<&str> = tags.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["formatting", "hallucination"]);

    assert!(env.plane.tag_correction("no-such", "x").await.is_err());
}

#[tokio::test]
async fn correction_in_a_run_selection_cannot_be_deleted() {
    let env = test_env().await;
    register_model(&env, "student-1").await;
    env.plane
        .record_correction(&correction_input("c1"))
        .await
        .unwrap();

    let spec = RunSpec {
        student_model_id: "student-1".to_string(),
        base_version_id: None,
        teacher_model_id: None,
        method: TrainingMethod::FineTune,
        hyperparams: Hyperparams::default(),
        seed: None,
        corrections: vec![distill_control::RunSelection {
            id: "c1".to_string(),
            split: Split::Train,
            weight: 1.0,
        }],
        datasets: vec![],
    };
    env.plane.create_run(spec).await.unwrap();

    assert!(env.plane.delete_correction("c1").await.is_err());

    // An unreferenced correction deletes cleanly, tags included.
    env.plane
        .record_correction(&correction_input("c2"))
        .await
        .unwrap();
    env.plane.tag_correction("c2", "stale").await.unwrap();
    assert_eq!(env.plane.delete_correction("c2").await.unwrap(), 1);
}

#[tokio::test]
async fn dataset_with_recorded_metrics_cannot_be_deleted() {
    let env = test_env().await;
    register_model(&env, "m1").await;
    let v1 = register_version(&env, "m1", "v1").await;
    record_metric(&env, &v1.version_id, "d1", "bleu", 0.4).await;

    assert!(env.plane.delete_dataset("d1").await.is_err());
}

#[tokio::test]
async fn dataset_items_round_trip() {
    let env = test_env().await;
    env.plane
        .create_dataset(&DatasetInput {
            dataset_id: "d1".to_string(),
            name: "golden".to_string(),
            dataset_type: "golden".to_string(),
            description: Some("hand-checked".to_string()),
        })
        .await
        .unwrap();
    env.plane
        .add_dataset_item(&DatasetItemInput {
            item_id: "i1".to_string(),
            dataset_id: "d1".to_string(),
            prompt: "What is distillation?".to_string(),
            expected_output: Some("Training a student on teacher outputs".to_string()),
            metadata_json: None,
            source_correction_id: None,
        })
        .await
        .unwrap();

    let items = env.plane.list_dataset_items("d1").await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].item_id, "i1");

    let datasets = env.plane.list_datasets().await.unwrap();
    assert_eq!(datasets.len(), 1);
    assert_eq!(datasets[0].dataset_type, "golden");

    // Unreferenced: deletable, items go with it.
    assert_eq!(env.plane.delete_dataset("d1").await.unwrap(), 1);
    assert!(env.plane.list_dataset_items("d1").await.unwrap().is_empty());
}

#[tokio::test]
async fn queued_run_must_be_cancelled_before_deletion() {
    let env = test_env().await;
    register_model(&env, "student-1").await;
    env.plane
        .record_correction(&correction_input("c1"))
        .await
        .unwrap();

    let spec = RunSpec {
        student_model_id: "student-1".to_string(),
        base_version_id: None,
        teacher_model_id: None,
        method: TrainingMethod::KnowledgeDistillation,
        hyperparams: Hyperparams::default(),
        seed: None,
        corrections: vec![distill_control::RunSelection {
            id: "c1".to_string(),
            split: Split::Train,
            weight: 1.0,
        }],
        datasets: vec![],
    };
    let run_id = env.plane.create_run(spec).await.unwrap();
    assert!(env.plane.delete_run(&run_id).await.is_err());

    // A run that never started has no worker; cancelling it goes straight to
    // a terminal state, after which deletion is allowed.
    env.plane.cancel_training(&run_id).await.unwrap();
    let run = env.plane.get_run(&run_id).await.unwrap();
    assert_eq!(run.status, TrainingStatus::Cancelled);
    assert!(run.end_time.is_some());

    assert_eq!(env.plane.delete_run(&run_id).await.unwrap(), 1);
    assert!(env.plane.get_run(&run_id).await.is_err());
}

#[tokio::test]
async fn terminal_run_always_gets_an_end_time() {
    let env = test_env().await;
    register_model(&env, "student-1").await;
    env.plane
        .record_correction(&correction_input("c1"))
        .await
        .unwrap();

    let spec = RunSpec {
        student_model_id: "student-1".to_string(),
        base_version_id: None,
        teacher_model_id: None,
        method: TrainingMethod::FineTune,
        hyperparams: Hyperparams::default(),
        seed: None,
        corrections: vec![distill_control::RunSelection {
            id: "c1".to_string(),
            split: Split::Train,
            weight: 1.0,
        }],
        datasets: vec![],
    };
    let run_id = env.plane.create_run(spec).await.unwrap();

    let runs = TrainingRunRepository::new(env.plane.db());
    runs.transition(&run_id, TrainingStatus::Running, None, None)
        .await
        .unwrap();
    // First terminal writer carries no timestamp; the repeated notification
    // from the exit monitor backfills it without touching anything else.
    runs.transition(
        &run_id,
        TrainingStatus::Failed,
        None,
        Some("loss exploded".to_string()),
    )
    .await
    .unwrap();
    runs.transition(
        &run_id,
        TrainingStatus::Failed,
        Some("2026-08-30T00:00:00Z".to_string()),
        None,
    )
    .await
    .unwrap();

    let run = env.plane.get_run(&run_id).await.unwrap();
    assert_eq!(run.status, TrainingStatus::Failed);
    assert_eq!(run.end_time.as_deref(), Some("2026-08-30T00:00:00Z"));
    assert_eq!(run.failure_reason.as_deref(), Some("loss exploded"));
}

#[tokio::test]
async fn run_soft_labels_export_as_jsonl() {
    let env = test_env().await;
    register_model(&env, "teacher-1").await;
    register_model(&env, "student-1").await;
    env.plane
        .record_correction(&correction_input("c1"))
        .await
        .unwrap();

    let spec = RunSpec {
        student_model_id: "student-1".to_string(),
        base_version_id: None,
        teacher_model_id: Some("teacher-1".to_string()),
        method: TrainingMethod::KnowledgeDistillation,
        hyperparams: Hyperparams::default(),
        seed: None,
        corrections: vec![distill_control::RunSelection {
            id: "c1".to_string(),
            split: Split::Train,
            weight: 1.0,
        }],
        datasets: vec![],
    };
    let run_id = env.plane.create_run(spec).await.unwrap();

    let generated = env
        .plane
        .generate_soft_labels(
            &["What is distillation?".to_string()],
            "teacher-1",
            2.0,
            SoftLabelKind::Logits,
        )
        .await
        .unwrap();
    env.plane
        .soft_labels()
        .link_to_run(&run_id, &generated.soft_label_ids)
        .await
        .unwrap();

    let jsonl = env.plane.soft_labels().export_run_jsonl(&run_id).await.unwrap();
    assert_eq!(jsonl.lines().count(), 1);
    let row: serde_json::Value = serde_json::from_str(jsonl.lines().next().unwrap()).unwrap();
    assert_eq!(row["prompt"], "What is distillation?");
    assert_eq!(row["soft_label_type"], "logits");
    assert!(row["soft_labels_b64"].is_string());
}

#[tokio::test]
async fn lineage_walks_parent_chain() {
    let env = test_env().await;
    register_model(&env, "m1").await;
    let v1 = register_version(&env, "m1", "v1").await;

    let artifact_path = env.data_dir.join("artifact-v2.bin");
    std::fs::write(&artifact_path, "weights-v2").unwrap();
    let v2 = env
        .plane
        .register_version(
            None,
            "m1",
            Some(&v1.version_id),
            ArtifactDescriptor {
                path: artifact_path.to_string_lossy().to_string(),
                hash: None,
                size_bytes: None,
            },
            None,
        )
        .await
        .unwrap();

    let lineage = env.plane.version_lineage(&v2.version_id, 10).await.unwrap();
    assert_eq!(lineage.len(), 1);
    assert_eq!(lineage[0].version_id, v1.version_id);
}
