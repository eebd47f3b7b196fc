// End-to-end pipeline runs through the public API

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stagehand_engine::artifacts::ManualClock;
use stagehand_engine::execution::{progress_channel, FailureReason, SkipReason};
use stagehand_engine::parser::RegistryCredentials;
use stagehand_engine::{
    ArtifactStore, ComposeError, EngineConfig, ExecutionEvent, FsArtifactStore, JobStatus,
    ManifestComposer, ManifestPublisher, PipelineExecutor, PipelineParser, PipelineReport,
    PipelineStatus, PipelineTrigger, Planner, ShellRunner, TriggerSource,
};

const PIPELINE: &str = r#"
stages: [build, test, image, release, deploy]

variables:
  PKG: dolfiny
  REGISTRY: registry.example.com/dolfiny

.python:
  variables:
    PIP_CACHE_DIR: .cache/pip
  before_script:
    - echo "preparing $PKG"

build:
  extends: .python
  stage: build
  script:
    - mkdir -p dist
    - echo "$PKG-$(cat VERSION)" > dist/wheel.txt
  artifacts:
    paths: [dist/]
    expire_in: 1 hour

docs:
  stage: build
  script: echo docs
  rules:
    - changes: ["docs/**"]

test:
  extends: .python
  stage: test
  parallel:
    matrix:
      - PY: ["3.11", "3.12"]
  script:
    - test "$(cat dist/wheel.txt)" = "dolfiny-1.2.3"
    - test "$PY" != "$FAIL_PY"
    - echo "tested on $PY"

image:
  stage: image
  parallel:
    matrix:
      - ARCH: [amd64, arm64]
  script: echo "built $REGISTRY:$ARCH"

release:
  stage: release
  compose:
    repository: $REGISTRY
    sources: image
    architectures: [amd64, arm64]
    source_image: $REGISTRY:$ARCH
    tags:
      - if: $CI_COMMIT_BRANCH == $CI_DEFAULT_BRANCH
        tag: latest

deploy:
  stage: deploy
  when: manual
  script: echo "deploying $CI_COMMIT_REF_SLUG"
"#;

#[derive(Default)]
struct RecordingPublisher {
    published: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl ManifestPublisher for RecordingPublisher {
    async fn login(&self, _registry: &RegistryCredentials) -> Result<(), ComposeError> {
        Ok(())
    }

    async fn publish(
        &self,
        reference: &str,
        _images: &BTreeMap<String, String>,
    ) -> Result<Option<String>, ComposeError> {
        self.published.lock().unwrap().push(reference.to_string());
        Ok(Some("sha256:feed".to_string()))
    }
}

struct Fixture {
    project: tempfile::TempDir,
    artifacts: tempfile::TempDir,
    clock: Arc<ManualClock>,
    publisher: Arc<RecordingPublisher>,
}

impl Fixture {
    fn new() -> Self {
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join("VERSION"), "1.2.3\n").unwrap();
        Self {
            project,
            artifacts: tempfile::tempdir().unwrap(),
            clock: Arc::new(ManualClock::default()),
            publisher: Arc::new(RecordingPublisher::default()),
        }
    }

    fn engine(&self) -> EngineConfig {
        EngineConfig::new("dolfiny")
            .with_default_branch("master")
            .with_project_dir(self.project.path())
            .with_artifact_dir(self.artifacts.path())
            .with_max_parallel_jobs(2)
    }

    fn store(&self) -> Arc<FsArtifactStore> {
        Arc::new(FsArtifactStore::with_clock(
            self.artifacts.path(),
            "dolfiny",
            self.clock.clone(),
        ))
    }

    fn executor(&self, trigger: PipelineTrigger) -> PipelineExecutor {
        let config = PipelineParser::parse(PIPELINE).unwrap();
        let engine = self.engine();
        let plan = Planner::new(&config, &engine).plan(&trigger).unwrap();
        PipelineExecutor::new(plan, Arc::new(ShellRunner::new()), self.store())
            .with_config(engine)
            .with_composer(ManifestComposer::new(self.publisher.clone()))
    }
}

fn push(git_ref: &str) -> PipelineTrigger {
    PipelineTrigger::new(git_ref, TriggerSource::Push).with_changed_paths(["src/solver.py"])
}

fn logs(report: &PipelineReport, job: &str) -> Vec<String> {
    report.job(job).map(|j| j.logs.clone()).unwrap_or_default()
}

#[tokio::test]
async fn test_default_branch_run_publishes_latest_manifest() {
    let fixture = Fixture::new();
    let (tx, mut rx) = progress_channel();
    let mut report = fixture
        .executor(push("master"))
        .with_progress(tx)
        .execute()
        .await;

    assert_eq!(report.status, PipelineStatus::Succeeded);

    let docs = report.job("docs").unwrap();
    assert_eq!(docs.skip_reason, Some(SkipReason::Rules));

    assert!(logs(&report, "build").contains(&"$ echo \"preparing $PKG\"".to_string()));
    assert!(logs(&report, "build").contains(&"preparing dolfiny".to_string()));
    assert!(logs(&report, "test: [3.11]").contains(&"tested on 3.11".to_string()));
    assert!(logs(&report, "test: [3.12]").contains(&"tested on 3.12".to_string()));

    let manifest = report.manifests().next().unwrap();
    assert_eq!(manifest.reference, "registry.example.com/dolfiny:latest");
    assert_eq!(manifest.architectures(), vec!["amd64", "arm64"]);
    assert_eq!(manifest.digest.as_deref(), Some("sha256:feed"));
    assert_eq!(
        *fixture.publisher.published.lock().unwrap(),
        vec!["registry.example.com/dolfiny:latest".to_string()]
    );

    assert_eq!(report.job("deploy").unwrap().status, JobStatus::Manual);

    let mut first = None;
    let mut last = None;
    while let Ok(event) = rx.try_recv() {
        if first.is_none() {
            first = Some(event.clone());
        }
        last = Some(event);
    }
    assert!(matches!(first, Some(ExecutionEvent::PipelineStarted { total_stages: 5, .. })));
    assert!(matches!(last, Some(ExecutionEvent::PipelineCompleted { .. })));

    // The manual deploy can be played after the run
    let executor = fixture.executor(push("master"));
    let outcome = executor.play(&mut report, "deploy").await.unwrap();
    assert!(outcome.succeeded());
    assert!(outcome.logs.contains(&"deploying master".to_string()));
    assert_eq!(report.pending_manual().count(), 0);
    assert!(report.succeeded());
}

#[tokio::test]
async fn test_branch_run_tags_manifest_with_ref_slug() {
    let fixture = Fixture::new();
    let report = fixture.executor(push("feature/New_Solver")).execute().await;

    assert!(report.succeeded());
    let manifest = report.manifests().next().unwrap();
    assert_eq!(
        manifest.reference,
        "registry.example.com/dolfiny:feature-new-solver"
    );
}

#[tokio::test]
async fn test_failed_matrix_instance_stops_release() {
    let fixture = Fixture::new();
    let trigger = push("master").with_variable("FAIL_PY", "3.12");
    let report = fixture.executor(trigger).execute().await;

    assert_eq!(report.status, PipelineStatus::Failed);
    assert!(report.job("test: [3.11]").unwrap().succeeded());

    let failed = report.job("test: [3.12]").unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(
        failed.failure,
        Some(FailureReason::ScriptFailure { exit_code: Some(1) })
    );

    for job in ["image: [amd64]", "release", "deploy"] {
        assert_eq!(
            report.job(job).unwrap().skip_reason,
            Some(SkipReason::UpstreamFailure),
            "{} should be skipped",
            job
        );
    }
    assert!(fixture.publisher.published.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_artifacts_expire_and_are_reaped() {
    let fixture = Fixture::new();
    let report = fixture.executor(push("master")).execute().await;
    assert!(report.succeeded());

    let store = fixture.store();
    let handle = store.latest("build", "master").await.unwrap();
    assert_eq!(Some(&handle), report.job("build").unwrap().artifacts.as_ref());

    let files = store.fetch(&handle).await.unwrap();
    assert_eq!(files["dist/wheel.txt"], b"dolfiny-1.2.3\n".to_vec());

    fixture.clock.advance(Duration::from_secs(2 * 60 * 60));
    assert!(store.fetch(&handle).await.unwrap_err().is_not_found());
    assert_eq!(store.reap_expired().await.unwrap(), 1);
    assert!(store.list().await.unwrap().is_empty());
}
