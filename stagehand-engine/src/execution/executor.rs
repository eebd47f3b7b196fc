// Pipeline Executor
// Runs a plan stage by stage with bounded concurrency, manual gating, timeouts and cancellation

use crate::artifacts::{ArtifactFiles, ArtifactHandle, ArtifactStore};
use crate::compose::{collect_arch_images, manifest_target, ManifestComposer, SourceBuild};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::execution::context::expand_variables;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::gate::{GateDecision, ManualGate};
use crate::execution::plan::{ExecutionMode, PipelinePlan, ResolvedJob};
use crate::execution::report::{
    FailureReason, JobOutcome, JobStatus, PipelineReport, PipelineStatus, SkipReason, StageReport,
};
use crate::rules::RuleScope;
use crate::runners::workspace::copy_tree;
use crate::runners::{JobRunner, JobWorkspace, OutputSink, RunRequest};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Why a job stopped before succeeding
enum JobError {
    Failed(FailureReason),
    Cancelled,
}

impl From<FailureReason> for JobError {
    fn from(reason: FailureReason) -> Self {
        JobError::Failed(reason)
    }
}

/// Why later stages do not start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    UpstreamFailure,
    Cancelled,
}

/// Latest outcome of every job instance, shared with running jobs
#[derive(Default)]
struct JobBoard {
    outcomes: Mutex<HashMap<String, JobOutcome>>,
    changed: Notify,
}

impl JobBoard {
    fn from_outcomes<'a>(outcomes: impl Iterator<Item = &'a JobOutcome>) -> Self {
        let board = Self::default();
        board
            .lock()
            .extend(outcomes.map(|outcome| (outcome.name.clone(), outcome.clone())));
        board
    }

    fn record(&self, outcome: JobOutcome) {
        self.lock().insert(outcome.name.clone(), outcome);
        self.changed.notify_waiters();
    }

    fn get(&self, name: &str) -> Option<JobOutcome> {
        self.lock().get(name).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobOutcome>> {
        self.outcomes.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Everything a spawned job task needs
struct JobContext {
    plan: Arc<PipelinePlan>,
    config: EngineConfig,
    runner: Arc<dyn JobRunner>,
    store: Arc<dyn ArtifactStore>,
    composer: Option<Arc<ManifestComposer>>,
    gate: ManualGate,
    cancel: CancellationToken,
    event_tx: Option<ProgressSender>,
    board: JobBoard,
    permits: Arc<Semaphore>,
}

/// Pipeline executor
pub struct PipelineExecutor {
    plan: Arc<PipelinePlan>,
    config: EngineConfig,
    runner: Arc<dyn JobRunner>,
    store: Arc<dyn ArtifactStore>,
    composer: Option<Arc<ManifestComposer>>,
    gate: ManualGate,
    cancel: CancellationToken,
    event_tx: Option<ProgressSender>,
}

impl PipelineExecutor {
    pub fn new(plan: PipelinePlan, runner: Arc<dyn JobRunner>, store: Arc<dyn ArtifactStore>) -> Self {
        let config = EngineConfig::new(plan.project.clone());
        Self {
            plan: Arc::new(plan),
            config,
            runner,
            store,
            composer: None,
            gate: ManualGate::new(),
            cancel: CancellationToken::new(),
            event_tx: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_composer(mut self, composer: ManifestComposer) -> Self {
        self.composer = Some(Arc::new(composer));
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_gate(mut self, gate: ManualGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn plan(&self) -> &PipelinePlan {
        &self.plan
    }

    pub fn gate(&self) -> &ManualGate {
        &self.gate
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn context(&self, board: JobBoard) -> Arc<JobContext> {
        let permits = match self.config.max_parallel_jobs {
            0 => Semaphore::MAX_PERMITS,
            n => n,
        };
        Arc::new(JobContext {
            plan: self.plan.clone(),
            config: self.config.clone(),
            runner: self.runner.clone(),
            store: self.store.clone(),
            composer: self.composer.clone(),
            gate: self.gate.clone(),
            cancel: self.cancel.clone(),
            event_tx: self.event_tx.clone(),
            board,
            permits: Arc::new(Semaphore::new(permits)),
        })
    }

    /// Execute every stage in order
    ///
    /// Manual jobs that were not played hold no stage back, and jobs depending on
    /// them fail at once. Once the last stage finishes the gate is closed and
    /// unplayed manual jobs are reported as `manual`.
    pub async fn execute(&self) -> PipelineReport {
        let start = Instant::now();
        let plan = &self.plan;
        let ctx = self.context(JobBoard::default());

        tracing::info!(
            project = %plan.project,
            git_ref = %plan.trigger.git_ref,
            stages = plan.batches.len(),
            "pipeline started"
        );
        self.event_tx.send_event(ExecutionEvent::pipeline_started(
            &plan.project,
            &plan.trigger.git_ref,
            plan.batches.len(),
        ));

        let mut manual_tasks = JoinSet::new();
        let mut stage_durations = Vec::with_capacity(plan.batches.len());
        let mut halt: Option<Halt> = None;

        for batch in &plan.batches {
            if halt.is_none() && self.cancel.is_cancelled() {
                halt = Some(Halt::Cancelled);
            }
            if let Some(reason) = halt {
                for job in &batch.jobs {
                    let outcome = Self::halted_outcome(job, reason);
                    if let Some(skip) = outcome.skip_reason {
                        self.event_tx
                            .send_event(ExecutionEvent::job_skipped(&job.stage, &job.name, skip));
                    }
                    ctx.board.record(outcome);
                }
                stage_durations.push(Duration::ZERO);
                continue;
            }

            let stage_start = Instant::now();
            tracing::info!(stage = %batch.stage, jobs = batch.jobs.len(), "stage started");
            self.event_tx
                .send_event(ExecutionEvent::stage_started(&batch.stage, batch.jobs.len()));

            let mut running = JoinSet::new();
            for job in &batch.jobs {
                match job.mode {
                    ExecutionMode::Skip => {
                        self.event_tx.send_event(ExecutionEvent::job_skipped(
                            &job.stage,
                            &job.name,
                            SkipReason::Rules,
                        ));
                        ctx.board.record(Self::new_outcome(job).skip(SkipReason::Rules));
                    }
                    ExecutionMode::Manual if !self.gate.is_advanced(&job.name, &job.job) => {
                        self.event_tx
                            .send_event(ExecutionEvent::job_awaiting_manual(&job.stage, &job.name));
                        let mut pending = Self::new_outcome(job);
                        pending.status = JobStatus::Manual;
                        ctx.board.record(pending);
                        manual_tasks.spawn(Self::await_manual(ctx.clone(), job.clone()));
                    }
                    _ => {
                        running.spawn(run_job(ctx.clone(), job.clone()));
                    }
                }
            }

            while let Some(joined) = running.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(stage = %batch.stage, error = %e, "job task failed");
                }
            }

            let outcomes: Vec<JobOutcome> = batch
                .jobs
                .iter()
                .filter_map(|job| ctx.board.get(&job.name))
                .collect();
            let status = StageReport::derive_status(&outcomes);
            if outcomes.iter().any(|o| o.status == JobStatus::Canceled) {
                halt = Some(Halt::Cancelled);
            } else if outcomes.iter().any(JobOutcome::is_blocking_failure) {
                tracing::warn!(stage = %batch.stage, "stage failed, later stages will not start");
                halt = Some(Halt::UpstreamFailure);
            }

            let duration = stage_start.elapsed();
            tracing::info!(stage = %batch.stage, status = %status, ?duration, "stage completed");
            self.event_tx
                .send_event(ExecutionEvent::stage_completed(&batch.stage, status, duration));
            stage_durations.push(duration);
        }

        self.gate.close();
        while let Some(joined) = manual_tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "manual job task failed");
            }
        }

        let mut report = self.build_report(&ctx.board, &stage_durations, start.elapsed());
        if halt == Some(Halt::Cancelled) {
            report.status = PipelineStatus::Canceled;
        }
        report.refresh_status();

        tracing::info!(
            project = %report.project,
            status = %report.status,
            duration = ?report.duration,
            "pipeline completed"
        );
        self.event_tx.send_event(ExecutionEvent::pipeline_completed(
            &report.project,
            report.status,
            report.duration,
        ));
        report
    }

    /// Run a manual job left pending by `execute`, updating the report
    ///
    /// `job` is an instance name, or a logical name with a single pending instance.
    pub async fn play(&self, report: &mut PipelineReport, job: &str) -> EngineResult<JobOutcome> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let pending: Vec<String> = report
            .pending_manual()
            .filter(|outcome| outcome.name == job)
            .chain(report.pending_manual().filter(|outcome| outcome.job == job && outcome.name != job))
            .map(|outcome| outcome.name.clone())
            .collect();
        let instance = match pending.as_slice() {
            [] if report.job(job).is_some() || report.jobs().any(|o| o.job == job) => {
                return Err(EngineError::NotManual(job.to_string()))
            }
            [] => return Err(EngineError::UnknownJob(job.to_string())),
            [only] => only.clone(),
            [first, ..] if first == job => first.clone(),
            _ => return Err(EngineError::AmbiguousJob(job.to_string())),
        };

        let resolved = self
            .plan
            .job(&instance)
            .cloned()
            .ok_or_else(|| EngineError::UnknownJob(instance.clone()))?;

        tracing::info!(job = %instance, "playing manual job");
        let ctx = self.context(JobBoard::from_outcomes(report.jobs()));
        let outcome = run_job(ctx, resolved).await;

        if let Some(slot) = report
            .stages
            .iter_mut()
            .flat_map(|stage| stage.jobs.iter_mut())
            .find(|existing| existing.name == instance)
        {
            *slot = outcome.clone();
        }
        report.refresh_status();
        Ok(outcome)
    }

    async fn await_manual(ctx: Arc<JobContext>, job: ResolvedJob) {
        match ctx.gate.wait(&job.name, &job.job, &ctx.cancel).await {
            GateDecision::Played => {
                run_job(ctx, job).await;
            }
            GateDecision::Closed | GateDecision::Cancelled => {
                tracing::debug!(job = %job.name, "manual job not played");
            }
        }
    }

    fn new_outcome(job: &ResolvedJob) -> JobOutcome {
        let mut outcome = JobOutcome::new(&job.name, &job.job, &job.stage, job.mode);
        outcome.allow_failure = job.allow_failure;
        outcome.matrix = job.matrix.clone();
        outcome
    }

    fn halted_outcome(job: &ResolvedJob, halt: Halt) -> JobOutcome {
        let outcome = Self::new_outcome(job);
        match (job.mode, halt) {
            (ExecutionMode::Skip, _) => outcome.skip(SkipReason::Rules),
            (_, Halt::UpstreamFailure) => outcome.skip(SkipReason::UpstreamFailure),
            (ExecutionMode::Manual, Halt::Cancelled) => {
                let mut outcome = outcome;
                outcome.status = JobStatus::Manual;
                outcome
            }
            (ExecutionMode::Always, Halt::Cancelled) => {
                let mut outcome = outcome;
                outcome.status = JobStatus::Canceled;
                outcome
            }
        }
    }

    fn build_report(&self, board: &JobBoard, durations: &[Duration], duration: Duration) -> PipelineReport {
        let stages = self
            .plan
            .batches
            .iter()
            .zip(durations.iter().copied().chain(std::iter::repeat(Duration::ZERO)))
            .map(|(batch, stage_duration)| {
                let jobs: Vec<JobOutcome> = batch
                    .jobs
                    .iter()
                    .map(|job| match board.get(&job.name) {
                        Some(outcome) if outcome.status.is_terminal() => outcome,
                        Some(outcome) => outcome.fail(FailureReason::Runner(
                            "job task ended without a result".to_string(),
                        )),
                        None => {
                            let mut outcome = Self::new_outcome(job);
                            outcome.status = JobStatus::Canceled;
                            outcome
                        }
                    })
                    .collect();
                StageReport {
                    name: batch.stage.clone(),
                    status: StageReport::derive_status(&jobs),
                    jobs,
                    duration: stage_duration,
                }
            })
            .collect();

        PipelineReport {
            project: self.plan.project.clone(),
            git_ref: self.plan.trigger.git_ref.clone(),
            status: PipelineStatus::Running,
            stages,
            duration,
        }
    }
}

/// Run one job instance to a terminal outcome and publish it on the board
async fn run_job(ctx: Arc<JobContext>, job: ResolvedJob) -> JobOutcome {
    let mut outcome = PipelineExecutor::new_outcome(&job);

    let permit = tokio::select! {
        permit = ctx.permits.clone().acquire_owned() => permit.ok(),
        _ = ctx.cancel.cancelled() => None,
    };
    let Some(_permit) = permit else {
        outcome.status = JobStatus::Canceled;
        ctx.board.record(outcome.clone());
        return outcome;
    };

    let start = Instant::now();
    outcome.status = JobStatus::Running;
    ctx.board.record(outcome.clone());
    ctx.event_tx
        .send_event(ExecutionEvent::job_started(&job.stage, &job.name, job.image.clone()));
    tracing::info!(job = %job.name, stage = %job.stage, "job started");

    let result = execute_job(&ctx, &job, &mut outcome).await;
    outcome.duration = start.elapsed();
    match result {
        Ok(()) => outcome.status = JobStatus::Succeeded,
        Err(JobError::Failed(reason)) => {
            tracing::warn!(
                job = %job.name,
                allow_failure = job.allow_failure,
                reason = %reason,
                "job failed"
            );
            outcome = outcome.fail(reason);
        }
        Err(JobError::Cancelled) => outcome.status = JobStatus::Canceled,
    }

    tracing::info!(job = %job.name, status = %outcome.status, duration = ?outcome.duration, "job completed");
    ctx.event_tx.send_event(ExecutionEvent::JobCompleted {
        stage_name: job.stage.clone(),
        job_name: job.name.clone(),
        status: outcome.status,
        allow_failure: outcome.allow_failure,
        exit_code: outcome.exit_code,
        duration: outcome.duration,
    });
    ctx.board.record(outcome.clone());
    outcome
}

async fn execute_job(ctx: &JobContext, job: &ResolvedJob, outcome: &mut JobOutcome) -> Result<(), JobError> {
    let inputs = gather_inputs(ctx, job).await?;

    if job.has_script() {
        run_script(ctx, job, inputs, outcome).await?;
    }

    if job.compose.is_some() {
        compose_manifest(ctx, job, outcome).await?;
    }
    Ok(())
}

/// Prepare the workspace, run the script under the job timeout and publish artifacts
async fn run_script(
    ctx: &JobContext,
    job: &ResolvedJob,
    inputs: ArtifactFiles,
    outcome: &mut JobOutcome,
) -> Result<(), JobError> {
    let workspace_error = |e: std::io::Error| FailureReason::Runner(format!("workspace: {}", e));

    let workspace = JobWorkspace::create(ctx.config.builds_dir.as_deref()).map_err(workspace_error)?;
    if let Some(project_dir) = &ctx.config.project_dir {
        let (source, target) = (project_dir.clone(), workspace.path().to_path_buf());
        tokio::task::spawn_blocking(move || copy_tree(&source, &target))
            .await
            .map_err(|e| FailureReason::Runner(e.to_string()))?
            .map_err(workspace_error)?;
    }
    workspace.write_files(&inputs).map_err(workspace_error)?;

    let mut env = job.variables.clone();
    env.insert(
        "CI_PROJECT_DIR".to_string(),
        workspace.path().display().to_string(),
    );
    let env: HashMap<String, String> = env.into_iter().collect();

    let sink: OutputSink = {
        let events = ctx.event_tx.clone();
        let (stage, name) = (job.stage.clone(), job.name.clone());
        Arc::new(move |line: &str, is_error: bool| {
            events.send_event(ExecutionEvent::job_output(&stage, &name, line, is_error));
        })
    };

    let request = RunRequest {
        job,
        env: &env,
        workspace: workspace.path(),
        output: Some(sink),
    };
    let run = tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(JobError::Cancelled),
        run = tokio::time::timeout(job.timeout, ctx.runner.run(request)) => run,
    };

    let output = match run {
        Err(_) => return Err(FailureReason::Timeout(job.timeout).into()),
        Ok(Err(e)) => return Err(FailureReason::Runner(e.to_string()).into()),
        Ok(Ok(output)) => output,
    };
    outcome.exit_code = output.exit_code;
    outcome.logs = output.logs.clone();
    if !output.succeeded() {
        return Err(FailureReason::ScriptFailure {
            exit_code: output.exit_code,
        }
        .into());
    }

    let Some(spec) = &job.artifacts else {
        return Ok(());
    };
    if output.artifact_paths.is_empty() {
        ctx.event_tx.send_event(ExecutionEvent::warning(
            "no files matched artifacts.paths",
            Some(job.stage.clone()),
            Some(job.name.clone()),
        ));
        return Ok(());
    }

    let files = workspace
        .read_files(&output.artifact_paths)
        .map_err(|e| FailureReason::Artifacts(e.to_string()))?;
    let count = files.len();
    let retention = spec.expire_in.unwrap_or(ctx.config.default_retention);
    let handle = ctx
        .store
        .publish(&job.name, &ctx.plan.trigger.git_ref, files, retention)
        .await
        .map_err(|e| FailureReason::Artifacts(e.to_string()))?;

    ctx.event_tx.send_event(ExecutionEvent::ArtifactsPublished {
        job_name: job.name.clone(),
        handle: handle.to_string(),
        files: count,
    });
    outcome.artifacts = Some(handle);
    Ok(())
}

/// Artifacts handed to a job before its script runs
///
/// With `dependencies` the named jobs are awaited and an unplayed manual one
/// fails the job; without it every finished job of an earlier stage contributes.
async fn gather_inputs(ctx: &JobContext, job: &ResolvedJob) -> Result<ArtifactFiles, JobError> {
    let mut handles: Vec<ArtifactHandle> = Vec::new();
    match &job.dependencies {
        Some(dependencies) => {
            for dependency in dependencies {
                for instance in ctx.plan.instances_of(dependency) {
                    let upstream = wait_for(ctx, instance).await?;
                    if upstream.status == JobStatus::Manual {
                        return Err(FailureReason::MissingDependency(format!(
                            "manual job '{}' was not played",
                            instance.name
                        ))
                        .into());
                    }
                    handles.extend(upstream.artifacts);
                }
            }
        }
        None => {
            let position = ctx.plan.stage_position(&job.stage);
            handles.extend(
                ctx.plan
                    .jobs()
                    .filter(|upstream| ctx.plan.stage_position(&upstream.stage) < position)
                    .filter_map(|upstream| ctx.board.get(&upstream.name))
                    .filter_map(|upstream| upstream.artifacts),
            );
        }
    }

    let mut files = ArtifactFiles::new();
    for handle in handles {
        let fetched = ctx
            .store
            .fetch(&handle)
            .await
            .map_err(|e| FailureReason::MissingDependency(e.to_string()))?;
        files.extend(fetched);
    }
    Ok(files)
}

/// Wait until an upstream instance is terminal
///
/// A manual instance that has not been played when this is called is returned
/// as is; only played ones are awaited.
async fn wait_for(ctx: &JobContext, upstream: &ResolvedJob) -> Result<JobOutcome, JobError> {
    loop {
        let notified = ctx.board.changed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(outcome) = ctx.board.get(&upstream.name) {
            match outcome.status {
                JobStatus::Manual if !ctx.gate.is_advanced(&upstream.name, &upstream.job) => {
                    return Ok(outcome)
                }
                JobStatus::Manual | JobStatus::Pending | JobStatus::Running => {}
                _ => return Ok(outcome),
            }
        }

        tokio::select! {
            _ = &mut notified => {}
            _ = ctx.cancel.cancelled() => return Err(JobError::Cancelled),
        }
    }
}

/// Fan-in: gather one image per architecture from the source jobs and publish
async fn compose_manifest(ctx: &JobContext, job: &ResolvedJob, outcome: &mut JobOutcome) -> Result<(), JobError> {
    let Some(compose) = &job.compose else {
        return Ok(());
    };
    let Some(composer) = &ctx.composer else {
        return Err(FailureReason::Compose("no manifest publisher configured".to_string()).into());
    };

    let mut builds = Vec::new();
    for source in &compose.sources {
        for instance in ctx.plan.instances_of(source) {
            let upstream = wait_for(ctx, instance).await?;
            builds.push(SourceBuild {
                job: instance.name.clone(),
                arch: instance.variables.get(&compose.arch_variable).cloned(),
                status: upstream.status,
                image: expand_variables(&compose.source_image, &instance.variables),
            });
        }
    }

    let compose_error = |e: crate::compose::ComposeError| FailureReason::Compose(e.to_string());
    let images = collect_arch_images(&compose.architectures, &builds).map_err(compose_error)?;
    let scope = RuleScope::new(&ctx.plan.trigger, &job.variables);
    let target = manifest_target(compose, &scope, &job.variables).map_err(compose_error)?;

    let manifest = tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(JobError::Cancelled),
        manifest = composer.compose(&target, &images) => manifest.map_err(compose_error)?,
    };

    ctx.event_tx.send_event(ExecutionEvent::ManifestPublished {
        job_name: job.name.clone(),
        reference: manifest.reference.clone(),
        architectures: manifest.architectures(),
    });
    outcome.manifest = Some(manifest);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::FsArtifactStore;
    use crate::compose::{ComposeError, ManifestPublisher};
    use crate::execution::events::progress_channel;
    use crate::execution::plan::Planner;
    use crate::execution::report::StageStatus;
    use crate::parser::models::RegistryCredentials;
    use crate::parser::PipelineParser;
    use crate::runners::ShellRunner;
    use crate::trigger::{PipelineTrigger, TriggerSource};
    use std::collections::BTreeMap;

    struct Harness {
        _artifacts: tempfile::TempDir,
        store: Arc<FsArtifactStore>,
        executor: PipelineExecutor,
    }

    fn harness(yaml: &str, trigger: PipelineTrigger) -> Harness {
        let artifacts = tempfile::tempdir().unwrap();
        let config = PipelineParser::parse(yaml).unwrap();
        let engine = EngineConfig::new("dolfiny")
            .with_default_branch("master")
            .with_artifact_dir(artifacts.path());
        let plan = Planner::new(&config, &engine).plan(&trigger).unwrap();
        let store = Arc::new(FsArtifactStore::new(artifacts.path(), "dolfiny"));
        let executor = PipelineExecutor::new(plan, Arc::new(ShellRunner::new()), store.clone())
            .with_config(engine);
        Harness {
            _artifacts: artifacts,
            store,
            executor,
        }
    }

    fn push(git_ref: &str) -> PipelineTrigger {
        PipelineTrigger::new(git_ref, TriggerSource::Push)
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let yaml = r#"
stages: [build, test]
build:
  stage: build
  script: echo built
unit:
  stage: test
  script: echo tested
"#;
        let h = harness(yaml, push("master"));
        let report = h.executor.execute().await;

        assert_eq!(report.status, PipelineStatus::Succeeded);
        assert_eq!(report.stages.len(), 2);
        assert!(report.job("unit").unwrap().logs.contains(&"tested".to_string()));
    }

    #[tokio::test]
    async fn test_required_failure_skips_later_stages() {
        let yaml = r#"
stages: [lint, test, deploy]
lint:
  stage: lint
  script: exit 1
docs:
  stage: lint
  script: echo docs
unit:
  stage: test
  script: echo never
"#;
        let h = harness(yaml, push("master"));
        let report = h.executor.execute().await;

        assert_eq!(report.status, PipelineStatus::Failed);
        let lint = report.job("lint").unwrap();
        assert_eq!(lint.status, JobStatus::Failed);
        assert_eq!(lint.exit_code, Some(1));
        assert!(report.job("docs").unwrap().succeeded());

        let unit = report.job("unit").unwrap();
        assert_eq!(unit.status, JobStatus::Skipped);
        assert_eq!(unit.skip_reason, Some(SkipReason::UpstreamFailure));
    }

    #[tokio::test]
    async fn test_allowed_failure_does_not_block() {
        let yaml = r#"
stages: [test, deploy]
flaky:
  stage: test
  allow_failure: true
  script: exit 2
deploy:
  stage: deploy
  script: echo deployed
"#;
        let h = harness(yaml, push("master"));
        let report = h.executor.execute().await;

        assert_eq!(report.status, PipelineStatus::Succeeded);
        assert_eq!(report.stages[0].status, StageStatus::SucceededWithIssues);
        assert!(report.job("deploy").unwrap().succeeded());
    }

    #[tokio::test]
    async fn test_rules_excluded_job_is_skipped_not_blocking() {
        let yaml = r#"
stages: [test, deploy]
docs:
  stage: test
  script: echo docs
  rules:
    - if: $CI_PIPELINE_SOURCE == "schedule"
deploy:
  stage: deploy
  script: echo deployed
"#;
        let h = harness(yaml, push("master"));
        let report = h.executor.execute().await;

        let docs = report.job("docs").unwrap();
        assert_eq!(docs.status, JobStatus::Skipped);
        assert_eq!(docs.skip_reason, Some(SkipReason::Rules));
        assert_eq!(report.stages[0].status, StageStatus::Skipped);
        assert!(report.job("deploy").unwrap().succeeded());
        assert!(report.succeeded());
    }

    #[tokio::test]
    async fn test_artifacts_handed_to_later_stages() {
        let yaml = r#"
stages: [build, test]
wheel:
  stage: build
  script:
    - mkdir -p dist
    - echo wheel-data > dist/pkg.whl
  artifacts:
    paths: [dist/]
    expire_in: 1 day
unit:
  stage: test
  script: cat dist/pkg.whl
"#;
        let h = harness(yaml, push("master"));
        let report = h.executor.execute().await;

        assert!(report.succeeded());
        assert!(report.job("unit").unwrap().logs.contains(&"wheel-data".to_string()));

        let handle = report.job("wheel").unwrap().artifacts.clone().unwrap();
        assert_eq!(h.store.latest("wheel", "master").await.unwrap(), handle);
    }

    #[tokio::test]
    async fn test_timeout_fails_job() {
        let yaml = "slow:\n  timeout: 1\n  script: sleep 5\n";
        let h = harness(yaml, push("master"));
        let report = h.executor.execute().await;

        let slow = report.job("slow").unwrap();
        assert_eq!(slow.status, JobStatus::Failed);
        assert_eq!(slow.failure, Some(FailureReason::Timeout(Duration::from_secs(1))));
    }

    #[tokio::test]
    async fn test_cancellation_marks_jobs_canceled() {
        let yaml = r#"
stages: [build, test]
build:
  stage: build
  script: sleep 5
unit:
  stage: test
  script: echo never
"#;
        let h = harness(yaml, push("master"));
        let token = CancellationToken::new();
        let executor = h.executor.with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        });
        let report = executor.execute().await;
        canceller.await.unwrap();

        assert_eq!(report.status, PipelineStatus::Canceled);
        assert_eq!(report.job("build").unwrap().status, JobStatus::Canceled);
        assert_eq!(report.job("unit").unwrap().status, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn test_manual_job_pending_then_played() {
        let yaml = r#"
stages: [build, deploy]
build:
  stage: build
  script: echo built
deploy:
  stage: deploy
  when: manual
  script: echo deployed
"#;
        let h = harness(yaml, push("master"));
        let mut report = h.executor.execute().await;

        assert!(report.succeeded());
        assert_eq!(report.job("deploy").unwrap().status, JobStatus::Manual);
        assert_eq!(report.pending_manual().count(), 1);

        let outcome = h.executor.play(&mut report, "deploy").await.unwrap();
        assert!(outcome.succeeded());
        assert_eq!(report.pending_manual().count(), 0);

        let err = h.executor.play(&mut report, "deploy").await.unwrap_err();
        assert!(matches!(err, EngineError::NotManual(_)));
        let err = h.executor.play(&mut report, "nope").await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownJob(_)));
    }

    #[tokio::test]
    async fn test_advanced_manual_job_runs_in_stage() {
        let yaml = "deploy:\n  when: manual\n  script: echo deployed\n";
        let h = harness(yaml, push("master"));
        h.executor.gate().advance("deploy");

        let report = h.executor.execute().await;
        assert!(report.job("deploy").unwrap().succeeded());
    }

    #[tokio::test]
    async fn test_dependent_of_unplayed_manual_job_fails() {
        let yaml = r#"
stages: [build, release]
approve:
  stage: build
  when: manual
  script: echo approved
release:
  stage: release
  dependencies: [approve]
  script: echo released
"#;
        let h = harness(yaml, push("master"));
        let report = tokio::time::timeout(Duration::from_secs(10), h.executor.execute())
            .await
            .expect("pipeline finished");

        assert_eq!(report.job("approve").unwrap().status, JobStatus::Manual);
        let release = report.job("release").unwrap();
        assert_eq!(release.status, JobStatus::Failed);
        assert!(matches!(release.failure, Some(FailureReason::MissingDependency(_))));
        assert_eq!(report.status, PipelineStatus::Failed);
    }

    #[tokio::test]
    async fn test_dependent_of_played_manual_job_waits_for_it() {
        let yaml = r#"
stages: [build, release]
approve:
  stage: build
  when: manual
  script:
    - mkdir -p out
    - echo approved > out/ok.txt
  artifacts:
    paths: [out/]
release:
  stage: release
  dependencies: [approve]
  script: cat out/ok.txt
"#;
        let h = harness(yaml, push("master"));
        h.executor.gate().advance("approve");
        let report = tokio::time::timeout(Duration::from_secs(10), h.executor.execute())
            .await
            .expect("pipeline finished");

        assert!(report.job("approve").unwrap().succeeded());
        assert!(report.job("release").unwrap().logs.contains(&"approved".to_string()));
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let yaml = "unit:\n  script: echo hi\n";
        let (tx, mut rx) = progress_channel();
        let h = harness(yaml, push("master"));
        let report = h.executor.with_progress(tx).execute().await;
        assert!(report.succeeded());

        let mut saw_output = false;
        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                ExecutionEvent::JobOutput { line, .. } if line == "hi" => saw_output = true,
                ExecutionEvent::PipelineCompleted { status, .. } => {
                    assert_eq!(status, PipelineStatus::Succeeded);
                    saw_completed = true;
                }
                _ => {}
            }
        }
        assert!(saw_output && saw_completed);
    }

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(String, BTreeMap<String, String>)>>,
    }

    #[async_trait::async_trait]
    impl ManifestPublisher for RecordingPublisher {
        async fn login(&self, _registry: &RegistryCredentials) -> Result<(), ComposeError> {
            Ok(())
        }

        async fn publish(
            &self,
            reference: &str,
            images: &BTreeMap<String, String>,
        ) -> Result<Option<String>, ComposeError> {
            self.published
                .lock()
                .unwrap()
                .push((reference.to_string(), images.clone()));
            Ok(None)
        }
    }

    const COMPOSE_PIPELINE: &str = r#"
stages: [image, release]
image:
  stage: image
  parallel:
    matrix:
      - ARCH: [amd64, arm64]
  script: test "$ARCH" != "$FAIL_ARCH"
release:
  stage: release
  compose:
    repository: registry.example.com/dolfiny
    sources: image
    architectures: [amd64, arm64]
    source_image: registry.example.com/dolfiny:$ARCH
    tags:
      - if: $CI_COMMIT_BRANCH == $CI_DEFAULT_BRANCH
        tag: latest
"#;

    #[tokio::test]
    async fn test_compose_publishes_manifest() {
        let h = harness(COMPOSE_PIPELINE, push("master"));
        let publisher = Arc::new(RecordingPublisher::default());
        let executor = h
            .executor
            .with_composer(ManifestComposer::new(publisher.clone()));

        let report = executor.execute().await;
        assert!(report.succeeded());

        let manifest = report.manifests().next().unwrap();
        assert_eq!(manifest.reference, "registry.example.com/dolfiny:latest");
        assert_eq!(manifest.images["arm64"], "registry.example.com/dolfiny:arm64");
        assert_eq!(publisher.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_arch_blocks_manifest() {
        let trigger = push("master").with_variable("FAIL_ARCH", "arm64");
        let h = harness(COMPOSE_PIPELINE, trigger);
        let publisher = Arc::new(RecordingPublisher::default());
        let executor = h
            .executor
            .with_composer(ManifestComposer::new(publisher.clone()));

        let report = executor.execute().await;
        assert_eq!(report.status, PipelineStatus::Failed);
        assert_eq!(report.job("image: [arm64]").unwrap().status, JobStatus::Failed);
        assert_eq!(
            report.job("release").unwrap().skip_reason,
            Some(SkipReason::UpstreamFailure)
        );
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    const SPLIT_ARCH_PIPELINE: &str = r#"
stages: [image, release]
image-amd64:
  stage: image
  variables:
    ARCH: amd64
  script: echo "built $ARCH"
image-arm64:
  stage: image
  variables:
    ARCH: arm64
  rules:
    - if: $ARM_MODE == "manual"
      when: manual
    - if: $ARM_MODE == "build"
  script: echo "built $ARCH"
release:
  stage: release
  compose:
    repository: registry.example.com/dolfiny
    sources: [image-amd64, image-arm64]
    architectures: [amd64, arm64]
    source_image: registry.example.com/dolfiny:$ARCH
"#;

    async fn run_split_arch(trigger: PipelineTrigger) -> (PipelineReport, Arc<RecordingPublisher>) {
        let h = harness(SPLIT_ARCH_PIPELINE, trigger);
        let publisher = Arc::new(RecordingPublisher::default());
        let executor = h
            .executor
            .with_composer(ManifestComposer::new(publisher.clone()));
        let report = tokio::time::timeout(Duration::from_secs(10), executor.execute())
            .await
            .expect("pipeline finished");
        (report, publisher)
    }

    #[tokio::test]
    async fn test_arch_excluded_by_rules_blocks_manifest() {
        let (report, publisher) = run_split_arch(push("master")).await;

        assert_eq!(
            report.job("image-arm64").unwrap().skip_reason,
            Some(SkipReason::Rules)
        );
        let release = report.job("release").unwrap();
        assert_eq!(release.status, JobStatus::Failed);
        assert!(matches!(&release.failure, Some(FailureReason::Compose(m)) if m.contains("arm64")));
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unplayed_manual_arch_blocks_manifest() {
        let trigger = push("master").with_variable("ARM_MODE", "manual");
        let (report, publisher) = run_split_arch(trigger).await;

        assert_eq!(report.job("image-arm64").unwrap().status, JobStatus::Manual);
        assert_eq!(report.job("release").unwrap().status, JobStatus::Failed);
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_all_arches_built_publishes_manifest() {
        let trigger = push("master").with_variable("ARM_MODE", "build");
        let (report, publisher) = run_split_arch(trigger).await;

        assert!(report.succeeded());
        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "registry.example.com/dolfiny:master");
    }
}
