// Execution Results
// Job, stage and pipeline outcomes reported after a run

use crate::artifacts::ArtifactHandle;
use crate::compose::ManifestReference;
use crate::execution::ExecutionMode;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Skipped,
    /// Manual job that was never played
    Manual,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::Skipped => "skipped",
            JobStatus::Manual => "manual",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    /// Every required job succeeded but an allowed failure occurred
    SucceededWithIssues,
    Failed,
    Canceled,
    Skipped,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::SucceededWithIssues => "succeeded with issues",
            StageStatus::Failed => "failed",
            StageStatus::Canceled => "canceled",
            StageStatus::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PipelineStatus::Running => "running",
            PipelineStatus::Succeeded => "succeeded",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Canceled => "canceled",
        };
        f.write_str(label)
    }
}

/// Why a job failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    ScriptFailure { exit_code: Option<i32> },
    Timeout(Duration),
    Runner(String),
    /// A dependency was never played or produced nothing to hand over
    MissingDependency(String),
    Artifacts(String),
    Compose(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ScriptFailure {
                exit_code: Some(code),
            } => write!(f, "script exited with code {}", code),
            FailureReason::ScriptFailure { exit_code: None } => {
                write!(f, "script terminated by signal")
            }
            FailureReason::Timeout(limit) => write!(f, "timed out after {:?}", limit),
            FailureReason::Runner(message) => write!(f, "runner error: {}", message),
            FailureReason::MissingDependency(message) => {
                write!(f, "missing dependency: {}", message)
            }
            FailureReason::Artifacts(message) => write!(f, "artifact upload failed: {}", message),
            FailureReason::Compose(message) => write!(f, "manifest compose failed: {}", message),
        }
    }
}

/// Why a job did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Excluded by `rules:`
    Rules,
    UpstreamFailure,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Rules => f.write_str("excluded by rules"),
            SkipReason::UpstreamFailure => f.write_str("upstream failure"),
        }
    }
}

/// Outcome of one job instance
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// Instance name, e.g. `image: [arm64]`
    pub name: String,
    /// Logical job name
    pub job: String,
    pub stage: String,
    pub status: JobStatus,
    pub mode: ExecutionMode,
    pub allow_failure: bool,
    pub exit_code: Option<i32>,
    pub failure: Option<FailureReason>,
    pub skip_reason: Option<SkipReason>,
    pub logs: Vec<String>,
    pub artifacts: Option<ArtifactHandle>,
    pub manifest: Option<ManifestReference>,
    pub duration: Duration,
    pub matrix: BTreeMap<String, String>,
}

impl JobOutcome {
    pub fn new(
        name: impl Into<String>,
        job: impl Into<String>,
        stage: impl Into<String>,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            name: name.into(),
            job: job.into(),
            stage: stage.into(),
            status: JobStatus::Pending,
            mode,
            allow_failure: false,
            exit_code: None,
            failure: None,
            skip_reason: None,
            logs: Vec::new(),
            artifacts: None,
            manifest: None,
            duration: Duration::ZERO,
            matrix: BTreeMap::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded
    }

    /// A failure that stops the pipeline
    pub fn is_blocking_failure(&self) -> bool {
        self.status == JobStatus::Failed && !self.allow_failure
    }

    pub fn is_allowed_failure(&self) -> bool {
        self.status == JobStatus::Failed && self.allow_failure
    }

    pub(crate) fn skip(mut self, reason: SkipReason) -> Self {
        self.status = JobStatus::Skipped;
        self.skip_reason = Some(reason);
        self
    }

    pub(crate) fn fail(mut self, reason: FailureReason) -> Self {
        self.status = JobStatus::Failed;
        self.failure = Some(reason);
        self
    }
}

/// Outcome of one stage
#[derive(Debug, Clone)]
pub struct StageReport {
    pub name: String,
    pub status: StageStatus,
    pub jobs: Vec<JobOutcome>,
    pub duration: Duration,
}

impl StageReport {
    /// Derive the stage status from its jobs
    pub fn derive_status(jobs: &[JobOutcome]) -> StageStatus {
        if jobs.iter().any(|job| job.status == JobStatus::Canceled) {
            return StageStatus::Canceled;
        }
        if jobs.iter().any(JobOutcome::is_blocking_failure) {
            return StageStatus::Failed;
        }
        if jobs.iter().any(|job| !job.status.is_terminal()) {
            return StageStatus::Running;
        }
        let ran = jobs
            .iter()
            .any(|job| matches!(job.status, JobStatus::Succeeded | JobStatus::Failed));
        if !ran {
            return StageStatus::Skipped;
        }
        if jobs.iter().any(JobOutcome::is_allowed_failure) {
            StageStatus::SucceededWithIssues
        } else {
            StageStatus::Succeeded
        }
    }
}

/// Outcome of a whole pipeline run
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub project: String,
    pub git_ref: String,
    pub status: PipelineStatus,
    pub stages: Vec<StageReport>,
    pub duration: Duration,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.status == PipelineStatus::Succeeded
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobOutcome> {
        self.stages.iter().flat_map(|stage| stage.jobs.iter())
    }

    /// Find a job instance by instance name
    pub fn job(&self, name: &str) -> Option<&JobOutcome> {
        self.jobs().find(|job| job.name == name)
    }

    /// Jobs still waiting to be played
    pub fn pending_manual(&self) -> impl Iterator<Item = &JobOutcome> {
        self.jobs().filter(|job| job.status == JobStatus::Manual)
    }

    /// Manifests published during the run
    pub fn manifests(&self) -> impl Iterator<Item = &ManifestReference> {
        self.jobs().filter_map(|job| job.manifest.as_ref())
    }

    /// Recompute stage and pipeline status after a job changed
    pub(crate) fn refresh_status(&mut self) {
        for stage in &mut self.stages {
            stage.status = StageReport::derive_status(&stage.jobs);
        }
        if self.status == PipelineStatus::Canceled {
            return;
        }
        self.status = if self
            .stages
            .iter()
            .any(|stage| stage.status == StageStatus::Failed)
        {
            PipelineStatus::Failed
        } else {
            PipelineStatus::Succeeded
        };
    }
}
