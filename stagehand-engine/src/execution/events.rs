// Execution Events
// Progress reporting for pipeline runs

use crate::execution::report::{JobStatus, PipelineStatus, SkipReason, StageStatus};

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        project: String,
        git_ref: String,
        total_stages: usize,
    },

    PipelineCompleted {
        project: String,
        status: PipelineStatus,
        duration: Duration,
    },

    StageStarted {
        stage_name: String,
        total_jobs: usize,
    },

    StageCompleted {
        stage_name: String,
        status: StageStatus,
        duration: Duration,
    },

    JobStarted {
        stage_name: String,
        job_name: String,
        image: Option<String>,
    },

    /// One line of job output
    JobOutput {
        stage_name: String,
        job_name: String,
        line: String,
        is_error: bool,
    },

    JobCompleted {
        stage_name: String,
        job_name: String,
        status: JobStatus,
        allow_failure: bool,
        exit_code: Option<i32>,
        duration: Duration,
    },

    JobSkipped {
        stage_name: String,
        job_name: String,
        reason: SkipReason,
    },

    /// Manual job held until played
    JobAwaitingManual {
        stage_name: String,
        job_name: String,
    },

    ArtifactsPublished {
        job_name: String,
        handle: String,
        files: usize,
    },

    ManifestPublished {
        job_name: String,
        reference: String,
        architectures: Vec<String>,
    },

    Log {
        level: LogLevel,
        message: String,
        stage_name: Option<String>,
        job_name: Option<String>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    pub fn pipeline_started(
        project: impl Into<String>,
        git_ref: impl Into<String>,
        total_stages: usize,
    ) -> Self {
        Self::PipelineStarted {
            project: project.into(),
            git_ref: git_ref.into(),
            total_stages,
        }
    }

    pub fn pipeline_completed(
        project: impl Into<String>,
        status: PipelineStatus,
        duration: Duration,
    ) -> Self {
        Self::PipelineCompleted {
            project: project.into(),
            status,
            duration,
        }
    }

    pub fn stage_started(name: impl Into<String>, total_jobs: usize) -> Self {
        Self::StageStarted {
            stage_name: name.into(),
            total_jobs,
        }
    }

    pub fn stage_completed(name: impl Into<String>, status: StageStatus, duration: Duration) -> Self {
        Self::StageCompleted {
            stage_name: name.into(),
            status,
            duration,
        }
    }

    pub fn job_started(
        stage_name: impl Into<String>,
        job_name: impl Into<String>,
        image: Option<String>,
    ) -> Self {
        Self::JobStarted {
            stage_name: stage_name.into(),
            job_name: job_name.into(),
            image,
        }
    }

    pub fn job_output(
        stage_name: impl Into<String>,
        job_name: impl Into<String>,
        line: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::JobOutput {
            stage_name: stage_name.into(),
            job_name: job_name.into(),
            line: line.into(),
            is_error,
        }
    }

    pub fn job_skipped(
        stage_name: impl Into<String>,
        job_name: impl Into<String>,
        reason: SkipReason,
    ) -> Self {
        Self::JobSkipped {
            stage_name: stage_name.into(),
            job_name: job_name.into(),
            reason,
        }
    }

    pub fn job_awaiting_manual(stage_name: impl Into<String>, job_name: impl Into<String>) -> Self {
        Self::JobAwaitingManual {
            stage_name: stage_name.into(),
            job_name: job_name.into(),
        }
    }

    pub fn info(message: impl Into<String>, stage_name: Option<String>, job_name: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
            stage_name,
            job_name,
        }
    }

    pub fn warning(
        message: impl Into<String>,
        stage_name: Option<String>,
        job_name: Option<String>,
    ) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            stage_name,
            job_name,
        }
    }

    pub fn error(
        message: impl Into<String>,
        stage_name: Option<String>,
        job_name: Option<String>,
    ) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
            stage_name,
            job_name,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
