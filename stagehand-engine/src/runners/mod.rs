// Runners Module
// Executes a job's script in an isolated workspace, on the host shell or in a container

pub mod container;
pub mod shell;
pub mod workspace;

// Re-export key types
pub use container::{ContainerRunner, ContainerRuntime};
pub use shell::ShellRunner;
pub use workspace::JobWorkspace;

use crate::execution::plan::ResolvedJob;

use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Callback for job output lines; the flag is set for stderr
pub type OutputSink = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Errors raised before a job's script could produce an exit status
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("container runtime '{0}' is not available")]
    RuntimeUnavailable(String),

    #[error("job '{0}' needs an image to run in a container")]
    MissingImage(String),

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("workspace error: {0}")]
    Workspace(#[from] std::io::Error),
}

/// Everything a runner needs for one job instance
pub struct RunRequest<'a> {
    pub job: &'a ResolvedJob,
    pub env: &'a HashMap<String, String>,
    pub workspace: &'a Path,
    pub output: Option<OutputSink>,
}

/// What a job run produced
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub logs: Vec<String>,
    /// Workspace-relative files matching `artifacts.paths`, collected on success
    pub artifact_paths: Vec<String>,
}

impl RunOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Trait for job runners
#[async_trait::async_trait]
pub trait JobRunner: Send + Sync {
    /// Run `before_script` then `script`; the first failing command ends the job
    async fn run(&self, request: RunRequest<'_>) -> Result<RunOutput, RunnerError>;

    fn name(&self) -> &'static str;
}

/// Picks a runner per job: jobs with an `image` go to the container runner
/// when one is configured, everything else runs in the host shell
pub struct RunnerRegistry {
    shell: ShellRunner,
    container: Option<ContainerRunner>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self {
            shell: ShellRunner::new(),
            container: None,
        }
    }

    /// Enable the container runner
    pub fn with_container_runner(mut self, runner: ContainerRunner) -> Self {
        self.container = Some(runner);
        self
    }

    pub fn container(&self) -> Option<&ContainerRunner> {
        self.container.as_ref()
    }

    fn select(&self, job: &ResolvedJob) -> &dyn JobRunner {
        match (&self.container, &job.image) {
            (Some(container), Some(_)) => container,
            _ => &self.shell,
        }
    }
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl JobRunner for RunnerRegistry {
    async fn run(&self, request: RunRequest<'_>) -> Result<RunOutput, RunnerError> {
        let runner = self.select(request.job);
        tracing::debug!(job = %request.job.name, runner = runner.name(), "selected runner");
        runner.run(request).await
    }

    fn name(&self) -> &'static str {
        "registry"
    }
}

/// Join a job's commands into one shell script
///
/// Each command is echoed as `$ command` before it runs and `set -e` stops
/// the script at the first non-zero exit.
pub fn build_script(before_script: &[String], script: &[String]) -> String {
    let mut out = String::from("set -e\n");
    for command in before_script.iter().chain(script) {
        out.push_str("printf '%s\\n' ");
        out.push_str(&shell_quote(&format!("$ {}", command)));
        out.push('\n');
        out.push_str(command);
        out.push('\n');
    }
    out
}

/// Single-quote a string for POSIX `sh`
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Spawn a prepared command and stream its output line by line
pub(crate) async fn run_process(
    mut cmd: Command,
    program: &str,
    output: Option<&OutputSink>,
) -> Result<(ExitStatus, Vec<String>), RunnerError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
        program: program.to_string(),
        source,
    })?;

    let stdout = child.stdout.take().ok_or_else(|| closed_pipe(program, "stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| closed_pipe(program, "stderr"))?;
    let mut stdout = BufReader::new(stdout).lines();
    let mut stderr = BufReader::new(stderr).lines();

    let mut logs = Vec::new();
    let mut emit = |line: String, is_error: bool| {
        if let Some(sink) = output {
            sink(&line, is_error);
        }
        logs.push(line);
    };

    let (mut stdout_open, mut stderr_open) = (true, true);
    while stdout_open || stderr_open {
        tokio::select! {
            line = stdout.next_line(), if stdout_open => match line {
                Ok(Some(line)) => emit(line, false),
                _ => stdout_open = false,
            },
            line = stderr.next_line(), if stderr_open => match line {
                Ok(Some(line)) => emit(line, true),
                _ => stderr_open = false,
            },
        }
    }

    let status = child.wait().await?;
    Ok((status, logs))
}

fn closed_pipe(program: &str, stream: &str) -> RunnerError {
    RunnerError::Spawn {
        program: program.to_string(),
        source: std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            format!("{} was not captured", stream),
        ),
    }
}
