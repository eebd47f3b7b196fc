// Container Runner
// Runs a job's script inside its `image` with docker or podman

use crate::execution::plan::ResolvedJob;
use crate::runners::{build_script, run_process, JobRunner, JobWorkspace, RunOutput, RunRequest, RunnerError};

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::process::Command;

/// Where the workspace is mounted inside the container
pub const CONTAINER_WORKDIR: &str = "/builds/project";

/// Supported container runtimes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    Docker,
    Podman,
}

impl ContainerRuntime {
    pub fn binary(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
        }
    }

    /// Check that the runtime binary is on `PATH`
    pub fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }

    /// First available runtime, docker preferred
    pub fn detect() -> Option<Self> {
        [ContainerRuntime::Docker, ContainerRuntime::Podman]
            .into_iter()
            .find(ContainerRuntime::is_available)
    }
}

impl fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

impl FromStr for ContainerRuntime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(ContainerRuntime::Docker),
            "podman" => Ok(ContainerRuntime::Podman),
            other => Err(format!(
                "unknown container runtime '{}', expected docker or podman",
                other
            )),
        }
    }
}

/// Removes the container if the job future is dropped mid-run
struct ContainerGuard {
    runtime: ContainerRuntime,
    name: String,
    armed: bool,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::process::Command::new(self.runtime.binary())
                .args(["rm", "-f", &self.name])
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .spawn();
        }
    }
}

/// Container runner for image-based jobs
#[derive(Debug, Clone)]
pub struct ContainerRunner {
    runtime: ContainerRuntime,
}

impl ContainerRunner {
    pub fn new(runtime: ContainerRuntime) -> Self {
        Self { runtime }
    }

    /// Create a runner after checking the runtime is installed
    pub fn checked(runtime: ContainerRuntime) -> Result<Self, RunnerError> {
        if !runtime.is_available() {
            return Err(RunnerError::RuntimeUnavailable(runtime.to_string()));
        }
        Ok(Self::new(runtime))
    }

    pub fn runtime(&self) -> ContainerRuntime {
        self.runtime
    }

    /// Arguments for `<runtime> run`
    ///
    /// Variables are passed by name with `-e KEY` and their values set on the
    /// runtime process, so they do not show up in the process list.
    fn run_args(
        &self,
        job: &ResolvedJob,
        image: &str,
        env: &HashMap<String, String>,
        workspace: &Path,
        container_name: &str,
    ) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name.to_string(),
            "-v".to_string(),
            format!("{}:{}", workspace.display(), CONTAINER_WORKDIR),
            "-w".to_string(),
            CONTAINER_WORKDIR.to_string(),
        ];

        let mut keys: Vec<&String> = env.keys().collect();
        keys.sort();
        for key in keys {
            args.push("-e".to_string());
            args.push(key.clone());
        }

        args.push(image.to_string());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(build_script(&job.before_script, &job.script));
        args
    }
}

#[async_trait::async_trait]
impl JobRunner for ContainerRunner {
    async fn run(&self, request: RunRequest<'_>) -> Result<RunOutput, RunnerError> {
        let job = request.job;
        let image = job
            .image
            .as_deref()
            .ok_or_else(|| RunnerError::MissingImage(job.name.clone()))?;

        let mut env = request.env.clone();
        env.insert("CI_PROJECT_DIR".to_string(), CONTAINER_WORKDIR.to_string());

        let container_name = format!("stagehand-{}", uuid::Uuid::new_v4().simple());
        let args = self.run_args(job, image, &env, request.workspace, &container_name);

        let mut cmd = Command::new(self.runtime.binary());
        cmd.args(&args).envs(&env);

        tracing::debug!(
            job = %job.name,
            image = %image,
            runtime = %self.runtime,
            container = %container_name,
            "running job in container"
        );

        let mut guard = ContainerGuard {
            runtime: self.runtime,
            name: container_name,
            armed: true,
        };
        let result = run_process(cmd, self.runtime.binary(), request.output.as_ref()).await;
        guard.armed = false;
        let (status, logs) = result?;

        let mut output = RunOutput {
            exit_code: status.code(),
            logs,
            artifact_paths: Vec::new(),
        };
        if output.succeeded() {
            if let Some(artifacts) = &job.artifacts {
                output.artifact_paths = JobWorkspace::collect_in(request.workspace, &artifacts.paths)?;
            }
        }
        Ok(output)
    }

    fn name(&self) -> &'static str {
        match self.runtime {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
        }
    }
}
