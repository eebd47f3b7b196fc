// Shell Runner
// Runs a job's script with `sh -c` on the host, in its workspace

use crate::runners::{build_script, run_process, JobRunner, RunOutput, RunRequest, RunnerError};

use std::path::Path;
use tokio::process::Command;

/// Host variables a job inherits; everything else comes from the job
const INHERITED_ENV: &[&str] = &["PATH", "HOME"];

/// Shell runner for executing jobs on the host
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    fn command(&self, script: &str, workspace: &Path) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(script).current_dir(workspace).env_clear();
        for key in INHERITED_ENV {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl JobRunner for ShellRunner {
    async fn run(&self, request: RunRequest<'_>) -> Result<RunOutput, RunnerError> {
        let job = request.job;
        let script = build_script(&job.before_script, &job.script);

        let mut cmd = self.command(&script, request.workspace);
        cmd.envs(request.env);

        tracing::debug!(job = %job.name, shell = %self.shell, "running job in shell");
        let (status, logs) = run_process(cmd, &self.shell, request.output.as_ref()).await?;

        let mut output = RunOutput {
            exit_code: status.code(),
            logs,
            artifact_paths: Vec::new(),
        };
        if output.succeeded() {
            if let Some(artifacts) = &job.artifacts {
                output.artifact_paths =
                    super::JobWorkspace::collect_in(request.workspace, &artifacts.paths)?;
            }
        }
        Ok(output)
    }

    fn name(&self) -> &'static str {
        "shell"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::plan::ResolvedJob;
    use crate::parser::models::ArtifactSpec;
    use crate::runners::OutputSink;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    fn job(script: &[&str]) -> ResolvedJob {
        let mut job = ResolvedJob::for_test("unit", "test");
        job.script = script.iter().map(|s| s.to_string()).collect();
        job
    }

    async fn run(job: &ResolvedJob, env: &HashMap<String, String>, dir: &Path) -> RunOutput {
        ShellRunner::new()
            .run(RunRequest {
                job,
                env,
                workspace: dir,
                output: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_and_echo() {
        let dir = tempfile::tempdir().unwrap();
        let output = run(&job(&["echo hello"]), &HashMap::new(), dir.path()).await;

        assert!(output.succeeded());
        assert_eq!(output.logs, vec!["$ echo hello".to_string(), "hello".to_string()]);
    }

    #[tokio::test]
    async fn test_first_failure_stops_script() {
        let dir = tempfile::tempdir().unwrap();
        let mut failing = job(&["exit 4", "echo unreachable"]);
        failing.before_script = vec!["echo setup".to_string()];

        let output = run(&failing, &HashMap::new(), dir.path()).await;
        assert_eq!(output.exit_code, Some(4));
        assert!(output.logs.contains(&"setup".to_string()));
        assert!(!output.logs.contains(&"unreachable".to_string()));
    }

    #[tokio::test]
    async fn test_environment_is_isolated() {
        std::env::set_var("STAGEHAND_SHELL_TEST_LEAK", "leaked");
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("GREETING".to_string(), "hi".to_string());

        let output = run(
            &job(&["echo \"$GREETING-${STAGEHAND_SHELL_TEST_LEAK:-none}\""]),
            &env,
            dir.path(),
        )
        .await;
        assert_eq!(output.logs.last().map(String::as_str), Some("hi-none"));
    }

    #[tokio::test]
    async fn test_collects_artifacts_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut build = job(&["mkdir -p dist", "echo wheel > dist/pkg.whl"]);
        build.artifacts = Some(ArtifactSpec {
            paths: vec!["dist/".to_string()],
            expire_in: None,
        });

        let output = run(&build, &HashMap::new(), dir.path()).await;
        assert_eq!(output.artifact_paths, vec!["dist/pkg.whl".to_string()]);
    }

    #[tokio::test]
    async fn test_output_is_streamed() {
        let dir = tempfile::tempdir().unwrap();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink: OutputSink = {
            let lines = lines.clone();
            Arc::new(move |line: &str, is_error: bool| {
                lines.lock().unwrap().push((line.to_string(), is_error));
            })
        };

        let job = job(&["echo oops >&2"]);
        ShellRunner::new()
            .run(RunRequest {
                job: &job,
                env: &HashMap::new(),
                workspace: dir.path(),
                output: Some(sink),
            })
            .await
            .unwrap();

        let lines = lines.lock().unwrap();
        assert!(lines.contains(&("oops".to_string(), true)));
    }
}
