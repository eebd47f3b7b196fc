// Manifest publisher backed by the docker/podman CLI

use crate::compose::{ComposeError, ManifestPublisher};
use crate::parser::models::RegistryCredentials;
use crate::runners::ContainerRuntime;

use std::collections::BTreeMap;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Publishes with `<runtime> manifest create --amend` and `<runtime> manifest push`
#[derive(Debug, Clone)]
pub struct CliManifestPublisher {
    runtime: ContainerRuntime,
}

impl CliManifestPublisher {
    pub fn new(runtime: ContainerRuntime) -> Self {
        Self { runtime }
    }

    fn create_args(reference: &str, images: &BTreeMap<String, String>) -> Vec<String> {
        let mut args = vec![
            "manifest".to_string(),
            "create".to_string(),
            "--amend".to_string(),
            reference.to_string(),
        ];
        args.extend(images.values().cloned());
        args
    }

    async fn run(&self, args: &[String]) -> std::io::Result<Output> {
        Command::new(self.runtime.binary())
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
    }
}

/// `sha256:...` token printed by `manifest push`, if any
fn parse_digest(stdout: &str) -> Option<String> {
    stdout
        .split_whitespace()
        .rev()
        .find(|token| token.starts_with("sha256:"))
        .map(str::to_string)
}

fn failure_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let message = stderr.trim();
    if message.is_empty() {
        format!("exited with {}", output.status)
    } else {
        message.to_string()
    }
}

#[async_trait::async_trait]
impl ManifestPublisher for CliManifestPublisher {
    async fn login(&self, registry: &RegistryCredentials) -> Result<(), ComposeError> {
        let login_error = |message: String| ComposeError::Login {
            registry: registry.host.clone(),
            message,
        };

        let mut child = Command::new(self.runtime.binary())
            .args(["login", &registry.host, "-u", &registry.username, "--password-stdin"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| login_error(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(registry.password.as_bytes())
                .await
                .map_err(|e| login_error(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| login_error(e.to_string()))?;
        if !output.status.success() {
            return Err(login_error(failure_message(&output)));
        }

        tracing::debug!(registry = %registry.host, user = %registry.username, "registry login succeeded");
        Ok(())
    }

    async fn publish(
        &self,
        reference: &str,
        images: &BTreeMap<String, String>,
    ) -> Result<Option<String>, ComposeError> {
        let publish_error = |message: String| ComposeError::Publish {
            reference: reference.to_string(),
            message,
        };

        let create = self
            .run(&Self::create_args(reference, images))
            .await
            .map_err(|e| publish_error(e.to_string()))?;
        if !create.status.success() {
            return Err(publish_error(failure_message(&create)));
        }

        let push_args = ["manifest".to_string(), "push".to_string(), reference.to_string()];
        let push = self
            .run(&push_args)
            .await
            .map_err(|e| publish_error(e.to_string()))?;
        if !push.status.success() {
            return Err(publish_error(failure_message(&push)));
        }

        Ok(parse_digest(&String::from_utf8_lossy(&push.stdout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_args() {
        let images: BTreeMap<String, String> = [
            ("arm64".to_string(), "r.io/app:arm64".to_string()),
            ("amd64".to_string(), "r.io/app:amd64".to_string()),
        ]
        .into();

        assert_eq!(
            CliManifestPublisher::create_args("r.io/app:latest", &images),
            vec![
                "manifest",
                "create",
                "--amend",
                "r.io/app:latest",
                "r.io/app:amd64",
                "r.io/app:arm64"
            ]
        );
    }

    #[test]
    fn test_parse_digest() {
        assert_eq!(
            parse_digest("Pushed ref r.io/app@sha256:1234 with digest: sha256:abcd\n"),
            Some("sha256:abcd".to_string())
        );
        assert_eq!(parse_digest(""), None);
    }
}
