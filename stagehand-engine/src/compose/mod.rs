// Multi-arch manifest composition
// Gathers per-architecture images built by earlier jobs and publishes one manifest list

pub mod publisher;

pub use publisher::CliManifestPublisher;

use crate::execution::context::expand_variables;
use crate::execution::report::JobStatus;
use crate::parser::models::{ComposeSpec, RegistryCredentials};
use crate::rules::{expression, ExpressionError, RuleScope};

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("no architectures to compose")]
    NoArchitectures,

    #[error("no successful build for architecture '{arch}'")]
    MissingArchitecture { arch: String },

    #[error("build for architecture '{arch}' failed in job '{job}'")]
    FailedArchitecture { arch: String, job: String },

    #[error("invalid tag rule '{condition}': {source}")]
    InvalidTagRule {
        condition: String,
        #[source]
        source: ExpressionError,
    },

    #[error("manifest tag for '{repository}' expanded to an empty string")]
    EmptyTag { repository: String },

    #[error("login to '{registry}' failed: {message}")]
    Login { registry: String, message: String },

    #[error("publishing '{reference}' failed: {message}")]
    Publish { reference: String, message: String },
}

/// A published multi-arch manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestReference {
    /// `repository:tag`
    pub reference: String,
    /// Architecture to per-arch image
    pub images: BTreeMap<String, String>,
    pub digest: Option<String>,
}

impl ManifestReference {
    pub fn architectures(&self) -> Vec<String> {
        self.images.keys().cloned().collect()
    }
}

/// Registry side of manifest publication
#[async_trait::async_trait]
pub trait ManifestPublisher: Send + Sync {
    async fn login(&self, registry: &RegistryCredentials) -> Result<(), ComposeError>;

    /// Create and push a manifest list; returns its digest when known
    async fn publish(
        &self,
        reference: &str,
        images: &BTreeMap<String, String>,
    ) -> Result<Option<String>, ComposeError>;
}

/// One instance of a compose source job
#[derive(Debug, Clone)]
pub struct SourceBuild {
    /// Instance name
    pub job: String,
    /// Value of the arch variable, `None` if the instance did not set it
    pub arch: Option<String>,
    pub status: JobStatus,
    /// `source_image` expanded with the instance's variables
    pub image: String,
}

/// Pick one succeeded image per requested architecture
///
/// An architecture without any instance (excluded, skipped, never played) is
/// missing; one whose instances all failed is failed. Nothing is published
/// unless every architecture resolves.
pub fn collect_arch_images(
    architectures: &[String],
    builds: &[SourceBuild],
) -> Result<BTreeMap<String, String>, ComposeError> {
    if architectures.is_empty() {
        return Err(ComposeError::NoArchitectures);
    }

    let mut images = BTreeMap::new();
    for arch in architectures {
        let candidates: Vec<&SourceBuild> = builds
            .iter()
            .filter(|build| build.arch.as_deref() == Some(arch.as_str()))
            .collect();

        if let Some(build) = candidates.iter().find(|b| b.status == JobStatus::Succeeded) {
            images.insert(arch.clone(), build.image.clone());
        } else if let Some(build) = candidates.iter().find(|b| b.status == JobStatus::Failed) {
            return Err(ComposeError::FailedArchitecture {
                arch: arch.clone(),
                job: build.job.clone(),
            });
        } else {
            return Err(ComposeError::MissingArchitecture { arch: arch.clone() });
        }
    }
    Ok(images)
}

/// `repository:tag` for a compose job; the first matching tag rule wins
pub fn manifest_target(
    compose: &ComposeSpec,
    scope: &RuleScope<'_>,
    variables: &BTreeMap<String, String>,
) -> Result<String, ComposeError> {
    let mut tag = None;
    for rule in &compose.tags {
        let predicate =
            expression::compile(&rule.condition).map_err(|source| ComposeError::InvalidTagRule {
                condition: rule.condition.clone(),
                source,
            })?;
        if predicate.matches(scope) {
            tag = Some(rule.tag.as_str());
            break;
        }
    }

    let repository = expand_variables(&compose.repository, variables);
    let tag = expand_variables(tag.unwrap_or(&compose.default_tag), variables);
    if tag.is_empty() {
        return Err(ComposeError::EmptyTag { repository });
    }
    Ok(format!("{}:{}", repository, tag))
}

/// Registry host of an image reference, `docker.io` for bare names
pub fn registry_host(reference: &str) -> &str {
    match reference.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            first
        }
        _ => "docker.io",
    }
}

/// Fan-in of per-architecture images into one manifest
pub struct ManifestComposer {
    publisher: Arc<dyn ManifestPublisher>,
    registries: Vec<RegistryCredentials>,
    logged_in: Mutex<HashSet<String>>,
}

impl ManifestComposer {
    pub fn new(publisher: Arc<dyn ManifestPublisher>) -> Self {
        Self {
            publisher,
            registries: Vec::new(),
            logged_in: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_registries(mut self, registries: Vec<RegistryCredentials>) -> Self {
        self.registries = registries;
        self
    }

    /// Publish `arch_images` as the manifest `target`
    pub async fn compose(
        &self,
        target: &str,
        arch_images: &BTreeMap<String, String>,
    ) -> Result<ManifestReference, ComposeError> {
        if arch_images.is_empty() {
            return Err(ComposeError::NoArchitectures);
        }

        self.login_for(target).await?;
        let digest = self.publisher.publish(target, arch_images).await?;

        tracing::info!(
            manifest = %target,
            architectures = arch_images.len(),
            digest = digest.as_deref().unwrap_or("-"),
            "manifest published"
        );
        Ok(ManifestReference {
            reference: target.to_string(),
            images: arch_images.clone(),
            digest,
        })
    }

    /// Log in once to the configured registry serving `target`
    async fn login_for(&self, target: &str) -> Result<(), ComposeError> {
        let host = registry_host(target);
        let Some(registry) = self.registries.iter().find(|r| r.host == host) else {
            return Ok(());
        };
        if self.already_logged_in(host) {
            return Ok(());
        }
        self.publisher.login(registry).await?;
        self.logged_in
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(host.to_string());
        Ok(())
    }

    fn already_logged_in(&self, host: &str) -> bool {
        self.logged_in
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(host)
    }
}
