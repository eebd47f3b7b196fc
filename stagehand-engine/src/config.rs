// Engine configuration
// Defaults, environment overrides and validation for pipeline runs

use crate::error::ConfigError;
use crate::parser::duration::parse_duration;
use crate::runners::ContainerRuntime;

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Project name, exposed as `CI_PROJECT_NAME` and used to key artifacts
    pub project: String,

    /// Source tree copied into each job workspace
    pub project_dir: Option<PathBuf>,

    /// Maximum concurrently running jobs, 0 for unlimited
    pub max_parallel_jobs: usize,

    /// Timeout for jobs that do not set `timeout:`
    pub default_job_timeout: Duration,

    /// Retention for artifacts that do not set `expire_in:`
    pub default_retention: Duration,

    pub artifact_dir: PathBuf,

    /// Parent directory for job workspaces, system temp dir when unset
    pub builds_dir: Option<PathBuf>,

    /// Runtime for container jobs, `None` runs everything in the shell
    pub container_runtime: Option<ContainerRuntime>,

    pub default_branch: String,

    /// How often the background reaper removes expired artifacts
    pub reaper_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            project: "project".to_string(),
            project_dir: None,
            max_parallel_jobs: 4,
            default_job_timeout: DEFAULT_JOB_TIMEOUT,
            default_retention: DEFAULT_RETENTION,
            artifact_dir: default_artifact_dir(),
            builds_dir: None,
            container_runtime: None,
            default_branch: "main".to_string(),
            reaper_interval: DEFAULT_REAPER_INTERVAL,
        }
    }
}

impl EngineConfig {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by environment variables
    ///
    /// - STAGEHAND_PROJECT
    /// - STAGEHAND_MAX_PARALLEL_JOBS (0 = unlimited)
    /// - STAGEHAND_JOB_TIMEOUT (duration, e.g. "30m")
    /// - STAGEHAND_DEFAULT_RETENTION (duration, e.g. "2 days")
    /// - STAGEHAND_ARTIFACT_DIR
    /// - STAGEHAND_BUILDS_DIR
    /// - STAGEHAND_CONTAINER_RUNTIME (shell, docker or podman)
    /// - STAGEHAND_DEFAULT_BRANCH
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an explicit variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(project) = lookup("STAGEHAND_PROJECT") {
            config.project = project;
        }
        if let Some(value) = lookup("STAGEHAND_MAX_PARALLEL_JOBS") {
            config.max_parallel_jobs = value.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!(
                    "STAGEHAND_MAX_PARALLEL_JOBS must be a number, got '{}'",
                    value
                ))
            })?;
        }
        if let Some(value) = lookup("STAGEHAND_JOB_TIMEOUT") {
            config.default_job_timeout = env_duration("STAGEHAND_JOB_TIMEOUT", &value)?;
        }
        if let Some(value) = lookup("STAGEHAND_DEFAULT_RETENTION") {
            config.default_retention = env_duration("STAGEHAND_DEFAULT_RETENTION", &value)?;
        }
        if let Some(dir) = lookup("STAGEHAND_ARTIFACT_DIR") {
            config.artifact_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("STAGEHAND_BUILDS_DIR") {
            config.builds_dir = Some(PathBuf::from(dir));
        }
        if let Some(value) = lookup("STAGEHAND_CONTAINER_RUNTIME") {
            config.container_runtime = parse_runtime(&value)?;
        }
        if let Some(branch) = lookup("STAGEHAND_DEFAULT_BRANCH") {
            config.default_branch = branch;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = Some(dir.into());
        self
    }

    pub fn with_max_parallel_jobs(mut self, max: usize) -> Self {
        self.max_parallel_jobs = max;
        self
    }

    pub fn with_default_job_timeout(mut self, timeout: Duration) -> Self {
        self.default_job_timeout = timeout;
        self
    }

    pub fn with_default_retention(mut self, retention: Duration) -> Self {
        self.default_retention = retention;
        self
    }

    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = dir.into();
        self
    }

    pub fn with_builds_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.builds_dir = Some(dir.into());
        self
    }

    pub fn with_container_runtime(mut self, runtime: Option<ContainerRuntime>) -> Self {
        self.container_runtime = runtime;
        self
    }

    pub fn with_default_branch(mut self, branch: impl Into<String>) -> Self {
        self.default_branch = branch.into();
        self
    }

    /// Check values that would make a run meaningless
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project.trim().is_empty() {
            return Err(ConfigError::Invalid("project name must not be empty".to_string()));
        }
        if self.default_branch.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "default branch must not be empty".to_string(),
            ));
        }
        if self.default_job_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "default job timeout must be greater than zero".to_string(),
            ));
        }
        if self.default_retention.is_zero() {
            return Err(ConfigError::Invalid(
                "default artifact retention must be greater than zero".to_string(),
            ));
        }
        if self.reaper_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "reaper interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a runtime name; `shell` selects no container runtime
pub fn parse_runtime(value: &str) -> Result<Option<ContainerRuntime>, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "shell" => Ok(None),
        other => other
            .parse::<ContainerRuntime>()
            .map(Some)
            .map_err(ConfigError::Invalid),
    }
}

fn env_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).map_err(|e| ConfigError::Invalid(format!("{}: {}", key, e)))
}

fn default_artifact_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("stagehand")
        .join("artifacts")
}
