// Engine error types
// Configuration errors are fatal before any job runs; job failures are outcomes, not errors

use crate::artifacts::ArtifactError;
use crate::compose::ComposeError;
use crate::execution::graph::GraphError;
use crate::parser::error::ParseError;
use crate::rules::ExpressionError;
use crate::runners::RunnerError;

use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("pipeline was cancelled")]
    Cancelled,

    #[error("job '{0}' not found in pipeline")]
    UnknownJob(String),

    #[error("job '{0}' is not awaiting manual action")]
    NotManual(String),

    #[error("'{0}' matches several manual jobs, name one instance")]
    AmbiguousJob(String),
}

impl EngineError {
    /// Whether this error was raised before any job could start
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

/// Errors in the pipeline definition, reported before execution starts
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("job '{job}' extends unknown template '{template}'")]
    UnknownTemplate { job: String, template: String },

    #[error("circular extends chain: {}", chain.join(" -> "))]
    CircularExtends { chain: Vec<String> },

    #[error("extends chain of '{job}' is deeper than {max} levels")]
    ExtendsTooDeep { job: String, max: usize },

    #[error("job '{job}' has no script")]
    MissingScript { job: String },

    #[error("rule {index} of job '{job}' is malformed: {source}")]
    MalformedRule {
        job: String,
        index: usize,
        #[source]
        source: ExpressionError,
    },

    #[error("invalid parallel configuration for job '{job}': {message}")]
    InvalidMatrix { job: String, message: String },

    #[error("invalid compose configuration for job '{job}': {message}")]
    InvalidCompose { job: String, message: String },

    #[error("invalid engine configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid_compose(job: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidCompose {
            job: job.into(),
            message: message.into(),
        }
    }

    pub fn invalid_matrix(job: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidMatrix {
            job: job.into(),
            message: message.into(),
        }
    }
}
