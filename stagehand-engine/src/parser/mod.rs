// Parser module for GitLab-style pipelines
// Provides YAML parsing, job models and template resolution

pub mod duration;
pub mod error;
pub mod gitlab;
pub mod models;
pub mod template;

pub use error::{ParseError, ParseErrorKind, ParseResult};
pub use gitlab::PipelineParser;
pub use models::*;
pub use template::TemplateResolver;
