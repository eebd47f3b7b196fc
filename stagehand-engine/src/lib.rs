// Stagehand Engine Library
// Staged pipeline execution: rules, templates, stage scheduling, artifacts and manifests

pub mod artifacts;
pub mod compose;
pub mod config;
pub mod error;
pub mod execution;
pub mod parser;
pub mod rules;
pub mod runners;
pub mod trigger;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{ConfigError, EngineError, EngineResult};
pub use trigger::{PipelineTrigger, TriggerSource};

// Re-export parser types
pub use parser::{
    JobSpec, JobTemplate, ParseError, ParseErrorKind, PipelineConfig, PipelineParser,
    TemplateResolver,
};

// Re-export rule types
pub use rules::{Predicate, Rule, RuleEvaluator, RuleOutcome, RuleScope};

// Re-export execution types
pub use execution::{
    ExecutionEvent, ExecutionMode, JobOutcome, JobStatus, ManualGate, PipelineExecutor,
    PipelinePlan, PipelineReport, PipelineStatus, Planner, ProgressSender, ResolvedJob,
    StageBatch, StageGraph, StageStatus,
};

// Re-export runner types
pub use runners::{ContainerRunner, ContainerRuntime, JobRunner, RunnerRegistry, ShellRunner};

// Re-export artifact and compose types
pub use artifacts::{ArtifactError, ArtifactHandle, ArtifactStore, FsArtifactStore};
pub use compose::{
    CliManifestPublisher, ComposeError, ManifestComposer, ManifestPublisher, ManifestReference,
};
