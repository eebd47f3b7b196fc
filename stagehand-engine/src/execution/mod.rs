// Execution Engine Module
// Handles stage scheduling, manual gating, matrix expansion and job execution

pub mod context;
pub mod events;
pub mod executor;
pub mod gate;
pub mod graph;
pub mod matrix;
pub mod plan;
pub mod report;

// Re-export key types
pub use context::{expand_variables, VariableScope};
pub use events::{
    progress_channel, EventSender, ExecutionEvent, LogLevel, ProgressReceiver, ProgressSender,
};
pub use executor::PipelineExecutor;
pub use gate::{GateDecision, ManualGate};
pub use graph::{GraphError, StageBatch, StageGraph};
pub use matrix::{MatrixExpander, MatrixInstance};
pub use plan::{ExecutionMode, PipelinePlan, Planner, ResolvedJob};
pub use report::{
    FailureReason, JobOutcome, JobStatus, PipelineReport, PipelineStatus, SkipReason,
    StageReport, StageStatus,
};
