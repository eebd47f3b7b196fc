// Stage Graph
// Orders resolved jobs into sequential stage batches and validates cross-stage references

use crate::execution::plan::{ExecutionMode, ResolvedJob};

use std::collections::HashMap;
use std::fmt;

/// Error type for graph operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// A stage is declared twice
    DuplicateStage,
    /// A job names a stage that is not declared
    UnknownStage,
    /// `dependencies` or compose sources name a job that is not in an earlier stage
    InvalidDependency,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage graph error: {}", self.message)
    }
}

impl std::error::Error for GraphError {}

impl GraphError {
    pub fn duplicate_stage(stage: &str) -> Self {
        Self {
            message: format!("stage '{}' is declared more than once", stage),
            kind: GraphErrorKind::DuplicateStage,
        }
    }

    pub fn unknown_stage(job: &str, stage: &str) -> Self {
        Self {
            message: format!("job '{}' uses undeclared stage '{}'", job, stage),
            kind: GraphErrorKind::UnknownStage,
        }
    }

    pub fn invalid_dependency(job: &str, dependency: &str) -> Self {
        Self {
            message: format!(
                "job '{}' depends on '{}', which is not a job in an earlier stage",
                job, dependency
            ),
            kind: GraphErrorKind::InvalidDependency,
        }
    }
}

/// Jobs of one stage, run concurrently
#[derive(Debug, Clone)]
pub struct StageBatch {
    pub stage: String,
    /// Position of the stage in the declared order
    pub index: usize,
    pub jobs: Vec<ResolvedJob>,
}

impl StageBatch {
    /// Jobs that must reach success or allowed failure before the next stage starts
    pub fn required_jobs(&self) -> impl Iterator<Item = &ResolvedJob> {
        self.jobs
            .iter()
            .filter(|job| job.mode == ExecutionMode::Always)
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Declared stage order
#[derive(Debug, Clone)]
pub struct StageGraph {
    stages: Vec<String>,
    stage_indices: HashMap<String, usize>,
}

impl StageGraph {
    pub fn new(stages: &[String]) -> Result<Self, GraphError> {
        let mut stage_indices = HashMap::with_capacity(stages.len());
        for (index, stage) in stages.iter().enumerate() {
            if stage_indices.insert(stage.clone(), index).is_some() {
                return Err(GraphError::duplicate_stage(stage));
            }
        }
        Ok(Self {
            stages: stages.to_vec(),
            stage_indices,
        })
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn stage_index(&self, stage: &str) -> Option<usize> {
        self.stage_indices.get(stage).copied()
    }

    /// Check that `dependency_stage` comes strictly before `job_stage`
    pub fn is_earlier(&self, dependency_stage: &str, job_stage: &str) -> bool {
        match (self.stage_index(dependency_stage), self.stage_index(job_stage)) {
            (Some(dep), Some(job)) => dep < job,
            _ => false,
        }
    }

    /// Group jobs into batches in declared stage order
    ///
    /// Stages without jobs produce no batch. Job order within a batch follows
    /// the input order.
    pub fn schedule(&self, jobs: Vec<ResolvedJob>) -> Result<Vec<StageBatch>, GraphError> {
        let mut buckets: Vec<Vec<ResolvedJob>> = vec![Vec::new(); self.stages.len()];
        for job in jobs {
            let index = self
                .stage_index(&job.stage)
                .ok_or_else(|| GraphError::unknown_stage(&job.job, &job.stage))?;
            buckets[index].push(job);
        }

        Ok(buckets
            .into_iter()
            .enumerate()
            .filter(|(_, jobs)| !jobs.is_empty())
            .map(|(index, jobs)| StageBatch {
                stage: self.stages[index].clone(),
                index,
                jobs,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stages(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn job(name: &str, stage: &str) -> ResolvedJob {
        ResolvedJob::for_test(name, stage)
    }

    #[test]
    fn test_schedule_in_declared_order() {
        let graph = StageGraph::new(&stages(&["lint", "image", "test", "release"])).unwrap();
        let batches = graph
            .schedule(vec![
                job("unit", "test"),
                job("flake8", "lint"),
                job("integration", "test"),
                job("publish", "release"),
            ])
            .unwrap();

        let names: Vec<&str> = batches.iter().map(|b| b.stage.as_str()).collect();
        assert_eq!(names, vec!["lint", "test", "release"]);
        assert_eq!(batches[1].index, 2);

        let test_jobs: Vec<&str> = batches[1].jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(test_jobs, vec!["unit", "integration"]);
    }

    #[test]
    fn test_unknown_stage() {
        let graph = StageGraph::new(&stages(&["build"])).unwrap();
        let err = graph.schedule(vec![job("deploy", "deploy")]).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::UnknownStage);
    }

    #[test]
    fn test_duplicate_stage() {
        let err = StageGraph::new(&stages(&["build", "test", "build"])).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::DuplicateStage);
    }

    #[test]
    fn test_is_earlier() {
        let graph = StageGraph::new(&stages(&["build", "test"])).unwrap();
        assert!(graph.is_earlier("build", "test"));
        assert!(!graph.is_earlier("test", "test"));
        assert!(!graph.is_earlier("test", "build"));
        assert!(!graph.is_earlier("missing", "test"));
    }

    #[test]
    fn test_required_jobs_exclude_manual_and_skipped() {
        let mut manual = job("deploy", "test");
        manual.mode = ExecutionMode::Manual;
        let mut skipped = job("docs", "test");
        skipped.mode = ExecutionMode::Skip;

        let graph = StageGraph::new(&stages(&["test"])).unwrap();
        let batches = graph
            .schedule(vec![job("unit", "test"), manual, skipped])
            .unwrap();

        let required: Vec<&str> = batches[0].required_jobs().map(|j| j.name.as_str()).collect();
        assert_eq!(required, vec!["unit"]);
    }
}
