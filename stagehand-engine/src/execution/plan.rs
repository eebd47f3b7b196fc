// Pipeline Planning
// Turns a parsed pipeline and a trigger into ordered stage batches of concrete job instances

use crate::config::EngineConfig;
use crate::error::ConfigError;
use crate::execution::context::VariableScope;
use crate::execution::graph::{GraphError, StageBatch, StageGraph};
use crate::execution::matrix::{MatrixExpander, MatrixInstance};
use crate::parser::models::{ArtifactSpec, ComposeSpec, JobSpec, PipelineConfig, RegistryCredentials};
use crate::parser::TemplateResolver;
use crate::rules::{expression, JobDefaults, Rule, RuleEvaluator, RuleScope};
use crate::trigger::PipelineTrigger;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

/// How a planned job instance is run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Runs when its stage starts
    Always,
    /// Held until played through the manual gate
    Manual,
    /// Excluded by rules; never runs
    Skip,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Always => f.write_str("always"),
            ExecutionMode::Manual => f.write_str("manual"),
            ExecutionMode::Skip => f.write_str("skip"),
        }
    }
}

/// A job instance ready to execute
#[derive(Debug, Clone)]
pub struct ResolvedJob {
    /// Instance name, e.g. `image: [arm64]`
    pub name: String,
    /// Logical job name as written in the pipeline
    pub job: String,
    pub stage: String,
    pub image: Option<String>,
    /// Final variables, all layers applied
    pub variables: BTreeMap<String, String>,
    pub before_script: Vec<String>,
    pub script: Vec<String>,
    pub artifacts: Option<ArtifactSpec>,
    pub mode: ExecutionMode,
    pub allow_failure: bool,
    pub timeout: Duration,
    /// Matrix values of this instance
    pub matrix: BTreeMap<String, String>,
    /// `None` takes artifacts from every earlier stage
    pub dependencies: Option<Vec<String>>,
    pub compose: Option<ComposeSpec>,
}

impl ResolvedJob {
    pub fn has_script(&self) -> bool {
        !self.before_script.is_empty() || !self.script.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn for_test(name: &str, stage: &str) -> Self {
        Self {
            name: name.to_string(),
            job: name.to_string(),
            stage: stage.to_string(),
            image: None,
            variables: BTreeMap::new(),
            before_script: Vec::new(),
            script: vec!["true".to_string()],
            artifacts: None,
            mode: ExecutionMode::Always,
            allow_failure: false,
            timeout: Duration::from_secs(60),
            matrix: BTreeMap::new(),
            dependencies: None,
            compose: None,
        }
    }
}

/// Everything needed to execute one pipeline run
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub project: String,
    pub trigger: PipelineTrigger,
    /// Declared stage order, including stages without jobs
    pub stages: Vec<String>,
    pub batches: Vec<StageBatch>,
    /// Pipeline-level variables (predefined, global, trigger)
    pub variables: BTreeMap<String, String>,
    /// Registry logins with variables expanded
    pub registries: Vec<RegistryCredentials>,
}

impl PipelinePlan {
    pub fn jobs(&self) -> impl Iterator<Item = &ResolvedJob> {
        self.batches.iter().flat_map(|batch| batch.jobs.iter())
    }

    /// Find an instance by instance name
    pub fn job(&self, name: &str) -> Option<&ResolvedJob> {
        self.jobs().find(|job| job.name == name)
    }

    /// All instances of a logical job
    pub fn instances_of<'a>(&'a self, job: &'a str) -> impl Iterator<Item = &'a ResolvedJob> {
        self.jobs().filter(move |instance| instance.job == job)
    }

    pub fn stage_position(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }
}

/// Builds a `PipelinePlan`; every configuration error surfaces here
pub struct Planner<'a> {
    config: &'a PipelineConfig,
    engine: &'a EngineConfig,
}

impl<'a> Planner<'a> {
    pub fn new(config: &'a PipelineConfig, engine: &'a EngineConfig) -> Self {
        Self { config, engine }
    }

    pub fn plan(&self, trigger: &PipelineTrigger) -> Result<PipelinePlan, ConfigError> {
        let graph = StageGraph::new(&self.config.stages)?;
        let specs = TemplateResolver::new(self.config).resolve_all()?;

        let pipeline_scope = VariableScope::new()
            .layer(&trigger.predefined_variables(&self.engine.project, &self.engine.default_branch))
            .layer(&self.config.variables)
            .layer(&trigger.variables);

        let stage_of: HashMap<&str, &str> = specs
            .iter()
            .map(|spec| (spec.name.as_str(), spec.stage.as_str()))
            .collect();

        let mut jobs = Vec::new();
        for spec in &specs {
            if graph.stage_index(&spec.stage).is_none() {
                return Err(GraphError::unknown_stage(&spec.name, &spec.stage).into());
            }
            Self::validate_references(&graph, spec, &stage_of)?;
            jobs.extend(self.plan_job(spec, trigger)?);
        }

        let registries = self
            .config
            .registries
            .iter()
            .map(|registry| RegistryCredentials {
                host: pipeline_scope.expand(&registry.host),
                username: pipeline_scope.expand(&registry.username),
                password: pipeline_scope.expand(&registry.password),
            })
            .collect();

        let batches = graph.schedule(jobs)?;
        tracing::debug!(
            project = %self.engine.project,
            git_ref = %trigger.git_ref,
            batches = batches.len(),
            "pipeline planned"
        );

        Ok(PipelinePlan {
            project: self.engine.project.clone(),
            trigger: trigger.clone(),
            stages: graph.stages().to_vec(),
            batches,
            variables: pipeline_scope.into_map(),
            registries,
        })
    }

    /// Evaluate rules once for the logical job, then expand included jobs
    fn plan_job(&self, spec: &JobSpec, trigger: &PipelineTrigger) -> Result<Vec<ResolvedJob>, ConfigError> {
        let rules = spec
            .rules
            .as_deref()
            .map(|specs| Rule::compile_all(&spec.name, specs))
            .transpose()?;

        let base = VariableScope::new()
            .layer(&trigger.predefined_variables(&self.engine.project, &self.engine.default_branch))
            .layer(&self.config.variables)
            .layer(&spec.variables);

        let rule_scope = base.clone().layer(&trigger.variables);
        let outcome = RuleEvaluator::evaluate(
            rules.as_deref(),
            &RuleScope::new(trigger, rule_scope.as_map()),
            JobDefaults {
                when: spec.when,
                allow_failure: spec.allow_failure,
            },
        );

        // Matrix errors are configuration errors even for excluded jobs
        let instances = match &spec.parallel {
            Some(parallel) => MatrixExpander::expand(&spec.name, parallel)?,
            None => vec![MatrixInstance {
                name: spec.name.clone(),
                variables: BTreeMap::new(),
            }],
        };

        if let Some(compose) = &spec.compose {
            Self::validate_compose(&spec.name, compose)?;
        }

        if !outcome.included {
            tracing::debug!(job = %spec.name, "job excluded by rules");
            let mut job = self.instance(spec, base, &MatrixInstance {
                name: spec.name.clone(),
                variables: BTreeMap::new(),
            }, trigger);
            job.mode = outcome.mode;
            return Ok(vec![job]);
        }

        let with_rules = base.layer(&outcome.variables);
        Ok(instances
            .iter()
            .map(|instance| {
                let mut job = self.instance(spec, with_rules.clone(), instance, trigger);
                job.mode = outcome.mode;
                job.allow_failure = outcome.allow_failure;
                job
            })
            .collect())
    }

    fn instance(
        &self,
        spec: &JobSpec,
        scope: VariableScope,
        instance: &MatrixInstance,
        trigger: &PipelineTrigger,
    ) -> ResolvedJob {
        let scope = scope
            .layer(&instance.variables)
            .layer(&trigger.variables)
            .set("CI_JOB_NAME", instance.name.clone())
            .set("CI_JOB_STAGE", spec.stage.clone());

        ResolvedJob {
            name: instance.name.clone(),
            job: spec.name.clone(),
            stage: spec.stage.clone(),
            image: spec.image.as_deref().map(|image| scope.expand(image)),
            variables: scope.into_map(),
            before_script: spec.before_script.clone(),
            script: spec.script.clone(),
            artifacts: spec.artifacts.clone(),
            mode: ExecutionMode::Always,
            allow_failure: spec.allow_failure,
            timeout: spec.timeout.unwrap_or(self.engine.default_job_timeout),
            matrix: instance.variables.clone(),
            dependencies: spec.dependencies.clone(),
            compose: spec.compose.clone(),
        }
    }

    /// `dependencies` and compose sources must name jobs in earlier stages
    fn validate_references(
        graph: &StageGraph,
        spec: &JobSpec,
        stage_of: &HashMap<&str, &str>,
    ) -> Result<(), ConfigError> {
        let dependencies = spec.dependencies.iter().flatten();
        let sources = spec.compose.iter().flat_map(|compose| compose.sources.iter());

        for name in dependencies.chain(sources) {
            let earlier = stage_of
                .get(name.as_str())
                .is_some_and(|stage| graph.is_earlier(stage, &spec.stage));
            if !earlier {
                return Err(GraphError::invalid_dependency(&spec.name, name).into());
            }
        }
        Ok(())
    }

    fn validate_compose(job: &str, compose: &ComposeSpec) -> Result<(), ConfigError> {
        if compose.architectures.is_empty() {
            return Err(ConfigError::invalid_compose(job, "architectures must not be empty"));
        }
        if compose.sources.is_empty() {
            return Err(ConfigError::invalid_compose(job, "sources must not be empty"));
        }
        if compose.repository.trim().is_empty() {
            return Err(ConfigError::invalid_compose(job, "repository must not be empty"));
        }
        for rule in &compose.tags {
            expression::compile(&rule.condition).map_err(|err| {
                ConfigError::invalid_compose(job, format!("tag rule '{}': {}", rule.condition, err))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::graph::GraphErrorKind;
    use crate::parser::PipelineParser;
    use crate::trigger::TriggerSource;

    const PIPELINE: &str = r#"
stages: [lint, image, test, release]

variables:
  REGISTRY: registry.example.com/dolfiny

.image_base:
  image: docker:24
  before_script:
    - docker login

flake8:
  stage: lint
  script: flake8 .

image:
  extends: .image_base
  stage: image
  parallel:
    matrix:
      - ARCH: [amd64, arm64]
  variables:
    IMAGE: $REGISTRY:$ARCH
  script: docker build -t $IMAGE .
  rules:
    - changes: ["docker/**"]
    - if: $CI_PIPELINE_SOURCE == "schedule"

unit:
  stage: test
  image: $REGISTRY:amd64
  dependencies: [flake8]
  script: pytest

release:
  stage: release
  compose:
    repository: $REGISTRY
    sources: image
    architectures: [amd64, arm64]
    source_image: $REGISTRY:$ARCH
    tags:
      - if: $CI_COMMIT_BRANCH == $CI_DEFAULT_BRANCH
        tag: latest
  rules:
    - if: $CI_COMMIT_BRANCH == "master"
      when: manual
"#;

    fn plan(yaml: &str, trigger: &PipelineTrigger) -> Result<PipelinePlan, ConfigError> {
        let config = PipelineParser::parse(yaml).unwrap();
        let engine = EngineConfig::new("dolfiny").with_default_branch("master");
        Planner::new(&config, &engine).plan(trigger)
    }

    #[test]
    fn test_plan_batches_follow_stage_order() {
        let trigger =
            PipelineTrigger::new("master", TriggerSource::Push).with_changed_paths(["docker/Dockerfile"]);
        let plan = plan(PIPELINE, &trigger).unwrap();

        let stages: Vec<&str> = plan.batches.iter().map(|b| b.stage.as_str()).collect();
        assert_eq!(stages, vec!["lint", "image", "test", "release"]);
        assert_eq!(plan.stages.len(), 4);
    }

    #[test]
    fn test_matrix_instances_carry_variables() {
        let trigger = PipelineTrigger::new("master", TriggerSource::Schedule);
        let plan = plan(PIPELINE, &trigger).unwrap();

        let arm = plan.job("image: [arm64]").unwrap();
        assert_eq!(arm.job, "image");
        assert_eq!(arm.mode, ExecutionMode::Always);
        assert_eq!(arm.variables.get("ARCH").map(String::as_str), Some("arm64"));
        assert_eq!(
            arm.variables.get("CI_JOB_NAME").map(String::as_str),
            Some("image: [arm64]")
        );
        assert_eq!(arm.variables.get("CI_JOB_STAGE").map(String::as_str), Some("image"));
        assert_eq!(arm.before_script, vec!["docker login".to_string()]);
        assert_eq!(plan.instances_of("image").count(), 2);
    }

    #[test]
    fn test_excluded_job_planned_as_skip() {
        let trigger =
            PipelineTrigger::new("feature", TriggerSource::Push).with_changed_paths(["src/a.py"]);
        let plan = plan(PIPELINE, &trigger).unwrap();

        let image: Vec<&ResolvedJob> = plan.instances_of("image").collect();
        assert_eq!(image.len(), 1);
        assert_eq!(image[0].mode, ExecutionMode::Skip);

        let release = plan.job("release").unwrap();
        assert_eq!(release.mode, ExecutionMode::Skip);
    }

    #[test]
    fn test_manual_rule_and_image_expansion() {
        let trigger = PipelineTrigger::new("master", TriggerSource::Push);
        let plan = plan(PIPELINE, &trigger).unwrap();

        assert_eq!(plan.job("release").unwrap().mode, ExecutionMode::Manual);
        assert_eq!(
            plan.job("unit").unwrap().image.as_deref(),
            Some("registry.example.com/dolfiny:amd64")
        );
    }

    #[test]
    fn test_trigger_variables_take_precedence() {
        let trigger = PipelineTrigger::new("master", TriggerSource::Schedule)
            .with_variable("ARCH", "riscv64")
            .with_variable("REGISTRY", "mirror.local");
        let plan = plan(PIPELINE, &trigger).unwrap();

        let amd = plan.job("image: [amd64]").unwrap();
        assert_eq!(amd.variables.get("ARCH").map(String::as_str), Some("riscv64"));
        assert_eq!(plan.variables.get("REGISTRY").map(String::as_str), Some("mirror.local"));
    }

    #[test]
    fn test_dependency_on_later_stage_rejected() {
        let yaml = r#"
stages: [build, test]
build:
  stage: build
  dependencies: [unit]
  script: make
unit:
  stage: test
  script: make test
"#;
        let trigger = PipelineTrigger::new("main", TriggerSource::Push);
        let err = plan(yaml, &trigger).unwrap_err();
        assert!(matches!(err, ConfigError::Graph(ref e) if e.kind == GraphErrorKind::InvalidDependency));
    }

    #[test]
    fn test_unknown_stage_rejected() {
        let yaml = "stages: [build]\ndeploy:\n  stage: deploy\n  script: ./deploy.sh\n";
        let trigger = PipelineTrigger::new("main", TriggerSource::Push);
        let err = plan(yaml, &trigger).unwrap_err();
        assert!(matches!(err, ConfigError::Graph(ref e) if e.kind == GraphErrorKind::UnknownStage));
    }

    #[test]
    fn test_malformed_rule_rejected_before_execution() {
        let yaml = "job:\n  script: make\n  rules:\n    - if: $A == \n";
        let trigger = PipelineTrigger::new("main", TriggerSource::Push);
        let err = plan(yaml, &trigger).unwrap_err();
        assert!(matches!(err, ConfigError::MalformedRule { .. }));
    }

    #[test]
    fn test_compose_without_architectures_rejected() {
        let yaml = r#"
stages: [build, release]
image:
  stage: build
  script: make
release:
  stage: release
  compose:
    repository: r.io/app
    sources: image
    architectures: []
    source_image: r.io/app:$ARCH
"#;
        let trigger = PipelineTrigger::new("main", TriggerSource::Push);
        let err = plan(yaml, &trigger).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCompose { .. }));
    }

    #[test]
    fn test_registry_credentials_expanded() {
        let yaml = r#"
variables:
  CI_REGISTRY_USER: bot
registries:
  - host: registry.example.com
    username: $CI_REGISTRY_USER
    password: $REGISTRY_TOKEN
job:
  script: make
"#;
        let trigger =
            PipelineTrigger::new("main", TriggerSource::Push).with_variable("REGISTRY_TOKEN", "s3cret");
        let plan = plan(yaml, &trigger).unwrap();

        assert_eq!(plan.registries[0].username, "bot");
        assert_eq!(plan.registries[0].password, "s3cret");
    }

    #[test]
    fn test_job_timeout_defaults_to_engine_setting() {
        let yaml = "quick:\n  timeout: 5 minutes\n  script: make\nslow:\n  script: make\n";
        let trigger = PipelineTrigger::new("main", TriggerSource::Push);
        let plan = plan(yaml, &trigger).unwrap();

        assert_eq!(plan.job("quick").unwrap().timeout, Duration::from_secs(300));
        assert_eq!(plan.job("slow").unwrap().timeout, Duration::from_secs(3600));
    }
}
