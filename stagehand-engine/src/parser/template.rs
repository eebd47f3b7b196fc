// Job template resolution
// Flattens `extends` chains and the `default:` section into concrete job specs

use crate::error::ConfigError;
use crate::parser::models::*;

/// Maximum nesting of `extends`
pub const MAX_EXTENDS_DEPTH: usize = 10;

/// Resolves visible jobs against hidden templates and `default:`
///
/// Resolution order, lowest priority first:
/// 1. The `default:` section
/// 2. Each `extends` entry, left to right, itself fully resolved
/// 3. The job's own keys
pub struct TemplateResolver<'a> {
    config: &'a PipelineConfig,
    /// Names currently being resolved, for cycle detection
    extends_stack: Vec<String>,
}

impl<'a> TemplateResolver<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self {
            config,
            extends_stack: Vec::new(),
        }
    }

    /// Resolve every visible job in declaration order
    pub fn resolve_all(&mut self) -> Result<Vec<JobSpec>, ConfigError> {
        let config = self.config;
        config.jobs.iter().map(|name| self.resolve_job(name)).collect()
    }

    /// Resolve one job by name
    pub fn resolve_job(&mut self, name: &str) -> Result<JobSpec, ConfigError> {
        let flattened = self.flatten(name, name)?;
        let merged = match &self.config.default {
            Some(default) => merge(default.clone(), flattened),
            None => flattened,
        };
        JobSpec::from_template(name, merged)
    }

    /// Merge a template with everything it extends, without `default:`
    fn flatten(&mut self, job: &str, name: &str) -> Result<JobTemplate, ConfigError> {
        let config = self.config;
        let template = config
            .template(name)
            .ok_or_else(|| ConfigError::UnknownTemplate {
                job: job.to_string(),
                template: name.to_string(),
            })?;

        self.push_template(job, name)?;

        let mut base: Option<JobTemplate> = None;
        for parent in &template.extends {
            let resolved_parent = self.flatten(job, parent)?;
            base = Some(match base {
                Some(acc) => merge(acc, resolved_parent),
                None => resolved_parent,
            });
        }

        self.pop_template();

        let mut own = template.clone();
        own.extends.clear();
        Ok(match base {
            Some(base) => merge(base, own),
            None => own,
        })
    }

    fn push_template(&mut self, job: &str, name: &str) -> Result<(), ConfigError> {
        if self.extends_stack.iter().any(|entry| entry == name) {
            let mut chain = self.extends_stack.clone();
            chain.push(name.to_string());
            self.extends_stack.clear();
            return Err(ConfigError::CircularExtends { chain });
        }

        // The job itself sits at the bottom of the stack
        if self.extends_stack.len() > MAX_EXTENDS_DEPTH {
            self.extends_stack.clear();
            return Err(ConfigError::ExtendsTooDeep {
                job: job.to_string(),
                max: MAX_EXTENDS_DEPTH,
            });
        }

        self.extends_stack.push(name.to_string());
        Ok(())
    }

    fn pop_template(&mut self) {
        self.extends_stack.pop();
    }
}

/// Resolve a template against an explicit chain, base first
pub fn resolve(template: &JobTemplate, extends_chain: &[&JobTemplate]) -> JobTemplate {
    let mut merged = extends_chain
        .iter()
        .fold(JobTemplate::default(), |acc, parent| merge(acc, (*parent).clone()));
    merged = merge(merged, template.clone());
    merged.extends.clear();
    merged
}

/// Child keys override parent keys; `variables` merge key by key
pub fn merge(mut parent: JobTemplate, child: JobTemplate) -> JobTemplate {
    parent.extends = child.extends;
    if child.stage.is_some() {
        parent.stage = child.stage;
    }
    if child.image.is_some() {
        parent.image = child.image;
    }
    parent.variables.extend(child.variables);
    if child.before_script.is_some() {
        parent.before_script = child.before_script;
    }
    if child.script.is_some() {
        parent.script = child.script;
    }
    if child.rules.is_some() {
        parent.rules = child.rules;
    }
    if child.artifacts.is_some() {
        parent.artifacts = child.artifacts;
    }
    if child.when.is_some() {
        parent.when = child.when;
    }
    if child.allow_failure.is_some() {
        parent.allow_failure = child.allow_failure;
    }
    if child.timeout.is_some() {
        parent.timeout = child.timeout;
    }
    if child.parallel.is_some() {
        parent.parallel = child.parallel;
    }
    if child.dependencies.is_some() {
        parent.dependencies = child.dependencies;
    }
    if child.compose.is_some() {
        parent.compose = child.compose;
    }
    parent
}

impl JobSpec {
    /// Apply defaults to a fully merged template
    pub fn from_template(name: &str, template: JobTemplate) -> Result<Self, ConfigError> {
        let script = template.script.unwrap_or_default();
        if script.is_empty() && template.compose.is_none() {
            return Err(ConfigError::MissingScript {
                job: name.to_string(),
            });
        }

        Ok(Self {
            name: name.to_string(),
            stage: template
                .stage
                .unwrap_or_else(|| DEFAULT_JOB_STAGE.to_string()),
            image: template.image,
            variables: template.variables,
            before_script: template.before_script.unwrap_or_default(),
            script,
            rules: template.rules,
            artifacts: template.artifacts,
            when: template.when.unwrap_or_default(),
            allow_failure: template.allow_failure.unwrap_or(false),
            timeout: template.timeout,
            parallel: template.parallel,
            dependencies: template.dependencies,
            compose: template.compose,
        })
    }
}
