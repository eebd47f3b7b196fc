// Rule evaluation
// First matching rule decides whether and how a job runs

use crate::error::ConfigError;
use crate::execution::ExecutionMode;
use crate::parser::models::{JobWhen, RuleSpec, When};
use crate::rules::expression::{self, ExpressionError};
use crate::rules::predicate::{Predicate, RuleScope};

use std::collections::BTreeMap;

/// A compiled entry of a job's `rules:` list
#[derive(Debug, Clone)]
pub struct Rule {
    pub predicate: Predicate,
    pub when: When,
    pub allow_failure: Option<bool>,
    pub variables: BTreeMap<String, String>,
}

impl Rule {
    /// Compile the clauses of one rule; all present clauses must hold
    pub fn compile(spec: &RuleSpec) -> Result<Self, ExpressionError> {
        let mut clauses = Vec::new();
        if let Some(condition) = &spec.condition {
            clauses.push(expression::compile(condition)?);
        }
        if let Some(refs) = &spec.refs {
            clauses.push(Predicate::RefMatches(refs.clone()));
        }
        if let Some(sources) = &spec.sources {
            clauses.push(Predicate::SourceIn(sources.clone()));
        }
        if let Some(changes) = &spec.changes {
            clauses.push(Predicate::ChangesAny(changes.clone()));
        }

        Ok(Self {
            predicate: Predicate::all(clauses),
            when: spec.when,
            allow_failure: spec.allow_failure,
            variables: spec.variables.clone(),
        })
    }

    /// Compile every rule of a job, naming the job in errors
    pub fn compile_all(job: &str, specs: &[RuleSpec]) -> Result<Vec<Rule>, ConfigError> {
        specs
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                Rule::compile(spec).map_err(|source| ConfigError::MalformedRule {
                    job: job.to_string(),
                    index,
                    source,
                })
            })
            .collect()
    }
}

/// Job settings that apply when no rule overrides them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobDefaults {
    pub when: JobWhen,
    pub allow_failure: bool,
}

/// Result of evaluating a job's rules against a trigger
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    pub included: bool,
    pub mode: ExecutionMode,
    pub allow_failure: bool,
    /// Variables set by the matched rule
    pub variables: BTreeMap<String, String>,
    /// Index of the rule that decided, `None` if no rule did
    pub matched_rule: Option<usize>,
}

impl RuleOutcome {
    fn excluded(matched_rule: Option<usize>) -> Self {
        Self {
            included: false,
            mode: ExecutionMode::Skip,
            allow_failure: false,
            variables: BTreeMap::new(),
            matched_rule,
        }
    }
}

/// Decides job inclusion from an ordered rule list
pub struct RuleEvaluator;

impl RuleEvaluator {
    /// Evaluate rules in order; the first match decides
    ///
    /// - No rules: the job is included with its own `when`/`allow_failure`.
    /// - A matching `when: never` rule excludes the job.
    /// - No matching rule excludes the job.
    pub fn evaluate(
        rules: Option<&[Rule]>,
        scope: &RuleScope<'_>,
        defaults: JobDefaults,
    ) -> RuleOutcome {
        let Some(rules) = rules else {
            return RuleOutcome {
                included: true,
                mode: match defaults.when {
                    JobWhen::Always => ExecutionMode::Always,
                    JobWhen::Manual => ExecutionMode::Manual,
                },
                allow_failure: defaults.allow_failure,
                variables: BTreeMap::new(),
                matched_rule: None,
            };
        };

        let Some((index, rule)) = rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.predicate.matches(scope))
        else {
            return RuleOutcome::excluded(None);
        };

        let mode = match rule.when {
            When::Never => return RuleOutcome::excluded(Some(index)),
            When::Always => ExecutionMode::Always,
            When::Manual => ExecutionMode::Manual,
        };

        RuleOutcome {
            included: true,
            mode,
            allow_failure: rule.allow_failure.unwrap_or(defaults.allow_failure),
            variables: rule.variables.clone(),
            matched_rule: Some(index),
        }
    }
}
