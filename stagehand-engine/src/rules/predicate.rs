// Rule predicates
// Closed set of conditions a rule can test against a pipeline trigger

use crate::rules::glob;
use crate::trigger::{PipelineTrigger, TriggerSource};

use regex::Regex;
use std::collections::BTreeMap;

/// Everything a predicate may look at
#[derive(Debug, Clone, Copy)]
pub struct RuleScope<'a> {
    pub trigger: &'a PipelineTrigger,
    pub variables: &'a BTreeMap<String, String>,
}

impl<'a> RuleScope<'a> {
    pub fn new(trigger: &'a PipelineTrigger, variables: &'a BTreeMap<String, String>) -> Self {
        Self { trigger, variables }
    }

    pub fn variable(&self, name: &str) -> Option<&'a str> {
        self.variables.get(name).map(String::as_str)
    }
}

/// Value side of a comparison
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Variable(String),
    Literal(String),
    Null,
}

impl Operand {
    fn resolve<'a>(&'a self, scope: &RuleScope<'a>) -> Option<&'a str> {
        match self {
            Operand::Variable(name) => scope.variable(name),
            Operand::Literal(value) => Some(value.as_str()),
            Operand::Null => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
}

/// A compiled rule condition
#[derive(Debug, Clone)]
pub enum Predicate {
    Always,
    /// Variable is set and not empty
    Defined(String),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    Matches {
        operand: Operand,
        pattern: Regex,
        negate: bool,
    },
    /// Ref matches one of the glob patterns
    RefMatches(Vec<String>),
    SourceIn(Vec<TriggerSource>),
    /// Any changed path matches one of the glob patterns
    ChangesAny(Vec<String>),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn matches(&self, scope: &RuleScope<'_>) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::Defined(name) => scope.variable(name).is_some_and(|v| !v.is_empty()),
            Predicate::Compare { left, op, right } => {
                let equal = left.resolve(scope) == right.resolve(scope);
                match op {
                    CompareOp::Eq => equal,
                    CompareOp::Ne => !equal,
                }
            }
            Predicate::Matches {
                operand,
                pattern,
                negate,
            } => {
                let matched = operand
                    .resolve(scope)
                    .is_some_and(|value| pattern.is_match(value));
                matched != *negate
            }
            Predicate::RefMatches(patterns) => patterns
                .iter()
                .any(|pattern| glob::glob_match(pattern, &scope.trigger.git_ref)),
            Predicate::SourceIn(sources) => sources.contains(&scope.trigger.source),
            Predicate::ChangesAny(patterns) => {
                glob::any_match(patterns, scope.trigger.changed_paths.iter())
            }
            Predicate::All(predicates) => predicates.iter().all(|p| p.matches(scope)),
            Predicate::Any(predicates) => predicates.iter().any(|p| p.matches(scope)),
            Predicate::Not(inner) => !inner.matches(scope),
        }
    }

    /// Conjunction that collapses trivial cases
    pub fn all(mut predicates: Vec<Predicate>) -> Predicate {
        match predicates.len() {
            0 => Predicate::Always,
            1 => predicates.remove(0),
            _ => Predicate::All(predicates),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defined_requires_non_empty() {
        let trigger = PipelineTrigger::new("master", TriggerSource::Push);
        let variables = vars(&[("SET", "1"), ("EMPTY", "")]);
        let scope = RuleScope::new(&trigger, &variables);

        assert!(Predicate::Defined("SET".to_string()).matches(&scope));
        assert!(!Predicate::Defined("EMPTY".to_string()).matches(&scope));
        assert!(!Predicate::Defined("MISSING".to_string()).matches(&scope));
    }

    #[test]
    fn test_compare_with_null() {
        let trigger = PipelineTrigger::new("master", TriggerSource::Push);
        let variables = vars(&[("SET", "1")]);
        let scope = RuleScope::new(&trigger, &variables);

        let missing_is_null = Predicate::Compare {
            left: Operand::Variable("MISSING".to_string()),
            op: CompareOp::Eq,
            right: Operand::Null,
        };
        let set_is_not_null = Predicate::Compare {
            left: Operand::Variable("SET".to_string()),
            op: CompareOp::Ne,
            right: Operand::Null,
        };
        assert!(missing_is_null.matches(&scope));
        assert!(set_is_not_null.matches(&scope));
    }

    #[test]
    fn test_negated_match_on_missing_variable() {
        let trigger = PipelineTrigger::new("master", TriggerSource::Push);
        let variables = BTreeMap::new();
        let scope = RuleScope::new(&trigger, &variables);

        let predicate = Predicate::Matches {
            operand: Operand::Variable("MISSING".to_string()),
            pattern: Regex::new("x").unwrap(),
            negate: true,
        };
        assert!(predicate.matches(&scope));
    }

    #[test]
    fn test_trigger_predicates() {
        let trigger = PipelineTrigger::new("release/1.2", TriggerSource::Schedule)
            .with_changed_paths(["src/solver.py"]);
        let variables = BTreeMap::new();
        let scope = RuleScope::new(&trigger, &variables);

        assert!(Predicate::RefMatches(vec!["release/*".to_string()]).matches(&scope));
        assert!(!Predicate::RefMatches(vec!["master".to_string()]).matches(&scope));
        assert!(Predicate::SourceIn(vec![TriggerSource::Schedule]).matches(&scope));
        assert!(Predicate::ChangesAny(vec!["src/**/*.py".to_string()]).matches(&scope));
        assert!(!Predicate::ChangesAny(vec!["docs/**".to_string()]).matches(&scope));
    }

    #[test]
    fn test_all_collapses() {
        assert!(matches!(Predicate::all(vec![]), Predicate::Always));
        assert!(matches!(
            Predicate::all(vec![Predicate::Defined("A".to_string())]),
            Predicate::Defined(_)
        ));
    }
}
