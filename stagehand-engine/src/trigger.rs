// Pipeline Trigger
// Immutable description of the event that started a pipeline run

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// What caused the pipeline to be created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Push,
    #[serde(alias = "merge_request_event")]
    MergeRequest,
    Schedule,
    #[serde(alias = "web")]
    Manual,
}

impl TriggerSource {
    /// Value exposed to jobs as `CI_PIPELINE_SOURCE`
    pub fn as_ci_source(&self) -> &'static str {
        match self {
            TriggerSource::Push => "push",
            TriggerSource::MergeRequest => "merge_request_event",
            TriggerSource::Schedule => "schedule",
            TriggerSource::Manual => "web",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ci_source())
    }
}

impl FromStr for TriggerSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(TriggerSource::Push),
            "merge_request" | "merge_request_event" | "mr" => Ok(TriggerSource::MergeRequest),
            "schedule" => Ok(TriggerSource::Schedule),
            "manual" | "web" => Ok(TriggerSource::Manual),
            other => Err(format!(
                "unknown pipeline source '{}', expected push, merge_request, schedule or manual",
                other
            )),
        }
    }
}

/// Trigger metadata for one pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineTrigger {
    pub git_ref: String,
    pub source: TriggerSource,
    pub changed_paths: BTreeSet<String>,
    pub variables: BTreeMap<String, String>,
}

impl PipelineTrigger {
    pub fn new(git_ref: impl Into<String>, source: TriggerSource) -> Self {
        Self {
            git_ref: git_ref.into(),
            source,
            changed_paths: BTreeSet::new(),
            variables: BTreeMap::new(),
        }
    }

    pub fn with_changed_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.changed_paths.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_variables(mut self, variables: BTreeMap<String, String>) -> Self {
        self.variables.extend(variables);
        self
    }

    pub fn is_merge_request(&self) -> bool {
        self.source == TriggerSource::MergeRequest
    }

    /// Variables every job sees, derived from the trigger and project settings
    pub fn predefined_variables(
        &self,
        project: &str,
        default_branch: &str,
    ) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("CI".to_string(), "true".to_string());
        vars.insert("CI_PROJECT_NAME".to_string(), project.to_string());
        vars.insert("CI_COMMIT_REF_NAME".to_string(), self.git_ref.clone());
        vars.insert("CI_COMMIT_REF_SLUG".to_string(), slugify(&self.git_ref));
        vars.insert("CI_DEFAULT_BRANCH".to_string(), default_branch.to_string());
        vars.insert(
            "CI_PIPELINE_SOURCE".to_string(),
            self.source.as_ci_source().to_string(),
        );
        if !self.is_merge_request() {
            vars.insert("CI_COMMIT_BRANCH".to_string(), self.git_ref.clone());
        }
        vars
    }
}

/// Lowercase, dash-separated form of a ref, at most 63 characters
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let mut slug: String = slug.trim_matches('-').chars().take(63).collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("master"), "master");
        assert_eq!(slugify("feature/New_Solver"), "feature-new-solver");
        assert_eq!(slugify("--weird//ref--"), "weird-ref");
        assert_eq!(slugify(&"a".repeat(80)).len(), 63);
    }

    #[test]
    fn test_source_parsing() {
        assert_eq!("push".parse::<TriggerSource>(), Ok(TriggerSource::Push));
        assert_eq!(
            "merge_request_event".parse::<TriggerSource>(),
            Ok(TriggerSource::MergeRequest)
        );
        assert_eq!("web".parse::<TriggerSource>(), Ok(TriggerSource::Manual));
        assert!("tag".parse::<TriggerSource>().is_err());
    }

    #[test]
    fn test_predefined_variables_for_push() {
        let trigger = PipelineTrigger::new("master", TriggerSource::Push);
        let vars = trigger.predefined_variables("dolfiny", "master");

        assert_eq!(vars.get("CI_COMMIT_BRANCH"), Some(&"master".to_string()));
        assert_eq!(vars.get("CI_PIPELINE_SOURCE"), Some(&"push".to_string()));
        assert_eq!(vars.get("CI_DEFAULT_BRANCH"), Some(&"master".to_string()));
        assert_eq!(vars.get("CI_PROJECT_NAME"), Some(&"dolfiny".to_string()));
    }

    #[test]
    fn test_merge_request_has_no_branch_variable() {
        let trigger = PipelineTrigger::new("feature/x", TriggerSource::MergeRequest);
        let vars = trigger.predefined_variables("dolfiny", "master");

        assert!(!vars.contains_key("CI_COMMIT_BRANCH"));
        assert_eq!(
            vars.get("CI_PIPELINE_SOURCE"),
            Some(&"merge_request_event".to_string())
        );
        assert_eq!(vars.get("CI_COMMIT_REF_SLUG"), Some(&"feature-x".to_string()));
    }
}
