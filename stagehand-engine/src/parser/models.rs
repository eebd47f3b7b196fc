// Pipeline Data Models
// Types for the GitLab-style pipeline file: stages, variables, job templates and rules

use crate::parser::duration;
use crate::trigger::TriggerSource;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Stages used when the file declares none
pub const DEFAULT_STAGES: [&str; 3] = ["build", "test", "deploy"];

/// Stage a job lands in when it names none
pub const DEFAULT_JOB_STAGE: &str = "test";

/// Variable a composed job reads the architecture from
pub const DEFAULT_ARCH_VARIABLE: &str = "ARCH";

/// Root pipeline definition
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub stages: Vec<String>,
    pub variables: BTreeMap<String, String>,
    /// The `default:` section, lowest-priority base of every job
    pub default: Option<JobTemplate>,
    /// Hidden (`.name`) templates and visible jobs, by name
    pub templates: BTreeMap<String, JobTemplate>,
    /// Visible job names in declaration order
    pub jobs: Vec<String>,
    pub registries: Vec<RegistryCredentials>,
}

impl PipelineConfig {
    pub fn template(&self, name: &str) -> Option<&JobTemplate> {
        self.templates.get(name)
    }
}

/// A job or hidden template as written in the file
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct JobTemplate {
    #[serde(default, deserialize_with = "deserialize_string_or_seq")]
    pub extends: Vec<String>,
    pub stage: Option<String>,
    pub image: Option<String>,
    #[serde(default, deserialize_with = "deserialize_variables")]
    pub variables: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "deserialize_opt_string_or_seq")]
    pub before_script: Option<Vec<String>>,
    #[serde(default, deserialize_with = "deserialize_opt_string_or_seq")]
    pub script: Option<Vec<String>>,
    pub rules: Option<Vec<RuleSpec>>,
    pub artifacts: Option<ArtifactSpec>,
    pub when: Option<JobWhen>,
    pub allow_failure: Option<bool>,
    #[serde(default, deserialize_with = "duration::deserialize_opt")]
    pub timeout: Option<Duration>,
    pub parallel: Option<ParallelSpec>,
    pub dependencies: Option<Vec<String>>,
    pub compose: Option<ComposeSpec>,
}

/// A job after `extends` and `default:` have been merged in
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub name: String,
    pub stage: String,
    pub image: Option<String>,
    pub variables: BTreeMap<String, String>,
    pub before_script: Vec<String>,
    pub script: Vec<String>,
    pub rules: Option<Vec<RuleSpec>>,
    pub artifacts: Option<ArtifactSpec>,
    pub when: JobWhen,
    pub allow_failure: bool,
    pub timeout: Option<Duration>,
    pub parallel: Option<ParallelSpec>,
    pub dependencies: Option<Vec<String>>,
    pub compose: Option<ComposeSpec>,
}

/// Job-level `when`, used only when the job has no rules
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobWhen {
    #[default]
    #[serde(alias = "on_success")]
    Always,
    Manual,
}

/// Rule-level `when`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum When {
    #[default]
    #[serde(alias = "on_success")]
    Always,
    Manual,
    Never,
}

/// One entry of a job's `rules:` list
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    #[serde(rename = "if")]
    pub condition: Option<String>,
    pub changes: Option<Vec<String>>,
    pub refs: Option<Vec<String>>,
    pub sources: Option<Vec<TriggerSource>>,
    #[serde(default)]
    pub when: When,
    pub allow_failure: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_variables")]
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ArtifactSpec {
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default, deserialize_with = "duration::deserialize_opt")]
    pub expire_in: Option<Duration>,
}

/// `parallel: N` or `parallel: { matrix: [...] }`
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ParallelSpec {
    Count(u32),
    Matrix {
        matrix: Vec<BTreeMap<String, serde_yaml::Value>>,
    },
}

/// Multi-architecture manifest published by a job
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ComposeSpec {
    /// Image repository the manifest is pushed to, e.g. `registry.example.com/app`
    pub repository: String,
    /// Jobs whose instances built the per-architecture images
    #[serde(deserialize_with = "deserialize_string_or_seq")]
    pub sources: Vec<String>,
    pub architectures: Vec<String>,
    #[serde(default = "default_arch_variable")]
    pub arch_variable: String,
    /// Image reference each source instance pushed, expanded with its variables
    pub source_image: String,
    /// First matching rule picks the manifest tag
    #[serde(default)]
    pub tags: Vec<TagRule>,
    #[serde(default = "default_manifest_tag")]
    pub default_tag: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TagRule {
    #[serde(rename = "if")]
    pub condition: String,
    pub tag: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RegistryCredentials {
    pub host: String,
    pub username: String,
    pub password: String,
}

fn default_arch_variable() -> String {
    DEFAULT_ARCH_VARIABLE.to_string()
}

fn default_manifest_tag() -> String {
    "$CI_COMMIT_REF_SLUG".to_string()
}

/// Render a scalar YAML value as a variable string
pub fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Null => Some(String::new()),
        _ => None,
    }
}

/// Variables map with scalar values or `{ value: ..., description: ... }` entries
pub(crate) fn deserialize_variables<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{Error, MapAccess, Visitor};

    struct VariablesVisitor;

    impl<'de> Visitor<'de> for VariablesVisitor {
        type Value = BTreeMap<String, String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a map of variable names to values")
        }

        fn visit_unit<E: Error>(self) -> Result<Self::Value, E> {
            Ok(BTreeMap::new())
        }

        fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
        where
            M: MapAccess<'de>,
        {
            let mut vars = BTreeMap::new();
            while let Some((key, value)) = map.next_entry::<String, serde_yaml::Value>()? {
                let rendered = match &value {
                    serde_yaml::Value::Mapping(entry) => entry
                        .get("value")
                        .and_then(scalar_to_string)
                        .unwrap_or_default(),
                    other => scalar_to_string(other).ok_or_else(|| {
                        M::Error::custom(format!("variable '{}' must be a scalar value", key))
                    })?,
                };
                vars.insert(key, rendered);
            }
            Ok(vars)
        }
    }

    deserializer.deserialize_any(VariablesVisitor)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrSeq {
    One(String),
    Many(Vec<String>),
}

impl From<StringOrSeq> for Vec<String> {
    fn from(value: StringOrSeq) -> Self {
        match value {
            StringOrSeq::One(s) => vec![s],
            StringOrSeq::Many(v) => v,
        }
    }
}

fn deserialize_string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(StringOrSeq::deserialize(deserializer)?.into())
}

pub(crate) fn deserialize_opt_string_or_seq<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<StringOrSeq>::deserialize(deserializer)?.map(Into::into))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_template_deserialize() {
        let yaml = r#"
extends: .python
stage: test
variables:
  PYTHONUNBUFFERED: 1
  MODE: { value: fast, description: speed }
script: pytest -q
rules:
  - if: $CI_COMMIT_BRANCH == "master"
    when: on_success
  - when: manual
    allow_failure: true
artifacts:
  paths: [report.xml]
  expire_in: 2 days
timeout: 1h 30m
"#;
        let job: JobTemplate = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(job.extends, vec![".python"]);
        assert_eq!(job.variables.get("PYTHONUNBUFFERED"), Some(&"1".to_string()));
        assert_eq!(job.variables.get("MODE"), Some(&"fast".to_string()));
        assert_eq!(job.script, Some(vec!["pytest -q".to_string()]));

        let rules = job.rules.unwrap();
        assert_eq!(rules[0].when, When::Always);
        assert_eq!(rules[1].when, When::Manual);
        assert_eq!(rules[1].allow_failure, Some(true));

        let artifacts = job.artifacts.unwrap();
        assert_eq!(artifacts.expire_in, Some(Duration::from_secs(2 * 86400)));
        assert_eq!(job.timeout, Some(Duration::from_secs(5400)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<JobTemplate, _> = serde_yaml::from_str("before-script: [ls]");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("unknown field `before-script`"));
    }

    #[test]
    fn test_parallel_forms() {
        let count: ParallelSpec = serde_yaml::from_str("3").unwrap();
        assert_eq!(count, ParallelSpec::Count(3));

        let matrix: ParallelSpec =
            serde_yaml::from_str("matrix:\n  - ARCH: [amd64, arm64]").unwrap();
        assert!(matches!(matrix, ParallelSpec::Matrix { matrix } if matrix.len() == 1));
    }

    #[test]
    fn test_compose_defaults() {
        let yaml = r#"
repository: registry.example.com/dolfiny
sources: image
architectures: [amd64, arm64]
source_image: registry.example.com/dolfiny:$CI_COMMIT_REF_SLUG-$ARCH
"#;
        let compose: ComposeSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(compose.sources, vec!["image"]);
        assert_eq!(compose.arch_variable, "ARCH");
        assert_eq!(compose.default_tag, "$CI_COMMIT_REF_SLUG");
        assert!(compose.tags.is_empty());
    }

    #[test]
    fn test_rule_sources() {
        let rule: RuleSpec =
            serde_yaml::from_str("sources: [merge_request_event, schedule]\nwhen: never").unwrap();
        assert_eq!(
            rule.sources,
            Some(vec![TriggerSource::MergeRequest, TriggerSource::Schedule])
        );
        assert_eq!(rule.when, When::Never);
    }
}
