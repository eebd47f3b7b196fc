// GitLab-style Pipeline YAML Parser
// Reads `.gitlab-ci.yml` shaped files into a PipelineConfig

use crate::parser::error::{find_key_line, ParseError, ParseErrorKind, ParseResult};
use crate::parser::models::*;
use crate::parser::models::{deserialize_opt_string_or_seq, deserialize_variables};

use serde_yaml::Value;
use std::fs;
use std::path::Path;

/// Top-level keys recognised but not supported by this engine
const UNSUPPORTED_KEYS: [&str; 3] = ["include", "workflow", "services"];

/// Pipeline file parser
pub struct PipelineParser;

impl PipelineParser {
    /// Parse pipeline from YAML string
    pub fn parse(content: &str) -> ParseResult<PipelineConfig> {
        let root: Value =
            serde_yaml::from_str(content).map_err(|e| ParseError::from_yaml_error(&e, content))?;

        let mapping = match root {
            Value::Mapping(mapping) => mapping,
            Value::Null => {
                return Err(ParseError::new("pipeline file is empty", 1, 1)
                    .with_kind(ParseErrorKind::InvalidSchema))
            }
            _ => {
                return Err(ParseError::new("pipeline file must be a mapping", 1, 1)
                    .with_source_context(content, 1))
            }
        };

        let mut config = PipelineConfig::default();
        let mut global_image = None;
        let mut global_before_script = None;

        for (key, value) in mapping {
            let key = key.as_str().map(str::to_string).ok_or_else(|| {
                ParseError::new("top-level keys must be strings", 1, 1)
                    .with_kind(ParseErrorKind::InvalidSchema)
            })?;

            if UNSUPPORTED_KEYS.contains(&key.as_str()) {
                let line = find_key_line(content, &key).unwrap_or(0);
                return Err(ParseError::new(
                    format!("'{}' is not supported; declare everything in one file", key),
                    line,
                    1,
                )
                .with_kind(ParseErrorKind::Unsupported)
                .with_source_context(content, 1));
            }

            match key.as_str() {
                "stages" => config.stages = Self::parse_field(&key, value, content)?,
                "variables" => {
                    config.variables = deserialize_variables(value)
                        .map_err(|e| Self::field_error(&key, e, content))?;
                }
                "default" => config.default = Some(Self::parse_job(&key, value, content)?),
                "image" if !Self::is_job_mapping(&value) => {
                    global_image = Some(Self::parse_global_image(&key, value, content)?);
                }
                "before_script" => {
                    global_before_script = deserialize_opt_string_or_seq(value)
                        .map_err(|e| Self::field_error(&key, e, content))?;
                }
                "registries" => config.registries = Self::parse_field(&key, value, content)?,
                _ => {
                    if !value.is_mapping() {
                        let line = find_key_line(content, &key).unwrap_or(0);
                        return Err(ParseError::new(
                            format!("job '{}' must be a mapping of job settings", key),
                            line,
                            1,
                        )
                        .with_source_context(content, 1));
                    }
                    let template = Self::parse_job(&key, value, content)?;
                    if !key.starts_with('.') {
                        config.jobs.push(key.clone());
                    }
                    config.templates.insert(key, template);
                }
            }
        }

        // Legacy top-level image/before_script behave like entries of `default:`
        if global_image.is_some() || global_before_script.is_some() {
            let default = config.default.get_or_insert_with(JobTemplate::default);
            if default.image.is_none() {
                default.image = global_image;
            }
            if default.before_script.is_none() {
                default.before_script = global_before_script;
            }
        }

        if config.stages.is_empty() {
            config.stages = DEFAULT_STAGES.iter().map(|s| s.to_string()).collect();
        }

        Ok(config)
    }

    /// Parse pipeline from file
    pub fn parse_file<P: AsRef<Path>>(path: P) -> ParseResult<PipelineConfig> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ParseError::new(
                format!("failed to read '{}': {}", path.display(), e),
                0,
                0,
            )
            .with_kind(ParseErrorKind::IoError)
        })?;

        Self::parse(&content)
    }

    /// A top-level `image` mapping with job keys is a job named `image`
    fn is_job_mapping(value: &Value) -> bool {
        value.as_mapping().is_some_and(|mapping| {
            mapping
                .keys()
                .any(|k| !matches!(k.as_str(), Some("name") | Some("entrypoint")))
        })
    }

    /// Global image as a plain string or `{name, entrypoint}`
    fn parse_global_image(key: &str, value: Value, source: &str) -> ParseResult<String> {
        match value {
            Value::Mapping(mut mapping) => match mapping.remove("name") {
                Some(name) => Self::parse_field(key, name, source),
                None => {
                    let line = find_key_line(source, key).unwrap_or(0);
                    Err(ParseError::new("'image': missing 'name'", line, 1)
                        .with_kind(ParseErrorKind::InvalidValue)
                        .with_source_context(source, 2))
                }
            },
            other => Self::parse_field(key, other, source),
        }
    }

    fn parse_job(name: &str, value: Value, source: &str) -> ParseResult<JobTemplate> {
        serde_yaml::from_value(value).map_err(|e| ParseError::from_job_error(name, &e, source))
    }

    fn parse_field<T: serde::de::DeserializeOwned>(
        key: &str,
        value: Value,
        source: &str,
    ) -> ParseResult<T> {
        serde_yaml::from_value(value).map_err(|e| Self::field_error(key, e, source))
    }

    fn field_error(key: &str, err: serde_yaml::Error, source: &str) -> ParseError {
        let line = find_key_line(source, key).unwrap_or(0);
        ParseError::new(format!("'{}': {}", key, err), line, 1)
            .with_kind(ParseErrorKind::InvalidValue)
            .with_source_context(source, 2)
    }
}
