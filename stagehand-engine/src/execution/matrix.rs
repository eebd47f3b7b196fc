// Matrix Expansion
// Expands `parallel:` into concrete job instances

use crate::error::ConfigError;
use crate::parser::models::{scalar_to_string, ParallelSpec};

use std::collections::BTreeMap;

/// Upper bound on instances a single job may expand to
pub const MAX_INSTANCES: usize = 200;

/// A single matrix instance (one combination of matrix values)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixInstance {
    /// Instance name, e.g. `image: [amd64]` or `test 2/3`
    pub name: String,
    /// Variable values for this instance
    pub variables: BTreeMap<String, String>,
}

/// Matrix expander for `parallel:`
pub struct MatrixExpander;

impl MatrixExpander {
    /// Expand a job's `parallel:` setting
    ///
    /// The instance count is checked before any combination is built.
    pub fn expand(job: &str, parallel: &ParallelSpec) -> Result<Vec<MatrixInstance>, ConfigError> {
        match parallel {
            ParallelSpec::Count(count) => {
                Self::check_limit(job, usize::try_from(*count).ok())?;
                Self::expand_parallel(job, *count)
            }
            ParallelSpec::Matrix { matrix } => Self::expand_matrix(job, matrix),
        }
    }

    /// `None` means the count overflowed
    fn check_limit(job: &str, count: Option<usize>) -> Result<(), ConfigError> {
        match count {
            Some(count) if count <= MAX_INSTANCES => Ok(()),
            Some(count) => Err(ConfigError::invalid_matrix(
                job,
                format!(
                    "expands to {} instances, at most {} are allowed",
                    count, MAX_INSTANCES
                ),
            )),
            None => Err(ConfigError::invalid_matrix(
                job,
                format!("expands to more than {} instances", MAX_INSTANCES),
            )),
        }
    }

    /// Each matrix entry contributes the cartesian product of its values
    fn expand_matrix(
        job: &str,
        matrix: &[BTreeMap<String, serde_yaml::Value>],
    ) -> Result<Vec<MatrixInstance>, ConfigError> {
        if matrix.is_empty() {
            return Err(ConfigError::invalid_matrix(job, "matrix must not be empty"));
        }

        let mut axes: Vec<Vec<(&String, Vec<String>)>> = Vec::with_capacity(matrix.len());
        let mut total = Some(0usize);
        for entry in matrix {
            let mut entry_axes = Vec::with_capacity(entry.len());
            let mut entry_total = Some(1usize);
            for (key, value) in entry {
                let values = Self::yaml_to_values(value).ok_or_else(|| {
                    ConfigError::invalid_matrix(
                        job,
                        format!("values of '{}' must be scalars or a list of scalars", key),
                    )
                })?;
                if values.is_empty() {
                    return Err(ConfigError::invalid_matrix(
                        job,
                        format!("'{}' has no values", key),
                    ));
                }
                entry_total = entry_total.and_then(|n| n.checked_mul(values.len()));
                entry_axes.push((key, values));
            }
            total = total.zip(entry_total).and_then(|(a, b)| a.checked_add(b));
            axes.push(entry_axes);
        }
        Self::check_limit(job, total)?;

        let mut instances = Vec::new();
        for entry_axes in axes {
            let mut combinations: Vec<Vec<(String, String)>> = vec![Vec::new()];
            for (key, values) in entry_axes {
                combinations = combinations
                    .into_iter()
                    .flat_map(|prefix| {
                        values.iter().map(move |v| {
                            let mut next = prefix.clone();
                            next.push((key.clone(), v.clone()));
                            next
                        })
                    })
                    .collect();
            }

            for combination in combinations {
                let label: Vec<&str> = combination.iter().map(|(_, v)| v.as_str()).collect();
                instances.push(MatrixInstance {
                    name: format!("{}: [{}]", job, label.join(", ")),
                    variables: combination.into_iter().collect(),
                });
            }
        }
        Ok(instances)
    }

    /// `parallel: N` creates N identical instances
    fn expand_parallel(job: &str, count: u32) -> Result<Vec<MatrixInstance>, ConfigError> {
        if count < 2 {
            return Err(ConfigError::invalid_matrix(
                job,
                "parallel count must be at least 2",
            ));
        }
        Ok((1..=count)
            .map(|i| {
                let mut variables = BTreeMap::new();
                variables.insert("CI_NODE_INDEX".to_string(), i.to_string());
                variables.insert("CI_NODE_TOTAL".to_string(), count.to_string());
                MatrixInstance {
                    name: format!("{} {}/{}", job, i, count),
                    variables,
                }
            })
            .collect())
    }

    fn yaml_to_values(value: &serde_yaml::Value) -> Option<Vec<String>> {
        match value {
            serde_yaml::Value::Sequence(items) => items.iter().map(scalar_to_string).collect(),
            other => scalar_to_string(other).map(|v| vec![v]),
        }
    }
}
