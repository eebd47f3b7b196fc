// Job variable scope
// Layers variables by precedence and expands `$VAR` / `${VAR}` references

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static VARIABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid variable regex")
});

/// Expand variable references in `input`
///
/// Undefined variables expand to an empty string and `$$` to a literal `$`.
pub fn expand_variables(input: &str, variables: &BTreeMap<String, String>) -> String {
    if !input.contains('$') {
        return input.to_string();
    }
    VARIABLE_RE
        .replace_all(input, |caps: &Captures<'_>| {
            match caps.get(1).or_else(|| caps.get(2)) {
                Some(name) => variables.get(name.as_str()).cloned().unwrap_or_default(),
                None => "$".to_string(),
            }
        })
        .into_owned()
}

/// Variables visible to one job, built lowest precedence first
///
/// Each layer's values are expanded against the layers below it, so
/// `IMAGE: $REGISTRY/app` resolves with the global `REGISTRY`.
#[derive(Debug, Clone, Default)]
pub struct VariableScope {
    variables: BTreeMap<String, String>,
}

impl VariableScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a layer that overrides everything added before it
    pub fn layer(mut self, layer: &BTreeMap<String, String>) -> Self {
        let expanded: Vec<(String, String)> = layer
            .iter()
            .map(|(name, value)| (name.clone(), expand_variables(value, &self.variables)))
            .collect();
        self.variables.extend(expanded);
        self
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn expand(&self, input: &str) -> String {
        expand_variables(input, &self.variables)
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.variables
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.variables
    }
}
