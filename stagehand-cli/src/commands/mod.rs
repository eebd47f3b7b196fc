// CLI command implementations

pub mod artifacts;
pub mod plan;
pub mod run;
pub mod validate;

use crate::output;

use std::path::{Path, PathBuf};

use clap::Args;
use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;

use stagehand_engine::{
    EngineConfig, PipelineConfig, PipelineParser, PipelineTrigger, TriggerSource,
};

/// Pipeline file and trigger options shared by `run`, `plan` and `validate`
#[derive(Args, Debug)]
pub struct PipelineArgs {
    /// Path to the pipeline YAML file
    #[arg(default_value = ".gitlab-ci.yml")]
    pub pipeline: PathBuf,

    /// Git ref the pipeline runs for (default: the default branch)
    #[arg(long = "ref", value_name = "REF", env = "STAGEHAND_REF")]
    pub git_ref: Option<String>,

    /// What triggered the pipeline: push, merge_request, schedule or manual
    #[arg(long, value_name = "SOURCE", default_value = "push")]
    pub source: TriggerSource,

    /// Mark a path as changed, for `rules: changes:` (can be repeated)
    #[arg(long = "changed", value_name = "PATH")]
    pub changed: Vec<String>,

    /// Set a trigger variable (can be repeated, format: NAME=VALUE)
    #[arg(long = "var", short = 'v', value_name = "NAME=VALUE")]
    pub variables: Vec<String>,

    /// Project name (default: the pipeline file's directory name)
    #[arg(long, env = "STAGEHAND_PROJECT")]
    pub project: Option<String>,
}

/// Everything needed to plan a run
pub struct Loaded {
    pub config: PipelineConfig,
    pub engine: EngineConfig,
    pub trigger: PipelineTrigger,
}

impl PipelineArgs {
    pub fn load(&self) -> Result<Loaded> {
        if !self.pipeline.exists() {
            bail!("Pipeline file not found: {}", self.pipeline.display());
        }

        output::status("Parsing", &format!("{}", self.pipeline.display()));
        let config = match PipelineParser::parse_file(&self.pipeline) {
            Ok(config) => config,
            Err(e) => {
                eprint!("{}", e);
                bail!("{} could not be parsed", self.pipeline.display());
            }
        };

        let project_dir = project_dir(&self.pipeline)?;
        let mut engine = EngineConfig::from_env()?.with_project_dir(&project_dir);
        if let Some(project) = &self.project {
            engine.project = project.clone();
        } else if std::env::var_os("STAGEHAND_PROJECT").is_none() {
            if let Some(name) = project_dir.file_name().and_then(|n| n.to_str()) {
                engine.project = name.to_string();
            }
        }
        engine.validate()?;

        let git_ref = self
            .git_ref
            .clone()
            .unwrap_or_else(|| engine.default_branch.clone());
        let trigger = PipelineTrigger::new(git_ref, self.source)
            .with_changed_paths(self.changed.iter().cloned())
            .with_variables(parse_variables(&self.variables)?);

        Ok(Loaded {
            config,
            engine,
            trigger,
        })
    }
}

/// Directory holding the pipeline file, copied into every job workspace
fn project_dir(pipeline: &Path) -> Result<PathBuf> {
    let path = std::fs::canonicalize(pipeline)?;
    path.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| eyre!("{} has no parent directory", path.display()))
}

/// Parse `NAME=VALUE` pairs from `--var` flags
pub fn parse_variables(pairs: &[String]) -> Result<std::collections::BTreeMap<String, String>> {
    let mut variables = std::collections::BTreeMap::new();
    for pair in pairs {
        match pair.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                variables.insert(name.trim().to_string(), value.to_string());
            }
            _ => bail!("Invalid variable format '{}'. Expected NAME=VALUE", pair),
        }
    }
    Ok(variables)
}
