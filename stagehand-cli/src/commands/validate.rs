use crate::commands::PipelineArgs;
use crate::output;

use clap::Args;
use color_eyre::Result;

use stagehand_engine::{Planner, StageGraph, TemplateResolver};

/// Validate a pipeline YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    output::status("Validating", &format!("{}", args.pipeline.pipeline.display()));

    // Step 1: Parse YAML syntax
    let loaded = match args.pipeline.load() {
        Ok(loaded) => loaded,
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
    };
    output::check("YAML syntax valid");

    // Step 2: Stages
    if let Err(e) = StageGraph::new(&loaded.config.stages) {
        output::error(&e.to_string());
        std::process::exit(1);
    }
    output::check(&format!("Stages: {}", loaded.config.stages.join(" -> ")));

    // Step 3: Templates
    let jobs = match TemplateResolver::new(&loaded.config).resolve_all() {
        Ok(jobs) => jobs,
        Err(e) => {
            output::error(&format!("Template error: {}", e));
            std::process::exit(1);
        }
    };
    output::check(&format!(
        "Templates resolved: {} jobs, {} hidden templates",
        jobs.len(),
        loaded.config.templates.keys().filter(|name| name.starts_with('.')).count()
    ));

    // Step 4: Rules, matrices, dependencies and compose sections for this trigger
    match Planner::new(&loaded.config, &loaded.engine).plan(&loaded.trigger) {
        Ok(plan) => output::check(&format!(
            "Plan for {}: {} job instances in {} stages",
            plan.trigger.git_ref,
            plan.jobs().count(),
            plan.batches.len()
        )),
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
    }

    println!();
    output::success("Pipeline is valid");
    Ok(())
}
