use crate::commands::PipelineArgs;
use crate::output;

use clap::Args;
use color_eyre::eyre::eyre;
use color_eyre::Result;

use stagehand_engine::parser::duration::format_duration;
use stagehand_engine::{ExecutionMode, Planner};

/// Show which jobs a trigger would run, stage by stage, without running them
#[derive(Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Also list each job's resolved variables
    #[arg(long)]
    pub variables: bool,
}

pub fn execute(args: PlanArgs) -> Result<()> {
    let loaded = args.pipeline.load()?;
    let plan = Planner::new(&loaded.config, &loaded.engine)
        .plan(&loaded.trigger)
        .map_err(|e| eyre!("Invalid pipeline: {}", e))?;

    output::header(&format!(
        "Pipeline for '{}' on {} ({})",
        plan.project, plan.trigger.git_ref, plan.trigger.source
    ));

    for batch in &plan.batches {
        output::stage_header(&batch.stage, batch.jobs.len());
        for job in &batch.jobs {
            let mut details = vec![job.mode.to_string()];
            if let Some(image) = &job.image {
                details.push(image.clone());
            }
            if job.allow_failure {
                details.push("allow_failure".to_string());
            }
            if job.mode != ExecutionMode::Skip {
                details.push(format!("timeout {}", format_duration(job.timeout)));
            }
            if let Some(compose) = &job.compose {
                details.push(format!(
                    "compose {} [{}]",
                    compose.repository,
                    compose.architectures.join(", ")
                ));
            }

            let line = format!("    {} ({})", job.name, details.join(", "));
            match job.mode {
                ExecutionMode::Skip => output::dim(&line),
                _ => println!("{}", line),
            }

            if args.variables && job.mode != ExecutionMode::Skip {
                for (name, value) in &job.variables {
                    output::dim(&format!("        {}={}", name, value));
                }
            }
        }
    }

    let runnable = plan.jobs().filter(|job| job.mode != ExecutionMode::Skip).count();
    println!();
    output::info(&format!(
        "{} of {} job instances would run",
        runnable,
        plan.jobs().count()
    ));
    Ok(())
}
