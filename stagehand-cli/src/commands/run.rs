use crate::commands::PipelineArgs;
use crate::output;

use std::sync::Arc;

use clap::Args;
use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;

use stagehand_engine::artifacts::spawn_reaper;
use stagehand_engine::config::parse_runtime;
use stagehand_engine::execution::{progress_channel, LogLevel};
use stagehand_engine::{
    CliManifestPublisher, ContainerRunner, ContainerRuntime, ExecutionEvent, FsArtifactStore,
    JobStatus, ManifestComposer, ManualGate, PipelineExecutor, PipelinePlan, PipelineReport,
    Planner, RunnerRegistry, StageStatus,
};

/// Run a pipeline locally
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Play a manual job when its stage is reached (can be repeated)
    #[arg(long, value_name = "JOB")]
    pub play: Vec<String>,

    /// Maximum concurrently running jobs, 0 for unlimited
    #[arg(long, short = 'j', value_name = "N")]
    pub max_parallel: Option<usize>,

    /// Run image jobs with this runtime: shell, docker or podman
    #[arg(long, value_name = "RUNTIME")]
    pub runtime: Option<String>,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let loaded = args.pipeline.load()?;
    let mut engine = loaded.engine;
    if let Some(max) = args.max_parallel {
        engine.max_parallel_jobs = max;
    }
    if let Some(runtime) = &args.runtime {
        engine.container_runtime = parse_runtime(runtime)?;
    }

    let plan = Planner::new(&loaded.config, &engine)
        .plan(&loaded.trigger)
        .map_err(|e| eyre!("Invalid pipeline: {}", e))?;

    output::info(&format!(
        "Pipeline for '{}' on {} ({}): {} stages, {} jobs",
        plan.project,
        plan.trigger.git_ref,
        plan.trigger.source,
        plan.batches.len(),
        plan.jobs().count()
    ));

    let mut runner = RunnerRegistry::new();
    if let Some(runtime) = engine.container_runtime {
        runner = runner.with_container_runner(ContainerRunner::checked(runtime)?);
    }

    let gate = ManualGate::new();
    for job in &args.play {
        if plan.job(job).is_none() && plan.instances_of(job).next().is_none() {
            bail!("--play {}: no such job in this pipeline", job);
        }
        gate.advance(job.as_str());
    }
    let composer = composer_for(&plan, engine.container_runtime);

    let store = Arc::new(FsArtifactStore::new(&engine.artifact_dir, &engine.project));
    let (tx, mut rx) = progress_channel();
    let mut executor = PipelineExecutor::new(plan, Arc::new(runner), store.clone())
        .with_config(engine.clone())
        .with_gate(gate)
        .with_progress(tx);
    if let Some(composer) = composer {
        executor = executor.with_composer(composer);
    }
    let cancel = executor.cancellation_token().clone();

    let reaper = spawn_reaper(store, engine.reaper_interval, cancel.child_token());
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                output::warning("Interrupted, cancelling running jobs");
                cancel.cancel();
            }
        })
    };

    let exec_handle = tokio::spawn(async move { executor.execute().await });

    while let Some(event) = rx.recv().await {
        print_event(&event);
    }

    let report = exec_handle.await?;
    interrupt.abort();
    cancel.cancel();
    let _ = reaper.await;

    print_summary(&report);
    if !report.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

/// Manifest composer for plans with compose jobs
fn composer_for(plan: &PipelinePlan, runtime: Option<ContainerRuntime>) -> Option<ManifestComposer> {
    if !plan.jobs().any(|job| job.compose.is_some()) {
        return None;
    }
    let Some(runtime) = runtime.or_else(ContainerRuntime::detect) else {
        output::warning("No container runtime found, compose jobs will fail");
        return None;
    };
    let publisher = Arc::new(CliManifestPublisher::new(runtime));
    Some(ManifestComposer::new(publisher).with_registries(plan.registries.clone()))
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::PipelineStarted {
            project,
            git_ref,
            total_stages,
        } => {
            println!();
            output::header(&format!(
                "Pipeline '{}' on {} ({} stages)",
                project, git_ref, total_stages
            ));
        }

        ExecutionEvent::PipelineCompleted {
            status, duration, ..
        } => {
            println!();
            output::status("Finished", &format!("{} in {:.2}s", status, duration.as_secs_f64()));
        }

        ExecutionEvent::StageStarted {
            stage_name,
            total_jobs,
        } => output::stage_header(stage_name, *total_jobs),

        ExecutionEvent::StageCompleted {
            stage_name,
            status,
            duration,
        } => {
            let line = format!(
                "  Stage '{}' {} ({:.2}s)",
                stage_name,
                status,
                duration.as_secs_f64()
            );
            match status {
                StageStatus::Skipped => output::dim(&line),
                StageStatus::Succeeded | StageStatus::SucceededWithIssues => output::result(&line, true),
                _ => output::result(&line, false),
            }
        }

        ExecutionEvent::JobStarted {
            job_name, image, ..
        } => match image {
            Some(image) => println!("    Job '{}' ({})", job_name, image),
            None => println!("    Job '{}'", job_name),
        },

        ExecutionEvent::JobOutput { line, is_error, .. } => output::job_output(line, *is_error),

        ExecutionEvent::JobCompleted {
            job_name,
            status,
            allow_failure,
            exit_code,
            duration,
            ..
        } => {
            let exit_info = match exit_code {
                Some(code) if *code != 0 => format!(" (exit code: {})", code),
                _ => String::new(),
            };
            let line = format!(
                "    Job '{}' {} ({:.2}s){}",
                job_name,
                status,
                duration.as_secs_f64(),
                exit_info
            );
            match status {
                JobStatus::Failed if *allow_failure => {
                    output::warning(&format!("{} [allowed]", line.trim()))
                }
                _ => output::result(&line, *status == JobStatus::Succeeded),
            }
        }

        ExecutionEvent::JobSkipped {
            job_name, reason, ..
        } => output::dim(&format!("    Job '{}' skipped: {}", job_name, reason)),

        ExecutionEvent::JobAwaitingManual { job_name, .. } => {
            output::info(&format!("Job '{}' is manual, play it with --play", job_name))
        }

        ExecutionEvent::ArtifactsPublished {
            job_name,
            handle,
            files,
        } => output::dim(&format!("    Job '{}' uploaded {} file(s) as {}", job_name, files, handle)),

        ExecutionEvent::ManifestPublished {
            reference,
            architectures,
            ..
        } => output::check(&format!(
            "Published manifest {} [{}]",
            reference,
            architectures.join(", ")
        )),

        ExecutionEvent::Log { level, message, .. } => match level {
            LogLevel::Error => output::error(message),
            LogLevel::Warning => output::warning(message),
            _ => output::dim(message),
        },
    }
}

fn print_summary(report: &PipelineReport) {
    for job in report.jobs() {
        if let Some(reason) = &job.failure {
            output::failure(&format!("{}: {}", job.name, reason));
        }
    }

    let pending: Vec<&str> = report.pending_manual().map(|job| job.name.as_str()).collect();
    if !pending.is_empty() {
        output::info(&format!("Manual jobs not played: {}", pending.join(", ")));
    }

    if report.succeeded() {
        output::success(&format!(
            "Pipeline succeeded in {:.2}s",
            report.duration.as_secs_f64()
        ));
    } else {
        output::failure(&format!(
            "Pipeline {} after {:.2}s",
            report.status,
            report.duration.as_secs_f64()
        ));
    }
}
