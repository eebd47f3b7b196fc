use crate::output;

use std::path::{Component, Path, PathBuf};

use clap::{Args, Subcommand};
use color_eyre::eyre::bail;
use color_eyre::Result;

use stagehand_engine::{ArtifactHandle, ArtifactStore, EngineConfig, FsArtifactStore};

/// Inspect and manage stored job artifacts
#[derive(Subcommand, Debug)]
pub enum ArtifactsCommand {
    /// List stored artifact versions
    List(StoreArgs),
    /// Download an artifact's files
    Fetch(FetchArgs),
    /// Delete expired artifact versions
    Reap(StoreArgs),
}

#[derive(Args, Debug)]
pub struct StoreArgs {
    /// Project whose artifacts to use
    #[arg(long, env = "STAGEHAND_PROJECT")]
    pub project: Option<String>,
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Job instance name
    pub job: String,

    /// Git ref the artifact was produced for
    #[arg(long = "ref", value_name = "REF")]
    pub git_ref: String,

    /// Artifact version (default: latest unexpired)
    #[arg(long)]
    pub version: Option<u64>,

    /// Directory to write the files into
    #[arg(long = "out", short = 'o', value_name = "DIR", default_value = ".")]
    pub output: PathBuf,
}

pub async fn execute(command: ArtifactsCommand) -> Result<()> {
    match command {
        ArtifactsCommand::List(args) => list(args).await,
        ArtifactsCommand::Fetch(args) => fetch(args).await,
        ArtifactsCommand::Reap(args) => reap(args).await,
    }
}

fn open_store(args: &StoreArgs) -> Result<FsArtifactStore> {
    let mut engine = EngineConfig::from_env()?;
    if let Some(project) = &args.project {
        engine.project = project.clone();
    } else if std::env::var_os("STAGEHAND_PROJECT").is_none() {
        let cwd = std::env::current_dir()?;
        if let Some(name) = cwd.file_name().and_then(|n| n.to_str()) {
            engine.project = name.to_string();
        }
    }
    Ok(FsArtifactStore::new(&engine.artifact_dir, &engine.project))
}

async fn list(args: StoreArgs) -> Result<()> {
    let store = open_store(&args)?;
    let records = store.list().await?;
    if records.is_empty() {
        output::info("No artifacts stored");
        return Ok(());
    }

    let now = chrono::Utc::now();
    for record in &records {
        let line = format!(
            "{:<48} {:>4} files {:>10} bytes  expires {}",
            record.handle.to_string(),
            record.files.len(),
            record.size,
            record.expires_at.format("%Y-%m-%d %H:%M")
        );
        if record.is_expired(now) {
            output::dim(&format!("{} (expired)", line));
        } else {
            println!("{}", line);
        }
    }
    Ok(())
}

async fn fetch(args: FetchArgs) -> Result<()> {
    let store = open_store(&args.store)?;
    let handle = match args.version {
        Some(version) => ArtifactHandle {
            project: store.project().to_string(),
            job: args.job.clone(),
            git_ref: args.git_ref.clone(),
            version,
        },
        None => store.latest(&args.job, &args.git_ref).await?,
    };

    output::status("Fetching", &handle.to_string());
    let files = store.fetch(&handle).await?;
    for (relative, contents) in &files {
        let target = safe_join(&args.output, relative)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, contents).await?;
        output::dim(&format!("  {}", target.display()));
    }
    output::success(&format!("Wrote {} file(s) to {}", files.len(), args.output.display()));
    Ok(())
}

async fn reap(args: StoreArgs) -> Result<()> {
    let store = open_store(&args)?;
    let removed = store.reap_expired().await?;
    output::success(&format!("Removed {} expired artifact version(s)", removed));
    Ok(())
}

/// Join an artifact path under `root`, refusing anything that escapes it
fn safe_join(root: &Path, relative: &str) -> Result<PathBuf> {
    let path = Path::new(relative);
    if !path
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
    {
        bail!("Artifact path '{}' escapes the output directory", relative);
    }
    Ok(root.join(path))
}
