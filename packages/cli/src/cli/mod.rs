// ABOUTME: Argument definitions for the skiff CLI and construction of the sandbox manager
// ABOUTME: Picks the Docker or in-memory backend and the on-disk file store for a run

pub mod sandbox;
pub mod utils;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use skiff_config::constants::SKIFF_FILES_ROOT;
use skiff_sandbox::{
    ClusterBackend, DirectoryFileStore, DockerBackend, MemoryBackend, SandboxManager,
    SandboxSettings,
};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

#[derive(Parser)]
#[command(name = "skiff")]
#[command(about = "Skiff - per-project preview sandboxes")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Simulate the cluster in memory instead of talking to Docker
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Directory with one folder of source files per project
    #[arg(long, global = true)]
    pub files_root: Option<PathBuf>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the project's sandbox and push its files
    Start {
        /// Project ID
        project: String,
        /// Runtime: node, python, java, go, php or ruby
        #[arg(short, long, default_value = "node")]
        runtime: String,
        /// Return once resources exist, without waiting for readiness or pushing files
        #[arg(long)]
        detach: bool,
    },
    /// Delete the project's sandbox, keeping its endpoint
    Stop {
        /// Project ID
        project: String,
    },
    /// Recreate the project's sandbox with the same runtime
    Restart {
        /// Project ID
        project: String,
        /// Return once resources exist, without waiting for readiness or pushing files
        #[arg(long)]
        detach: bool,
    },
    /// Push changed files into the running sandbox
    Sync {
        /// Project ID
        project: String,
    },
    /// Restart the application inside the sandbox without recreating it
    RestartApp {
        /// Project ID
        project: String,
    },
    /// Show the sandbox status
    Status {
        /// Project ID
        project: String,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Print recent sandbox output
    Logs {
        /// Project ID
        project: String,
        /// Number of lines from the end
        #[arg(short = 'n', long, default_value = "100")]
        tail: usize,
    },
    /// Print the preview URL
    Url {
        /// Project ID
        project: String,
    },
    /// Remove every resource of a project, or of all managed projects
    Cleanup {
        /// Project ID
        project: Option<String>,
        /// Remove resources of every managed project
        #[arg(long, conflicts_with = "project")]
        all: bool,
    },
    /// Follow the sandbox status until interrupted
    Watch {
        /// Project ID
        project: String,
        /// Seconds between checks
        #[arg(long, default_value = "2")]
        interval: u64,
    },
    /// Print the startup script generated for a runtime
    Script {
        /// Runtime name
        #[arg(default_value = "node")]
        runtime: String,
    },
    /// List supported runtimes and their images
    Runtimes,
}

pub async fn run(cli: Cli) -> Result<()> {
    let settings = SandboxSettings::from_env().context("Invalid SKIFF_* configuration")?;

    match &cli.command {
        Commands::Script { runtime } => return sandbox::script_command(runtime, &settings),
        Commands::Runtimes => return sandbox::runtimes_command(),
        _ => {}
    }

    let manager = build_manager(cli.dry_run, cli.files_root, settings)?;
    if !manager.check_connection().await {
        bail!("Cannot reach the container backend. Is the Docker daemon running?");
    }

    match cli.command {
        Commands::Start {
            project,
            runtime,
            detach,
        } => sandbox::start_command(&manager, &project, &runtime, detach).await,
        Commands::Stop { project } => sandbox::stop_command(&manager, &project).await,
        Commands::Restart { project, detach } => {
            sandbox::restart_command(&manager, &project, detach).await
        }
        Commands::Sync { project } => sandbox::sync_command(&manager, &project).await,
        Commands::RestartApp { project } => {
            sandbox::restart_app_command(&manager, &project).await
        }
        Commands::Status { project, json } => {
            sandbox::status_command(&manager, &project, json).await
        }
        Commands::Logs { project, tail } => sandbox::logs_command(&manager, &project, tail).await,
        Commands::Url { project } => sandbox::url_command(&manager, &project),
        Commands::Cleanup { project, all } => {
            sandbox::cleanup_command(&manager, project.as_deref(), all).await
        }
        Commands::Watch { project, interval } => {
            sandbox::watch_command(&manager, &project, interval).await
        }
        Commands::Script { .. } | Commands::Runtimes => Ok(()),
    }
}

fn build_manager(
    dry_run: bool,
    files_root: Option<PathBuf>,
    settings: SandboxSettings,
) -> Result<SandboxManager> {
    let backend: Arc<dyn ClusterBackend> = if dry_run {
        debug!("Using in-memory backend");
        Arc::new(MemoryBackend::new())
    } else {
        Arc::new(DockerBackend::new(&settings).context("Failed to connect to Docker")?)
    };

    let root = files_root
        .or_else(|| env::var(SKIFF_FILES_ROOT).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));
    debug!("Reading project files from {}", root.display());

    Ok(SandboxManager::new(
        backend,
        Arc::new(DirectoryFileStore::new(root)),
        settings,
    ))
}
