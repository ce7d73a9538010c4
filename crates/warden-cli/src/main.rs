mod config;
mod context;
mod inbox_cmds;
mod plan_cmds;
mod serve_cmd;
mod stub_executor;
mod task_cmds;
mod worker_cmds;

use std::sync::Arc;

use clap::{Parser, Subcommand};

use config::{ConfigFile, HttpSection, QueueSection, RepoSection, WardenConfig};
use context::AppContext;
use inbox_cmds::InboxCommands;
use plan_cmds::PlanCommands;
use task_cmds::TaskCommands;
use worker_cmds::WorkerCommands;

#[derive(Parser)]
#[command(name = "warden", about = "Orchestrator for fleets of coding-agent worker sessions")]
struct Cli {
    /// Path to the git repository workers are dispatched against (overrides
    /// WARDEN_REPO_PATH and the config file).
    #[arg(long, global = true)]
    repo: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a warden config file
    Init {
        /// Repository path to record as the default
        #[arg(long)]
        repo_path: Option<String>,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Plan management
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Task management
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Worker session management
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },
    /// Pending approval inbox
    Inbox {
        #[command(subcommand)]
        command: InboxCommands,
    },
    /// Run the HTTP/SSE server
    Serve {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
}

fn cmd_init(repo_path: Option<&str>, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = ConfigFile {
        repo: RepoSection {
            path: repo_path.map(str::to_string),
            worktree_base: None,
        },
        queue: QueueSection::default(),
        http: HttpSection::default(),
    };
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    if let Some(repo_path) = repo_path {
        println!("  repo.path = {repo_path}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Init { repo_path, force } = &cli.command {
        cmd_init(repo_path.as_deref(), *force)?;
        return Ok(());
    }

    let config = WardenConfig::resolve(cli.repo.as_deref())?;
    let ctx = AppContext::build(&config).await?;

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),
        Commands::Plan { command } => plan_cmds::run(command, &ctx.orchestrator).await?,
        Commands::Task { command } => task_cmds::run(command, &ctx.orchestrator).await?,
        Commands::Worker { command } => worker_cmds::run(command, &ctx.orchestrator).await?,
        Commands::Inbox { command } => inbox_cmds::run(command, &ctx.orchestrator).await?,
        Commands::Serve { bind, port } => {
            let bind = bind.unwrap_or_else(|| config.bind_addr.clone());
            let port = port.unwrap_or(config.bind_port);
            serve_cmd::run_serve(Arc::new(ctx), &bind, port).await?;
        }
    }

    Ok(())
}
