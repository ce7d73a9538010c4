//! `warden worker` subcommands: inspect and drive live worker sessions.

use anyhow::{Context, Result};
use clap::Subcommand;
use uuid::Uuid;

use warden_core::orchestrator::OrchestratorService;

#[derive(Subcommand)]
pub enum WorkerCommands {
    /// List every live worker.
    List,
    /// Show a worker's status and conversation log.
    Show { worker_id: String },
    /// Send a clarification message to a worker.
    Message { worker_id: String, text: String },
    /// Approve or deny a worker's pending tool-call approval.
    Approve {
        worker_id: String,
        approval_id: String,
        #[arg(long)]
        deny: bool,
        #[arg(long)]
        clarification: Option<String>,
    },
    /// Mark a worker's task complete and release its worktree.
    Complete { worker_id: String },
    /// Interrupt a worker's current turn.
    Interrupt { worker_id: String },
}

pub async fn run(command: WorkerCommands, orchestrator: &OrchestratorService) -> Result<()> {
    match command {
        WorkerCommands::List => cmd_list(orchestrator).await,
        WorkerCommands::Show { worker_id } => cmd_show(orchestrator, parse_id(&worker_id)?).await,
        WorkerCommands::Message { worker_id, text } => {
            orchestrator.send_message(parse_id(&worker_id)?, text).await?;
            println!("Message sent to worker {worker_id}.");
            Ok(())
        }
        WorkerCommands::Approve {
            worker_id,
            approval_id,
            deny,
            clarification,
        } => {
            orchestrator
                .approve(
                    parse_id(&worker_id)?,
                    parse_id(&approval_id)?,
                    !deny,
                    clarification,
                )
                .await?;
            println!(
                "Approval {approval_id} {}.",
                if deny { "denied" } else { "granted" }
            );
            Ok(())
        }
        WorkerCommands::Complete { worker_id } => {
            orchestrator.complete(parse_id(&worker_id)?).await?;
            println!("Worker {worker_id} completed.");
            Ok(())
        }
        WorkerCommands::Interrupt { worker_id } => {
            orchestrator.interrupt(parse_id(&worker_id)?).await?;
            println!("Worker {worker_id} interrupted.");
            Ok(())
        }
    }
}

fn parse_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("invalid id: {s}"))
}

async fn cmd_list(orchestrator: &OrchestratorService) -> Result<()> {
    let workers = orchestrator.list_workers().await;
    if workers.is_empty() {
        println!("No live workers.");
        return Ok(());
    }
    println!("{:<36}  {:<36}  {:<12}  {:<10}", "WORKER", "TASK", "AGENT", "STATUS");
    for w in &workers {
        println!(
            "{:<36}  {:<36}  {:<12}  {:<10}",
            w.worker_id, w.task_id, w.agent_id, w.status
        );
    }
    Ok(())
}

async fn cmd_show(orchestrator: &OrchestratorService, worker_id: Uuid) -> Result<()> {
    let summary = orchestrator
        .get_worker_summary(worker_id)
        .await
        .with_context(|| format!("no worker with id {worker_id}"))?;

    println!("Worker {}", summary.worker_id);
    println!("  Task:          {}", summary.task_id);
    println!("  Agent:         {}", summary.agent_id);
    println!("  Status:        {}", summary.status);
    println!(
        "  Last activity: {}",
        summary.last_activity_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    let log = orchestrator.worker_log(worker_id).await?;
    if log.is_empty() {
        return Ok(());
    }
    println!();
    println!("Log:");
    for entry in &log {
        println!(
            "  [{}] {:?}: {}",
            entry.timestamp.format("%H:%M:%S"),
            entry.role,
            entry.content
        );
    }
    Ok(())
}
