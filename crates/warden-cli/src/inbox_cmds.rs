//! `warden inbox` subcommands: a cross-worker view of pending tool-call
//! approvals.

use anyhow::{Context, Result};
use clap::Subcommand;
use uuid::Uuid;

use warden_core::orchestrator::OrchestratorService;

#[derive(Subcommand)]
pub enum InboxCommands {
    /// List pending approvals across every live worker.
    List,
    /// Approve or deny a pending approval.
    Process {
        worker_id: String,
        approval_id: String,
        #[arg(long)]
        deny: bool,
    },
}

pub async fn run(command: InboxCommands, orchestrator: &OrchestratorService) -> Result<()> {
    match command {
        InboxCommands::List => cmd_list(orchestrator).await,
        InboxCommands::Process {
            worker_id,
            approval_id,
            deny,
        } => {
            orchestrator
                .process_inbox(parse_id(&worker_id)?, parse_id(&approval_id)?, !deny)
                .await?;
            println!(
                "Approval {approval_id} {}.",
                if deny { "denied" } else { "granted" }
            );
            Ok(())
        }
    }
}

fn parse_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("invalid id: {s}"))
}

async fn cmd_list(orchestrator: &OrchestratorService) -> Result<()> {
    let inbox = orchestrator.list_inbox().await;
    if inbox.is_empty() {
        println!("Inbox empty.");
        return Ok(());
    }
    println!("{:<36}  {:<36}  {:<16}  DESCRIPTION", "WORKER", "APPROVAL", "TOOL");
    for (worker_id, approval) in &inbox {
        println!(
            "{:<36}  {:<36}  {:<16}  {}",
            worker_id, approval.id, approval.tool_name, approval.description
        );
    }
    Ok(())
}
