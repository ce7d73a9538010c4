//! `warden task` subcommands: create, list, deploy, and cancel tasks within
//! a plan.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use uuid::Uuid;

use warden_core::orchestrator::{DeployOptions, OrchestratorService};
use warden_store::models::Priority;

use crate::stub_executor::{NullToolInvoker, NullTurnExecutor};

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Create a task within an existing plan.
    Create {
        plan_id: String,
        description: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "normal")]
        priority: String,
        #[arg(long = "depends-on", value_delimiter = ',')]
        depends_on: Vec<String>,
        #[arg(long = "target-file", value_delimiter = ',')]
        target_files: Vec<String>,
        #[arg(long)]
        base_branch: Option<String>,
    },
    /// List every task belonging to a plan.
    List { plan_id: String },
    /// Deploy a task: create its worktree and start a worker session.
    Deploy {
        task_id: String,
        #[arg(long, default_value = "agent")]
        agent_id: String,
        #[arg(long)]
        model_id: Option<String>,
    },
    /// Cancel a task, tearing down its worker if one is live.
    Cancel { task_id: String },
}

pub async fn run(command: TaskCommands, orchestrator: &OrchestratorService) -> Result<()> {
    match command {
        TaskCommands::Create {
            plan_id,
            description,
            name,
            priority,
            depends_on,
            target_files,
            base_branch,
        } => {
            cmd_create(
                orchestrator,
                parse_id(&plan_id)?,
                name,
                description,
                &priority,
                depends_on,
                target_files,
                base_branch,
            )
            .await
        }
        TaskCommands::List { plan_id } => cmd_list(orchestrator, parse_id(&plan_id)?).await,
        TaskCommands::Deploy {
            task_id,
            agent_id,
            model_id,
        } => cmd_deploy(orchestrator, parse_id(&task_id)?, agent_id, model_id).await,
        TaskCommands::Cancel { task_id } => {
            orchestrator.cancel_task(parse_id(&task_id)?).await?;
            println!("Task {task_id} cancelled.");
            Ok(())
        }
    }
}

fn parse_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("invalid id: {s}"))
}

#[allow(clippy::too_many_arguments)]
async fn cmd_create(
    orchestrator: &OrchestratorService,
    plan_id: Uuid,
    name: Option<String>,
    description: String,
    priority: &str,
    depends_on: Vec<String>,
    target_files: Vec<String>,
    base_branch: Option<String>,
) -> Result<()> {
    let priority = Priority::from_str(priority)
        .with_context(|| format!("invalid priority: {priority:?}"))?;
    let dependencies = depends_on
        .iter()
        .map(|s| parse_id(s))
        .collect::<Result<Vec<_>>>()?;

    let task = orchestrator
        .create_task(
            plan_id,
            name,
            description,
            priority,
            dependencies,
            target_files,
            base_branch,
        )
        .await?;

    println!("Task created.");
    println!("  ID:       {}", task.id);
    println!(
        "  Name:     {}",
        task.name.as_deref().unwrap_or("<unnamed>")
    );
    println!("  Priority: {}", task.priority);
    println!("  Status:   {}", task.status);
    Ok(())
}

async fn cmd_list(orchestrator: &OrchestratorService, plan_id: Uuid) -> Result<()> {
    let tasks = orchestrator.list_tasks(plan_id).await;
    if tasks.is_empty() {
        println!("No tasks for plan {plan_id}.");
        return Ok(());
    }
    let name_w = tasks
        .iter()
        .map(|t| t.name.as_deref().unwrap_or("").len())
        .max()
        .unwrap_or(4)
        .max(4);
    println!(
        "{:<36}  {:<name_w$}  {:<9}  {:<8}",
        "ID", "NAME", "STATUS", "PRIORITY"
    );
    for task in &tasks {
        println!(
            "{:<36}  {:<name_w$}  {:<9}  {:<8}",
            task.id,
            task.name.as_deref().unwrap_or("<unnamed>"),
            task.status,
            task.priority,
        );
    }
    Ok(())
}

async fn cmd_deploy(
    orchestrator: &OrchestratorService,
    task_id: Uuid,
    agent_id: String,
    model_id: Option<String>,
) -> Result<()> {
    let worker_id = orchestrator
        .deploy(
            task_id,
            DeployOptions {
                agent_id,
                agent_instructions: Vec::new(),
                model_id,
                turn_executor: Arc::new(NullTurnExecutor),
                tool_invoker: Arc::new(NullToolInvoker),
            },
        )
        .await?;
    println!("Worker {worker_id} deployed for task {task_id}.");
    Ok(())
}
