//! `warden plan` subcommands: thin wrappers over
//! [`warden_core::orchestrator::OrchestratorService`]'s plan API.
//!
//! - `warden plan create <file>`  -- load a plan.toml and materialize it
//! - `warden plan show [plan-id]` -- show plan details, or list all plans
//! - `warden plan start <plan-id>`
//! - `warden plan pause <plan-id>`
//! - `warden plan resume <plan-id>`

use anyhow::{Context, Result};
use clap::Subcommand;
use uuid::Uuid;

use warden_core::orchestrator::OrchestratorService;

#[derive(Subcommand)]
pub enum PlanCommands {
    /// Create a plan from a `plan.toml` file.
    Create { file: String },
    /// Show plan details, or list every plan if no id is given.
    Show { plan_id: Option<String> },
    /// Start a plan's tasks running.
    Start { plan_id: String },
    /// Pause a running plan.
    Pause { plan_id: String },
    /// Resume a paused plan.
    Resume { plan_id: String },
}

pub async fn run(command: PlanCommands, orchestrator: &OrchestratorService) -> Result<()> {
    match command {
        PlanCommands::Create { file } => cmd_create(orchestrator, &file).await,
        PlanCommands::Show { plan_id } => match plan_id {
            Some(id) => cmd_show_one(orchestrator, parse_id(&id)?).await,
            None => cmd_show_all(orchestrator).await,
        },
        PlanCommands::Start { plan_id } => {
            orchestrator.start_plan(parse_id(&plan_id)?).await?;
            println!("Plan {plan_id} started.");
            Ok(())
        }
        PlanCommands::Pause { plan_id } => {
            orchestrator.pause_plan(parse_id(&plan_id)?).await?;
            println!("Plan {plan_id} paused.");
            Ok(())
        }
        PlanCommands::Resume { plan_id } => {
            orchestrator.resume_plan(parse_id(&plan_id)?).await?;
            println!("Plan {plan_id} resumed.");
            Ok(())
        }
    }
}

fn parse_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("invalid id: {s}"))
}

async fn cmd_create(orchestrator: &OrchestratorService, file_path: &str) -> Result<()> {
    let content = std::fs::read_to_string(file_path)
        .with_context(|| format!("failed to read plan file: {file_path}"))?;
    let (plan, tasks) = orchestrator.load_plan_file(&content).await?;

    println!("Plan created successfully.");
    println!();
    println!("  Plan ID:     {}", plan.id);
    println!("  Name:        {}", plan.name);
    println!("  Status:      {}", plan.status);
    println!("  Base branch: {}", plan.base_branch);
    println!("  Tasks:       {}", tasks.len());
    for task in &tasks {
        println!(
            "    - {:<24} {}",
            task.name.as_deref().unwrap_or("<unnamed>"),
            task.id
        );
    }
    Ok(())
}

async fn cmd_show_all(orchestrator: &OrchestratorService) -> Result<()> {
    let plans = orchestrator.list_plans().await;
    if plans.is_empty() {
        println!("No plans found. Use `warden plan create <file>` to create one.");
        return Ok(());
    }

    let name_w = plans.iter().map(|p| p.name.len()).max().unwrap_or(4).max(4);
    println!(
        "{:<36}  {:<name_w$}  {:<9}  CREATED",
        "ID", "NAME", "STATUS"
    );
    for plan in &plans {
        println!(
            "{:<36}  {:<name_w$}  {:<9}  {}",
            plan.id,
            plan.name,
            plan.status,
            plan.created_at.format("%Y-%m-%d %H:%M"),
        );
    }
    Ok(())
}

async fn cmd_show_one(orchestrator: &OrchestratorService, plan_id: Uuid) -> Result<()> {
    let plan = orchestrator
        .get_plan(plan_id)
        .await
        .with_context(|| format!("no plan with id {plan_id}"))?;
    let tasks = orchestrator.list_tasks(plan_id).await;

    println!("Plan: {}", plan.name);
    println!("  ID:           {}", plan.id);
    println!("  Status:       {}", plan.status);
    println!("  Base branch:  {}", plan.base_branch);
    if let Some(budget) = plan.token_budget {
        println!("  Token budget: {budget}");
    }
    println!(
        "  Created:      {}",
        plan.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("  Tasks:        {}", tasks.len());

    if tasks.is_empty() {
        return Ok(());
    }

    println!();
    println!("Tasks:");
    println!();
    for task in &tasks {
        println!(
            "  [{}] {}",
            task.status,
            task.name.as_deref().unwrap_or("<unnamed>")
        );
        println!("    ID:       {}", task.id);
        println!("    Priority: {}", task.priority);
        if !task.dependencies.is_empty() {
            let names: Vec<String> = task.dependencies.iter().map(Uuid::to_string).collect();
            println!("    Depends:  {}", names.join(", "));
        }
        if !task.target_files.is_empty() {
            println!("    Targets:  {}", task.target_files.join(", "));
        }
        let desc = task.description.trim();
        if !desc.is_empty() {
            println!("    Description:");
            for line in desc.lines().take(10) {
                println!("      {line}");
            }
            if desc.lines().count() > 10 {
                println!("      ...(truncated)");
            }
        }
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_uuid() {
        let id = "550e8400-e29b-41d4-a716-446655440000";
        assert_eq!(parse_id(id).unwrap().to_string(), id);
    }

    #[test]
    fn parse_invalid_uuid() {
        assert!(parse_id("not-a-uuid").is_err());
    }
}
