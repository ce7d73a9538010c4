//! Wires the subsystems a command needs: the clock, git runner, worktree
//! manager, completion engine, message queue/router, and orchestrator
//! service, all resolved from one [`crate::config::WardenConfig`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use warden_core::clock::{Clock, SystemClock};
use warden_core::completion::CompletionEngine;
use warden_core::git::SystemGitRunner;
use warden_core::orchestrator::{OrchestratorConfig, OrchestratorService};
use warden_core::queue::{MessageQueue, QueueConfig};
use warden_core::router::{MessageRouter, RouterConfig};
use warden_core::worktree::WorktreeManager;

use crate::config::WardenConfig;

pub struct AppContext {
    pub config: WardenConfig,
    pub clock: Arc<dyn Clock>,
    pub queue: Arc<MessageQueue>,
    pub router: Arc<MessageRouter>,
    pub orchestrator: Arc<OrchestratorService>,
}

impl AppContext {
    pub async fn build(config: &WardenConfig) -> Result<Self> {
        if let Some(parent) = config.plan_store_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state directory {}", parent.display()))?;
        }

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let git_runner = Arc::new(SystemGitRunner);

        let worktrees = Arc::new(
            WorktreeManager::load(
                config.repo_path.clone(),
                config.worktree_base.clone(),
                config.worktree_registry_path.clone(),
                git_runner.clone(),
            )
            .await
            .context("failed to load worktree registry")?,
        );
        let completion = Arc::new(CompletionEngine::new(git_runner));

        let queue_config = QueueConfig {
            max_queue_size: 10_000,
            persistence_path: Some(config.queue_state_path.clone()),
            cleanup_interval: Duration::from_secs(60),
        };
        let queue = MessageQueue::new(clock.clone(), queue_config);
        let router = MessageRouter::new(Arc::clone(&queue), clock.clone(), RouterConfig::default());

        let orchestrator = Arc::new(
            OrchestratorService::load(
                clock.clone(),
                Arc::clone(&router),
                worktrees,
                completion,
                config.plan_store_path.clone(),
                OrchestratorConfig::default(),
            )
            .await
            .context("failed to load orchestrator state")?,
        );

        Ok(Self {
            config: config.clone(),
            clock,
            queue,
            router,
            orchestrator,
        })
    }
}
