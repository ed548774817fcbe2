use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use exportdesk_core::errors::ApplicationError;

use crate::agents::AgentRegistry;
use crate::bus::AgentEventBus;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Claims lost to another worker.
    pub skipped: usize,
}

impl RunSummary {
    fn absorb(&mut self, other: RunSummary) {
        self.claimed += other.claimed;
        self.completed += other.completed;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

/// In-process worker: polls pending tasks for registered agents, claims, executes, reports.
pub struct AgentRuntime {
    bus: Arc<AgentEventBus>,
    registry: AgentRegistry,
    worker_id: String,
}

impl AgentRuntime {
    pub fn new(bus: Arc<AgentEventBus>, registry: AgentRegistry, worker_id: impl Into<String>) -> Self {
        Self { bus, registry, worker_id: worker_id.into() }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub async fn run_agent_once(&self, agent_name: &str) -> Result<RunSummary, ApplicationError> {
        let agent = self.registry.get(agent_name).ok_or_else(|| {
            ApplicationError::Integration(format!("no agent registered as `{agent_name}`"))
        })?;
        let claimant = format!("{agent_name}@{}", self.worker_id);
        let mut summary = RunSummary::default();

        for pending in self.bus.list_pending_tasks(Some(agent_name)).await? {
            let Some(task) = self.bus.claim_task(&pending.id, &claimant).await? else {
                summary.skipped += 1;
                continue;
            };
            summary.claimed += 1;

            match agent.execute(&task).await {
                Ok(result) => {
                    self.bus.complete_task(&task.id, result).await?;
                    summary.completed += 1;
                }
                Err(error) => {
                    warn!(
                        event_name = "runtime.agent_failed",
                        task_id = %task.id,
                        agent = agent_name,
                        error = %error,
                        "agent execution failed"
                    );
                    self.bus.fail_task(&task.id, format!("{error:#}")).await?;
                    summary.failed += 1;
                }
            }
        }

        if summary.claimed > 0 {
            info!(
                event_name = "runtime.round_finished",
                agent = agent_name,
                claimed = summary.claimed,
                completed = summary.completed,
                failed = summary.failed,
                "agent round finished"
            );
        }
        Ok(summary)
    }

    pub async fn run_once(&self) -> Result<RunSummary, ApplicationError> {
        let mut summary = RunSummary::default();
        for name in self.registry.names() {
            summary.absorb(self.run_agent_once(name).await?);
        }
        Ok(summary)
    }

    /// Repeats rounds until one claims nothing or `max_rounds` is reached.
    pub async fn run_until_idle(&self, max_rounds: usize) -> Result<RunSummary, ApplicationError> {
        let mut summary = RunSummary::default();
        for round in 0..max_rounds {
            let pass = self.run_once().await?;
            summary.absorb(pass);
            if pass.claimed == 0 {
                debug!(event_name = "runtime.idle", round, "no pending tasks");
                break;
            }
            // Completions advance workflows through bus subscribers; let them run.
            tokio::task::yield_now().await;
        }
        Ok(summary)
    }
}
