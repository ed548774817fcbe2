use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use exportdesk_agent::AgentEventBus;

/// Periodically fails claims that outlived the claim timeout. Each reaped task publishes
/// `task.failed`, which the workflow engine turns into a failed workflow.
pub fn spawn(
    bus: Arc<AgentEventBus>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            event_name = "system.reaper.start",
            correlation_id = "bootstrap",
            interval_secs = interval.as_secs(),
            "stale task reaper started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => { sweep(&bus).await; }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(event_name = "system.reaper.stopped", correlation_id = "shutdown", "stale task reaper stopped");
    })
}

async fn sweep(bus: &AgentEventBus) -> usize {
    match bus.reap_stale_tasks(Utc::now()).await {
        Ok(reaped) if reaped.is_empty() => {
            debug!(event_name = "system.reaper.idle", "no stale claims");
            0
        }
        Ok(reaped) => {
            info!(event_name = "system.reaper.swept", reaped = reaped.len(), "stale claims failed");
            reaped.len()
        }
        Err(error) => {
            error!(event_name = "system.reaper.error", error = %error, "stale task sweep failed");
            0
        }
    }
}
