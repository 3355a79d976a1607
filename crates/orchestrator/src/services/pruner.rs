//! Startup reconciliation and periodic retention pruning for the durable
//! command log and host status history (§4.5, §4.3 Uptime summary
//! retention).

use crate::state::AppState;
use tracing::{info, instrument, warn};

/// Runs once at boot, before the router accepts connections: every command
/// left `queued`/`sent` by a prior process becomes `timed_out` (§4.5
/// Startup reconciliation).
#[instrument(skip(state))]
pub async fn reconcile_on_startup(state: &AppState) {
    match state.commands.reconcile_on_startup().await {
        Ok(ids) if !ids.is_empty() => info!(count = ids.len(), "reconciled stale commands from a prior process"),
        Ok(_) => {}
        Err(err) => warn!(%err, "startup reconciliation failed"),
    }
}

/// Spawns the periodic pruning daemon: one `interval` tick per
/// `pruning_interval`, sweeping both the command log and host status
/// history past their retention windows.
pub fn spawn(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.pruning_interval);
        loop {
            interval.tick().await;
            prune_tick(&state).await;
        }
    });
}

#[instrument(skip(state))]
async fn prune_tick(state: &AppState) {
    match state.commands.prune_older_than(state.config.command_retention_days).await {
        Ok(deleted) if deleted > 0 => info!(deleted, "pruned terminal commands past retention"),
        Ok(_) => {}
        Err(err) => warn!(%err, "command pruning failed"),
    }

    match state.hosts.prune_history(state.config.host_status_history_retention_days).await {
        Ok(deleted) if deleted > 0 => info!(deleted, "pruned host status history past retention"),
        Ok(_) => {}
        Err(err) => warn!(%err, "host status history pruning failed"),
    }
}
