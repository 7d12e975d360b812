use std::sync::Arc;

use marcus_core::core::Core;
use tokio::task::JoinHandle;

/// Spawn the lease sweeper: every interval, return orphaned IN_PROGRESS
/// tasks to the queue.
pub fn spawn_sweeper(core: Arc<Core>) -> JoinHandle<()> {
    let period = core.config().sweeper_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match core.sweep_expired_leases().await {
                Ok(recovered) if !recovered.is_empty() => {
                    tracing::info!(count = recovered.len(), tasks = ?recovered, "sweep recovered orphans");
                }
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "lease sweep failed"),
            }
        }
    })
}

/// Spawn periodic reconciliation against the provider. Local state wins;
/// the board is repaired and divergence is logged.
pub fn spawn_reconciler(core: Arc<Core>) -> JoinHandle<()> {
    let period = core.config().reconciliation_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the immediate first tick; reconciling at startup races recovery.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match core.reconcile().await {
                Ok(report) if report.statuses_repaired > 0 || report.cards_created > 0 => {
                    tracing::warn!(
                        examined = report.cards_examined,
                        repaired = report.statuses_repaired,
                        created = report.cards_created,
                        "reconciliation repaired divergence"
                    );
                }
                Ok(report) => {
                    tracing::debug!(examined = report.cards_examined, "reconciliation clean");
                }
                Err(err) => tracing::error!(error = %err, "reconciliation failed"),
            }
        }
    })
}
