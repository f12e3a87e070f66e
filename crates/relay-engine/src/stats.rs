//! Periodic stats snapshots.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use relay_store::{BridgeStats, TransferStore};
use relay_types::format_units;

use crate::{Notifier, RelayEvent};

pub(crate) fn log_stats(stats: &BridgeStats, amount_decimals: usize) {
    info!(
        total_deposits = stats.total_deposits,
        total_withdrawals = stats.total_withdrawals,
        pending_deposits = stats.pending_deposits,
        pending_withdrawals = stats.pending_withdrawals,
        total_volume = %format_units(stats.total_volume, amount_decimals),
        "bridge statistics"
    );
}

/// Every `period`, read the store and emit a snapshot. The first snapshot
/// comes one full period after start.
pub(crate) fn spawn_stats_reporter(
    store: Arc<dyn TransferStore>,
    period: Duration,
    amount_decimals: usize,
    notifier: Notifier,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.stats().await {
                Ok(stats) => {
                    log_stats(&stats, amount_decimals);
                    notifier.emit(RelayEvent::Stats(stats));
                }
                Err(e) => warn!(error = %e, "failed to read bridge statistics"),
            }
        }
    })
}
