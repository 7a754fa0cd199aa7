use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Periodic trigger: runs the engine's sweep on a fixed interval. The sweep
/// is idempotent, so a missed or doubled tick is harmless.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let report = engine.run_sweep(Utc::now()).await;
        debug!(
            "sweep done: {} deadlines, {} reminders, {} reschedules",
            report.deadlines.len(),
            report.reminders_sent,
            report.reschedules_confirmed
        );
    }
}

/// Compact the WAL once it has grown by `threshold` appends.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
