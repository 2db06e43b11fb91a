use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Background task that periodically resolves lapsed pickup/return windows.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match engine.run_overdue_sweep().await {
            Some(report) if report.expired + report.missing > 0 => {
                info!(
                    candidates = report.candidates,
                    expired = report.expired,
                    missing = report.missing,
                    skipped = report.skipped,
                    "overdue sweep resolved leases"
                );
            }
            Some(report) => debug!(candidates = report.candidates, "overdue sweep found nothing to do"),
            None => {}
        }
    }
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = match engine.appends_since_compact().await {
            Ok(n) => n,
            Err(e) => {
                warn!("compactor stopped: {e}");
                return;
            }
        };
        if appends < threshold {
            continue;
        }
        match engine.compact().await {
            Ok(records) => info!(appends, records, "WAL compacted"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
