use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::{now_ms, Engine};

const REAP_INTERVAL: Duration = Duration::from_secs(5);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Release every hold whose expiry has passed. Returns how many were released.
pub async fn reap_once(engine: &Engine, now: i64) -> usize {
    let mut released = 0;
    for (hold_id, room_type_id) in engine.collect_expired_holds(now) {
        match engine.release_hold(hold_id).await {
            Ok(_) => {
                released += 1;
                info!("reaped expired hold {hold_id} on room type {room_type_id}");
            }
            // Released by a client between collection and release.
            Err(e) => tracing::debug!("reaper skip {hold_id}: {e}"),
        }
    }
    if released > 0 {
        metrics::counter!(crate::observability::HOLDS_EXPIRED_TOTAL).increment(released as u64);
    }
    released
}

/// Background task that periodically cleans up expired holds.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    loop {
        interval.tick().await;
        reap_once(&engine, now_ms()).await;
    }
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}
