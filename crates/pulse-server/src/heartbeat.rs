//! Server-wide heartbeat sweep.
//!
//! Every interval each pooled connection gets a transport Ping and its alive
//! flag is checked-and-reset. A connection that stays silent for
//! `timeout / interval` consecutive sweeps (at least one) is closed and
//! removed from the pool — and with it from every room and subscription
//! index.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pulse_broker::ConnectionPool;

/// WebSocket close code for an unresponsive client.
const CLOSE_GOING_AWAY: u16 = 1001;

/// Consecutive missed sweeps before a connection is considered dead.
#[allow(clippy::cast_possible_truncation)]
fn max_missed(interval: Duration, timeout: Duration) -> u32 {
    (timeout.as_millis() / interval.as_millis().max(1)).max(1) as u32
}

/// Run the heartbeat sweep loop until cancelled.
pub async fn run_heartbeat_loop(
    pool: Arc<ConnectionPool>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    // Skip the immediate first tick
    let _ = ticker.tick().await;
    let max_missed = max_missed(interval, timeout);
    let mut missed: HashMap<String, u32> = HashMap::new();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                sweep(&pool, &mut missed, max_missed);
            }
        }
    }
    debug!("heartbeat loop stopped");
}

fn sweep(pool: &ConnectionPool, missed: &mut HashMap<String, u32>, max_missed: u32) {
    for conn in pool.all() {
        if conn.check_alive() {
            let _ = missed.remove(&conn.id);
        } else {
            let count = missed.entry(conn.id.clone()).or_insert(0);
            *count += 1;
            if *count >= max_missed {
                warn!(conn_id = %conn.id, "heartbeat timeout, removing connection");
                conn.close(CLOSE_GOING_AWAY, "heartbeat timeout");
                let _ = pool.remove(&conn.id);
                let _ = missed.remove(&conn.id);
                counter!("heartbeat_timeouts_total").increment(1);
                continue;
            }
        }
        let _ = conn.ping();
    }
    // Drop counters for connections that left the pool between sweeps.
    missed.retain(|id, _| pool.get(id).is_some());
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
