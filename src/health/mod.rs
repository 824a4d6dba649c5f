//! Backend health tracking
//!
//! This module provides:
//! - The backend registry with per-backend health and client counters
//! - Cooldown-based re-probing of DOWN backends
//! - A periodic tick that wakes cooled-down backends and refreshes gauges

mod registry;
mod state;

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng as _;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::metrics;

pub use registry::{Backend, BackendLease, BackendRegistry, BackendRole, BackendSnapshot};
pub use state::{BackendState, BackendStatus, DEFAULT_DOWN_COOLDOWN};

#[cfg(test)]
pub(crate) use registry::test_support;

/// Spawn the periodic health tick for `registry`
pub fn spawn_health_task(
    registry: Arc<BackendRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let interval = interval.max(Duration::from_millis(1));

    tokio::spawn(async move {
        // Random initial delay so several proxies don't tick in lockstep
        let initial_delay = rand::thread_rng().gen_range(0..interval.as_millis().max(1) as u64);
        tokio::time::sleep(Duration::from_millis(initial_delay)).await;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Health task cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    tick(&registry, Instant::now());
                }
            }
        }
    })
}

fn tick(registry: &BackendRegistry, now: Instant) {
    registry.wake_down_backends(now);

    for snapshot in registry.snapshot() {
        let m = metrics();
        m.backend_state
            .with_label_values(&[&snapshot.addr])
            .set(snapshot.state.as_metric());
        m.backend_clients
            .with_label_values(&[&snapshot.addr])
            .set(snapshot.connected_clients as i64);
        m.pool_idle
            .with_label_values(&[&snapshot.addr])
            .set(snapshot.idle_connections as i64);
    }
}
