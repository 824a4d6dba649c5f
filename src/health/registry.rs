//! Backend registry.
//!
//! Built once at startup from configuration and shared by every connection.
//! Health changes and client counters are serialized per backend.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::metrics::metrics;
use crate::pool::ConnectionPool;
use crate::socket::NetworkAddress;

use super::state::{BackendState, BackendStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendRole {
    /// Read-write, used by the default selector
    Rw,
    /// Read-only, only reachable through hooks
    Ro,
}

impl fmt::Display for BackendRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendRole::Rw => f.write_str("rw"),
            BackendRole::Ro => f.write_str("ro"),
        }
    }
}

#[derive(Debug)]
pub struct Backend {
    pub addr: NetworkAddress,
    pub role: BackendRole,
    pub pool: ConnectionPool,
    status: Mutex<BackendStatus>,
    connected_clients: AtomicUsize,
}

impl Backend {
    pub fn new(addr: NetworkAddress, role: BackendRole, pool: ConnectionPool) -> Self {
        Self {
            addr,
            role,
            pool,
            status: Mutex::new(BackendStatus::new(Instant::now())),
            connected_clients: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> BackendState {
        self.status.lock().state
    }

    pub fn status(&self) -> BackendStatus {
        *self.status.lock()
    }

    pub fn connected_clients(&self) -> usize {
        self.connected_clients.load(Ordering::Acquire)
    }

    fn set_state(&self, state: BackendState, now: Instant) -> bool {
        let changed = self.status.lock().set(state, now);
        if changed {
            metrics()
                .backend_state
                .with_label_values(&[self.addr.name()])
                .set(state.as_metric());
        }
        changed
    }
}

/// Keeps a backend's `connected_clients` counter raised while alive
#[derive(Debug)]
pub struct BackendLease {
    backend: Arc<Backend>,
    index: usize,
}

impl BackendLease {
    fn new(backend: Arc<Backend>, index: usize) -> Self {
        let clients = backend.connected_clients.fetch_add(1, Ordering::AcqRel) + 1;
        metrics()
            .backend_clients
            .with_label_values(&[backend.addr.name()])
            .set(clients as i64);
        Self { backend, index }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        let clients = self.backend.connected_clients.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics()
            .backend_clients
            .with_label_values(&[self.backend.addr.name()])
            .set(clients as i64);
    }
}

/// Point-in-time view of one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSnapshot {
    pub index: usize,
    pub addr: String,
    pub role: BackendRole,
    pub state: BackendState,
    pub connected_clients: usize,
    pub idle_connections: usize,
}

#[derive(Debug)]
pub struct BackendRegistry {
    backends: Vec<Arc<Backend>>,
    down_cooldown: Duration,
}

impl BackendRegistry {
    pub fn new(backends: Vec<Backend>, down_cooldown: Duration) -> Self {
        Self {
            backends: backends.into_iter().map(Arc::new).collect(),
            down_cooldown,
        }
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Backend>> {
        self.backends.get(index)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn down_cooldown(&self) -> Duration {
        self.down_cooldown
    }

    /// Count a new client against a backend
    pub fn lease(&self, index: usize) -> Option<BackendLease> {
        let backend = self.backends.get(index)?;
        Some(BackendLease::new(Arc::clone(backend), index))
    }

    pub fn mark_down(&self, index: usize, now: Instant) {
        if let Some(backend) = self.backends.get(index) {
            if backend.set_state(BackendState::Down, now) {
                warn!(backend = %backend.addr, "Backend marked down");
            }
        }
    }

    pub fn mark_up(&self, index: usize, now: Instant) {
        if let Some(backend) = self.backends.get(index) {
            if backend.set_state(BackendState::Up, now) {
                info!(backend = %backend.addr, "Backend is up");
            }
        }
    }

    /// Give DOWN backends whose cooldown has elapsed another chance.
    ///
    /// Returns the number of backends reset to UNKNOWN.
    pub fn wake_down_backends(&self, now: Instant) -> usize {
        let mut woken = 0;
        for backend in &self.backends {
            let changed = backend.status.lock().wake_if_cooled(now, self.down_cooldown);
            if changed {
                woken += 1;
                metrics()
                    .backend_state
                    .with_label_values(&[backend.addr.name()])
                    .set(BackendState::Unknown.as_metric());
                info!(
                    backend = %backend.addr,
                    cooldown_ms = self.down_cooldown.as_millis() as u64,
                    "Backend cooldown elapsed, retrying"
                );
            }
        }
        woken
    }

    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        self.backends
            .iter()
            .enumerate()
            .map(|(index, b)| BackendSnapshot {
                index,
                addr: b.addr.to_string(),
                role: b.role,
                state: b.state(),
                connected_clients: b.connected_clients(),
                idle_connections: b.pool.idle_count(),
            })
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::registry;
    use super::*;

    #[test]
    fn test_lease_counts_clients() {
        let registry = registry(&[BackendRole::Rw, BackendRole::Rw]);
        let a = registry.lease(0).unwrap();
        let b = registry.lease(0).unwrap();
        assert_eq!(registry.get(0).unwrap().connected_clients(), 2);
        assert_eq!(registry.get(1).unwrap().connected_clients(), 0);

        drop(a);
        assert_eq!(registry.get(0).unwrap().connected_clients(), 1);
        drop(b);
        assert_eq!(registry.get(0).unwrap().connected_clients(), 0);
        assert!(registry.lease(5).is_none());
    }

    #[test]
    fn test_mark_down_and_up() {
        let registry = registry(&[BackendRole::Rw]);
        let now = Instant::now();
        assert_eq!(registry.get(0).unwrap().state(), BackendState::Unknown);

        registry.mark_down(0, now);
        assert_eq!(registry.get(0).unwrap().state(), BackendState::Down);
        registry.mark_up(0, now);
        assert_eq!(registry.get(0).unwrap().state(), BackendState::Up);
    }

    #[test]
    fn test_wake_respects_cooldown() {
        let registry = registry(&[BackendRole::Rw, BackendRole::Rw]);
        let t0 = Instant::now();
        registry.mark_down(0, t0);
        registry.mark_up(1, t0);

        assert_eq!(registry.wake_down_backends(t0 + Duration::from_secs(9)), 0);
        assert_eq!(registry.get(0).unwrap().state(), BackendState::Down);

        assert_eq!(registry.wake_down_backends(t0 + Duration::from_secs(10)), 1);
        assert_eq!(registry.get(0).unwrap().state(), BackendState::Unknown);
        assert_eq!(registry.get(1).unwrap().state(), BackendState::Up);
    }

    #[test]
    fn test_snapshot() {
        let registry = registry(&[BackendRole::Rw, BackendRole::Ro]);
        let _lease = registry.lease(1);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].role, BackendRole::Ro);
        assert_eq!(snapshot[1].connected_clients, 1);
        assert_eq!(snapshot[0].addr, "127.0.0.1:13306");
    }
}
