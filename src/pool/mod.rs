//! Idle, already-authenticated backend sockets keyed by the identity they
//! logged in with.
//!
//! A socket is owned either by one connection or by one pool entry. While it
//! sits in the pool a watcher task waits for it to become readable: an idle
//! server only ever speaks to announce it is closing (e.g. `wait_timeout`),
//! so any data or EOF evicts the entry.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::metrics::metrics;
use crate::socket::Socket;

/// Pool lookup key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub username: String,
    pub default_db: String,
}

impl PoolKey {
    pub fn new(username: impl Into<String>, default_db: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            default_db: default_db.into(),
        }
    }

    fn of(socket: &Socket) -> Self {
        Self::new(
            socket.identity.username.clone(),
            socket.identity.default_db.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    /// Idle sockets needed before new clients are served from the pool
    pub min_idle: usize,
    /// Idle sockets kept at most; extra check-ins are closed
    pub max_idle: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            min_idle: 1,
            max_idle: 2,
        }
    }
}

struct PoolEntry {
    id: u64,
    socket: Socket,
    /// Cancels the idle watcher when the entry leaves the pool
    _watch: Option<DropGuard>,
}

#[derive(Default)]
struct PoolInner {
    idle: HashMap<PoolKey, VecDeque<PoolEntry>>,
    total: usize,
    next_id: u64,
}

impl PoolInner {
    fn contains(&self, key: &PoolKey, id: u64) -> bool {
        self.idle
            .get(key)
            .is_some_and(|queue| queue.iter().any(|e| e.id == id))
    }

    fn pop(&mut self, key: &PoolKey) -> Option<PoolEntry> {
        let queue = self.idle.get_mut(key)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            self.idle.remove(key);
        }
        if entry.is_some() {
            self.total -= 1;
        }
        entry
    }

    fn remove(&mut self, key: &PoolKey, id: u64) -> Option<PoolEntry> {
        let queue = self.idle.get_mut(key)?;
        let pos = queue.iter().position(|e| e.id == id)?;
        let entry = queue.remove(pos);
        if queue.is_empty() {
            self.idle.remove(key);
        }
        if entry.is_some() {
            self.total -= 1;
        }
        entry
    }
}

/// Shared handle to one backend's pool
#[derive(Clone)]
pub struct ConnectionPool {
    name: Arc<str>,
    limits: PoolLimits,
    inner: Arc<Mutex<PoolInner>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.name)
            .field("limits", &self.limits)
            .field("idle", &self.idle_count())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(name: impl Into<Arc<str>>, limits: PoolLimits) -> Self {
        Self {
            name: name.into(),
            limits,
            inner: Arc::new(Mutex::new(PoolInner::default())),
        }
    }

    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock().total
    }

    /// Whether enough idle sockets exist to serve a new client from the pool
    pub fn can_serve(&self) -> bool {
        self.idle_count() >= self.limits.min_idle.max(1)
    }

    /// Take an idle socket logged in as exactly `username` on `default_db`
    pub fn checkout(&self, username: &str, default_db: &str) -> Option<Socket> {
        let key = PoolKey::new(username, default_db);
        let entry = self.inner.lock().pop(&key);
        self.record_checkout(entry.is_some());
        entry.map(|e| {
            debug!(pool = %self.name, user = %key.username, db = %key.default_db, "Checked out pooled connection");
            e.socket
        })
    }

    /// Take any idle socket; used before the client's credentials are known
    pub fn checkout_any(&self) -> Option<Socket> {
        let entry = {
            let mut inner = self.inner.lock();
            let key = inner.idle.keys().next().cloned();
            key.and_then(|k| inner.pop(&k))
        };
        self.record_checkout(entry.is_some());
        entry.map(|e| e.socket)
    }

    /// Park a socket for reuse.
    ///
    /// Returns `false` and drops the socket when the pool is full.
    pub fn checkin(&self, mut socket: Socket) -> bool {
        let key = PoolKey::of(&socket);
        socket.discard_buffers();

        let mut inner = self.inner.lock();
        if inner.total >= self.limits.max_idle {
            drop(inner);
            debug!(pool = %self.name, max_idle = self.limits.max_idle, "Pool full, closing connection");
            metrics()
                .pool_discards
                .with_label_values(&[&*self.name, "full"])
                .inc();
            return false;
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let watch = self.spawn_idle_watcher(&socket, key.clone(), id);

        inner.idle.entry(key.clone()).or_default().push_back(PoolEntry {
            id,
            socket,
            _watch: watch,
        });
        inner.total += 1;
        let total = inner.total;
        drop(inner);

        metrics()
            .pool_idle
            .with_label_values(&[&*self.name])
            .set(total as i64);
        debug!(pool = %self.name, user = %key.username, db = %key.default_db, idle = total, "Returned connection to pool");
        true
    }

    /// Drop an idle entry, e.g. after its server closed it
    fn evict(&self, key: &PoolKey, id: u64, reason: &str) {
        let entry = self.inner.lock().remove(key, id);
        if entry.is_some() {
            self.record_discard(key, reason);
        }
    }

    /// Check a readiness event on an idle entry's stream.
    ///
    /// Readiness can be left over from the last read before checkin, so only
    /// a read that does not block counts. The read happens under the pool
    /// lock while the entry is still idle, so it never consumes bytes from a
    /// socket a connection has checked out. Returns whether to keep watching.
    fn confirm_readable(&self, key: &PoolKey, id: u64, stream: &TcpStream) -> bool {
        let mut inner = self.inner.lock();
        if !inner.contains(key, id) {
            return false;
        }
        let reason = match stream.try_read(&mut [0u8; 1]) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
            Ok(0) => "server_closed",
            Ok(_) => "unexpected_data",
            Err(_) => "io_error",
        };
        let entry = inner.remove(key, id);
        drop(inner);

        drop(entry);
        self.record_discard(key, reason);
        false
    }

    fn record_discard(&self, key: &PoolKey, reason: &str) {
        debug!(pool = %self.name, user = %key.username, reason, "Discarded idle connection");
        metrics()
            .pool_discards
            .with_label_values(&[&*self.name, reason])
            .inc();
        metrics()
            .pool_idle
            .with_label_values(&[&*self.name])
            .set(self.idle_count() as i64);
    }

    fn spawn_idle_watcher(&self, socket: &Socket, key: PoolKey, id: u64) -> Option<DropGuard> {
        let stream = socket.stream()?.clone();
        let runtime = tokio::runtime::Handle::try_current().ok()?;

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let weak = WeakPool {
            name: self.name.clone(),
            limits: self.limits,
            inner: Arc::downgrade(&self.inner),
        };

        runtime.spawn(async move {
            loop {
                let ready = tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => return,
                    ready = stream.readable() => ready,
                };
                let Some(pool) = weak.upgrade() else {
                    return;
                };
                if ready.is_err() {
                    pool.evict(&key, id, "io_error");
                    return;
                }
                if !pool.confirm_readable(&key, id, &stream) {
                    return;
                }
            }
        });

        Some(token.drop_guard())
    }

    fn record_checkout(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        metrics()
            .pool_checkouts
            .with_label_values(&[&*self.name, result])
            .inc();
        if hit {
            metrics()
                .pool_idle
                .with_label_values(&[&*self.name])
                .set(self.idle_count() as i64);
        }
    }
}

/// Handle held by idle watchers so they never keep a pool alive
struct WeakPool {
    name: Arc<str>,
    limits: PoolLimits,
    inner: Weak<Mutex<PoolInner>>,
}

impl WeakPool {
    fn upgrade(&self) -> Option<ConnectionPool> {
        Some(ConnectionPool {
            name: self.name.clone(),
            limits: self.limits,
            inner: self.inner.upgrade()?,
        })
    }
}
