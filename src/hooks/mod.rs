//! Extension points called at every stage of a proxied connection.
//!
//! Each connection owns one boxed [`ProxyHooks`] created by the server's
//! [`HookFactory`]. A callback gets the connection mutably, so it can queue
//! replies with [`Connection::send_ok`] and friends, inject queries or swap
//! the backend, then tells the state machine what to do with a
//! [`HookDecision`].

use std::sync::Arc;
use std::thread;

use thiserror::Error;
use tracing::{error, warn};

use crate::metrics::metrics;
use crate::protocol::Packet;
use crate::session::{Connection, Injection};

/// What the state machine does after a hook returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookDecision {
    /// Default behaviour
    #[default]
    NoDecision,
    /// The hook queued a reply for the client; skip the backend
    SendResult,
    /// The hook queued injections; send the first one
    SendQuery,
    /// Same as `SendQuery`
    SendInjection,
    /// Drop the injection's result instead of forwarding it
    IgnoreResult,
    /// Fail the connection
    Error,
    /// Fail the connection; the client may retry
    ErrorRetry,
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("hook failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Session(#[from] crate::session::SessionError),
}

pub type HookResult = Result<HookDecision, HookError>;

/// Callbacks for one connection. Every method defaults to `NoDecision`.
pub trait ProxyHooks: Send {
    /// Connection accepted, before any backend is chosen
    fn init(&mut self, _conn: &mut Connection) -> HookResult {
        Ok(HookDecision::NoDecision)
    }

    /// `SendResult` answers the client with a queued handshake and never
    /// opens a backend connection
    fn connect_server(&mut self, _conn: &mut Connection) -> HookResult {
        Ok(HookDecision::NoDecision)
    }

    fn read_handshake(&mut self, _conn: &mut Connection) -> HookResult {
        Ok(HookDecision::NoDecision)
    }

    fn send_handshake(&mut self, _conn: &mut Connection) -> HookResult {
        Ok(HookDecision::NoDecision)
    }

    fn read_auth(&mut self, _conn: &mut Connection) -> HookResult {
        Ok(HookDecision::NoDecision)
    }

    fn send_auth(&mut self, _conn: &mut Connection) -> HookResult {
        Ok(HookDecision::NoDecision)
    }

    /// `SendResult` replaces the server's answer with what the hook queued
    fn read_auth_result(&mut self, _conn: &mut Connection, _packet: &Packet) -> HookResult {
        Ok(HookDecision::NoDecision)
    }

    fn send_auth_result(&mut self, _conn: &mut Connection) -> HookResult {
        Ok(HookDecision::NoDecision)
    }

    /// Called with each command packet from the client
    fn read_query(&mut self, _conn: &mut Connection, _packet: &Packet) -> HookResult {
        Ok(HookDecision::NoDecision)
    }

    /// Called when an injected query's response is complete
    fn read_query_result(&mut self, _conn: &mut Connection, _injection: &Injection) -> HookResult {
        Ok(HookDecision::NoDecision)
    }

    fn send_query_result(&mut self, _conn: &mut Connection) -> HookResult {
        Ok(HookDecision::NoDecision)
    }

    /// Connection is going away; return value is ignored
    fn cleanup(&mut self, _conn: &mut Connection) -> HookResult {
        Ok(HookDecision::NoDecision)
    }
}

/// Hooks that change nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl ProxyHooks for PassThrough {}

/// Creates the hooks for each accepted connection
pub trait HookFactory: Send + Sync {
    fn create(&self) -> Box<dyn ProxyHooks>;
}

impl<F> HookFactory for F
where
    F: Fn() -> Box<dyn ProxyHooks> + Send + Sync,
{
    fn create(&self) -> Box<dyn ProxyHooks> {
        self()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughFactory;

impl HookFactory for PassThroughFactory {
    fn create(&self) -> Box<dyn ProxyHooks> {
        Box::new(PassThrough)
    }
}

pub fn pass_through() -> Arc<dyn HookFactory> {
    Arc::new(PassThroughFactory)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    Init,
    ConnectServer,
    ReadHandshake,
    SendHandshake,
    ReadAuth,
    SendAuth,
    ReadAuthResult,
    SendAuthResult,
    ReadQuery,
    ReadQueryResult,
    SendQueryResult,
    Cleanup,
}

impl HookPoint {
    pub fn name(self) -> &'static str {
        match self {
            HookPoint::Init => "init",
            HookPoint::ConnectServer => "connect_server",
            HookPoint::ReadHandshake => "read_handshake",
            HookPoint::SendHandshake => "send_handshake",
            HookPoint::ReadAuth => "read_auth",
            HookPoint::SendAuth => "send_auth",
            HookPoint::ReadAuthResult => "read_auth_result",
            HookPoint::SendAuthResult => "send_auth_result",
            HookPoint::ReadQuery => "read_query",
            HookPoint::ReadQueryResult => "read_query_result",
            HookPoint::SendQueryResult => "send_query_result",
            HookPoint::Cleanup => "cleanup",
        }
    }
}

/// Holds a connection's hooks between calls.
///
/// The hooks are moved out while they run so they can borrow the connection
/// that owns them.
pub struct HookDispatcher {
    hooks: Option<Box<dyn ProxyHooks>>,
}

impl HookDispatcher {
    pub fn new(hooks: Box<dyn ProxyHooks>) -> Self {
        Self { hooks: Some(hooks) }
    }

    /// `None` while a callback is running
    pub fn take(&mut self) -> Option<Box<dyn ProxyHooks>> {
        self.hooks.take()
    }

    pub fn restore(&mut self, hooks: Box<dyn ProxyHooks>) {
        self.hooks = Some(hooks);
    }

    /// Turn a callback's outcome into a decision.
    ///
    /// Failures and panics are logged and fall back to the default
    /// behaviour.
    pub fn resolve(point: HookPoint, conn_id: u32, outcome: thread::Result<HookResult>) -> HookDecision {
        match outcome {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                warn!(conn_id, hook = point.name(), error = %e, "Hook failed, using default behaviour");
                metrics().record_hook_failure(point.name());
                HookDecision::NoDecision
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(conn_id, hook = point.name(), panic = %message, "Hook panicked, using default behaviour");
                metrics().record_hook_failure(point.name());
                HookDecision::NoDecision
            }
        }
    }
}

impl std::fmt::Debug for HookDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookDispatcher")
            .field("installed", &self.hooks.is_some())
            .finish()
    }
}
