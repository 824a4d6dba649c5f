//! Transparent MySQL wire-protocol proxy.
//!
//! Clients connect to the proxy as if it were a MySQL server. Each
//! connection is walked through handshake, auth and command phases by a
//! [`session::Connection`], forwarded to a backend chosen by a
//! [`router::BackendSelector`], and optionally rewritten by
//! [`hooks::ProxyHooks`]. Authenticated backend sockets are pooled per
//! backend and reused by later clients.

pub mod config;
pub mod health;
pub mod hooks;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session;
pub mod socket;
