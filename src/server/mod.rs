//! Listener and per-connection task spawning

mod driver;

pub use driver::drive;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::health::spawn_health_task;
use crate::hooks::HookFactory;
use crate::metrics::{metrics, start_metrics_server};
use crate::router::{BackendSelector, ShortestQueueFirst};
use crate::session::{Connection, ProxyContext};
use crate::socket::Socket;

/// Global connection counter for generating unique connection IDs
static CONNECTION_COUNTER: AtomicU32 = AtomicU32::new(1);

pub struct Server {
    config: Config,
    hooks: Arc<dyn HookFactory>,
    selector: Arc<dyn BackendSelector>,
}

impl Server {
    pub fn new(config: Config, hooks: Arc<dyn HookFactory>) -> Self {
        Self {
            config,
            hooks,
            selector: Arc::new(ShortestQueueFirst),
        }
    }

    /// Replace the default shortest-queue-first selector
    pub fn with_selector(mut self, selector: Arc<dyn BackendSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Bind the configured address and serve until the process exits
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.server.listen();
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener, CancellationToken::new()).await
    }

    /// Serve connections from `listener` until `shutdown` is cancelled
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let registry = Arc::new(self.config.build_registry()?);
        if registry.is_empty() {
            warn!("No backends configured, every client will be refused");
        }

        let ctx = Arc::new(ProxyContext {
            registry: Arc::clone(&registry),
            selector: self.selector,
            settings: self.config.proxy,
            hooks: self.hooks,
        });
        let connect_timeout = Duration::from_millis(self.config.server.connect_timeout_ms);

        let health = spawn_health_task(
            Arc::clone(&registry),
            Duration::from_millis(self.config.health.check_interval_ms),
            shutdown.child_token(),
        );

        if let Some(metrics_addr) = self.config.server.metrics_addr.clone() {
            tokio::spawn(async move {
                if let Err(e) = start_metrics_server(&metrics_addr).await {
                    error!(addr = %metrics_addr, error = %e, "Metrics server failed");
                }
            });
        }

        info!(
            addr = %listener.local_addr()?,
            backends = registry.len(),
            pool_change_user = self.config.proxy.pool_change_user,
            "MySQL proxy listening"
        );

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(true) {
                warn!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
            }

            let conn_id = CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst);
            metrics().record_connection_accepted();
            debug!(conn_id, peer = %peer_addr, "New connection");

            let conn = Connection::new(conn_id, Socket::new(stream), Arc::clone(&ctx));
            tokio::spawn(async move {
                drive(conn, connect_timeout).await;
                metrics().record_connection_closed();
                debug!(conn_id, "Connection closed");
            });
        }

        health.abort();
        info!("MySQL proxy stopped");
        Ok(())
    }
}
