//! Prometheus metrics for the MySQL proxy
//!
//! Exposes metrics via HTTP endpoint for Prometheus scraping.

use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub struct Metrics {
    pub registry: Registry,

    // Connection metrics
    /// Total client connections accepted
    pub connections_accepted: IntCounter,
    /// Current active client connections
    pub connections_active: IntGauge,
    /// Total client connections closed
    pub connections_closed: IntCounter,

    // Command metrics
    /// Client commands by protocol name
    pub commands_total: IntCounterVec,
    /// Queries sent on behalf of hooks
    pub injected_queries: IntCounter,
    /// Connections aborted on malformed or unexpected traffic
    pub protocol_errors: IntCounterVec,
    /// Hook callbacks that failed or panicked
    pub hook_failures: IntCounterVec,

    // Backend metrics
    /// 0 unknown, 1 up, -1 down
    pub backend_state: IntGaugeVec,
    /// Clients currently assigned to a backend
    pub backend_clients: IntGaugeVec,
    /// Failed backend connects
    pub backend_connect_failures: IntCounterVec,

    // Pool metrics
    /// Idle pooled connections
    pub pool_idle: IntGaugeVec,
    /// Pool checkouts by result (hit/miss)
    pub pool_checkouts: IntCounterVec,
    /// Pooled connections closed instead of reused
    pub pool_discards: IntCounterVec,
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("valid metric definition")
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).expect("valid metric definition")
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    IntGaugeVec::new(Opts::new(name, help), labels).expect("valid metric definition")
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_accepted = counter(
            "mysql_proxy_connections_accepted_total",
            "Total number of client connections accepted",
        );
        let connections_active = IntGauge::new(
            "mysql_proxy_connections_active",
            "Current number of active client connections",
        )
        .expect("valid metric definition");
        let connections_closed = counter(
            "mysql_proxy_connections_closed_total",
            "Total number of client connections closed",
        );

        let commands_total = counter_vec(
            "mysql_proxy_commands_total",
            "Total number of client commands by type",
            &["command"],
        );
        let injected_queries = counter(
            "mysql_proxy_injected_queries_total",
            "Total number of queries injected by hooks",
        );
        let protocol_errors = counter_vec(
            "mysql_proxy_protocol_errors_total",
            "Total number of connections aborted on protocol errors",
            &["kind"],
        );
        let hook_failures = counter_vec(
            "mysql_proxy_hook_failures_total",
            "Total number of failed hook callbacks",
            &["hook"],
        );

        let backend_state = gauge_vec(
            "mysql_proxy_backend_state",
            "Backend health (0 unknown, 1 up, -1 down)",
            &["backend"],
        );
        let backend_clients = gauge_vec(
            "mysql_proxy_backend_clients",
            "Clients currently assigned to a backend",
            &["backend"],
        );
        let backend_connect_failures = counter_vec(
            "mysql_proxy_backend_connect_failures_total",
            "Total number of failed backend connects",
            &["backend"],
        );

        let pool_idle = gauge_vec(
            "mysql_proxy_pool_idle",
            "Idle pooled backend connections",
            &["backend"],
        );
        let pool_checkouts = counter_vec(
            "mysql_proxy_pool_checkouts_total",
            "Pool checkouts by result",
            &["backend", "result"],
        );
        let pool_discards = counter_vec(
            "mysql_proxy_pool_discards_total",
            "Pooled connections closed instead of reused",
            &["backend", "reason"],
        );

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(connections_accepted.clone()),
            Box::new(connections_active.clone()),
            Box::new(connections_closed.clone()),
            Box::new(commands_total.clone()),
            Box::new(injected_queries.clone()),
            Box::new(protocol_errors.clone()),
            Box::new(hook_failures.clone()),
            Box::new(backend_state.clone()),
            Box::new(backend_clients.clone()),
            Box::new(backend_connect_failures.clone()),
            Box::new(pool_idle.clone()),
            Box::new(pool_checkouts.clone()),
            Box::new(pool_discards.clone()),
        ];
        for collector in collectors {
            registry
                .register(collector)
                .expect("metric names are unique");
        }

        Self {
            registry,
            connections_accepted,
            connections_active,
            connections_closed,
            commands_total,
            injected_queries,
            protocol_errors,
            hook_failures,
            backend_state,
            backend_clients,
            backend_connect_failures,
            pool_idle,
            pool_checkouts,
            pool_discards,
        }
    }

    pub fn record_connection_accepted(&self) {
        self.connections_accepted.inc();
        self.connections_active.inc();
    }

    pub fn record_connection_closed(&self) {
        self.connections_active.dec();
        self.connections_closed.inc();
    }

    pub fn record_command(&self, command: &str) {
        self.commands_total.with_label_values(&[command]).inc();
    }

    pub fn record_protocol_error(&self, kind: &str) {
        self.protocol_errors.with_label_values(&[kind]).inc();
    }

    pub fn record_hook_failure(&self, hook: &str) {
        self.hook_failures.with_label_values(&[hook]).inc();
    }

    pub fn record_connect_failure(&self, backend: &str) {
        self.backend_connect_failures
            .with_label_values(&[backend])
            .inc();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
    }

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        match req.uri().path() {
            "/metrics" => {
                let mut response = respond(StatusCode::OK, metrics().gather());
                response.headers_mut().insert(
                    hyper::header::CONTENT_TYPE,
                    hyper::header::HeaderValue::from_static(
                        "text/plain; version=0.0.4; charset=utf-8",
                    ),
                );
                Ok(response)
            }
            "/health" => Ok(respond(StatusCode::OK, "OK")),
            _ => Ok(respond(StatusCode::NOT_FOUND, "Not Found")),
        }
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}
