use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use mysql_proxy::config;
use mysql_proxy::hooks::pass_through;
use mysql_proxy::server::Server;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = config::load_or_default();

    info!(
        rw = ?config.backends.rw,
        ro = ?config.backends.ro,
        min_idle = config.pool.min_idle,
        max_idle = config.pool.max_idle,
        down_cooldown_ms = config.health.down_cooldown_ms,
        "Backends configured"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.event_threads.max(1))
        .enable_all()
        .build()?;

    runtime.block_on(Server::new(config, pass_through()).run())
}
