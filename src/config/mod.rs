mod schema;

pub use schema::*;

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::health::{Backend, BackendRegistry, BackendRole};
use crate::pool::{ConnectionPool, PoolLimits};
use crate::socket::{AddressError, NetworkAddress};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "MYSQL_PROXY_CONFIG";

const CONFIG_PATHS: [&str; 2] = ["config/mysql-proxy.toml", "mysql-proxy.toml"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid backend address: {0}")]
    InvalidAddress(#[from] AddressError),
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    Ok(config)
}

/// Load from `$MYSQL_PROXY_CONFIG` or the default paths, else defaults
pub fn load_or_default() -> Config {
    let from_env = std::env::var(CONFIG_ENV).ok();
    let paths = from_env
        .iter()
        .map(String::as_str)
        .chain(CONFIG_PATHS.iter().copied());

    for path in paths {
        if !Path::new(path).exists() {
            continue;
        }
        match load_config(path) {
            Ok(config) => {
                info!(path = path, "Loaded configuration");
                return config;
            }
            Err(e) => {
                warn!(path = path, error = %e, "Failed to load config");
            }
        }
    }

    info!("Using default configuration");
    Config::default()
}

impl Config {
    /// Resolve backend addresses and build the registry, RW backends first
    pub fn build_registry(&self) -> Result<BackendRegistry, ConfigError> {
        let limits = PoolLimits {
            min_idle: self.pool.min_idle,
            max_idle: self.pool.max_idle,
        };

        let rw = self.backends.rw.iter().map(|a| (a, BackendRole::Rw));
        let ro = self.backends.ro.iter().map(|a| (a, BackendRole::Ro));

        let mut backends = Vec::with_capacity(self.backends.rw.len() + self.backends.ro.len());
        for (name, role) in rw.chain(ro) {
            let addr = NetworkAddress::resolve(name)?;
            let pool = ConnectionPool::new(addr.name().to_string(), limits);
            info!(backend = %addr, role = %role, "Added backend");
            backends.push(Backend::new(addr, role, pool));
        }

        Ok(BackendRegistry::new(
            backends,
            Duration::from_millis(self.health.down_cooldown_ms),
        ))
    }
}
