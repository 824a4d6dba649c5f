use serde::Deserialize;

use crate::health::DEFAULT_DOWN_COOLDOWN;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

// ============================================================================
// Server
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Worker threads driving client connections
    #[serde(default = "default_event_threads")]
    pub event_threads: usize,
    /// Backend connect timeout (milliseconds)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Address of the Prometheus endpoint; disabled when unset
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    4040
}

fn default_event_threads() -> usize {
    1
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            event_threads: default_event_threads(),
            connect_timeout_ms: default_connect_timeout_ms(),
            metrics_addr: None,
        }
    }
}

impl ServerConfig {
    pub fn listen(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }
}

// ============================================================================
// Backends
// ============================================================================

/// Backend addresses as `host[:port]`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendsConfig {
    /// Read-write backends, used by the default selector
    #[serde(default)]
    pub rw: Vec<String>,
    /// Read-only backends, reachable only through hooks
    #[serde(default)]
    pub ro: Vec<String>,
}

// ============================================================================
// Pool
// ============================================================================

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PoolConfig {
    /// Idle connections a backend needs before clients are served from its pool
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,
    /// Idle connections kept per backend
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
}

fn default_min_idle() -> usize {
    1
}

fn default_max_idle() -> usize {
    2
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: default_min_idle(),
            max_idle: default_max_idle(),
        }
    }
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HealthConfig {
    /// How long a DOWN backend is skipped (milliseconds)
    #[serde(default = "default_down_cooldown_ms")]
    pub down_cooldown_ms: u64,
    /// Interval of the health tick (milliseconds)
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

fn default_down_cooldown_ms() -> u64 {
    DEFAULT_DOWN_COOLDOWN.as_millis() as u64
}

fn default_check_interval_ms() -> u64 {
    1000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            down_cooldown_ms: default_down_cooldown_ms(),
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

// ============================================================================
// Protocol behaviour
// ============================================================================

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ProxyConfig {
    /// Swallow the duplicate ERR some 5.1 servers send for a failed
    /// COM_CHANGE_USER
    #[serde(default)]
    pub fix_bug_25371: bool,
    /// Re-authenticate pooled connections with COM_CHANGE_USER instead of
    /// comparing cached credentials
    #[serde(default = "default_pool_change_user")]
    pub pool_change_user: bool,
}

fn default_pool_change_user() -> bool {
    true
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            fix_bug_25371: false,
            pool_change_user: default_pool_change_user(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0");
        assert_eq!(config.server.listen_port, 4040);
        assert_eq!(config.server.event_threads, 1);
        assert!(config.backends.rw.is_empty());
        assert_eq!(config.pool.min_idle, 1);
        assert_eq!(config.pool.max_idle, 2);
        assert_eq!(config.health.down_cooldown_ms, 10_000);
        assert!(!config.proxy.fix_bug_25371);
        assert!(config.proxy.pool_change_user);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[server]
listen_addr = "127.0.0.1"
listen_port = 3307
event_threads = 4
connect_timeout_ms = 250
metrics_addr = "127.0.0.1:9100"

[backends]
rw = ["10.0.0.1:3306", "10.0.0.2"]
ro = ["10.0.0.3:3307"]

[pool]
min_idle = 2
max_idle = 8

[health]
down_cooldown_ms = 4000
check_interval_ms = 500

[proxy]
fix_bug_25371 = true
pool_change_user = false
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen(), "127.0.0.1:3307");
        assert_eq!(config.server.event_threads, 4);
        assert_eq!(config.server.connect_timeout_ms, 250);
        assert_eq!(config.server.metrics_addr.as_deref(), Some("127.0.0.1:9100"));
        assert_eq!(config.backends.rw, vec!["10.0.0.1:3306", "10.0.0.2"]);
        assert_eq!(config.backends.ro, vec!["10.0.0.3:3307"]);
        assert_eq!(config.pool.min_idle, 2);
        assert_eq!(config.pool.max_idle, 8);
        assert_eq!(config.health.down_cooldown_ms, 4000);
        assert_eq!(config.health.check_interval_ms, 500);
        assert!(config.proxy.fix_bug_25371);
        assert!(!config.proxy.pool_change_user);
    }

    #[test]
    fn test_partial_sections_use_defaults() {
        let toml = r#"
[server]
listen_port = 5000

[pool]
max_idle = 16
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0");
        assert_eq!(config.server.listen_port, 5000);
        assert_eq!(config.server.connect_timeout_ms, 5000);
        assert_eq!(config.pool.min_idle, 1);
        assert_eq!(config.pool.max_idle, 16);
    }

    #[test]
    fn test_default_matches_empty_file() {
        let parsed: Config = toml::from_str("").unwrap();
        let default = Config::default();
        assert_eq!(parsed.server.listen(), default.server.listen());
        assert_eq!(parsed.health.check_interval_ms, default.health.check_interval_ms);
        assert_eq!(parsed.proxy.pool_change_user, default.proxy.pool_change_user);
    }
}
