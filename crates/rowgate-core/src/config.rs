//! rowgate.toml configuration parser.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::User;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server_name: String,
    pub port: u16,
    /// Maximum number of concurrent sessions. Unlimited when absent.
    pub connection_limit: Option<usize>,
    /// Idle time after which a session is reaped.
    pub connection_timeout_ms: u64,
    /// Per client-type overrides of `connection_timeout_ms`.
    pub client_type_timeouts: HashMap<String, u64>,
    pub maintenance_interval_ms: u64,
    pub client_logging_enabled: bool,
    pub client_log_size: usize,
    /// Calls slower than this count as slow calls.
    pub warning_threshold_ms: u64,
    pub request_counter_interval_ms: u64,
    pub admin: Option<AdminConfig>,
    pub pools: Vec<PoolConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "rowgate".to_string(),
            port: 2223,
            connection_limit: None,
            connection_timeout_ms: 120_000,
            client_type_timeouts: HashMap::new(),
            maintenance_interval_ms: 30_000,
            client_logging_enabled: false,
            client_log_size: 40,
            warning_threshold_ms: 60,
            request_counter_interval_ms: 2_500,
            admin: None,
            pools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    pub username: String,
    pub password: String,
}

impl AdminConfig {
    pub fn user(&self) -> User {
        User::new(&self.username, &self.password)
    }
}

/// Connection pool for one database user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub username: String,
    pub password: String,
    pub minimum_size: usize,
    pub maximum_size: usize,
    /// Total time a checkout may wait for a free connection.
    pub checkout_timeout_ms: u64,
    /// Longest single wait between checkout retries.
    pub maximum_retry_wait_ms: u64,
    /// Idle connections older than this are closed by the cleanup task.
    pub idle_timeout_ms: u64,
    pub cleanup_interval_ms: u64,
    pub collect_fine_grained: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            minimum_size: 4,
            maximum_size: 8,
            checkout_timeout_ms: 2_000,
            maximum_retry_wait_ms: 50,
            idle_timeout_ms: 60_000,
            cleanup_interval_ms: 20_000,
            collect_fine_grained: false,
        }
    }
}

impl PoolConfig {
    pub fn user(&self) -> User {
        User::new(&self.username, &self.password)
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings the server or a pool could not honour.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.maintenance_interval_ms == 0 {
            anyhow::bail!("maintenance_interval_ms must be positive");
        }
        if self.request_counter_interval_ms == 0 {
            anyhow::bail!("request_counter_interval_ms must be positive");
        }
        for pool in &self.pools {
            if pool.username.is_empty() {
                anyhow::bail!("pool entry without a username");
            }
            if pool.maximum_size < 1 {
                anyhow::bail!("pool '{}': maximum_size must be at least 1", pool.username);
            }
            if pool.minimum_size > pool.maximum_size {
                anyhow::bail!(
                    "pool '{}': minimum_size {} exceeds maximum_size {}",
                    pool.username,
                    pool.minimum_size,
                    pool.maximum_size
                );
            }
            if pool.maximum_retry_wait_ms == 0 {
                anyhow::bail!("pool '{}': maximum_retry_wait_ms must be positive", pool.username);
            }
            if pool.cleanup_interval_ms == 0 {
                anyhow::bail!("pool '{}': cleanup_interval_ms must be positive", pool.username);
            }
        }
        let mut seen = std::collections::HashSet::new();
        for pool in &self.pools {
            if !seen.insert(pool.username.as_str()) {
                anyhow::bail!("duplicate pool for user '{}'", pool.username);
            }
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn warning_threshold(&self) -> Duration {
        Duration::from_millis(self.warning_threshold_ms)
    }

    pub fn request_counter_interval(&self) -> Duration {
        Duration::from_millis(self.request_counter_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.connection_timeout(), Duration::from_secs(120));
        assert_eq!(config.maintenance_interval(), Duration::from_secs(30));
        assert_eq!(config.client_log_size, 40);
        assert_eq!(config.warning_threshold_ms, 60);
        assert_eq!(config.request_counter_interval_ms, 2_500);
        assert!(config.pools.is_empty());
    }

    #[test]
    fn test_parse_minimal() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.server_name, "rowgate");
        assert!(config.admin.is_none());
    }

    #[test]
    fn test_parse_full() {
        let toml_str = r#"
server_name = "accounting"
port = 4000
connection_limit = 50
connection_timeout_ms = 60000
client_logging_enabled = true

[client_type_timeouts]
batch = 600000

[admin]
username = "admin"
password = "secret"

[[pools]]
username = "scott"
password = "tiger"
maximum_size = 2
minimum_size = 1
"#;
        let config: ServerConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.connection_limit, Some(50));
        assert_eq!(config.client_type_timeouts.get("batch"), Some(&600_000));
        assert_eq!(config.admin.unwrap().user(), User::new("admin", "secret"));

        let pool = &config.pools[0];
        assert_eq!(pool.user(), User::new("scott", "tiger"));
        assert_eq!(pool.maximum_size, 2);
        assert_eq!(pool.checkout_timeout_ms, 2_000);
        assert_eq!(pool.maximum_retry_wait_ms, 50);
    }

    #[test]
    fn test_validate_rejects_min_above_max() {
        let mut config = ServerConfig::default();
        config.pools.push(PoolConfig {
            username: "scott".into(),
            minimum_size: 5,
            maximum_size: 2,
            ..PoolConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let config = ServerConfig {
            maintenance_interval_ms: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            request_counter_interval_ms: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.pools.push(PoolConfig {
            username: "scott".into(),
            maximum_retry_wait_ms: 0,
            ..PoolConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_pools() {
        let mut config = ServerConfig::default();
        for _ in 0..2 {
            config.pools.push(PoolConfig {
                username: "scott".into(),
                ..PoolConfig::default()
            });
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_roundtrip_toml() {
        let mut config = ServerConfig::default();
        config.pools.push(PoolConfig {
            username: "scott".into(),
            password: "tiger".into(),
            ..PoolConfig::default()
        });
        let text = config.to_toml_string().unwrap();
        let parsed: ServerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.pools[0].password, "tiger");
        assert_eq!(parsed.port, config.port);
    }
}
