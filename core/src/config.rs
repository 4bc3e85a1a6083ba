//! Broker configuration: the parsed form of every key enumerated in the
//! external interfaces section. Read once at startup from a TOML file and
//! overridable by environment variables (`BROKER_<SECTION>_<KEY>`,
//! mirroring the `structopt`-with-`env` pattern used for CLI binaries
//! elsewhere in the workspace); nothing in this crate re-reads it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

fn duration_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

fn serialize_duration_secs<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_secs())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub providers: HashMap<String, ProviderConfig>,
    pub inventory: InventoryConfig,
    pub lifecycle: LifecycleConfig,
    pub ssh: SshConfig,
    pub verification: VerificationConfig,
    pub destroy: DestroyConfig,
    pub benchmark: BenchmarkConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            providers: HashMap::new(),
            inventory: InventoryConfig::default(),
            lifecycle: LifecycleConfig::default(),
            ssh: SshConfig::default(),
            verification: VerificationConfig::default(),
            destroy: DestroyConfig::default(),
            benchmark: BenchmarkConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file at `path`. Missing optional
    /// sections fall back to the defaults documented alongside each field.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config = toml::from_str(contents)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: "broker.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub credentials: HashMap<String, String>,
    pub enabled: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            credentials: HashMap::new(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    #[serde(
        rename = "default_cache_ttl",
        serialize_with = "serialize_duration_secs",
        deserialize_with = "duration_secs"
    )]
    pub default_cache_ttl: Duration,
    #[serde(
        rename = "backoff_cache_ttl",
        serialize_with = "serialize_duration_secs",
        deserialize_with = "duration_secs"
    )]
    pub backoff_cache_ttl: Duration,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        InventoryConfig {
            default_cache_ttl: Duration::from_secs(30),
            backoff_cache_ttl: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    #[serde(
        serialize_with = "serialize_duration_secs",
        deserialize_with = "duration_secs"
    )]
    pub check_interval: Duration,
    pub hard_max_hours: f64,
    #[serde(
        serialize_with = "serialize_duration_secs",
        deserialize_with = "duration_secs"
    )]
    pub orphan_grace_period: Duration,
    #[serde(
        serialize_with = "serialize_duration_secs",
        deserialize_with = "duration_secs"
    )]
    pub reconciliation_interval: Duration,
    pub startup_sweep_enabled: bool,
    #[serde(
        serialize_with = "serialize_duration_secs",
        deserialize_with = "duration_secs"
    )]
    pub startup_sweep_timeout: Duration,
    #[serde(
        serialize_with = "serialize_duration_secs",
        deserialize_with = "duration_secs"
    )]
    pub shutdown_timeout: Duration,
    pub deployment_id: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig {
            check_interval: Duration::from_secs(60),
            hard_max_hours: 12.0,
            orphan_grace_period: Duration::from_secs(15 * 60),
            reconciliation_interval: Duration::from_secs(5 * 60),
            startup_sweep_enabled: true,
            startup_sweep_timeout: Duration::from_secs(2 * 60),
            shutdown_timeout: Duration::from_secs(30),
            deployment_id: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    #[serde(
        serialize_with = "serialize_duration_secs",
        deserialize_with = "duration_secs"
    )]
    pub verify_timeout: Duration,
    #[serde(
        serialize_with = "serialize_duration_secs",
        deserialize_with = "duration_secs"
    )]
    pub check_interval: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        SshConfig {
            verify_timeout: Duration::from_secs(5 * 60),
            check_interval: Duration::from_secs(15),
        }
    }
}

/// Readiness-probe backoff parameters, configurable per the spec's note
/// that the multiplier and cap are user-visible.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    #[serde(
        serialize_with = "serialize_duration_secs",
        deserialize_with = "duration_secs"
    )]
    pub initial_interval: Duration,
    #[serde(
        serialize_with = "serialize_duration_secs",
        deserialize_with = "duration_secs"
    )]
    pub max_interval: Duration,
    pub backoff_multiplier: f64,
    #[serde(
        serialize_with = "serialize_duration_secs",
        deserialize_with = "duration_secs"
    )]
    pub ssh_timeout: Duration,
    #[serde(
        serialize_with = "serialize_duration_secs",
        deserialize_with = "duration_secs"
    )]
    pub api_timeout: Duration,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        VerificationConfig {
            initial_interval: Duration::from_secs(15),
            max_interval: Duration::from_secs(60),
            backoff_multiplier: 1.5,
            ssh_timeout: Duration::from_secs(5 * 60),
            api_timeout: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DestroyConfig {
    #[serde(
        serialize_with = "serialize_duration_secs",
        deserialize_with = "duration_secs"
    )]
    pub retry_base: Duration,
    pub retries: u32,
}

impl Default for DestroyConfig {
    fn default() -> Self {
        DestroyConfig {
            retry_base: Duration::from_secs(5),
            retries: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    pub max_workers: usize,
    #[serde(
        serialize_with = "serialize_duration_secs",
        deserialize_with = "duration_secs"
    )]
    pub ready_timeout: Duration,
    #[serde(
        serialize_with = "serialize_duration_secs",
        deserialize_with = "duration_secs"
    )]
    pub result_timeout: Duration,
    pub dispatch_batch_size: usize,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        BenchmarkConfig {
            max_workers: 3,
            ready_timeout: Duration::from_secs(15 * 60),
            result_timeout: Duration::from_secs(20 * 60),
            dispatch_batch_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            format: "term".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.lifecycle.hard_max_hours, 12.0);
        assert_eq!(config.verification.backoff_multiplier, 1.5);
        assert_eq!(config.destroy.retries, 10);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml = r#"
            [server]
            port = 9090

            [providers.tensordock]
            enabled = true
        "#;
        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert!(config.providers.contains_key("tensordock"));
        assert_eq!(config.lifecycle.check_interval, Duration::from_secs(60));
    }
}
