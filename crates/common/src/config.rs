use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level agent configuration, deserialized from harvest.yaml.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub api: ApiSection,
    /// Plugins to install before the template registry is populated.
    #[serde(default)]
    pub plugins: Vec<String>,
    /// Platform account inventory, published as `platform:account` pairs in
    /// the node record.
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformConfig>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentSection {
    /// Node identity under which the heartbeat publishes. Defaults to the
    /// host name when absent.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    /// Platform tagging passed through to the coordinator, unused locally.
    #[serde(default)]
    pub pstar: Option<String>,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

/// HTTP bind address and server certificate for the control surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_bind_host")]
    pub host: String,
    #[serde(default = "default_bind_port")]
    pub port: u16,
    #[serde(default)]
    pub pem: Option<PathBuf>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            port: default_bind_port(),
            pem: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_location")]
    pub location: PathBuf,
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Suppress console output; the file sink is always active.
    #[serde(default)]
    pub quiet: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            location: default_log_location(),
            level: default_log_level(),
            quiet: false,
        }
    }
}

/// Job queue admission and lifecycle parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Priority levels this node polls, in the given order. The order is the
    /// polling order; it is never sorted numerically.
    #[serde(default = "default_priorities")]
    pub accepted_chain_priorities: Vec<i64>,
    /// Task kinds this node refuses to run.
    #[serde(default)]
    pub chain_task_restrictions: Vec<String>,
    /// Wall-clock cap on any single chain, in seconds.
    #[serde(default = "default_chain_timeout")]
    pub chain_timeout_seconds: u64,
    /// Queue scheduler cycle period, in seconds.
    #[serde(default = "default_queue_check_interval")]
    pub queue_check_interval_seconds: u64,
    /// Concurrency cap on in-flight chains.
    #[serde(default = "default_max_chains")]
    pub max_chains: usize,
    /// Start the queue at boot without waiting for /queue/start.
    #[serde(default)]
    pub auto_start: bool,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            accepted_chain_priorities: default_priorities(),
            chain_task_restrictions: Vec::new(),
            chain_timeout_seconds: default_chain_timeout(),
            queue_check_interval_seconds: default_queue_check_interval(),
            max_chains: default_max_chains(),
            auto_start: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Progress snapshot publication period, in seconds.
    #[serde(default = "default_reporting_interval")]
    pub reporting_interval_seconds: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            reporting_interval_seconds: default_reporting_interval(),
        }
    }
}

/// Heartbeat cadence and liveness TTL factor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Publication period, in seconds.
    #[serde(default = "default_heartbeat_check_rate")]
    pub check_rate: u64,
    /// The node record TTL is `ceil(expiration_multiplier * check_rate)`.
    #[serde(default = "default_expiration_multiplier")]
    pub expiration_multiplier: f64,
}

impl HeartbeatConfig {
    pub fn expiration_seconds(&self) -> u64 {
        (self.expiration_multiplier * self.check_rate as f64).ceil() as u64
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_rate: default_heartbeat_check_rate(),
            expiration_multiplier: default_expiration_multiplier(),
        }
    }
}

/// Coordinator endpoint and client TLS settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub ssl: SslConfig,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            token: String::new(),
            ssl: SslConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SslConfig {
    /// Client identity presented to the coordinator.
    #[serde(default)]
    pub pem: Option<PathBuf>,
    /// Verify the coordinator's certificate.
    #[serde(default)]
    pub verify: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub accounts: Vec<String>,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_port() -> u16 {
    8500
}

fn default_api_host() -> String {
    "localhost".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_log_location() -> PathBuf {
    PathBuf::from("./app/logs/")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_priorities() -> Vec<i64> {
    vec![1]
}

fn default_chain_timeout() -> u64 {
    300
}

fn default_queue_check_interval() -> u64 {
    1
}

fn default_max_chains() -> usize {
    10
}

fn default_reporting_interval() -> u64 {
    5
}

fn default_heartbeat_check_rate() -> u64 {
    1
}

fn default_expiration_multiplier() -> f64 {
    5.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: AgentConfig = serde_yaml::from_str("api:\n  token: abc\n").unwrap();

        assert_eq!(config.api.token, "abc");
        assert_eq!(config.agent.connection.port, 8500);
        assert_eq!(config.agent.tasks.accepted_chain_priorities, vec![1]);
        assert_eq!(config.agent.tasks.max_chains, 10);
        assert!(!config.agent.tasks.auto_start);
        assert_eq!(config.agent.heartbeat.check_rate, 1);
    }

    #[test]
    fn test_full_config_round_trip() {
        let yaml = r#"
agent:
  name: node-1
  connection:
    host: 127.0.0.1
    port: 9000
  tasks:
    accepted_chain_priorities: [5, 1, 3]
    chain_task_restrictions: [delete_everything]
    chain_timeout_seconds: 60
    queue_check_interval_seconds: 2
    max_chains: 4
    auto_start: true
  heartbeat:
    check_rate: 2
    expiration_multiplier: 3
api:
  host: coordinator.internal
  port: 8443
  token: secret
plugins:
  - builtin
platforms:
  aws:
    accounts: ["123456789012"]
"#;
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.agent.name.as_deref(), Some("node-1"));
        // Polling order is preserved, not sorted.
        assert_eq!(config.agent.tasks.accepted_chain_priorities, vec![5, 1, 3]);
        assert_eq!(config.agent.heartbeat.expiration_seconds(), 6);
        assert_eq!(config.platforms["aws"].accounts, vec!["123456789012"]);
    }

    #[test]
    fn test_expiration_seconds_rounds_up() {
        let heartbeat = HeartbeatConfig {
            check_rate: 3,
            expiration_multiplier: 1.5,
        };
        assert_eq!(heartbeat.expiration_seconds(), 5);
    }
}
