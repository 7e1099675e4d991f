use std::path::{Path, PathBuf};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use harvest_common::config::{AgentConfig, LoggingConfig};
use harvest_common::{HarvestError, Result};

/// Candidate configuration files, first existing wins.
pub const CONFIG_PATHS: [&str; 2] = ["./app/harvest.yaml", "./harvest.yaml"];

/// Load the agent configuration from the first existing candidate path.
pub fn load_configuration() -> Result<AgentConfig> {
    for candidate in CONFIG_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            return load_configuration_from(path);
        }
    }

    Err(HarvestError::Config(format!(
        "No configuration file found in {}.",
        CONFIG_PATHS.join(", ")
    )))
}

/// Load and parse one configuration file, strip YAML-anchor placeholder
/// keys, and apply environment overrides.
pub fn load_configuration_from(path: &Path) -> Result<AgentConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        HarvestError::Config(format!("Cannot read {}: {}", path.display(), e))
    })?;

    let raw: serde_yaml::Value = serde_yaml::from_str(&contents).map_err(|e| {
        HarvestError::Config(format!("Cannot parse {}: {}", path.display(), e))
    })?;

    let mut config: AgentConfig = serde_yaml::from_value(strip_anchor_keys(raw)).map_err(|e| {
        HarvestError::Config(format!("Invalid configuration in {}: {}", path.display(), e))
    })?;

    apply_env_overrides(&mut config);

    tracing::debug!(path = %path.display(), "Agent configuration loaded");

    Ok(config)
}

/// Top-level keys starting with a period are YAML-anchor placeholders, not
/// configuration.
fn strip_anchor_keys(value: serde_yaml::Value) -> serde_yaml::Value {
    match value {
        serde_yaml::Value::Mapping(mapping) => serde_yaml::Value::Mapping(
            mapping
                .into_iter()
                .filter(|(key, _)| !key.as_str().is_some_and(|k| k.starts_with('.')))
                .collect(),
        ),
        other => other,
    }
}

/// Non-interactive start overrides for the bind address and server cert.
fn apply_env_overrides(config: &mut AgentConfig) {
    if let Ok(host) = std::env::var("CLOUDHARVESTAGENT_HOST") {
        if !host.is_empty() {
            config.agent.connection.host = host;
        }
    }
    if let Ok(port) = std::env::var("CLOUDHARVESTAGENT_PORT") {
        match port.parse() {
            Ok(port) => config.agent.connection.port = port,
            Err(_) => {
                tracing::warn!(value = %port, "Ignoring unparseable CLOUDHARVESTAGENT_PORT")
            }
        }
    }
    if let Ok(pem) = std::env::var("CLOUDHARVESTAGENT_PEMFILE") {
        if !pem.is_empty() {
            config.agent.connection.pem = Some(PathBuf::from(pem));
        }
    }
}

/// The identity this node publishes under: the configured name, else the
/// host name.
pub fn node_name(config: &AgentConfig) -> String {
    if let Some(name) = &config.agent.name {
        return name.clone();
    }
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|name| name.trim().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Install the tracing subscriber: a JSON file sink at the configured
/// location, plus console output unless quiet. `RUST_LOG` wins over the
/// configured level when set.
pub fn init_logging(logging: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&logging.location).map_err(|e| {
        HarvestError::Config(format!(
            "Cannot create log directory {}: {}",
            logging.location.display(),
            e
        ))
    })?;

    let log_path = logging.location.join("agent.log");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| {
            HarvestError::Config(format!("Cannot open log file {}: {}", log_path.display(), e))
        })?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::sync::Mutex::new(file));

    let result = if logging.quiet {
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };

    result.map_err(|e| HarvestError::Config(format!("Cannot install logging: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_anchor_keys_are_stripped() {
        let file = write_config(
            r#"
.defaults:
  something: reused
agent:
  name: node-1
api:
  token: abc
"#,
        );

        let config = load_configuration_from(file.path()).unwrap();
        assert_eq!(config.agent.name.as_deref(), Some("node-1"));
        assert_eq!(config.api.token, "abc");
    }

    #[test]
    fn test_missing_file_is_a_config_error() {
        let err = load_configuration_from(Path::new("/does/not/exist.yaml")).unwrap_err();
        assert!(matches!(err, HarvestError::Config(_)));
    }

    #[test]
    fn test_invalid_yaml_is_a_config_error() {
        let file = write_config("agent: [not: a mapping");
        assert!(load_configuration_from(file.path()).is_err());
    }

    #[test]
    fn test_env_overrides_bind_address() {
        let mut config = AgentConfig::default();

        std::env::set_var("CLOUDHARVESTAGENT_HOST", "10.1.2.3");
        std::env::set_var("CLOUDHARVESTAGENT_PORT", "9001");
        std::env::set_var("CLOUDHARVESTAGENT_PEMFILE", "/etc/harvest/agent.pem");

        apply_env_overrides(&mut config);

        std::env::remove_var("CLOUDHARVESTAGENT_HOST");
        std::env::remove_var("CLOUDHARVESTAGENT_PORT");
        std::env::remove_var("CLOUDHARVESTAGENT_PEMFILE");

        assert_eq!(config.agent.connection.host, "10.1.2.3");
        assert_eq!(config.agent.connection.port, 9001);
        assert_eq!(
            config.agent.connection.pem.as_deref(),
            Some(Path::new("/etc/harvest/agent.pem"))
        );
    }

    #[test]
    fn test_node_name_prefers_configured_name() {
        let mut config = AgentConfig::default();
        config.agent.name = Some("configured".to_string());
        assert_eq!(node_name(&config), "configured");
    }
}
