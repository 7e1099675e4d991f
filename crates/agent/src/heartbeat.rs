use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use harvest_common::config::AgentConfig;
use harvest_common::encoding::encode_hash;
use harvest_common::types::NodeRecord;
use harvest_common::Result;

use crate::queue::JobQueue;
use crate::registry::{TemplateDescriptor, TemplateRegistry};
use crate::silos::{SiloRegistry, NODES_SILO, TEMPLATES_SILO};

/// The immutable part of the node record, computed once at fiber start.
struct NodeIdentity {
    name: String,
    ip: String,
    architecture: String,
    os: String,
    port: u16,
    version: String,
    pid: u32,
    heartbeat_seconds: u64,
    plugins: Vec<String>,
    accounts: Vec<String>,
    available_tasks: Vec<String>,
    available_chains: Vec<String>,
    start: DateTime<Utc>,
}

/// Start the heartbeat fiber. It publishes the node record to the nodes
/// silo with a TTL every cycle; the coordinator's notion of "alive" is pure
/// key expiry, so the loop must keep ticking through partial store failure.
pub fn spawn_heartbeat(
    config: Arc<AgentConfig>,
    silos: Arc<SiloRegistry>,
    registry: Arc<RwLock<TemplateRegistry>>,
    queue: Arc<JobQueue>,
    node_name: String,
) -> JoinHandle<()> {
    tokio::spawn(heartbeat_loop(config, silos, registry, queue, node_name))
}

async fn heartbeat_loop(
    config: Arc<AgentConfig>,
    silos: Arc<SiloRegistry>,
    registry: Arc<RwLock<TemplateRegistry>>,
    queue: Arc<JobQueue>,
    node_name: String,
) {
    let check_rate = config.agent.heartbeat.check_rate.max(1);
    let expiration = config.agent.heartbeat.expiration_seconds().max(1);

    let identity = {
        let registry = registry.read().unwrap_or_else(|e| e.into_inner());
        NodeIdentity {
            name: node_name,
            ip: local_ip(),
            architecture: std::env::consts::ARCH.to_string(),
            os: os_pretty_name(),
            port: config.agent.connection.port,
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: config.agent.pid.unwrap_or_else(std::process::id),
            heartbeat_seconds: check_rate,
            plugins: config.plugins.clone(),
            accounts: accounts_from(&config),
            available_tasks: registry.names_in_category("task"),
            available_chains: registry.names_in_category("chain"),
            start: Utc::now(),
        }
    };

    tracing::info!(
        node = %identity.name,
        ip = %identity.ip,
        expiration,
        "Node heartbeat started"
    );

    let mut published_templates: Option<Vec<TemplateDescriptor>> = None;

    loop {
        let result = heartbeat_cycle(
            &identity,
            &silos,
            &registry,
            &queue,
            expiration,
            &mut published_templates,
        )
        .await;

        if let Err(e) = result {
            tracing::error!(error = %e, "heartbeat: Could not update the node record");
            metrics::counter!("agent.heartbeat.publish_errors").increment(1);
        }

        tokio::time::sleep(Duration::from_secs(check_rate)).await;
    }
}

async fn heartbeat_cycle(
    identity: &NodeIdentity,
    silos: &SiloRegistry,
    registry: &RwLock<TemplateRegistry>,
    queue: &JobQueue,
    expiration: u64,
    published_templates: &mut Option<Vec<TemplateDescriptor>>,
) -> Result<()> {
    let nodes = silos.get(NODES_SILO).await?;
    let templates_silo = silos.get(TEMPLATES_SILO).await?;

    // Registry iteration is keyed, so the catalog comes out sorted.
    let templates: Vec<TemplateDescriptor> = {
        let registry = registry.read().unwrap_or_else(|e| e.into_inner());
        registry.templates().into_iter().cloned().collect()
    };

    let last = Utc::now();
    let record = NodeRecord {
        name: identity.name.clone(),
        role: "agent".to_string(),
        ip: identity.ip.clone(),
        architecture: identity.architecture.clone(),
        os: identity.os.clone(),
        port: identity.port,
        version: identity.version.clone(),
        pid: identity.pid,
        start: identity.start,
        last,
        duration: (last - identity.start).num_milliseconds() as f64 / 1000.0,
        heartbeat_seconds: identity.heartbeat_seconds,
        plugins: identity.plugins.clone(),
        accounts: identity.accounts.clone(),
        available_tasks: identity.available_tasks.clone(),
        available_chains: identity.available_chains.clone(),
        available_templates: templates.iter().map(TemplateDescriptor::key).collect(),
        queue: serde_json::to_value(queue.detailed_status())?,
    };

    nodes
        .hset_map(&identity.name, &encode_hash(&record.to_record()?))
        .await?;
    nodes.expire(&identity.name, expiration).await?;

    tracing::debug!("heartbeat: OK");

    if published_templates.as_ref() != Some(&templates) {
        for template in &templates {
            templates_silo
                .hset_map(&template.silo_key(), &encode_hash(&template.to_record()))
                .await?;
            templates_silo.expire(&template.silo_key(), expiration).await?;
        }
        tracing::debug!(count = templates.len(), "Templates republished");
        *published_templates = Some(templates);
    } else {
        // Unchanged catalog: only keep the records alive.
        for template in &templates {
            templates_silo.expire(&template.silo_key(), expiration).await?;
        }
    }

    Ok(())
}

/// Sorted `platform:account` pairs from the platform inventory.
fn accounts_from(config: &AgentConfig) -> Vec<String> {
    let mut accounts: Vec<String> = config
        .platforms
        .iter()
        .flat_map(|(platform, entry)| {
            entry
                .accounts
                .iter()
                .map(move |account| format!("{}:{}", platform, account))
        })
        .collect();
    accounts.sort();
    accounts
}

/// The address peers would reach this node at. A connected UDP socket picks
/// the route without sending anything; falls back to loopback.
fn local_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn os_pretty_name() -> String {
    if let Ok(contents) = std::fs::read_to_string("/etc/os-release") {
        for line in contents.lines() {
            if let Some(value) = line.strip_prefix("PRETTY_NAME=") {
                return value.trim_matches('"').to_string();
            }
        }
    }
    std::env::consts::OS.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_common::config::PlatformConfig;

    #[test]
    fn test_accounts_are_sorted_platform_account_pairs() {
        let mut config = AgentConfig::default();
        config.platforms.insert(
            "gcp".to_string(),
            PlatformConfig {
                accounts: vec!["project-b".to_string(), "project-a".to_string()],
            },
        );
        config.platforms.insert(
            "aws".to_string(),
            PlatformConfig {
                accounts: vec!["123456789012".to_string()],
            },
        );

        assert_eq!(
            accounts_from(&config),
            vec!["aws:123456789012", "gcp:project-a", "gcp:project-b"]
        );
    }

    #[test]
    fn test_node_address_helpers_return_something() {
        assert!(!local_ip().is_empty());
        assert!(!os_pretty_name().is_empty());
    }
}
