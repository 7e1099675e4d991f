use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{HarvestError, Result};

/// The record a node publishes about itself to the `harvest-nodes` silo.
///
/// The coordinator treats key expiry as the liveness signal; the record body
/// is advisory scheduling input (capabilities and queue load).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub role: String,
    pub ip: String,
    pub architecture: String,
    pub os: String,
    pub port: u16,
    pub version: String,
    pub pid: u32,
    pub start: DateTime<Utc>,
    pub last: DateTime<Utc>,
    /// Seconds since `start`, as of `last`.
    pub duration: f64,
    pub heartbeat_seconds: u64,
    pub plugins: Vec<String>,
    /// Sorted `platform:account` pairs this node can harvest.
    pub accounts: Vec<String>,
    pub available_tasks: Vec<String>,
    pub available_chains: Vec<String>,
    /// Sorted `category/name` pairs, refreshed every cycle.
    pub available_templates: Vec<String>,
    /// The queue's detailed-status snapshot.
    pub queue: Value,
}

impl NodeRecord {
    /// Serialize for the hash encoding convention.
    pub fn to_record(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(HarvestError::Internal(format!(
                "Node record serialized to non-object: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_fields_and_duration() {
        let start: DateTime<Utc> = "2026-01-05T10:00:00Z".parse().unwrap();
        let last: DateTime<Utc> = "2026-01-05T10:00:42Z".parse().unwrap();

        let record = NodeRecord {
            name: "node-1".into(),
            role: "agent".into(),
            ip: "10.0.0.5".into(),
            architecture: "x86_64".into(),
            os: "linux".into(),
            port: 8500,
            version: "0.1.0".into(),
            pid: 4242,
            start,
            last,
            duration: (last - start).num_milliseconds() as f64 / 1000.0,
            heartbeat_seconds: 1,
            plugins: vec!["builtin".into()],
            accounts: vec![],
            available_tasks: vec!["delay".into()],
            available_chains: vec!["sequential".into()],
            available_templates: vec!["template_reports/echo".into()],
            queue: json!({"status": "running"}),
        };

        assert!(record.last >= record.start);
        assert_eq!(record.duration, 42.0);

        let map = record.to_record().unwrap();
        assert_eq!(map["role"], json!("agent"));
        assert_eq!(map["queue"]["status"], json!("running"));
    }
}
