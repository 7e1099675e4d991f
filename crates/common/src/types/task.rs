use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::encoding::decode_hash;
use crate::error::{HarvestError, Result};

/// Shared-store task status that makes a task eligible for pickup. Any other
/// value (cancelled, already picked up) is skipped at admission.
pub const STATUS_ENQUEUED: &str = "enqueued";

/// A unit of work fetched from the shared store.
///
/// Decoding is lenient: the coordinator owns the record shape and may attach
/// fields this node does not know about.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub category: String,
    /// Id of an enclosing chain, when this task was spawned by one.
    #[serde(default)]
    pub parent: Option<String>,
    /// Free-form parameters passed into the blueprint factory.
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: String,
}

impl Task {
    /// Decode a task from its Redis hash fields.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let record = decode_hash(fields);
        serde_json::from_value(Value::Object(record))
            .map_err(|e| HarvestError::Internal(format!("Undecodable task record: {}", e)))
    }

    pub fn is_enqueued(&self) -> bool {
        self.status == STATUS_ENQUEUED
    }
}

/// Lifecycle states of a task chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Initialized,
    Running,
    Complete,
    Error,
    Terminating,
}

impl ChainStatus {
    /// All known status codes, in histogram order.
    pub const ALL: [ChainStatus; 5] = [
        Self::Initialized,
        Self::Running,
        Self::Complete,
        Self::Error,
        Self::Terminating,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Terminating => "terminating",
        }
    }

    /// Whether the chain is still doing (or about to do) work.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Initialized | Self::Running)
    }
}

impl std::fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle states of the job queue itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Initialized,
    Running,
    Stopping,
    Stopped,
    Terminating,
    Error,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Terminating => "terminating",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::encode_hash;
    use serde_json::json;

    fn task_fields(status: &str) -> HashMap<String, String> {
        let record = json!({
            "id": "task-1",
            "name": "inventory",
            "category": "reports",
            "config": {"region": "us-east-1"},
            "priority": 5,
            "created": "2026-01-05T10:00:00Z",
            "status": status,
        });
        encode_hash(record.as_object().unwrap())
    }

    #[test]
    fn test_task_from_fields() {
        let task = Task::from_fields(&task_fields("enqueued")).unwrap();

        assert_eq!(task.id, "task-1");
        assert_eq!(task.category, "reports");
        assert_eq!(task.priority, 5);
        assert_eq!(task.config["region"], json!("us-east-1"));
        assert!(task.is_enqueued());
    }

    #[test]
    fn test_cancelled_task_is_not_eligible() {
        let task = Task::from_fields(&task_fields("cancelled")).unwrap();
        assert!(!task.is_enqueued());
    }

    #[test]
    fn test_missing_optional_fields_tolerated() {
        let mut fields = HashMap::new();
        fields.insert("id".to_string(), "bare".to_string());

        let task = Task::from_fields(&fields).unwrap();
        assert_eq!(task.id, "bare");
        assert!(task.parent.is_none());
        assert!(task.config.is_empty());
    }

    #[test]
    fn test_chain_status_histogram_codes() {
        assert_eq!(ChainStatus::ALL.len(), 5);
        assert_eq!(ChainStatus::Terminating.as_str(), "terminating");
        assert!(ChainStatus::Running.is_live());
        assert!(!ChainStatus::Terminating.is_live());
    }
}
