use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use harvest_common::types::{ChainStatus, Task};
use harvest_common::{HarvestError, Result};

use crate::registry::TemplateDescriptor;
use crate::silos::SiloClient;

/// Granularity at which a sleeping step re-checks for a terminate request.
const TERMINATE_POLL: Duration = Duration::from_millis(100);

/// One step of a chain template.
#[derive(Clone, Debug, Deserialize)]
struct Step {
    task: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(flatten)]
    params: Map<String, Value>,
}

impl Step {
    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.task)
    }

    /// Step parameter lookup, falling back to the task's config so that
    /// enqueue-time values can fill template gaps.
    fn param<'a>(&'a self, config: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
        self.params.get(key).or_else(|| config.get(key))
    }
}

#[derive(Debug)]
struct ChainState {
    id: String,
    parent: Option<String>,
    redis_name: String,
    results_silo: String,
    class: String,
    config: Map<String, Value>,
    steps: Vec<Step>,
    status: RwLock<ChainStatus>,
    start: RwLock<Option<DateTime<Utc>>>,
    end: RwLock<Option<DateTime<Utc>>>,
    position: AtomicUsize,
    message: RwLock<Option<String>>,
}

/// The runtime instantiated from a blueprint and a task. Cheap to clone;
/// clones share one state, so the queue can observe and signal a chain whose
/// worker fiber owns another handle.
#[derive(Clone, Debug)]
pub struct TaskChain {
    state: Arc<ChainState>,
    results_sink: Option<SiloClient>,
}

impl TaskChain {
    /// Instantiate a chain from a blueprint and a task. The template is
    /// deep-copied so the catalog entry is never mutated; the step kinds are
    /// validated here so a bad blueprint fails admission, not execution.
    pub fn instantiate(
        descriptor: &TemplateDescriptor,
        task: &Task,
        results_silo: &str,
        results_sink: Option<SiloClient>,
    ) -> Result<Self> {
        let template = descriptor.template.clone();

        let steps: Vec<Step> = match template.get("steps") {
            Some(steps) => serde_json::from_value(steps.clone()).map_err(|e| {
                HarvestError::Chain(format!(
                    "Template `{}` has an invalid steps array: {}",
                    descriptor.key(),
                    e
                ))
            })?,
            None => Vec::new(),
        };

        for step in &steps {
            if !matches!(step.task.as_str(), "delay" | "log" | "noop") {
                return Err(HarvestError::Chain(format!(
                    "Template `{}` uses unknown task kind `{}`",
                    descriptor.key(),
                    step.task
                )));
            }
        }

        Ok(Self {
            state: Arc::new(ChainState {
                id: task.id.clone(),
                parent: task.parent.clone(),
                redis_name: task.id.clone(),
                results_silo: results_silo.to_string(),
                class: descriptor.class.clone(),
                config: task.config.clone(),
                steps,
                status: RwLock::new(ChainStatus::Initialized),
                start: RwLock::new(None),
                end: RwLock::new(None),
                position: AtomicUsize::new(0),
                message: RwLock::new(None),
            }),
            results_sink,
        })
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn parent(&self) -> Option<&str> {
        self.state.parent.as_deref()
    }

    /// Stable key for all shared-store reporting about this chain.
    pub fn redis_name(&self) -> &str {
        &self.state.redis_name
    }

    pub fn results_silo(&self) -> &str {
        &self.state.results_silo
    }

    pub fn status(&self) -> ChainStatus {
        *self.state.status.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        *self.state.start.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        *self.state.end.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: ChainStatus) {
        *self.state.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Request this chain to wind down. Non-blocking; the running fiber
    /// observes the status between steps. Finished chains are left alone.
    pub fn terminate(&self) {
        let mut status = self.state.status.write().unwrap_or_else(|e| e.into_inner());
        if status.is_live() {
            *status = ChainStatus::Terminating;
        }
    }

    /// Blocking entry point. Sets `start` and `status` on entry, walks the
    /// steps, and records `end` and the final status on the way out.
    pub async fn run(&self) {
        *self.state.start.write().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        self.set_status(ChainStatus::Running);

        tracing::debug!(chain = %self.state.id, steps = self.state.steps.len(), "Chain started");

        let mut failure: Option<String> = None;

        for (index, step) in self.state.steps.iter().enumerate() {
            if self.status() == ChainStatus::Terminating {
                tracing::info!(chain = %self.state.id, step = step.label(), "Chain terminating");
                break;
            }

            self.state.position.store(index, Ordering::Relaxed);

            if let Err(e) = self.execute_step(step).await {
                failure = Some(e.to_string());
                break;
            }

            self.state.position.store(index + 1, Ordering::Relaxed);
        }

        *self.state.end.write().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());

        let final_status = if let Some(message) = failure {
            tracing::error!(chain = %self.state.id, error = %message, "Chain failed");
            *self.state.message.write().unwrap_or_else(|e| e.into_inner()) = Some(message);
            ChainStatus::Error
        } else if self.status() == ChainStatus::Terminating {
            ChainStatus::Terminating
        } else {
            ChainStatus::Complete
        };

        self.set_status(final_status);
        self.publish_results(final_status).await;

        tracing::debug!(chain = %self.state.id, status = %final_status, "Chain finished");
    }

    async fn execute_step(&self, step: &Step) -> Result<()> {
        match step.task.as_str() {
            "delay" => {
                let seconds = step
                    .param(&self.state.config, "seconds")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| {
                        HarvestError::Chain(format!(
                            "Step `{}` requires a numeric `seconds` parameter",
                            step.label()
                        ))
                    })?;

                let deadline = tokio::time::Instant::now()
                    + Duration::from_secs_f64(seconds.max(0.0));

                while tokio::time::Instant::now() < deadline {
                    if self.status() == ChainStatus::Terminating {
                        return Ok(());
                    }
                    let remaining = deadline - tokio::time::Instant::now();
                    tokio::time::sleep(remaining.min(TERMINATE_POLL)).await;
                }
                Ok(())
            }
            "log" => {
                let message = step
                    .param(&self.state.config, "message")
                    .and_then(Value::as_str)
                    .unwrap_or("(no message)");
                tracing::info!(chain = %self.state.id, step = step.label(), "{}", message);
                Ok(())
            }
            "noop" => Ok(()),
            other => Err(HarvestError::Chain(format!("Unknown task kind `{}`", other))),
        }
    }

    /// Final result record for the results silo. Best-effort: a missing sink
    /// or a write failure never changes the chain's outcome.
    async fn publish_results(&self, status: ChainStatus) {
        let Some(sink) = &self.results_sink else {
            return;
        };

        let record = json!({
            "id": self.state.id,
            "parent": self.state.parent,
            "status": status.as_str(),
            "start": self.start().map(|t| t.to_rfc3339()),
            "end": self.end().map(|t| t.to_rfc3339()),
            "completed_steps": self.state.position.load(Ordering::Relaxed),
            "total_steps": self.state.steps.len(),
        });

        if let Err(e) = sink.lpush(&self.state.redis_name, &record.to_string()).await {
            tracing::error!(chain = %self.state.id, error = %e, "Failed to publish chain results");
        }
    }

    /// Progress counters for status queries.
    pub fn detailed_progress(&self) -> Map<String, Value> {
        let position = self.state.position.load(Ordering::Relaxed);
        let total = self.state.steps.len();
        let percent = if total == 0 {
            100.0
        } else {
            (position as f64 / total as f64) * 100.0
        };

        let mut progress = Map::new();
        progress.insert("position".to_string(), json!(position));
        progress.insert("total".to_string(), json!(total));
        progress.insert("percent".to_string(), json!(percent));
        progress
    }

    /// Full snapshot record for the task silo, per the hash field
    /// convention. Overwrite-latest; the queue annotates it with the node
    /// name and an update timestamp before writing.
    pub fn redis_struct(&self) -> Map<String, Value> {
        let mut record = Map::new();
        record.insert("id".to_string(), json!(self.state.id));
        record.insert("parent".to_string(), json!(self.state.parent));
        record.insert("class".to_string(), json!(self.state.class));
        record.insert("status".to_string(), json!(self.status().as_str()));
        record.insert(
            "start".to_string(),
            json!(self.start().map(|t| t.to_rfc3339())),
        );
        record.insert("end".to_string(), json!(self.end().map(|t| t.to_rfc3339())));

        if let Some(message) = self
            .state
            .message
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            record.insert("message".to_string(), json!(message));
        }

        for (key, value) in self.detailed_progress() {
            record.insert(key, value);
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(config: Value) -> Task {
        Task {
            id: "task-1".to_string(),
            name: "echo".to_string(),
            category: "template_diagnostics".to_string(),
            parent: None,
            config: config.as_object().cloned().unwrap_or_default(),
            priority: 1,
            created: None,
            status: "enqueued".to_string(),
        }
    }

    fn descriptor(steps: Value) -> TemplateDescriptor {
        TemplateDescriptor {
            category: "template_diagnostics".to_string(),
            name: "echo".to_string(),
            class: "SequentialChain".to_string(),
            template: json!({ "steps": steps }),
        }
    }

    #[tokio::test]
    async fn test_chain_runs_to_complete() {
        let chain = TaskChain::instantiate(
            &descriptor(json!([
                {"task": "log", "message": "hello"},
                {"task": "noop"},
            ])),
            &task(json!({})),
            "harvest-task-results",
            None,
        )
        .unwrap();

        assert_eq!(chain.status(), ChainStatus::Initialized);
        assert!(chain.start().is_none());

        chain.run().await;

        assert_eq!(chain.status(), ChainStatus::Complete);
        assert!(chain.start().is_some());
        assert!(chain.end().unwrap() >= chain.start().unwrap());

        let progress = chain.detailed_progress();
        assert_eq!(progress["position"], json!(2));
        assert_eq!(progress["total"], json!(2));
        assert_eq!(progress["percent"], json!(100.0));
    }

    #[tokio::test]
    async fn test_terminate_interrupts_a_delay() {
        let chain = TaskChain::instantiate(
            &descriptor(json!([{"task": "delay", "seconds": 30}])),
            &task(json!({})),
            "harvest-task-results",
            None,
        )
        .unwrap();

        let runner = chain.clone();
        let worker = tokio::spawn(async move { runner.run().await });

        // Let the chain enter its delay, then request wind-down.
        tokio::time::sleep(Duration::from_millis(200)).await;
        chain.terminate();

        tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .expect("chain did not observe terminate")
            .unwrap();

        assert_eq!(chain.status(), ChainStatus::Terminating);
        assert!(chain.end().is_some());
    }

    #[tokio::test]
    async fn test_terminate_does_not_reopen_a_finished_chain() {
        let chain = TaskChain::instantiate(
            &descriptor(json!([{"task": "noop"}])),
            &task(json!({})),
            "harvest-task-results",
            None,
        )
        .unwrap();

        chain.run().await;
        assert_eq!(chain.status(), ChainStatus::Complete);

        chain.terminate();
        assert_eq!(chain.status(), ChainStatus::Complete);
    }

    #[tokio::test]
    async fn test_missing_step_parameter_is_an_error() {
        let chain = TaskChain::instantiate(
            &descriptor(json!([{"task": "delay"}])),
            &task(json!({})),
            "harvest-task-results",
            None,
        )
        .unwrap();

        chain.run().await;

        assert_eq!(chain.status(), ChainStatus::Error);
        let record = chain.redis_struct();
        assert!(record["message"]
            .as_str()
            .unwrap()
            .contains("requires a numeric `seconds` parameter"));
    }

    #[tokio::test]
    async fn test_task_config_fills_template_gaps() {
        let chain = TaskChain::instantiate(
            &descriptor(json!([{"task": "delay"}])),
            &task(json!({"seconds": 0.01})),
            "harvest-task-results",
            None,
        )
        .unwrap();

        chain.run().await;
        assert_eq!(chain.status(), ChainStatus::Complete);
    }

    #[test]
    fn test_unknown_task_kind_fails_instantiation() {
        let err = TaskChain::instantiate(
            &descriptor(json!([{"task": "drop_database"}])),
            &task(json!({})),
            "harvest-task-results",
            None,
        )
        .unwrap_err();

        assert!(err.to_string().contains("unknown task kind `drop_database`"));
    }

    #[test]
    fn test_redis_name_is_the_task_id() {
        let chain = TaskChain::instantiate(
            &descriptor(json!([])),
            &task(json!({})),
            "harvest-task-results",
            None,
        )
        .unwrap();

        assert_eq!(chain.redis_name(), "task-1");
        assert_eq!(chain.results_silo(), "harvest-task-results");
    }
}
