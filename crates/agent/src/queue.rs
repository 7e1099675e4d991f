use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;

use harvest_common::config::AgentConfig;
use harvest_common::encoding::encode_hash;
use harvest_common::types::{ChainStatus, QueueStatus, Task, STATUS_ENQUEUED};
use harvest_common::{HarvestError, Result};

use crate::chain::TaskChain;
use crate::registry::{TemplateDescriptor, TemplateRegistry};
use crate::silos::{SiloClient, SiloRegistry, RESULTS_SILO, TASKS_SILO, TASK_QUEUE_SILO};

/// TTL on synthetic error records written when admission fails.
const ADMISSION_ERROR_TTL: u64 = 3600;

/// Queue scheduling parameters, resolved from the agent configuration.
#[derive(Clone, Debug)]
pub struct JobQueueConfig {
    pub node_name: String,
    /// Priority levels polled in this exact order.
    pub accepted_chain_priorities: Vec<i64>,
    pub chain_task_restrictions: Vec<String>,
    pub chain_timeout_seconds: u64,
    pub queue_check_interval_seconds: u64,
    pub max_chains: usize,
    pub reporting_interval_seconds: u64,
}

impl JobQueueConfig {
    pub fn from_agent_config(config: &AgentConfig, node_name: String) -> Self {
        let tasks = &config.agent.tasks;
        Self {
            node_name,
            accepted_chain_priorities: tasks.accepted_chain_priorities.clone(),
            chain_task_restrictions: tasks.chain_task_restrictions.clone(),
            chain_timeout_seconds: tasks.chain_timeout_seconds,
            queue_check_interval_seconds: tasks.queue_check_interval_seconds,
            max_chains: tasks.max_chains,
            reporting_interval_seconds: config.agent.metrics.reporting_interval_seconds,
        }
    }
}

/// Outcome envelope for queue lifecycle calls.
#[derive(Clone, Debug, Serialize)]
pub struct QueueOutcome {
    pub success: bool,
    pub result: QueueStatus,
    pub message: String,
}

/// Copy-on-read status snapshot. The scheduler rebuilds this every cycle;
/// the heartbeat and HTTP handlers read it without touching the live map.
#[derive(Clone, Debug, Serialize)]
pub struct DetailedStatus {
    pub chain_status: BTreeMap<String, usize>,
    pub duration: f64,
    pub max_chains: usize,
    pub start_time: DateTime<Utc>,
    pub status: QueueStatus,
    pub stop_time: Option<DateTime<Utc>>,
    pub total_chains_in_queue: usize,
}

struct ChainEntry {
    chain: TaskChain,
    worker: JoinHandle<()>,
}

/// The local scheduler: drains the shared priority queue, runs chains under
/// the concurrency cap, reports progress, and reaps finished workers.
///
/// One scheduler fiber owns all mutation of the in-flight map; every other
/// fiber observes the queue through [`JobQueue::detailed_status`].
pub struct JobQueue {
    config: JobQueueConfig,
    silos: Arc<SiloRegistry>,
    registry: Arc<RwLock<TemplateRegistry>>,
    status: RwLock<QueueStatus>,
    start_time: DateTime<Utc>,
    stop_time: RwLock<Option<DateTime<Utc>>>,
    tasks: Mutex<HashMap<String, ChainEntry>>,
    task_chains_processed: AtomicU64,
    snapshot: RwLock<DetailedStatus>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl JobQueue {
    pub fn new(
        config: JobQueueConfig,
        silos: Arc<SiloRegistry>,
        registry: Arc<RwLock<TemplateRegistry>>,
    ) -> Self {
        let start_time = Utc::now();
        let snapshot = DetailedStatus {
            chain_status: empty_histogram(),
            duration: 0.0,
            max_chains: config.max_chains,
            start_time,
            status: QueueStatus::Initialized,
            stop_time: None,
            total_chains_in_queue: 0,
        };

        Self {
            config,
            silos,
            registry,
            status: RwLock::new(QueueStatus::Initialized),
            start_time,
            stop_time: RwLock::new(None),
            tasks: Mutex::new(HashMap::new()),
            task_chains_processed: AtomicU64::new(0),
            snapshot: RwLock::new(snapshot),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.config
    }

    pub fn status(&self) -> QueueStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: QueueStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }

    pub fn task_chains_processed(&self) -> u64 {
        self.task_chains_processed.load(Ordering::Relaxed)
    }

    /// Seconds since construction, frozen at `stop_time` once stopped.
    pub fn duration(&self) -> f64 {
        let end = self
            .stop_time
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or_else(Utc::now);
        (end - self.start_time).num_milliseconds() as f64 / 1000.0
    }

    /// Start the scheduler fiber. Idempotent while running.
    pub fn start(self: &Arc<Self>) -> QueueOutcome {
        {
            let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
            match *status {
                QueueStatus::Running => {
                    return QueueOutcome {
                        success: true,
                        result: QueueStatus::Running,
                        message: "JobQueue is already running.".to_string(),
                    };
                }
                // The previous scheduler fiber is still draining; a second
                // one would contend for the map.
                QueueStatus::Stopping | QueueStatus::Terminating => {
                    return QueueOutcome {
                        success: false,
                        result: *status,
                        message: "JobQueue is still stopping.".to_string(),
                    };
                }
                _ => *status = QueueStatus::Running,
            }
        }

        *self.stop_time.write().unwrap_or_else(|e| e.into_inner()) = None;

        let queue = Arc::clone(self);
        let handle = tokio::spawn(worker_loop(queue));
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        tracing::info!("JobQueue started");

        QueueOutcome {
            success: true,
            result: QueueStatus::Running,
            message: "OK".to_string(),
        }
    }

    /// Stop admitting work and wind down.
    ///
    /// With `finish_running_jobs`, in-flight chains complete naturally;
    /// otherwise every chain is told to terminate and its store record is
    /// marked accordingly. Either way this waits up to `timeout` seconds, at
    /// one-second granularity, for every chain to leave a live status. The
    /// scheduler fiber performs the final reap and the transition to
    /// `stopped` once its map is empty. A second call is a no-op.
    pub async fn stop(&self, finish_running_jobs: bool, timeout: u64) -> QueueOutcome {
        {
            let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
            if *status != QueueStatus::Running {
                return QueueOutcome {
                    success: true,
                    result: *status,
                    message: "JobQueue is not running.".to_string(),
                };
            }
            *status = if finish_running_jobs {
                QueueStatus::Stopping
            } else {
                QueueStatus::Terminating
            };
        }

        tracing::warn!(finish_running_jobs, timeout, "Stopping the JobQueue");

        if !finish_running_jobs {
            tracing::info!("Ordering task chains to terminate");

            let chains = self.live_chain_handles();
            let silo = self.silos.get(TASKS_SILO).await;

            for chain in chains {
                chain.terminate();
                if let Ok(silo) = &silo {
                    if let Err(e) = silo
                        .hset_field(
                            chain.redis_name(),
                            "status",
                            ChainStatus::Terminating.as_str(),
                        )
                        .await
                    {
                        tracing::error!(chain = %chain.redis_name(), error = %e, "Failed to mark chain terminating");
                    }
                }
            }
        }

        let deadline = Instant::now() + Duration::from_secs(timeout);
        let drained = loop {
            let live = self
                .tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .values()
                .any(|entry| entry.chain.status().is_live());

            if !live {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        };

        *self.stop_time.write().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());

        let message = if drained {
            tracing::info!("All task chains have completed");
            "All task chains have completed.".to_string()
        } else {
            tracing::error!("Timeout exceeded while waiting for task chains to complete");
            "Timeout exceeded while waiting for task chains to complete.".to_string()
        };

        QueueOutcome {
            success: drained,
            result: self.status(),
            message,
        }
    }

    /// Wait for the scheduler fiber to exit after a stop.
    pub async fn join_worker(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// The copy-on-read snapshot, with the primitive fields refreshed at
    /// read time.
    pub fn detailed_status(&self) -> DetailedStatus {
        let mut snapshot = self
            .snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        snapshot.status = self.status();
        snapshot.duration = self.duration();
        snapshot.stop_time = *self.stop_time.read().unwrap_or_else(|e| e.into_inner());
        snapshot
    }

    /// Progress record of one in-flight chain, by its reporting key.
    pub fn chain_status(&self, task_id: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .map(|entry| entry.chain.redis_struct())
    }

    /// Request termination of one in-flight chain. Returns false when the
    /// chain is not in flight.
    pub fn terminate_chain(&self, task_id: &str) -> bool {
        match self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
        {
            Some(entry) => {
                entry.chain.terminate();
                tracing::warn!(chain = %task_id, "Chain termination requested");
                true
            }
            None => false,
        }
    }

    fn live_chain_handles(&self) -> Vec<TaskChain> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|entry| entry.chain.clone())
            .collect()
    }

    fn in_flight(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Phase 1: timeout escalation and progress snapshots.
    async fn report_phase(&self, publish: bool) {
        let chains = self.live_chain_handles();
        if chains.is_empty() {
            return;
        }

        let silo = match self.silos.get(TASKS_SILO).await {
            Ok(silo) => silo,
            Err(e) => {
                tracing::error!(error = %e, "Reporting phase cannot reach the task silo");
                return;
            }
        };

        let now = Utc::now();

        for chain in chains {
            if let (Some(start), None) = (chain.start(), chain.end()) {
                let elapsed = (now - start).num_seconds();
                if elapsed >= self.config.chain_timeout_seconds as i64 && chain.status().is_live()
                {
                    tracing::warn!(
                        chain = %chain.redis_name(),
                        elapsed,
                        timeout = self.config.chain_timeout_seconds,
                        "Chain exceeded its timeout, requesting terminate"
                    );
                    chain.terminate();
                    metrics::counter!("agent.queue.chain_timeouts").increment(1);

                    if let Err(e) = silo
                        .hset_field(
                            chain.redis_name(),
                            "status",
                            ChainStatus::Terminating.as_str(),
                        )
                        .await
                    {
                        tracing::error!(chain = %chain.redis_name(), error = %e, "Failed to mark chain terminating");
                    }
                }
            }

            if publish {
                let mut record = chain.redis_struct();
                record.insert("agent".to_string(), json!(self.config.node_name));
                record.insert("updated".to_string(), json!(now.to_rfc3339()));

                if let Err(e) = silo
                    .hset_map(chain.redis_name(), &encode_hash(&record))
                    .await
                {
                    tracing::error!(chain = %chain.redis_name(), error = %e, "Error while reporting chain progress");
                } else {
                    tracing::debug!(chain = %chain.redis_name(), "progress: OK");
                }
            }
        }
    }

    /// Phase 2: pop and admit while there is capacity.
    async fn admit_phase(self: &Arc<Self>) {
        if self.in_flight() >= self.config.max_chains {
            return;
        }

        let queue_silo = match self.silos.get(TASK_QUEUE_SILO).await {
            Ok(silo) => silo,
            Err(e) => {
                tracing::error!(error = %e, "Admission phase cannot reach the task queue silo");
                return;
            }
        };
        let tasks_silo = match self.silos.get(TASKS_SILO).await {
            Ok(silo) => silo,
            Err(e) => {
                tracing::error!(error = %e, "Admission phase cannot reach the task silo");
                return;
            }
        };
        let results_silo = match self.silos.get(RESULTS_SILO).await {
            Ok(silo) => Some(silo),
            Err(e) => {
                tracing::warn!(error = %e, "Results silo unavailable, chains will not publish results");
                None
            }
        };

        while self.in_flight() < self.config.max_chains {
            let task = match self.pop_next(&queue_silo).await {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Queue poll failed");
                    break;
                }
            };

            self.admit(task, &tasks_silo, results_silo.clone()).await;
        }
    }

    /// Pop the next eligible task, strictly in configured priority order.
    /// A priority's list is drained of ineligible entries before any lower
    /// priority is considered; within a priority, order is the store's FIFO.
    pub async fn pop_next(&self, silo: &SiloClient) -> Result<Option<Task>> {
        for priority in &self.config.accepted_chain_priorities {
            let queue_key = format!("queue::{}", priority);

            while silo.llen(&queue_key).await? > 0 {
                let Some(name) = silo.rpop(&queue_key).await? else {
                    break;
                };

                match silo.hget(&name, "status").await? {
                    Some(status) if status == STATUS_ENQUEUED => {}
                    other => {
                        tracing::debug!(task = %name, status = ?other, "Skipping non-enqueued task");
                        continue;
                    }
                }

                let fields = silo.hgetall(&name).await?;
                if fields.is_empty() {
                    tracing::debug!(task = %name, "Task hash expired between pop and fetch, skipping");
                    continue;
                }

                match Task::from_fields(&fields) {
                    Ok(task) => {
                        tracing::debug!(task = %name, priority = *priority, "Retrieved task from the queue");
                        return Ok(Some(task));
                    }
                    Err(e) => {
                        tracing::error!(task = %name, error = %e, "Dropping undecodable task");
                        continue;
                    }
                }
            }
        }

        Ok(None)
    }

    async fn admit(
        self: &Arc<Self>,
        task: Task,
        tasks_silo: &SiloClient,
        results_silo: Option<SiloClient>,
    ) {
        let task_id = task.id.clone();

        let chain = match self.instantiate(&task, results_silo) {
            Ok(chain) => chain,
            Err(e) => {
                tracing::error!(task = %task_id, error = %e, "Error while adding task chain to the JobQueue");
                self.write_admission_error(&task_id, &e, tasks_silo).await;
                metrics::counter!("agent.queue.admission_errors").increment(1);
                return;
            }
        };

        let redis_name = chain.redis_name().to_string();

        let already_in_flight = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&redis_name);
        if already_in_flight {
            tracing::warn!(chain = %redis_name, "Task chain already in flight, skipping");
            return;
        }

        if let Err(e) = tasks_silo
            .hset_field(&redis_name, "status", ChainStatus::Initialized.as_str())
            .await
        {
            tracing::error!(chain = %redis_name, error = %e, "Failed to mark chain initialized");
        }

        let worker = {
            let chain = chain.clone();
            tokio::spawn(async move { chain.run().await })
        };

        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(redis_name.clone(), ChainEntry { chain, worker });

        if let Err(e) = tasks_silo
            .hset_field(&redis_name, "status", ChainStatus::Running.as_str())
            .await
        {
            tracing::error!(chain = %redis_name, error = %e, "Failed to mark chain running");
        }

        self.task_chains_processed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("agent.queue.chains_admitted").increment(1);
        tracing::info!(chain = %redis_name, "Task chain admitted");
    }

    fn instantiate(&self, task: &Task, results_silo: Option<SiloClient>) -> Result<TaskChain> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());

        let descriptor = registry.find(&task.category, &task.name).ok_or_else(|| {
            HarvestError::TemplateNotFound(format!(
                "{}: Task model `{}/{}` not found in the registry.",
                task.id, task.category, task.name
            ))
        })?;

        if let Some(kind) = self.restricted_kind(task, descriptor) {
            return Err(HarvestError::Chain(format!(
                "Task kind `{}` is restricted on this node",
                kind
            )));
        }

        // Clone is the deep copy here; the catalog entry stays pristine.
        let descriptor = descriptor.clone();
        drop(registry);

        TaskChain::instantiate(&descriptor, task, RESULTS_SILO, results_silo)
    }

    fn restricted_kind(&self, task: &Task, descriptor: &TemplateDescriptor) -> Option<String> {
        let restrictions = &self.config.chain_task_restrictions;
        if restrictions.is_empty() {
            return None;
        }
        if restrictions.contains(&task.name) {
            return Some(task.name.clone());
        }
        descriptor
            .task_kinds()
            .into_iter()
            .find(|kind| restrictions.contains(kind))
    }

    /// Synthetic error record for a task that could not be admitted. The
    /// record expires on its own; the task is not retried.
    async fn write_admission_error(
        &self,
        task_id: &str,
        error: &HarvestError,
        tasks_silo: &SiloClient,
    ) {
        let now = Utc::now().to_rfc3339();
        let record = json!({
            "id": task_id,
            "status": ChainStatus::Error.as_str(),
            "message": format!("Error when creating the TaskChain: {}", error),
            "end": now,
            "updated": now,
        });

        let record = record.as_object().cloned().unwrap_or_default();
        let write = async {
            tasks_silo.hset_map(task_id, &encode_hash(&record)).await?;
            tasks_silo.expire(task_id, ADMISSION_ERROR_TTL).await
        };

        if let Err(e) = write.await {
            tracing::error!(task = %task_id, error = %e, "Failed to record admission error");
        }
    }

    /// Phase 3: remove entries whose worker has exited, writing their final
    /// status. When the silo is unreachable the entries are left in place
    /// for the next cycle.
    async fn reap_phase(&self) {
        let any_finished = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|entry| entry.worker.is_finished());
        if !any_finished {
            return;
        }

        let silo = match self.silos.get(TASKS_SILO).await {
            Ok(silo) => silo,
            Err(e) => {
                tracing::error!(error = %e, "Reaping deferred, task silo unreachable");
                return;
            }
        };

        let finished: Vec<(String, TaskChain)> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            let names: Vec<String> = tasks
                .iter()
                .filter(|(_, entry)| entry.worker.is_finished())
                .map(|(name, _)| name.clone())
                .collect();
            names
                .into_iter()
                .filter_map(|name| tasks.remove(&name).map(|entry| (name, entry.chain)))
                .collect()
        };

        for (name, chain) in finished {
            let status = chain.status();
            if let Err(e) = silo.hset_field(&name, "status", status.as_str()).await {
                tracing::error!(chain = %name, error = %e, "Failed to record final chain status");
            }
            metrics::counter!("agent.queue.chains_reaped").increment(1);
            tracing::info!(chain = %name, status = %status, "Reaped task chain");
        }
    }

    /// Rebuild the cross-fiber snapshot from the live map. Scheduler-only.
    fn update_snapshot(&self) {
        let mut histogram = empty_histogram();
        let total = {
            let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            for entry in tasks.values() {
                if let Some(count) = histogram.get_mut(entry.chain.status().as_str()) {
                    *count += 1;
                }
            }
            tasks.len()
        };

        metrics::gauge!("agent.queue.active_chains").set(total as f64);

        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = DetailedStatus {
            chain_status: histogram,
            duration: self.duration(),
            max_chains: self.config.max_chains,
            start_time: self.start_time,
            status: self.status(),
            stop_time: *self.stop_time.read().unwrap_or_else(|e| e.into_inner()),
            total_chains_in_queue: total,
        };
    }
}

fn empty_histogram() -> BTreeMap<String, usize> {
    ChainStatus::ALL
        .iter()
        .map(|status| (status.as_str().to_string(), 0))
        .collect()
}

/// The scheduler fiber. Each cycle runs report, admit, reap in that order,
/// then sleeps the check interval. While stopping or terminating it keeps
/// reporting and reaping until the map drains, then marks the queue stopped
/// and exits.
async fn worker_loop(queue: Arc<JobQueue>) {
    let interval = Duration::from_secs(queue.config.queue_check_interval_seconds);
    let reporting = Duration::from_secs(queue.config.reporting_interval_seconds);
    let mut last_report: Option<Instant> = None;

    tracing::info!(
        priorities = ?queue.config.accepted_chain_priorities,
        max_chains = queue.config.max_chains,
        "JobQueue scheduler started"
    );

    loop {
        match queue.status() {
            QueueStatus::Running => {
                let publish = last_report.is_none_or(|at| at.elapsed() >= reporting);
                queue.report_phase(publish).await;
                if publish {
                    last_report = Some(Instant::now());
                }

                queue.admit_phase().await;
                queue.reap_phase().await;
            }
            QueueStatus::Stopping | QueueStatus::Terminating => {
                queue.report_phase(true).await;
                queue.reap_phase().await;

                if queue.in_flight() == 0 {
                    queue.set_status(QueueStatus::Stopped);
                    queue.update_snapshot();
                    tracing::info!("JobQueue stopped");
                    break;
                }
            }
            _ => break,
        }

        queue.update_snapshot();
        tokio::time::sleep(interval).await;
    }
}
