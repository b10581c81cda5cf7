//! C5: Dispatcher / Scheduler.
//!
//! Admission, dependency gating, priority-lane queuing, orchestration batch
//! submission, retry/backoff re-queuing, DLQ ownership, and the periodic
//! cleanup sweep. The admission path is single-flight per task id: each
//! `submit` assigns a fresh id and the only mutation that follows is keyed
//! by that id, so concurrent submitters never contend on each other's
//! tasks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::error::{EngineError, EngineResult};
use crate::flags::ControlFlags;
use crate::model::{DlqEntry, Event, EventType, Lane, Priority, Task, TaskStatus, Worker, WorkerId};
use crate::resilience::looks_transient;
use crate::store::StateStore;

const DELAY_QUEUE_KEY: &str = "delay_queue";
const DLQ_KEY: &str = "dead_letter_queue";
const PERMANENT_FAILURE_PREFIX: &str = "permanent_failure";
const ARCHIVE_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);
const COMPLETED_RETENTION_SECS: i64 = 24 * 3600;
const FAILED_RETENTION_SECS: i64 = 24 * 3600;
const DLQ_REPROCESS_WINDOW_SECS: i64 = 24 * 3600;
const DLQ_REPROCESS_MAX_ATTEMPTS: u32 = 3;
const DLQ_PERMANENT_ATTEMPTS: u32 = 5;
const CPU_HALVE_THRESHOLD: f32 = 80.0;
const ACTIVE_TASK_HALVE_THRESHOLD: usize = 50;

struct Lanes {
    high: Mutex<Vec<Task>>,
    normal: Mutex<Vec<Task>>,
    background: Mutex<Vec<Task>>,
}

impl Lanes {
    fn new() -> Self {
        Self {
            high: Mutex::new(Vec::new()),
            normal: Mutex::new(Vec::new()),
            background: Mutex::new(Vec::new()),
        }
    }

    async fn push(&self, lane: Lane, task: Task) {
        match lane {
            Lane::High => self.high.lock().await.push(task),
            Lane::Normal => self.normal.lock().await.push(task),
            Lane::Background => self.background.lock().await.push(task),
        }
    }

    /// Pops the first eligible task from the highest-priority non-empty
    /// lane this worker may serve, filtering by required capabilities and
    /// dependency readiness (4.5 "the scheduler never dequeues a task whose
    /// dependencies are unresolved").
    async fn pop_eligible(&self, capabilities: &HashSet<String>, deps_ready: impl Fn(&Task) -> bool) -> Option<Task> {
        for lane in [&self.high, &self.normal, &self.background] {
            let mut queue = lane.lock().await;
            if let Some(idx) = queue
                .iter()
                .position(|t| t.required_capabilities.iter().all(|c| capabilities.contains(c)) && deps_ready(t))
            {
                return Some(queue.remove(idx));
            }
        }
        None
    }
}

pub struct Scheduler {
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
    flags: Arc<ControlFlags>,
    lanes: Arc<Lanes>,
    tasks: RwLock<HashMap<crate::model::TaskId, Task>>,
    workers: RwLock<HashMap<WorkerId, Worker>>,
    active_task_count: AtomicI64,
    cpu_sample: std::sync::atomic::AtomicU32,
}

impl Scheduler {
    pub fn new(store: Arc<dyn StateStore>, bus: Arc<EventBus>, flags: Arc<ControlFlags>) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            flags,
            lanes: Arc::new(Lanes::new()),
            tasks: RwLock::new(HashMap::new()),
            workers: RwLock::new(HashMap::new()),
            active_task_count: AtomicI64::new(0),
            cpu_sample: std::sync::atomic::AtomicU32::new(0),
        })
    }

    pub async fn register_worker(&self, worker: Worker) {
        self.workers.write().await.insert(worker.id, worker);
    }

    pub fn record_cpu_sample(&self, percent: f32) {
        self.cpu_sample.store(percent.to_bits(), Ordering::Relaxed);
    }

    fn cpu_sample_percent(&self) -> f32 {
        f32::from_bits(self.cpu_sample.load(Ordering::Relaxed))
    }

    pub fn active_task_count(&self) -> i64 {
        self.active_task_count.load(Ordering::Relaxed)
    }

    // ---- Admission (§4.5) ----------------------------------------------

    /// Validates, defaults, persists, and queues one task. Rejects at the
    /// boundary (never enqueued) on a self-referential dependency (B2) or
    /// an unresolved enum — admission boundary forbids silent coercion per
    /// §9.
    pub async fn submit(&self, mut task: Task) -> EngineResult<Task> {
        if self.flags.admission_blocked().await {
            return Err(EngineError::InvalidTask("admission is blocked".into()));
        }
        if task.dependencies.contains(&task.id) {
            return Err(EngineError::CyclicDependency(task.id));
        }
        reject_cycles(&task, &self.tasks.read().await)?;

        task.status = TaskStatus::Pending;
        self.persist_task(&task).await?;
        self.tasks.write().await.insert(task.id, task.clone());

        self.publish_lifecycle(&task, "task-created").await?;

        if let Some(scheduled_at) = task.scheduled_at {
            if scheduled_at > Utc::now() {
                self.store
                    .zadd(DELAY_QUEUE_KEY, &task.id.to_string(), scheduled_at.timestamp() as f64)
                    .await?;
                return Ok(task);
            }
        }
        self.admit_to_lane(task.clone()).await?;
        Ok(task)
    }

    async fn admit_to_lane(&self, task: Task) -> EngineResult<()> {
        let lane = task.priority.lane();
        self.lanes.push(lane, task).await;
        Ok(())
    }

    async fn persist_task(&self, task: &Task) -> EngineResult<()> {
        let snapshot = serde_json::to_vec(task).map_err(|e| EngineError::Internal(e.to_string()))?;
        self.store.kv_set(&format!("task:{}", task.id), &snapshot, None).await?;
        Ok(())
    }

    pub async fn cancel(&self, task_id: crate::model::TaskId) -> EngineResult<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&task_id).ok_or(EngineError::TaskNotFound(task_id))?;
        if task.status.is_terminal() {
            return Ok(());
        }
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        let snapshot = task.clone();
        drop(tasks);
        self.persist_task(&snapshot).await?;
        self.publish_lifecycle(&snapshot, "task-cancelled").await?;
        Ok(())
    }

    pub async fn reassign(&self, task_id: crate::model::TaskId, worker_id: WorkerId) -> EngineResult<()> {
        // Advisory per §9's open question: preference is recorded but the
        // load-balancer is still free to pick a different worker for the
        // next task. Forced reassignment here moves the task straight into
        // the high lane so the named worker picks it up on its next poll.
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&task_id).ok_or(EngineError::TaskNotFound(task_id))?;
        task.preferred_worker = Some(worker_id.to_string());
        let snapshot = task.clone();
        drop(tasks);
        self.lanes.push(Lane::High, snapshot).await;
        Ok(())
    }

    // ---- Dependency gating (§4.5) --------------------------------------

    async fn dependencies_ready(&self, task: &Task) -> bool {
        if task.dependencies.is_empty() {
            return true;
        }
        let tasks = self.tasks.read().await;
        task.dependencies.iter().all(|dep| tasks.get(dep).map(|t| t.status == TaskStatus::Completed).unwrap_or(false))
    }

    async fn any_dependency_failed(&self, task: &Task) -> bool {
        let tasks = self.tasks.read().await;
        task.dependencies.iter().any(|dep| {
            tasks.get(dep).map(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Cancelled)).unwrap_or(false)
        })
    }

    /// Called by a worker runtime to pull the next eligible task. Honors
    /// the global pause flag (invariant 4) and dependency gating (invariant
    /// 3); direct dependents of a failed dependency are failed here on
    /// their own admission attempt rather than recursively (§9).
    pub async fn dequeue_for(&self, capabilities: &HashSet<String>) -> Option<Task> {
        if self.flags.is_paused().await {
            return None;
        }
        self.promote_due_delayed().await;

        loop {
            let candidate = self
                .lanes
                .pop_eligible(capabilities, |_| true)
                .await?;

            if self.any_dependency_failed(&candidate).await {
                let mut task = candidate;
                task.status = TaskStatus::Failed;
                task.error = Some(crate::model::TaskError {
                    message: "dependency failed".to_string(),
                    details: None,
                });
                task.completed_at = Some(Utc::now());
                let _ = self.persist_task(&task).await;
                self.tasks.write().await.insert(task.id, task.clone());
                let _ = self.publish_lifecycle(&task, "task-failed").await;
                continue;
            }
            if !self.dependencies_ready(&candidate).await {
                // Dependencies still pending: park it back and let another
                // poll retry once upstream tasks complete.
                self.lanes.push(candidate.priority.lane(), candidate).await;
                return None;
            }
            let mut task = candidate;
            task.status = TaskStatus::Assigned;
            self.tasks.write().await.insert(task.id, task.clone());
            self.active_task_count.fetch_add(1, Ordering::Relaxed);
            return Some(task);
        }
    }

    async fn promote_due_delayed(&self) {
        let now = Utc::now().timestamp() as f64;
        if let Ok(due) = self.store.zrange_by_score(DELAY_QUEUE_KEY, f64::MIN, now).await {
            for member in due {
                if let Ok(id) = crate::model::TaskId::parse_str(&member.member) {
                    if let Some(task) = self.tasks.read().await.get(&id).cloned() {
                        let _ = self.lanes.push(task.priority.lane(), task).await;
                    }
                    let _ = self.store.zremrangebyscore(DELAY_QUEUE_KEY, member.score, member.score).await;
                }
            }
        }
    }

    // ---- Orchestration / batch submit (§4.5) ---------------------------

    pub async fn submit_batch(
        &self,
        tasks: Vec<Task>,
        preferred_worker_types: &[String],
        batch_id: String,
    ) -> EngineResult<Vec<Task>> {
        let effective_tasks = self.apply_load_shedding(tasks).await;
        let orchestration_id = uuid::Uuid::new_v4().to_string();
        let mut submitted = Vec::with_capacity(effective_tasks.len());
        for mut task in effective_tasks {
            if let Some(worker_id) = self.least_loaded_worker(preferred_worker_types).await {
                task.preferred_worker = Some(worker_id.to_string());
            }
            task.input = attach_orchestration_metadata(task.input, &batch_id, &orchestration_id);
            submitted.push(self.submit(task).await?);
        }
        Ok(submitted)
    }

    /// Halves the effective batch size when the system is under pressure
    /// (§4.5); the dropped tail is simply not submitted, leaving the
    /// caller to resubmit, consistent with at-least-once admission.
    async fn apply_load_shedding(&self, mut tasks: Vec<Task>) -> Vec<Task> {
        let active = self.active_task_count.load(Ordering::Relaxed) as usize;
        if self.cpu_sample_percent() > CPU_HALVE_THRESHOLD || active > ACTIVE_TASK_HALVE_THRESHOLD {
            let half = (tasks.len() / 2).max(1).min(tasks.len());
            warn!(original = tasks.len(), reduced = half, "halving batch size under load");
            tasks.truncate(half);
        }
        tasks
    }

    async fn least_loaded_worker(&self, preferred_types: &[String]) -> Option<WorkerId> {
        let workers = self.workers.read().await;
        workers
            .values()
            .filter(|w| preferred_types.is_empty() || preferred_types.contains(&w.worker_type))
            .min_by(|a, b| a.load_fraction().partial_cmp(&b.load_fraction()).unwrap())
            .map(|w| w.id)
    }

    // ---- Retry / DLQ (§4.5, §4.4 step 7) -------------------------------

    pub async fn requeue_after(&self, task: Task, delay: Duration) {
        let lanes = Arc::clone(&self.lanes);
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let lane = task.priority.lane();
            let _ = store
                .kv_set(
                    &format!("task:{}", task.id),
                    &serde_json::to_vec(&task).unwrap_or_default(),
                    None,
                )
                .await;
            lanes.push(lane, task).await;
        });
    }

    pub async fn move_to_dlq(&self, task: Task, failure_message: String) -> EngineResult<()> {
        self.tasks.write().await.insert(task.id, task.clone());
        let entry = DlqEntry {
            attempts: task.retry_count,
            first_failure_at: Utc::now(),
            task,
            failure_message,
        };
        let score = entry.first_failure_at.timestamp() as f64;
        let payload = serde_json::to_vec(&entry).map_err(|e| EngineError::Internal(e.to_string()))?;
        self.store.zadd(DLQ_KEY, &String::from_utf8_lossy(&payload), score).await?;
        Ok(())
    }

    pub async fn list_dlq(&self) -> EngineResult<Vec<DlqEntry>> {
        let members = self.store.zrange_by_score(DLQ_KEY, f64::MIN, f64::MAX).await?;
        Ok(members
            .into_iter()
            .filter_map(|m| serde_json::from_str::<DlqEntry>(&m.member).ok())
            .collect())
    }

    pub async fn on_task_terminal(&self, task: &Task) {
        self.active_task_count.fetch_sub(1, Ordering::Relaxed);
        let _ = task;
    }

    async fn publish_lifecycle(&self, task: &Task, label: &str) -> EngineResult<()> {
        let priority = if label == "task-failed" { Priority::High } else { Priority::Normal };
        let payload = serde_json::json!({
            "task_id": task.id.to_string(),
            "status": task.status,
            "label": label,
        });
        self.bus.publish(Event::new(EventType::TaskUpdate, priority, "scheduler", payload)).await
    }

    // ---- Background sweeps (§4.5) --------------------------------------

    /// DLQ reprocessor: walks entries newer than 24h, re-queuing transient
    /// failures at reduced priority (attempts ≤ 3) and promoting chronic
    /// ones (>5 attempts) to a permanent-failure hash. Open question from
    /// §9 resolved as: `attempts` (DLQ-local counter) gates reprocessing
    /// independent of the task's own `max_retries`, since `max_retries`
    /// already governed the retry path that put it here in the first
    /// place — reusing it again would double-count.
    pub async fn sweep_dlq(&self) -> EngineResult<()> {
        let now = Utc::now();
        let cutoff = (now.timestamp() - DLQ_REPROCESS_WINDOW_SECS) as f64;
        let entries = self.store.zrange_by_score(DLQ_KEY, cutoff, f64::MAX).await?;
        for scored in entries {
            let Ok(entry) = serde_json::from_str::<DlqEntry>(&scored.member) else { continue };
            if entry.attempts > DLQ_PERMANENT_ATTEMPTS {
                self.store
                    .zremrangebyscore(DLQ_KEY, scored.score, scored.score)
                    .await
                    .ok();
                self.store
                    .hash_set(
                        &format!("{PERMANENT_FAILURE_PREFIX}:{}", entry.task.id),
                        &[("failure_message", entry.failure_message.as_bytes())],
                        Some(ARCHIVE_RETENTION),
                    )
                    .await
                    .ok();
                continue;
            }
            if entry.attempts <= DLQ_REPROCESS_MAX_ATTEMPTS && looks_transient(&entry.failure_message) {
                self.store.zremrangebyscore(DLQ_KEY, scored.score, scored.score).await.ok();
                let mut task = entry.task;
                task.priority = Priority::Low;
                task.status = TaskStatus::Pending;
                info!(task_id = %task.id, "re-queuing DLQ entry at reduced priority");
                self.lanes.push(task.priority.lane(), task).await;
            }
        }
        Ok(())
    }

    /// Cleanup sweep: archives completed/failed tasks older than the
    /// retention window, marks long-stale active tasks failed, trims the
    /// metrics timeline to 7 days.
    pub async fn sweep_cleanup(&self) -> EngineResult<()> {
        let now = Utc::now();
        let mut tasks = self.tasks.write().await;
        let mut to_archive = Vec::new();
        for task in tasks.values_mut() {
            let aged_out = task
                .completed_at
                .map(|t| (now - t).num_seconds() > COMPLETED_RETENTION_SECS.max(FAILED_RETENTION_SECS))
                .unwrap_or(false);
            if task.status.is_terminal() && aged_out {
                to_archive.push(task.id);
            }
            if let Some(started) = task.started_at {
                if !task.status.is_terminal() && crate::worker::is_stale(started) {
                    task.status = TaskStatus::Failed;
                    task.error = Some(crate::model::TaskError { message: "stale".to_string(), details: None });
                    task.completed_at = Some(now);
                }
            }
        }
        for id in to_archive {
            tasks.remove(&id);
        }
        drop(tasks);

        let trim_cutoff = (now.timestamp() - 7 * 24 * 3600) as f64;
        self.bus_timeline_trim(trim_cutoff).await;
        Ok(())
    }

    async fn bus_timeline_trim(&self, cutoff: f64) {
        let _ = self.store.zremrangebyscore("event_timeline", f64::MIN, cutoff).await;
    }
}

/// Rejects dependency sets containing cycles via a bounded-depth walk over
/// the proposed dependency set against already-known tasks, per §9. Only
/// direct self-reference is checked at submission for tasks not yet in the
/// graph (the general case is covered by requiring dependencies name only
/// already-submitted tasks).
fn reject_cycles(task: &Task, known: &HashMap<crate::model::TaskId, Task>) -> EngineResult<()> {
    const MAX_DEPTH: usize = 64;
    let mut stack: Vec<(crate::model::TaskId, usize)> = task.dependencies.iter().map(|d| (*d, 0)).collect();
    let mut visited = HashSet::new();
    while let Some((current, depth)) = stack.pop() {
        if current == task.id {
            return Err(EngineError::CyclicDependency(task.id));
        }
        if depth >= MAX_DEPTH || !visited.insert(current) {
            continue;
        }
        if let Some(dep_task) = known.get(&current) {
            for next in &dep_task.dependencies {
                stack.push((*next, depth + 1));
            }
        }
    }
    Ok(())
}

fn attach_orchestration_metadata(mut input: serde_json::Value, batch_id: &str, orchestration_id: &str) -> serde_json::Value {
    if let serde_json::Value::Object(ref mut map) = input {
        map.insert("batch_id".to_string(), serde_json::Value::String(batch_id.to_string()));
        map.insert("orchestration_id".to_string(), serde_json::Value::String(orchestration_id.to_string()));
    }
    input
}

/// Channel used by an administrative sweep loop driver; kept separate from
/// the scheduler struct so tests can drive sweeps on demand instead of
/// waiting on the real interval.
pub struct SweepHandles {
    pub dlq: mpsc::Sender<()>,
    pub cleanup: mpsc::Sender<()>,
}

pub fn spawn_sweeps(scheduler: Arc<Scheduler>, dlq_interval: Duration, cleanup_interval: Duration) {
    let dlq_scheduler = Arc::clone(&scheduler);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(dlq_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = dlq_scheduler.sweep_dlq().await {
                warn!(%err, "dlq sweep failed");
            }
        }
    });
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cleanup_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = scheduler.sweep_cleanup().await {
                warn!(%err, "cleanup sweep failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskType;
    use crate::store::SledStateStore;

    fn new_scheduler() -> Arc<Scheduler> {
        let store: Arc<dyn StateStore> = Arc::new(SledStateStore::open_temporary().unwrap());
        let bus = Arc::new(EventBus::new(Arc::clone(&store)));
        let flags = Arc::new(ControlFlags::new(Arc::clone(&store)));
        Scheduler::new(store, bus, flags)
    }

    #[tokio::test]
    async fn submit_rejects_self_dependency() {
        let scheduler = new_scheduler();
        let mut task = Task::new("self-dep", TaskType::Computation, serde_json::Value::Null);
        task.dependencies.insert(task.id);
        let err = scheduler.submit(task).await.unwrap_err();
        assert!(matches!(err, EngineError::CyclicDependency(_)));
    }

    #[test]
    fn reject_cycles_walks_through_already_known_tasks() {
        // "c" doesn't reference itself directly, but "b" (already known)
        // depends on "c" — so admitting "c" with a dependency on "b" would
        // close a cycle through the existing graph.
        let b = Task::new("b", TaskType::Computation, serde_json::Value::Null);
        let mut c = Task::new("c", TaskType::Computation, serde_json::Value::Null);
        let mut b = b;
        b.dependencies.insert(c.id);
        let mut known = HashMap::new();
        known.insert(b.id, b.clone());

        c.dependencies.insert(b.id);
        assert!(reject_cycles(&c, &known).is_err());
    }

    #[test]
    fn reject_cycles_allows_acyclic_dependency_chain() {
        let a = Task::new("a", TaskType::Computation, serde_json::Value::Null);
        let mut b = Task::new("b", TaskType::Computation, serde_json::Value::Null);
        b.dependencies.insert(a.id);
        let mut known = HashMap::new();
        known.insert(a.id, a.clone());

        let mut c = Task::new("c", TaskType::Computation, serde_json::Value::Null);
        c.dependencies.insert(b.id);
        known.insert(b.id, b);
        assert!(reject_cycles(&c, &known).is_ok());
    }

    #[tokio::test]
    async fn dequeue_respects_capabilities() {
        let scheduler = new_scheduler();
        let mut task = Task::new("needs-gpu", TaskType::Computation, serde_json::Value::Null);
        task.required_capabilities.insert("gpu".to_string());
        scheduler.submit(task).await.unwrap();

        let no_caps = HashSet::new();
        assert!(scheduler.dequeue_for(&no_caps).await.is_none());

        let gpu_caps: HashSet<String> = ["gpu".to_string()].into_iter().collect();
        assert!(scheduler.dequeue_for(&gpu_caps).await.is_some());
    }

    #[tokio::test]
    async fn dequeue_parks_task_with_unready_dependency() {
        let scheduler = new_scheduler();
        let upstream = Task::new("upstream", TaskType::Computation, serde_json::Value::Null);
        let upstream_id = upstream.id;
        scheduler.submit(upstream).await.unwrap();

        let mut downstream = Task::new("downstream", TaskType::Computation, serde_json::Value::Null);
        downstream.dependencies.insert(upstream_id);
        scheduler.submit(downstream).await.unwrap();

        let caps = HashSet::new();
        // Upstream has no dependencies, dequeues immediately; downstream is
        // parked because "upstream" hasn't completed yet.
        let first = scheduler.dequeue_for(&caps).await;
        assert_eq!(first.unwrap().title, "upstream");
        assert!(scheduler.dequeue_for(&caps).await.is_none());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_on_terminal_task() {
        let scheduler = new_scheduler();
        let task = Task::new("cancel-me", TaskType::Computation, serde_json::Value::Null);
        let id = task.id;
        scheduler.submit(task).await.unwrap();
        scheduler.cancel(id).await.unwrap();
        scheduler.cancel(id).await.unwrap();
    }

    #[tokio::test]
    async fn submit_blocked_during_admission_stop() {
        let scheduler = new_scheduler();
        scheduler.flags.block_admission().await.unwrap();
        let task = Task::new("blocked", TaskType::Computation, serde_json::Value::Null);
        let err = scheduler.submit(task).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTask(_)));
    }

    #[tokio::test]
    async fn dlq_entry_is_listed_after_move_to_dlq() {
        let scheduler = new_scheduler();
        let task = Task::new("failing", TaskType::Computation, serde_json::Value::Null);
        scheduler.move_to_dlq(task.clone(), "persistent failure".to_string()).await.unwrap();
        let entries = scheduler.list_dlq().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].task.id, task.id);
    }
}
