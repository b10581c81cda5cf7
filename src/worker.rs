//! C4: Worker Runtime.
//!
//! One scheduling loop per registered worker. Pulls a task off the
//! highest-priority lane it serves, steps it to completion, failure, or
//! retry, and renews liveness independently of step cadence. The loop itself
//! is the cooperative single-owner pattern from §5: one execution flow owns
//! the task's mutable progress; the scheduler and store are reached only
//! through their async contracts.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::error::EngineResult;
use crate::flags::ControlFlags;
use crate::model::{Event, EventType, Priority, Task, TaskStatus, Worker, WorkerId, WorkerStatus};
use crate::resilience::{looks_transient, RetryPolicy};
use crate::scheduler::Scheduler;
use crate::store::StateStore;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const ACTIVE_TASK_TTL: Duration = Duration::from_secs(2 * 60 * 60);
const MIN_STEPS: u32 = 5;
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A single processing step's outcome, as reported by the workload. The
/// engine has no opinion on what a "step" computes; the workload is an
/// external collaborator reached through this trait per §1.
#[derive(Debug)]
pub enum StepOutcome {
    Progressed { tokens: u64, cost_usd: f64 },
    TransientError(String),
    FatalError(String),
}

#[async_trait::async_trait]
pub trait Workload: Send + Sync {
    async fn run_step(&self, task: &Task, step: u32, total_steps: u32) -> StepOutcome;
}

/// Deterministic simulated workload used in development and tests: always
/// progresses, never errors. A thin stand-in for the real inference
/// connectors this crate's Non-goals place out of scope.
pub struct SimulatedWorkload;

#[async_trait::async_trait]
impl Workload for SimulatedWorkload {
    async fn run_step(&self, _task: &Task, step: u32, total_steps: u32) -> StepOutcome {
        StepOutcome::Progressed {
            tokens: 50 + (step as u64 * 10),
            cost_usd: 0.0002 * (step as f64 + 1.0) / total_steps.max(1) as f64,
        }
    }
}

pub struct WorkerRuntime {
    pub worker: RwLock<Worker>,
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
    scheduler: Arc<Scheduler>,
    flags: Arc<ControlFlags>,
    workload: Arc<dyn Workload>,
    retry_policy: RetryPolicy,
    shutdown: AtomicBool,
    active_count: AtomicU32,
}

impl WorkerRuntime {
    pub fn new(
        worker: Worker,
        store: Arc<dyn StateStore>,
        bus: Arc<EventBus>,
        scheduler: Arc<Scheduler>,
        flags: Arc<ControlFlags>,
        workload: Arc<dyn Workload>,
        retry_base_delay_secs: u64,
    ) -> Arc<Self> {
        let mut retry_policy = RetryPolicy::default();
        if let crate::resilience::BackoffStrategy::Exponential { ref mut base_ms, .. } = retry_policy.backoff {
            *base_ms = retry_base_delay_secs * 1000;
        }
        Arc::new(Self {
            worker: RwLock::new(worker),
            store,
            bus,
            scheduler,
            flags,
            workload,
            retry_policy,
            shutdown: AtomicBool::new(false),
            active_count: AtomicU32::new(0),
        })
    }

    pub async fn id(&self) -> WorkerId {
        self.worker.read().await.id
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Spawns the heartbeat tick and the task-pulling loop as independent
    /// tasks under the same runtime, matching §4.4's "independent of step
    /// cadence" requirement.
    pub fn spawn(self: &Arc<Self>) {
        let hb = Arc::clone(self);
        tokio::spawn(async move { hb.heartbeat_loop().await });
        let main = Arc::clone(self);
        tokio::spawn(async move { main.run_loop().await });
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            ticker.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            if let Err(err) = self.emit_heartbeat().await {
                warn!(%err, "heartbeat emission failed");
            }
        }
    }

    async fn emit_heartbeat(&self) -> EngineResult<()> {
        let mut w = self.worker.write().await;
        w.last_heartbeat = Utc::now();
        let id = w.id;
        let status = w.status;
        let usage = w.resource_usage.clone();
        let active = self.active_count.load(Ordering::Relaxed);
        drop(w);

        self.store
            .kv_set(
                &format!("worker_heartbeat:{id}"),
                &Utc::now().timestamp().to_be_bytes(),
                Some(HEARTBEAT_INTERVAL * 6),
            )
            .await?;

        let payload = serde_json::json!({
            "worker_id": id.to_string(),
            "status": status,
            "active_task_count": active,
            "cpu_percent": usage.cpu_percent,
            "memory_mb": usage.memory_mb,
        });
        self.bus
            .publish(Event::new(EventType::Heartbeat, Priority::Low, id.to_string(), payload))
            .await
    }

    /// One worker's scheduling loop, per §4.4 steps 1-7.
    async fn run_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            if self.flags.is_paused().await {
                tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
                continue;
            }

            let capabilities = self.worker.read().await.capabilities.clone();
            let Some(task) = self.scheduler.dequeue_for(&capabilities).await else {
                tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
                continue;
            };

            self.active_count.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = self.process_task(task).await {
                error!(%err, "task processing failed unexpectedly");
            }
            self.active_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    async fn process_task(self: &Arc<Self>, mut task: Task) -> EngineResult<()> {
        let worker_id = self.id().await;
        self.mark_load(1).await;

        task.status = TaskStatus::Assigned;
        task.started_at = Some(Utc::now());
        self.record_active(&task, worker_id).await?;

        task.status = TaskStatus::Running;
        self.publish_task_update(&task, "running").await?;

        let total_steps = step_count(&task, self.worker.read().await.speed_multiplier);
        let mut tokens_so_far: u64 = 0;
        let mut cost_so_far: f64 = 0.0;

        for step in 1..=total_steps {
            if self.flags.is_paused().await {
                loop {
                    tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
                    if !self.flags.is_paused().await {
                        break;
                    }
                }
            }

            let outcome = self.workload.run_step(&task, step, total_steps).await;
            match outcome {
                StepOutcome::Progressed { tokens, cost_usd } => {
                    tokens_so_far += tokens;
                    cost_so_far += cost_usd;
                    task.progress = ((step as f64 / total_steps as f64) * 100.0) as u8;
                    task.tokens_used = tokens_so_far;
                    task.cost_usd = cost_so_far;
                    self.publish_progress(&task, step, total_steps).await?;

                    let rate = self.flags.throttle_rate().await;
                    let step_delay = simulated_step_delay(&task).mul_f64(1.0 / rate);
                    tokio::time::sleep(step_delay).await;
                }
                StepOutcome::TransientError(message) | StepOutcome::FatalError(message) => {
                    self.mark_load(-1).await;
                    return self.handle_failure(task, worker_id, message).await;
                }
            }
        }

        self.mark_load(-1).await;
        self.complete_task(task, worker_id).await
    }

    async fn handle_failure(&self, mut task: Task, worker_id: WorkerId, message: String) -> EngineResult<()> {
        task.retry_count += 1;
        task.error = Some(crate::model::TaskError { message: message.clone(), details: None });

        self.store.kv_delete(&format!("active_tasks:{}", task.id)).await.ok();

        if task.retry_count <= task.max_retries {
            task.status = TaskStatus::Retry;
            task.progress = 0;
            let delay = self.retry_policy.delay_for_attempt(task.retry_count);
            info!(task_id = %task.id, attempt = task.retry_count, delay_ms = delay.as_millis() as u64, "retrying task");
            self.publish_task_update(&task, "task-retry").await?;
            self.scheduler.requeue_after(task, delay).await;
        } else {
            task.status = TaskStatus::Failed;
            warn!(task_id = %task.id, %message, "task exhausted retries, moving to DLQ");
            self.publish_task_update(&task, "task-failed").await?;
            self.scheduler.move_to_dlq(task, message).await?;
        }
        let _ = worker_id;
        Ok(())
    }

    async fn complete_task(&self, mut task: Task, worker_id: WorkerId) -> EngineResult<()> {
        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        task.progress = 100;

        self.store.kv_delete(&format!("active_tasks:{}", task.id)).await.ok();
        self.store
            .hash_set(
                &format!("completed_tasks:{}", task.id),
                &[("status", b"completed" as &[u8])],
                Some(Duration::from_secs(24 * 3600)),
            )
            .await
            .ok();

        info!(task_id = %task.id, tokens = task.tokens_used, cost = task.cost_usd, "task completed");
        self.publish_task_update(&task, "task-completed").await?;
        self.scheduler.on_task_terminal(&task).await;
        let _ = worker_id;
        Ok(())
    }

    async fn record_active(&self, task: &Task, worker_id: WorkerId) -> EngineResult<()> {
        let snapshot = serde_json::to_vec(task).map_err(|e| crate::error::EngineError::Internal(e.to_string()))?;
        self.store
            .kv_set(&format!("active_tasks:{}", task.id), &snapshot, Some(ACTIVE_TASK_TTL))
            .await?;
        self.store
            .hash_set(
                &format!("active_tasks:{}", task.id),
                &[
                    ("agent_type", task.task_type_label().as_bytes()),
                    ("worker_id", worker_id.to_string().as_bytes()),
                    ("status", b"assigned"),
                ],
                Some(ACTIVE_TASK_TTL),
            )
            .await?;
        Ok(())
    }

    async fn mark_load(&self, delta: i32) {
        let mut w = self.worker.write().await;
        if delta > 0 {
            w.current_load += delta as u32;
            w.status = WorkerStatus::Working;
        } else {
            w.current_load = w.current_load.saturating_sub((-delta) as u32);
            if w.current_load == 0 {
                w.status = WorkerStatus::Idle;
            }
        }
    }

    async fn publish_task_update(&self, task: &Task, label: &str) -> EngineResult<()> {
        let payload = serde_json::json!({
            "task_id": task.id.to_string(),
            "status": task.status,
            "label": label,
            "progress": task.progress,
            "retry_count": task.retry_count,
            "error": task.error,
        });
        let priority = if task.status == TaskStatus::Failed { Priority::High } else { Priority::Normal };
        self.bus
            .publish(Event::new(EventType::TaskUpdate, priority, "worker-runtime", payload))
            .await
    }

    async fn publish_progress(&self, task: &Task, step: u32, total_steps: u32) -> EngineResult<()> {
        let payload = serde_json::json!({
            "task_id": task.id.to_string(),
            "progress": task.progress,
            "step": step,
            "total_steps": total_steps,
            "tokens_used": task.tokens_used,
            "cost_usd": task.cost_usd,
            "status": "running",
        });
        self.bus
            .publish(Event::new(EventType::TaskUpdate, Priority::Low, "worker-runtime", payload))
            .await
    }
}

/// §4.4 step 4: complexity × [8,15) steps scaled by the worker's speed
/// multiplier, floor 5 (B1).
fn step_count(task: &Task, speed_multiplier: f64) -> u32 {
    let per_unit = rand::thread_rng().gen_range(8.0..15.0);
    let raw = (task.complexity as f64 * per_unit / speed_multiplier.max(0.01)) as u32;
    raw.max(MIN_STEPS)
}

/// Simulated per-step duration before throttle scaling; proportional to
/// complexity so higher-complexity tasks run longer end to end.
fn simulated_step_delay(task: &Task) -> Duration {
    let base_ms = 50 + (task.complexity.min(20) as u64 * 15);
    Duration::from_millis(base_ms)
}

impl Task {
    fn task_type_label(&self) -> String {
        serde_json::to_value(self.task_type).ok().and_then(|v| v.as_str().map(String::from)).unwrap_or_default()
    }
}

/// §4.4 liveness: marks a task whose active-task record outlived
/// `ACTIVE_TASK_TTL` as failed with cause "worker timeout"; invoked by the
/// scheduler's maintenance sweep rather than by the worker, since ownership
/// of a stale task's terminal transition belongs to the scheduler (§3
/// Ownership).
pub fn is_stale(started_at: chrono::DateTime<Utc>) -> bool {
    Utc::now() - started_at > chrono::Duration::from_std(ACTIVE_TASK_TTL).unwrap()
}

pub fn looks_like_transient_failure(message: &str) -> bool {
    looks_transient(message)
}
