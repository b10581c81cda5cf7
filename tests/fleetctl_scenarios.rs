//! End-to-end scenarios driving the engine's public async functions directly,
//! per SPEC_FULL §10.6 — no HTTP/SSE/WebSocket transport needed since those
//! are thin wrappers over exactly these calls.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleetctl::config::AppConfig;
use fleetctl::model::{Event, EventType, Priority, Task, TaskType, Worker};
use fleetctl::store::StateStore;
use fleetctl::worker::{StepOutcome, Workload};
use fleetctl::Engine;
use proptest::prelude::*;

/// Always progresses, completing in a handful of fast steps — keeps the
/// happy-path scenario quick without needing the full 8-15x complexity
/// multiplier from the real simulated workload.
struct FastWorkload;

#[async_trait::async_trait]
impl Workload for FastWorkload {
    async fn run_step(&self, _task: &Task, step: u32, total_steps: u32) -> StepOutcome {
        StepOutcome::Progressed { tokens: 100, cost_usd: 0.001 * (step as f64) / total_steps.max(1) as f64 }
    }
}

/// Fails on the 4th step of the first attempt only, then always progresses —
/// drives scenario S2 (retry then success).
struct FailOnceWorkload {
    attempt: AtomicU32,
}

#[async_trait::async_trait]
impl Workload for FailOnceWorkload {
    async fn run_step(&self, _task: &Task, step: u32, total_steps: u32) -> StepOutcome {
        if step == 4 && self.attempt.fetch_add(1, Ordering::SeqCst) == 0 {
            return StepOutcome::TransientError("connection reset".to_string());
        }
        StepOutcome::Progressed { tokens: 50, cost_usd: 0.0005 * (step as f64) / total_steps.max(1) as f64 }
    }
}

/// Always fails — drives scenario S3 (DLQ after exhausted retries).
struct AlwaysFailsWorkload;

#[async_trait::async_trait]
impl Workload for AlwaysFailsWorkload {
    async fn run_step(&self, _task: &Task, _step: u32, _total_steps: u32) -> StepOutcome {
        StepOutcome::FatalError("persistent upstream failure".to_string())
    }
}

/// Progresses like `FastWorkload` but counts how many steps actually ran —
/// drives B1 (complexity 0 still runs the floor of 5 steps).
struct CountingWorkload {
    steps_run: AtomicU32,
}

#[async_trait::async_trait]
impl Workload for CountingWorkload {
    async fn run_step(&self, _task: &Task, step: u32, total_steps: u32) -> StepOutcome {
        self.steps_run.fetch_add(1, Ordering::SeqCst);
        StepOutcome::Progressed { tokens: 10, cost_usd: 0.0001 * (step as f64) / total_steps.max(1) as f64 }
    }
}

async fn wait_for_terminal(engine: &Arc<Engine>, timeout: Duration) -> Option<fleetctl::model::DlqEntry> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(entries) = engine.scheduler.list_dlq().await {
            if let Some(entry) = entries.into_iter().next() {
                return Some(entry);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Polls the `completed_tasks:{id}` marker `complete_task` writes on success —
/// the only unambiguous completion signal, since `current_load` and
/// `active_task_count` both dip transiently during a mid-flight retry.
async fn wait_for_completion(engine: &Arc<Engine>, task_id: fleetctl::model::TaskId, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(Some(_)) = engine.store.hash_get_all(&format!("completed_tasks:{task_id}")).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn s1_happy_path_completes_with_tokens_and_nonnegative_cost() {
    let engine = Engine::open_in_memory(AppConfig::default()).await.unwrap();
    let worker = Worker::new("inference", "localhost");
    let _runtime = engine.spawn_worker_with(worker, Arc::new(FastWorkload)).await;

    let mut task = Task::new("T1", TaskType::CodeGeneration, serde_json::Value::Null);
    task.priority = Priority::Normal;
    task.complexity = 1;
    let task_id = task.id;
    engine.scheduler.submit(task).await.unwrap();

    assert!(wait_for_completion(&engine, task_id, Duration::from_secs(10)).await, "task {task_id} did not complete in time");
    assert!(engine.scheduler.list_dlq().await.unwrap().is_empty(), "task should not reach the DLQ on the happy path");
    engine.shutdown().await;
}

#[tokio::test]
async fn s2_transient_failure_retries_then_completes() {
    let mut config = AppConfig::default();
    config.scheduler.retry_base_delay_secs = 0;
    let engine = Engine::open_in_memory(config).await.unwrap();
    let worker = Worker::new("inference", "localhost");
    let _runtime = engine.spawn_worker_with(worker, Arc::new(FailOnceWorkload { attempt: AtomicU32::new(0) })).await;

    let mut task = Task::new("T2", TaskType::Computation, serde_json::Value::Null);
    task.max_retries = 3;
    task.complexity = 1;
    let task_id = task.id;
    engine.scheduler.submit(task).await.unwrap();

    assert!(
        wait_for_completion(&engine, task_id, Duration::from_secs(10)).await,
        "task {task_id} did not complete after its transient retry"
    );
    assert!(engine.scheduler.list_dlq().await.unwrap().is_empty(), "task should recover via retry, not land in the DLQ");
    engine.shutdown().await;
}

#[tokio::test]
async fn s3_persistent_failure_lands_in_dlq_after_max_retries() {
    let mut config = AppConfig::default();
    config.scheduler.retry_base_delay_secs = 0;
    let engine = Engine::open_in_memory(config).await.unwrap();
    let worker = Worker::new("inference", "localhost");
    let _runtime = engine.spawn_worker_with(worker, Arc::new(AlwaysFailsWorkload)).await;

    let mut task = Task::new("T3", TaskType::Computation, serde_json::Value::Null);
    task.max_retries = 1;
    task.complexity = 1;
    let task_id = task.id;
    engine.scheduler.submit(task).await.unwrap();

    let entry = wait_for_terminal(&engine, Duration::from_secs(20)).await;
    let entry = entry.expect("task should land in the DLQ after exhausting retries");
    assert_eq!(entry.task.id, task_id);
    assert!(entry.failure_message.contains("persistent"));
    engine.shutdown().await;
}

#[tokio::test]
async fn s4_pause_blocks_new_first_starts_and_resume_lets_work_continue() {
    let engine = Engine::open_in_memory(AppConfig::default()).await.unwrap();
    engine.flags.pause().await.unwrap();
    assert!(engine.flags.is_paused().await);

    let worker = Worker::new("inference", "localhost");
    let runtime = engine.spawn_worker_with(worker, Arc::new(FastWorkload)).await;

    let mut task = Task::new("T4", TaskType::Computation, serde_json::Value::Null);
    task.complexity = 1;
    let task_id = task.id;
    engine.scheduler.submit(task).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(runtime.worker.read().await.current_load, 0, "no task should start while paused");

    engine.flags.resume().await.unwrap();
    assert!(!engine.flags.is_paused().await);

    assert!(
        wait_for_completion(&engine, task_id, Duration::from_secs(10)).await,
        "task never resumed after unpause"
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn i6_throttle_out_of_range_leaves_stored_rate_unchanged() {
    let engine = Engine::open_in_memory(AppConfig::default()).await.unwrap();
    engine.flags.set_throttle(0.8).await.unwrap();
    assert!(engine.flags.set_throttle(5.0).await.is_err());
    assert!(engine.flags.set_throttle(0.0).await.is_err());
    assert_eq!(engine.flags.throttle_rate().await, 0.8);
    engine.shutdown().await;
}

#[tokio::test]
async fn r1_submit_cancel_resubmit_with_identical_payload() {
    let engine = Engine::open_in_memory(AppConfig::default()).await.unwrap();
    let payload = serde_json::json!({ "prompt": "hello" });

    let task = Task::new("R1", TaskType::TextProcessing, payload.clone());
    let submitted = engine.scheduler.submit(task).await.unwrap();
    engine.scheduler.cancel(submitted.id).await.unwrap();

    let resubmitted = Task::new("R1", TaskType::TextProcessing, payload);
    let resubmitted_id = resubmitted.id;
    let worker = Worker::new("inference", "localhost");
    let _runtime = engine.spawn_worker_with(worker, Arc::new(FastWorkload)).await;
    engine.scheduler.submit(resubmitted).await.unwrap();

    assert!(
        wait_for_completion(&engine, resubmitted_id, Duration::from_secs(10)).await,
        "resubmitted task {resubmitted_id} never completed"
    );
    assert!(engine.scheduler.list_dlq().await.unwrap().is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn b2_self_dependency_is_rejected_at_submission() {
    let engine = Engine::open_in_memory(AppConfig::default()).await.unwrap();
    let mut task = Task::new("cyclic", TaskType::Computation, serde_json::Value::Null);
    task.dependencies.insert(task.id);
    let result = engine.scheduler.submit(task).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn b3_empty_channel_subscription_is_rejected() {
    let engine = Engine::open_in_memory(AppConfig::default()).await.unwrap();
    let result = engine.fanout.connect(vec![], fleetctl::model::EventFilter::default(), false, 10).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn b1_zero_complexity_still_runs_the_five_step_floor() {
    let engine = Engine::open_in_memory(AppConfig::default()).await.unwrap();
    let worker = Worker::new("inference", "localhost");
    let workload = Arc::new(CountingWorkload { steps_run: AtomicU32::new(0) });
    let _runtime = engine.spawn_worker_with(worker, Arc::clone(&workload) as Arc<dyn Workload>).await;

    let mut task = Task::new("B1", TaskType::Computation, serde_json::Value::Null);
    task.complexity = 0;
    let task_id = task.id;
    engine.scheduler.submit(task).await.unwrap();

    assert!(wait_for_completion(&engine, task_id, Duration::from_secs(10)).await, "task {task_id} did not complete");
    assert_eq!(workload.steps_run.load(Ordering::SeqCst), 5, "complexity 0 should still run exactly the floor of 5 steps");
    engine.shutdown().await;
}

#[tokio::test]
async fn b4_replay_buffer_size_zero_is_honored_end_to_end() {
    let engine = Engine::open_in_memory(AppConfig::default()).await.unwrap();
    engine
        .bus
        .publish(Event::new(EventType::Metrics, Priority::Normal, "probe", serde_json::json!({ "value": 1.0 })))
        .await
        .unwrap();

    let handle = engine
        .fanout
        .connect(vec!["metrics".to_string()], fleetctl::model::EventFilter::default(), false, 0)
        .await
        .unwrap();
    assert_eq!(handle.queue_len().await, 0, "buffer_size=0 must skip replay of the already-published event");
    engine.shutdown().await;
}

#[tokio::test]
async fn s5_throttle_rate_roughly_doubles_step_duration() {
    async fn run_at_rate(rate: f64) -> Duration {
        let engine = Engine::open_in_memory(AppConfig::default()).await.unwrap();
        if rate != 1.0 {
            engine.flags.set_throttle(rate).await.unwrap();
        }
        let worker = Worker::new("inference", "localhost");
        let _runtime = engine.spawn_worker_with(worker, Arc::new(CountingWorkload { steps_run: AtomicU32::new(0) })).await;

        let mut task = Task::new("S5", TaskType::Computation, serde_json::Value::Null);
        task.complexity = 0; // deterministic 5-step floor, so only the throttle varies timing
        let task_id = task.id;
        let started = tokio::time::Instant::now();
        engine.scheduler.submit(task).await.unwrap();
        assert!(wait_for_completion(&engine, task_id, Duration::from_secs(10)).await);
        let elapsed = started.elapsed();
        engine.shutdown().await;
        elapsed
    }

    let baseline = run_at_rate(1.0).await;
    let throttled = run_at_rate(0.5).await;

    // Halving the rate should roughly double per-step delay; generous
    // tolerance since both runs involve real sleeps and scheduling jitter.
    assert!(
        throttled > baseline.mul_f64(1.3),
        "throttled run ({throttled:?}) should be noticeably slower than baseline ({baseline:?})"
    );
    assert!(
        throttled < baseline.mul_f64(4.0) + Duration::from_millis(500),
        "throttled run ({throttled:?}) should not be wildly slower than 2x baseline ({baseline:?})"
    );
}

#[tokio::test]
async fn s6_fanout_backpressure_drops_oldest_under_load() {
    let engine = Engine::open_in_memory(AppConfig::default()).await.unwrap();
    let handle = engine
        .fanout
        .connect(vec!["broadcast".to_string()], fleetctl::model::EventFilter::default(), false, 0)
        .await
        .unwrap();

    for i in 0..1000u64 {
        engine
            .bus
            .publish(Event::new(EventType::Broadcast, Priority::Normal, "flood", serde_json::json!({ "seq": i })))
            .await
            .unwrap();
    }
    // Let the per-channel forwarder task drain the broadcast channel into the
    // bounded client queue before inspecting the drop counter.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(handle.queue_len().await, 100, "queue should be pinned at its 100-event capacity");
    assert!(
        handle.stats().dropped.load(Ordering::Relaxed) >= 900,
        "at least 900 of 1000 events should have been dropped under a 100-capacity queue"
    );

    let mut seqs = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_millis(500), handle.next()).await.ok() {
        match event {
            fleetctl::fanout::OutboundItem::Event(e) => seqs.push(e.data["seq"].as_u64().unwrap()),
            fleetctl::fanout::OutboundItem::Liveness { .. } => continue,
            fleetctl::fanout::OutboundItem::Compressed { .. } => break,
        }
        if seqs.len() == 100 {
            break;
        }
    }
    assert_eq!(seqs.len(), 100);
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "surviving events must stay in arrival order: {seqs:?}");
    engine.shutdown().await;
}

#[tokio::test]
async fn s7_sliding_window_aggregates_twenty_five_metrics_events() {
    let engine = Engine::open_in_memory(AppConfig::default()).await.unwrap();
    let mut sub = engine.bus.subscribe(&["metrics".to_string()]);

    let mut expected_sum = 0.0f64;
    let mut expected_ids = std::collections::HashSet::new();
    for i in 0..25u64 {
        let value = i as f64;
        expected_sum += value;
        let event = Event::new(EventType::Metrics, Priority::Normal, "sensor", serde_json::json!({ "value": value }));
        expected_ids.insert(event.id);
        engine.aggregator.ingest(event).await;
    }

    let flushed = sub
        .recv_timeout(Duration::from_secs(8))
        .await
        .expect("sliding window should flush within its 5s window plus flush-tick slack");

    assert_eq!(flushed.data["batch_size"], serde_json::json!(25));
    let got_ids: std::collections::HashSet<_> = flushed.data["event_ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| fleetctl::model::EventId::parse_str(v.as_str().unwrap()).unwrap())
        .collect();
    assert_eq!(got_ids, expected_ids);
    assert_eq!(flushed.data["stats"]["value"]["sum"], serde_json::json!(expected_sum));
    engine.shutdown().await;
}

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Runtime::new().unwrap().block_on(fut)
}

proptest! {
    // Each case spins up a full in-memory engine and drives real async
    // tasks to completion; the default 256 cases would make this suite
    // minutes slower for no extra coverage once the shrinking boundary is
    // this narrow.
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// I1: a submitted task eventually publishes exactly one terminal event
    /// (task-completed, since this workload never fails) on the `tasks` channel.
    #[test]
    fn i1_exactly_one_terminal_event_per_task(complexity in 0u32..6) {
        block_on(async {
            let engine = Engine::open_in_memory(AppConfig::default()).await.unwrap();
            let mut sub = engine.bus.subscribe(&["tasks".to_string()]);
            let worker = Worker::new("inference", "localhost");
            let _runtime = engine.spawn_worker_with(worker, Arc::new(CountingWorkload { steps_run: AtomicU32::new(0) })).await;

            let mut task = Task::new("I1", TaskType::Computation, serde_json::Value::Null);
            task.complexity = complexity;
            let task_id = task.id;
            engine.scheduler.submit(task).await.unwrap();
            assert!(wait_for_completion(&engine, task_id, Duration::from_secs(10)).await);

            let mut terminal_count = 0;
            while let Some(event) = sub.recv_timeout(Duration::from_millis(200)).await {
                if event.data["task_id"].as_str() == Some(&task_id.to_string()) {
                    let label = event.data["label"].as_str().unwrap_or("");
                    if label == "task-completed" || label == "task-failed" {
                        terminal_count += 1;
                    }
                }
            }
            prop_assert_eq!(terminal_count, 1);
            engine.shutdown().await;
            Ok(())
        })?;
    }

    /// I2: progress is non-decreasing within an attempt and resets to 0 on retry.
    #[test]
    fn i2_progress_resets_to_zero_on_retry(fail_step in 1u32..4) {
        block_on(async {
            let mut config = AppConfig::default();
            config.scheduler.retry_base_delay_secs = 0;
            let engine = Engine::open_in_memory(config).await.unwrap();
            let mut sub = engine.bus.subscribe(&["tasks".to_string()]);

            struct FailsOnceAt {
                fail_step: u32,
                failed: AtomicBool,
            }
            #[async_trait::async_trait]
            impl Workload for FailsOnceAt {
                async fn run_step(&self, _task: &Task, step: u32, total_steps: u32) -> StepOutcome {
                    if step == self.fail_step && !self.failed.swap(true, Ordering::SeqCst) {
                        return StepOutcome::TransientError("blip".to_string());
                    }
                    StepOutcome::Progressed { tokens: 1, cost_usd: 0.0001 * (step as f64) / total_steps.max(1) as f64 }
                }
            }

            let worker = Worker::new("inference", "localhost");
            let workload = Arc::new(FailsOnceAt { fail_step, failed: AtomicBool::new(false) });
            let _runtime = engine.spawn_worker_with(worker, workload).await;

            let mut task = Task::new("I2", TaskType::Computation, serde_json::Value::Null);
            task.complexity = 0;
            task.max_retries = 2;
            let task_id = task.id;
            engine.scheduler.submit(task).await.unwrap();
            assert!(wait_for_completion(&engine, task_id, Duration::from_secs(10)).await);

            let mut last_progress: Option<u8> = None;
            while let Some(event) = sub.recv_timeout(Duration::from_millis(200)).await {
                if event.data["task_id"].as_str() != Some(&task_id.to_string()) {
                    continue;
                }
                let label = event.data["label"].as_str();
                let progress = event.data["progress"].as_u64().map(|p| p as u8);
                if label == Some("task-retry") {
                    prop_assert_eq!(progress, Some(0));
                    last_progress = Some(0);
                    continue;
                }
                if let Some(p) = progress {
                    if let Some(last) = last_progress {
                        prop_assert!(p >= last, "progress must not go backwards within an attempt: {last} -> {p}");
                    }
                    last_progress = Some(p);
                }
            }
            engine.shutdown().await;
            Ok(())
        })?;
    }

    /// I3: a single worker's current_load never exceeds its max_concurrency.
    #[test]
    fn i3_current_load_never_exceeds_max_concurrency(task_count in 2usize..6) {
        block_on(async {
            let engine = Engine::open_in_memory(AppConfig::default()).await.unwrap();
            let worker = Worker::new("inference", "localhost");
            let max_concurrency = worker.max_concurrency;
            let runtime = engine.spawn_worker_with(worker, Arc::new(FastWorkload)).await;

            let mut ids = Vec::new();
            for i in 0..task_count {
                let mut task = Task::new(format!("I3-{i}"), TaskType::Computation, serde_json::Value::Null);
                task.complexity = 1;
                ids.push(task.id);
                engine.scheduler.submit(task).await.unwrap();
            }

            let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
            loop {
                let load = runtime.worker.read().await.current_load;
                prop_assert!(load <= max_concurrency, "current_load {load} exceeded max_concurrency {max_concurrency}");
                if futures_all_complete(&engine, &ids).await || tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            engine.shutdown().await;
            Ok(())
        })?;
    }

    /// I4: a channel's replay buffer never exceeds its configured capacity.
    #[test]
    fn i4_replay_buffer_never_exceeds_capacity(extra_events in 0usize..250) {
        block_on(async {
            let engine = Engine::open_in_memory(AppConfig::default()).await.unwrap();
            let buffer_size = 100; // alerts' configured buffer_size (model::channel_config)
            for i in 0..(buffer_size + extra_events) {
                engine
                    .bus
                    .publish(Event::new(EventType::SystemAlert, Priority::Critical, "probe", serde_json::json!({ "i": i })))
                    .await
                    .unwrap();
            }
            let len = engine.store.list_len("buffer:alerts").await.unwrap();
            prop_assert!(len <= buffer_size, "replay buffer grew to {len}, past its {buffer_size} capacity");
            engine.shutdown().await;
            Ok(())
        })?;
    }

    /// I5: a client subscription's outbound queue never exceeds its capacity,
    /// and the drop counter accounts for exactly the overflow.
    #[test]
    fn i5_outbound_queue_bounded_and_drops_match_overflow(published in 150usize..400) {
        block_on(async {
            let engine = Engine::open_in_memory(AppConfig::default()).await.unwrap();
            let handle = engine
                .fanout
                .connect(vec!["broadcast".to_string()], fleetctl::model::EventFilter::default(), false, 0)
                .await
                .unwrap();
            for i in 0..published {
                engine
                    .bus
                    .publish(Event::new(EventType::Broadcast, Priority::Normal, "flood", serde_json::json!({ "i": i })))
                    .await
                    .unwrap();
            }
            tokio::time::sleep(Duration::from_millis(200)).await;

            let capacity = 100usize;
            let len = handle.queue_len().await;
            prop_assert!(len <= capacity, "queue grew to {len}, past capacity {capacity}");
            let dropped = handle.stats().dropped.load(Ordering::Relaxed) as usize;
            prop_assert_eq!(dropped, published.saturating_sub(capacity));
            engine.shutdown().await;
            Ok(())
        })?;
    }

    /// I7: while paused, no task is ever observed starting; once resumed, it
    /// eventually completes.
    #[test]
    fn i7_paused_tasks_never_start_until_resumed(task_count in 1usize..4) {
        block_on(async {
            let engine = Engine::open_in_memory(AppConfig::default()).await.unwrap();
            engine.flags.pause().await.unwrap();
            let worker = Worker::new("inference", "localhost");
            let runtime = engine.spawn_worker_with(worker, Arc::new(FastWorkload)).await;

            let mut ids = Vec::new();
            for i in 0..task_count {
                let mut task = Task::new(format!("I7-{i}"), TaskType::Computation, serde_json::Value::Null);
                task.complexity = 1;
                ids.push(task.id);
                engine.scheduler.submit(task).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
            prop_assert_eq!(runtime.worker.read().await.current_load, 0, "no task should start while paused");

            engine.flags.resume().await.unwrap();
            for id in &ids {
                prop_assert!(wait_for_completion(&engine, *id, Duration::from_secs(10)).await);
            }
            engine.shutdown().await;
            Ok(())
        })?;
    }

    /// I8: after exactly max_retries + 1 failures, the task is in the DLQ
    /// and absent from active_tasks.
    #[test]
    fn i8_exhausted_retries_land_in_dlq_and_leave_active_tasks(max_retries in 0u32..3) {
        block_on(async {
            let mut config = AppConfig::default();
            config.scheduler.retry_base_delay_secs = 0;
            let engine = Engine::open_in_memory(config).await.unwrap();
            let worker = Worker::new("inference", "localhost");
            let _runtime = engine.spawn_worker_with(worker, Arc::new(AlwaysFailsWorkload)).await;

            let mut task = Task::new("I8", TaskType::Computation, serde_json::Value::Null);
            task.max_retries = max_retries;
            task.complexity = 0;
            let task_id = task.id;
            engine.scheduler.submit(task).await.unwrap();

            let entry = wait_for_terminal(&engine, Duration::from_secs(20)).await;
            let entry = entry.expect("task should land in the DLQ after exhausting retries");
            prop_assert_eq!(entry.task.id, task_id);

            let active = engine.store.kv_get(&format!("active_tasks:{task_id}")).await.unwrap();
            prop_assert!(active.is_none(), "task should no longer be tracked as active once it lands in the DLQ");
            engine.shutdown().await;
            Ok(())
        })?;
    }
}

async fn futures_all_complete(engine: &Arc<Engine>, ids: &[fleetctl::model::TaskId]) -> bool {
    for id in ids {
        if engine.store.hash_get_all(&format!("completed_tasks:{id}")).await.unwrap_or(None).is_none() {
            return false;
        }
    }
    true
}
