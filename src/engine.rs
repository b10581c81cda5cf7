//! Wires the six components into one handle. This is the "no transport
//! logic lives here, only routes that call straight into the engine" seam
//! `http` and the CLI both sit behind.

use std::sync::Arc;

use crate::aggregator::EventAggregator;
use crate::bus::EventBus;
use crate::config::AppConfig;
use crate::error::EngineResult;
use crate::fanout::FanOut;
use crate::flags::ControlFlags;
use crate::model::Worker;
use crate::scheduler::{self, Scheduler};
use crate::store::{SledStateStore, StateStore};
use crate::worker::{SimulatedWorkload, WorkerRuntime, Workload};

pub struct Engine {
    pub store: Arc<dyn StateStore>,
    pub bus: Arc<EventBus>,
    pub aggregator: Arc<EventAggregator>,
    pub scheduler: Arc<Scheduler>,
    pub fanout: Arc<FanOut>,
    pub flags: Arc<ControlFlags>,
    pub config: AppConfig,
}

impl Engine {
    pub async fn open(store_path: impl AsRef<std::path::Path>, config: AppConfig) -> EngineResult<Arc<Self>> {
        let store: Arc<dyn StateStore> = Arc::new(SledStateStore::open(store_path)?);
        Self::from_store(store, config).await
    }

    pub async fn open_in_memory(config: AppConfig) -> EngineResult<Arc<Self>> {
        let store: Arc<dyn StateStore> = Arc::new(SledStateStore::open_temporary()?);
        Self::from_store(store, config).await
    }

    async fn from_store(store: Arc<dyn StateStore>, config: AppConfig) -> EngineResult<Arc<Self>> {
        let bus = Arc::new(EventBus::new(Arc::clone(&store)));
        let aggregator = EventAggregator::new(Arc::clone(&bus));
        let flags = Arc::new(ControlFlags::new(Arc::clone(&store)));
        let scheduler = Scheduler::new(Arc::clone(&store), Arc::clone(&bus), Arc::clone(&flags));
        let fanout = FanOut::new(Arc::clone(&bus));

        aggregator.start().await;
        scheduler::spawn_sweeps(
            Arc::clone(&scheduler),
            std::time::Duration::from_secs(config.scheduler.dlq_sweep_interval_secs),
            std::time::Duration::from_secs(config.scheduler.cleanup_sweep_interval_secs),
        );

        Ok(Arc::new(Self { store, bus, aggregator, scheduler, fanout, flags, config }))
    }

    /// Registers a worker and spawns its runtime loop using the simulated
    /// development workload; production wiring would substitute a real
    /// workload implementation here.
    pub async fn spawn_worker(self: &Arc<Self>, worker: Worker) -> Arc<WorkerRuntime> {
        self.spawn_worker_with(worker, Arc::new(SimulatedWorkload)).await
    }

    pub async fn spawn_worker_with(self: &Arc<Self>, worker: Worker, workload: Arc<dyn Workload>) -> Arc<WorkerRuntime> {
        self.scheduler.register_worker(worker.clone()).await;
        let runtime = WorkerRuntime::new(
            worker,
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            Arc::clone(&self.scheduler),
            Arc::clone(&self.flags),
            workload,
            self.config.scheduler.retry_base_delay_secs,
        );
        runtime.spawn();
        runtime
    }

    pub async fn shutdown(&self) {
        self.fanout.shutdown_all().await;
        self.aggregator.shutdown().await;
    }
}
