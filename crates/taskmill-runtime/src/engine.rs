//! The reactive engine: wires the leader elector, planner, polling runner
//! and worker pool together over one database.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mongodb::Database;
use taskmill_core::{Error, Result, SchedulerConfig};
use tokio::task::JoinHandle;

use crate::flag::ShutdownFlag;
use crate::indexes;
use crate::leader::LeaderElector;
use crate::lock::DistributedLock;
use crate::meta::MetaStore;
use crate::planner::ReactivePlanner;
use crate::poller::{PollSourceConfig, PollingRunner};
use crate::registry::{ReactiveRegistry, TaskCaller};
use crate::worker::ReactiveWorker;

pub struct ReactiveEngine {
    db: Database,
    config: SchedulerConfig,
    registry: Arc<ReactiveRegistry>,
    poller: Arc<PollingRunner>,
    worker: Arc<ReactiveWorker>,
    elector: Arc<LeaderElector>,
    planner: Arc<ReactivePlanner>,
    shutdown: ShutdownFlag,
    planner_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl ReactiveEngine {
    pub fn new(
        db: Database,
        config: SchedulerConfig,
        registry: Arc<ReactiveRegistry>,
        lock: DistributedLock,
        caller: TaskCaller,
        task_filter: Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>,
    ) -> Self {
        let shutdown = ShutdownFlag::new();
        let poller = Arc::new(PollingRunner::new());
        let meta = MetaStore::new(&db, &config.collections.reactive_meta);

        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let elector = Arc::new(LeaderElector::new(
            db.collection(&config.collections.reactive_meta),
            instance_id,
            config.leader_ttl,
            config.leader_heartbeat,
            config.callbacks.clone(),
        ));

        let worker = Arc::new(ReactiveWorker::new(
            db.clone(),
            registry.clone(),
            config.clone(),
            caller,
            shutdown.clone(),
            task_filter,
        ));

        let planner = Arc::new(ReactivePlanner::new(
            db.clone(),
            registry.clone(),
            config.clone(),
            meta,
            poller.clone(),
            lock,
            shutdown.clone(),
        ));

        Self {
            db,
            config,
            registry,
            poller,
            worker,
            elector,
            planner,
            shutdown,
            planner_handle: parking_lot::Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Bring the engine up: indexes, meta document, leader election, the
    /// planner task, and the worker pool. Starting twice is an error; a
    /// stopped engine stays stopped.
    pub async fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyInitialized);
        }

        let tasks_collections = self.registry.tasks_collections();
        indexes::ensure_reactive_indexes(&self.db, &tasks_collections).await?;
        indexes::ensure_lock_indexes(&self.db, &self.config.collections.locks).await?;

        MetaStore::new(&self.db, &self.config.collections.reactive_meta)
            .ensure_exists()
            .await?;

        self.elector.start();

        let planner = self.planner.clone();
        let elector = self.elector.clone();
        *self.planner_handle.lock() = Some(tokio::spawn(async move {
            planner.run(elector).await;
        }));

        let source_config = PollSourceConfig {
            min_poll: self.config.min_poll,
            max_poll: self.config.max_poll,
            jitter: self.config.jitter,
        };
        for collection in &tasks_collections {
            self.poller.register(collection, source_config)?;
        }

        let worker = self.worker.clone();
        self.poller.start(
            self.config.concurrency,
            Arc::new(move |source| {
                let worker = worker.clone();
                Box::pin(async move { worker.try_run(&source).await })
            }),
        );

        tracing::info!(
            target: "taskmill_runtime::engine",
            instance_id = %self.elector.instance_id(),
            collections = ?tasks_collections,
            "reactive engine started"
        );

        Ok(())
    }

    /// Ordered shutdown: stop the planner, drain the worker pool, then
    /// stop the leader heartbeat and release the lock.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.raise();

        let planner = self.planner_handle.lock().take();
        if let Some(handle) = planner {
            let _ = handle.await;
        }

        self.poller.stop().await;
        self.elector.stop().await;

        tracing::info!(target: "taskmill_runtime::engine", "reactive engine stopped");
    }

    pub fn is_leader(&self) -> bool {
        self.elector.is_leader()
    }
}
