//! MongoDB-backed task orchestration: reactive tasks driven by change
//! streams and cluster-wide cron tasks, coordinated entirely through the
//! database.
//!
//! A [`Taskmill`] handle owns both engines. Reactive tasks bind a filter
//! and a handler to a source collection; any document that ever matches is
//! eventually processed by the current handler, with debouncing, retries,
//! visibility leases and orphan cleanup. Cron tasks run at-most-once across
//! every process sharing the database.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use taskmill::{InitOptions, ReactiveTaskDef, RetryPolicy, Taskmill};
//!
//! # async fn example() -> taskmill::Result<()> {
//! let mill = Taskmill::init(
//!     InitOptions::new("app").uri("mongodb://localhost:27017"),
//! )
//! .await?;
//!
//! mill.reactive_task(
//!     ReactiveTaskDef::new("greeter", "people", |ctx| async move {
//!         let person = ctx.get_document().await?;
//!         println!("hello {person}");
//!         Ok(())
//!     })
//!     .debounce(Duration::from_millis(100))
//!     .retry_policy(RetryPolicy::fixed(Duration::from_secs(5)).max_attempts(3)),
//! )?;
//!
//! mill.start_reactive_tasks().await?;
//!
//! mill.cron_task("ticker", "CRON */10 * * * * *", || async {
//!     println!("tick");
//!     Ok(())
//! })
//! .await?;
//! mill.start_cron_tasks().await?;
//! # Ok(())
//! # }
//! ```

mod transaction;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use mongodb::{Client, Database};
use taskmill_client::TaskManager;
use taskmill_runtime::{
    default_cron_caller, default_task_caller, CronScheduler, CronTaskCaller, DistributedLock,
    ReactiveEngine, ReactiveRegistry, TaskCaller,
};

pub use mongodb;
pub use taskmill_client::{
    CronListQuery, CronTaskInfo, CronTaskListPage, InfoResponse, Pagination, ReactiveTaskInfo,
    RetryQuery, TaskListPage, TaskQuery, TaskStats,
};
pub use taskmill_core::event::{Callbacks, ErrorReport, EventCode, InfoEvent};
pub use taskmill_core::task::{
    CleanupPolicy, DeleteWhen, Evolution, OnHandlerVersionChange, TaskStatus, WorkItem,
};
pub use taskmill_core::{
    Backoff, CollectionNames, Error, Filter, Interval, IntoInterval, Result, RetryPolicy,
    SchedulerConfig,
};
pub use taskmill_runtime::{LockOptions, ReactiveTaskDef, TaskContext};

pub use self::transaction::TransactionContext;

type TaskFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Options for [`Taskmill::init`].
pub struct InitOptions {
    uri: Option<String>,
    client: Option<Client>,
    database: String,
    config: SchedulerConfig,
    task_caller: Option<TaskCaller>,
    cron_task_caller: Option<CronTaskCaller>,
    reactive_task_filter: Option<TaskFilter>,
    cron_task_filter: Option<TaskFilter>,
}

impl InitOptions {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            uri: None,
            client: None,
            database: database.into(),
            config: SchedulerConfig::default(),
            task_caller: None,
            cron_task_caller: None,
            reactive_task_filter: None,
            cron_task_filter: None,
        }
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Adopt an already connected client instead of opening one.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Wrap every reactive handler invocation (tracing spans, panic
    /// fences, request context).
    pub fn task_caller(mut self, caller: TaskCaller) -> Self {
        self.task_caller = Some(caller);
        self
    }

    pub fn cron_task_caller(mut self, caller: CronTaskCaller) -> Self {
        self.cron_task_caller = Some(caller);
        self
    }

    /// Restrict which registered reactive tasks this process claims.
    pub fn reactive_task_filter(
        mut self,
        filter: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.reactive_task_filter = Some(Arc::new(filter));
        self
    }

    /// Restrict which registered cron tasks this process claims.
    pub fn cron_task_filter(
        mut self,
        filter: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.cron_task_filter = Some(Arc::new(filter));
        self
    }
}

struct Inner {
    client: Client,
    db: Database,
    config: SchedulerConfig,
    registry: Arc<ReactiveRegistry>,
    lock: DistributedLock,
    reactive: ReactiveEngine,
    cron: CronScheduler,
    reactive_started: AtomicBool,
}

/// The library facade. Cheap to clone; all clones share the same engines.
#[derive(Clone)]
pub struct Taskmill {
    inner: Arc<Inner>,
}

impl Taskmill {
    /// Open (or adopt) the store client and construct both engines.
    /// Nothing runs until the `start_*` methods are called.
    pub async fn init(options: InitOptions) -> Result<Self> {
        let client = match options.client {
            Some(client) => client,
            None => {
                let uri = options.uri.ok_or_else(|| {
                    Error::Configuration(
                        "either a connected client or a connection uri is required".into(),
                    )
                })?;
                Client::with_uri_str(&uri).await?
            }
        };

        let db = client.database(&options.database);
        let config = options.config;

        taskmill_runtime::ensure_lock_indexes(&db, &config.collections.locks).await?;

        let registry = Arc::new(ReactiveRegistry::new());
        let lock = DistributedLock::new(db.collection(&config.collections.locks), &config);

        let reactive = ReactiveEngine::new(
            db.clone(),
            config.clone(),
            registry.clone(),
            lock.clone(),
            options.task_caller.unwrap_or_else(default_task_caller),
            options.reactive_task_filter,
        );

        let cron = CronScheduler::new(
            db.clone(),
            config.collections.cron_tasks.clone(),
            config.visibility_timeout,
            config.callbacks.clone(),
            options.cron_task_caller.unwrap_or_else(default_cron_caller),
            options.cron_task_filter,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                db,
                config,
                registry,
                lock,
                reactive,
                cron,
                reactive_started: AtomicBool::new(false),
            }),
        })
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    // ---- reactive engine ------------------------------------------------

    /// Register a reactive task. Must happen before
    /// [`Taskmill::start_reactive_tasks`].
    pub fn reactive_task(&self, def: ReactiveTaskDef) -> Result<()> {
        if self.inner.reactive_started.load(Ordering::SeqCst) {
            return Err(Error::Configuration(
                "reactive tasks must be registered before the engine starts".into(),
            ));
        }

        self.inner.registry.register(def, &self.inner.config)
    }

    pub async fn start_reactive_tasks(&self) -> Result<()> {
        self.inner.reactive_started.store(true, Ordering::SeqCst);
        self.inner.reactive.start().await
    }

    /// Ordered shutdown: planner first, then the worker pool drains its
    /// in-flight items, then the leader lock is released.
    pub async fn stop_reactive_tasks(&self) {
        self.inner.reactive.stop().await;
    }

    /// Whether this process currently owns the planner.
    pub fn is_planner_leader(&self) -> bool {
        self.inner.reactive.is_leader()
    }

    // ---- cron engine ----------------------------------------------------

    /// Register a cron task. Restarts keep the persisted schedule.
    pub async fn cron_task<I, F, Fut>(&self, id: &str, interval: I, handler: F) -> Result<()>
    where
        I: IntoInterval,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner
            .cron
            .register(id, interval.into_interval()?, handler)
            .await
    }

    pub async fn start_cron_tasks(&self) -> Result<()> {
        taskmill_runtime::ensure_cron_indexes(
            &self.inner.db,
            &self.inner.config.collections.cron_tasks,
        )
        .await?;
        self.inner.cron.start();
        Ok(())
    }

    pub async fn stop_cron_tasks(&self) {
        self.inner.cron.stop().await;
    }

    /// Flag the task so the next claim anywhere in the cluster runs it.
    pub async fn schedule_cron_task_immediately(&self, id: &str) -> Result<()> {
        self.inner.cron.schedule_immediately(id).await
    }

    /// Run the task on this process and wait for it to finish.
    pub async fn run_cron_task(&self, id: &str) -> Result<()> {
        self.inner.cron.run_task(id).await
    }

    // ---- query surface --------------------------------------------------

    fn manager(&self) -> TaskManager {
        TaskManager::new(
            self.inner.db.clone(),
            self.inner.registry.bindings(),
            self.inner.config.collections.cron_tasks.clone(),
        )
    }

    pub async fn get_reactive_tasks(
        &self,
        query: &TaskQuery,
        page: Pagination,
    ) -> Result<TaskListPage> {
        self.manager().get_tasks(query, page).await
    }

    pub async fn count_reactive_tasks(&self, query: &TaskQuery) -> Result<u64> {
        self.manager().count_tasks(query).await
    }

    pub async fn retry_reactive_tasks(&self, query: &RetryQuery) -> Result<u64> {
        self.manager().retry_tasks(query).await
    }

    pub async fn get_cron_tasks_list(
        &self,
        query: &CronListQuery,
        page: Pagination,
    ) -> Result<CronTaskListPage> {
        self.manager().get_cron_tasks(query, page).await
    }

    /// The `/api/cron/trigger` path: same as
    /// [`Taskmill::schedule_cron_task_immediately`].
    pub async fn trigger_cron_task(&self, id: &str) -> Result<()> {
        self.inner.cron.schedule_immediately(id).await
    }

    /// The `/api/info` snapshot.
    pub async fn info(&self) -> Result<InfoResponse> {
        self.manager().info().await
    }

    // ---- shared primitives ----------------------------------------------

    /// Run `f` under the distributed mutex `key`. The lock heartbeats while
    /// `f` runs and is released on every exit path; if the release itself
    /// fails, the TTL index reaps the document.
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        key: &str,
        options: LockOptions,
        f: F,
    ) -> std::result::Result<T, E>
    where
        E: From<Error>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let handle = self.inner.lock.acquire(key, options).await.map_err(E::from)?;
        let outcome = f().await;

        if let Err(e) = handle.release().await {
            tracing::warn!(target: "taskmill", "failed to release lock `{key}`: {e}");
            self.inner
                .config
                .callbacks
                .error("lock release", &e);
        }

        outcome
    }

    /// Run `f` inside a multi-document transaction. Hooks registered via
    /// [`TransactionContext::after_commit`] run only after a successful
    /// commit.
    pub async fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut TransactionContext) -> BoxFuture<'a, Result<T>>,
    {
        transaction::with_transaction(&self.inner.client, f).await
    }
}
