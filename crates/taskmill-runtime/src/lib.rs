//! Engines for the taskmill orchestration library.
//!
//! Shared primitives (shutdown flag, distributed lock, polling runner,
//! leader elector) at the bottom; the reactive planner/worker pair and the
//! cron scheduler on top. The facade crate (`taskmill`) owns construction
//! and exposes the public API.

mod cleanup;
mod context;
mod engine;
mod flag;
mod indexes;
mod leader;
mod lock;
mod meta;
mod plan;
mod planner;
mod poller;
mod registry;
mod worker;

pub mod cron;

pub use self::context::TaskContext;
pub use self::cron::{
    default_cron_caller, CronCall, CronHandler, CronScheduler, CronTaskCaller,
};
pub use self::engine::ReactiveEngine;
pub use self::flag::ShutdownFlag;
pub use self::indexes::{ensure_cron_indexes, ensure_lock_indexes, ensure_reactive_indexes};
pub use self::leader::LeaderElector;
pub use self::lock::{ContinuousHeartbeat, DistributedLock, LockHandle, LockOptions};
pub use self::meta::MetaStore;
pub use self::poller::{PollSourceConfig, PollingRunner, TryRun};
pub use self::registry::{
    default_task_caller, ReactiveRegistry, ReactiveTask, ReactiveTaskDef, TaskCall, TaskCaller,
    TaskHandler,
};
pub use self::worker::ReactiveWorker;
