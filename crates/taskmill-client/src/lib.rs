//! Query and admin surface over taskmill's task collections.
//!
//! Everything here is read-mostly and dashboard-shaped: paged listings,
//! per-task stats, retries, and the cron schedule. The engines live in
//! `taskmill-runtime`; this crate only needs the database handle and the
//! task bindings.

mod dto;
mod ids;
mod manager;

pub use self::dto::{
    CronTaskInfo, CronTaskListPage, InfoResponse, ReactiveTaskInfo, TaskListPage, TaskStats,
};
pub use self::ids::id_candidates;
pub use self::manager::{CronListQuery, Pagination, RetryQuery, TaskManager, TaskQuery};
