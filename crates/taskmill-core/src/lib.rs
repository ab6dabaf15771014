//! Shared types for the taskmill orchestration library.
//!
//! Everything in here is plain data: configuration records, interval and
//! retry-policy parsing, the filter AST and its change-stream rewriter,
//! persisted document schemas and the public error type. The engines that
//! act on these types live in `taskmill-runtime`.

mod config;
mod error;
mod filter;
mod ident;
mod interval;
mod retry;

pub mod cron;
pub mod event;
pub mod meta;
pub mod task;
pub mod time;

pub use self::config::{CollectionNames, SchedulerConfig};
pub use self::error::{error_code, is_duplicate_key, is_history_lost, Error, Result};
pub use self::filter::Filter;
pub use self::ident::{trigger_signature, work_item_id};
pub use self::interval::{CronExpr, Interval, IntoInterval};
pub use self::retry::{Backoff, RetryPolicy};
