//! The reactive worker: claim, run, finalize.
//!
//! Every process runs the same worker pool; safety across processes rests
//! on the atomic claim and the visibility lease. Only the lease holder may
//! finalize an item, and a finalize always targets the status it believes
//! the item is in, so a concurrent dirty-promotion by the planner is never
//! overwritten blindly.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use futures_util::FutureExt;
use metrics::{counter, gauge};
use mongodb::bson::{doc, DateTime, Document};
use mongodb::options::ReturnDocument;
use mongodb::{Collection, Database};
use parking_lot::Mutex;
use taskmill_core::event::{Callbacks, EventCode, InfoEvent};
use taskmill_core::task::WorkItem;
use taskmill_core::{time, Error, Result, SchedulerConfig};

use crate::context::{ContextState, TaskContext};
use crate::flag::ShutdownFlag;
use crate::lock::ContinuousHeartbeat;
use crate::registry::{ReactiveRegistry, ReactiveTask, TaskCall, TaskCaller};

/// Per-instance throttles: task name → claim-again-after.
#[derive(Clone, Default)]
pub struct ThrottleMap(Arc<Mutex<HashMap<String, DateTime>>>);

impl ThrottleMap {
    pub fn set(&self, task: &str, until: DateTime) {
        self.0.lock().insert(task.to_owned(), until);
    }

    pub fn is_throttled(&self, task: &str, now: DateTime) -> bool {
        let mut map = self.0.lock();
        match map.get(task) {
            Some(until) if *until > now => true,
            Some(_) => {
                map.remove(task);
                false
            }
            None => false,
        }
    }
}

pub struct ReactiveWorker {
    db: Database,
    registry: Arc<ReactiveRegistry>,
    config: SchedulerConfig,
    caller: TaskCaller,
    callbacks: Callbacks,
    throttles: ThrottleMap,
    shutdown: ShutdownFlag,
    /// Restricts which registered tasks this process claims.
    task_filter: Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>,
}

impl ReactiveWorker {
    pub fn new(
        db: Database,
        registry: Arc<ReactiveRegistry>,
        config: SchedulerConfig,
        caller: TaskCaller,
        shutdown: ShutdownFlag,
        task_filter: Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>,
    ) -> Self {
        let callbacks = config.callbacks.clone();
        Self {
            db,
            registry,
            config,
            caller,
            callbacks,
            throttles: ThrottleMap::default(),
            shutdown,
            task_filter,
        }
    }

    pub fn throttles(&self) -> ThrottleMap {
        self.throttles.clone()
    }

    /// One poll of `tasks_collection`: claim at most one due work item, run
    /// its handler, finalize. Returns whether an item was found so the
    /// runner can poll again promptly.
    pub async fn try_run(&self, tasks_collection: &str) -> bool {
        if self.shutdown.is_raised() {
            return false;
        }

        let now = time::now();
        let names: Vec<String> = self
            .registry
            .for_tasks_collection(tasks_collection)
            .into_iter()
            .filter(|task| {
                self.task_filter
                    .as_ref()
                    .map(|allows| allows(&task.name))
                    .unwrap_or(true)
            })
            .filter(|task| !self.throttles.is_throttled(&task.name, now))
            .map(|task| task.name.clone())
            .collect();

        if names.is_empty() {
            return false;
        }

        let items: Collection<WorkItem> = self.db.collection(tasks_collection);
        let claimed = items
            .find_one_and_update(
                claim_filter(&names, now),
                claim_update(now, &self.config),
            )
            .sort(doc! { "scheduledAt": 1 })
            .return_document(ReturnDocument::After)
            .await;

        let item = match claimed {
            Ok(Some(item)) => item,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(
                    target: "taskmill_runtime::worker",
                    "failed to claim a work item from `{tasks_collection}`: {e}"
                );
                self.callbacks.error("work item claim", &e);
                return false;
            }
        };

        let Some(task) = self.registry.get(&item.task) else {
            // Claimed something a concurrently deregistered task owned;
            // give the lease back.
            let _ = self
                .db
                .collection::<Document>(tasks_collection)
                .update_one(
                    doc! { "_id": &item.id, "status": "processing" },
                    doc! { "$set": { "status": "pending", "lockExpiresAt": null } },
                )
                .await;
            return false;
        };

        counter!("taskmill_reactive_claimed_total").increment(1);
        self.run_item(tasks_collection, item, task).await;
        true
    }

    async fn run_item(&self, tasks_collection: &str, item: WorkItem, task: Arc<ReactiveTask>) {
        let docs: Collection<Document> = self.db.collection(tasks_collection);

        let heartbeat = ContinuousHeartbeat::spawn(
            docs.clone(),
            doc! { "_id": &item.id, "status": { "$in": ["processing", "processing_dirty"] } },
            "lockExpiresAt",
            self.config.visibility_timeout,
            self.callbacks.clone(),
            "work item lease",
        );

        let state = Arc::new(ContextState {
            item: item.clone(),
            source: self.db.collection(&task.source_collection),
            tasks: docs.clone(),
            filter: task.filter.clone(),
            history_limit: task.execution_history_limit,
            defer_until: Mutex::new(None),
            completed_in_session: AtomicBool::new(false),
            throttles: self.throttles.clone(),
        });
        let ctx = TaskContext::new(state);

        tracing::debug!(
            target: "taskmill_runtime::worker",
            task = %task.name,
            item = %item.id,
            attempts = item.attempts,
            "running reactive task"
        );
        self.callbacks.info(
            InfoEvent::new(EventCode::ReactiveTaskStarted)
                .task(&task.name)
                .reason(item.id.clone()),
        );

        let inflight = gauge!("taskmill_reactive_inflight");
        inflight.increment(1);

        let invocation = TaskCall {
            task: task.name.clone(),
            invoke: (task.handler)(ctx.clone()),
        };
        let result = match AssertUnwindSafe((self.caller)(invocation))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => {
                let message: &str = if let Some(s) = payload.downcast_ref::<String>() {
                    s
                } else if let Some(s) = payload.downcast_ref::<&str>() {
                    s
                } else {
                    "Box<dyn Any>"
                };
                Err(anyhow::anyhow!("handler panicked: {message}"))
            }
        };

        inflight.decrement(1);
        heartbeat.stop().await;

        if let Err(e) = self.finalize(&docs, &item, &task, &ctx, result).await {
            tracing::warn!(
                target: "taskmill_runtime::worker",
                task = %task.name,
                item = %item.id,
                "failed to finalize work item: {e}"
            );
            self.callbacks.error("work item finalize", &e);
        }
    }

    async fn finalize(
        &self,
        docs: &Collection<Document>,
        item: &WorkItem,
        task: &ReactiveTask,
        ctx: &TaskContext,
        result: anyhow::Result<()>,
    ) -> Result<()> {
        let now = time::now();

        // The handler committed the status flip inside its own transaction.
        if ctx.was_completed_in_session() {
            self.callbacks.info(
                InfoEvent::new(EventCode::ReactiveTaskFinished)
                    .task(&task.name)
                    .reason(item.id.clone()),
            );
            return Ok(());
        }

        let condition_failed = matches!(
            result
                .as_ref()
                .err()
                .and_then(|e| e.downcast_ref::<Error>()),
            Some(Error::TaskConditionFailed)
        );

        if let Some(until) = ctx.deferred_until() {
            let error = result.as_ref().err().map(|e| format!("{e:#}"));
            let update = defer_update(item, now, until, error.as_deref(), task.execution_history_limit);
            docs.update_one(
                doc! { "_id": &item.id, "status": { "$in": ["processing", "processing_dirty"] } },
                update,
            )
            .await?;

            self.callbacks.info(
                InfoEvent::new(EventCode::ReactiveTaskFinished)
                    .task(&task.name)
                    .reason(format!("{} deferred", item.id)),
            );
            return Ok(());
        }

        match result {
            Ok(()) => {
                self.apply(
                    docs,
                    &item.id,
                    success_update(item, now, task.execution_history_limit),
                    dirty_success_update(item, now, task.execution_history_limit),
                )
                .await?;

                self.callbacks.info(
                    InfoEvent::new(EventCode::ReactiveTaskFinished)
                        .task(&task.name)
                        .reason(item.id.clone()),
                );
            }
            Err(_) if condition_failed => {
                // The source stopped qualifying; close the item without
                // counting a failure.
                self.apply(
                    docs,
                    &item.id,
                    success_update(item, now, task.execution_history_limit),
                    dirty_success_update(item, now, task.execution_history_limit),
                )
                .await?;

                self.callbacks.info(
                    InfoEvent::new(EventCode::ReactiveTaskFinished)
                        .task(&task.name)
                        .reason(format!("{} skipped", item.id)),
                );
            }
            Err(e) => {
                let message = format!("{e:#}");
                let first_error_at = item.first_error_at.unwrap_or(now);

                let next_at = if task.retry_policy.should_fail(
                    item.attempts,
                    Some(time::to_chrono(first_error_at)),
                    time::to_chrono(now),
                ) {
                    None
                } else {
                    Some(time::from_chrono(
                        task.retry_policy
                            .next_run(item.attempts, time::to_chrono(now))?,
                    ))
                };

                if next_at.is_none() {
                    counter!("taskmill_reactive_failed_total").increment(1);
                }

                self.apply(
                    docs,
                    &item.id,
                    retry_update(
                        item,
                        now,
                        first_error_at,
                        &message,
                        next_at,
                        task.execution_history_limit,
                    ),
                    dirty_retry_update(
                        item,
                        now,
                        first_error_at,
                        &message,
                        task.execution_history_limit,
                    ),
                )
                .await?;

                tracing::debug!(
                    target: "taskmill_runtime::worker",
                    task = %task.name,
                    item = %item.id,
                    attempts = item.attempts,
                    "reactive task failed: {message}"
                );
                self.callbacks.info(
                    InfoEvent::new(EventCode::ReactiveTaskFailed)
                        .task(&task.name)
                        .reason(message),
                );
            }
        }

        Ok(())
    }

    /// Apply `primary` to the item while it is still `processing`; when the
    /// planner promoted it to `processing_dirty` mid-run, apply the dirty
    /// variant instead (which sends it back to `pending` for the re-run).
    async fn apply(
        &self,
        docs: &Collection<Document>,
        id: &str,
        primary: Document,
        dirty: Document,
    ) -> Result<()> {
        let result = docs
            .update_one(doc! { "_id": id, "status": "processing" }, primary)
            .await?;

        if result.matched_count == 0 {
            docs.update_one(doc! { "_id": id, "status": "processing_dirty" }, dirty)
                .await?;
        }

        Ok(())
    }
}

fn claim_filter(names: &[String], now: DateTime) -> Document {
    doc! {
        "task": { "$in": names },
        "status": { "$in": ["pending", "processing", "processing_dirty"] },
        "scheduledAt": { "$lte": now },
        "$or": [
            { "lockExpiresAt": null },
            { "lockExpiresAt": { "$lt": now } },
        ],
    }
}

fn claim_update(now: DateTime, config: &SchedulerConfig) -> Document {
    doc! {
        "$set": {
            "status": "processing",
            "lockExpiresAt": time::after(now, config.visibility_timeout),
            "startedAt": now,
            "updatedAt": now,
        },
        "$inc": { "attempts": 1 },
    }
}

fn execution_record(item: &WorkItem, now: DateTime, error: Option<&str>) -> Document {
    let started_at = item.started_at.unwrap_or(now);
    let mut record = doc! {
        "startedAt": started_at,
        "finishedAt": now,
        "durationMs": now.timestamp_millis() - started_at.timestamp_millis(),
    };
    if let Some(error) = error {
        record.insert("error", error);
    }
    record
}

fn history_push(record: Document, limit: usize) -> Document {
    doc! {
        "executionHistory": {
            "$each": [record],
            "$position": 0,
            "$slice": limit as i64,
        }
    }
}

fn last_success(item: &WorkItem, now: DateTime) -> Document {
    let started_at = item.started_at.unwrap_or(now);
    doc! {
        "at": now,
        "durationMs": now.timestamp_millis() - started_at.timestamp_millis(),
    }
}

pub(crate) fn success_update(item: &WorkItem, now: DateTime, limit: usize) -> Document {
    doc! {
        "$set": {
            "status": "completed",
            "completedAt": now,
            "updatedAt": now,
            "lastFinalizedAt": now,
            "lockExpiresAt": null,
            "firstErrorAt": null,
            "lastError": null,
            "lastSuccess": last_success(item, now),
        },
        "$push": history_push(execution_record(item, now, None), limit),
    }
}

/// Success finalize for an item that went dirty mid-run: back to `pending`,
/// keeping the `scheduledAt` the planner refreshed.
fn dirty_success_update(item: &WorkItem, now: DateTime, limit: usize) -> Document {
    doc! {
        "$set": {
            "status": "pending",
            "updatedAt": now,
            "lastFinalizedAt": now,
            "lockExpiresAt": null,
            "firstErrorAt": null,
            "lastError": null,
            "lastSuccess": last_success(item, now),
        },
        "$push": history_push(execution_record(item, now, None), limit),
    }
}

/// Failure finalize: `next_at` of `Some` reschedules, `None` fails the item.
fn retry_update(
    item: &WorkItem,
    now: DateTime,
    first_error_at: DateTime,
    error: &str,
    next_at: Option<DateTime>,
    limit: usize,
) -> Document {
    let mut set = doc! {
        "updatedAt": now,
        "lastFinalizedAt": now,
        "lockExpiresAt": null,
        "firstErrorAt": first_error_at,
        "lastError": error,
    };

    match next_at {
        Some(next_at) => {
            set.insert("status", "pending");
            set.insert("scheduledAt", next_at);
        }
        None => {
            set.insert("status", "failed");
        }
    }

    doc! {
        "$set": set,
        "$push": history_push(execution_record(item, now, Some(error)), limit),
    }
}

/// Failure finalize for a dirty item: the planner already rescheduled it,
/// so it returns to `pending` on the planner's schedule.
fn dirty_retry_update(
    item: &WorkItem,
    now: DateTime,
    first_error_at: DateTime,
    error: &str,
    limit: usize,
) -> Document {
    doc! {
        "$set": {
            "status": "pending",
            "updatedAt": now,
            "lastFinalizedAt": now,
            "lockExpiresAt": null,
            "firstErrorAt": first_error_at,
            "lastError": error,
        },
        "$push": history_push(execution_record(item, now, Some(error)), limit),
    }
}

fn defer_update(
    item: &WorkItem,
    now: DateTime,
    until: DateTime,
    error: Option<&str>,
    limit: usize,
) -> Document {
    doc! {
        "$set": {
            "status": "pending",
            "scheduledAt": until,
            "updatedAt": now,
            "lastFinalizedAt": now,
            "lockExpiresAt": null,
        },
        "$push": history_push(execution_record(item, now, error), limit),
    }
}

#[cfg(test)]
mod tests {
    use mongodb::bson::Bson;
    use taskmill_core::task::TaskStatus;

    use super::*;

    fn item() -> WorkItem {
        let now = time::now();
        WorkItem {
            id: "greeter:d1".into(),
            task: "greeter".into(),
            source_doc_id: Bson::String("d1".into()),
            status: TaskStatus::Processing,
            attempts: 2,
            scheduled_at: now,
            initial_scheduled_at: now,
            created_at: now,
            updated_at: now,
            started_at: Some(now),
            completed_at: None,
            last_finalized_at: None,
            lock_expires_at: Some(now),
            first_error_at: None,
            last_error: None,
            last_observed_values: None,
            execution_history: Vec::new(),
            last_success: None,
        }
    }

    #[test]
    fn claim_admits_expired_leases_only() {
        let now = time::now();
        let filter = claim_filter(&["greeter".into()], now);

        let ors = filter.get_array("$or").unwrap();
        assert_eq!(ors.len(), 2);
        assert_eq!(
            filter.get_document("status").unwrap().get_array("$in").unwrap().len(),
            3
        );
    }

    #[test]
    fn claim_takes_the_lease_and_counts_the_attempt() {
        let now = time::now();
        let config = SchedulerConfig::default();
        let update = claim_update(now, &config);

        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get_str("status").unwrap(), "processing");
        let lease = set.get_datetime("lockExpiresAt").unwrap();
        assert_eq!(
            lease.timestamp_millis() - now.timestamp_millis(),
            config.visibility_timeout.as_millis() as i64
        );
        assert_eq!(
            update.get_document("$inc").unwrap().get_i32("attempts").unwrap(),
            1
        );
    }

    #[test]
    fn success_clears_the_failure_streak() {
        let now = time::now();
        let update = success_update(&item(), now, 5);
        let set = update.get_document("$set").unwrap();

        assert_eq!(set.get_str("status").unwrap(), "completed");
        assert_eq!(set.get("firstErrorAt"), Some(&Bson::Null));
        assert_eq!(set.get("lastError"), Some(&Bson::Null));
        assert_eq!(set.get("lockExpiresAt"), Some(&Bson::Null));

        let push = update.get_document("$push").unwrap();
        let history = push.get_document("executionHistory").unwrap();
        assert_eq!(history.get_i64("$slice").unwrap(), 5);
        assert_eq!(history.get_i32("$position").unwrap(), 0);
    }

    #[test]
    fn retry_reschedules_until_attempts_run_out() {
        let now = time::now();
        let next = time::after(now, std::time::Duration::from_millis(50));

        let update = retry_update(&item(), now, now, "boom", Some(next), 5);
        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get_str("status").unwrap(), "pending");
        assert_eq!(set.get_datetime("scheduledAt").unwrap(), &next);
        assert_eq!(set.get_str("lastError").unwrap(), "boom");

        let update = retry_update(&item(), now, now, "boom", None, 5);
        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get_str("status").unwrap(), "failed");
        assert!(set.get("scheduledAt").is_none());
    }

    #[test]
    fn dirty_finalize_keeps_the_planner_schedule() {
        let now = time::now();
        let update = dirty_success_update(&item(), now, 5);
        let set = update.get_document("$set").unwrap();

        assert_eq!(set.get_str("status").unwrap(), "pending");
        assert!(set.get("scheduledAt").is_none());
        assert!(set.get("completedAt").is_none());
    }

    #[test]
    fn defer_preserves_initial_schedule() {
        let now = time::now();
        let until = time::after(now, std::time::Duration::from_secs(300));
        let update = defer_update(&item(), now, until, None, 5);
        let set = update.get_document("$set").unwrap();

        assert_eq!(set.get_str("status").unwrap(), "pending");
        assert_eq!(set.get_datetime("scheduledAt").unwrap(), &until);
        assert!(set.get("initialScheduledAt").is_none());
    }

    #[test]
    fn failed_runs_keep_their_error_in_history() {
        let now = time::now();
        let record = execution_record(&item(), now, Some("boom"));
        assert_eq!(record.get_str("error").unwrap(), "boom");
        assert!(record.get_i64("durationMs").unwrap() >= 0);
    }

    #[test]
    fn throttle_map_expires() {
        let throttles = ThrottleMap::default();
        let now = time::now();

        throttles.set("greeter", time::after(now, std::time::Duration::from_secs(60)));
        assert!(throttles.is_throttled("greeter", now));
        assert!(!throttles.is_throttled("other", now));

        let later = time::after(now, std::time::Duration::from_secs(120));
        assert!(!throttles.is_throttled("greeter", later));
    }
}
