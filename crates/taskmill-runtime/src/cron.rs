//! The distributed cron scheduler.
//!
//! Every process runs one coordinator loop and contends for per-task lock
//! documents; whichever claims a due task runs it. Missed runs recover via
//! lock expiry, and `runLog` keeps the five newest outcomes on the task
//! document itself.

use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use metrics::counter;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::ReturnDocument;
use mongodb::{Collection, Database};
use parking_lot::{Mutex, RwLock};
use taskmill_core::cron::{CronTaskDoc, RUN_LOG_LIMIT};
use taskmill_core::event::{Callbacks, EventCode, InfoEvent};
use taskmill_core::{time, Error, Interval, Result};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use crate::flag::ShutdownFlag;
use crate::lock::ContinuousHeartbeat;

tokio::task_local! {
    /// Set while a cron handler runs, so a handler calling back into
    /// `run_task` can be caught as a programmer error instead of
    /// deadlocking on its own lock.
    static CURRENT_CRON_TASK: String;
}

pub type CronHandler = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub struct CronCall {
    pub id: String,
    pub invoke: BoxFuture<'static, anyhow::Result<()>>,
}

/// Wrapper around every cron handler invocation, mirroring the reactive
/// task caller.
pub type CronTaskCaller = Arc<dyn Fn(CronCall) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub fn default_cron_caller() -> CronTaskCaller {
    Arc::new(|call: CronCall| call.invoke)
}

struct RegisteredCronTask {
    id: String,
    interval: Interval,
    handler: CronHandler,
}

struct Enforced {
    id: String,
    done: oneshot::Sender<std::result::Result<(), String>>,
}

struct CronInner {
    db: Database,
    collection_name: String,
    lock_time: Duration,
    callbacks: Callbacks,
    caller: CronTaskCaller,
    tasks: RwLock<BTreeMap<String, Arc<RegisteredCronTask>>>,
    enforced: Mutex<VecDeque<Enforced>>,
    wake: Notify,
    task_filter: Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>,
}

pub struct CronScheduler {
    inner: Arc<CronInner>,
    run: Mutex<Option<(ShutdownFlag, JoinHandle<()>)>>,
}

const IDLE_POLL_CAP: Duration = Duration::from_secs(5);
const ENFORCED_RETRY: Duration = Duration::from_millis(100);

impl CronScheduler {
    pub fn new(
        db: Database,
        collection_name: String,
        lock_time: Duration,
        callbacks: Callbacks,
        caller: CronTaskCaller,
        task_filter: Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>,
    ) -> Self {
        Self {
            inner: Arc::new(CronInner {
                db,
                collection_name,
                lock_time,
                callbacks,
                caller,
                tasks: RwLock::new(BTreeMap::new()),
                enforced: Mutex::new(VecDeque::new()),
                wake: Notify::new(),
                task_filter,
            }),
            run: Mutex::new(None),
        }
    }

    /// Register a cron task. The persisted document is created with
    /// `$setOnInsert`, so a restart keeps the existing schedule.
    pub async fn register<F, Fut>(&self, id: &str, interval: Interval, handler: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if id.is_empty() {
            return Err(Error::InvalidTaskName {
                name: id.to_owned(),
                reason: "cron task id must not be empty",
            });
        }

        {
            let mut tasks = self.inner.tasks.write();
            if tasks.contains_key(id) {
                return Err(Error::DuplicateTask(id.to_owned()));
            }

            tasks.insert(
                id.to_owned(),
                Arc::new(RegisteredCronTask {
                    id: id.to_owned(),
                    interval: interval.clone(),
                    handler: Arc::new(move || Box::pin(handler())),
                }),
            );
        }

        let first_run = time::from_chrono(interval.next_after(time::to_chrono(time::now()))?);
        self.inner
            .collection()
            .update_one(
                doc! { "_id": id },
                doc! { "$setOnInsert": {
                    "runSince": first_run,
                    "runImmediately": false,
                    "lockedTill": null,
                    "runLog": [],
                } },
            )
            .upsert(true)
            .await?;

        // A sleeping coordinator may now have an earlier deadline.
        self.inner.wake.notify_waiters();
        Ok(())
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.inner.tasks.read().contains_key(id)
    }

    pub fn is_running(&self) -> bool {
        self.run.lock().is_some()
    }

    /// Start the coordinator loop. Idempotent.
    pub fn start(&self) {
        let mut run = self.run.lock();
        if run.is_some() {
            return;
        }

        let shutdown = ShutdownFlag::new();
        let inner = self.inner.clone();
        let flag = shutdown.clone();
        let handle = tokio::spawn(async move {
            coordinator(inner, flag).await;
        });

        *run = Some((shutdown, handle));
    }

    /// Stop the coordinator; an in-flight task finishes under its lock.
    /// Pending enforced runs are failed.
    pub async fn stop(&self) {
        let run = self.run.lock().take();
        if let Some((shutdown, handle)) = run {
            shutdown.raise();
            self.inner.wake.notify_waiters();
            let _ = handle.await;
        }

        let drained: Vec<Enforced> = self.inner.enforced.lock().drain(..).collect();
        for enforced in drained {
            let _ = enforced.done.send(Err("cron scheduler stopped".into()));
        }
    }

    /// Flag the task to run as soon as any process claims it.
    pub async fn schedule_immediately(&self, id: &str) -> Result<()> {
        if !self.is_registered(id) {
            return Err(Error::UnknownCronTask(id.to_owned()));
        }

        self.inner
            .collection()
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { "runImmediately": true } },
            )
            .await?;

        self.inner.callbacks.info(
            InfoEvent::new(EventCode::ManualTrigger).task(id),
        );
        self.inner.wake.notify_waiters();
        Ok(())
    }

    /// Run the task on *this* process and resolve when it actually
    /// finished. Calling this from inside a cron handler is an error.
    pub async fn run_task(&self, id: &str) -> Result<()> {
        if CURRENT_CRON_TASK.try_with(|_| ()).is_ok() {
            return Err(Error::RecursiveCronCall);
        }
        if !self.is_registered(id) {
            return Err(Error::UnknownCronTask(id.to_owned()));
        }
        if !self.is_running() {
            return Err(Error::Stopped);
        }

        let (done, result) = oneshot::channel();
        self.inner.enforced.lock().push_back(Enforced {
            id: id.to_owned(),
            done,
        });
        self.inner.callbacks.info(
            InfoEvent::new(EventCode::ManualTrigger).task(id),
        );
        self.inner.wake.notify_waiters();

        match result.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(Error::CronTaskFailed {
                id: id.to_owned(),
                message,
            }),
            Err(_) => Err(Error::Stopped),
        }
    }
}

impl CronInner {
    fn collection(&self) -> Collection<CronTaskDoc> {
        self.db.collection(&self.collection_name)
    }

    fn raw_collection(&self) -> Collection<Document> {
        self.db.collection(&self.collection_name)
    }

    fn eligible_ids(&self) -> Vec<String> {
        self.tasks
            .read()
            .keys()
            .filter(|id| {
                self.task_filter
                    .as_ref()
                    .map(|allows| allows(id))
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    fn registered(&self, id: &str) -> Option<Arc<RegisteredCronTask>> {
        self.tasks.read().get(id).cloned()
    }
}

async fn coordinator(inner: Arc<CronInner>, shutdown: ShutdownFlag) {
    loop {
        if shutdown.is_raised() {
            break;
        }

        match claim_next(&inner, &shutdown).await {
            Ok(Some((claimed, registered, enforced))) => {
                run_claimed(&inner, claimed, registered, enforced).await;
            }
            Ok(None) => {
                let delay = idle_delay(&inner).await;
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = inner.wake.notified() => (),
                    _ = tokio::time::sleep(delay) => (),
                }
            }
            Err(e) => {
                tracing::warn!(target: "taskmill_runtime::cron", "cron claim failed: {e}");
                inner.callbacks.error("cron claim", &e);
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => (),
                }
            }
        }
    }
}

type Claimed = (CronTaskDoc, Arc<RegisteredCronTask>, Option<Enforced>);

/// Claim the next runnable task. Enforced entries are preferred and run
/// regardless of their schedule; everything else must be due (or manually
/// triggered) and unlocked.
async fn claim_next(inner: &Arc<CronInner>, shutdown: &ShutdownFlag) -> Result<Option<Claimed>> {
    let now = time::now();

    // Enforced runs first.
    let enforced = inner.enforced.lock().pop_front();
    if let Some(enforced) = enforced {
        let Some(registered) = inner.registered(&enforced.id) else {
            let _ = enforced
                .done
                .send(Err(format!("cron task `{}` is not registered", enforced.id)));
            return Ok(None);
        };

        let claimed = claim_one(
            inner,
            doc! {
                "_id": &enforced.id,
                "$or": [
                    { "lockedTill": null },
                    { "lockedTill": { "$lt": now } },
                ],
            },
            now,
        )
        .await?;

        match claimed {
            Some(doc) => {
                if rollback_if_stopped(inner, shutdown, &doc, Some(&enforced)).await? {
                    return Ok(None);
                }
                return Ok(Some((doc, registered, Some(enforced))));
            }
            None => {
                // Locked elsewhere right now; retry shortly.
                inner.enforced.lock().push_back(enforced);
                return Ok(None);
            }
        }
    }

    let ids = inner.eligible_ids();
    if ids.is_empty() {
        return Ok(None);
    }

    let claimed = claim_one(
        inner,
        doc! {
            "_id": { "$in": &ids[..] },
            "$and": [
                { "$or": [
                    { "runSince": { "$lte": now } },
                    { "runImmediately": true },
                ] },
                { "$or": [
                    { "lockedTill": null },
                    { "lockedTill": { "$lt": now } },
                ] },
            ],
        },
        now,
    )
    .await?;

    let Some(doc) = claimed else {
        return Ok(None);
    };
    if rollback_if_stopped(inner, shutdown, &doc, None).await? {
        return Ok(None);
    }

    let Some(registered) = inner.registered(&doc.id) else {
        // Claimed a task registered by an older process generation; put it
        // back untouched.
        rollback(inner, &doc.id).await?;
        return Ok(None);
    };

    Ok(Some((doc, registered, None)))
}

async fn claim_one(
    inner: &Arc<CronInner>,
    filter: Document,
    now: mongodb::bson::DateTime,
) -> Result<Option<CronTaskDoc>> {
    let claimed = inner
        .collection()
        .find_one_and_update(
            filter,
            doc! {
                "$set": {
                    "lockedTill": time::after(now, inner.lock_time),
                    "runImmediately": false,
                },
                "$push": { "runLog": {
                    "$each": [ { "startedAt": now, "finishedAt": null, "error": null } ],
                    "$position": 0,
                    "$slice": RUN_LOG_LIMIT as i64,
                } },
            },
        )
        .sort(doc! { "runImmediately": -1, "runSince": 1, "runLog.0.finishedAt": 1 })
        .return_document(ReturnDocument::After)
        .await?;

    Ok(claimed)
}

/// A stop may race a successful claim; undo it so another process picks the
/// task up cleanly.
async fn rollback_if_stopped(
    inner: &Arc<CronInner>,
    shutdown: &ShutdownFlag,
    doc: &CronTaskDoc,
    enforced: Option<&Enforced>,
) -> Result<bool> {
    if !shutdown.is_raised() {
        return Ok(false);
    }

    rollback(inner, &doc.id).await?;
    if let Some(enforced) = enforced {
        // The sender half is consumed on drop at the caller; just log here.
        tracing::debug!(
            target: "taskmill_runtime::cron",
            id = %enforced.id,
            "enforced run rolled back by shutdown"
        );
    }

    Ok(true)
}

async fn rollback(inner: &Arc<CronInner>, id: &str) -> Result<()> {
    inner
        .raw_collection()
        .update_one(
            doc! { "_id": id },
            doc! {
                "$set": { "lockedTill": null },
                "$pop": { "runLog": -1 },
            },
        )
        .await?;

    Ok(())
}

async fn run_claimed(
    inner: &Arc<CronInner>,
    doc: CronTaskDoc,
    registered: Arc<RegisteredCronTask>,
    enforced: Option<Enforced>,
) {
    let id = registered.id.clone();

    tracing::debug!(target: "taskmill_runtime::cron", id = %id, "cron task starting");
    inner
        .callbacks
        .info(InfoEvent::new(EventCode::CronTaskStarted).task(&id));
    counter!("taskmill_cron_runs_total").increment(1);

    let heartbeat = ContinuousHeartbeat::spawn(
        inner.raw_collection(),
        doc! { "_id": &doc.id },
        "lockedTill",
        inner.lock_time,
        inner.callbacks.clone(),
        "cron task lock",
    );

    let call = CronCall {
        id: id.clone(),
        invoke: (registered.handler)(),
    };
    let outcome = CURRENT_CRON_TASK
        .scope(
            id.clone(),
            AssertUnwindSafe((inner.caller)(call)).catch_unwind(),
        )
        .await;

    let result: anyhow::Result<()> = match outcome {
        Ok(result) => result,
        Err(payload) => {
            let message: &str = if let Some(s) = payload.downcast_ref::<String>() {
                s
            } else if let Some(s) = payload.downcast_ref::<&str>() {
                s
            } else {
                "Box<dyn Any>"
            };
            Err(anyhow::anyhow!("cron task panicked: {message}"))
        }
    };

    // Stop renewing before the finishing write so the lock release below is
    // never overwritten by a late heartbeat.
    heartbeat.stop().await;

    let now = time::now();
    let next_run = match registered.interval.next_after(time::to_chrono(now)) {
        Ok(next) => time::from_chrono(next),
        Err(e) => {
            tracing::warn!(
                target: "taskmill_runtime::cron",
                id = %id,
                "no future occurrence, retrying in 5 minutes: {e}"
            );
            inner.callbacks.error("cron schedule", &e);
            time::from_now(Duration::from_secs(300))
        }
    };

    let error_message = result.as_ref().err().map(|e| format!("{e:#}"));
    let finish = inner
        .raw_collection()
        .update_one(
            doc! { "_id": &doc.id },
            doc! { "$set": {
                "runSince": next_run,
                "lockedTill": null,
                "runLog.0.finishedAt": now,
                "runLog.0.error": error_message
                    .as_deref()
                    .map(Bson::from)
                    .unwrap_or(Bson::Null),
            } },
        )
        .await;

    if let Err(e) = finish {
        tracing::warn!(
            target: "taskmill_runtime::cron",
            id = %id,
            "failed to finalize cron run: {e}"
        );
        inner.callbacks.error("cron finalize", &e);
    }

    match &error_message {
        None => {
            tracing::debug!(target: "taskmill_runtime::cron", id = %id, "cron task finished");
            inner
                .callbacks
                .info(InfoEvent::new(EventCode::CronTaskFinished).task(&id));
        }
        Some(message) => {
            tracing::debug!(
                target: "taskmill_runtime::cron",
                id = %id,
                "cron task failed: {message}"
            );
            counter!("taskmill_cron_failed_total").increment(1);
            inner.callbacks.info(
                InfoEvent::new(EventCode::CronTaskFailed)
                    .task(&id)
                    .reason(message.clone()),
            );
        }
    }

    inner.callbacks.info(
        InfoEvent::new(EventCode::CronTaskScheduled)
            .task(&id)
            .reason(format!("next run at {next_run}")),
    );

    if let Some(enforced) = enforced {
        let _ = enforced.done.send(match error_message {
            None => Ok(()),
            Some(message) => Err(message),
        });
    }
}

/// How long to sleep when nothing was claimable: until the soonest
/// scheduled run, capped at five seconds, and much shorter when an
/// enforced run is waiting on a lock held elsewhere.
async fn idle_delay(inner: &Arc<CronInner>) -> Duration {
    if !inner.enforced.lock().is_empty() {
        return ENFORCED_RETRY;
    }

    let ids = inner.eligible_ids();
    if ids.is_empty() {
        return IDLE_POLL_CAP;
    }

    let soonest = inner
        .collection()
        .find_one(doc! { "_id": { "$in": &ids[..] } })
        .sort(doc! { "runSince": 1 })
        .await;

    match soonest {
        Ok(Some(doc)) => time::until(doc.run_since).min(IDLE_POLL_CAP),
        Ok(None) => IDLE_POLL_CAP,
        Err(_) => Duration::from_secs(1),
    }
}
