//! The leader-elected reactive planner.
//!
//! Exactly one process runs this loop at a time. It tails a database-level
//! change stream filtered to the registered tasks, batches events, feeds
//! them through the planning pipeline, and checkpoints the resume token in
//! the meta document. Reconciliation scans rebuild work items whenever the
//! stream history is incomplete or a task's trigger configuration changed,
//! and a periodic sweep removes orphaned items.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{StreamExt, TryStreamExt};
use mongodb::bson::{doc, from_bson, to_bson, Bson, Document, Timestamp};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::change_stream::ChangeStream;
use mongodb::options::FullDocumentType;
use mongodb::Database;
use taskmill_core::event::{Callbacks, EventCode, InfoEvent};
use taskmill_core::meta::{ReconciliationCheckpoint, TaskFingerprint};
use taskmill_core::task::OnHandlerVersionChange;
use taskmill_core::{
    is_history_lost, time, trigger_signature, Error, Result, SchedulerConfig,
};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::cleanup::cleanup_task;
use crate::flag::ShutdownFlag;
use crate::leader::LeaderElector;
use crate::lock::{DistributedLock, LockOptions};
use crate::meta::MetaStore;
use crate::plan::{change_stream_pipeline, planning_pipeline};
use crate::poller::PollingRunner;
use crate::registry::{ReactiveRegistry, ReactiveTask};

type EventStream = ChangeStream<ChangeStreamEvent<Document>>;

struct PendingEvent {
    collection: String,
    doc_id: Bson,
    deleted: bool,
}

enum PumpExit {
    Shutdown,
    LostLeadership,
    HistoryLost,
    /// The stream ended without an error; reopen from the checkpoint.
    Reopen,
}

pub struct ReactivePlanner {
    db: Database,
    registry: Arc<ReactiveRegistry>,
    config: SchedulerConfig,
    meta: MetaStore,
    poller: Arc<PollingRunner>,
    lock: DistributedLock,
    callbacks: Callbacks,
    shutdown: ShutdownFlag,
    next_cleanup: parking_lot::Mutex<Option<mongodb::bson::DateTime>>,
}

impl ReactivePlanner {
    pub fn new(
        db: Database,
        registry: Arc<ReactiveRegistry>,
        config: SchedulerConfig,
        meta: MetaStore,
        poller: Arc<PollingRunner>,
        lock: DistributedLock,
        shutdown: ShutdownFlag,
    ) -> Self {
        let callbacks = config.callbacks.clone();
        Self {
            db,
            registry,
            config,
            meta,
            poller,
            lock,
            callbacks,
            shutdown,
            next_cleanup: parking_lot::Mutex::new(None),
        }
    }

    /// Outer loop: wait for leadership, run a planning session, repeat.
    /// A session error surrenders leadership so another replica can try.
    pub async fn run(self: Arc<Self>, elector: Arc<LeaderElector>) {
        let mut leader_rx = elector.watch();

        loop {
            if self.shutdown.is_raised() {
                break;
            }

            if !*leader_rx.borrow() {
                tokio::select! {
                    _ = self.shutdown.wait() => break,
                    changed = leader_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            tracing::info!(target: "taskmill_runtime::planner", "planner session starting");
            self.callbacks
                .info(InfoEvent::new(EventCode::ReactiveTaskPlannerStarted));

            match self.lead(&mut leader_rx).await {
                Ok(()) => {}
                Err(e) => {
                    tracing::warn!(
                        target: "taskmill_runtime::planner",
                        "planner session failed: {e}"
                    );
                    self.callbacks.error("planner", &e);
                    self.callbacks.info(
                        InfoEvent::new(EventCode::ReactiveTaskPlannerStreamError)
                            .reason(e.to_string()),
                    );
                    elector.force_lose_leader().await;
                }
            }

            self.callbacks
                .info(InfoEvent::new(EventCode::ReactiveTaskPlannerStopped));
        }
    }

    fn should_stop(&self, leader_rx: &watch::Receiver<bool>) -> bool {
        self.shutdown.is_raised() || !*leader_rx.borrow()
    }

    async fn lead(&self, leader_rx: &mut watch::Receiver<bool>) -> Result<()> {
        if self.registry.is_empty() {
            // Nothing to plan; stay idle until leadership moves or we stop.
            tokio::select! {
                _ = self.shutdown.wait() => (),
                _ = leader_rx.changed() => (),
            }
            return Ok(());
        }

        loop {
            if self.should_stop(leader_rx) {
                return Ok(());
            }

            self.check_evolution().await?;

            // Open the stream before scanning so no event that happens
            // during reconciliation can be missed.
            let meta = self.meta.load().await?;
            let stream = match self
                .open_stream(meta.stream_state.resume_token.as_ref())
                .await
            {
                Ok(stream) => stream,
                Err(Error::Database(e)) if is_history_lost(&e) => {
                    self.handle_history_lost().await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let pending = self.pending_reconciliation().await?;
            if !pending.is_empty() {
                self.reconcile(pending, leader_rx).await?;
            }

            match self.pump(stream, leader_rx).await? {
                PumpExit::HistoryLost => {
                    self.handle_history_lost().await?;
                }
                PumpExit::Reopen => {}
                PumpExit::Shutdown | PumpExit::LostLeadership => return Ok(()),
            }
        }
    }

    /// Tail the stream, batching events by document key until the batch
    /// fills up or the window elapses.
    async fn pump(
        &self,
        mut stream: EventStream,
        leader_rx: &mut watch::Receiver<bool>,
    ) -> Result<PumpExit> {
        let mut batch: HashMap<String, PendingEvent> = HashMap::new();
        let mut window_deadline: Option<Instant> = None;
        let mut last_cluster_time: Option<Timestamp> = None;
        let mut last_saved_token: Option<Bson> = None;

        let idle_tick = self.config.batch_interval.max(Duration::from_secs(1));

        loop {
            if self.shutdown.is_raised() {
                return Ok(PumpExit::Shutdown);
            }
            if !*leader_rx.borrow() {
                return Ok(PumpExit::LostLeadership);
            }

            let wait = window_deadline
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(idle_tick);

            enum Polled {
                Shutdown,
                LeaderChanged,
                WindowElapsed,
                StreamEnded,
                StreamError(mongodb::error::Error),
                Event(Box<ChangeStreamEvent<Document>>),
            }

            let polled = tokio::select! {
                biased;

                _ = self.shutdown.wait() => Polled::Shutdown,
                changed = leader_rx.changed() => {
                    if changed.is_err() {
                        Polled::Shutdown
                    } else {
                        Polled::LeaderChanged
                    }
                }
                next = tokio::time::timeout(wait, stream.next()) => match next {
                    Err(_elapsed) => Polled::WindowElapsed,
                    Ok(None) => Polled::StreamEnded,
                    Ok(Some(Err(e))) => Polled::StreamError(e),
                    Ok(Some(Ok(event))) => Polled::Event(Box::new(event)),
                }
            };

            match polled {
                Polled::Shutdown => return Ok(PumpExit::Shutdown),
                // Loop around; the borrow at the top decides what changed.
                Polled::LeaderChanged => {}
                Polled::StreamEnded => return Ok(PumpExit::Reopen),
                Polled::StreamError(e) => {
                    if is_history_lost(&e) {
                        return Ok(PumpExit::HistoryLost);
                    }
                    return Err(e.into());
                }
                Polled::WindowElapsed => {
                    if batch.is_empty() {
                        // Idle: persist the token opportunistically and see
                        // whether a cleanup sweep is due.
                        self.save_checkpoint(&stream, None, &mut last_saved_token)
                            .await?;
                        if let Err(e) = self.cleanup_if_due().await {
                            tracing::warn!(
                                target: "taskmill_runtime::planner",
                                "cleanup sweep failed: {e}"
                            );
                            self.callbacks.error("cleanup", &e);
                        }
                    } else {
                        self.flush(&mut batch).await?;
                        self.save_checkpoint(&stream, last_cluster_time, &mut last_saved_token)
                            .await?;
                        window_deadline = None;
                    }
                }
                Polled::Event(event) => {
                    last_cluster_time = event.cluster_time.or(last_cluster_time);

                    if let Some((key, pending)) = classify(&event) {
                        batch.insert(key, pending);
                        if window_deadline.is_none() {
                            window_deadline = Some(Instant::now() + self.config.batch_interval);
                        }
                    }

                    if batch.len() >= self.config.batch_size {
                        self.flush(&mut batch).await?;
                        self.save_checkpoint(&stream, last_cluster_time, &mut last_saved_token)
                            .await?;
                        window_deadline = None;
                    }
                }
            }
        }
    }

    /// Plan one drained batch: deletes run the orphan sweep scoped to their
    /// ids, upserts run the planning pipeline, and the runner is woken once
    /// the debounce window has passed.
    async fn flush(&self, batch: &mut HashMap<String, PendingEvent>) -> Result<()> {
        let mut upserts: BTreeMap<String, Vec<Bson>> = BTreeMap::new();
        let mut deletes: BTreeMap<String, Vec<Bson>> = BTreeMap::new();

        for (_, event) in batch.drain() {
            let bucket = if event.deleted {
                &mut deletes
            } else {
                &mut upserts
            };
            bucket.entry(event.collection).or_default().push(event.doc_id);
        }

        for (collection, ids) in &deletes {
            for task in self.registry.for_source_collection(collection) {
                let removed =
                    cleanup_task(&self.db, &task, Some(ids.as_slice()), self.config.batch_size)
                        .await?;
                if removed > 0 {
                    self.callbacks.info(
                        InfoEvent::new(EventCode::ReactiveTaskCleanup)
                            .task(&task.name)
                            .reason(format!("{removed} removed")),
                    );
                }
            }
        }

        // Tasks-collection → soonest debounce among the tasks planned into it.
        let mut planned: BTreeMap<String, Duration> = BTreeMap::new();

        for (collection, ids) in &upserts {
            let source = self.db.collection::<Document>(collection);
            for task in self.registry.for_source_collection(collection) {
                let mut cursor = source.aggregate(planning_pipeline(&task, ids)).await?;
                while cursor.try_next().await?.is_some() {}

                planned
                    .entry(task.tasks_collection.clone())
                    .and_modify(|debounce| *debounce = (*debounce).min(task.debounce))
                    .or_insert(task.debounce);
            }
        }

        for (tasks_collection, debounce) in planned {
            self.wake_after_debounce(tasks_collection, debounce);
        }

        Ok(())
    }

    /// Wake the worker runner for `tasks_collection` once freshly planned
    /// items become claimable; waking earlier would have the poll race the
    /// debounce window and come up empty.
    fn wake_after_debounce(&self, tasks_collection: String, debounce: Duration) {
        let poller = self.poller.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.wait() => (),
                _ = tokio::time::sleep(debounce) => poller.speed_up(&tasks_collection),
            }
        });
    }

    async fn save_checkpoint(
        &self,
        stream: &EventStream,
        cluster_time: Option<Timestamp>,
        last_saved: &mut Option<Bson>,
    ) -> Result<()> {
        let Some(token) = stream.resume_token() else {
            return Ok(());
        };
        let token = to_bson(&token)?;

        if last_saved.as_ref() == Some(&token) {
            return Ok(());
        }

        self.meta.save_stream_state(Some(&token), cluster_time).await?;
        *last_saved = Some(token);
        Ok(())
    }

    async fn open_stream(&self, resume_token: Option<&Bson>) -> Result<EventStream> {
        let pipeline = change_stream_pipeline(&self.registry.all());
        let watch = self
            .db
            .watch()
            .pipeline(pipeline)
            .full_document(FullDocumentType::UpdateLookup);

        let stream = match resume_token {
            Some(token) => {
                let token: ResumeToken = from_bson(token.clone())?;
                watch.resume_after(token).await?
            }
            None => {
                // Capture the server's clock before attaching so events
                // racing the reconciliation scan are not lost.
                match self.operation_time().await? {
                    Some(ts) => watch.start_at_operation_time(ts).await?,
                    None => watch.await?,
                }
            }
        };

        Ok(stream)
    }

    async fn operation_time(&self) -> Result<Option<Timestamp>> {
        let response = self.db.run_command(doc! { "hello": 1 }).await?;

        if let Some(Bson::Timestamp(ts)) = response.get("operationTime") {
            return Ok(Some(*ts));
        }

        let cluster_time = response
            .get_document("$clusterTime")
            .ok()
            .and_then(|ct| match ct.get("clusterTime") {
                Some(Bson::Timestamp(ts)) => Some(*ts),
                _ => None,
            });

        Ok(cluster_time)
    }

    /// The resume point is unrecoverable: drop it and flag every task for
    /// reconciliation. Work items planned before the loss stay put.
    async fn handle_history_lost(&self) -> Result<()> {
        tracing::warn!(
            target: "taskmill_runtime::planner",
            "change stream history lost; scheduling reconciliation"
        );
        self.callbacks.info(
            InfoEvent::new(EventCode::ReactiveTaskPlannerStreamError)
                .reason("change stream history lost"),
        );

        self.meta.clear_resume_token().await?;

        let names: Vec<String> = self
            .registry
            .all()
            .into_iter()
            .map(|task| task.name.clone())
            .collect();
        self.meta.reset_reconciliation(&names).await?;

        Ok(())
    }

    /// Source collection → tasks whose reconciliation has not completed.
    async fn pending_reconciliation(&self) -> Result<BTreeMap<String, Vec<Arc<ReactiveTask>>>> {
        let meta = self.meta.load().await?;
        let mut pending: BTreeMap<String, Vec<Arc<ReactiveTask>>> = BTreeMap::new();

        for task in self.registry.all() {
            let done = meta.reconciliation.get(&task.name).copied().unwrap_or(false);
            if !done {
                pending
                    .entry(task.source_collection.clone())
                    .or_default()
                    .push(task);
            }
        }

        Ok(pending)
    }

    /// Page through each source collection in `_id` order, planning every
    /// page for the named tasks and checkpointing the cursor so another
    /// leader can pick up where we stopped.
    async fn reconcile(
        &self,
        pending: BTreeMap<String, Vec<Arc<ReactiveTask>>>,
        leader_rx: &watch::Receiver<bool>,
    ) -> Result<()> {
        for (collection, tasks) in pending {
            if self.should_stop(leader_rx) {
                return Ok(());
            }

            let mut names: Vec<String> = tasks.iter().map(|t| t.name.clone()).collect();
            names.sort_unstable();

            tracing::info!(
                target: "taskmill_runtime::planner",
                collection = %collection,
                tasks = ?names,
                "reconciliation starting"
            );
            self.callbacks.info(
                InfoEvent::new(EventCode::ReactiveTaskPlannerReconciliationStarted)
                    .reason(names.join(",")),
            );

            // Resume only when the saved scan covered exactly this task set;
            // a different set means the scan must restart from the top.
            let meta = self.meta.load().await?;
            let mut last_id: Option<Bson> = meta
                .reconciliation_state
                .get(&collection)
                .filter(|checkpoint| {
                    let mut saved = checkpoint.task_names.clone();
                    saved.sort_unstable();
                    saved == names
                })
                .map(|checkpoint| checkpoint.last_id.clone());

            let source = self.db.collection::<Document>(&collection);

            loop {
                if self.should_stop(leader_rx) {
                    // Checkpoint stays behind for the next leader.
                    return Ok(());
                }

                let filter = match &last_id {
                    Some(id) => doc! { "_id": { "$gt": id.clone() } },
                    None => doc! {},
                };

                let mut cursor = source
                    .find(filter)
                    .sort(doc! { "_id": 1 })
                    .limit(self.config.batch_size as i64)
                    .projection(doc! { "_id": 1 })
                    .await?;

                let mut ids = Vec::with_capacity(self.config.batch_size);
                while let Some(entry) = cursor.try_next().await? {
                    if let Some(id) = entry.get("_id") {
                        ids.push(id.clone());
                    }
                }

                if ids.is_empty() {
                    break;
                }

                for task in &tasks {
                    let mut merged = source.aggregate(planning_pipeline(task, &ids)).await?;
                    while merged.try_next().await?.is_some() {}
                }

                let page_len = ids.len();
                last_id = ids.pop();
                if let Some(id) = &last_id {
                    self.meta
                        .set_checkpoint(
                            &collection,
                            &ReconciliationCheckpoint {
                                last_id: id.clone(),
                                task_names: names.clone(),
                                updated_at: time::now(),
                            },
                        )
                        .await?;
                }

                if page_len < self.config.batch_size {
                    break;
                }
            }

            self.meta.clear_checkpoint(&collection).await?;

            for task in &tasks {
                let removed = cleanup_task(&self.db, task, None, self.config.batch_size).await?;
                if removed > 0 {
                    self.callbacks.info(
                        InfoEvent::new(EventCode::ReactiveTaskCleanup)
                            .task(&task.name)
                            .reason(format!("{removed} removed")),
                    );
                }
                self.meta.set_reconciled_at(&task.name, time::now()).await?;
                self.wake_after_debounce(task.tasks_collection.clone(), task.debounce);
            }

            tracing::info!(
                target: "taskmill_runtime::planner",
                collection = %collection,
                "reconciliation finished"
            );
            self.callbacks.info(
                InfoEvent::new(EventCode::ReactiveTaskPlannerReconciliationFinished)
                    .reason(names.join(",")),
            );
        }

        Ok(())
    }

    /// Compare each task's trigger signature and handler version against
    /// the persisted fingerprints and react per its evolution settings.
    async fn check_evolution(&self) -> Result<()> {
        let meta = self.meta.load().await?;

        for task in self.registry.all() {
            let sig = trigger_signature(&task.filter, task.watch_projection.as_deref());

            match meta.tasks.get(&task.name) {
                None => {
                    self.meta
                        .set_fingerprint(
                            &task.name,
                            &TaskFingerprint {
                                trigger_sig: sig,
                                handler_version: task.evolution.handler_version,
                                last_reconciled_at: None,
                            },
                        )
                        .await?;

                    if task.evolution.reconcile_on_trigger_change {
                        self.meta.set_reconciliation(&task.name, false).await?;
                    }
                }
                Some(known) => {
                    let mut changed = false;

                    if known.trigger_sig != sig {
                        tracing::info!(
                            target: "taskmill_runtime::planner",
                            task = %task.name,
                            "trigger configuration changed"
                        );
                        if task.evolution.reconcile_on_trigger_change {
                            self.meta.set_reconciliation(&task.name, false).await?;
                        }
                        changed = true;
                    }

                    match task.evolution.handler_version.cmp(&known.handler_version) {
                        std::cmp::Ordering::Greater => {
                            self.apply_handler_version_change(&task).await?;
                            changed = true;
                        }
                        std::cmp::Ordering::Less => {
                            tracing::warn!(
                                target: "taskmill_runtime::planner",
                                task = %task.name,
                                registered = task.evolution.handler_version,
                                known = known.handler_version,
                                "handler version went backwards; ignoring"
                            );
                        }
                        std::cmp::Ordering::Equal => {}
                    }

                    if changed {
                        self.meta
                            .set_fingerprint(
                                &task.name,
                                &TaskFingerprint {
                                    trigger_sig: sig,
                                    // Never persist a downgrade.
                                    handler_version: task
                                        .evolution
                                        .handler_version
                                        .max(known.handler_version),
                                    last_reconciled_at: known.last_reconciled_at,
                                },
                            )
                            .await?;
                    }
                }
            }
        }

        Ok(())
    }

    async fn apply_handler_version_change(&self, task: &ReactiveTask) -> Result<()> {
        let status = match task.evolution.on_handler_version_change {
            OnHandlerVersionChange::None => return Ok(()),
            OnHandlerVersionChange::ReprocessFailed => doc! { "status": "failed" },
            OnHandlerVersionChange::ReprocessAll => {
                doc! { "status": { "$in": ["completed", "failed"] } }
            }
        };

        let mut filter = doc! { "task": &task.name };
        filter.extend(status);

        let now = time::now();
        let result = self
            .db
            .collection::<Document>(&task.tasks_collection)
            .update_many(
                filter,
                doc! { "$set": {
                    "status": "pending",
                    "attempts": 0,
                    "scheduledAt": now,
                    "updatedAt": now,
                    "firstErrorAt": Bson::Null,
                    "lastError": Bson::Null,
                    "lockExpiresAt": Bson::Null,
                } },
            )
            .await?;

        tracing::info!(
            target: "taskmill_runtime::planner",
            task = %task.name,
            reprocessed = result.modified_count,
            "handler version rose; items reset for reprocessing"
        );

        Ok(())
    }

    /// Leader-owned periodic cleanup, guarded by a distributed lock and a
    /// re-check of `lastCleanupAt` so parallel leaders within the lock
    /// window stay idempotent.
    async fn cleanup_if_due(&self) -> Result<()> {
        let now = time::now();
        if let Some(next) = *self.next_cleanup.lock() {
            if now < next {
                return Ok(());
            }
        }

        let interval = self.config.cleanup_interval;
        let meta = self.meta.load().await?;
        if let Some(last) = meta.last_cleanup_at {
            let due_at = time::after(last, interval);
            if now < due_at {
                *self.next_cleanup.lock() = Some(due_at);
                return Ok(());
            }
        }

        let key = format!("{}:cleanup", self.config.collections.reactive_meta);
        let handle = match self
            .lock
            .acquire(
                &key,
                LockOptions {
                    max_wait: Some(Duration::ZERO),
                    ..LockOptions::default()
                },
            )
            .await
        {
            Ok(handle) => handle,
            Err(Error::LockAlreadyAcquired(_)) => {
                *self.next_cleanup.lock() = Some(time::from_now(Duration::from_secs(30)));
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let outcome = self.run_cleanup(now, interval).await;
        let released = handle.release().await;

        *self.next_cleanup.lock() = Some(time::from_now(interval));
        outcome?;
        released
    }

    async fn run_cleanup(
        &self,
        now: mongodb::bson::DateTime,
        interval: Duration,
    ) -> Result<()> {
        // Somebody else may have swept between our read and the lock.
        let meta = self.meta.load().await?;
        let still_due = meta
            .last_cleanup_at
            .map(|last| time::after(last, interval) <= now)
            .unwrap_or(true);
        if !still_due {
            return Ok(());
        }

        let mut total = 0_u64;
        for task in self.registry.all() {
            let removed = cleanup_task(&self.db, &task, None, self.config.batch_size).await?;
            if removed > 0 {
                self.callbacks.info(
                    InfoEvent::new(EventCode::ReactiveTaskCleanup)
                        .task(&task.name)
                        .reason(format!("{removed} removed")),
                );
            }
            total += removed;
        }

        self.meta.set_last_cleanup_at(now).await?;

        if total > 0 {
            tracing::info!(
                target: "taskmill_runtime::planner",
                total,
                "cleanup sweep removed orphaned work items"
            );
        }

        Ok(())
    }
}

/// Batch key and pending entry for one raw change event. Coalescing is by
/// `(collection, documentKey._id)`, the last operation winning.
fn classify(event: &ChangeStreamEvent<Document>) -> Option<(String, PendingEvent)> {
    let deleted = match event.operation_type {
        OperationType::Insert | OperationType::Update | OperationType::Replace => false,
        OperationType::Delete => true,
        _ => return None,
    };

    let collection = event.ns.as_ref()?.coll.clone()?;
    let doc_id = event.document_key.as_ref()?.get("_id")?.clone();
    let key = format!("{collection}\u{0}{doc_id:?}");

    Some((
        key,
        PendingEvent {
            collection,
            doc_id,
            deleted,
        },
    ))
}
