//! Leader election over the planner meta document.
//!
//! Every process ticks a conditional pipeline update against the single
//! meta document: take (or renew) the `lock` field iff it is missing,
//! expired, or already ours, else leave it untouched. Reading back the
//! owner after the update tells us which side of the election we are on.

use std::sync::Arc;
use std::time::Duration;

use mongodb::bson::{doc, Document};
use mongodb::options::{ReturnDocument, UpdateModifications};
use mongodb::Collection;
use taskmill_core::event::{Callbacks, EventCode, InfoEvent};
use taskmill_core::meta::META_DOC_ID;
use taskmill_core::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::flag::ShutdownFlag;

pub struct LeaderElector {
    inner: Arc<Inner>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    collection: Collection<Document>,
    instance_id: String,
    ttl: Duration,
    heartbeat: Duration,
    callbacks: Callbacks,
    shutdown: ShutdownFlag,
    state: watch::Sender<bool>,
}

impl LeaderElector {
    pub fn new(
        collection: Collection<Document>,
        instance_id: String,
        ttl: Duration,
        heartbeat: Duration,
        callbacks: Callbacks,
    ) -> Self {
        let (state, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                collection,
                instance_id,
                ttl,
                heartbeat,
                callbacks,
                shutdown: ShutdownFlag::new(),
                state,
            }),
            handle: parking_lot::Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Subscribe to leadership transitions. The value is `true` while this
    /// process believes it is the leader.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.inner.state.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        *self.inner.state.borrow()
    }

    pub fn start(&self) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                if inner.shutdown.is_raised() {
                    break;
                }

                if let Err(e) = inner.tick().await {
                    tracing::warn!(
                        target: "taskmill_runtime::leader",
                        "election tick failed: {e}"
                    );
                    inner.callbacks.error("leader election", &e);

                    // Any store error while leader surrenders leadership
                    // locally; another replica may take over while we retry.
                    inner.publish(false);
                }

                tokio::select! {
                    biased;

                    _ = inner.shutdown.wait() => break,
                    _ = tokio::time::sleep(inner.heartbeat) => ()
                }
            }
        });

        *self.handle.lock() = Some(handle);
    }

    /// Surrender leadership without stopping the election loop. Used by the
    /// planner when the change stream fails in a way another replica might
    /// handle better.
    pub async fn force_lose_leader(&self) {
        self.inner.relinquish().await;
    }

    pub async fn stop(&self) {
        self.inner.shutdown.raise();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.inner.relinquish().await;
    }
}

impl Inner {
    async fn tick(&self) -> Result<()> {
        let ttl_ms = self.ttl.as_millis() as i64;

        // Two-stage expression: claim the lock iff it is missing, expired,
        // or already ours; otherwise keep whatever is there.
        let claim = vec![doc! { "$set": { "lock": { "$cond": [
            { "$or": [
                { "$eq": [ { "$type": "$lock" }, "missing" ] },
                { "$lte": [ "$lock.expiresAt", "$$NOW" ] },
                { "$eq": [ "$lock.instanceId", &self.instance_id ] },
            ] },
            { "instanceId": &self.instance_id, "expiresAt": {
                "$dateAdd": { "startDate": "$$NOW", "unit": "millisecond", "amount": ttl_ms }
            } },
            "$lock",
        ] } } }];

        let meta = self
            .collection
            .find_one_and_update(
                doc! { "_id": META_DOC_ID },
                UpdateModifications::Pipeline(claim),
            )
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await?;

        let owner = meta
            .as_ref()
            .and_then(|m| m.get_document("lock").ok())
            .and_then(|lock| lock.get_str("instanceId").ok());

        self.publish(owner == Some(self.instance_id.as_str()));
        Ok(())
    }

    fn publish(&self, is_leader: bool) {
        let was_leader = *self.state.borrow();
        if was_leader == is_leader {
            return;
        }

        self.state.send_replace(is_leader);

        if is_leader {
            tracing::info!(
                target: "taskmill_runtime::leader",
                instance_id = %self.instance_id,
                "became planner leader"
            );
        } else {
            tracing::info!(
                target: "taskmill_runtime::leader",
                instance_id = %self.instance_id,
                "lost planner leadership"
            );
            self.callbacks
                .info(InfoEvent::new(EventCode::ReactiveTaskLeaderLockLost));
        }
    }

    /// Drop the lock field, guarded by our own instance id, and publish
    /// the loss.
    async fn relinquish(&self) {
        let result = self
            .collection
            .update_one(
                doc! { "_id": META_DOC_ID, "lock.instanceId": &self.instance_id },
                doc! { "$unset": { "lock": 1 } },
            )
            .await;

        if let Err(e) = result {
            tracing::warn!(
                target: "taskmill_runtime::leader",
                "failed to release leader lock: {e}"
            );
            self.callbacks.error("leader release", &e);
        }

        self.publish(false);
    }
}
