//! TTL-based distributed mutex and the shared lease-renewal primitive.

use std::time::Duration;

use mongodb::bson::{doc, Document};
use mongodb::Collection;
use rand::Rng;
use taskmill_core::event::Callbacks;
use taskmill_core::{is_duplicate_key, time, Error, Result, SchedulerConfig};
use tokio::time::Instant;

use crate::flag::ShutdownFlag;

/// Background renewal of a lease field on a single document.
///
/// Every `expire_in / 5` the heartbeat atomically pushes the field to
/// `now + expire_in`. Renewal errors are reported and swallowed; if the
/// store stays unreachable the lease simply expires, which lease consumers
/// must tolerate by being idempotent.
pub struct ContinuousHeartbeat {
    shutdown: ShutdownFlag,
    handle: tokio::task::JoinHandle<()>,
}

impl ContinuousHeartbeat {
    pub fn spawn(
        collection: Collection<Document>,
        filter: Document,
        field: &'static str,
        expire_in: Duration,
        callbacks: Callbacks,
        context: &'static str,
    ) -> Self {
        let shutdown = ShutdownFlag::new();
        let period = SchedulerConfig::renewal_period(expire_in);

        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                loop {
                    tokio::select! {
                        biased;

                        _ = shutdown.wait() => break,
                        _ = tokio::time::sleep(period) => ()
                    }

                    let update = doc! { "$set": { field: time::from_now(expire_in) } };
                    if let Err(e) = collection.update_one(filter.clone(), update).await {
                        tracing::warn!(
                            target: "taskmill_runtime::heartbeat",
                            "{context}: failed to renew lease: {e}"
                        );
                        callbacks.error(context, &e);
                    }
                }
            }
        });

        Self { shutdown, handle }
    }

    /// Stop renewing. Waits out an in-flight renewal so no write lands
    /// after this returns.
    pub async fn stop(self) {
        self.shutdown.raise();
        let _ = self.handle.await;
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LockOptions {
    /// Lock TTL; defaults to the engine `lock_ttl`.
    pub expire_in: Option<Duration>,
    /// Acquisition budget; defaults to the engine `max_wait_for_lock`.
    /// `Duration::ZERO` means a single attempt.
    pub max_wait: Option<Duration>,
}

/// Handle to a held lock. Call [`LockHandle::release`] when done; an
/// unreleased handle leaves the document behind for the TTL index to reap.
#[must_use = "an unreleased lock blocks other holders until its TTL expires"]
pub struct LockHandle {
    collection: Collection<Document>,
    key: String,
    lock_id: String,
    heartbeat: Option<ContinuousHeartbeat>,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Remove the lock document and stop the heartbeat. Deleting is guarded
    /// by our own `lockId` so a lock that expired and was re-acquired by
    /// someone else is left alone.
    pub async fn release(mut self) -> Result<()> {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await;
        }

        self.collection
            .delete_one(doc! { "_id": &self.key, "lockId": &self.lock_id })
            .await?;

        Ok(())
    }
}

/// Distributed mutex keyed by string, backed by the lock collection.
#[derive(Clone)]
pub struct DistributedLock {
    collection: Collection<Document>,
    lock_ttl: Duration,
    max_wait_for_lock: Duration,
    starting_delay: Duration,
    callbacks: Callbacks,
}

const STARTING_DELAY: Duration = Duration::from_millis(50);

impl DistributedLock {
    pub fn new(
        collection: Collection<Document>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            collection,
            lock_ttl: config.lock_ttl,
            max_wait_for_lock: config.max_wait_for_lock,
            starting_delay: STARTING_DELAY,
            callbacks: config.callbacks.clone(),
        }
    }

    /// Acquire `key`, retrying with jittered exponential backoff until the
    /// wait budget is spent. The final sleep is truncated so one last
    /// attempt still happens inside the budget.
    pub async fn acquire(&self, key: &str, options: LockOptions) -> Result<LockHandle> {
        let expire_in = options.expire_in.unwrap_or(self.lock_ttl);
        let max_wait = options.max_wait.unwrap_or(self.max_wait_for_lock);
        let cap = (max_wait / 3).max(self.starting_delay);

        let lock_id = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + max_wait;
        let mut delay = self.starting_delay;

        loop {
            match self.try_acquire(key, &lock_id, expire_in).await {
                Ok(true) => {
                    let heartbeat = ContinuousHeartbeat::spawn(
                        self.collection.clone(),
                        doc! { "_id": key, "lockId": &lock_id },
                        "expiresAt",
                        expire_in,
                        self.callbacks.clone(),
                        "lock heartbeat",
                    );

                    return Ok(LockHandle {
                        collection: self.collection.clone(),
                        key: key.to_owned(),
                        lock_id,
                        heartbeat: Some(heartbeat),
                    });
                }
                Ok(false) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::LockAlreadyAcquired(key.to_owned()));
                    }

                    let jitter = rand::thread_rng().gen_range(0.75..1.25);
                    let wait = delay.mul_f64(jitter).min(cap).min(remaining);
                    tokio::time::sleep(wait).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => {
                    // Unknown failure mid-acquire: make sure no half-written
                    // lock of ours survives, then propagate.
                    let _ = self
                        .collection
                        .delete_one(doc! { "_id": key, "lockId": &lock_id })
                        .await;
                    return Err(e);
                }
            }
        }
    }

    /// One conditional-upsert attempt: replace the document iff it expired.
    /// A duplicate-key failure means somebody else holds it.
    async fn try_acquire(&self, key: &str, lock_id: &str, expire_in: Duration) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": key, "expiresAt": { "$lte": time::now() } },
                doc! { "$set": {
                    "lockId": lock_id,
                    "expiresAt": time::from_now(expire_in),
                } },
            )
            .upsert(true)
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
