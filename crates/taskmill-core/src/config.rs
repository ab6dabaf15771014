use std::time::Duration;

use crate::event::Callbacks;

/// Collections the scheduler owns inside the configured database.
#[derive(Clone, Debug)]
pub struct CollectionNames {
    /// Work items of reactive tasks (the queue). Individual tasks may
    /// override this per task definition.
    pub reactive_tasks: String,
    /// The single planner meta document lives here.
    pub reactive_meta: String,
    /// One document per registered cron task.
    pub cron_tasks: String,
    /// Distributed lock documents, TTL-indexed on `expiresAt`.
    pub locks: String,
}

impl Default for CollectionNames {
    fn default() -> Self {
        Self {
            reactive_tasks: "reactiveTasks".into(),
            reactive_meta: "reactiveTasksMeta".into(),
            cron_tasks: "cronTasks".into(),
            locks: "locks".into(),
        }
    }
}

/// Engine-level configuration.
///
/// The defaults follow the timeout table in the design: mutex TTL 15s
/// renewed at TTL/5, leader TTL 30s renewed at 10s, visibility timeout 60s
/// renewed at 12s, max lock acquire wait 3s, change-stream batch window
/// 500ms.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Workers per process claiming reactive work items.
    pub concurrency: usize,

    /// Default delay between the last observed change of a source document
    /// and the handler becoming claimable. Tasks may override it.
    pub debounce: Duration,

    /// How long a claimed work item stays invisible to other workers. The
    /// lease is renewed at a fifth of this period while the handler runs.
    pub visibility_timeout: Duration,

    /// TTL on distributed mutex documents.
    pub lock_ttl: Duration,

    /// TTL on the planner leader lock.
    pub leader_ttl: Duration,

    /// Leader election tick period. Should be well under `leader_ttl`;
    /// a third of it is a good choice.
    pub leader_heartbeat: Duration,

    /// Longest a `with_lock` caller waits for a contended mutex.
    pub max_wait_for_lock: Duration,

    /// Change-stream events per planning batch.
    pub batch_size: usize,

    /// Flush window for a partially filled planning batch.
    pub batch_interval: Duration,

    /// How often the leader looks for orphaned work items.
    pub cleanup_interval: Duration,

    /// Poll floor for the worker runner. Fresh work resets a source's
    /// backoff to this.
    pub min_poll: Duration,

    /// Poll ceiling after repeated empty polls.
    pub max_poll: Duration,

    /// Extra random delay added to every poll advance, spreading replicas
    /// apart.
    pub jitter: Duration,

    /// Identity of this process in leader locks and diagnostics. Generated
    /// when not set.
    pub instance_id: Option<String>,

    pub collections: CollectionNames,

    pub callbacks: Callbacks,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            debounce: Duration::from_secs(1),
            visibility_timeout: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(15),
            leader_ttl: Duration::from_secs(30),
            leader_heartbeat: Duration::from_secs(10),
            max_wait_for_lock: Duration::from_secs(3),
            batch_size: 1000,
            batch_interval: Duration::from_millis(500),
            cleanup_interval: Duration::from_secs(3600),
            min_poll: Duration::from_millis(100),
            max_poll: Duration::from_secs(5),
            jitter: Duration::from_millis(100),
            instance_id: None,
            collections: CollectionNames::default(),
            callbacks: Callbacks::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn leader_ttl(mut self, ttl: Duration) -> Self {
        self.leader_ttl = ttl;
        self.leader_heartbeat = ttl / 3;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval = interval;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn poll_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_poll = min;
        self.max_poll = max.max(min);
        self
    }

    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    pub fn collections(mut self, collections: CollectionNames) -> Self {
        self.collections = collections;
        self
    }

    pub fn callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Lease renewal period for a TTL of `ttl`.
    pub fn renewal_period(ttl: Duration) -> Duration {
        (ttl / 5).max(Duration::from_millis(10))
    }
}
