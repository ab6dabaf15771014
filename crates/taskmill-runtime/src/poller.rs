//! Multi-source adaptive polling runner.
//!
//! Sources (one per tasks collection) are polled by a fixed pool of workers.
//! A source that keeps coming up empty backs off exponentially between
//! `min_poll` and `max_poll`; finding work, or an external
//! [`PollingRunner::speed_up`], snaps it back to the floor. The deadline is
//! advanced *before* the poll runs so concurrent replicas do not stampede
//! the same collection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng;
use taskmill_core::{Error, Result};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::flag::ShutdownFlag;

/// Poll cadence for one source.
#[derive(Clone, Copy, Debug)]
pub struct PollSourceConfig {
    pub min_poll: Duration,
    pub max_poll: Duration,
    pub jitter: Duration,
}

impl Default for PollSourceConfig {
    fn default() -> Self {
        Self {
            min_poll: Duration::from_millis(100),
            max_poll: Duration::from_secs(5),
            jitter: Duration::from_millis(100),
        }
    }
}

/// The poll callback: given a source name, attempt one unit of work and
/// report whether anything was found.
pub type TryRun = Arc<dyn Fn(String) -> BoxFuture<'static, bool> + Send + Sync>;

struct SourceState {
    config: PollSourceConfig,
    next_run_at: Instant,
    backoff: Duration,
}

struct Inner {
    sources: Mutex<HashMap<String, SourceState>>,
    wake: Notify,
    shutdown: ShutdownFlag,
}

enum Step {
    Run(String),
    Sleep(Duration),
}

pub struct PollingRunner {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PollingRunner {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                sources: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                shutdown: ShutdownFlag::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Register a polling source. Registering the same name twice is a
    /// configuration error.
    pub fn register(&self, source: &str, config: PollSourceConfig) -> Result<()> {
        let mut sources = self.inner.sources.lock();
        if sources.contains_key(source) {
            return Err(Error::DuplicateSource(source.to_owned()));
        }

        sources.insert(
            source.to_owned(),
            SourceState {
                config,
                next_run_at: Instant::now(),
                backoff: config.min_poll,
            },
        );
        drop(sources);

        // Sleepers may be waiting on a later deadline than the new source's.
        self.inner.wake.notify_waiters();
        Ok(())
    }

    pub fn has_source(&self, source: &str) -> bool {
        self.inner.sources.lock().contains_key(source)
    }

    /// Launch `concurrency` workers driving `try_run`.
    pub fn start(&self, concurrency: usize, try_run: TryRun) {
        let mut workers = self.workers.lock();
        for _ in 0..concurrency.max(1) {
            let inner = self.inner.clone();
            let try_run = try_run.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(inner, try_run).await;
            }));
        }
    }

    /// Reset a source to its poll floor and wake a worker. Called by the
    /// planner once freshly planned items come due.
    pub fn speed_up(&self, source: &str) {
        let mut sources = self.inner.sources.lock();
        if let Some(state) = sources.get_mut(source) {
            state.backoff = state.config.min_poll;
            state.next_run_at = Instant::now();
        }
        drop(sources);

        self.inner.wake.notify_one();
    }

    /// Cooperative stop: wake everyone and join the workers. In-flight
    /// `try_run` calls finish first.
    pub async fn stop(&self) {
        self.inner.shutdown.raise();
        self.inner.wake.notify_waiters();

        let workers = {
            let mut guard = self.workers.lock();
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            let _ = worker.await;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_raised()
    }
}

impl Default for PollingRunner {
    fn default() -> Self {
        Self::new()
    }
}

async fn worker_loop(inner: Arc<Inner>, try_run: TryRun) {
    loop {
        if inner.shutdown.is_raised() {
            break;
        }

        let step = next_step(&inner);

        match step {
            Step::Run(source) => {
                let found = try_run(source.clone()).await;
                if found {
                    // More may be ready right behind it.
                    let mut sources = inner.sources.lock();
                    if let Some(state) = sources.get_mut(&source) {
                        state.backoff = state.config.min_poll;
                        state.next_run_at = Instant::now();
                    }
                }
            }
            Step::Sleep(duration) => {
                tokio::select! {
                    _ = inner.shutdown.wait() => break,
                    _ = inner.wake.notified() => (),
                    _ = tokio::time::sleep(duration) => (),
                }
            }
        }
    }
}

/// Pick the earliest-due source; claim it by advancing its deadline under
/// the lock so no other worker polls it concurrently.
fn next_step(inner: &Inner) -> Step {
    let now = Instant::now();
    let mut sources = inner.sources.lock();

    let earliest = sources
        .iter()
        .min_by_key(|(_, state)| state.next_run_at)
        .map(|(name, state)| (name.clone(), state.next_run_at));

    match earliest {
        None => Step::Sleep(Duration::from_secs(1)),
        Some((name, due_at)) if due_at <= now => {
            let state = sources.get_mut(&name).expect("source exists under lock");
            let jitter_ms = state.config.jitter.as_millis() as u64;
            let jitter = if jitter_ms == 0 {
                Duration::ZERO
            } else {
                Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
            };

            state.next_run_at = now + state.backoff + jitter;
            state.backoff = (state.backoff * 2).min(state.config.max_poll);

            Step::Run(name)
        }
        Some((_, due_at)) => Step::Sleep(due_at - now),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn fast_config() -> PollSourceConfig {
        PollSourceConfig {
            min_poll: Duration::from_millis(10),
            max_poll: Duration::from_millis(80),
            jitter: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let runner = PollingRunner::new();
        runner.register("a", fast_config()).unwrap();
        assert!(runner.has_source("a"));
        assert!(matches!(
            runner.register("a", fast_config()),
            Err(Error::DuplicateSource(_))
        ));
    }

    #[tokio::test]
    async fn polls_a_due_source() {
        let runner = PollingRunner::new();
        runner.register("a", fast_config()).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        runner.start(
            2,
            Arc::new(move |_source| {
                let counted = counted.clone();
                Box::pin(async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    false
                })
            }),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        runner.stop().await;

        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn empty_polls_back_off() {
        let runner = PollingRunner::new();
        runner.register("a", fast_config()).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        runner.start(
            1,
            Arc::new(move |_source| {
                let counted = counted.clone();
                Box::pin(async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    false
                })
            }),
        );

        // With doubling from 10ms capped at 80ms, ~350ms admits at most
        // seven polls (10+20+40+80+80+80…); without backoff it would be 35.
        tokio::time::sleep(Duration::from_millis(350)).await;
        runner.stop().await;

        let observed = calls.load(Ordering::SeqCst);
        assert!((1..=8).contains(&observed), "observed {observed} polls");
    }

    #[tokio::test]
    async fn speed_up_resets_the_backoff() {
        let runner = PollingRunner::new();
        runner.register("a", fast_config()).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        runner.start(
            1,
            Arc::new(move |_source| {
                let counted = counted.clone();
                Box::pin(async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    false
                })
            }),
        );

        // Let the backoff climb, then snap it back and expect a prompt poll.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let before = calls.load(Ordering::SeqCst);
        runner.speed_up("a");
        tokio::time::sleep(Duration::from_millis(30)).await;
        runner.stop().await;

        assert!(calls.load(Ordering::SeqCst) > before);
    }

    #[tokio::test]
    async fn finding_work_polls_again_immediately() {
        let runner = PollingRunner::new();
        runner.register("a", fast_config()).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        runner.start(
            1,
            Arc::new(move |_source| {
                let counted = counted.clone();
                Box::pin(async move {
                    // Report work found for the first five polls.
                    counted.fetch_add(1, Ordering::SeqCst) < 5
                })
            }),
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        runner.stop().await;

        assert!(calls.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test]
    async fn stop_joins_workers() {
        let runner = PollingRunner::new();
        runner.register("a", fast_config()).unwrap();
        runner.start(3, Arc::new(|_| Box::pin(async { false })));
        runner.stop().await;
        assert!(runner.is_stopped());
    }
}
