//! End-to-end scenarios against a live MongoDB replica set.
//!
//! These are ignored by default; run them with a replica set available:
//!
//! ```text
//! MONGODB_URI=mongodb://localhost:27017/?replicaSet=rs0 \
//!     cargo test -p taskmill -- --ignored
//! ```
//!
//! Change streams and transactions require a replica set; a standalone
//! mongod will fail these immediately.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use taskmill::mongodb::bson::{doc, Document};
use taskmill::{
    CleanupPolicy, CronListQuery, DeleteWhen, Error, InitOptions, LockOptions, Pagination,
    ReactiveTaskDef, RetryPolicy, SchedulerConfig, TaskQuery, TaskStatus, Taskmill,
};

fn test_uri() -> String {
    std::env::var("MONGODB_URI").unwrap_or_else(|_| "mongodb://localhost:27017".to_owned())
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig::new()
        .poll_bounds(Duration::from_millis(20), Duration::from_millis(200))
        .batch_interval(Duration::from_millis(100))
        .leader_ttl(Duration::from_secs(6))
}

async fn fresh_mill(config: SchedulerConfig) -> Taskmill {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    let database = format!("taskmill_e2e_{nanos}");

    Taskmill::init(InitOptions::new(database).uri(test_uri()).config(config))
        .await
        .expect("taskmill init")
}

async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a MongoDB replica set (set MONGODB_URI)"]
async fn handler_retries_until_success() {
    let mill = fresh_mill(fast_config()).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let counted = calls.clone();
    mill.reactive_task(
        ReactiveTaskDef::new("greeter", "people", move |_ctx| {
            let counted = counted.clone();
            async move {
                if counted.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("not yet");
                }
                Ok(())
            }
        })
        .debounce(Duration::from_millis(100))
        .retry_policy(RetryPolicy::fixed(Duration::from_millis(50)).max_attempts(3)),
    )
    .expect("register");

    mill.start_reactive_tasks().await.expect("start");

    mill.database()
        .collection::<Document>("people")
        .insert_one(doc! { "_id": "d1" })
        .await
        .expect("insert");

    let query = TaskQuery {
        task: Some("greeter".into()),
        ..TaskQuery::default()
    };
    let completed = wait_for(Duration::from_secs(20), || async {
        let page = mill
            .get_reactive_tasks(&query, Pagination::default())
            .await
            .expect("list");
        page.items
            .first()
            .map(|item| item.status == TaskStatus::Completed)
            .unwrap_or(false)
    })
    .await;
    assert!(completed, "work item never completed");

    let page = mill
        .get_reactive_tasks(&query, Pagination::default())
        .await
        .expect("list");
    let item = page.items.first().expect("one work item");

    assert_eq!(calls.load(Ordering::SeqCst), 3, "exactly three handler calls");
    assert_eq!(item.attempts, 3);
    assert_eq!(item.execution_history.len(), 3);
    assert_eq!(item.id, "greeter:d1");
    assert!(item.last_error.is_none());

    mill.stop_reactive_tasks().await;
    let _ = mill.database().drop().await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a MongoDB replica set (set MONGODB_URI)"]
async fn cron_task_ticks_on_schedule() {
    let mill = fresh_mill(fast_config()).await;
    let ticks = Arc::new(AtomicUsize::new(0));

    let counted = ticks.clone();
    mill.cron_task("ticker", "CRON */10 * * * * *", move || {
        let counted = counted.clone();
        async move {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .await
    .expect("register cron");

    mill.start_cron_tasks().await.expect("start cron");
    tokio::time::sleep(Duration::from_secs(60)).await;
    mill.stop_cron_tasks().await;

    let observed = ticks.load(Ordering::SeqCst);
    assert!(
        (5..=7).contains(&observed),
        "expected 6 ± 1 runs over a minute, observed {observed}"
    );

    let page = mill
        .get_cron_tasks_list(&CronListQuery::default(), Pagination::default())
        .await
        .expect("cron list");
    let doc = page.items.first().expect("cron task doc");
    assert!(doc.run_log.len() <= 5, "run log must stay bounded");
    assert!(doc.run_log.iter().all(|entry| entry.error.is_none()));

    let _ = mill.database().drop().await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a MongoDB replica set (set MONGODB_URI)"]
async fn cleanup_removes_no_longer_matching_items_after_keep_for() {
    let mill = fresh_mill(fast_config().cleanup_interval(Duration::from_millis(200))).await;

    mill.reactive_task(
        ReactiveTaskDef::new("activator", "things", |_ctx| async { Ok(()) })
            .filter(doc! { "active": true })
            .watch(["active"])
            .debounce(Duration::from_millis(50))
            .cleanup_policy(CleanupPolicy {
                delete_when: DeleteWhen::SourceDocumentDeletedOrNoLongerMatching,
                keep_for: Some(Duration::from_millis(100)),
            }),
    )
    .expect("register");

    mill.start_reactive_tasks().await.expect("start");

    let things = mill.database().collection::<Document>("things");
    things
        .insert_one(doc! { "_id": "d3", "active": true })
        .await
        .expect("insert");

    let query = TaskQuery {
        task: Some("activator".into()),
        ..TaskQuery::default()
    };
    let completed = wait_for(Duration::from_secs(20), || async {
        let page = mill
            .get_reactive_tasks(&query, Pagination::default())
            .await
            .expect("list");
        page.items
            .first()
            .map(|item| item.status == TaskStatus::Completed)
            .unwrap_or(false)
    })
    .await;
    assert!(completed, "item never completed");

    // Stop matching; after keepFor plus a cleanup tick the item must go.
    things
        .update_one(doc! { "_id": "d3" }, doc! { "$set": { "active": false } })
        .await
        .expect("update");

    let removed = wait_for(Duration::from_secs(20), || async {
        mill.count_reactive_tasks(&query).await.expect("count") == 0
    })
    .await;
    assert!(removed, "orphaned work item was never cleaned up");

    mill.stop_reactive_tasks().await;
    let _ = mill.database().drop().await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a MongoDB replica set (set MONGODB_URI)"]
async fn contended_lock_times_out() {
    let mill = fresh_mill(fast_config()).await;

    let holder = mill.clone();
    let held = tokio::spawn(async move {
        holder
            .with_lock("exclusive", LockOptions::default(), || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, Error>(())
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    let contender: Result<(), Error> = mill
        .with_lock(
            "exclusive",
            LockOptions {
                max_wait: Some(Duration::from_millis(100)),
                ..LockOptions::default()
            },
            || async { Ok(()) },
        )
        .await;
    assert!(matches!(contender, Err(Error::LockAlreadyAcquired(_))));

    held.await.expect("join").expect("holder succeeds");

    // Released now: a second acquisition goes through immediately.
    mill.with_lock("exclusive", LockOptions::default(), || async {
        Ok::<_, Error>(())
    })
    .await
    .expect("reacquire");

    let _ = mill.database().drop().await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a MongoDB replica set (set MONGODB_URI)"]
async fn dirty_update_during_run_schedules_a_second_pass() {
    let mill = fresh_mill(fast_config()).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let counted = calls.clone();
    mill.reactive_task(
        ReactiveTaskDef::new("slowpoke", "jobs", move |_ctx| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                // Long enough for a concurrent update to land mid-run.
                tokio::time::sleep(Duration::from_millis(600)).await;
                Ok(())
            }
        })
        .watch(["payload"])
        .debounce(Duration::from_millis(50)),
    )
    .expect("register");

    mill.start_reactive_tasks().await.expect("start");

    let jobs = mill.database().collection::<Document>("jobs");
    jobs.insert_one(doc! { "_id": "j1", "payload": 1 })
        .await
        .expect("insert");

    let query = TaskQuery {
        task: Some("slowpoke".into()),
        ..TaskQuery::default()
    };

    let started = wait_for(Duration::from_secs(20), || async {
        calls.load(Ordering::SeqCst) >= 1
    })
    .await;
    assert!(started, "first run never started");

    jobs.update_one(doc! { "_id": "j1" }, doc! { "$set": { "payload": 2 } })
        .await
        .expect("update mid-run");

    // The change lands while the handler sleeps, so the item goes dirty and
    // a second pass follows after completion.
    let reran = wait_for(Duration::from_secs(20), || async {
        let page = mill
            .get_reactive_tasks(&query, Pagination::default())
            .await
            .expect("list");
        calls.load(Ordering::SeqCst) >= 2
            && page
                .items
                .first()
                .map(|item| item.status == TaskStatus::Completed)
                .unwrap_or(false)
    })
    .await;
    assert!(reran, "dirty item never got its second pass");

    mill.stop_reactive_tasks().await;
    let _ = mill.database().drop().await;
}
