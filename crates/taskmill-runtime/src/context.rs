//! The context handed to reactive task handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mongodb::bson::{doc, Bson, DateTime, Document};
use mongodb::{ClientSession, Collection};
use parking_lot::Mutex;
use taskmill_core::task::WorkItem;
use taskmill_core::{time, Error, Filter, Result};

use crate::worker::ThrottleMap;

pub(crate) struct ContextState {
    pub item: WorkItem,
    pub source: Collection<Document>,
    pub tasks: Collection<Document>,
    pub filter: Filter,
    pub history_limit: usize,
    pub defer_until: Mutex<Option<DateTime>>,
    pub completed_in_session: AtomicBool,
    pub throttles: ThrottleMap,
}

/// Handler-facing view of one claimed work item.
///
/// Cloning is cheap; the context may be moved into spawned sub-futures of
/// the handler.
#[derive(Clone)]
pub struct TaskContext {
    state: Arc<ContextState>,
}

impl TaskContext {
    pub(crate) fn new(state: Arc<ContextState>) -> Self {
        Self { state }
    }

    /// Identity of the source document this invocation is about.
    pub fn doc_id(&self) -> &Bson {
        &self.state.item.source_doc_id
    }

    pub fn task(&self) -> &str {
        &self.state.item.task
    }

    /// The watched-field snapshot taken at planning time.
    pub fn watched_values(&self) -> Option<&Document> {
        self.state.item.last_observed_values.as_ref()
    }

    /// Handler invocations started for this item, this one included.
    pub fn attempts(&self) -> i32 {
        self.state.item.attempts
    }

    /// Fetch the source document, re-applying the task filter atomically.
    ///
    /// Fails with [`Error::TaskConditionFailed`] when the document was
    /// deleted or no longer matches; returning that error from the handler
    /// finalizes the item as completed without retries.
    pub async fn get_document(&self) -> Result<Document> {
        let mut filter = self.state.filter.match_query();
        filter.insert("_id", self.state.item.source_doc_id.clone());

        self.state
            .source
            .find_one(filter)
            .await?
            .ok_or(Error::TaskConditionFailed)
    }

    /// Like [`TaskContext::get_document`], inside a caller-owned session.
    pub async fn get_document_in(&self, session: &mut ClientSession) -> Result<Document> {
        let mut filter = self.state.filter.match_query();
        filter.insert("_id", self.state.item.source_doc_id.clone());

        self.state
            .source
            .find_one(filter)
            .session(session)
            .await?
            .ok_or(Error::TaskConditionFailed)
    }

    /// Push this item's next run out to `now + delay`, regardless of how the
    /// current invocation ends. The pre-defer schedule is preserved in
    /// `initialScheduledAt` for lag accounting.
    pub fn defer_current(&self, delay: Duration) {
        *self.state.defer_until.lock() = Some(time::from_now(delay));
    }

    /// Stop claiming items of this task on this instance until the given
    /// deadline passes. Other instances are unaffected.
    pub fn throttle_all(&self, until: DateTime) {
        self.state.throttles.set(&self.state.item.task, until);
    }

    /// Flip the work item to `completed` inside the caller's transaction.
    ///
    /// The worker detects this and skips its own finalize, so the status
    /// change commits or rolls back atomically with the handler's writes.
    pub async fn mark_completed(&self, session: &mut ClientSession) -> Result<()> {
        let now = time::now();
        let update = crate::worker::success_update(&self.state.item, now, self.state.history_limit);

        self.state
            .tasks
            .update_one(
                doc! {
                    "_id": &self.state.item.id,
                    "status": { "$in": ["processing", "processing_dirty"] },
                },
                update,
            )
            .session(session)
            .await?;

        self.state.completed_in_session.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn deferred_until(&self) -> Option<DateTime> {
        *self.state.defer_until.lock()
    }

    pub(crate) fn was_completed_in_session(&self) -> bool {
        self.state.completed_in_session.load(Ordering::SeqCst)
    }
}
