//! Persisted shape of reactive work items and the per-task policy records.

use std::time::Duration;

use mongodb::bson::{Bson, DateTime, Document};
use serde::{Deserialize, Serialize};

use crate::Filter;

/// Work-item state machine.
///
/// Transitions are monotonic towards `completed`/`failed` except for the
/// dirty re-entry: `processing` is promoted to `processing_dirty` when the
/// observed values change mid-run, and a dirty item returns to `pending`
/// when its run finalizes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    ProcessingDirty,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::ProcessingDirty,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::ProcessingDirty => "processing_dirty",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One entry of the bounded per-item execution history.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub started_at: DateTime,
    pub finished_at: DateTime,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSuccess {
    pub at: DateTime,
    pub duration_ms: i64,
}

/// A persisted work item: one per `(task, source document)` pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    #[serde(rename = "_id")]
    pub id: String,
    pub task: String,
    pub source_doc_id: Bson,
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: i32,
    pub scheduled_at: DateTime,
    pub initial_scheduled_at: DateTime,
    pub created_at: DateTime,
    pub updated_at: DateTime,
    #[serde(default)]
    pub started_at: Option<DateTime>,
    #[serde(default)]
    pub completed_at: Option<DateTime>,
    #[serde(default)]
    pub last_finalized_at: Option<DateTime>,
    /// Visibility lease; `None` when the item is not in flight.
    #[serde(default)]
    pub lock_expires_at: Option<DateTime>,
    #[serde(default)]
    pub first_error_at: Option<DateTime>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_observed_values: Option<Document>,
    #[serde(default)]
    pub execution_history: Vec<ExecutionRecord>,
    #[serde(default)]
    pub last_success: Option<LastSuccess>,
}

pub const DEFAULT_EXECUTION_HISTORY_LIMIT: usize = 5;

/// When orphaned work items may be deleted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeleteWhen {
    /// Delete only once the source document is gone.
    SourceDocumentDeleted,
    /// Also delete when the source document stopped matching the filter.
    SourceDocumentDeletedOrNoLongerMatching,
    Never,
}

#[derive(Clone, Debug)]
pub struct CleanupPolicy {
    pub delete_when: DeleteWhen,
    /// Grace period after the item last changed before it may be deleted,
    /// keeping recent history visible.
    pub keep_for: Option<Duration>,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            delete_when: DeleteWhen::SourceDocumentDeleted,
            keep_for: None,
        }
    }
}

impl CleanupPolicy {
    pub fn never() -> Self {
        Self {
            delete_when: DeleteWhen::Never,
            keep_for: None,
        }
    }
}

/// What to do with existing items when the handler version rises.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum OnHandlerVersionChange {
    #[default]
    None,
    ReprocessFailed,
    ReprocessAll,
}

/// Evolution settings: how the planner reacts when a task definition
/// changes between deployments.
#[derive(Clone, Debug)]
pub struct Evolution {
    pub handler_version: i32,
    pub on_handler_version_change: OnHandlerVersionChange,
    pub reconcile_on_trigger_change: bool,
}

impl Default for Evolution {
    fn default() -> Self {
        Self {
            handler_version: 1,
            on_handler_version_change: OnHandlerVersionChange::None,
            reconcile_on_trigger_change: true,
        }
    }
}

/// The store-facing identity of a reactive task: enough to locate its work
/// items and re-evaluate its filter, without the handler. The query surface
/// works from these.
#[derive(Clone, Debug)]
pub struct TaskBinding {
    pub name: String,
    pub source_collection: String,
    pub tasks_collection: String,
    pub filter: Filter,
    pub watch_projection: Option<Vec<String>>,
}
