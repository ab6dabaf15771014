//! Response shapes served to the dashboard.

use mongodb::bson::DateTime;
use serde::Serialize;
use taskmill_core::cron::CronTaskDoc;
use taskmill_core::task::WorkItem;

/// Work-item counts per status bucket. `processing` folds in the dirty
/// state; `error` counts items currently carrying a failure streak
/// regardless of status.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct TaskStats {
    pub success: u64,
    pub failed: u64,
    pub processing: u64,
    pub pending: u64,
    pub error: u64,
}

impl TaskStats {
    pub fn merge(&mut self, other: &TaskStats) {
        self.success += other.success;
        self.failed += other.failed;
        self.processing += other.processing;
        self.pending += other.pending;
        self.error += other.error;
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListPage {
    pub items: Vec<WorkItem>,
    pub total: u64,
    pub limit: i64,
    pub offset: u64,
    pub stats: TaskStats,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronTaskListPage {
    pub items: Vec<CronTaskDoc>,
    pub total: u64,
    pub limit: i64,
    pub offset: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactiveTaskInfo {
    pub name: String,
    pub collection: String,
    pub stats: TaskStats,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronTaskInfo {
    pub id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_error: Option<String>,
    pub next_run_at: DateTime,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    pub database_name: String,
    pub reactive_tasks: Vec<ReactiveTaskInfo>,
    pub cron_tasks: Vec<CronTaskInfo>,
}
