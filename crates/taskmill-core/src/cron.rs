//! Persisted shape of cron task documents.

use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};

/// Newest-first run log entries kept on each cron task document.
pub const RUN_LOG_LIMIT: usize = 5;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogEntry {
    pub started_at: DateTime,
    #[serde(default)]
    pub finished_at: Option<DateTime>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One document per registered cron task, shared by every process.
///
/// `runSince` is the next scheduled time; `lockedTill` is the visibility
/// timeout taken by the process currently running the task. Missed runs
/// recover through lock expiry.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronTaskDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub run_since: DateTime,
    #[serde(default)]
    pub run_immediately: bool,
    #[serde(default)]
    pub locked_till: Option<DateTime>,
    #[serde(default)]
    pub run_log: Vec<RunLogEntry>,
}

impl CronTaskDoc {
    /// Status string shown on the dashboard.
    pub fn status(&self, now: DateTime) -> &'static str {
        if self.locked_till.map(|till| till > now).unwrap_or(false) {
            "running"
        } else if self.run_immediately {
            "triggered"
        } else {
            "scheduled"
        }
    }

    pub fn last_run_error(&self) -> Option<&str> {
        self.run_log.first().and_then(|entry| entry.error.as_deref())
    }
}
