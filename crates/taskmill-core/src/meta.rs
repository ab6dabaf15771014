//! The planner meta document: leader lock, change-stream checkpoint,
//! reconciliation bookkeeping and evolution fingerprints.

use std::collections::HashMap;

use mongodb::bson::{Bson, DateTime, Timestamp};
use serde::{Deserialize, Serialize};

/// `_id` of the single meta document inside the meta collection.
pub const META_DOC_ID: &str = "planner";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderLock {
    pub instance_id: String,
    pub expires_at: DateTime,
}

/// Change-stream checkpoint. `resume_token` takes precedence; when absent
/// the stream starts from `last_cluster_time` or, failing that, from the
/// server's current operation time.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<Bson>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cluster_time: Option<Timestamp>,
}

/// Resumable cursor of an in-progress reconciliation scan over one source
/// collection. The checkpoint is only honored when the saved task-name set
/// matches the current one exactly.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationCheckpoint {
    pub last_id: Bson,
    pub task_names: Vec<String>,
    pub updated_at: DateTime,
}

/// Evolution fingerprint of one registered task.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFingerprint {
    pub trigger_sig: String,
    pub handler_version: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled_at: Option<DateTime>,
}

/// The process-global planner meta document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerMeta {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<LeaderLock>,
    #[serde(default)]
    pub stream_state: StreamState,
    /// Task name → reconciliation completed?
    #[serde(default)]
    pub reconciliation: HashMap<String, bool>,
    /// Source collection → scan checkpoint.
    #[serde(default)]
    pub reconciliation_state: HashMap<String, ReconciliationCheckpoint>,
    /// Task name → evolution fingerprint.
    #[serde(default)]
    pub tasks: HashMap<String, TaskFingerprint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cleanup_at: Option<DateTime>,
}

/// A distributed mutex document. The lock collection carries a TTL index on
/// `expiresAt` with `expireAfterSeconds = 0`, so the store reaps abandoned
/// locks.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockDoc {
    #[serde(rename = "_id")]
    pub key: String,
    pub lock_id: String,
    pub expires_at: DateTime,
}
