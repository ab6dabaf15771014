//! Typed access to the planner meta document.
//!
//! The meta document is mutated through well-known partial updates so the
//! leader, reconciliation and cleanup can each touch their own fields
//! without clobbering the others.

use mongodb::bson::{doc, to_bson, Bson, DateTime, Timestamp};
use mongodb::{Collection, Database};
use taskmill_core::meta::{PlannerMeta, ReconciliationCheckpoint, TaskFingerprint, META_DOC_ID};
use taskmill_core::Result;

#[derive(Clone)]
pub struct MetaStore {
    collection: Collection<PlannerMeta>,
}

impl MetaStore {
    pub fn new(db: &Database, collection_name: &str) -> Self {
        Self {
            collection: db.collection(collection_name),
        }
    }

    /// Upsert the meta document skeleton. Leader election may race this;
    /// `$setOnInsert` keeps whoever wins intact.
    pub async fn ensure_exists(&self) -> Result<()> {
        self.collection
            .update_one(
                doc! { "_id": META_DOC_ID },
                doc! { "$setOnInsert": {
                    "streamState": {},
                    "reconciliation": {},
                    "reconciliationState": {},
                    "tasks": {},
                } },
            )
            .upsert(true)
            .await?;

        Ok(())
    }

    pub async fn load(&self) -> Result<PlannerMeta> {
        let meta = self
            .collection
            .find_one(doc! { "_id": META_DOC_ID })
            .await?;

        Ok(meta.unwrap_or_else(|| PlannerMeta {
            id: META_DOC_ID.to_owned(),
            ..PlannerMeta::default()
        }))
    }

    pub async fn save_stream_state(
        &self,
        resume_token: Option<&Bson>,
        cluster_time: Option<Timestamp>,
    ) -> Result<()> {
        let mut set = doc! {};
        match resume_token {
            Some(token) => set.insert("streamState.resumeToken", token.clone()),
            None => set.insert("streamState.resumeToken", Bson::Null),
        };
        if let Some(ts) = cluster_time {
            set.insert("streamState.lastClusterTime", ts);
        }

        self.collection
            .update_one(doc! { "_id": META_DOC_ID }, doc! { "$set": set })
            .upsert(true)
            .await?;

        Ok(())
    }

    /// Forget the resume token after the oplog history is gone; the next
    /// session starts from the server's current operation time.
    pub async fn clear_resume_token(&self) -> Result<()> {
        self.collection
            .update_one(
                doc! { "_id": META_DOC_ID },
                doc! { "$unset": { "streamState.resumeToken": 1 } },
            )
            .await?;

        Ok(())
    }

    /// Mark whether a task's reconciliation has completed.
    pub async fn set_reconciliation(&self, task: &str, completed: bool) -> Result<()> {
        self.collection
            .update_one(
                doc! { "_id": META_DOC_ID },
                doc! { "$set": { format!("reconciliation.{task}"): completed } },
            )
            .upsert(true)
            .await?;

        Ok(())
    }

    /// Flag every named task for reconciliation in one write.
    pub async fn reset_reconciliation(&self, tasks: &[String]) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }

        let mut set = doc! {};
        for task in tasks {
            set.insert(format!("reconciliation.{task}"), false);
        }

        self.collection
            .update_one(doc! { "_id": META_DOC_ID }, doc! { "$set": set })
            .upsert(true)
            .await?;

        Ok(())
    }

    pub async fn set_checkpoint(
        &self,
        collection: &str,
        checkpoint: &ReconciliationCheckpoint,
    ) -> Result<()> {
        self.collection
            .update_one(
                doc! { "_id": META_DOC_ID },
                doc! { "$set": {
                    format!("reconciliationState.{collection}"): to_bson(checkpoint)?,
                } },
            )
            .upsert(true)
            .await?;

        Ok(())
    }

    pub async fn clear_checkpoint(&self, collection: &str) -> Result<()> {
        self.collection
            .update_one(
                doc! { "_id": META_DOC_ID },
                doc! { "$unset": { format!("reconciliationState.{collection}"): 1 } },
            )
            .await?;

        Ok(())
    }

    pub async fn set_fingerprint(&self, task: &str, fingerprint: &TaskFingerprint) -> Result<()> {
        self.collection
            .update_one(
                doc! { "_id": META_DOC_ID },
                doc! { "$set": { format!("tasks.{task}"): to_bson(fingerprint)? } },
            )
            .upsert(true)
            .await?;

        Ok(())
    }

    pub async fn set_reconciled_at(&self, task: &str, at: DateTime) -> Result<()> {
        self.collection
            .update_one(
                doc! { "_id": META_DOC_ID },
                doc! { "$set": {
                    format!("reconciliation.{task}"): true,
                    format!("tasks.{task}.lastReconciledAt"): at,
                } },
            )
            .upsert(true)
            .await?;

        Ok(())
    }

    pub async fn set_last_cleanup_at(&self, at: DateTime) -> Result<()> {
        self.collection
            .update_one(
                doc! { "_id": META_DOC_ID },
                doc! { "$set": { "lastCleanupAt": at } },
            )
            .upsert(true)
            .await?;

        Ok(())
    }
}
