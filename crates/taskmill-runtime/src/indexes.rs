//! Index bootstrap for the collections the scheduler owns.

use std::time::Duration;

use mongodb::bson::{doc, Document};
use mongodb::options::IndexOptions;
use mongodb::{Database, IndexModel};
use taskmill_core::Result;

/// Indexes backing the work-item queue: the claim query, the unique
/// `(task, sourceDocId)` identity, and lease expiry scans.
pub async fn ensure_reactive_indexes(db: &Database, tasks_collections: &[String]) -> Result<()> {
    for name in tasks_collections {
        let collection = db.collection::<Document>(name);

        collection
            .create_indexes([
                IndexModel::builder()
                    .keys(doc! { "status": 1, "scheduledAt": 1 })
                    .build(),
                IndexModel::builder()
                    .keys(doc! { "task": 1, "sourceDocId": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
                IndexModel::builder()
                    .keys(doc! { "lockExpiresAt": 1 })
                    .build(),
            ])
            .await?;
    }

    Ok(())
}

pub async fn ensure_cron_indexes(db: &Database, collection: &str) -> Result<()> {
    db.collection::<Document>(collection)
        .create_indexes([
            IndexModel::builder()
                .keys(doc! { "runSince": 1, "_id": 1, "lockedTill": 1 })
                .build(),
            IndexModel::builder()
                .keys(doc! { "runImmediately": 1, "_id": 1, "lockedTill": 1 })
                .options(
                    IndexOptions::builder()
                        .partial_filter_expression(doc! { "runImmediately": true })
                        .build(),
                )
                .build(),
        ])
        .await?;

    Ok(())
}

/// The store reaps abandoned locks through a TTL index that expires
/// documents the moment `expiresAt` passes.
pub async fn ensure_lock_indexes(db: &Database, collection: &str) -> Result<()> {
    db.collection::<Document>(collection)
        .create_index(
            IndexModel::builder()
                .keys(doc! { "expiresAt": 1 })
                .options(
                    IndexOptions::builder()
                        .expire_after(Duration::ZERO)
                        .build(),
                )
                .build(),
        )
        .await?;

    Ok(())
}
