//! Orphan cleanup: deleting work items whose source document disappeared
//! or stopped matching.

use futures_util::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::{Collection, Database};
use taskmill_core::task::DeleteWhen;
use taskmill_core::{time, Result};

use crate::registry::ReactiveTask;

/// Delete orphaned work items of `task`, honoring its cleanup policy.
///
/// `scope` restricts the sweep to the given source ids (used when handling
/// change-stream delete events); `None` sweeps the whole task. Items inside
/// the `keep_for` grace window and items with a live lease are never
/// touched. Returns the number of deleted items.
pub async fn cleanup_task(
    db: &Database,
    task: &ReactiveTask,
    scope: Option<&[Bson]>,
    batch_size: usize,
) -> Result<u64> {
    if task.cleanup_policy.delete_when == DeleteWhen::Never {
        return Ok(0);
    }

    let now = time::now();
    let items: Collection<Document> = db.collection(&task.tasks_collection);
    let source: Collection<Document> = db.collection(&task.source_collection);

    let mut filter = doc! {
        "task": &task.name,
        // In-flight items finalize under their lease; they are reconsidered
        // on the next sweep.
        "$or": [
            { "lockExpiresAt": null },
            { "lockExpiresAt": { "$lt": now } },
        ],
    };

    if let Some(keep_for) = task.cleanup_policy.keep_for {
        let cutoff =
            mongodb::bson::DateTime::from_millis(now.timestamp_millis() - keep_for.as_millis() as i64);
        // `$not`/`$gt` also admits items missing the field.
        filter.insert("updatedAt", doc! { "$not": { "$gt": cutoff } });
        filter.insert("lastFinalizedAt", doc! { "$not": { "$gt": cutoff } });
    }

    if let Some(ids) = scope {
        filter.insert("sourceDocId", doc! { "$in": ids });
    }

    let mut cursor = items
        .find(filter)
        .projection(doc! { "_id": 1, "sourceDocId": 1 })
        .sort(doc! { "_id": 1 })
        .batch_size(batch_size.min(u32::MAX as usize) as u32)
        .await?;

    let mut deleted = 0_u64;
    let mut page: Vec<(String, Bson)> = Vec::with_capacity(batch_size);

    loop {
        let entry = cursor.try_next().await?;

        if let Some(item) = &entry {
            let id = item.get_str("_id").unwrap_or_default().to_owned();
            let source_id = item.get("sourceDocId").cloned().unwrap_or(Bson::Null);
            page.push((id, source_id));
        }

        if page.len() >= batch_size || (entry.is_none() && !page.is_empty()) {
            deleted += sweep_page(&items, &source, task, &page).await?;
            page.clear();
        }

        if entry.is_none() {
            break;
        }
    }

    if deleted > 0 {
        tracing::debug!(
            target: "taskmill_runtime::cleanup",
            task = %task.name,
            deleted,
            "removed orphaned work items"
        );
    }

    Ok(deleted)
}

/// Decide the fate of one page of candidates with two indexed queries
/// against the source collection.
async fn sweep_page(
    items: &Collection<Document>,
    source: &Collection<Document>,
    task: &ReactiveTask,
    page: &[(String, Bson)],
) -> Result<u64> {
    let source_ids: Vec<Bson> = page.iter().map(|(_, sid)| sid.clone()).collect();

    let surviving = match task.cleanup_policy.delete_when {
        DeleteWhen::SourceDocumentDeleted => {
            source
                .distinct("_id", doc! { "_id": { "$in": &source_ids[..] } })
                .await?
        }
        DeleteWhen::SourceDocumentDeletedOrNoLongerMatching => {
            source
                .distinct(
                    "_id",
                    doc! { "$and": [
                        { "_id": { "$in": &source_ids[..] } },
                        task.filter.match_query(),
                    ] },
                )
                .await?
        }
        DeleteWhen::Never => return Ok(0),
    };

    let doomed: Vec<&str> = page
        .iter()
        .filter(|(_, source_id)| !surviving.contains(source_id))
        .map(|(id, _)| id.as_str())
        .collect();

    if doomed.is_empty() {
        return Ok(0);
    }

    let result = items
        .delete_many(doc! { "_id": { "$in": doomed }, "task": &task.name })
        .await?;

    Ok(result.deleted_count)
}
