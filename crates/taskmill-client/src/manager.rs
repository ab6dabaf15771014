//! Paged listing, stats and retry across task collections.

use std::collections::BTreeMap;

use futures_util::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::{Collection, Database};
use taskmill_core::cron::CronTaskDoc;
use taskmill_core::task::{TaskBinding, TaskStatus, WorkItem};
use taskmill_core::{time, Result};

use crate::dto::{
    CronTaskInfo, CronTaskListPage, InfoResponse, ReactiveTaskInfo, TaskListPage, TaskStats,
};
use crate::ids::id_candidates;

const MAX_PAGE: i64 = 500;
const RETRY_SCAN_BATCH: usize = 500;

/// Narrow filter over work items, combinable field by field.
#[derive(Clone, Debug, Default)]
pub struct TaskQuery {
    pub task: Option<String>,
    pub status: Option<TaskStatus>,
    pub id: Option<String>,
    /// Case-insensitive regex over `lastError`.
    pub error_message: Option<String>,
    pub has_error: Option<bool>,
    pub source_doc_id: Option<String>,
}

#[derive(Clone, Copy, Debug)]
pub struct Pagination {
    pub limit: i64,
    pub skip: u64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { limit: 50, skip: 0 }
    }
}

/// Selection for [`TaskManager::retry_tasks`]. `source_doc_filter` richer
/// than an `_id` lookup triggers a batched scan of the source collection to
/// enumerate matching ids.
#[derive(Clone, Debug, Default)]
pub struct RetryQuery {
    pub task: Option<String>,
    pub status: Option<TaskStatus>,
    pub id: Option<String>,
    pub error_message: Option<String>,
    pub source_doc_id: Option<String>,
    pub source_doc_filter: Option<Document>,
}

#[derive(Clone, Debug, Default)]
pub struct CronListQuery {
    /// Case-insensitive regex over the task id.
    pub filter: Option<String>,
    /// `(field, direction)`, direction being `1` or `-1`.
    pub sort: Option<(String, i32)>,
}

/// Read/write admin surface over the task collections of the registered
/// reactive tasks plus the cron collection.
pub struct TaskManager {
    db: Database,
    bindings: Vec<TaskBinding>,
    cron_collection: String,
}

impl TaskManager {
    pub fn new(db: Database, bindings: Vec<TaskBinding>, cron_collection: String) -> Self {
        Self {
            db,
            bindings,
            cron_collection,
        }
    }

    fn bindings_for(&self, task: Option<&str>) -> Vec<&TaskBinding> {
        self.bindings
            .iter()
            .filter(|binding| task.map(|t| binding.name == t).unwrap_or(true))
            .collect()
    }

    fn collections_of(bindings: &[&TaskBinding]) -> Vec<String> {
        let mut collections: Vec<String> = bindings
            .iter()
            .map(|binding| binding.tasks_collection.clone())
            .collect();
        collections.sort_unstable();
        collections.dedup();
        collections
    }

    fn base_filter(&self, query: &TaskQuery, bindings: &[&TaskBinding]) -> Document {
        let mut filter = doc! {};

        match &query.task {
            Some(task) => {
                filter.insert("task", task);
            }
            None => {
                // The work-item collection may be shared; never show items
                // of tasks this process does not know about.
                let names: Vec<&str> = bindings.iter().map(|b| b.name.as_str()).collect();
                filter.insert("task", doc! { "$in": names });
            }
        }

        if let Some(status) = query.status {
            filter.insert("status", status.as_str());
        }
        if let Some(id) = &query.id {
            filter.insert("_id", id);
        }
        if let Some(predicate) = last_error_predicate(query.error_message.as_deref(), query.has_error)
        {
            filter.insert("lastError", predicate);
        }
        if let Some(source_id) = &query.source_doc_id {
            filter.insert("sourceDocId", doc! { "$in": id_candidates(source_id) });
        }

        filter
    }

    /// Paged listing. A single backing collection pages server-side; tasks
    /// spread over several collections are scatter-gathered and merge-sorted
    /// client-side, which is fine at dashboard page sizes.
    pub async fn get_tasks(&self, query: &TaskQuery, page: Pagination) -> Result<TaskListPage> {
        let bindings = self.bindings_for(query.task.as_deref());
        let limit = page.limit.clamp(1, MAX_PAGE);
        let skip = page.skip;

        if bindings.is_empty() {
            return Ok(TaskListPage {
                items: Vec::new(),
                total: 0,
                limit,
                offset: skip,
                stats: TaskStats::default(),
            });
        }

        let filter = self.base_filter(query, &bindings);
        let collections = Self::collections_of(&bindings);

        let mut total = 0_u64;
        for name in &collections {
            total += self
                .db
                .collection::<WorkItem>(name)
                .count_documents(filter.clone())
                .await?;
        }

        let sort = doc! { "scheduledAt": 1, "_id": 1 };
        let items = if collections.len() == 1 {
            self.db
                .collection::<WorkItem>(&collections[0])
                .find(filter.clone())
                .sort(sort)
                .skip(skip)
                .limit(limit)
                .await?
                .try_collect()
                .await?
        } else {
            let mut merged: Vec<WorkItem> = Vec::new();
            for name in &collections {
                let mut chunk: Vec<WorkItem> = self
                    .db
                    .collection::<WorkItem>(name)
                    .find(filter.clone())
                    .sort(sort.clone())
                    .limit(limit + skip as i64)
                    .await?
                    .try_collect()
                    .await?;
                merged.append(&mut chunk);
            }

            merged.sort_by(|a, b| {
                a.scheduled_at
                    .cmp(&b.scheduled_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
            merged
                .into_iter()
                .skip(skip as usize)
                .take(limit as usize)
                .collect()
        };

        // Stats ignore the status facet so the buckets always add up for
        // the filtered population.
        let stats_query = TaskQuery {
            status: None,
            ..query.clone()
        };
        let stats = self
            .stats(&collections, &self.base_filter(&stats_query, &bindings))
            .await?;

        Ok(TaskListPage {
            items,
            total,
            limit,
            offset: skip,
            stats,
        })
    }

    pub async fn count_tasks(&self, query: &TaskQuery) -> Result<u64> {
        let bindings = self.bindings_for(query.task.as_deref());
        if bindings.is_empty() {
            return Ok(0);
        }

        let filter = self.base_filter(query, &bindings);
        let mut total = 0_u64;
        for name in Self::collections_of(&bindings) {
            total += self
                .db
                .collection::<WorkItem>(&name)
                .count_documents(filter.clone())
                .await?;
        }

        Ok(total)
    }

    async fn stats(&self, collections: &[String], filter: &Document) -> Result<TaskStats> {
        let mut stats = TaskStats::default();

        for name in collections {
            let pipeline = vec![
                doc! { "$match": filter.clone() },
                doc! { "$group": {
                    "_id": "$status",
                    "count": { "$sum": 1 },
                    "errors": { "$sum": {
                        "$cond": [{ "$ne": ["$lastError", null] }, 1, 0]
                    } },
                } },
            ];

            let mut cursor = self
                .db
                .collection::<Document>(name)
                .aggregate(pipeline)
                .await?;

            while let Some(group) = cursor.try_next().await? {
                let count = count_of(&group, "count");
                match group.get_str("_id").unwrap_or_default() {
                    "completed" => stats.success += count,
                    "failed" => stats.failed += count,
                    "processing" | "processing_dirty" => stats.processing += count,
                    "pending" => stats.pending += count,
                    _ => {}
                }
                stats.error += count_of(&group, "errors");
            }
        }

        Ok(stats)
    }

    /// Reset matching items to `pending` with a fresh schedule and a
    /// cleared failure streak. Returns the number of modified items.
    pub async fn retry_tasks(&self, query: &RetryQuery) -> Result<u64> {
        let bindings = self.bindings_for(query.task.as_deref());
        if bindings.is_empty() {
            return Ok(0);
        }

        let item_query = TaskQuery {
            task: query.task.clone(),
            status: query.status,
            id: query.id.clone(),
            error_message: query.error_message.clone(),
            has_error: None,
            source_doc_id: query.source_doc_id.clone(),
        };
        let mut filter = self.base_filter(&item_query, &bindings);

        match &query.source_doc_filter {
            Some(source_filter) if is_plain_id_lookup(source_filter) => {
                if let Some(id) = source_filter.get("_id") {
                    filter.insert("sourceDocId", id.clone());
                }
                self.apply_retry(&Self::collections_of(&bindings), filter).await
            }
            Some(source_filter) => {
                self.retry_by_source_scan(&bindings, filter, source_filter)
                    .await
            }
            None => self.apply_retry(&Self::collections_of(&bindings), filter).await,
        }
    }

    async fn apply_retry(&self, collections: &[String], filter: Document) -> Result<u64> {
        let mut modified = 0_u64;
        for name in collections {
            let result = self
                .db
                .collection::<Document>(name)
                .update_many(filter.clone(), retry_update())
                .await?;
            modified += result.modified_count;
        }

        tracing::debug!(target: "taskmill_client", modified, "reset work items for retry");
        Ok(modified)
    }

    /// A complex source-document filter cannot be evaluated against the
    /// task collection, so enumerate matching source ids in batches and
    /// reset per batch.
    async fn retry_by_source_scan(
        &self,
        bindings: &[&TaskBinding],
        base: Document,
        source_filter: &Document,
    ) -> Result<u64> {
        let mut modified = 0_u64;

        // Group per source collection; tasks sharing a source share a scan.
        let mut by_source: BTreeMap<&str, Vec<&&TaskBinding>> = BTreeMap::new();
        for binding in bindings {
            by_source
                .entry(binding.source_collection.as_str())
                .or_default()
                .push(binding);
        }

        for (source_collection, group) in by_source {
            let source: Collection<Document> = self.db.collection(source_collection);
            let mut cursor = source
                .find(source_filter.clone())
                .projection(doc! { "_id": 1 })
                .await?;

            let mut ids: Vec<Bson> = Vec::with_capacity(RETRY_SCAN_BATCH);
            loop {
                let entry = cursor.try_next().await?;
                if let Some(doc) = &entry {
                    if let Some(id) = doc.get("_id") {
                        ids.push(id.clone());
                    }
                }

                if ids.len() >= RETRY_SCAN_BATCH || (entry.is_none() && !ids.is_empty()) {
                    for binding in &group {
                        let mut filter = base.clone();
                        filter.insert("task", &binding.name);
                        filter.insert("sourceDocId", doc! { "$in": &ids[..] });

                        let result = self
                            .db
                            .collection::<Document>(&binding.tasks_collection)
                            .update_many(filter, retry_update())
                            .await?;
                        modified += result.modified_count;
                    }
                    ids.clear();
                }

                if entry.is_none() {
                    break;
                }
            }
        }

        Ok(modified)
    }

    pub async fn get_cron_tasks(
        &self,
        query: &CronListQuery,
        page: Pagination,
    ) -> Result<CronTaskListPage> {
        let collection: Collection<CronTaskDoc> = self.db.collection(&self.cron_collection);

        let filter = match &query.filter {
            Some(pattern) => doc! { "_id": { "$regex": pattern, "$options": "i" } },
            None => doc! {},
        };

        let sort = match &query.sort {
            Some((field, direction)) => doc! { field: if *direction < 0 { -1 } else { 1 } },
            None => doc! { "_id": 1 },
        };

        let limit = page.limit.clamp(1, MAX_PAGE);
        let total = collection.count_documents(filter.clone()).await?;
        let items = collection
            .find(filter)
            .sort(sort)
            .skip(page.skip)
            .limit(limit)
            .await?
            .try_collect()
            .await?;

        Ok(CronTaskListPage {
            items,
            total,
            limit,
            offset: page.skip,
        })
    }

    /// The `/api/info` snapshot: per-task stats and the cron schedule.
    pub async fn info(&self) -> Result<InfoResponse> {
        let mut reactive_tasks = Vec::with_capacity(self.bindings.len());
        for binding in &self.bindings {
            let stats = self
                .stats(
                    std::slice::from_ref(&binding.tasks_collection),
                    &doc! { "task": &binding.name },
                )
                .await?;

            reactive_tasks.push(ReactiveTaskInfo {
                name: binding.name.clone(),
                collection: binding.source_collection.clone(),
                stats,
            });
        }

        let now = time::now();
        let mut cron_tasks = Vec::new();
        let mut cursor = self
            .db
            .collection::<CronTaskDoc>(&self.cron_collection)
            .find(doc! {})
            .sort(doc! { "_id": 1 })
            .await?;
        while let Some(doc) = cursor.try_next().await? {
            cron_tasks.push(CronTaskInfo {
                id: doc.id.clone(),
                status: doc.status(now),
                last_run_error: doc.last_run_error().map(str::to_owned),
                next_run_at: doc.run_since,
            });
        }

        Ok(InfoResponse {
            database_name: self.db.name().to_owned(),
            reactive_tasks,
            cron_tasks,
        })
    }
}

fn retry_update() -> Document {
    doc! { "$set": {
        "status": "pending",
        "attempts": 0,
        "scheduledAt": time::now(),
        "updatedAt": time::now(),
        "firstErrorAt": null,
        "lastError": null,
        "lockExpiresAt": null,
    } }
}

/// Combine the `error_message` regex and the `has_error` facet into one
/// `lastError` predicate; both are operator clauses on the same key, so
/// they AND together like every other filter field.
fn last_error_predicate(
    error_message: Option<&str>,
    has_error: Option<bool>,
) -> Option<Document> {
    let mut predicate = Document::new();

    if let Some(message) = error_message {
        predicate.insert("$regex", message);
        predicate.insert("$options", "i");
    }
    match has_error {
        Some(true) => {
            predicate.insert("$ne", Bson::Null);
        }
        Some(false) => {
            predicate.insert("$eq", Bson::Null);
        }
        None => {}
    }

    if predicate.is_empty() {
        None
    } else {
        Some(predicate)
    }
}

fn is_plain_id_lookup(filter: &Document) -> bool {
    filter.len() == 1 && filter.contains_key("_id")
}

fn count_of(group: &Document, key: &str) -> u64 {
    match group.get(key) {
        Some(Bson::Int32(n)) => (*n).max(0) as u64,
        Some(Bson::Int64(n)) => (*n).max(0) as u64,
        Some(Bson::Double(n)) => n.max(0.0) as u64,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use taskmill_core::Filter;

    use super::*;

    fn binding(name: &str, tasks_collection: &str) -> TaskBinding {
        TaskBinding {
            name: name.into(),
            source_collection: "people".into(),
            tasks_collection: tasks_collection.into(),
            filter: Filter::default(),
            watch_projection: None,
        }
    }

    #[test]
    fn error_facets_share_one_predicate() {
        let combined = last_error_predicate(Some("timeout"), Some(true)).unwrap();
        assert_eq!(combined.get_str("$regex").unwrap(), "timeout");
        assert_eq!(combined.get_str("$options").unwrap(), "i");
        assert_eq!(combined.get("$ne"), Some(&Bson::Null));

        let regex_only = last_error_predicate(Some("timeout"), None).unwrap();
        assert!(regex_only.get("$ne").is_none());

        let errorless = last_error_predicate(None, Some(false)).unwrap();
        assert_eq!(errorless.get("$eq"), Some(&Bson::Null));

        assert!(last_error_predicate(None, None).is_none());
    }

    #[test]
    fn plain_id_lookup_detection() {
        assert!(is_plain_id_lookup(&doc! { "_id": "d1" }));
        assert!(!is_plain_id_lookup(&doc! { "_id": "d1", "kind": "x" }));
        assert!(!is_plain_id_lookup(&doc! { "kind": "x" }));
    }

    #[test]
    fn group_counts_tolerate_numeric_widening() {
        let group = doc! { "count": 3_i32, "errors": 2_i64 };
        assert_eq!(count_of(&group, "count"), 3);
        assert_eq!(count_of(&group, "errors"), 2);
        assert_eq!(count_of(&group, "missing"), 0);
    }

    #[test]
    fn bindings_narrow_by_task() {
        let bindings = vec![binding("a", "tasksA"), binding("b", "tasksB")];
        let all: Vec<&TaskBinding> = bindings.iter().collect();
        assert_eq!(TaskManager::collections_of(&all), vec!["tasksA", "tasksB"]);
    }
}
