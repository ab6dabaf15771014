//! Server-side planning pipeline construction.
//!
//! Planning a batch of source ids for one task is a single
//! aggregation-with-merge executed by the store: match the ids against the
//! task filter, project the would-be work item, and `$merge` it into the
//! tasks collection. The `whenMatched` pipeline decides, atomically per
//! item, whether the observed values changed and what that does to the
//! item's status and schedule.

use std::sync::Arc;
use std::time::Duration;

use mongodb::bson::{doc, Bson, Document};

use crate::registry::ReactiveTask;

/// Expression snapshotting the watched fields of the source document.
///
/// Dots are not valid keys inside an expression object, so nested paths are
/// flattened with `_`; the snapshot only has to be deterministic, not
/// round-trippable.
fn observed_values_expr(projection: Option<&[String]>) -> Bson {
    let Some(fields) = projection else {
        return Bson::Null;
    };

    let mut snapshot = Document::new();
    for field in fields {
        snapshot.insert(
            field.replace('.', "_"),
            Bson::String(format!("${field}")),
        );
    }

    Bson::Document(snapshot)
}

fn debounced_now(debounce: Duration) -> Document {
    doc! { "$dateAdd": {
        "startDate": "$$NOW",
        "unit": "millisecond",
        "amount": debounce.as_millis() as i64,
    } }
}

/// The `whenMatched` arm: `$$new` carries the freshly projected candidate.
///
/// No observed change leaves the item untouched. A change refreshes the
/// schedule and snapshot, promotes an in-flight run to `processing_dirty`,
/// and re-opens terminal items as `pending`; the failure streak resets when
/// the policy says data changes absolve past failures.
fn when_matched(reset_retries: bool) -> Vec<Document> {
    let mut set = doc! {
        "status": { "$switch": {
            "branches": [
                { "case": { "$not": ["$__changed"] }, "then": "$status" },
                {
                    "case": { "$in": ["$status", ["processing", "processing_dirty"]] },
                    "then": "processing_dirty",
                },
            ],
            "default": "pending",
        } },
        "scheduledAt": { "$cond": ["$__changed", "$$new.scheduledAt", "$scheduledAt"] },
        "initialScheduledAt": {
            "$cond": ["$__changed", "$$new.initialScheduledAt", "$initialScheduledAt"]
        },
        "lastObservedValues": {
            "$cond": ["$__changed", "$$new.lastObservedValues", "$lastObservedValues"]
        },
        "updatedAt": { "$cond": ["$__changed", "$$new.updatedAt", "$updatedAt"] },
    };

    if reset_retries {
        set.insert("attempts", doc! { "$cond": ["$__changed", 0, "$attempts"] });
        set.insert(
            "firstErrorAt",
            doc! { "$cond": ["$__changed", Bson::Null, "$firstErrorAt"] },
        );
        set.insert(
            "lastError",
            doc! { "$cond": ["$__changed", Bson::Null, "$lastError"] },
        );
    }

    vec![
        doc! { "$set": { "__changed": { "$and": [
            { "$ne": ["$$new.lastObservedValues", Bson::Null] },
            { "$ne": ["$lastObservedValues", "$$new.lastObservedValues"] },
        ] } } },
        doc! { "$set": set },
        doc! { "$unset": "__changed" },
    ]
}

/// Build the planning pipeline for `task` over the given source ids.
pub fn planning_pipeline(task: &ReactiveTask, ids: &[Bson]) -> Vec<Document> {
    let scheduled = debounced_now(task.debounce);

    vec![
        doc! { "$match": { "$and": [
            { "_id": { "$in": ids } },
            task.filter.match_query(),
        ] } },
        doc! { "$replaceWith": {
            "_id": { "$concat": [format!("{}:", task.name), { "$toString": "$_id" }] },
            "task": &task.name,
            "sourceDocId": "$_id",
            "status": "pending",
            "attempts": 0,
            "createdAt": "$$NOW",
            "updatedAt": "$$NOW",
            "scheduledAt": scheduled.clone(),
            "initialScheduledAt": scheduled,
            "lockExpiresAt": Bson::Null,
            "firstErrorAt": Bson::Null,
            "lastError": Bson::Null,
            "executionHistory": [],
            "lastObservedValues": observed_values_expr(task.watch_projection.as_deref()),
        } },
        doc! { "$merge": {
            "into": &task.tasks_collection,
            "on": "_id",
            "whenMatched": when_matched(task.retry_policy.resets_on_data_change()),
            "whenNotMatched": "insert",
        } },
    ]
}

/// The `$match`/`$project` pipeline for the database-level change stream.
///
/// Deletes always pass their collection's clause (there is no
/// `fullDocument` to test); inserts, updates and replaces must satisfy at
/// least one task filter of that collection. The projection drops
/// `fullDocument` so fat documents do not ride along to the planner.
pub fn change_stream_pipeline(tasks: &[Arc<ReactiveTask>]) -> Vec<Document> {
    let mut collections: Vec<&str> = tasks
        .iter()
        .map(|task| task.source_collection.as_str())
        .collect();
    collections.sort_unstable();
    collections.dedup();

    let mut clauses = Vec::with_capacity(collections.len());
    for collection in collections {
        let filters: Vec<_> = tasks
            .iter()
            .filter(|task| task.source_collection == collection)
            .map(|task| task.filter.clone())
            .collect();

        if filters.iter().any(|filter| filter.is_empty()) {
            // One catch-all task makes per-event filtering pointless.
            clauses.push(doc! { "ns.coll": collection });
            continue;
        }

        let mut alternatives = vec![doc! { "operationType": "delete" }];
        alternatives.extend(filters.iter().map(|f| f.change_stream_clause()));

        clauses.push(doc! { "ns.coll": collection, "$or": alternatives });
    }

    vec![
        doc! { "$match": { "$and": [
            { "operationType": { "$in": ["insert", "update", "replace", "delete"] } },
            { "$or": clauses },
        ] } },
        doc! { "$project": {
            "_id": 1,
            "operationType": 1,
            "ns": 1,
            "documentKey": 1,
            "clusterTime": 1,
        } },
    ]
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mongodb::bson::doc;
    use taskmill_core::task::{CleanupPolicy, Evolution};
    use taskmill_core::{Filter, RetryPolicy};

    use super::*;

    fn task(filter: Filter, projection: Option<Vec<String>>) -> ReactiveTask {
        ReactiveTask {
            name: "greeter".into(),
            source_collection: "people".into(),
            tasks_collection: "reactiveTasks".into(),
            filter,
            watch_projection: projection,
            handler: Arc::new(|_| Box::pin(async { Ok(()) })),
            debounce: Duration::from_millis(100),
            retry_policy: RetryPolicy::default(),
            evolution: Evolution::default(),
            cleanup_policy: CleanupPolicy::default(),
            execution_history_limit: 5,
        }
    }

    #[test]
    fn pipeline_matches_ids_and_filter() {
        let task = task(Filter::Query(doc! { "kind": "order" }), None);
        let ids = vec![Bson::String("d1".into()), Bson::String("d2".into())];
        let pipeline = planning_pipeline(&task, &ids);

        assert_eq!(pipeline.len(), 3);
        let stage = pipeline[0].get_document("$match").unwrap();
        let and = stage.get_array("$and").unwrap();
        assert_eq!(and.len(), 2);
    }

    #[test]
    fn projected_item_uses_the_deterministic_id() {
        let task = task(Filter::default(), None);
        let pipeline = planning_pipeline(&task, &[Bson::String("d1".into())]);

        let replace = pipeline[1].get_document("$replaceWith").unwrap();
        let concat = replace.get_document("_id").unwrap().get_array("$concat").unwrap();
        assert_eq!(concat[0], Bson::String("greeter:".into()));
        assert_eq!(replace.get_str("status").unwrap(), "pending");
        assert_eq!(replace.get("lastObservedValues"), Some(&Bson::Null));
    }

    #[test]
    fn watched_fields_are_snapshotted() {
        let task = task(
            Filter::default(),
            Some(vec!["name".into(), "address.city".into()]),
        );
        let pipeline = planning_pipeline(&task, &[Bson::String("d1".into())]);

        let replace = pipeline[1].get_document("$replaceWith").unwrap();
        let observed = replace.get_document("lastObservedValues").unwrap();
        assert_eq!(observed.get_str("name").unwrap(), "$name");
        assert_eq!(observed.get_str("address_city").unwrap(), "$address.city");
    }

    #[test]
    fn merge_targets_the_tasks_collection() {
        let task = task(Filter::default(), None);
        let pipeline = planning_pipeline(&task, &[Bson::String("d1".into())]);

        let merge = pipeline[2].get_document("$merge").unwrap();
        assert_eq!(merge.get_str("into").unwrap(), "reactiveTasks");
        assert_eq!(merge.get_str("whenNotMatched").unwrap(), "insert");
        assert_eq!(merge.get_array("whenMatched").unwrap().len(), 3);
    }

    #[test]
    fn when_matched_resets_retries_only_when_asked() {
        let with = when_matched(true);
        let set = with[1].get_document("$set").unwrap();
        assert!(set.get("attempts").is_some());
        assert!(set.get("firstErrorAt").is_some());

        let without = when_matched(false);
        let set = without[1].get_document("$set").unwrap();
        assert!(set.get("attempts").is_none());
    }

    #[test]
    fn stream_pipeline_prefixes_task_filters() {
        let tasks = vec![Arc::new(task(
            Filter::Query(doc! { "kind": "order" }),
            None,
        ))];
        let pipeline = change_stream_pipeline(&tasks);

        let stage = pipeline[0].get_document("$match").unwrap();
        let and = stage.get_array("$and").unwrap();
        let clauses = and[1].as_document().unwrap().get_array("$or").unwrap();
        let clause = clauses[0].as_document().unwrap();

        assert_eq!(clause.get_str("ns.coll").unwrap(), "people");
        let alternatives = clause.get_array("$or").unwrap();
        assert_eq!(
            alternatives[0].as_document().unwrap().get_str("operationType").unwrap(),
            "delete"
        );
        assert!(alternatives[1]
            .as_document()
            .unwrap()
            .get("fullDocument.kind")
            .is_some());
    }

    #[test]
    fn catch_all_tasks_skip_event_filtering() {
        let tasks = vec![
            Arc::new(task(Filter::default(), None)),
            Arc::new(task(Filter::Query(doc! { "kind": "order" }), None)),
        ];
        let pipeline = change_stream_pipeline(&tasks);

        let stage = pipeline[0].get_document("$match").unwrap();
        let and = stage.get_array("$and").unwrap();
        let clauses = and[1].as_document().unwrap().get_array("$or").unwrap();
        let clause = clauses[0].as_document().unwrap();

        assert_eq!(clause.get_str("ns.coll").unwrap(), "people");
        assert!(clause.get("$or").is_none());
    }
}
