use mongodb::bson::{Bson, Document};
use sha2::{Digest, Sha256};

use crate::Filter;

/// The work-item id for a `(task, source document)` pair.
///
/// This mirrors the `$concat`/`$toString` expression the planner uses
/// server-side, so ids computed here and ids minted by the planning pipeline
/// agree. Re-triggering the same document always lands on the same item.
pub fn work_item_id(task: &str, source_doc_id: &Bson) -> String {
    format!("{task}:{}", bson_to_string(source_doc_id))
}

/// `$toString` semantics for the id types we support as source `_id`s.
fn bson_to_string(value: &Bson) -> String {
    match value {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        Bson::Int32(n) => n.to_string(),
        Bson::Int64(n) => n.to_string(),
        Bson::Double(n) => n.to_string(),
        Bson::Boolean(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Stable fingerprint of a task's trigger configuration.
///
/// Key order inside filter documents is irrelevant: documents are
/// canonicalized by sorting keys recursively before hashing, so a cosmetic
/// reordering does not force a reconciliation.
pub fn trigger_signature(filter: &Filter, watch_projection: Option<&[String]>) -> String {
    let mut fields: Vec<&str> = watch_projection
        .unwrap_or(&[])
        .iter()
        .map(String::as_str)
        .collect();
    fields.sort_unstable();

    let payload = format!(
        "filter:{}\u{0}projection:{}",
        canonical_json(&canonicalize(&filter.to_bson())),
        fields.join(",")
    );

    let digest = Sha256::digest(payload.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn canonicalize(value: &Bson) -> Bson {
    match value {
        Bson::Document(d) => {
            let mut keys: Vec<&String> = d.keys().collect();
            keys.sort_unstable();

            let mut out = Document::new();
            for key in keys {
                if let Some(inner) = d.get(key) {
                    out.insert(key.clone(), canonicalize(inner));
                }
            }
            Bson::Document(out)
        }
        Bson::Array(items) => Bson::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn canonical_json(value: &Bson) -> String {
    value.clone().into_relaxed_extjson().to_string()
}

#[cfg(test)]
mod tests {
    use mongodb::bson::{doc, oid::ObjectId};

    use super::*;

    #[test]
    fn ids_are_deterministic() {
        let oid = ObjectId::parse_str("64b5f0a12c3d4e5f6a7b8c9d").unwrap();

        assert_eq!(
            work_item_id("greeter", &Bson::ObjectId(oid)),
            "greeter:64b5f0a12c3d4e5f6a7b8c9d"
        );
        assert_eq!(
            work_item_id("greeter", &Bson::String("d1".into())),
            "greeter:d1"
        );
        assert_eq!(work_item_id("greeter", &Bson::Int64(42)), "greeter:42");
    }

    #[test]
    fn signature_ignores_key_order() {
        let a = Filter::Query(doc! { "a": 1, "b": { "c": 2, "d": 3 } });
        let b = Filter::Query(doc! { "b": { "d": 3, "c": 2 }, "a": 1 });

        assert_eq!(trigger_signature(&a, None), trigger_signature(&b, None));
    }

    #[test]
    fn signature_changes_with_the_filter() {
        let a = Filter::Query(doc! { "a": 1 });
        let b = Filter::Query(doc! { "a": 2 });

        assert_ne!(trigger_signature(&a, None), trigger_signature(&b, None));
    }

    #[test]
    fn signature_changes_with_the_projection() {
        let filter = Filter::Query(doc! { "a": 1 });
        let with = trigger_signature(&filter, Some(&["x".to_owned()]));
        let without = trigger_signature(&filter, None);

        assert_ne!(with, without);
    }

    #[test]
    fn projection_order_is_irrelevant() {
        let filter = Filter::default();
        let ab = trigger_signature(&filter, Some(&["a".to_owned(), "b".to_owned()]));
        let ba = trigger_signature(&filter, Some(&["b".to_owned(), "a".to_owned()]));

        assert_eq!(ab, ba);
    }
}
