use mongodb::bson::{doc, Bson, Document};

/// A reactive task filter.
///
/// Either a standard field-equality query (`{ kind: "order", total: { $gt: 10 } }`)
/// or a boolean aggregation expression (`{ $gt: ["$total", 10] }`). Both forms
/// can be rendered as a plain find filter and as a change-stream `$match`
/// clause applied under the `fullDocument.` prefix.
#[derive(Clone, Debug)]
pub enum Filter {
    Query(Document),
    Expr(Bson),
}

impl Default for Filter {
    fn default() -> Self {
        Self::Query(Document::new())
    }
}

impl From<Document> for Filter {
    fn from(query: Document) -> Self {
        Self::Query(query)
    }
}

impl Filter {
    pub fn expr(expression: impl Into<Bson>) -> Self {
        Self::Expr(expression.into())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Query(q) if q.is_empty())
    }

    /// Render as a filter usable with `find` / `count` / `delete`.
    pub fn match_query(&self) -> Document {
        match self {
            Self::Query(query) => query.clone(),
            Self::Expr(expression) => doc! { "$expr": expression.clone() },
        }
    }

    /// Render as a change-stream `$match` clause: every bare field path and
    /// left-hand field key is re-rooted under `fullDocument.`.
    pub fn change_stream_clause(&self) -> Document {
        match self {
            Self::Query(query) => prefix_query(query, "fullDocument"),
            Self::Expr(expression) => {
                doc! { "$expr": prefix_expression(expression, "fullDocument") }
            }
        }
    }

    /// Canonical BSON rendering used for trigger-config fingerprints.
    pub(crate) fn to_bson(&self) -> Bson {
        match self {
            Self::Query(query) => Bson::Document(query.clone()),
            Self::Expr(expression) => expression.clone(),
        }
    }
}

/// Rewrite a query document so it applies to documents nested under `prefix`.
///
/// Logical operators (`$or`, `$and`, `$nor`) recurse into their branches,
/// `$expr` switches to expression rewriting, other `$`-keys are preserved
/// as-is, and plain field keys are prefixed. Operator documents on the value
/// side (`{ $in: [...] }`) are left alone since their fields are relative.
pub fn prefix_query(query: &Document, prefix: &str) -> Document {
    let mut out = Document::new();

    for (key, value) in query {
        match key.as_str() {
            "$or" | "$and" | "$nor" => {
                let branches = match value {
                    Bson::Array(items) => items
                        .iter()
                        .map(|item| match item {
                            Bson::Document(d) => Bson::Document(prefix_query(d, prefix)),
                            other => other.clone(),
                        })
                        .collect(),
                    other => vec![other.clone()],
                };
                out.insert(key, Bson::Array(branches));
            }
            "$expr" => {
                out.insert(key, prefix_expression(value, prefix));
            }
            _ if key.starts_with('$') => {
                out.insert(key, value.clone());
            }
            _ => {
                out.insert(format!("{prefix}.{key}"), value.clone());
            }
        }
    }

    out
}

/// Rewrite an aggregation expression so field paths resolve under `prefix`.
///
/// Bare field paths (`"$total"`) become `"$<prefix>.total"`; system variables
/// (`"$$NOW"`, `"$$ROOT"`) are preserved; `$literal` payloads are untouched;
/// everything else recurses structurally.
pub fn prefix_expression(expression: &Bson, prefix: &str) -> Bson {
    match expression {
        Bson::String(s) => {
            if let Some(path) = s.strip_prefix('$') {
                if path.starts_with('$') {
                    // A `$$variable`; not a field path.
                    Bson::String(s.clone())
                } else {
                    Bson::String(format!("${prefix}.{path}"))
                }
            } else {
                Bson::String(s.clone())
            }
        }
        Bson::Document(d) => {
            let mut out = Document::new();
            for (key, value) in d {
                if key == "$literal" {
                    out.insert(key, value.clone());
                } else {
                    out.insert(key, prefix_expression(value, prefix));
                }
            }
            Bson::Document(out)
        }
        Bson::Array(items) => Bson::Array(
            items
                .iter()
                .map(|item| prefix_expression(item, prefix))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_query_stays_empty() {
        let filter = Filter::default();
        assert!(filter.is_empty());
        assert_eq!(filter.change_stream_clause(), Document::new());
    }

    #[test]
    fn field_keys_are_prefixed() {
        let filter = Filter::Query(doc! { "kind": "order", "total": { "$gt": 10 } });
        assert_eq!(
            filter.change_stream_clause(),
            doc! { "fullDocument.kind": "order", "fullDocument.total": { "$gt": 10 } }
        );
    }

    #[test]
    fn logical_operators_recurse() {
        let filter = Filter::Query(doc! {
            "$or": [ { "a": 1 }, { "$and": [ { "b": { "$in": [1, 2] } } ] } ]
        });

        assert_eq!(
            filter.change_stream_clause(),
            doc! {
                "$or": [
                    { "fullDocument.a": 1 },
                    { "$and": [ { "fullDocument.b": { "$in": [1, 2] } } ] }
                ]
            }
        );
    }

    #[test]
    fn expr_values_switch_to_expression_rewriting() {
        let filter = Filter::Query(doc! {
            "$expr": { "$gt": ["$total", "$limit"] }
        });

        assert_eq!(
            filter.change_stream_clause(),
            doc! { "$expr": { "$gt": ["$fullDocument.total", "$fullDocument.limit"] } }
        );
    }

    #[test]
    fn system_variables_survive() {
        let rewritten = prefix_expression(
            &Bson::Document(doc! { "$lt": ["$expiresAt", "$$NOW"] }),
            "fullDocument",
        );

        assert_eq!(
            rewritten,
            Bson::Document(doc! { "$lt": ["$fullDocument.expiresAt", "$$NOW"] })
        );
    }

    #[test]
    fn literals_are_untouched() {
        let rewritten = prefix_expression(
            &Bson::Document(doc! { "$eq": ["$name", { "$literal": "$name" }] }),
            "fullDocument",
        );

        assert_eq!(
            rewritten,
            Bson::Document(doc! { "$eq": ["$fullDocument.name", { "$literal": "$name" }] })
        );
    }

    #[test]
    fn expression_filters_prefix_their_paths() {
        let filter = Filter::expr(doc! { "$eq": ["$status", "open"] });
        assert_eq!(
            filter.change_stream_clause(),
            doc! { "$expr": { "$eq": ["$fullDocument.status", "open"] } }
        );
    }

    #[test]
    fn expression_filters_render_as_expr_queries() {
        let filter = Filter::expr(doc! { "$eq": ["$status", "open"] });
        assert_eq!(
            filter.match_query(),
            doc! { "$expr": { "$eq": ["$status", "open"] } }
        );
    }
}
