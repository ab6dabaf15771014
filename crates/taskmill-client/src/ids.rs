use mongodb::bson::oid::ObjectId;
use mongodb::bson::Bson;

/// Candidate interpretations of a user-supplied source document id.
///
/// Dashboard inputs arrive as strings; the stored `sourceDocId` may be a
/// string, an ObjectId, or a number. Matching tries every plausible
/// reading at once.
pub fn id_candidates(input: &str) -> Vec<Bson> {
    let mut candidates = vec![Bson::String(input.to_owned())];

    if input.len() == 24 {
        if let Ok(oid) = ObjectId::parse_str(input) {
            candidates.push(Bson::ObjectId(oid));
        }
    }

    if let Ok(int) = input.parse::<i64>() {
        candidates.push(Bson::Int64(int));
        if let Ok(int) = input.parse::<i32>() {
            candidates.push(Bson::Int32(int));
        }
    } else if let Ok(float) = input.parse::<f64>() {
        candidates.push(Bson::Double(float));
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_strings_stay_strings() {
        let candidates = id_candidates("d1");
        assert_eq!(candidates, vec![Bson::String("d1".into())]);
    }

    #[test]
    fn hex24_also_tries_object_id() {
        let candidates = id_candidates("64b5f0a12c3d4e5f6a7b8c9d");
        assert_eq!(candidates.len(), 2);
        assert!(matches!(candidates[1], Bson::ObjectId(_)));
    }

    #[test]
    fn numbers_also_try_numeric_types() {
        let candidates = id_candidates("42");
        assert!(candidates.contains(&Bson::Int64(42)));
        assert!(candidates.contains(&Bson::Int32(42)));

        let candidates = id_candidates("4.5");
        assert!(candidates.contains(&Bson::Double(4.5)));
    }
}
