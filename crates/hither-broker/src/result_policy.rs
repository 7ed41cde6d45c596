//! Whether a finished job's result is small enough to travel inline in a `JOB_FINISHED` message,
//! or should instead be left in the content store and referenced by hash. Ported unchanged from
//! the predicate the Python source's original compute resource uses, since this is a policy
//! decision, not an implementation detail, and changing the threshold would change wire behavior.

use hither_base::{Value, ValueMap};

const MAX_INLINE_STRING_LEN: usize = 1000;
const MAX_INLINE_COLLECTION_LEN: usize = 3;

/// `true` iff `value` is small enough to carry inline rather than push to the content store:
/// a number, a string of at most 1000 characters, or a list/tuple/map of at most 3 elements
/// each of which is itself a simple (non-collection) value.
pub fn is_small_enough_to_inline(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) => true,
        Value::Str(s) => s.chars().count() <= MAX_INLINE_STRING_LEN,
        Value::List { items } | Value::Tuple { items } => {
            items.len() <= MAX_INLINE_COLLECTION_LEN && items.iter().all(is_simple)
        }
        Value::Map { entries } => {
            entries.len() <= MAX_INLINE_COLLECTION_LEN
                && entries.iter().all(|(_, v)| is_simple(v))
        }
        Value::File { .. } | Value::JobRef { .. } => false,
    }
}

fn is_simple(value: &Value) -> bool {
    matches!(
        value,
        Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_and_short_strings_are_inline() {
        assert!(is_small_enough_to_inline(&Value::Int(1)));
        assert!(is_small_enough_to_inline(&Value::Float(1.5)));
        assert!(is_small_enough_to_inline(&Value::Str("x".repeat(1000))));
        assert!(!is_small_enough_to_inline(&Value::Str("x".repeat(1001))));
    }

    #[test]
    fn small_collections_of_simple_values_are_inline() {
        let list = Value::list([Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert!(is_small_enough_to_inline(&list));
        let too_big = Value::list([Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)]);
        assert!(!is_small_enough_to_inline(&too_big));
    }

    #[test]
    fn a_collection_of_collections_is_never_inline() {
        let nested = Value::list([Value::list([Value::Int(1)])]);
        assert!(!is_small_enough_to_inline(&nested));
    }

    #[test]
    fn maps_follow_the_same_rule_as_lists() {
        let mut m = ValueMap::new();
        m.insert("a", Value::Int(1));
        m.insert("b", Value::Int(2));
        assert!(is_small_enough_to_inline(&Value::map(m)));
    }

    #[test]
    fn files_and_job_refs_are_never_inline() {
        assert!(!is_small_enough_to_inline(&Value::file(
            hither_base::FileRef::raw(hither_base::Sha256Hex::of_bytes(b"x"))
        )));
    }
}
