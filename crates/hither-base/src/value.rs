//! The closed serialization grammar that argument trees and results are restricted to. See
//! spec's Design Note on a "dynamically-typed heterogeneous argument tree": this is the tagged
//! union it calls for, implemented as a single recursive enum so every serialize/resolve/
//! fingerprint routine is a plain pattern match.

use crate::ids::{JobId, Sha256Hex};
use serde::{Deserialize, Serialize};

/// Whether a [`FileRef`] addresses an opaque blob or a numeric array. Kept as a tag on the file
/// reference itself (rather than as separate `Value` variants) because both are just bytes in
/// the content store; only their decode step differs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Raw,
    Ndarray,
}

/// A handle to a blob held in the content store. The only way large binary data crosses the
/// manager/handler/resource boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub sha1_path: Sha256Hex,
    pub item_type: FileKind,
}

impl FileRef {
    pub fn raw(hash: Sha256Hex) -> Self {
        Self {
            sha1_path: hash,
            item_type: FileKind::Raw,
        }
    }

    pub fn ndarray(hash: Sha256Hex) -> Self {
        Self {
            sha1_path: hash,
            item_type: FileKind::Ndarray,
        }
    }
}

/// A dense N-dimensional numeric array, transported exclusively through the content store --
/// numpy arrays resolve to file references only, never to inline values. Never
/// appears directly in a [`Value`] tree; it is always wrapped in a [`FileRef`] with
/// `item_type: Ndarray` and fetched/decoded on demand.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NdArray {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl NdArray {
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().copied().map(f).collect(),
        }
    }
}

/// An ordered string-keyed mapping. Backed by a `Vec` of pairs rather than a hash map so
/// insertion order -- and therefore fingerprint stability -- doesn't depend on a key's hash.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueMap(Vec<(String, Value)>);

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if let Some(existing) = self.0.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = value;
        } else {
            self.0.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for ValueMap {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// The closed grammar that every job argument, argument-tree node, and result must belong to.
/// `Tuple` is kept distinct from `List` because the distinction is material to callers (a
/// function that returns a 2-tuple is not the same as one that returns a 2-list), and is
/// preserved through an explicit tag rather than collapsed at the wire boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List { items: Vec<Value> },
    Tuple { items: Vec<Value> },
    Map { entries: ValueMap },
    File { file: FileRef },
    /// A reference to another, not-yet-resolved job. Only legal inside an argument tree that
    /// hasn't been dispatched yet; fingerprinting a tree containing one is a programmer error.
    JobRef { job_id: JobId },
}

impl Value {
    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List {
            items: items.into_iter().collect(),
        }
    }

    pub fn tuple(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Tuple {
            items: items.into_iter().collect(),
        }
    }

    pub fn map(entries: ValueMap) -> Self {
        Value::Map { entries }
    }

    pub fn file(file_ref: FileRef) -> Self {
        Value::File { file: file_ref }
    }

    pub fn job_ref(job_id: JobId) -> Self {
        Value::JobRef { job_id }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileRef> {
        match self {
            Value::File { file } => Some(file),
            _ => None,
        }
    }

    /// Walks every [`JobId`] reachable in this tree, in depth-first order.
    pub fn job_refs(&self) -> Vec<&JobId> {
        let mut out = Vec::new();
        self.collect_job_refs(&mut out);
        out
    }

    fn collect_job_refs<'a>(&'a self, out: &mut Vec<&'a JobId>) {
        match self {
            Value::JobRef { job_id } => out.push(job_id),
            Value::List { items } | Value::Tuple { items } => {
                for item in items {
                    item.collect_job_refs(out);
                }
            }
            Value::Map { entries } => {
                for (_, v) in entries.iter() {
                    v.collect_job_refs(out);
                }
            }
            _ => {}
        }
    }

    /// Walks every [`FileRef`] reachable in this tree.
    pub fn file_refs(&self) -> Vec<&FileRef> {
        let mut out = Vec::new();
        self.collect_file_refs(&mut out);
        out
    }

    fn collect_file_refs<'a>(&'a self, out: &mut Vec<&'a FileRef>) {
        match self {
            Value::File { file } => out.push(file),
            Value::List { items } | Value::Tuple { items } => {
                for item in items {
                    item.collect_file_refs(out);
                }
            }
            Value::Map { entries } => {
                for (_, v) in entries.iter() {
                    v.collect_file_refs(out);
                }
            }
            _ => {}
        }
    }

    /// `true` iff no [`Value::JobRef`] is reachable anywhere in this tree. Arguments must
    /// satisfy this before they can be fingerprinted or dispatched to a handler.
    pub fn is_resolved(&self) -> bool {
        self.job_refs().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_and_list_are_distinct() {
        let list = Value::list([Value::Int(1), Value::Int(2)]);
        let tuple = Value::tuple([Value::Int(1), Value::Int(2)]);
        assert_ne!(list, tuple);

        let list_json = serde_json::to_value(&list).unwrap();
        let tuple_json = serde_json::to_value(&tuple).unwrap();
        assert_ne!(list_json, tuple_json);
    }

    #[test]
    fn job_refs_are_found_inside_nested_maps_and_lists() {
        let id = JobId::new();
        let mut entries = ValueMap::new();
        entries.insert("x", Value::list([Value::job_ref(id.clone())]));
        let tree = Value::map(entries);
        assert!(!tree.is_resolved());
        assert_eq!(tree.job_refs(), vec![&id]);
    }

    #[test]
    fn value_map_preserves_insertion_order() {
        let mut m = ValueMap::new();
        m.insert("b", Value::Int(2));
        m.insert("a", Value::Int(1));
        let keys: Vec<_> = m.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec!["b".to_string(), "a".to_string()]);
    }
}
