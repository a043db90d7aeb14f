//! Mutation interception layer
//!
//! Replicated values are held as a shadow tree: primitives inline,
//! objects and arrays as [`Container`] nodes behind `Arc`, so nested
//! structures have identity. Every container carries lazily-created
//! node metadata (owning replicant + current path from the root), which
//! is how the single-owner invariant is enforced: a container already
//! owned by one replicant cannot be attached to another.
//!
//! [`SharedNode`] is the explicit handle by which a live container can
//! be extracted from one tree and attached elsewhere; attaching across
//! replicants fails loudly with the conflicting owner's identity.

use serde_json::{Number, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::ReplicantError;
use crate::path;
use crate::protocol::{OpMethod, ReplicantIdent};

/// Metadata attached to a container the first time it is reached during
/// tree traversal. The path is refreshed whenever the node is revisited
/// at a new location (covers moves within the same tree).
#[derive(Clone, Debug)]
pub struct NodeMeta {
    pub owner: ReplicantIdent,
    pub path: String,
}

/// A wrapped value: primitives pass through, containers gain identity.
#[derive(Clone)]
pub enum Wrapped {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Container(Arc<Container>),
}

pub enum ContainerData {
    Object(BTreeMap<String, Wrapped>),
    Array(Vec<Wrapped>),
}

pub struct Container {
    data: RwLock<ContainerData>,
    meta: RwLock<Option<NodeMeta>>,
}

impl Wrapped {
    /// Build a fresh shadow tree from a plain value. No metadata is
    /// attached; that happens during [`wrap_recursive`].
    pub fn from_value(value: &Value) -> Wrapped {
        match value {
            Value::Null => Wrapped::Null,
            Value::Bool(b) => Wrapped::Bool(*b),
            Value::Number(n) => Wrapped::Number(n.clone()),
            Value::String(s) => Wrapped::String(s.clone()),
            Value::Array(items) => {
                let data = ContainerData::Array(items.iter().map(Wrapped::from_value).collect());
                Wrapped::Container(Arc::new(Container::new(data)))
            }
            Value::Object(map) => {
                let data = ContainerData::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), Wrapped::from_value(v)))
                        .collect(),
                );
                Wrapped::Container(Arc::new(Container::new(data)))
            }
        }
    }

    /// Deep snapshot back to a plain value.
    pub fn to_value(&self) -> Value {
        match self {
            Wrapped::Null => Value::Null,
            Wrapped::Bool(b) => Value::Bool(*b),
            Wrapped::Number(n) => Value::Number(n.clone()),
            Wrapped::String(s) => Value::String(s.clone()),
            Wrapped::Container(c) => c.snapshot(),
        }
    }

    pub fn as_container(&self) -> Option<&Arc<Container>> {
        match self {
            Wrapped::Container(c) => Some(c),
            _ => None,
        }
    }
}

impl Container {
    fn new(data: ContainerData) -> Self {
        Self {
            data: RwLock::new(data),
            meta: RwLock::new(None),
        }
    }

    pub fn meta(&self) -> Option<NodeMeta> {
        self.meta
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_array(&self) -> bool {
        matches!(
            &*self.data.read().unwrap_or_else(PoisonError::into_inner),
            ContainerData::Array(_)
        )
    }

    pub fn snapshot(&self) -> Value {
        match &*self.data.read().unwrap_or_else(PoisonError::into_inner) {
            ContainerData::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.to_value());
                }
                Value::Object(out)
            }
            ContainerData::Array(items) => {
                Value::Array(items.iter().map(Wrapped::to_value).collect())
            }
        }
    }

    pub fn get_member(&self, key: &str) -> Option<Wrapped> {
        match &*self.data.read().unwrap_or_else(PoisonError::into_inner) {
            ContainerData::Object(map) => map.get(key).cloned(),
            ContainerData::Array(items) => {
                let index: usize = key.parse().ok()?;
                items.get(index).cloned()
            }
        }
    }

    /// Set a named (or indexed) member. Returns whether the member
    /// already existed. Array indexes may extend the array by exactly
    /// one slot (index == length appends).
    pub fn set_member(&self, key: &str, value: Wrapped) -> Result<bool, ReplicantError> {
        match &mut *self.data.write().unwrap_or_else(PoisonError::into_inner) {
            ContainerData::Object(map) => Ok(map.insert(key.to_string(), value).is_some()),
            ContainerData::Array(items) => {
                let index: usize = key
                    .parse()
                    .map_err(|_| ReplicantError::BadRequest(format!("bad array index {:?}", key)))?;
                if index < items.len() {
                    items[index] = value;
                    Ok(true)
                } else if index == items.len() {
                    items.push(value);
                    Ok(false)
                } else {
                    Err(ReplicantError::BadRequest(format!(
                        "array index {} out of bounds (len {})",
                        index,
                        items.len()
                    )))
                }
            }
        }
    }

    /// Remove a member; returns whether it existed.
    pub fn remove_member(&self, key: &str) -> bool {
        match &mut *self.data.write().unwrap_or_else(PoisonError::into_inner) {
            ContainerData::Object(map) => map.remove(key).is_some(),
            ContainerData::Array(items) => match key.parse::<usize>() {
                Ok(index) if index < items.len() => {
                    items.remove(index);
                    true
                }
                _ => false,
            },
        }
    }

    /// Apply one of the canonical array-mutating methods. Returns what
    /// the mutator returned: the new length for push/unshift, the
    /// removed element for pop/shift, the removed slice for splice, the
    /// mutated array for sort/reverse. `None` models `undefined` (pop or
    /// shift on an empty array).
    pub fn array_mutate(
        &self,
        method: OpMethod,
        args: &[Value],
    ) -> Result<Option<Value>, ReplicantError> {
        fn int_arg(args: &[Value], index: usize) -> Option<i64> {
            let arg = args.get(index)?;
            arg.as_i64().or_else(|| arg.as_f64().map(|f| f as i64))
        }

        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let ContainerData::Array(items) = &mut *data else {
            return Err(ReplicantError::BadRequest(format!(
                "{} invoked on a non-array",
                method
            )));
        };

        let result = match method {
            OpMethod::Push => {
                for arg in args {
                    items.push(Wrapped::from_value(arg));
                }
                Some(Value::from(items.len() as u64))
            }
            OpMethod::Pop => items.pop().map(|w| w.to_value()),
            OpMethod::Shift => {
                if items.is_empty() {
                    None
                } else {
                    Some(items.remove(0).to_value())
                }
            }
            OpMethod::Unshift => {
                for arg in args.iter().rev() {
                    items.insert(0, Wrapped::from_value(arg));
                }
                Some(Value::from(items.len() as u64))
            }
            OpMethod::Splice => {
                let len = items.len() as i64;
                let start = int_arg(args, 0).unwrap_or(0);
                let start = if start < 0 {
                    (len + start).max(0)
                } else {
                    start.min(len)
                } as usize;
                let max_delete = items.len() - start;
                let delete = int_arg(args, 1)
                    .map(|d| (d.max(0) as usize).min(max_delete))
                    .unwrap_or(max_delete);
                let inserted: Vec<Wrapped> =
                    args.iter().skip(2).map(Wrapped::from_value).collect();
                let removed: Vec<Value> = items
                    .splice(start..start + delete, inserted)
                    .map(|w| w.to_value())
                    .collect();
                Some(Value::Array(removed))
            }
            OpMethod::Sort => {
                items.sort_by(|a, b| value_cmp(&a.to_value(), &b.to_value()));
                Some(Value::Array(items.iter().map(Wrapped::to_value).collect()))
            }
            OpMethod::Reverse => {
                items.reverse();
                Some(Value::Array(items.iter().map(Wrapped::to_value).collect()))
            }
            OpMethod::Add | OpMethod::Update | OpMethod::Delete => {
                return Err(ReplicantError::BadRequest(format!(
                    "{} is not an array mutator",
                    method
                )))
            }
        };
        Ok(result)
    }

    /// Whether `needle` is this container or reachable from it. Used to
    /// refuse attaching a node inside its own subtree.
    pub fn contains(self: &Arc<Self>, needle: &Arc<Container>) -> bool {
        if Arc::ptr_eq(self, needle) {
            return true;
        }
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let children: Vec<Arc<Container>> = match &*data {
            ContainerData::Object(map) => map
                .values()
                .filter_map(|w| w.as_container().cloned())
                .collect(),
            ContainerData::Array(items) => items
                .iter()
                .filter_map(|w| w.as_container().cloned())
                .collect(),
        };
        drop(data);
        children.iter().any(|child| child.contains(needle))
    }
}

/// A live handle onto a container inside some replicant's value tree.
#[derive(Clone)]
pub struct SharedNode {
    pub(crate) node: Arc<Container>,
}

impl SharedNode {
    pub fn snapshot(&self) -> Value {
        self.node.snapshot()
    }

    pub fn owner(&self) -> Option<ReplicantIdent> {
        self.node.meta().map(|m| m.owner)
    }

    pub fn path(&self) -> Option<String> {
        self.node.meta().map(|m| m.path)
    }
}

/// Walk a wrapped tree depth-first, attaching or refreshing node
/// metadata under `owner`, with keys escaped into the path.
///
/// Fails with an ownership violation if any reached container is
/// already owned by a different replicant, and with a protocol error if
/// the traversal revisits a node (a cycle, which a JSON tree must never
/// contain).
pub fn wrap_recursive(
    root: &Wrapped,
    owner: &ReplicantIdent,
    root_path: &str,
) -> Result<(), ReplicantError> {
    let mut visited = HashSet::new();
    wrap_inner(root, owner, root_path, &mut visited)
}

fn wrap_inner(
    node: &Wrapped,
    owner: &ReplicantIdent,
    at: &str,
    visited: &mut HashSet<usize>,
) -> Result<(), ReplicantError> {
    let Wrapped::Container(container) = node else {
        return Ok(());
    };

    if !visited.insert(Arc::as_ptr(container) as usize) {
        return Err(ReplicantError::Protocol(format!(
            "cycle detected in value tree at {}",
            at
        )));
    }

    {
        let mut meta = container
            .meta
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match &mut *meta {
            Some(existing) if existing.owner != *owner => {
                return Err(ReplicantError::OwnershipViolation {
                    path: at.to_string(),
                    owner: existing.owner.to_string(),
                });
            }
            Some(existing) => existing.path = at.to_string(),
            None => {
                *meta = Some(NodeMeta {
                    owner: owner.clone(),
                    path: at.to_string(),
                });
            }
        }
    }

    let children: Vec<(String, Wrapped)> = {
        let data = container
            .data
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match &*data {
            ContainerData::Object(map) => map
                .iter()
                .map(|(k, v)| (path::join(at, k), v.clone()))
                .collect(),
            ContainerData::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| (path::join(at, &i.to_string()), v.clone()))
                .collect(),
        }
    };
    for (child_path, child) in children {
        wrap_inner(&child, owner, &child_path, visited)?;
    }
    Ok(())
}

/// Resolve a segment path to a node in the tree.
pub fn resolve(root: &Wrapped, segments: &[String]) -> Option<Wrapped> {
    let mut current = root.clone();
    for segment in segments {
        let container = current.as_container()?.clone();
        current = container.get_member(segment)?;
    }
    Some(current)
}

/// Total order over JSON values for the comparator-less `sort` mutator:
/// rank by type (null < bool < number < string < array < object), then
/// by value.
pub fn value_cmp(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (ix, iy) in x.iter().zip(y.iter()) {
                let ord = value_cmp(ix, iy);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((kx, vx), (ky, vy)) in x.iter().zip(y.iter()) {
                let ord = kx.cmp(ky).then_with(|| value_cmp(vx, vy));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ident(name: &str) -> ReplicantIdent {
        ReplicantIdent::new("test", name)
    }

    #[test]
    fn test_round_trip() {
        let value = json!({ "items": [1, 2, { "deep": true }], "label": "x" });
        let wrapped = Wrapped::from_value(&value);
        assert_eq!(wrapped.to_value(), value);
    }

    #[test]
    fn test_wrap_attaches_metadata_with_escaped_paths() {
        let value = json!({ "a/b": { "leaf": 1 }, "items": [[]] });
        let wrapped = Wrapped::from_value(&value);
        wrap_recursive(&wrapped, &ident("r"), "/").unwrap();

        let nested = resolve(&wrapped, &["a/b".to_string()]).unwrap();
        let meta = nested.as_container().unwrap().meta().unwrap();
        assert_eq!(meta.path, "/a~1b");
        assert_eq!(meta.owner, ident("r"));

        let inner = resolve(&wrapped, &["items".to_string(), "0".to_string()]).unwrap();
        assert_eq!(inner.as_container().unwrap().meta().unwrap().path, "/items/0");
    }

    #[test]
    fn test_second_owner_is_rejected() {
        let wrapped = Wrapped::from_value(&json!({ "child": {} }));
        wrap_recursive(&wrapped, &ident("first"), "/").unwrap();

        let err = wrap_recursive(&wrapped, &ident("second"), "/").unwrap_err();
        match err {
            ReplicantError::OwnershipViolation { owner, .. } => {
                assert_eq!(owner, "test/first");
            }
            other => panic!("expected ownership violation, got {:?}", other),
        }
    }

    #[test]
    fn test_revisit_refreshes_path() {
        let wrapped = Wrapped::from_value(&json!({ "child": {} }));
        wrap_recursive(&wrapped, &ident("r"), "/").unwrap();

        let child = resolve(&wrapped, &["child".to_string()]).unwrap();
        let root = wrapped.as_container().unwrap();
        root.set_member("moved", child.clone()).unwrap();
        root.remove_member("child");
        wrap_recursive(&wrapped, &ident("r"), "/").unwrap();

        assert_eq!(child.as_container().unwrap().meta().unwrap().path, "/moved");
    }

    #[test]
    fn test_contains_detects_subtree() {
        let wrapped = Wrapped::from_value(&json!({ "a": { "b": {} } }));
        let root = wrapped.as_container().unwrap();
        let a = resolve(&wrapped, &["a".to_string()]).unwrap();
        let b = resolve(&wrapped, &["a".to_string(), "b".to_string()]).unwrap();

        assert!(root.contains(a.as_container().unwrap()));
        assert!(a.as_container().unwrap().contains(b.as_container().unwrap()));
        assert!(!b.as_container().unwrap().contains(root));
    }

    #[test]
    fn test_array_mutators() {
        let wrapped = Wrapped::from_value(&json!([1, 2, 3]));
        let arr = wrapped.as_container().unwrap();

        assert_eq!(arr.array_mutate(OpMethod::Push, &[json!(4)]).unwrap(), Some(json!(4)));
        assert_eq!(arr.array_mutate(OpMethod::Pop, &[]).unwrap(), Some(json!(4)));
        assert_eq!(arr.array_mutate(OpMethod::Shift, &[]).unwrap(), Some(json!(1)));
        assert_eq!(arr.array_mutate(OpMethod::Unshift, &[json!(0), json!(1)]).unwrap(), Some(json!(4)));
        assert_eq!(wrapped.to_value(), json!([0, 1, 2, 3]));

        let removed = arr
            .array_mutate(OpMethod::Splice, &[json!(1), json!(2), json!(9)])
            .unwrap();
        assert_eq!(removed, Some(json!([1, 2])));
        assert_eq!(wrapped.to_value(), json!([0, 9, 3]));

        arr.array_mutate(OpMethod::Reverse, &[]).unwrap();
        assert_eq!(wrapped.to_value(), json!([3, 9, 0]));
        arr.array_mutate(OpMethod::Sort, &[]).unwrap();
        assert_eq!(wrapped.to_value(), json!([0, 3, 9]));

        let empty = Wrapped::from_value(&json!([]));
        assert_eq!(empty.as_container().unwrap().array_mutate(OpMethod::Pop, &[]).unwrap(), None);
    }

    #[test]
    fn test_value_cmp_orders_by_type_then_value() {
        let mut values = vec![json!("b"), json!(2), json!(null), json!(true), json!(1), json!("a")];
        values.sort_by(value_cmp);
        assert_eq!(
            values,
            vec![json!(null), json!(true), json!(1), json!(2), json!("a"), json!("b")]
        );
    }
}
