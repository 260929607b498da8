//! Inspection of tagged object graphs.
//!
//! Dynamic-language runtimes hand over heaps as a flat id-to-node table
//! rather than byte memory. [`inspect`] renders one node into a closed
//! view tree, carrying the visited set explicitly: a node reached through
//! its own descendants renders as [`ObjectView::Cycle`] instead of
//! recursing forever, while a node shared by two siblings renders twice,
//! because each recursion level clones the set before descending.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

pub type ObjectId = u64;

/// One node of a dynamic object graph. The set of shapes is closed; a
/// runtime bridging some other language maps its values onto these.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectNode {
    Module { name: String },
    Function { name: String },
    Str { value: String },
    Int { value: i64 },
    Bool { value: bool },
    List { items: Vec<ObjectId> },
    Tuple { items: Vec<ObjectId> },
    Dict { entries: Vec<(ObjectId, ObjectId)> },
    Object { class: String, attrs: Vec<(String, ObjectId)> },
    Iterator { flavor: String, inner: Option<ObjectId> },
}

/// A flat id-to-node table describing one heap instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectGraph {
    nodes: FxHashMap<ObjectId, ObjectNode>,
}

impl ObjectGraph {
    pub fn new() -> Self {
        ObjectGraph::default()
    }

    pub fn insert(&mut self, id: ObjectId, node: ObjectNode) {
        self.nodes.insert(id, node);
    }

    pub fn node(&self, id: ObjectId) -> Option<&ObjectNode> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Rendered form of one object, with cycles and danglers made explicit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectView {
    Module { name: String },
    Function { name: String },
    Str { value: String, previous: Option<String> },
    Int { value: i64, previous: Option<i64> },
    Bool { value: bool, previous: Option<bool> },
    List { items: Vec<ObjectView> },
    Tuple { items: Vec<ObjectView> },
    Dict { entries: Vec<(ObjectView, ObjectView)> },
    Object { class: String, attrs: Vec<(String, ObjectView)> },
    Iterator { flavor: String, inner: Option<Box<ObjectView>> },
    /// The node is an ancestor of itself; recursion stops here.
    Cycle { id: ObjectId },
    /// The id resolves to nothing in this graph.
    Missing { id: ObjectId },
}

/// Renders `id` out of `graph`. When `old` is given, leaf views carry the
/// value the same id held there, if it differed.
pub fn inspect(
    graph: &ObjectGraph,
    id: ObjectId,
    old: Option<&ObjectGraph>,
    visited: &FxHashSet<ObjectId>,
) -> ObjectView {
    if visited.contains(&id) {
        return ObjectView::Cycle { id };
    }
    let Some(node) = graph.node(id) else {
        return ObjectView::Missing { id };
    };

    match node {
        ObjectNode::Module { name } => ObjectView::Module { name: name.clone() },
        ObjectNode::Function { name } => ObjectView::Function { name: name.clone() },
        ObjectNode::Str { value } => ObjectView::Str {
            value: value.clone(),
            previous: match old.and_then(|g| g.node(id)) {
                Some(ObjectNode::Str { value: past }) if past != value => Some(past.clone()),
                _ => None,
            },
        },
        ObjectNode::Int { value } => ObjectView::Int {
            value: *value,
            previous: match old.and_then(|g| g.node(id)) {
                Some(ObjectNode::Int { value: past }) if past != value => Some(*past),
                _ => None,
            },
        },
        ObjectNode::Bool { value } => ObjectView::Bool {
            value: *value,
            previous: match old.and_then(|g| g.node(id)) {
                Some(ObjectNode::Bool { value: past }) if past != value => Some(*past),
                _ => None,
            },
        },
        ObjectNode::List { items } => ObjectView::List {
            items: inspect_children(graph, id, items, old, visited),
        },
        ObjectNode::Tuple { items } => ObjectView::Tuple {
            items: inspect_children(graph, id, items, old, visited),
        },
        ObjectNode::Dict { entries } => {
            let seen = descend(visited, id);
            ObjectView::Dict {
                entries: entries
                    .iter()
                    .map(|(k, v)| {
                        (
                            inspect(graph, *k, old, &seen),
                            inspect(graph, *v, old, &seen),
                        )
                    })
                    .collect(),
            }
        }
        ObjectNode::Object { class, attrs } => {
            let seen = descend(visited, id);
            ObjectView::Object {
                class: class.clone(),
                attrs: attrs
                    .iter()
                    .map(|(name, child)| (name.clone(), inspect(graph, *child, old, &seen)))
                    .collect(),
            }
        }
        ObjectNode::Iterator { flavor, inner } => {
            let seen = descend(visited, id);
            ObjectView::Iterator {
                flavor: flavor.clone(),
                inner: inner.map(|child| Box::new(inspect(graph, child, old, &seen))),
            }
        }
    }
}

/// Renders a root with an empty visited set and no old graph.
pub fn inspect_root(graph: &ObjectGraph, id: ObjectId) -> ObjectView {
    inspect(graph, id, None, &FxHashSet::default())
}

fn descend(visited: &FxHashSet<ObjectId>, id: ObjectId) -> FxHashSet<ObjectId> {
    let mut seen = visited.clone();
    seen.insert(id);
    seen
}

fn inspect_children(
    graph: &ObjectGraph,
    id: ObjectId,
    items: &[ObjectId],
    old: Option<&ObjectGraph>,
    visited: &FxHashSet<ObjectId>,
) -> Vec<ObjectView> {
    let seen = descend(visited, id);
    items
        .iter()
        .map(|child| inspect(graph, *child, old, &seen))
        .collect()
}
