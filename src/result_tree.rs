//! Result tree shared by the executor, the reassembler and the hydration resolver.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{GatewayError, GraphQLError};
use crate::normalized_query::{NormalizedField, NormalizedFieldId};
use crate::query_ast::{FieldId, JsonMap, Selection, Type};
use crate::transformations::HydrationDefinition;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(index) => write!(f, "{index}"),
            PathSegment::Key(key) => write!(f, "{key}"),
        }
    }
}

/// Position of a value in a response, serialized as GraphQL's `path` array.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultPath(Vec<PathSegment>);

impl ResultPath {
    pub fn root() -> Self {
        ResultPath::default()
    }

    pub fn with_key(&self, key: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Key(key.into()));
        ResultPath(segments)
    }

    pub fn with_index(&self, index: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Index(index));
        ResultPath(segments)
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn last(&self) -> Option<&PathSegment> {
        self.0.last()
    }

    pub fn last_key(&self) -> Option<&str> {
        match self.0.last()? {
            PathSegment::Key(key) => Some(key),
            PathSegment::Index(_) => None,
        }
    }

    /// Drops the first `skip` segments and re-roots the rest under `onto`.
    pub fn rebased(&self, skip: usize, onto: &ResultPath) -> ResultPath {
        let mut segments = onto.0.clone();
        segments.extend(self.0.iter().skip(skip).cloned());
        ResultPath(segments)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every list index along the path is 0.
    pub fn is_first_occurrence(&self) -> bool {
        self.0
            .iter()
            .all(|segment| !matches!(segment, PathSegment::Index(index) if *index != 0))
    }
}

impl fmt::Display for ResultPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let segments: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "/{}", segments.join("/"))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldInfo {
    pub name: String,
    pub field_type: Type,
}

/// Attributes shared by every node kind.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeHeader {
    pub path: ResultPath,
    pub field_ids: Vec<FieldId>,
    pub result_key: String,
    pub alias: Option<String>,
    /// Object type the field was selected on.
    pub object_type: String,
    /// `None` for the root.
    pub field: Option<FieldInfo>,
    pub errors: Vec<GraphQLError>,
}

impl NodeHeader {
    pub fn root(root_type: &str) -> Self {
        NodeHeader {
            path: ResultPath::root(),
            field_ids: Vec::new(),
            result_key: String::new(),
            alias: None,
            object_type: root_type.to_string(),
            field: None,
            errors: Vec::new(),
        }
    }

    pub fn for_field(field: &NormalizedField, path: ResultPath) -> Self {
        NodeHeader {
            path,
            field_ids: field.field_ids.clone(),
            result_key: field.result_key.clone(),
            alias: field.alias.clone(),
            object_type: field.object_type.clone(),
            field: Some(FieldInfo {
                name: field.field_name.clone(),
                field_type: field.field_type.clone(),
            }),
            errors: Vec::new(),
        }
    }

    /// Header for a list element: same field, path extended by the index.
    pub fn element(&self, index: usize) -> Self {
        NodeHeader {
            path: self.path.with_index(index),
            errors: Vec::new(),
            ..self.clone()
        }
    }

    pub fn with_errors(mut self, errors: Vec<GraphQLError>) -> Self {
        self.errors = errors;
        self
    }
}

/// Everything needed to resolve a hydration placeholder later.
#[derive(Clone, Debug, PartialEq)]
pub struct HydrationInput {
    pub definition: Arc<HydrationDefinition>,
    pub normalized_field: NormalizedFieldId,
    /// Value of the `$source` argument(s). Several source arguments are merged into an object.
    pub join_value: JsonValue,
    /// Original selection of the hydrated field, reused against the target service.
    pub selection_set: Vec<Selection>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    Root {
        children: Vec<ExecutionResultNode>,
        extensions: JsonMap,
    },
    Object {
        resolved_type: String,
        children: Vec<ExecutionResultNode>,
    },
    List {
        children: Vec<ExecutionResultNode>,
    },
    Leaf {
        value: JsonValue,
    },
    Hydration(Box<HydrationInput>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionResultNode {
    pub header: NodeHeader,
    pub kind: NodeKind,
}

impl ExecutionResultNode {
    pub fn root(root_type: &str, children: Vec<ExecutionResultNode>) -> Self {
        ExecutionResultNode {
            header: NodeHeader::root(root_type),
            kind: NodeKind::Root {
                children,
                extensions: JsonMap::new(),
            },
        }
    }

    pub fn leaf(header: NodeHeader, value: JsonValue) -> Self {
        ExecutionResultNode {
            header,
            kind: NodeKind::Leaf { value },
        }
    }

    pub fn null(header: NodeHeader) -> Self {
        ExecutionResultNode::leaf(header, JsonValue::Null)
    }

    pub fn object(header: NodeHeader, resolved_type: String, children: Vec<Self>) -> Self {
        ExecutionResultNode {
            header,
            kind: NodeKind::Object {
                resolved_type,
                children,
            },
        }
    }

    pub fn list(header: NodeHeader, children: Vec<Self>) -> Self {
        ExecutionResultNode {
            header,
            kind: NodeKind::List { children },
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(&self.kind, NodeKind::Leaf { value } if value.is_null())
    }

    pub fn children(&self) -> &[ExecutionResultNode] {
        match &self.kind {
            NodeKind::Root { children, .. }
            | NodeKind::Object { children, .. }
            | NodeKind::List { children } => children,
            NodeKind::Leaf { .. } | NodeKind::Hydration(_) => &[],
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<ExecutionResultNode>> {
        match &mut self.kind {
            NodeKind::Root { children, .. }
            | NodeKind::Object { children, .. }
            | NodeKind::List { children } => Some(children),
            NodeKind::Leaf { .. } | NodeKind::Hydration(_) => None,
        }
    }

    pub fn into_children(self) -> Vec<ExecutionResultNode> {
        match self.kind {
            NodeKind::Root { children, .. }
            | NodeKind::Object { children, .. }
            | NodeKind::List { children } => children,
            NodeKind::Leaf { .. } | NodeKind::Hydration(_) => Vec::new(),
        }
    }

    pub fn extensions_mut(&mut self) -> Option<&mut JsonMap> {
        match &mut self.kind {
            NodeKind::Root { extensions, .. } => Some(extensions),
            _ => None,
        }
    }

    /// Number of nodes below and including this one, the root excluded.
    pub fn count_nodes(&self) -> usize {
        let own = usize::from(!matches!(self.kind, NodeKind::Root { .. }));
        own + self.children().iter().map(Self::count_nodes).sum::<usize>()
    }

    /// Depth-first collection of every attached error.
    pub fn collect_errors(&self, out: &mut Vec<GraphQLError>) {
        out.extend(self.header.errors.iter().cloned());
        for child in self.children() {
            child.collect_errors(out);
        }
    }

    pub fn to_data(&self) -> JsonValue {
        match &self.kind {
            NodeKind::Root { children, .. } | NodeKind::Object { children, .. } => {
                let mut object = JsonMap::new();
                for child in children {
                    object.insert(child.header.result_key.clone(), child.to_data());
                }
                JsonValue::Object(object)
            }
            NodeKind::List { children } => {
                JsonValue::Array(children.iter().map(Self::to_data).collect())
            }
            NodeKind::Leaf { value } => value.clone(),
            NodeKind::Hydration(_) => JsonValue::Null,
        }
    }

    /// Every hydration placeholder left in the tree, in depth-first order.
    pub fn placeholders(&self) -> Vec<(&NodeHeader, &HydrationInput)> {
        let mut found = Vec::new();
        self.collect_placeholders(&mut found);
        found
    }

    fn collect_placeholders<'a>(&'a self, found: &mut Vec<(&'a NodeHeader, &'a HydrationInput)>) {
        match &self.kind {
            NodeKind::Hydration(input) => found.push((&self.header, input)),
            _ => {
                for child in self.children() {
                    child.collect_placeholders(found);
                }
            }
        }
    }

    /// Splices resolved subtrees in place of the placeholders at their paths.
    pub fn replace_placeholders(
        mut self,
        replacements: &mut HashMap<ResultPath, ExecutionResultNode>,
    ) -> ExecutionResultNode {
        if matches!(self.kind, NodeKind::Hydration(_)) {
            return match replacements.remove(&self.header.path) {
                Some(mut replacement) => {
                    let mut errors = std::mem::take(&mut self.header.errors);
                    errors.append(&mut replacement.header.errors);
                    replacement.header.errors = errors;
                    replacement
                }
                None => self,
            };
        }
        if let Some(children) = self.children_mut() {
            let taken = std::mem::take(children);
            *children = taken
                .into_iter()
                .map(|child| child.replace_placeholders(replacements))
                .collect();
        }
        self
    }
}

/// Concatenates several root trees and combines children that share a result key.
pub fn merge_trees(trees: Vec<ExecutionResultNode>) -> Result<ExecutionResultNode, GatewayError> {
    let mut root_type = None;
    let mut errors = Vec::new();
    let mut children = Vec::new();
    let mut extensions = JsonMap::new();

    for tree in trees {
        let ExecutionResultNode { header, kind } = tree;
        let NodeKind::Root {
            children: tree_children,
            extensions: tree_extensions,
        } = kind
        else {
            return Err(GatewayError::MergeConflict(header.result_key));
        };
        root_type.get_or_insert(header.object_type);
        errors.extend(header.errors);
        children.extend(tree_children);
        extensions.extend(tree_extensions);
    }

    let root_type = root_type.unwrap_or_else(|| "Query".to_string());
    Ok(ExecutionResultNode {
        header: NodeHeader::root(&root_type).with_errors(errors),
        kind: NodeKind::Root {
            children: combine_duplicates(children)?,
            extensions,
        },
    })
}

fn combine_duplicates(
    children: Vec<ExecutionResultNode>,
) -> Result<Vec<ExecutionResultNode>, GatewayError> {
    let mut by_key: IndexMap<String, ExecutionResultNode> = IndexMap::new();
    for child in children {
        match by_key.shift_remove_full(&child.header.result_key) {
            Some((index, key, existing)) => {
                let combined = combine(existing, child)?;
                by_key.shift_insert(index, key, combined);
            }
            None => {
                by_key.insert(child.header.result_key.clone(), child);
            }
        }
    }
    Ok(by_key.into_values().collect())
}

fn combine(
    mut left: ExecutionResultNode,
    mut right: ExecutionResultNode,
) -> Result<ExecutionResultNode, GatewayError> {
    if right.is_null() {
        left.header.errors.append(&mut right.header.errors);
        return Ok(left);
    }
    if left.is_null() {
        let mut errors = std::mem::take(&mut left.header.errors);
        errors.append(&mut right.header.errors);
        right.header.errors = errors;
        return Ok(right);
    }
    match (left.kind, right.kind) {
        (
            NodeKind::Object {
                resolved_type,
                children: mut left_children,
            },
            NodeKind::Object {
                children: right_children,
                ..
            },
        ) => {
            left_children.extend(right_children);
            left.header.errors.append(&mut right.header.errors);
            Ok(ExecutionResultNode::object(
                left.header,
                resolved_type,
                combine_duplicates(left_children)?,
            ))
        }
        _ => Err(GatewayError::MergeConflict(left.header.result_key)),
    }
}
