//! Maps a service's result tree back onto the overall schema.
//!
//! This undoes what [`QueryTransformer`](crate::query_transformer::QueryTransformer) did to the
//! query: renamed fields and types get their overall names back, artificial aliases disappear,
//! hydration source values become placeholders and removed fields reappear as `null` with their
//! error. Rename counts are tallied along the way.
use indexmap::IndexMap;
use serde_json::{Value as JsonValue, json};

use crate::error::{GatewayError, GraphQLError};
use crate::federation_gateway::ExecutionContext;
use crate::normalized_query::{NormalizedField, NormalizedFieldId};
use crate::query_ast::{FieldId, Selection};
use crate::query_transformer::{AppliedTransformation, QueryTransformationResult};
use crate::result_tree::{
    ExecutionResultNode, HydrationInput, NodeHeader, NodeKind, ResultPath,
};
use crate::schema_registry::Service;
use crate::transformations::HydrationDefinition;
use std::sync::Arc;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultCounters {
    pub service_node_counts: IndexMap<String, usize>,
    pub field_rename_count: usize,
    pub type_rename_count: usize,
}

impl ResultCounters {
    pub fn count_service_nodes(&mut self, service: &str, count: usize) {
        *self
            .service_node_counts
            .entry(service.to_string())
            .or_default() += count;
    }

    pub fn merge(&mut self, other: ResultCounters) {
        for (service, count) in other.service_node_counts {
            self.count_service_nodes(&service, count);
        }
        self.field_rename_count += other.field_rename_count;
        self.type_rename_count += other.type_rename_count;
    }

    /// The `resultComplexity` response extension.
    pub fn to_extension(&self) -> JsonValue {
        json!({
            "serviceNodeCounts": self.service_node_counts,
            "totalFieldRenameCount": self.field_rename_count,
            "totalTypeRenameCount": self.type_rename_count,
        })
    }
}

struct HydrationSource {
    definition: Arc<HydrationDefinition>,
    argument: String,
    value: JsonValue,
    selection_set: Vec<Selection>,
    errors: Vec<GraphQLError>,
}

pub struct ResultTransformer<'a> {
    ctx: &'a ExecutionContext,
    service: &'a Service,
    transformation: &'a QueryTransformationResult,
    counters: ResultCounters,
}

impl<'a> ResultTransformer<'a> {
    pub fn new(
        ctx: &'a ExecutionContext,
        service: &'a Service,
        transformation: &'a QueryTransformationResult,
    ) -> Self {
        ResultTransformer {
            ctx,
            service,
            transformation,
            counters: ResultCounters::default(),
        }
    }

    pub fn into_counters(self) -> ResultCounters {
        self.counters
    }

    /// Reassembles the result of a top-level dispatch.
    pub fn unapply_root(
        &mut self,
        root: ExecutionResultNode,
    ) -> Result<ExecutionResultNode, GatewayError> {
        let (header, children, extensions) = split_root(root)?;
        let root_type = self.ctx.root_type_name();
        let mut children = self.map_children(children, None, root_type, &ResultPath::root())?;
        self.fill_missing_top_level(&mut children, root_type);
        Ok(ExecutionResultNode {
            header: NodeHeader::root(root_type).with_errors(header.errors),
            kind: NodeKind::Root {
                children,
                extensions,
            },
        })
    }

    /// Builds the overall tree directly when nothing was transformed.
    pub fn passthrough(
        &mut self,
        root: ExecutionResultNode,
    ) -> Result<ExecutionResultNode, GatewayError> {
        let (header, children, extensions) = split_root(root)?;
        let root_type = self.ctx.root_type_name();
        let mut mapped = Vec::with_capacity(children.len());
        for child in children {
            let field = self.normalized_field(&child.header.field_ids, None, root_type)?;
            mapped.push(self.passthrough_value(child, field)?);
        }
        self.fill_missing_top_level(&mut mapped, root_type);
        Ok(ExecutionResultNode {
            header: NodeHeader::root(root_type).with_errors(header.errors),
            kind: NodeKind::Root {
                children: mapped,
                extensions,
            },
        })
    }

    /// Reassembles the result of a hydration call in place of the placeholder it resolves.
    ///
    /// `header` is the placeholder's own header, so the subtree lands on the logical parent path
    /// instead of under the synthetic backing field.
    pub fn unapply_hydrated(
        &mut self,
        root: ExecutionResultNode,
        field: &'a NormalizedField,
        header: NodeHeader,
    ) -> Result<ExecutionResultNode, GatewayError> {
        let (root_header, children, _) = split_root(root)?;
        let mut errors = root_header.errors;
        let mut node = match children.into_iter().next() {
            Some(mut backing) => {
                errors.append(&mut backing.header.errors);
                self.map_value(backing, field, header)?
            }
            None => ExecutionResultNode::null(header),
        };
        node.header.errors.extend(errors);
        Ok(node)
    }

    /// Maps one underlying value onto the overall field it answers.
    pub fn map_value(
        &mut self,
        node: ExecutionResultNode,
        field: &'a NormalizedField,
        header: NodeHeader,
    ) -> Result<ExecutionResultNode, GatewayError> {
        match node.kind {
            NodeKind::Leaf { value } => {
                let value = match value {
                    JsonValue::String(name) if field.is_typename() => {
                        JsonValue::String(self.overall_type(&name))
                    }
                    value => value,
                };
                Ok(ExecutionResultNode::leaf(header, value))
            }
            NodeKind::Object {
                resolved_type,
                children,
            } => {
                let overall_type = self.overall_type(&resolved_type);
                if overall_type != resolved_type {
                    self.counters.type_rename_count += 1;
                }
                let children =
                    self.map_children(children, Some(field.id), &overall_type, &header.path)?;
                Ok(ExecutionResultNode::object(header, overall_type, children))
            }
            NodeKind::List { children } => {
                let mut elements = Vec::with_capacity(children.len());
                for (index, mut element) in children.into_iter().enumerate() {
                    let errors = std::mem::take(&mut element.header.errors);
                    let element_header = header.element(index).with_errors(errors);
                    elements.push(self.map_value(element, field, element_header)?);
                }
                Ok(ExecutionResultNode::list(header, elements))
            }
            NodeKind::Root { .. } | NodeKind::Hydration(_) => Err(GatewayError::SchemaMismatch(
                format!("unexpected node at {} in service result", node.header.path),
            )),
        }
    }

    fn map_children(
        &mut self,
        children: Vec<ExecutionResultNode>,
        parent: Option<NormalizedFieldId>,
        object_type: &str,
        path: &ResultPath,
    ) -> Result<Vec<ExecutionResultNode>, GatewayError> {
        let mut mapped: Vec<(usize, ExecutionResultNode)> = Vec::with_capacity(children.len());
        let mut hydrations: IndexMap<NormalizedFieldId, Vec<HydrationSource>> = IndexMap::new();

        for mut child in children {
            if self.is_artificial(&child.header.result_key) {
                continue;
            }
            let errors = std::mem::take(&mut child.header.errors);
            match self.applied(&child.header.field_ids) {
                None => {
                    let field = self.normalized_field(&child.header.field_ids, parent, object_type)?;
                    let header = NodeHeader::for_field(field, path.with_key(&field.result_key))
                        .with_errors(errors);
                    mapped.push((field.position, self.map_value(child, field, header)?));
                }
                Some(AppliedTransformation::Rename { rename }) => {
                    let field = self.normalized_field(&child.header.field_ids, parent, object_type)?;
                    self.counters.field_rename_count += 1;
                    let header = NodeHeader::for_field(field, path.with_key(&field.result_key))
                        .with_errors(errors);
                    let node = match descend(child, &rename.underlying_path[1..]) {
                        Some(inner) => self.map_value(inner, field, header)?,
                        None => ExecutionResultNode::null(header),
                    };
                    mapped.push((field.position, node));
                }
                Some(AppliedTransformation::Hydration {
                    definition,
                    original_field,
                    argument,
                    source_path,
                    ..
                }) => {
                    let field = self.normalized_field(&[*original_field], parent, object_type)?;
                    hydrations.entry(field.id).or_default().push(HydrationSource {
                        definition: definition.clone(),
                        argument: argument.clone(),
                        value: extract(&child, &source_path[1..]),
                        selection_set: self.hydrated_selection(&child.header.field_ids),
                        errors,
                    });
                }
            }
        }

        for (id, sources) in hydrations {
            let field = self.ctx.normalized.get(id);
            let header = NodeHeader::for_field(field, path.with_key(&field.result_key));
            mapped.push((field.position, placeholder(field, header, sources)));
        }

        for removed in self.transformation.removed.under(parent) {
            let field = self.ctx.normalized.get(removed.field);
            if field.object_type != object_type
                || mapped
                    .iter()
                    .any(|(_, node)| node.header.result_key == field.result_key)
            {
                continue;
            }
            let field_path = path.with_key(&field.result_key);
            let mut header = NodeHeader::for_field(field, field_path.clone());
            if field_path.is_first_occurrence() {
                header.errors.push(removed.error.clone().with_path(field_path));
            }
            mapped.push((field.position, ExecutionResultNode::null(header)));
        }

        mapped.sort_by_key(|(position, _)| *position);
        Ok(mapped.into_iter().map(|(_, node)| node).collect())
    }

    fn passthrough_value(
        &mut self,
        node: ExecutionResultNode,
        field: &'a NormalizedField,
    ) -> Result<ExecutionResultNode, GatewayError> {
        let ExecutionResultNode { header, kind } = node;
        let header = NodeHeader::for_field(field, header.path).with_errors(header.errors);
        match kind {
            NodeKind::Object {
                resolved_type,
                children,
            } => {
                let mut mapped = Vec::with_capacity(children.len());
                for child in children {
                    let child_field =
                        self.normalized_field(&child.header.field_ids, Some(field.id), &resolved_type)?;
                    mapped.push(self.passthrough_value(child, child_field)?);
                }
                Ok(ExecutionResultNode::object(header, resolved_type, mapped))
            }
            NodeKind::List { children } => {
                let mut elements = Vec::with_capacity(children.len());
                for element in children {
                    elements.push(self.passthrough_value(element, field)?);
                }
                Ok(ExecutionResultNode::list(header, elements))
            }
            kind => Ok(ExecutionResultNode { header, kind }),
        }
    }

    /// Top-level fields the service did not answer at all read as `null`.
    fn fill_missing_top_level(&self, children: &mut Vec<ExecutionResultNode>, root_type: &str) {
        let ctx = self.ctx;
        for transformed in &self.transformation.transformed_fields {
            let Some(field) = ctx.normalized.find(&[transformed.id], None, root_type) else {
                continue;
            };
            if !children
                .iter()
                .any(|child| child.header.result_key == field.result_key)
            {
                let header = NodeHeader::for_field(field, ResultPath::root().with_key(&field.result_key));
                children.push(ExecutionResultNode::null(header));
            }
        }
        children.sort_by_key(|child| {
            ctx.normalized
                .find_child(None, root_type, &child.header.result_key)
                .map_or(usize::MAX, |field| field.position)
        });
    }

    fn is_artificial(&self, result_key: &str) -> bool {
        result_key == self.ctx.hint_alias || result_key == self.ctx.object_identifier_alias
    }

    fn applied(&self, field_ids: &[FieldId]) -> Option<&'a AppliedTransformation> {
        let transformations = &self.transformation.state.field_transformations;
        field_ids.iter().find_map(|id| transformations.get(id))
    }

    /// Every occurrence of a hydrated field contributes its own selection.
    fn hydrated_selection(&self, field_ids: &[FieldId]) -> Vec<Selection> {
        let transformations = &self.transformation.state.field_transformations;
        field_ids
            .iter()
            .filter_map(|id| match transformations.get(id) {
                Some(AppliedTransformation::Hydration { selection_set, .. }) => {
                    Some(selection_set.iter().cloned())
                }
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn normalized_field(
        &self,
        field_ids: &[FieldId],
        parent: Option<NormalizedFieldId>,
        object_type: &str,
    ) -> Result<&'a NormalizedField, GatewayError> {
        let ctx = self.ctx;
        ctx.normalized
            .find(field_ids, parent, object_type)
            .ok_or_else(|| {
                GatewayError::SchemaMismatch(format!(
                    "service '{}' returned a field on '{object_type}' the query did not select",
                    self.service.name
                ))
            })
    }

    fn overall_type(&self, underlying: &str) -> String {
        match self.transformation.state.type_renames.get(underlying) {
            Some(overall) => overall.clone(),
            None => self
                .ctx
                .schema
                .transformations
                .overall_type_name(&self.service.name, underlying)
                .to_string(),
        }
    }
}

fn split_root(
    root: ExecutionResultNode,
) -> Result<(NodeHeader, Vec<ExecutionResultNode>, crate::query_ast::JsonMap), GatewayError> {
    match root.kind {
        NodeKind::Root {
            children,
            extensions,
        } => Ok((root.header, children, extensions)),
        _ => Err(GatewayError::SchemaMismatch(
            "service result has no root".to_string(),
        )),
    }
}

/// Follows the inner segments of a renamed path; `None` once a value is missing or null.
fn descend(mut node: ExecutionResultNode, path: &[String]) -> Option<ExecutionResultNode> {
    for segment in path {
        let NodeKind::Object { children, .. } = node.kind else {
            return None;
        };
        node = children
            .into_iter()
            .find(|child| child.header.result_key == *segment)?;
    }
    Some(node)
}

/// Reads a hydration source value below the aliased outer source field.
fn extract(node: &ExecutionResultNode, path: &[String]) -> JsonValue {
    match (&node.kind, path.split_first()) {
        (_, None) => node.to_data(),
        (NodeKind::Object { children, .. }, Some((segment, rest))) => children
            .iter()
            .find(|child| child.header.result_key == *segment)
            .map_or(JsonValue::Null, |child| extract(child, rest)),
        (NodeKind::List { children }, Some(_)) => {
            JsonValue::Array(children.iter().map(|child| extract(child, path)).collect())
        }
        _ => JsonValue::Null,
    }
}

fn placeholder(
    field: &NormalizedField,
    mut header: NodeHeader,
    mut sources: Vec<HydrationSource>,
) -> ExecutionResultNode {
    let Some(first) = sources.first() else {
        return ExecutionResultNode::null(header);
    };
    let definition = first.definition.clone();
    let mut selection_set = Vec::new();
    for source in &mut sources {
        header.errors.append(&mut source.errors);
        selection_set.append(&mut source.selection_set);
    }

    let join_value = if sources.len() == 1 {
        sources.swap_remove(0).value
    } else {
        merge_join_values(sources)
    };

    ExecutionResultNode {
        header,
        kind: NodeKind::Hydration(Box::new(HydrationInput {
            definition,
            normalized_field: field.id,
            join_value,
            selection_set,
        })),
    }
}

/// Combines several source arguments into objects keyed by argument name, index-aligned for lists.
fn merge_join_values(sources: Vec<HydrationSource>) -> JsonValue {
    if sources.iter().all(|source| source.value.is_array()) {
        let len = sources
            .iter()
            .filter_map(|source| source.value.as_array().map(Vec::len))
            .max()
            .unwrap_or_default();
        let elements = (0..len)
            .map(|index| {
                let object = sources
                    .iter()
                    .map(|source| {
                        let value = source.value.get(index).cloned().unwrap_or(JsonValue::Null);
                        (source.argument.clone(), value)
                    })
                    .collect();
                JsonValue::Object(object)
            })
            .collect();
        return JsonValue::Array(elements);
    }
    JsonValue::Object(
        sources
            .into_iter()
            .map(|source| (source.argument, source.value))
            .collect(),
    )
}
