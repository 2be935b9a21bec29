//! Resolves hydration placeholders with one more round of service calls.
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use tracing::{debug, trace};

use crate::error::{GatewayError, GraphQLError};
use crate::federation_gateway::ExecutionContext;
use crate::field_authorization::ForbiddenFields;
use crate::normalized_query::{NormalizedField, NormalizedFieldId};
use crate::query_ast::{Field, Selection, Value, json_to_value};
use crate::query_executor::ServiceExecutor;
use crate::query_transformer::{QueryTransformationResult, QueryTransformer, TopLevelField};
use crate::result_transformer::{ResultCounters, ResultTransformer};
use crate::result_tree::{
    ExecutionResultNode, HydrationInput, NodeHeader, NodeKind, PathSegment, ResultPath,
};
use crate::schema_registry::Service;
use crate::transformations::{ArgumentSource, HydrationDefinition};

pub type Replacements = HashMap<ResultPath, ExecutionResultNode>;

type Placeholder = (NodeHeader, HydrationInput);

/// One batched call and what it returned, keyed by object identifier.
struct BatchChunk {
    service: Arc<Service>,
    transformed: QueryTransformationResult,
    elements: HashMap<String, ExecutionResultNode>,
    /// Errors reported inside one returned element, by identifier, with element-relative paths.
    element_errors: HashMap<String, Vec<GraphQLError>>,
    errors: Vec<GraphQLError>,
    node_count: usize,
}

pub struct HydrationResolver<'a> {
    ctx: &'a ExecutionContext,
    forbidden: &'a ForbiddenFields,
}

impl<'a> HydrationResolver<'a> {
    pub fn new(ctx: &'a ExecutionContext, forbidden: &'a ForbiddenFields) -> Self {
        HydrationResolver { ctx, forbidden }
    }

    /// Resolves every placeholder, returning the subtrees to splice in by path.
    pub async fn resolve(
        &self,
        placeholders: Vec<Placeholder>,
    ) -> Result<(Replacements, ResultCounters), GatewayError> {
        let mut groups: IndexMap<(String, NormalizedFieldId), Vec<Placeholder>> = IndexMap::new();
        for (header, input) in placeholders {
            groups
                .entry((input.definition.name.clone(), input.normalized_field))
                .or_default()
                .push((header, input));
        }
        debug!(groups = groups.len(), "resolving hydration placeholders");

        let resolved = try_join_all(groups.into_values().map(|group| self.resolve_group(group))).await?;

        let mut replacements = Replacements::new();
        let mut counters = ResultCounters::default();
        for (nodes, group_counters) in resolved {
            counters.merge(group_counters);
            for node in nodes {
                replacements.insert(node.header.path.clone(), node);
            }
        }
        Ok((replacements, counters))
    }

    async fn resolve_group(
        &self,
        group: Vec<Placeholder>,
    ) -> Result<(Vec<ExecutionResultNode>, ResultCounters), GatewayError> {
        let Some((_, first)) = group.first() else {
            return Ok((Vec::new(), ResultCounters::default()));
        };
        let definition = first.definition.clone();
        if definition.is_batched() {
            return self.resolve_batch(&definition, group).await;
        }

        let resolved = try_join_all(
            group
                .into_iter()
                .map(|(header, input)| self.resolve_single(&definition, header, input)),
        )
        .await?;
        let mut counters = ResultCounters::default();
        let nodes = resolved
            .into_iter()
            .map(|(node, node_counters)| {
                counters.merge(node_counters);
                node
            })
            .collect();
        Ok((nodes, counters))
    }

    async fn resolve_single(
        &self,
        definition: &HydrationDefinition,
        header: NodeHeader,
        input: HydrationInput,
    ) -> Result<(ExecutionResultNode, ResultCounters), GatewayError> {
        let field = self.ctx.normalized.get(input.normalized_field);
        match input.join_value {
            JsonValue::Null => Ok((ExecutionResultNode::null(header), ResultCounters::default())),
            JsonValue::Array(items) if !definition.backing_field_is_list => {
                let calls = items.into_iter().enumerate().map(|(index, item)| {
                    let element = header.element(index);
                    let selection_set = &input.selection_set;
                    async move {
                        if item.is_null() {
                            return Ok((ExecutionResultNode::null(element), ResultCounters::default()));
                        }
                        self.call(definition, field, &item, selection_set, element).await
                    }
                });
                let resolved = try_join_all(calls).await?;
                let mut counters = ResultCounters::default();
                let elements = resolved
                    .into_iter()
                    .map(|(node, element_counters)| {
                        counters.merge(element_counters);
                        node
                    })
                    .collect();
                Ok((ExecutionResultNode::list(header, elements), counters))
            }
            join_value => {
                self.call(definition, field, &join_value, &input.selection_set, header)
                    .await
            }
        }
    }

    /// One call to the backing field for a single join value.
    async fn call(
        &self,
        definition: &HydrationDefinition,
        field: &'a NormalizedField,
        join_value: &JsonValue,
        selection_set: &[Selection],
        header: NodeHeader,
    ) -> Result<(ExecutionResultNode, ResultCounters), GatewayError> {
        let service = self.target_service(definition)?;
        let backing = self.backing_field(definition, field, join_value, selection_set);
        let transformed = QueryTransformer::new(self.ctx, service, self.forbidden)
            .transform(vec![TopLevelField::hydration(backing, field.id)])?;
        let mut root = self.execute(service, &transformed, &header.path).await?;
        root.header.errors = std::mem::take(&mut root.header.errors)
            .into_iter()
            .map(|error| error.rebased_from(&definition.backing_field, &header.path))
            .collect();

        let node_count = root.count_nodes();
        let mut transformer = ResultTransformer::new(self.ctx, service, &transformed);
        let node = transformer.unapply_hydrated(root, field, header)?;
        let mut counters = transformer.into_counters();
        counters.count_service_nodes(&service.name, node_count);
        Ok((node, counters))
    }

    async fn resolve_batch(
        &self,
        definition: &HydrationDefinition,
        group: Vec<Placeholder>,
    ) -> Result<(Vec<ExecutionResultNode>, ResultCounters), GatewayError> {
        let Some((first_header, first)) = group.first() else {
            return Ok((Vec::new(), ResultCounters::default()));
        };
        let field = self.ctx.normalized.get(first.normalized_field);
        let batch_size = definition
            .batch
            .as_ref()
            .and_then(|batch| batch.batch_size)
            .unwrap_or(usize::MAX)
            .max(1);

        let mut keys: IndexMap<String, JsonValue> = IndexMap::new();
        for (_, input) in &group {
            for value in join_values(&input.join_value) {
                if !value.is_null() {
                    keys.entry(join_key(value)).or_insert_with(|| value.clone());
                }
            }
        }
        let keys: Vec<JsonValue> = keys.into_values().collect();
        trace!(
            hydration = %definition.name,
            keys = keys.len(),
            batch_size,
            "batching hydration"
        );

        let chunks = try_join_all(keys.chunks(batch_size).map(|chunk| {
            self.call_batch(definition, field, chunk, &first.selection_set, &first_header.path)
        }))
        .await?;

        let mut counters = ResultCounters::default();
        let mut chunk_errors: Vec<GraphQLError> = Vec::new();
        let mut transformers = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            counters.count_service_nodes(&chunk.service.name, chunk.node_count);
            chunk_errors.extend(chunk.errors.iter().cloned());
            transformers.push(ResultTransformer::new(self.ctx, &chunk.service, &chunk.transformed));
        }

        let mut element_errors: HashMap<String, Vec<GraphQLError>> = chunks
            .iter()
            .flat_map(|chunk| chunk.element_errors.clone())
            .collect();
        let mut nodes = Vec::with_capacity(group.len());
        for (index, (header, input)) in group.into_iter().enumerate() {
            let mut node = match &input.join_value {
                JsonValue::Array(items) => {
                    let mut elements = Vec::with_capacity(items.len());
                    for (position, item) in items.iter().enumerate() {
                        let element = header.element(position);
                        let mut node = correlate(&chunks, &mut transformers, field, item, element)?;
                        attach_element_errors(&mut node, item, &mut element_errors);
                        elements.push(node);
                    }
                    ExecutionResultNode::list(header, elements)
                }
                item => {
                    let mut node = correlate(&chunks, &mut transformers, field, item, header)?;
                    attach_element_errors(&mut node, item, &mut element_errors);
                    node
                }
            };
            if index == 0 {
                node.header.errors.append(&mut chunk_errors);
            }
            nodes.push(node);
        }

        for transformer in transformers {
            counters.merge(transformer.into_counters());
        }
        Ok((nodes, counters))
    }

    async fn call_batch(
        &self,
        definition: &HydrationDefinition,
        field: &'a NormalizedField,
        keys: &[JsonValue],
        selection_set: &[Selection],
        path: &ResultPath,
    ) -> Result<BatchChunk, GatewayError> {
        let service = self.target_service(definition)?;
        let identified_by = definition
            .batch
            .as_ref()
            .map(|batch| batch.object_identifier.clone())
            .unwrap_or_else(|| "id".to_string());
        let identifier = Field::new(self.ctx.ids.next_id(), identified_by)
            .with_alias(self.ctx.object_identifier_alias.clone());
        let backing = self.backing_field(
            definition,
            field,
            &JsonValue::Array(keys.to_vec()),
            selection_set,
        );
        let transformed = QueryTransformer::new(self.ctx, service, self.forbidden).transform(vec![
            TopLevelField::hydration(backing, field.id).with_artificial_selection(identifier),
        ])?;
        let root = self.execute(service, &transformed, path).await?;

        let node_count = root.count_nodes();
        let ExecutionResultNode { header, kind } = root;
        let mut reported = header.errors;
        let mut elements = HashMap::new();
        let mut keys_by_index = HashMap::new();
        if let NodeKind::Root { children, .. } = kind {
            for mut backing in children {
                reported.append(&mut backing.header.errors);
                let NodeKind::List { children } = backing.kind else {
                    continue;
                };
                for (index, element) in children.into_iter().enumerate() {
                    if let Some(key) = identifier_of(&element, &self.ctx.object_identifier_alias) {
                        keys_by_index.insert(index, key.clone());
                        elements.insert(key, element);
                    }
                }
            }
        }

        let mut errors = Vec::new();
        let mut element_errors: HashMap<String, Vec<GraphQLError>> = HashMap::new();
        for error in reported {
            match element_key(&error, &definition.backing_field, &keys_by_index) {
                Some(key) => {
                    let relative = error
                        .path
                        .as_ref()
                        .map(|path| path.rebased(2, &ResultPath::root()))
                        .unwrap_or_default();
                    element_errors
                        .entry(key.clone())
                        .or_default()
                        .push(error.with_path(relative));
                }
                None => errors.push(error.rebased_from(&definition.backing_field, path)),
            }
        }
        debug!(
            service = %service.name,
            requested = keys.len(),
            returned = elements.len(),
            "batched hydration call"
        );

        Ok(BatchChunk {
            service: service.clone(),
            transformed,
            elements,
            element_errors,
            errors,
            node_count,
        })
    }

    fn target_service(&self, definition: &HydrationDefinition) -> Result<&'a Arc<Service>, GatewayError> {
        let ctx = self.ctx;
        ctx.schema.service(&definition.service).ok_or_else(|| {
            GatewayError::SchemaMismatch(format!(
                "hydration {} targets unknown service '{}'",
                definition.name, definition.service
            ))
        })
    }

    /// The synthetic top-level field sent to the target service.
    fn backing_field(
        &self,
        definition: &HydrationDefinition,
        field: &NormalizedField,
        join_value: &JsonValue,
        selection_set: &[Selection],
    ) -> Field {
        let several_sources = definition.source_arguments().count() > 1;
        let mut arguments: Vec<(String, Value)> = Vec::with_capacity(definition.arguments.len());
        for argument in &definition.arguments {
            let value = match &argument.source {
                ArgumentSource::ObjectField(_) if several_sources => {
                    join_value.get(&argument.name).cloned().unwrap_or(JsonValue::Null)
                }
                ArgumentSource::ObjectField(_) => join_value.clone(),
                ArgumentSource::FieldArgument(name) => match field.arguments.get(name) {
                    Some(value) => value.clone(),
                    None => continue,
                },
            };
            arguments.push((argument.name.clone(), json_to_value(&value)));
        }

        let mut backing = Field::new(self.ctx.ids.next_id(), definition.backing_field.clone())
            .with_selection(selection_set.to_vec());
        backing.arguments = arguments;
        backing
    }

    async fn execute(
        &self,
        service: &Service,
        transformed: &QueryTransformationResult,
        path: &ResultPath,
    ) -> Result<ExecutionResultNode, GatewayError> {
        let service_context = self
            .ctx
            .hooks
            .service_context_factory
            .create_service_context(service, &self.ctx.caller_context)
            .await
            .map_err(|reason| GatewayError::ServiceContext {
                service: service.name.clone(),
                reason,
            })?;
        ServiceExecutor::new(self.ctx)
            .execute(service, transformed, service_context, path)
            .await
    }
}

/// Splices the batched element whose identifier equals the join key; a miss reads as `null`.
fn correlate<'a>(
    chunks: &[BatchChunk],
    transformers: &mut [ResultTransformer<'a>],
    field: &'a NormalizedField,
    join_value: &JsonValue,
    header: NodeHeader,
) -> Result<ExecutionResultNode, GatewayError> {
    if join_value.is_null() {
        return Ok(ExecutionResultNode::null(header));
    }
    let key = join_key(join_value);
    for (chunk, transformer) in chunks.iter().zip(transformers.iter_mut()) {
        if let Some(element) = chunk.elements.get(&key) {
            return transformer.map_value(element.clone(), field, header);
        }
    }
    Ok(ExecutionResultNode::null(header))
}

/// The identifier of the returned element a `[backing, index, ..]` error path points into.
fn element_key<'k>(
    error: &GraphQLError,
    backing_field: &str,
    keys_by_index: &'k HashMap<usize, String>,
) -> Option<&'k String> {
    match error.path.as_ref()?.segments() {
        [PathSegment::Key(key), PathSegment::Index(index), ..] if key == backing_field => {
            keys_by_index.get(index)
        }
        _ => None,
    }
}

/// Element errors are reported once, on the first placeholder position holding the identifier.
fn attach_element_errors(
    node: &mut ExecutionResultNode,
    join_value: &JsonValue,
    element_errors: &mut HashMap<String, Vec<GraphQLError>>,
) {
    if join_value.is_null() {
        return;
    }
    let Some(errors) = element_errors.remove(&join_key(join_value)) else {
        return;
    };
    let path = node.header.path.clone();
    node.header.errors.extend(errors.into_iter().map(|error| {
        let relative = error.path.clone().unwrap_or_default();
        error.with_path(relative.rebased(0, &path))
    }));
}

fn join_values(value: &JsonValue) -> Vec<&JsonValue> {
    match value {
        JsonValue::Array(items) => items.iter().collect(),
        value => vec![value],
    }
}

/// Identifiers compare by their text so `1` and `"1"` correlate.
fn join_key(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        value => value.to_string(),
    }
}

fn identifier_of(element: &ExecutionResultNode, alias: &str) -> Option<String> {
    let NodeKind::Object { children, .. } = &element.kind else {
        return None;
    };
    children
        .iter()
        .find(|child| child.header.result_key == alias)
        .map(|child| child.to_data())
        .filter(|value| !value.is_null())
        .map(|value| join_key(&value))
}
