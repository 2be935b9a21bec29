//! Alias- and fragment-independent view of an operation.
//!
//! Every field the operation can produce is represented once per (parent, object type, result
//! key), regardless of how many AST occurrences contribute to it. Abstract selections expand to
//! one normalized field per possible object type.
use std::collections::HashMap;

use indexmap::IndexMap;

use crate::error::GatewayError;
use crate::query_ast::{
    Field, FieldId, JsonMap, OperationDefinition, QueryDocument, Selection, Type, should_include,
    value_to_json,
};
use crate::schema::{FieldDefinition, Schema, named_type};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormalizedFieldId(usize);

#[derive(Clone, Debug)]
pub struct NormalizedField {
    pub id: NormalizedFieldId,
    pub object_type: String,
    pub field_name: String,
    pub alias: Option<String>,
    pub result_key: String,
    pub field_type: Type,
    pub arguments: JsonMap,
    /// Every AST occurrence merged into this field.
    pub field_ids: Vec<FieldId>,
    pub parent: Option<NormalizedFieldId>,
    pub children: Vec<NormalizedFieldId>,
    /// 1 for top-level fields.
    pub level: usize,
    /// Index among the parent's children, used to restore query order.
    pub position: usize,
}

impl NormalizedField {
    pub fn is_typename(&self) -> bool {
        self.field_name == "__typename"
    }

    pub fn output_type(&self) -> &str {
        named_type(&self.field_type)
    }
}

#[derive(Clone, Debug, Default)]
pub struct NormalizedQuery {
    fields: Vec<NormalizedField>,
    top_level: Vec<NormalizedFieldId>,
    by_field_id: HashMap<FieldId, Vec<NormalizedFieldId>>,
    max_level: usize,
}

impl NormalizedQuery {
    pub fn new(
        schema: &Schema,
        document: &QueryDocument,
        operation: &OperationDefinition,
        variables: &JsonMap,
    ) -> Result<Self, GatewayError> {
        let root_type = schema.root_type_name(operation.kind).ok_or_else(|| {
            GatewayError::UnsupportedOperation(format!("schema has no {} type", operation.kind))
        })?;
        let collector = Collector {
            schema,
            document,
            variables,
        };
        let mut query = NormalizedQuery::default();
        let top_level =
            collector.collect(&mut query, None, root_type, &[&operation.selection_set[..]], 1)?;
        query.top_level = top_level;
        Ok(query)
    }

    pub fn get(&self, id: NormalizedFieldId) -> &NormalizedField {
        &self.fields[id.0]
    }

    pub fn top_level_fields(&self) -> impl Iterator<Item = &NormalizedField> {
        self.top_level.iter().map(|id| self.get(*id))
    }

    pub fn children(&self, id: NormalizedFieldId) -> impl Iterator<Item = &NormalizedField> {
        self.get(id).children.iter().map(|child| self.get(*child))
    }

    /// Normalized fields an AST field occurrence contributes to.
    pub fn fields_for(&self, field_id: FieldId) -> &[NormalizedFieldId] {
        self.by_field_id
            .get(&field_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Finds the normalized field for a result key under a parent and concrete object type.
    pub fn find_child(
        &self,
        parent: Option<NormalizedFieldId>,
        object_type: &str,
        result_key: &str,
    ) -> Option<&NormalizedField> {
        let siblings = match parent {
            Some(parent) => &self.get(parent).children,
            None => &self.top_level,
        };
        siblings
            .iter()
            .map(|id| self.get(*id))
            .find(|field| field.object_type == object_type && field.result_key == result_key)
    }

    /// Finds the normalized field AST occurrences contribute under a parent and object type.
    pub fn find(
        &self,
        field_ids: &[FieldId],
        parent: Option<NormalizedFieldId>,
        object_type: &str,
    ) -> Option<&NormalizedField> {
        field_ids
            .iter()
            .flat_map(|field_id| self.fields_for(*field_id))
            .map(|id| self.get(*id))
            .find(|field| field.parent == parent && field.object_type == object_type)
    }

    pub fn max_level(&self) -> usize {
        self.max_level
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

struct Collector<'a> {
    schema: &'a Schema,
    document: &'a QueryDocument,
    variables: &'a JsonMap,
}

impl<'a> Collector<'a> {
    fn collect(
        &self,
        query: &mut NormalizedQuery,
        parent: Option<NormalizedFieldId>,
        parent_type: &str,
        selection_sets: &[&'a [Selection]],
        level: usize,
    ) -> Result<Vec<NormalizedFieldId>, GatewayError> {
        let mut ids = Vec::new();
        query.max_level = query.max_level.max(level);

        for object_type in self.schema.possible_types(parent_type) {
            let mut grouped: IndexMap<String, Vec<&'a Field>> = IndexMap::new();
            for &selection_set in selection_sets {
                self.collect_fields(selection_set, &object_type, &mut grouped)?;
            }

            for (result_key, occurrences) in grouped {
                let first = occurrences[0];
                let definition = self.schema.field(&object_type, &first.name).ok_or_else(|| {
                    GatewayError::SchemaMismatch(format!(
                        "field '{}' is not defined on type '{object_type}'",
                        first.name
                    ))
                })?;

                let id = NormalizedFieldId(query.fields.len());
                query.fields.push(NormalizedField {
                    id,
                    object_type: object_type.clone(),
                    field_name: first.name.clone(),
                    alias: first.alias.clone(),
                    result_key,
                    field_type: definition.field_type.clone(),
                    arguments: coerce_arguments(definition, first, self.variables),
                    field_ids: occurrences.iter().map(|field| field.id).collect(),
                    parent,
                    children: Vec::new(),
                    level,
                    position: ids.len(),
                });
                for occurrence in &occurrences {
                    query.by_field_id.entry(occurrence.id).or_default().push(id);
                }

                let child_type = named_type(&definition.field_type);
                if self.schema.is_composite(child_type) {
                    let child_sets: Vec<&'a [Selection]> = occurrences
                        .iter()
                        .map(|&field| &field.selection_set[..])
                        .collect();
                    let children =
                        self.collect(query, Some(id), child_type, &child_sets, level + 1)?;
                    query.fields[id.0].children = children;
                }
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn collect_fields(
        &self,
        selection_set: &'a [Selection],
        object_type: &str,
        grouped: &mut IndexMap<String, Vec<&'a Field>>,
    ) -> Result<(), GatewayError> {
        for selection in selection_set {
            match selection {
                Selection::Field(field) => {
                    if should_include(&field.directives, self.variables) {
                        grouped
                            .entry(field.result_key().to_string())
                            .or_default()
                            .push(field);
                    }
                }
                Selection::InlineFragment(inline) => {
                    let applies = inline
                        .type_condition
                        .as_deref()
                        .is_none_or(|condition| self.schema.type_satisfies(object_type, condition));
                    if applies && should_include(&inline.directives, self.variables) {
                        self.collect_fields(&inline.selection_set, object_type, grouped)?;
                    }
                }
                Selection::FragmentSpread(spread) => {
                    if !should_include(&spread.directives, self.variables) {
                        continue;
                    }
                    let fragment = self.document.fragment(&spread.fragment_name)?;
                    if self
                        .schema
                        .type_satisfies(object_type, &fragment.type_condition)
                    {
                        self.collect_fields(&fragment.selection_set, object_type, grouped)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn coerce_arguments(definition: &FieldDefinition, field: &Field, variables: &JsonMap) -> JsonMap {
    let mut arguments = JsonMap::new();
    for argument in &definition.arguments {
        let value = match (field.argument(&argument.name), &argument.default_value) {
            (Some(value), _) => value_to_json(value, variables),
            (None, Some(default)) => value_to_json(default, &JsonMap::new()),
            (None, None) => continue,
        };
        arguments.insert(argument.name.clone(), value);
    }
    arguments
}
