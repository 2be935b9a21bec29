//! Rewrites a share of the overall query into a query one underlying service understands.
//!
//! The rewrite applies declared field renames, replaces hydrated fields by the source fields
//! their join keys are read from, removes forbidden fields and injects `__typename` hints under a
//! per-request alias. Everything needed to undo the rewrite is recorded in the returned
//! [`TransformationState`] and [`RemovedFieldData`].
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use tracing::trace;

use crate::error::{GatewayError, GraphQLError};
use crate::federation_gateway::ExecutionContext;
use crate::field_authorization::ForbiddenFields;
use crate::normalized_query::{NormalizedField, NormalizedFieldId};
use crate::query_ast::{
    Directive, Field, FieldId, FragmentDefinition, InlineFragment, JsonMap, OperationDefinition,
    OperationKind, QueryDocument, Selection, Type, Value, VariableDefinition,
    collect_variable_references,
};
use crate::schema_registry::Service;
use crate::transformations::{FieldRename, FieldTransformation, HydrationDefinition};

/// A top-level field handed to the transformer.
#[derive(Clone, Debug)]
pub struct TopLevelField {
    pub field: Field,
    /// Set for hydration backing fields: the hydrated field whose shape the result takes.
    pub hydrated: Option<NormalizedFieldId>,
    /// Appended to the transformed field's selection as is; never visible in results.
    pub artificial_selections: Vec<Field>,
}

impl TopLevelField {
    pub fn new(field: Field) -> Self {
        TopLevelField {
            field,
            hydrated: None,
            artificial_selections: Vec::new(),
        }
    }

    pub fn hydration(field: Field, hydrated: NormalizedFieldId) -> Self {
        TopLevelField {
            field,
            hydrated: Some(hydrated),
            artificial_selections: Vec::new(),
        }
    }

    pub fn with_artificial_selection(mut self, field: Field) -> Self {
        self.artificial_selections.push(field);
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum AppliedTransformation {
    Rename {
        rename: Arc<FieldRename>,
    },
    /// Recorded on a source field that stands in for a hydrated field.
    Hydration {
        definition: Arc<HydrationDefinition>,
        original_field: FieldId,
        argument: String,
        source_path: Vec<String>,
        selection_set: Vec<Selection>,
    },
}

#[derive(Clone, Debug, Default)]
pub struct TransformationState {
    pub field_transformations: HashMap<FieldId, AppliedTransformation>,
    /// underlying type name -> overall type name
    pub type_renames: HashMap<String, String>,
    pub hint_typenames: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RemovedField {
    pub field: NormalizedFieldId,
    pub error: GraphQLError,
}

/// Fields deleted from the query, keyed by their normalized parent.
#[derive(Clone, Debug, Default)]
pub struct RemovedFieldData {
    by_parent: HashMap<Option<NormalizedFieldId>, Vec<RemovedField>>,
}

impl RemovedFieldData {
    fn record(
        &mut self,
        parent: Option<NormalizedFieldId>,
        field: NormalizedFieldId,
        error: GraphQLError,
    ) {
        let siblings = self.by_parent.entry(parent).or_default();
        if !siblings.iter().any(|removed| removed.field == field) {
            siblings.push(RemovedField { field, error });
        }
    }

    pub fn under(&self, parent: Option<NormalizedFieldId>) -> &[RemovedField] {
        self.by_parent
            .get(&parent)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn error_for(&self, field: NormalizedFieldId) -> Option<&GraphQLError> {
        self.by_parent
            .values()
            .flatten()
            .find(|removed| removed.field == field)
            .map(|removed| &removed.error)
    }

    pub fn is_empty(&self) -> bool {
        self.by_parent.values().all(Vec::is_empty)
    }
}

pub struct QueryTransformationResult {
    /// One operation plus the fragments it references.
    pub document: QueryDocument,
    /// Top-level fields as sent; empty when every requested field was removed.
    pub transformed_fields: Vec<Field>,
    pub referenced_variables: JsonMap,
    pub state: TransformationState,
    pub removed: RemovedFieldData,
}

impl QueryTransformationResult {
    /// True when the service result already has the overall shape.
    pub fn is_passthrough(&self) -> bool {
        self.state.field_transformations.is_empty()
            && self.state.type_renames.is_empty()
            && self.state.hint_typenames.is_empty()
            && self.removed.is_empty()
    }
}

pub struct QueryTransformer<'a> {
    ctx: &'a ExecutionContext,
    service: &'a Service,
    forbidden: &'a ForbiddenFields,
    state: TransformationState,
    removed: RemovedFieldData,
    variables: IndexSet<String>,
    pending_fragments: VecDeque<String>,
    seen_fragments: HashSet<String>,
}

impl<'a> QueryTransformer<'a> {
    pub fn new(
        ctx: &'a ExecutionContext,
        service: &'a Service,
        forbidden: &'a ForbiddenFields,
    ) -> Self {
        QueryTransformer {
            ctx,
            service,
            forbidden,
            state: TransformationState::default(),
            removed: RemovedFieldData::default(),
            variables: IndexSet::new(),
            pending_fragments: VecDeque::new(),
            seen_fragments: HashSet::new(),
        }
    }

    pub fn transform(
        mut self,
        top_level: Vec<TopLevelField>,
    ) -> Result<QueryTransformationResult, GatewayError> {
        let ctx = self.ctx;
        let kind = if top_level.iter().any(|top| top.hydrated.is_some()) {
            OperationKind::Query
        } else {
            ctx.operation.kind
        };

        let mut transformed_fields = Vec::new();
        for top in top_level {
            let artificial = top.artificial_selections.into_iter().map(Selection::Field);
            match top.hydrated {
                Some(hydrated) => {
                    let mut field = self.backing_field(top.field, ctx.normalized.get(hydrated))?;
                    field.selection_set.extend(artificial);
                    transformed_fields.push(field);
                }
                None => {
                    for selection in self.transform_field(&top.field)? {
                        if let Selection::Field(mut field) = selection {
                            field.selection_set.extend(artificial.clone());
                            transformed_fields.push(field);
                        }
                    }
                }
            }
        }

        let mut fragments = IndexMap::new();
        while let Some(name) = self.pending_fragments.pop_front() {
            let fragment = ctx.document.fragment(&name)?;
            let mut selection_set =
                self.transform_selections(&fragment.selection_set, &fragment.type_condition)?;
            self.finish_selection(&mut selection_set, &fragment.type_condition);
            self.collect_directive_variables(&fragment.directives);
            let type_condition = self.underlying_type(&fragment.type_condition);
            fragments.insert(
                name.clone(),
                FragmentDefinition {
                    name,
                    type_condition,
                    directives: fragment.directives.clone(),
                    selection_set,
                },
            );
        }

        let mut variable_definitions = Vec::new();
        for definition in &ctx.operation.variable_definitions {
            if self.variables.contains(&definition.name) {
                variable_definitions.push(VariableDefinition {
                    name: definition.name.clone(),
                    var_type: self.rename_type(&definition.var_type),
                    default_value: definition.default_value.clone(),
                });
            }
        }
        let referenced_variables: JsonMap = self
            .variables
            .iter()
            .filter_map(|name| Some((name.clone(), ctx.variables.get(name)?.clone())))
            .collect();

        let document = QueryDocument {
            operations: vec![OperationDefinition {
                kind,
                name: ctx.operation.name.clone(),
                variable_definitions,
                directives: Vec::new(),
                selection_set: transformed_fields
                    .iter()
                    .cloned()
                    .map(Selection::Field)
                    .collect(),
            }],
            fragments,
        };
        trace!(service = %self.service.name, query = %document, "transformed query");

        Ok(QueryTransformationResult {
            document,
            transformed_fields,
            referenced_variables,
            state: self.state,
            removed: self.removed,
        })
    }

    /// Hydration backing fields carry the hydrated field's original selection.
    fn backing_field(
        &mut self,
        mut field: Field,
        hydrated: &NormalizedField,
    ) -> Result<Field, GatewayError> {
        let output_type = hydrated.output_type().to_string();
        self.record_type_renames(&output_type);
        if self.ctx.schema.overall.is_composite(&output_type) {
            let mut selection_set = self.transform_selections(&field.selection_set, &output_type)?;
            self.finish_selection(&mut selection_set, &output_type);
            field.selection_set = selection_set;
        }
        Ok(field)
    }

    fn transform_selections(
        &mut self,
        selections: &[Selection],
        parent_type: &str,
    ) -> Result<Vec<Selection>, GatewayError> {
        let mut transformed = Vec::new();
        for selection in selections {
            match selection {
                Selection::Field(field) => transformed.extend(self.transform_field(field)?),
                Selection::InlineFragment(inline) => {
                    let condition = inline.type_condition.as_deref().unwrap_or(parent_type);
                    let selection_set = self.transform_selections(&inline.selection_set, condition)?;
                    if selection_set.is_empty() {
                        continue;
                    }
                    self.collect_directive_variables(&inline.directives);
                    transformed.push(Selection::InlineFragment(InlineFragment {
                        type_condition: inline
                            .type_condition
                            .as_deref()
                            .map(|condition| self.underlying_type(condition)),
                        directives: inline.directives.clone(),
                        selection_set,
                    }));
                }
                Selection::FragmentSpread(spread) => {
                    if self.seen_fragments.insert(spread.fragment_name.clone()) {
                        self.pending_fragments.push_back(spread.fragment_name.clone());
                    }
                    self.collect_directive_variables(&spread.directives);
                    transformed.push(selection.clone());
                }
            }
        }
        Ok(transformed)
    }

    fn transform_field(&mut self, field: &Field) -> Result<Vec<Selection>, GatewayError> {
        let ctx = self.ctx;
        let forbidden = self.forbidden;
        let normalized_ids = ctx.normalized.fields_for(field.id);
        let Some(first) = normalized_ids.first() else {
            return Ok(Vec::new());
        };

        if let Some(error) = normalized_ids.iter().find_map(|id| forbidden.get(id)) {
            for id in normalized_ids {
                let removed = ctx.normalized.get(*id);
                let error = forbidden.get(id).unwrap_or(error).clone();
                self.removed.record(removed.parent, *id, error);
            }
            return Ok(Vec::new());
        }

        let normalized = ctx.normalized.get(*first);
        self.record_type_renames(&normalized.object_type);
        let transformation = normalized_ids.iter().find_map(|id| {
            let candidate = ctx.normalized.get(*id);
            ctx.schema
                .transformations
                .field(
                    &self.service.name,
                    &candidate.object_type,
                    &candidate.field_name,
                )
        });

        match transformation {
            Some(FieldTransformation::Hydration(definition)) => {
                Ok(self.hydration_sources(field, definition))
            }
            Some(FieldTransformation::Rename(rename)) => {
                let inner = self.plain_field(field, normalized)?;
                let renamed = self.renamed_field(field, inner, rename);
                self.state.field_transformations.insert(
                    field.id,
                    AppliedTransformation::Rename {
                        rename: rename.clone(),
                    },
                );
                Ok(vec![Selection::Field(renamed)])
            }
            None => Ok(vec![Selection::Field(self.plain_field(field, normalized)?)]),
        }
    }

    fn plain_field(
        &mut self,
        field: &Field,
        normalized: &NormalizedField,
    ) -> Result<Field, GatewayError> {
        let output_type = normalized.output_type();
        self.collect_directive_variables(&field.directives);
        let mut arguments = Vec::with_capacity(field.arguments.len());
        for (name, value) in &field.arguments {
            collect_variable_references(value, &mut self.variables);
            let value = self.rewrite_argument(normalized, name, value);
            arguments.push((name.clone(), value));
        }

        let mut selection_set = Vec::new();
        if self.ctx.schema.overall.is_composite(output_type) {
            self.record_type_renames(output_type);
            selection_set = self.transform_selections(&field.selection_set, output_type)?;
            self.finish_selection(&mut selection_set, output_type);
        }

        Ok(Field {
            id: field.id,
            alias: field.alias.clone(),
            name: field.name.clone(),
            arguments,
            directives: field.directives.clone(),
            selection_set,
        })
    }

    fn rewrite_argument(&self, normalized: &NormalizedField, name: &str, value: &Value) -> Value {
        match &self.ctx.hooks.argument_rewriter {
            Some(rewriter) => rewriter.rewrite_argument(
                self.service,
                &normalized.object_type,
                &normalized.field_name,
                name,
                value.clone(),
            ),
            None => value.clone(),
        }
    }

    /// Wraps an already transformed field into the underlying path of a rename.
    fn renamed_field(&self, original: &Field, mut inner: Field, rename: &FieldRename) -> Field {
        let path = &rename.underlying_path;
        let Some((innermost, outer)) = path.split_last() else {
            return inner;
        };

        inner.name = innermost.clone();
        inner.alias = None;
        if outer.is_empty() {
            inner.alias = Some(original.result_key().to_string());
            return inner;
        }

        inner.id = self.ctx.ids.next_id();
        let directives = std::mem::take(&mut inner.directives);
        let mut wrapped = inner;
        for (depth, segment) in outer.iter().enumerate().rev() {
            let id = if depth == 0 {
                original.id
            } else {
                self.ctx.ids.next_id()
            };
            wrapped = Field::new(id, segment.clone()).with_selection(vec![Selection::Field(wrapped)]);
        }
        wrapped.alias = Some(original.result_key().to_string());
        wrapped.directives = directives;
        wrapped
    }

    fn hydration_sources(
        &mut self,
        field: &Field,
        definition: &Arc<HydrationDefinition>,
    ) -> Vec<Selection> {
        let sources: Vec<(&str, &[String])> = definition.source_arguments().collect();
        let single = sources.len() == 1;
        let mut selections = Vec::new();

        for (argument, path) in sources {
            let alias = if single {
                field.result_key().to_string()
            } else {
                format!("{}__{argument}", field.result_key())
            };
            let Some(source) = self.path_field(path, alias) else {
                continue;
            };
            self.state.field_transformations.insert(
                source.id,
                AppliedTransformation::Hydration {
                    definition: definition.clone(),
                    original_field: field.id,
                    argument: argument.to_string(),
                    source_path: path.to_vec(),
                    selection_set: field.selection_set.clone(),
                },
            );
            selections.push(Selection::Field(source));
        }
        selections
    }

    /// Builds `a { b { c } }` for the path `a.b.c`, aliasing the outermost field.
    fn path_field(&self, path: &[String], alias: String) -> Option<Field> {
        let (innermost, outer) = path.split_last()?;
        let mut field = Field::new(self.ctx.ids.next_id(), innermost.clone());
        for segment in outer.iter().rev() {
            field = Field::new(self.ctx.ids.next_id(), segment.clone())
                .with_selection(vec![Selection::Field(field)]);
        }
        Some(field.with_alias(alias))
    }

    /// Injects the `__typename` hint for abstract types and for selections left empty.
    fn finish_selection(&mut self, selection_set: &mut Vec<Selection>, overall_type: &str) {
        if selection_set.is_empty() || self.ctx.schema.overall.is_abstract(overall_type) {
            let hint = Field::new(self.ctx.ids.next_id(), "__typename")
                .with_alias(self.ctx.hint_alias.clone());
            selection_set.push(Selection::Field(hint));
            if !self.state.hint_typenames.contains(&self.ctx.hint_alias) {
                self.state.hint_typenames.push(self.ctx.hint_alias.clone());
            }
        }
    }

    fn collect_directive_variables(&mut self, directives: &[Directive]) {
        for directive in directives {
            for (_, value) in &directive.arguments {
                collect_variable_references(value, &mut self.variables);
            }
        }
    }

    /// Records the renames of a type and of every object type it can resolve to.
    fn record_type_renames(&mut self, overall_type: &str) {
        let ctx = self.ctx;
        let mut types = ctx.schema.overall.possible_types(overall_type);
        types.push(overall_type.to_string());
        for overall in types {
            let underlying = ctx
                .schema
                .transformations
                .underlying_type_name(&self.service.name, &overall);
            if underlying != overall {
                self.state
                    .type_renames
                    .insert(underlying.to_string(), overall.clone());
            }
        }
    }

    fn underlying_type(&mut self, overall_type: &str) -> String {
        self.record_type_renames(overall_type);
        self.ctx
            .schema
            .transformations
            .underlying_type_name(&self.service.name, overall_type)
            .to_string()
    }

    fn rename_type(&mut self, ty: &Type) -> Type {
        match ty {
            Type::NamedType(name) => Type::NamedType(self.underlying_type(name)),
            Type::ListType(inner) => Type::ListType(Box::new(self.rename_type(inner))),
            Type::NonNullType(inner) => Type::NonNullType(Box::new(self.rename_type(inner))),
        }
    }
}
