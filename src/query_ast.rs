//! Owned executable document.
//!
//! Queries are parsed with `graphql-parser` and converted into these owned nodes so that every
//! field occurrence carries a [`FieldId`]. Transformed documents are printed back through the
//! `graphql-parser` printer.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use graphql_parser::Pos;
use graphql_parser::query as ast;
use indexmap::{IndexMap, IndexSet};
use serde_json::{Map, Number, Value as JsonValue};

use crate::error::GatewayError;

pub type Value = ast::Value<'static, String>;
pub type Type = ast::Type<'static, String>;
pub type Directive = ast::Directive<'static, String>;
pub type JsonMap = Map<String, JsonValue>;

/// Identity of one field occurrence in a document, stable across transformations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(u32);

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// Request-scoped source of fresh field ids.
#[derive(Debug, Default)]
pub struct FieldIdGenerator {
    next: AtomicU32,
}

impl FieldIdGenerator {
    pub fn new() -> Self {
        FieldIdGenerator::default()
    }

    pub fn next_id(&self) -> FieldId {
        FieldId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum OperationKind {
    #[default]
    Query,
    Mutation,
    Subscription,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Query => write!(f, "query"),
            OperationKind::Mutation => write!(f, "mutation"),
            OperationKind::Subscription => write!(f, "subscription"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub id: FieldId,
    pub alias: Option<String>,
    pub name: String,
    pub arguments: Vec<(String, Value)>,
    pub directives: Vec<Directive>,
    pub selection_set: Vec<Selection>,
}

impl Field {
    pub fn new(id: FieldId, name: impl Into<String>) -> Self {
        Field {
            id,
            alias: None,
            name: name.into(),
            arguments: Vec::new(),
            directives: Vec::new(),
            selection_set: Vec::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_selection(mut self, selection_set: Vec<Selection>) -> Self {
        self.selection_set = selection_set;
        self
    }

    pub fn result_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.arguments
            .iter()
            .find(|(argument, _)| argument == name)
            .map(|(_, value)| value)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Selection {
    Field(Field),
    FragmentSpread(FragmentSpread),
    InlineFragment(InlineFragment),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FragmentSpread {
    pub fragment_name: String,
    pub directives: Vec<Directive>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InlineFragment {
    pub type_condition: Option<String>,
    pub directives: Vec<Directive>,
    pub selection_set: Vec<Selection>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FragmentDefinition {
    pub name: String,
    pub type_condition: String,
    pub directives: Vec<Directive>,
    pub selection_set: Vec<Selection>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VariableDefinition {
    pub name: String,
    pub var_type: Type,
    pub default_value: Option<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OperationDefinition {
    pub kind: OperationKind,
    pub name: Option<String>,
    pub variable_definitions: Vec<VariableDefinition>,
    pub directives: Vec<Directive>,
    pub selection_set: Vec<Selection>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryDocument {
    pub operations: Vec<OperationDefinition>,
    pub fragments: IndexMap<String, FragmentDefinition>,
}

impl QueryDocument {
    pub fn parse(query: &str, ids: &FieldIdGenerator) -> Result<Self, GatewayError> {
        let document = ast::parse_query::<String>(query)
            .map_err(|e| GatewayError::QueryParse(e.to_string()))?;

        let mut operations = Vec::new();
        let mut fragments = IndexMap::new();
        for definition in &document.definitions {
            match definition {
                ast::Definition::Operation(operation) => {
                    operations.push(convert_operation(operation, ids))
                }
                ast::Definition::Fragment(fragment) => {
                    let ast::TypeCondition::On(type_condition) = &fragment.type_condition;
                    fragments.insert(
                        fragment.name.clone(),
                        FragmentDefinition {
                            name: fragment.name.clone(),
                            type_condition: type_condition.clone(),
                            directives: fragment.directives.iter().map(own_directive).collect(),
                            selection_set: convert_selection_set(&fragment.selection_set, ids),
                        },
                    );
                }
            }
        }

        Ok(QueryDocument {
            operations,
            fragments,
        })
    }

    pub fn operation(&self, name: Option<&str>) -> Result<&OperationDefinition, GatewayError> {
        match name {
            Some(name) => self
                .operations
                .iter()
                .find(|operation| operation.name.as_deref() == Some(name))
                .ok_or_else(|| GatewayError::UnknownOperation(name.to_string())),
            None => match self.operations.as_slice() {
                [operation] => Ok(operation),
                [] => Err(GatewayError::UnknownOperation(
                    "document contains no operation".to_string(),
                )),
                _ => Err(GatewayError::AmbiguousOperation),
            },
        }
    }

    pub fn fragment(&self, name: &str) -> Result<&FragmentDefinition, GatewayError> {
        self.fragments
            .get(name)
            .ok_or_else(|| GatewayError::QueryParse(format!("unknown fragment '{name}'")))
    }

    fn to_ast(&self) -> ast::Document<'static, String> {
        let mut definitions = Vec::new();
        for operation in &self.operations {
            definitions.push(ast::Definition::Operation(operation_to_ast(operation)));
        }
        for fragment in self.fragments.values() {
            definitions.push(ast::Definition::Fragment(ast::FragmentDefinition {
                position: Pos::default(),
                name: fragment.name.clone(),
                type_condition: ast::TypeCondition::On(fragment.type_condition.clone()),
                directives: fragment.directives.clone(),
                selection_set: selection_set_to_ast(&fragment.selection_set),
            }));
        }
        ast::Document { definitions }
    }
}

impl fmt::Display for QueryDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ast())
    }
}

fn convert_operation(
    operation: &ast::OperationDefinition<'_, String>,
    ids: &FieldIdGenerator,
) -> OperationDefinition {
    let (kind, name, variable_definitions, directives, selection_set) = match operation {
        ast::OperationDefinition::SelectionSet(set) => {
            (OperationKind::Query, None, &[][..], &[][..], set)
        }
        ast::OperationDefinition::Query(query) => (
            OperationKind::Query,
            query.name.clone(),
            &query.variable_definitions[..],
            &query.directives[..],
            &query.selection_set,
        ),
        ast::OperationDefinition::Mutation(mutation) => (
            OperationKind::Mutation,
            mutation.name.clone(),
            &mutation.variable_definitions[..],
            &mutation.directives[..],
            &mutation.selection_set,
        ),
        ast::OperationDefinition::Subscription(subscription) => (
            OperationKind::Subscription,
            subscription.name.clone(),
            &subscription.variable_definitions[..],
            &subscription.directives[..],
            &subscription.selection_set,
        ),
    };

    OperationDefinition {
        kind,
        name,
        variable_definitions: variable_definitions
            .iter()
            .map(|definition| VariableDefinition {
                name: definition.name.clone(),
                var_type: own_type(&definition.var_type),
                default_value: definition.default_value.as_ref().map(own_value),
            })
            .collect(),
        directives: directives.iter().map(own_directive).collect(),
        selection_set: convert_selection_set(selection_set, ids),
    }
}

fn convert_selection_set(
    set: &ast::SelectionSet<'_, String>,
    ids: &FieldIdGenerator,
) -> Vec<Selection> {
    set.items
        .iter()
        .map(|selection| match selection {
            ast::Selection::Field(field) => Selection::Field(Field {
                id: ids.next_id(),
                alias: field.alias.clone(),
                name: field.name.clone(),
                arguments: field
                    .arguments
                    .iter()
                    .map(|(name, value)| (name.clone(), own_value(value)))
                    .collect(),
                directives: field.directives.iter().map(own_directive).collect(),
                selection_set: convert_selection_set(&field.selection_set, ids),
            }),
            ast::Selection::FragmentSpread(spread) => Selection::FragmentSpread(FragmentSpread {
                fragment_name: spread.fragment_name.clone(),
                directives: spread.directives.iter().map(own_directive).collect(),
            }),
            ast::Selection::InlineFragment(inline) => Selection::InlineFragment(InlineFragment {
                type_condition: inline
                    .type_condition
                    .as_ref()
                    .map(|ast::TypeCondition::On(name)| name.clone()),
                directives: inline.directives.iter().map(own_directive).collect(),
                selection_set: convert_selection_set(&inline.selection_set, ids),
            }),
        })
        .collect()
}

fn operation_to_ast(operation: &OperationDefinition) -> ast::OperationDefinition<'static, String> {
    let variable_definitions = operation
        .variable_definitions
        .iter()
        .map(|definition| ast::VariableDefinition {
            position: Pos::default(),
            name: definition.name.clone(),
            var_type: definition.var_type.clone(),
            default_value: definition.default_value.clone(),
        })
        .collect();
    let selection_set = selection_set_to_ast(&operation.selection_set);
    let name = operation.name.clone();
    let directives = operation.directives.clone();

    match operation.kind {
        OperationKind::Query => ast::OperationDefinition::Query(ast::Query {
            position: Pos::default(),
            name,
            variable_definitions,
            directives,
            selection_set,
        }),
        OperationKind::Mutation => ast::OperationDefinition::Mutation(ast::Mutation {
            position: Pos::default(),
            name,
            variable_definitions,
            directives,
            selection_set,
        }),
        OperationKind::Subscription => ast::OperationDefinition::Subscription(ast::Subscription {
            position: Pos::default(),
            name,
            variable_definitions,
            directives,
            selection_set,
        }),
    }
}

fn selection_set_to_ast(selections: &[Selection]) -> ast::SelectionSet<'static, String> {
    ast::SelectionSet {
        span: (Pos::default(), Pos::default()),
        items: selections
            .iter()
            .map(|selection| match selection {
                Selection::Field(field) => ast::Selection::Field(ast::Field {
                    position: Pos::default(),
                    alias: field.alias.clone(),
                    name: field.name.clone(),
                    arguments: field.arguments.clone(),
                    directives: field.directives.clone(),
                    selection_set: selection_set_to_ast(&field.selection_set),
                }),
                Selection::FragmentSpread(spread) => {
                    ast::Selection::FragmentSpread(ast::FragmentSpread {
                        position: Pos::default(),
                        fragment_name: spread.fragment_name.clone(),
                        directives: spread.directives.clone(),
                    })
                }
                Selection::InlineFragment(inline) => {
                    ast::Selection::InlineFragment(ast::InlineFragment {
                        position: Pos::default(),
                        type_condition: inline.type_condition.clone().map(ast::TypeCondition::On),
                        directives: inline.directives.clone(),
                        selection_set: selection_set_to_ast(&inline.selection_set),
                    })
                }
            })
            .collect(),
    }
}

pub(crate) fn own_value(value: &ast::Value<'_, String>) -> Value {
    match value {
        ast::Value::Variable(name) => ast::Value::Variable(name.clone()),
        ast::Value::Int(number) => ast::Value::Int(number.clone()),
        ast::Value::Float(float) => ast::Value::Float(*float),
        ast::Value::String(string) => ast::Value::String(string.clone()),
        ast::Value::Boolean(boolean) => ast::Value::Boolean(*boolean),
        ast::Value::Null => ast::Value::Null,
        ast::Value::Enum(name) => ast::Value::Enum(name.clone()),
        ast::Value::List(items) => ast::Value::List(items.iter().map(own_value).collect()),
        ast::Value::Object(fields) => ast::Value::Object(
            fields
                .iter()
                .map(|(name, value)| (name.clone(), own_value(value)))
                .collect(),
        ),
    }
}

pub(crate) fn own_type(ty: &ast::Type<'_, String>) -> Type {
    match ty {
        ast::Type::NamedType(name) => ast::Type::NamedType(name.clone()),
        ast::Type::ListType(inner) => ast::Type::ListType(Box::new(own_type(inner))),
        ast::Type::NonNullType(inner) => ast::Type::NonNullType(Box::new(own_type(inner))),
    }
}

pub(crate) fn own_directive(directive: &ast::Directive<'_, String>) -> Directive {
    ast::Directive {
        position: Pos::default(),
        name: directive.name.clone(),
        arguments: directive
            .arguments
            .iter()
            .map(|(name, value)| (name.clone(), own_value(value)))
            .collect(),
    }
}

/// Resolves an AST value into JSON, substituting variables. Unknown variables become `null`.
pub fn value_to_json(value: &Value, variables: &JsonMap) -> JsonValue {
    match value {
        ast::Value::Variable(name) => variables.get(name).cloned().unwrap_or(JsonValue::Null),
        ast::Value::Int(number) => number
            .as_i64()
            .map(JsonValue::from)
            .unwrap_or(JsonValue::Null),
        ast::Value::Float(float) => Number::from_f64(*float)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        ast::Value::String(string) => JsonValue::String(string.clone()),
        ast::Value::Boolean(boolean) => JsonValue::Bool(*boolean),
        ast::Value::Null => JsonValue::Null,
        ast::Value::Enum(name) => JsonValue::String(name.clone()),
        ast::Value::List(items) => JsonValue::Array(
            items
                .iter()
                .map(|item| value_to_json(item, variables))
                .collect(),
        ),
        ast::Value::Object(fields) => JsonValue::Object(
            fields
                .iter()
                .map(|(name, value)| (name.clone(), value_to_json(value, variables)))
                .collect(),
        ),
    }
}

/// Builds a literal AST value from JSON, used when inlining join keys into hydration calls.
pub fn json_to_value(json: &JsonValue) -> Value {
    match json {
        JsonValue::Null => ast::Value::Null,
        JsonValue::Bool(boolean) => ast::Value::Boolean(*boolean),
        JsonValue::Number(number) => match number.as_i64().map(i32::try_from) {
            Some(Ok(int)) => ast::Value::Int(ast::Number::from(int)),
            _ => ast::Value::Float(number.as_f64().unwrap_or_default()),
        },
        JsonValue::String(string) => ast::Value::String(string.clone()),
        JsonValue::Array(items) => ast::Value::List(items.iter().map(json_to_value).collect()),
        JsonValue::Object(fields) => ast::Value::Object(
            fields
                .iter()
                .map(|(name, value)| (name.clone(), json_to_value(value)))
                .collect::<BTreeMap<_, _>>(),
        ),
    }
}

pub fn collect_variable_references(value: &Value, out: &mut IndexSet<String>) {
    match value {
        ast::Value::Variable(name) => {
            out.insert(name.clone());
        }
        ast::Value::List(items) => {
            for item in items {
                collect_variable_references(item, out);
            }
        }
        ast::Value::Object(fields) => {
            for value in fields.values() {
                collect_variable_references(value, out);
            }
        }
        _ => {}
    }
}

/// Evaluates `@skip` and `@include`.
pub fn should_include(directives: &[Directive], variables: &JsonMap) -> bool {
    for directive in directives {
        let condition = || {
            directive
                .arguments
                .iter()
                .find(|(name, _)| name == "if")
                .map(|(_, value)| value_to_json(value, variables))
                .and_then(|value| value.as_bool())
        };
        match directive.name.as_str() {
            "skip" if condition() == Some(true) => return false,
            "include" if condition() == Some(false) => return false,
            _ => {}
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_field_occurrence_gets_its_own_id() {
        let ids = FieldIdGenerator::new();
        let document = QueryDocument::parse(
            "query Q { issue { id ...F } } fragment F on Issue { id title }",
            &ids,
        )
        .unwrap();

        let operation = document.operation(None).unwrap();
        let Selection::Field(issue) = &operation.selection_set[0] else {
            panic!("expected a field")
        };
        let Selection::Field(id) = &issue.selection_set[0] else {
            panic!("expected a field")
        };
        let fragment = document.fragment("F").unwrap();
        let Selection::Field(fragment_id) = &fragment.selection_set[0] else {
            panic!("expected a field")
        };

        assert_eq!(operation.name.as_deref(), Some("Q"));
        assert_ne!(issue.id, id.id);
        assert_ne!(id.id, fragment_id.id);
    }

    #[test]
    fn prints_back_through_the_parser() {
        let ids = FieldIdGenerator::new();
        let document = QueryDocument::parse(
            r#"query($id: ID = "1") { issue(id: $id) { key: id ... on Issue { title } } }"#,
            &ids,
        )
        .unwrap();
        let printed = document.to_string();
        let reparsed = QueryDocument::parse(&printed, &ids).unwrap();

        assert!(printed.contains("key: id"));
        assert!(printed.contains("... on Issue"));
        assert_eq!(
            reparsed.operations[0].variable_definitions,
            document.operations[0].variable_definitions
        );
    }

    #[test]
    fn operation_selection() {
        let ids = FieldIdGenerator::new();
        let document = QueryDocument::parse("query A { a } query B { b }", &ids).unwrap();

        assert!(matches!(
            document.operation(None),
            Err(GatewayError::AmbiguousOperation)
        ));
        assert_eq!(document.operation(Some("B")).unwrap().name.as_deref(), Some("B"));
        assert!(matches!(
            document.operation(Some("C")),
            Err(GatewayError::UnknownOperation(_))
        ));
    }

    #[test]
    fn skip_and_include() {
        let ids = FieldIdGenerator::new();
        let document =
            QueryDocument::parse("{ a @skip(if: $s) b @include(if: false) c }", &ids).unwrap();
        let variables = json!({ "s": true });
        let variables = variables.as_object().unwrap();
        let included: Vec<_> = document.operations[0]
            .selection_set
            .iter()
            .filter_map(|selection| match selection {
                Selection::Field(field) if should_include(&field.directives, variables) => {
                    Some(field.name.as_str())
                }
                _ => None,
            })
            .collect();

        assert_eq!(included, vec!["c"]);
    }

    #[test]
    fn literal_values_survive_json() {
        let variables = Map::new();
        let json = json!({ "ids": ["u1", "u2"], "first": 10, "exact": true });

        assert_eq!(value_to_json(&json_to_value(&json), &variables), json);
    }
}
