#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use graphql_parser::query::{
    Definition, Document, FragmentDefinition, OperationDefinition, Selection, SelectionSet,
    TypeCondition, Value, parse_query,
};
use serde_json::{Map, Value as JsonValue, json};
use weave::error::BoxError;
use weave::hooks::{CallerContext, FieldAuthorizer};
use weave::normalized_query::NormalizedField;
use weave::query_executor::{ServiceExecutionParameters, ServiceExecutionResult};
use weave::schema::Schema;
use weave::{
    FederationGateway, GatewayHooks, GraphQLError, InMemorySchemaRegistry, OwnershipQueryPlanner,
    ServiceDefinition, ServiceExecution,
};

type JsonMap = Map<String, JsonValue>;
type Resolve = Box<dyn Fn(&str, &JsonMap) -> JsonValue + Send + Sync>;

/// An in-process service: top-level fields come from a resolver, nested fields are read off
/// the returned JSON.
pub struct JsonService {
    resolve: Resolve,
    queries: Mutex<Vec<String>>,
}

impl JsonService {
    pub fn new(resolve: impl Fn(&str, &JsonMap) -> JsonValue + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(JsonService {
            resolve: Box::new(resolve),
            queries: Mutex::new(Vec::new()),
        })
    }

    /// Answers every top-level field from `data`, ignoring arguments.
    pub fn fixed(data: JsonValue) -> Arc<Self> {
        Self::new(move |field, _| data.get(field).cloned().unwrap_or(JsonValue::Null))
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceExecution for JsonService {
    async fn execute(
        &self,
        parameters: ServiceExecutionParameters,
    ) -> Result<ServiceExecutionResult, BoxError> {
        self.queries.lock().unwrap().push(parameters.query.clone());
        let document: Document<'_, String> =
            parse_query(&parameters.query).map_err(|e| e.to_string())?;
        let fragments: HashMap<&str, _> = document
            .definitions
            .iter()
            .filter_map(|definition| match definition {
                Definition::Fragment(fragment) => Some((fragment.name.as_str(), fragment)),
                _ => None,
            })
            .collect();
        let selection_set = document
            .definitions
            .iter()
            .find_map(|definition| match definition {
                Definition::Operation(OperationDefinition::SelectionSet(set)) => Some(set),
                Definition::Operation(OperationDefinition::Query(query)) => {
                    Some(&query.selection_set)
                }
                Definition::Operation(OperationDefinition::Mutation(mutation)) => {
                    Some(&mutation.selection_set)
                }
                _ => None,
            })
            .ok_or("no operation")?;

        let evaluator = Evaluator {
            fragments: &fragments,
            variables: &parameters.variables,
        };
        let mut data = JsonMap::new();
        for selection in &selection_set.items {
            let Selection::Field(field) = selection else {
                continue;
            };
            let key = field.alias.as_ref().unwrap_or(&field.name).clone();
            let value = if field.name == "__typename" {
                json!("Query")
            } else {
                let arguments = field
                    .arguments
                    .iter()
                    .map(|(name, value)| (name.clone(), evaluator.argument(value)))
                    .collect();
                (self.resolve)(&field.name, &arguments)
            };
            data.insert(key, evaluator.project(&value, &field.selection_set));
        }

        Ok(ServiceExecutionResult {
            data: Some(data),
            ..Default::default()
        })
    }
}

struct Evaluator<'d, 'q> {
    fragments: &'d HashMap<&'q str, &'q FragmentDefinition<'q, String>>,
    variables: &'d JsonMap,
}

impl Evaluator<'_, '_> {
    fn argument(&self, value: &Value<'_, String>) -> JsonValue {
        match value {
            Value::Variable(name) => self.variables.get(name).cloned().unwrap_or(JsonValue::Null),
            Value::Int(number) => json!(number.as_i64()),
            Value::Float(number) => json!(number),
            Value::String(text) => json!(text),
            Value::Boolean(flag) => json!(flag),
            Value::Null => JsonValue::Null,
            Value::Enum(name) => json!(name),
            Value::List(items) => items.iter().map(|item| self.argument(item)).collect(),
            Value::Object(fields) => JsonValue::Object(
                fields
                    .iter()
                    .map(|(name, value)| (name.clone(), self.argument(value)))
                    .collect(),
            ),
        }
    }

    fn project(&self, value: &JsonValue, selection_set: &SelectionSet<'_, String>) -> JsonValue {
        if selection_set.items.is_empty() {
            return value.clone();
        }
        match value {
            JsonValue::Array(items) => items
                .iter()
                .map(|item| self.project(item, selection_set))
                .collect(),
            JsonValue::Object(object) => {
                let mut out = JsonMap::new();
                self.collect(object, selection_set, &mut out);
                JsonValue::Object(out)
            }
            _ => JsonValue::Null,
        }
    }

    fn collect(&self, object: &JsonMap, selection_set: &SelectionSet<'_, String>, out: &mut JsonMap) {
        for selection in &selection_set.items {
            match selection {
                Selection::Field(field) => {
                    let key = field.alias.as_ref().unwrap_or(&field.name).clone();
                    let value = object.get(&field.name).cloned().unwrap_or(JsonValue::Null);
                    out.insert(key, self.project(&value, &field.selection_set));
                }
                Selection::InlineFragment(inline) => {
                    if matches(object, inline.type_condition.as_ref()) {
                        self.collect(object, &inline.selection_set, out);
                    }
                }
                Selection::FragmentSpread(spread) => {
                    if let Some(fragment) = self.fragments.get(spread.fragment_name.as_str()) {
                        if matches(object, Some(&fragment.type_condition)) {
                            self.collect(object, &fragment.selection_set, out);
                        }
                    }
                }
            }
        }
    }
}

fn matches(object: &JsonMap, condition: Option<&TypeCondition<'_, String>>) -> bool {
    match (condition, object.get("__typename")) {
        (Some(TypeCondition::On(type_name)), Some(JsonValue::String(actual))) => {
            type_name == actual
        }
        _ => true,
    }
}

/// A service whose transport always fails.
pub struct Unreachable;

#[async_trait]
impl ServiceExecution for Unreachable {
    async fn execute(
        &self,
        _parameters: ServiceExecutionParameters,
    ) -> Result<ServiceExecutionResult, BoxError> {
        Err("connection refused".into())
    }
}

pub struct DenyFields(pub Vec<&'static str>);

#[async_trait]
impl FieldAuthorizer for DenyFields {
    async fn authorize(
        &self,
        field: &NormalizedField,
        _variables: &JsonMap,
        _schema: &Schema,
        _caller: &CallerContext,
    ) -> Result<Option<GraphQLError>, BoxError> {
        Ok(self
            .0
            .iter()
            .any(|name| *name == field.field_name)
            .then(|| GraphQLError::new(format!("not allowed to read {}", field.field_name))))
    }
}

pub struct TestService {
    pub name: &'static str,
    pub schema: &'static str,
    pub underlying_schema: Option<&'static str>,
    pub execution: Arc<dyn ServiceExecution>,
}

impl TestService {
    pub fn new(
        name: &'static str,
        schema: &'static str,
        execution: Arc<dyn ServiceExecution>,
    ) -> Self {
        TestService {
            name,
            schema,
            underlying_schema: None,
            execution,
        }
    }

    pub fn underlying(mut self, schema: &'static str) -> Self {
        self.underlying_schema = Some(schema);
        self
    }

    pub fn definition(&self) -> ServiceDefinition {
        let definition = ServiceDefinition::new(self.name, self.schema);
        match self.underlying_schema {
            Some(underlying) => definition.with_underlying_schema(underlying),
            None => definition,
        }
    }
}

pub async fn gateway(services: Vec<TestService>, hooks: GatewayHooks) -> FederationGateway {
    let gateway = FederationGateway::new(
        Box::new(InMemorySchemaRegistry::new()),
        Box::new(OwnershipQueryPlanner::new()),
        hooks,
    );
    for service in services {
        gateway
            .register_service(service.definition(), service.execution.clone())
            .await
            .unwrap();
    }
    gateway
}
