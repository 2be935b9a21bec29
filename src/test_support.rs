use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::{BoxError, GraphQLError};
use crate::federation_gateway::ExecutionContext;
use crate::hooks::{CallerContext, FieldAuthorizer, GatewayHooks};
use crate::normalized_query::NormalizedField;
use crate::query_ast::{JsonMap, Selection};
use crate::query_executor::{
    ForwardedHeaders, ServiceExecution, ServiceExecutionParameters, ServiceExecutionResult,
};
use crate::query_transformer::TopLevelField;
use crate::schema::Schema;
use crate::schema_registry::{FederatedSchema, Service, ServiceDefinition};
use crate::GraphQLRequest;

type Respond =
    Box<dyn Fn(&ServiceExecutionParameters) -> Result<ServiceExecutionResult, BoxError> + Send + Sync>;

/// A service transport answering from a closure and remembering what it was sent.
pub struct FnExecution {
    respond: Respond,
    calls: Mutex<Vec<(String, JsonMap)>>,
}

impl FnExecution {
    pub fn new(
        respond: impl Fn(&ServiceExecutionParameters) -> Result<ServiceExecutionResult, BoxError>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(FnExecution {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn empty() -> Arc<Self> {
        Self::new(|_| Ok(ServiceExecutionResult::default()))
    }

    pub fn queries(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(query, _)| query.clone()).collect()
    }

    pub fn variables(&self) -> Vec<JsonValue> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, variables)| JsonValue::Object(variables.clone()))
            .collect()
    }
}

#[async_trait]
impl ServiceExecution for FnExecution {
    async fn execute(
        &self,
        parameters: ServiceExecutionParameters,
    ) -> Result<ServiceExecutionResult, BoxError> {
        self.calls
            .lock()
            .unwrap()
            .push((parameters.query.clone(), parameters.variables.clone()));
        (self.respond)(&parameters)
    }
}

/// A service that always answers with `data`.
pub fn reply(data: JsonValue) -> Arc<FnExecution> {
    FnExecution::new(move |_| {
        Ok(ServiceExecutionResult {
            data: data.as_object().cloned(),
            ..Default::default()
        })
    })
}

pub type TestService<'a> = (&'a str, &'a str, Option<&'a str>, Arc<FnExecution>);

pub fn schema(services: &[TestService<'_>]) -> Arc<FederatedSchema> {
    let definitions = services
        .iter()
        .map(|(name, sdl, underlying, execution)| {
            let mut definition = ServiceDefinition::new(*name, *sdl);
            if let Some(underlying) = underlying {
                definition = definition.with_underlying_schema(*underlying);
            }
            (definition, execution.clone() as Arc<dyn ServiceExecution>)
        })
        .collect();
    Arc::new(FederatedSchema::build(definitions).unwrap())
}

pub async fn context(services: &[TestService<'_>], query: &str) -> ExecutionContext {
    context_with(services, query, JsonValue::Null, GatewayHooks::default()).await
}

pub async fn context_with(
    services: &[TestService<'_>],
    query: &str,
    variables: JsonValue,
    hooks: GatewayHooks,
) -> ExecutionContext {
    let request = GraphQLRequest {
        query: query.to_string(),
        variables: Some(variables),
        ..Default::default()
    };
    let caller: CallerContext = Arc::new(ForwardedHeaders::new());
    ExecutionContext::new(schema(services), hooks, &request, caller).unwrap()
}

pub fn service(ctx: &ExecutionContext, name: &str) -> Arc<Service> {
    ctx.schema.service(name).unwrap().clone()
}

/// The operation's top-level fields, untouched.
pub fn top_level_fields(ctx: &ExecutionContext) -> Vec<TopLevelField> {
    ctx.operation
        .selection_set
        .iter()
        .filter_map(|selection| match selection {
            Selection::Field(field) => Some(TopLevelField::new(field.clone())),
            _ => None,
        })
        .collect()
}

struct DenyFields(Vec<String>);

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
            .contains(&field.field_name)
            .then(|| GraphQLError::new(format!("access to '{}' is denied", field.field_name))))
    }
}

/// Hooks denying every field with one of the given names.
pub fn deny_fields(names: &[&str]) -> GatewayHooks {
    GatewayHooks::default().with_authorizer(DenyFields(
        names.iter().map(|name| name.to_string()).collect(),
    ))
}
