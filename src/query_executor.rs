use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::json;
use tracing::{Instrument, debug, info_span, warn};

use crate::error::{BoxError, GatewayError, GraphQLError};
use crate::federation_gateway::ExecutionContext;
use crate::hooks::ServiceContext;
use crate::query_ast::{FragmentDefinition, JsonMap, OperationDefinition};
use crate::query_transformer::QueryTransformationResult;
use crate::result_tree::{ExecutionResultNode, ResultPath};
use crate::schema_registry::Service;
use crate::service_result::ServiceResultConverter;

/// One call to an underlying service.
#[derive(Clone)]
pub struct ServiceExecutionParameters {
    /// The printed document, ready to send.
    pub query: String,
    pub variables: JsonMap,
    pub operation: OperationDefinition,
    pub fragments: IndexMap<String, FragmentDefinition>,
    pub service_context: ServiceContext,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServiceExecutionResult {
    pub data: Option<JsonMap>,
    pub errors: Vec<JsonMap>,
    pub extensions: JsonMap,
}

/// Transport to one underlying service.
#[async_trait]
pub trait ServiceExecution: Send + Sync {
    async fn execute(
        &self,
        parameters: ServiceExecutionParameters,
    ) -> Result<ServiceExecutionResult, BoxError>;
}

/// Wraps a service's transport with a tracing span and timing.
pub struct InstrumentedServiceExecution {
    service: String,
    inner: Arc<dyn ServiceExecution>,
}

impl InstrumentedServiceExecution {
    pub fn new(service: impl Into<String>, inner: Arc<dyn ServiceExecution>) -> Self {
        InstrumentedServiceExecution {
            service: service.into(),
            inner,
        }
    }
}

#[async_trait]
impl ServiceExecution for InstrumentedServiceExecution {
    async fn execute(
        &self,
        parameters: ServiceExecutionParameters,
    ) -> Result<ServiceExecutionResult, BoxError> {
        let span = info_span!("service_execution", service = %self.service);
        async {
            let started = Instant::now();
            let result = self.inner.execute(parameters).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(response) => debug!(
                    elapsed_ms,
                    errors = response.errors.len(),
                    "service call completed"
                ),
                Err(e) => warn!(elapsed_ms, error = %e, "service call failed"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

/// Headers forwarded to services when the service context carries them.
pub type ForwardedHeaders = HashMap<String, String>;

pub struct HttpServiceExecution {
    client: reqwest::Client,
    url: String,
}

impl HttpServiceExecution {
    pub fn new(url: impl Into<String>) -> Self {
        HttpServiceExecution {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl ServiceExecution for HttpServiceExecution {
    async fn execute(
        &self,
        parameters: ServiceExecutionParameters,
    ) -> Result<ServiceExecutionResult, BoxError> {
        let request_body = json!({
            "query": parameters.query,
            "variables": parameters.variables,
            "operationName": parameters.operation.name,
        });

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&request_body);
        if let Some(headers) = parameters.service_context.downcast_ref::<ForwardedHeaders>() {
            for (name, value) in headers {
                request = request.header(name, value);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| format!("Failed to send request to {}: {}", self.url, e))?
            .error_for_status()?;

        let result = response
            .json::<ServiceExecutionResult>()
            .await
            .map_err(|e| format!("Failed to parse response from {}: {}", self.url, e))?;
        Ok(result)
    }
}

/// The single boundary where service faults become localized errors.
pub struct ServiceExecutor<'a> {
    ctx: &'a ExecutionContext,
}

impl<'a> ServiceExecutor<'a> {
    pub fn new(ctx: &'a ExecutionContext) -> Self {
        ServiceExecutor { ctx }
    }

    /// Calls the service and returns its result as a tree typed by the service's own schema.
    ///
    /// A failing call yields an empty root carrying a `ServiceInvocationFault` at `path`.
    pub async fn execute(
        &self,
        service: &Service,
        transformed: &QueryTransformationResult,
        service_context: ServiceContext,
        path: &ResultPath,
    ) -> Result<ExecutionResultNode, GatewayError> {
        let operation = transformed.document.operation(None)?;
        let root_type = service
            .underlying_schema
            .root_type_name(operation.kind)
            .unwrap_or("Query")
            .to_string();
        let converter = ServiceResultConverter::new(
            &service.underlying_schema,
            &transformed.document,
            &self.ctx.variables,
            &self.ctx.hint_alias,
        )?;

        let parameters = ServiceExecutionParameters {
            query: transformed.document.to_string(),
            variables: transformed.referenced_variables.clone(),
            operation: operation.clone(),
            fragments: transformed.document.fragments.clone(),
            service_context,
        };

        match service.execution.execute(parameters).await {
            Ok(response) => {
                let mut root = converter.convert(&root_type, response.data);
                root.header.errors = response
                    .errors
                    .into_iter()
                    .map(|error| GraphQLError::from_service_error(&service.name, error))
                    .collect();
                if let Some(extensions) = root.extensions_mut() {
                    extensions.extend(response.extensions);
                }
                Ok(root)
            }
            Err(reason) => {
                let mut root = ExecutionResultNode::root(&root_type, Vec::new());
                root.header.errors.push(GraphQLError::service_invocation_fault(
                    &service.name,
                    &reason.to_string(),
                    path,
                ));
                Ok(root)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FnExecution, context, service, top_level_fields};
    use crate::query_transformer::QueryTransformer;
    use serde_json::json;

    const SDL: &str = "type Query { hello: String }";

    #[tokio::test]
    async fn faults_become_errors_at_the_field_path() {
        let failing = FnExecution::new(|_| Err("connection refused".into()));
        let ctx = context(&[("greeter", SDL, None, failing)], "{ hello }").await;
        let greeter = service(&ctx, "greeter");
        let transformed = QueryTransformer::new(&ctx, &greeter, &Default::default())
            .transform(top_level_fields(&ctx))
            .unwrap();
        let path = ResultPath::root().with_key("hello");

        let root = ServiceExecutor::new(&ctx)
            .execute(&greeter, &transformed, ctx.caller_context.clone(), &path)
            .await
            .unwrap();

        assert!(root.children().is_empty());
        assert_eq!(root.header.errors.len(), 1);
        assert_eq!(root.header.errors[0].kind(), Some("ServiceInvocationFault"));
        assert_eq!(root.header.errors[0].path, Some(path));
        assert_eq!(root.header.errors[0].extensions["service"], json!("greeter"));
    }

    #[tokio::test]
    async fn service_errors_are_attached_to_the_root() {
        let answering = FnExecution::new(|_| {
            Ok(ServiceExecutionResult {
                data: json!({ "hello": "hi" }).as_object().cloned(),
                errors: vec![json!({ "message": "partial" }).as_object().cloned().unwrap()],
                extensions: JsonMap::new(),
            })
        });
        let ctx = context(&[("greeter", SDL, None, answering)], "{ hello }").await;
        let greeter = service(&ctx, "greeter");
        let transformed = QueryTransformer::new(&ctx, &greeter, &Default::default())
            .transform(top_level_fields(&ctx))
            .unwrap();

        let root = ServiceExecutor::new(&ctx)
            .execute(&greeter, &transformed, ctx.caller_context.clone(), &ResultPath::root())
            .await
            .unwrap();

        assert_eq!(root.to_data(), json!({ "hello": "hi" }));
        assert_eq!(root.header.errors[0].message, "partial");
        assert_eq!(root.header.errors[0].kind(), Some("ServiceError"));
    }
}
