//! Capabilities the gateway consumes from its embedder.
//!
//! Each hook is a separate trait object injected through [`GatewayHooks`]; the orchestrator only
//! calls the ones that were configured.
use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{BoxError, GraphQLError};
use crate::normalized_query::NormalizedField;
use crate::query_ast::{JsonMap, Value};
use crate::result_tree::ExecutionResultNode;
use crate::schema::Schema;
use crate::schema_registry::Service;

/// Opaque per-request value handed through to every hook.
pub type CallerContext = Arc<dyn Any + Send + Sync>;

/// Opaque per-service-call value produced by [`ServiceContextFactory`].
pub type ServiceContext = Arc<dyn Any + Send + Sync>;

#[async_trait]
pub trait FieldAuthorizer: Send + Sync {
    /// Returns the error to report in place of the field when it is forbidden.
    async fn authorize(
        &self,
        field: &NormalizedField,
        variables: &JsonMap,
        schema: &Schema,
        caller: &CallerContext,
    ) -> Result<Option<GraphQLError>, BoxError>;
}

pub struct AllowAllFields;

#[async_trait]
impl FieldAuthorizer for AllowAllFields {
    async fn authorize(
        &self,
        _field: &NormalizedField,
        _variables: &JsonMap,
        _schema: &Schema,
        _caller: &CallerContext,
    ) -> Result<Option<GraphQLError>, BoxError> {
        Ok(None)
    }
}

/// Picks the service for a top-level field declared `@dynamicServiceResolution`.
#[async_trait]
pub trait ServiceResolver: Send + Sync {
    async fn resolve_service(
        &self,
        services: &[Arc<Service>],
        field: &NormalizedField,
        caller: &CallerContext,
    ) -> Result<Arc<Service>, GraphQLError>;
}

#[async_trait]
pub trait ServiceContextFactory: Send + Sync {
    async fn create_service_context(
        &self,
        service: &Service,
        caller: &CallerContext,
    ) -> Result<ServiceContext, BoxError>;
}

/// Hands every service call the caller context itself.
pub struct ForwardCallerContext;

#[async_trait]
impl ServiceContextFactory for ForwardCallerContext {
    async fn create_service_context(
        &self,
        _service: &Service,
        caller: &CallerContext,
    ) -> Result<ServiceContext, BoxError> {
        Ok(caller.clone())
    }
}

/// Rewrites one service's reassembled result before it is merged.
#[async_trait]
pub trait ResultRewriter: Send + Sync {
    async fn rewrite_result(
        &self,
        service: &Service,
        context: &ServiceContext,
        result: ExecutionResultNode,
    ) -> Result<ExecutionResultNode, BoxError>;
}

/// Rewrites argument values while a query is transformed for a service.
pub trait ArgumentRewriter: Send + Sync {
    fn rewrite_argument(
        &self,
        service: &Service,
        parent_type: &str,
        field_name: &str,
        argument_name: &str,
        value: Value,
    ) -> Value;
}

#[derive(Clone)]
pub struct GatewayHooks {
    pub authorizer: Arc<dyn FieldAuthorizer>,
    pub service_context_factory: Arc<dyn ServiceContextFactory>,
    pub service_resolver: Option<Arc<dyn ServiceResolver>>,
    pub result_rewriter: Option<Arc<dyn ResultRewriter>>,
    pub argument_rewriter: Option<Arc<dyn ArgumentRewriter>>,
}

impl Default for GatewayHooks {
    fn default() -> Self {
        GatewayHooks {
            authorizer: Arc::new(AllowAllFields),
            service_context_factory: Arc::new(ForwardCallerContext),
            service_resolver: None,
            result_rewriter: None,
            argument_rewriter: None,
        }
    }
}

impl GatewayHooks {
    pub fn with_authorizer(mut self, authorizer: impl FieldAuthorizer + 'static) -> Self {
        self.authorizer = Arc::new(authorizer);
        self
    }

    pub fn with_service_context_factory(
        mut self,
        factory: impl ServiceContextFactory + 'static,
    ) -> Self {
        self.service_context_factory = Arc::new(factory);
        self
    }

    pub fn with_service_resolver(mut self, resolver: impl ServiceResolver + 'static) -> Self {
        self.service_resolver = Some(Arc::new(resolver));
        self
    }

    pub fn with_result_rewriter(mut self, rewriter: impl ResultRewriter + 'static) -> Self {
        self.result_rewriter = Some(Arc::new(rewriter));
        self
    }

    pub fn with_argument_rewriter(mut self, rewriter: impl ArgumentRewriter + 'static) -> Self {
        self.argument_rewriter = Some(Arc::new(rewriter));
        self
    }
}
