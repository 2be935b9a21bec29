use futures::future::try_join_all;
use serde_json::{Value, json};
use std::{path::Path, sync::Arc};
use tokio::sync::RwLock;
use tracing::{Instrument, debug, info_span, trace, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GraphQLError};
use crate::field_authorization::{FieldAuthorizationScanner, ForbiddenFields};
use crate::hooks::{CallerContext, GatewayHooks};
use crate::hydration::HydrationResolver;
use crate::normalized_query::{NormalizedField, NormalizedQuery};
use crate::query_ast::{
    FieldIdGenerator, JsonMap, OperationDefinition, OperationKind, QueryDocument, value_to_json,
};
use crate::query_executor::{ForwardedHeaders, HttpServiceExecution, ServiceExecution, ServiceExecutor};
use crate::query_planner::{PlannedField, QueryPlanner};
use crate::query_transformer::QueryTransformer;
use crate::result_transformer::{ResultCounters, ResultTransformer};
use crate::result_tree::{ExecutionResultNode, NodeHeader, NodeKind, ResultPath, merge_trees};
use crate::schema_registry::{FederatedSchema, SchemaRegistry, ServiceDefinition};
use crate::{GraphQLRequest, GraphQLResponse};

/// Everything one request shares between planning, transformation and reassembly.
pub struct ExecutionContext {
    pub schema: Arc<FederatedSchema>,
    pub hooks: GatewayHooks,
    pub document: QueryDocument,
    pub operation: OperationDefinition,
    /// Request variables with declared defaults applied.
    pub variables: JsonMap,
    pub normalized: NormalizedQuery,
    pub ids: FieldIdGenerator,
    /// Alias of injected `__typename` selections; random per request.
    pub hint_alias: String,
    /// Alias of the identifier injected into batched hydration queries.
    pub object_identifier_alias: String,
    pub caller_context: CallerContext,
    root_type: String,
}

impl ExecutionContext {
    pub fn new(
        schema: Arc<FederatedSchema>,
        hooks: GatewayHooks,
        request: &GraphQLRequest,
        caller_context: CallerContext,
    ) -> Result<Self, GatewayError> {
        let ids = FieldIdGenerator::new();
        let document = QueryDocument::parse(&request.query, &ids)?;
        let operation = document
            .operation(request.operation_name.as_deref())?
            .clone();
        if operation.kind == OperationKind::Subscription {
            return Err(GatewayError::UnsupportedOperation(
                "subscriptions are not supported".to_string(),
            ));
        }
        let variables = coerce_variables(&operation, request.variables.as_ref())?;
        let normalized = NormalizedQuery::new(&schema.overall, &document, &operation, &variables)?;
        let root_type = schema
            .overall
            .root_type_name(operation.kind)
            .ok_or_else(|| {
                GatewayError::UnsupportedOperation(format!("schema has no {} type", operation.kind))
            })?
            .to_string();
        let suffix = Uuid::new_v4().simple().to_string();

        Ok(ExecutionContext {
            schema,
            hooks,
            document,
            operation,
            variables,
            normalized,
            ids,
            hint_alias: format!("typename__{suffix}"),
            object_identifier_alias: format!("object_identifier__{suffix}"),
            caller_context,
            root_type,
        })
    }

    pub fn root_type_name(&self) -> &str {
        &self.root_type
    }
}

fn coerce_variables(
    operation: &OperationDefinition,
    provided: Option<&Value>,
) -> Result<JsonMap, GatewayError> {
    let mut variables = match provided {
        None | Some(Value::Null) => JsonMap::new(),
        Some(Value::Object(variables)) => variables.clone(),
        Some(other) => {
            return Err(GatewayError::InvalidVariables(format!(
                "expected an object, got {other}"
            )));
        }
    };
    for definition in &operation.variable_definitions {
        if let Some(default) = &definition.default_value {
            if !variables.contains_key(&definition.name) {
                variables.insert(
                    definition.name.clone(),
                    value_to_json(default, &JsonMap::new()),
                );
            }
        }
    }
    Ok(variables)
}

pub struct FederationGateway {
    schema_registry: Arc<RwLock<Box<dyn SchemaRegistry + Send + Sync>>>,
    query_planner: Arc<Box<dyn QueryPlanner + Send + Sync>>,
    hooks: GatewayHooks,
}

impl FederationGateway {
    pub fn new(
        schema_registry: Box<dyn SchemaRegistry + Send + Sync>,
        query_planner: Box<dyn QueryPlanner + Send + Sync>,
        hooks: GatewayHooks,
    ) -> Self {
        FederationGateway {
            schema_registry: Arc::new(RwLock::new(schema_registry)),
            query_planner: Arc::new(query_planner),
            hooks,
        }
    }

    /// Runs a request whose caller context is the forwarded authentication headers.
    pub async fn process_request(
        &self,
        request: GraphQLRequest,
    ) -> Result<GraphQLResponse, GatewayError> {
        let headers: ForwardedHeaders = request.auth_headers.clone().unwrap_or_default();
        self.process_request_with_context(request, Arc::new(headers))
            .await
    }

    pub async fn process_request_with_context(
        &self,
        request: GraphQLRequest,
        caller_context: CallerContext,
    ) -> Result<GraphQLResponse, GatewayError> {
        let schema_registry = self.schema_registry.read().await;
        let schema = schema_registry.get_schema().await?;
        drop(schema_registry);

        let ctx = ExecutionContext::new(schema, self.hooks.clone(), &request, caller_context)?;
        let span = info_span!(
            "gateway_request",
            operation = ctx.operation.name.as_deref().unwrap_or("anonymous"),
            kind = %ctx.operation.kind,
        );
        let result = execute(&ctx, &**self.query_planner)
            .instrument(span)
            .await;
        if let Err(e) = &result {
            warn!(error = %e, "request failed");
        }
        result
    }

    pub async fn register_service(
        &self,
        service: ServiceDefinition,
        execution: Arc<dyn ServiceExecution>,
    ) -> Result<(), GatewayError> {
        let mut schema_registry = self.schema_registry.write().await;
        schema_registry.register_service(service, execution).await
    }

    /// Registers every configured service behind an HTTP transport.
    pub async fn load_schemas(
        &self,
        config: &GatewayConfig,
        base_dir: &Path,
    ) -> Result<(), GatewayError> {
        for service in config.service_definitions(base_dir)? {
            debug!(service = %service.definition.name, url = %service.routing_url, "registering service");
            let execution = Arc::new(HttpServiceExecution::new(service.routing_url));
            self.register_service(service.definition, execution).await?;
        }
        // Surface schema errors at startup rather than on the first request.
        let schema_registry = self.schema_registry.read().await;
        schema_registry.get_schema().await?;
        Ok(())
    }
}

async fn execute(
    ctx: &ExecutionContext,
    planner: &(dyn QueryPlanner + Send + Sync),
) -> Result<GraphQLResponse, GatewayError> {
    let (root, counters) = resolve(ctx, planner).await?;
    Ok(response(root, &counters))
}

/// Dispatches the planned fields and hydrates the merged tree until no placeholder is left.
async fn resolve(
    ctx: &ExecutionContext,
    planner: &(dyn QueryPlanner + Send + Sync),
) -> Result<(ExecutionResultNode, ResultCounters), GatewayError> {
    let forbidden = FieldAuthorizationScanner::new(ctx).scan_operation().await?;
    let planned = planner.plan_query(ctx, &forbidden).await?;
    debug!(fields = planned.len(), "dispatching planned fields");

    let dispatched =
        try_join_all(planned.into_iter().map(|field| dispatch(ctx, &forbidden, field))).await?;
    let mut counters = ResultCounters::default();
    let mut trees = Vec::with_capacity(dispatched.len());
    for (tree, tree_counters) in dispatched {
        counters.merge(tree_counters);
        trees.push(tree);
    }

    let mut root = merge_trees(trees)?;
    restore_query_order(ctx, &mut root);

    let resolver = HydrationResolver::new(ctx, &forbidden);
    let max_rounds = ctx.normalized.max_level() + 1;
    let mut round = 0;
    loop {
        let placeholders: Vec<_> = root
            .placeholders()
            .into_iter()
            .map(|(header, input)| (header.clone(), input.clone()))
            .collect();
        if placeholders.is_empty() {
            break;
        }
        round += 1;
        if round > max_rounds {
            return Err(GatewayError::HydrationRoundsExceeded(max_rounds));
        }
        debug!(round, placeholders = placeholders.len(), "hydration round");
        let (mut replacements, round_counters) = resolver.resolve(placeholders).await?;
        counters.merge(round_counters);
        root = root.replace_placeholders(&mut replacements);
    }

    Ok((root, counters))
}

/// Sorts merged top-level fields, and the fields of namespaces split across services, back into
/// query order.
fn restore_query_order(ctx: &ExecutionContext, root: &mut ExecutionResultNode) {
    let root_type = ctx.root_type_name();
    let Some(children) = root.children_mut() else {
        return;
    };
    children.sort_by_key(|child| {
        query_position(ctx.normalized.find_child(None, root_type, &child.header.result_key))
    });

    for child in children.iter_mut() {
        let Some(namespace) = ctx
            .normalized
            .find_child(None, root_type, &child.header.result_key)
            .filter(|field| ctx.schema.is_namespaced(root_type, &field.field_name))
        else {
            continue;
        };
        if let NodeKind::Object {
            resolved_type,
            children,
        } = &mut child.kind
        {
            let object_type = resolved_type.as_str();
            children.sort_by_key(|field| {
                query_position(ctx.normalized.find_child(
                    Some(namespace.id),
                    object_type,
                    &field.header.result_key,
                ))
            });
        }
    }
}

fn query_position(field: Option<&NormalizedField>) -> usize {
    field.map_or(usize::MAX, |field| field.position)
}

async fn dispatch(
    ctx: &ExecutionContext,
    forbidden: &ForbiddenFields,
    planned: PlannedField,
) -> Result<(ExecutionResultNode, ResultCounters), GatewayError> {
    let root_type = ctx.root_type_name();
    match planned {
        PlannedField::Typename { field } => {
            let field = ctx.normalized.get(field);
            let header = NodeHeader::for_field(field, ResultPath::root().with_key(&field.result_key));
            let leaf = ExecutionResultNode::leaf(header, json!(root_type));
            Ok((ExecutionResultNode::root(root_type, vec![leaf]), ResultCounters::default()))
        }
        PlannedField::EarlyFailure { field, error } => {
            let field = ctx.normalized.get(field);
            let path = ResultPath::root().with_key(&field.result_key);
            let header = NodeHeader::for_field(field, path.clone()).with_errors(vec![error.or_path(&path)]);
            let null = ExecutionResultNode::null(header);
            Ok((ExecutionResultNode::root(root_type, vec![null]), ResultCounters::default()))
        }
        PlannedField::Service {
            service,
            field,
            service_context,
        } => {
            let normalized = ctx
                .normalized
                .find(&[field.field.id], None, root_type)
                .ok_or_else(|| {
                    GatewayError::SchemaMismatch(format!(
                        "top-level field '{}' is not part of the operation",
                        field.field.result_key()
                    ))
                })?;
            let path = ResultPath::root().with_key(&normalized.result_key);
            let transformed = QueryTransformer::new(ctx, &service, forbidden).transform(vec![field])?;

            if transformed.transformed_fields.is_empty() {
                let error = transformed
                    .removed
                    .error_for(normalized.id)
                    .cloned()
                    .unwrap_or_else(|| {
                        GraphQLError::authorization_denied(format!(
                            "access to '{}' is denied",
                            normalized.field_name
                        ))
                    })
                    .with_path(path.clone());
                let header = NodeHeader::for_field(normalized, path).with_errors(vec![error]);
                let null = ExecutionResultNode::null(header);
                return Ok((ExecutionResultNode::root(root_type, vec![null]), ResultCounters::default()));
            }

            let result = ServiceExecutor::new(ctx)
                .execute(&service, &transformed, service_context.clone(), &path)
                .await?;
            let node_count = result.count_nodes();
            let mut transformer = ResultTransformer::new(ctx, &service, &transformed);
            let tree = if transformed.is_passthrough() {
                trace!(service = %service.name, "result passes through unchanged");
                transformer.passthrough(result)?
            } else {
                transformer.unapply_root(result)?
            };
            let mut counters = transformer.into_counters();
            counters.count_service_nodes(&service.name, node_count);

            let tree = match &ctx.hooks.result_rewriter {
                Some(rewriter) => rewriter
                    .rewrite_result(&service, &service_context, tree)
                    .await
                    .map_err(|reason| GatewayError::ResultRewrite {
                        service: service.name.clone(),
                        reason,
                    })?,
                None => tree,
            };
            Ok((tree, counters))
        }
    }
}

fn response(root: ExecutionResultNode, counters: &ResultCounters) -> GraphQLResponse {
    let mut errors = Vec::new();
    root.collect_errors(&mut errors);
    let mut extensions = match &root.kind {
        NodeKind::Root { extensions, .. } => extensions.clone(),
        _ => JsonMap::new(),
    };
    extensions.insert("resultComplexity".to_string(), counters.to_extension());

    GraphQLResponse {
        data: Some(root.to_data()),
        errors,
        extensions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_planner::OwnershipQueryPlanner;
    use crate::schema_registry::InMemorySchemaRegistry;
    use crate::query_executor::ServiceExecutionResult;
    use crate::result_tree::PathSegment;
    use crate::test_support::{FnExecution, context, reply};
    use pretty_assertions::assert_eq;

    async fn gateway(services: Vec<(&str, &str, Arc<FnExecution>)>) -> FederationGateway {
        let gateway = FederationGateway::new(
            Box::new(InMemorySchemaRegistry::new()),
            Box::new(OwnershipQueryPlanner::new()),
            GatewayHooks::default(),
        );
        for (name, sdl, execution) in services {
            gateway
                .register_service(ServiceDefinition::new(name, sdl), execution)
                .await
                .unwrap();
        }
        gateway
    }

    fn request(query: &str) -> GraphQLRequest {
        GraphQLRequest {
            query: query.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn top_level_typename_needs_no_service() {
        let execution = FnExecution::empty();
        let gateway = gateway(vec![("a", "type Query { a: String }", execution.clone())]).await;

        let response = gateway.process_request(request("{ __typename }")).await.unwrap();

        assert_eq!(response.data, Some(json!({ "__typename": "Query" })));
        assert!(execution.queries().is_empty());
    }

    #[tokio::test]
    async fn fields_of_different_services_are_merged_in_query_order() {
        let gateway = gateway(vec![
            ("a", "type Query { a: String }", reply(json!({ "a": "from a" }))),
            ("b", "type Query { b: Int }", reply(json!({ "b": 2 }))),
        ])
        .await;

        let response = gateway.process_request(request("{ b a }")).await.unwrap();

        assert_eq!(response.data, Some(json!({ "b": 2, "a": "from a" })));
        assert_eq!(
            response.extensions["resultComplexity"],
            json!({
                "serviceNodeCounts": { "b": 1, "a": 1 },
                "totalFieldRenameCount": 0,
                "totalTypeRenameCount": 0
            })
        );
    }

    #[tokio::test]
    async fn variables_take_declared_defaults_and_subscriptions_are_rejected() {
        let execution = reply(json!({ "greet": "hi" }));
        let gateway = gateway(vec![(
            "a",
            "type Query { greet(name: String): String } type Subscription { ticks: Int }",
            execution.clone(),
        )])
        .await;

        gateway
            .process_request(request(r#"query($name: String = "Ann") { greet(name: $name) }"#))
            .await
            .unwrap();
        assert_eq!(execution.variables(), vec![json!({ "name": "Ann" })]);

        let error = gateway
            .process_request(request("subscription { ticks }"))
            .await
            .unwrap_err();
        assert!(matches!(error, GatewayError::UnsupportedOperation(_)));
    }

    const ISSUES: &str = r#"
        type Query { issues: [Issue] }
        type Issue {
            id: ID
            reporter: User @hydrated(
                service: "users"
                field: "userById"
                arguments: [{ name: "id", value: "$source.reporterId" }]
            )
            watchers: [User] @hydrated(
                service: "users"
                field: "usersByIds"
                arguments: [{ name: "ids", value: "$source.watcherIds" }]
                identifiedBy: "id"
            )
        }
        type User { id: ID name: String }
    "#;
    const ISSUES_UNDERLYING: &str =
        "type Query { issues: [Issue] } type Issue { id: ID reporterId: ID watcherIds: [ID] }";
    const USERS: &str = r#"
        type Query { userById(id: ID): User usersByIds(ids: [ID]): [User] }
        type User { id: ID name: String }
    "#;

    fn issues() -> Arc<FnExecution> {
        reply(json!({
            "issues": [
                { "id": "i1", "reporter": "u1", "watchers": ["u1", "u2"] },
                { "id": "i2", "reporter": "u2", "watchers": ["u2"] }
            ]
        }))
    }

    fn user(id: &str, identifier_alias: Option<&str>) -> Value {
        let mut user = JsonMap::new();
        user.insert("id".to_string(), json!(id));
        user.insert("name".to_string(), json!(if id == "u1" { "Ann" } else { "Bob" }));
        if let Some(alias) = identifier_alias {
            user.insert(alias.to_string(), json!(id));
        }
        Value::Object(user)
    }

    /// Answers `userById` and `usersByIds`; `u2` always fails to load its name.
    fn users() -> Arc<FnExecution> {
        FnExecution::new(|parameters| {
            let query = &parameters.query;
            let mut errors = Vec::new();
            let data = if query.contains("usersByIds") {
                let alias = query
                    .find("object_identifier__")
                    .and_then(|start| query[start..].split(':').next())
                    .map(str::trim);
                let mut error = JsonMap::new();
                error.insert("message".to_string(), json!("name unavailable"));
                error.insert("path".to_string(), json!(["usersByIds", 1, "name"]));
                errors.push(error);
                json!({ "usersByIds": [user("u1", alias), user("u2", alias)] })
            } else if query.contains("\"u2\"") {
                let mut error = JsonMap::new();
                error.insert("message".to_string(), json!("name unavailable"));
                error.insert("path".to_string(), json!(["userById", "name"]));
                errors.push(error);
                json!({ "userById": user("u2", None) })
            } else {
                json!({ "userById": user("u1", None) })
            };
            Ok(ServiceExecutionResult {
                data: data.as_object().cloned(),
                errors,
                ..Default::default()
            })
        })
    }

    fn misplaced(node: &ExecutionResultNode, out: &mut Vec<String>) {
        let in_list = matches!(node.kind, NodeKind::List { .. });
        for (index, child) in node.children().iter().enumerate() {
            let expected = if in_list {
                node.header.path.with_index(index)
            } else {
                node.header.path.with_key(&child.header.result_key)
            };
            if child.header.path != expected {
                out.push(format!("{} instead of {}", child.header.path, expected));
            }
            misplaced(child, out);
        }
    }

    #[tokio::test]
    async fn hydrated_subtrees_sit_at_the_path_of_the_field_they_resolve() {
        let ctx = context(
            &[
                ("issues", ISSUES, Some(ISSUES_UNDERLYING), issues()),
                ("users", USERS, None, users()),
            ],
            "{ issues { id reporter { name } watchers { id name } } }",
        )
        .await;

        let (root, _) = resolve(&ctx, &OwnershipQueryPlanner::new()).await.unwrap();

        let mut out = Vec::new();
        misplaced(&root, &mut out);
        assert_eq!(out, Vec::<String>::new());
        assert!(root.placeholders().is_empty());
        assert_eq!(
            root.to_data()["issues"][0]["watchers"][1],
            json!({ "id": "u2", "name": "Bob" })
        );
    }

    #[tokio::test]
    async fn errors_of_hydration_calls_point_into_the_client_response() {
        let ctx = context(
            &[
                ("issues", ISSUES, Some(ISSUES_UNDERLYING), issues()),
                ("users", USERS, None, users()),
            ],
            "{ issues { reporter { name } watchers { name } } }",
        )
        .await;

        let (root, _) = resolve(&ctx, &OwnershipQueryPlanner::new()).await.unwrap();
        let mut errors = Vec::new();
        root.collect_errors(&mut errors);
        let mut paths: Vec<String> = errors
            .iter()
            .filter_map(|error| error.path.as_ref().map(ToString::to_string))
            .collect();
        paths.sort();

        assert_eq!(
            paths,
            vec![
                "/issues/0/watchers/1/name".to_string(),
                "/issues/1/reporter/name".to_string(),
            ]
        );
        assert!(errors.iter().all(|error| {
            error.path.as_ref().and_then(|path| path.segments().first())
                == Some(&PathSegment::Key("issues".to_string()))
        }));
    }
}
