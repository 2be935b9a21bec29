pub mod config;
pub mod error;
pub mod federation_gateway;
pub mod field_authorization;
pub mod hooks;
pub mod hydration;
pub mod normalized_query;
pub mod query_ast;
pub mod query_executor;
pub mod query_planner;
pub mod query_transformer;
pub mod result_transformer;
pub mod result_tree;
pub mod schema;
pub mod schema_registry;
pub mod service_result;
pub mod transformations;

#[cfg(test)]
mod test_support;

pub use config::GatewayConfig;
pub use error::{GatewayError, GraphQLError};
pub use federation_gateway::{ExecutionContext, FederationGateway};
pub use hooks::GatewayHooks;
pub use query_executor::{HttpServiceExecution, ServiceExecution};
pub use query_planner::OwnershipQueryPlanner;
pub use schema_registry::{InMemorySchemaRegistry, ServiceDefinition};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Value>,
    #[serde(default, rename = "operationName", alias = "operation_name")]
    pub operation_name: Option<String>,
    #[serde(skip)]
    pub auth_headers: Option<HashMap<String, String>>,
}

#[derive(Serialize, Debug, Default, Clone, PartialEq)]
pub struct GraphQLResponse {
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}
