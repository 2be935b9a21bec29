//! Gateway errors.
//!
//! Two families live here: [`GatewayError`] is fatal and aborts the whole request, while
//! [`GraphQLError`] is a localized, client-visible error attached to a node of the result tree.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::result_tree::{PathSegment, ResultPath};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Faults that fail a request as a whole.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to parse query: {0}")]
    QueryParse(String),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("operation name is required when the document contains several operations")]
    AmbiguousOperation,

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("invalid variables: {0}")]
    InvalidVariables(String),

    #[error("failed to parse schema: {0}")]
    SchemaParse(String),

    /// A renamed type or field could not be found where the declarations say it lives.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Two per-service results claimed the same result key with non-object values.
    #[error("cannot merge non-object values under result key '{0}'")]
    MergeConflict(String),

    #[error("no service owns field '{0}'")]
    NoServiceForField(String),

    #[error("hydration did not settle after {0} rounds")]
    HydrationRoundsExceeded(usize),

    #[error("authorization decision failed: {0}")]
    Authorization(BoxError),

    #[error("failed to create service context for '{service}': {reason}")]
    ServiceContext { service: String, reason: BoxError },

    #[error("result rewrite failed for '{service}': {reason}")]
    ResultRewrite { service: String, reason: BoxError },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// Classification written to `extensions.classification` of localized errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    AuthorizationDenied,
    ServiceInvocationFault,
    DynamicResolutionFailure,
    ServiceError,
}

impl ErrorKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthorizationDenied => "AuthorizationDenied",
            ErrorKind::ServiceInvocationFault => "ServiceInvocationFault",
            ErrorKind::DynamicResolutionFailure => "DynamicResolutionFailure",
            ErrorKind::ServiceError => "ServiceError",
        }
    }
}

/// A GraphQL error as it appears in the `errors` list of a response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<ResultPath>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        GraphQLError {
            message: message.into(),
            path: None,
            extensions: Map::new(),
        }
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.extensions
            .insert("classification".to_string(), kind.as_str().into());
        self
    }

    pub fn with_path(mut self, path: ResultPath) -> Self {
        self.path = Some(path);
        self
    }

    /// Sets the path unless the error already points somewhere.
    pub fn or_path(mut self, path: &ResultPath) -> Self {
        if self.path.is_none() {
            self.path = Some(path.clone());
        }
        self
    }

    /// Moves a path reported under the top-level field `key` of a service call onto `onto`.
    pub fn rebased_from(mut self, key: &str, onto: &ResultPath) -> Self {
        if let Some(path) = &self.path {
            if path.segments().first() == Some(&PathSegment::Key(key.to_string())) {
                self.path = Some(path.rebased(1, onto));
            }
        }
        self
    }

    pub fn kind(&self) -> Option<&str> {
        self.extensions.get("classification").and_then(Value::as_str)
    }

    pub fn authorization_denied(message: impl Into<String>) -> Self {
        GraphQLError::new(message).with_kind(ErrorKind::AuthorizationDenied)
    }

    pub fn service_invocation_fault(service: &str, reason: &str, path: &ResultPath) -> Self {
        let mut error = GraphQLError::new(format!(
            "An error occurred while calling service '{service}': {reason}"
        ))
        .with_kind(ErrorKind::ServiceInvocationFault)
        .with_path(path.clone());
        error
            .extensions
            .insert("service".to_string(), Value::String(service.to_string()));
        error
    }

    /// Converts an entry of an underlying service's `errors` list.
    pub fn from_service_error(service: &str, raw: Map<String, Value>) -> Self {
        let message = raw
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error reported by service")
            .to_string();
        let path = raw
            .get("path")
            .cloned()
            .and_then(|path| serde_json::from_value::<ResultPath>(path).ok());
        let mut extensions = match raw.get("extensions") {
            Some(Value::Object(extensions)) => extensions.clone(),
            _ => Map::new(),
        };
        extensions
            .entry("classification")
            .or_insert_with(|| ErrorKind::ServiceError.as_str().into());
        extensions.insert("service".to_string(), Value::String(service.to_string()));
        GraphQLError {
            message,
            path,
            extensions,
        }
    }
}

impl From<&GatewayError> for GraphQLError {
    fn from(error: &GatewayError) -> Self {
        GraphQLError::new(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn service_errors_keep_their_path_and_gain_the_service_name() {
        let raw = json!({
            "message": "boom",
            "path": ["issue", 0, "title"],
            "extensions": { "code": "INTERNAL" }
        });
        let Value::Object(raw) = raw else {
            unreachable!()
        };
        let error = GraphQLError::from_service_error("issues", raw);

        assert_eq!(error.message, "boom");
        assert_eq!(
            serde_json::to_value(error.path.as_ref()).unwrap(),
            json!(["issue", 0, "title"])
        );
        assert_eq!(error.extensions["service"], "issues");
        assert_eq!(error.extensions["code"], "INTERNAL");
        assert_eq!(error.kind(), Some("ServiceError"));
    }

    #[test]
    fn paths_under_a_synthetic_field_move_onto_the_real_one() {
        let onto = ResultPath::root().with_key("issue").with_key("reporter");
        let error = GraphQLError::new("x")
            .with_path(ResultPath::root().with_key("userById").with_key("name"))
            .rebased_from("userById", &onto);
        assert_eq!(error.path, Some(onto.with_key("name")));

        let elsewhere = ResultPath::root().with_key("other");
        let error = GraphQLError::new("x")
            .with_path(elsewhere.clone())
            .rebased_from("userById", &onto);
        assert_eq!(error.path, Some(elsewhere));
    }

    #[test]
    fn or_path_does_not_override() {
        let original = ResultPath::root().with_key("a");
        let error = GraphQLError::new("x")
            .with_path(original.clone())
            .or_path(&ResultPath::root().with_key("b"));
        assert_eq!(error.path, Some(original));
    }
}
