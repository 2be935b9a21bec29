//! Declared field renames, type renames and hydrations.
//!
//! Declarations are read from directives in each service's contribution to the overall schema:
//!
//! ```graphql
//! type Issue @renamed(from: "Ticket") {
//!   title: String @renamed(from: "summary")
//!   reporter: User @hydrated(
//!     service: "users"
//!     field: "userById"
//!     arguments: [{ name: "id", value: "$source.reporterId" }]
//!   )
//! }
//! ```
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::GatewayError;
use crate::query_ast::{Directive, Value};
use crate::schema::{Schema, is_list_type};

pub const RENAMED_DIRECTIVE: &str = "renamed";
pub const HYDRATED_DIRECTIVE: &str = "hydrated";
pub const NAMESPACED_DIRECTIVE: &str = "namespaced";
pub const DYNAMIC_SERVICE_DIRECTIVE: &str = "dynamicServiceResolution";

const DEFAULT_OBJECT_IDENTIFIER: &str = "id";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldRename {
    /// Underlying field path; one segment is a plain rename.
    pub underlying_path: Vec<String>,
}

impl FieldRename {
    pub fn underlying_name(&self) -> &str {
        self.underlying_path
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArgumentSource {
    /// `$source.a.b`: a value read from the parent object, as the underlying service returns it.
    ObjectField(Vec<String>),
    /// `$argument.name`: passed through from the arguments of the original field.
    FieldArgument(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteArgument {
    pub name: String,
    pub source: ArgumentSource,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchDeclaration {
    pub batch_size: Option<usize>,
    pub object_identifier: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HydrationDefinition {
    /// `Type.field` in the overall schema, for diagnostics.
    pub name: String,
    pub service: String,
    pub backing_field: String,
    pub arguments: Vec<RemoteArgument>,
    pub backing_field_is_list: bool,
    pub batch: Option<BatchDeclaration>,
}

impl HydrationDefinition {
    pub fn is_batched(&self) -> bool {
        self.backing_field_is_list && self.batch.is_some()
    }

    pub fn source_arguments(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.arguments
            .iter()
            .filter_map(|argument| match &argument.source {
                ArgumentSource::ObjectField(path) => Some((argument.name.as_str(), &path[..])),
                ArgumentSource::FieldArgument(_) => None,
            })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldTransformation {
    Rename(Arc<FieldRename>),
    Hydration(Arc<HydrationDefinition>),
}

/// Build-time table of every declared transformation, shared read-only by all requests.
#[derive(Clone, Debug, Default)]
pub struct TransformationRegistry {
    /// (service, overall type name, field name) -> transformation declared by that service
    fields: HashMap<(String, String, String), FieldTransformation>,
    /// service -> overall type name -> underlying type name
    type_renames: HashMap<String, HashMap<String, String>>,
    /// service -> underlying type name -> overall type name
    reverse_type_renames: HashMap<String, HashMap<String, String>>,
}

/// One service's schemas as seen by the registry builder.
pub struct ServiceSchemas<'a> {
    pub name: &'a str,
    pub contribution: &'a Schema,
    pub underlying: &'a Schema,
}

impl TransformationRegistry {
    pub fn build(services: &[ServiceSchemas<'_>]) -> Result<Self, GatewayError> {
        let mut registry = TransformationRegistry::default();

        for service in services {
            for typedef in service.contribution.types() {
                if let Some(directive) = typedef.directive(RENAMED_DIRECTIVE) {
                    let from = string_argument(directive, "from").ok_or_else(|| {
                        GatewayError::Config(format!(
                            "@renamed on type '{}' requires a 'from' argument",
                            typedef.name
                        ))
                    })?;
                    if service.underlying.get_type(from).is_none() {
                        return Err(GatewayError::SchemaMismatch(format!(
                            "type '{}' of service '{}' is renamed from '{from}' which does not exist",
                            typedef.name, service.name
                        )));
                    }
                    registry.add_type_rename(service.name, &typedef.name, from);
                }
            }
        }

        for service in services {
            for typedef in service.contribution.types() {
                for field in typedef.fields.values() {
                    let key = (
                        service.name.to_string(),
                        typedef.name.clone(),
                        field.name.clone(),
                    );
                    if let Some(directive) = field.directive(RENAMED_DIRECTIVE) {
                        let rename = registry.field_rename(service, &typedef.name, directive)?;
                        registry
                            .fields
                            .insert(key, FieldTransformation::Rename(Arc::new(rename)));
                    } else if let Some(directive) = field.directive(HYDRATED_DIRECTIVE) {
                        let name = format!("{}.{}", typedef.name, field.name);
                        let hydration = hydration_definition(name, directive, services)?;
                        registry
                            .fields
                            .insert(key, FieldTransformation::Hydration(Arc::new(hydration)));
                    }
                }
            }
        }

        debug!(
            fields = registry.fields.len(),
            services_with_type_renames = registry.type_renames.len(),
            "built transformation registry"
        );
        Ok(registry)
    }

    fn add_type_rename(&mut self, service: &str, overall: &str, underlying: &str) {
        self.type_renames
            .entry(service.to_string())
            .or_default()
            .insert(overall.to_string(), underlying.to_string());
        self.reverse_type_renames
            .entry(service.to_string())
            .or_default()
            .insert(underlying.to_string(), overall.to_string());
    }

    fn field_rename(
        &self,
        service: &ServiceSchemas<'_>,
        type_name: &str,
        directive: &Directive,
    ) -> Result<FieldRename, GatewayError> {
        let from = string_argument(directive, "from").ok_or_else(|| {
            GatewayError::Config(format!(
                "@renamed on a field of '{type_name}' requires a 'from' argument"
            ))
        })?;
        let underlying_path: Vec<String> = from.split('.').map(str::to_string).collect();
        let rename = FieldRename { underlying_path };

        let underlying_type = self.underlying_type_name(service.name, type_name);
        if service
            .underlying
            .field(underlying_type, rename.underlying_name())
            .is_none()
        {
            return Err(GatewayError::SchemaMismatch(format!(
                "field '{from}' not found on type '{underlying_type}' of service '{}'",
                service.name
            )));
        }
        Ok(rename)
    }

    /// The transformation `service` declares on `type_name.field_name`, if any.
    pub fn field(
        &self,
        service: &str,
        type_name: &str,
        field_name: &str,
    ) -> Option<&FieldTransformation> {
        self.fields.get(&(
            service.to_string(),
            type_name.to_string(),
            field_name.to_string(),
        ))
    }

    pub fn underlying_type_name<'a>(&'a self, service: &str, overall: &'a str) -> &'a str {
        self.type_renames
            .get(service)
            .and_then(|renames| renames.get(overall))
            .map(String::as_str)
            .unwrap_or(overall)
    }

    pub fn overall_type_name<'a>(&'a self, service: &str, underlying: &'a str) -> &'a str {
        self.reverse_type_renames
            .get(service)
            .and_then(|renames| renames.get(underlying))
            .map(String::as_str)
            .unwrap_or(underlying)
    }
}

fn hydration_definition(
    name: String,
    directive: &Directive,
    services: &[ServiceSchemas<'_>],
) -> Result<HydrationDefinition, GatewayError> {
    let required = |argument: &str| {
        string_argument(directive, argument).ok_or_else(|| {
            GatewayError::Config(format!("@hydrated on '{name}' requires '{argument}'"))
        })
    };
    let service = required("service")?.to_string();
    let backing_field = required("field")?.to_string();

    let target = services
        .iter()
        .find(|candidate| candidate.name == service)
        .ok_or_else(|| {
            GatewayError::Config(format!("'{name}' is hydrated from unknown service '{service}'"))
        })?;
    let query_type = target
        .underlying
        .root_type_name(crate::query_ast::OperationKind::Query)
        .unwrap_or("Query");
    let backing = target
        .underlying
        .field(query_type, &backing_field)
        .ok_or_else(|| {
            GatewayError::SchemaMismatch(format!(
                "hydration '{name}' uses '{backing_field}' which service '{service}' does not define"
            ))
        })?;

    let mut arguments = Vec::new();
    if let Some(Value::List(items)) = directive_argument(directive, "arguments") {
        for item in items {
            arguments.push(remote_argument(&name, item)?);
        }
    }

    let identified_by = string_argument(directive, "identifiedBy");
    let batch_size = match directive_argument(directive, "batchSize") {
        Some(Value::Int(size)) => size.as_i64().and_then(|size| usize::try_from(size).ok()),
        _ => None,
    };
    let batch = (identified_by.is_some() || batch_size.is_some()).then(|| BatchDeclaration {
        batch_size,
        object_identifier: identified_by.unwrap_or(DEFAULT_OBJECT_IDENTIFIER).to_string(),
    });

    let definition = HydrationDefinition {
        name,
        service,
        backing_field,
        arguments,
        backing_field_is_list: is_list_type(&backing.field_type),
        batch,
    };
    if definition.source_arguments().next().is_none() {
        return Err(GatewayError::Config(format!(
            "hydration '{}' needs at least one $source argument",
            definition.name
        )));
    }
    if definition.is_batched() && definition.source_arguments().count() != 1 {
        return Err(GatewayError::Config(format!(
            "batched hydration '{}' must take exactly one $source argument",
            definition.name
        )));
    }
    Ok(definition)
}

fn remote_argument(hydration: &str, item: &Value) -> Result<RemoteArgument, GatewayError> {
    let invalid = || {
        GatewayError::Config(format!(
            "hydration '{hydration}' has an argument that is not {{name, value}}"
        ))
    };
    let Value::Object(fields) = item else {
        return Err(invalid());
    };
    let (Some(Value::String(name)), Some(Value::String(value))) =
        (fields.get("name"), fields.get("value"))
    else {
        return Err(invalid());
    };

    let source = if let Some(path) = value.strip_prefix("$source.") {
        ArgumentSource::ObjectField(path.split('.').map(str::to_string).collect())
    } else if let Some(argument) = value.strip_prefix("$argument.") {
        ArgumentSource::FieldArgument(argument.to_string())
    } else {
        return Err(GatewayError::Config(format!(
            "hydration '{hydration}' argument '{name}' must start with $source. or $argument."
        )));
    };
    Ok(RemoteArgument {
        name: name.clone(),
        source,
    })
}

pub(crate) fn directive_argument<'a>(directive: &'a Directive, name: &str) -> Option<&'a Value> {
    directive
        .arguments
        .iter()
        .find(|(argument, _)| argument == name)
        .map(|(_, value)| value)
}

fn string_argument<'a>(directive: &'a Directive, name: &str) -> Option<&'a str> {
    match directive_argument(directive, name)? {
        Value::String(value) => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ISSUES: &str = r#"
        type Query { issue(id: ID): Issue }
        type Issue @renamed(from: "Ticket") {
            id: ID
            title: String @renamed(from: "summary")
            authorName: String @renamed(from: "author.name")
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
                batchSize: 2
            )
        }
    "#;
    const ISSUES_UNDERLYING: &str = r#"
        type Query { issue(id: ID): Ticket }
        type Ticket { id: ID summary: String author: Author reporterId: ID watcherIds: [ID] }
        type Author { name: String }
    "#;
    const USERS: &str = r#"
        type Query { userById(id: ID): User usersByIds(ids: [ID]): [User] }
        type User { id: ID name: String }
    "#;

    fn registry() -> Result<TransformationRegistry, GatewayError> {
        let issues = Schema::parse(ISSUES)?;
        let issues_underlying = Schema::parse(ISSUES_UNDERLYING)?;
        let users = Schema::parse(USERS)?;
        TransformationRegistry::build(&[
            ServiceSchemas {
                name: "issues",
                contribution: &issues,
                underlying: &issues_underlying,
            },
            ServiceSchemas {
                name: "users",
                contribution: &users,
                underlying: &users,
            },
        ])
    }

    #[test]
    fn reads_renames_and_hydrations_from_directives() {
        let registry = registry().unwrap();

        assert_eq!(registry.underlying_type_name("issues", "Issue"), "Ticket");
        assert_eq!(registry.overall_type_name("issues", "Ticket"), "Issue");
        assert_eq!(registry.underlying_type_name("users", "Issue"), "Issue");

        let Some(FieldTransformation::Rename(rename)) = registry.field("issues", "Issue", "authorName")
        else {
            panic!("expected a rename")
        };
        assert_eq!(rename.underlying_path, vec!["author", "name"]);

        let Some(FieldTransformation::Hydration(reporter)) = registry.field("issues", "Issue", "reporter")
        else {
            panic!("expected a hydration")
        };
        assert!(!reporter.is_batched());
        assert_eq!(
            reporter.source_arguments().collect::<Vec<_>>(),
            vec![("id", &["reporterId".to_string()][..])]
        );

        let Some(FieldTransformation::Hydration(watchers)) = registry.field("issues", "Issue", "watchers")
        else {
            panic!("expected a hydration")
        };
        assert!(watchers.is_batched());
        assert_eq!(registry.field("users", "Issue", "title"), None);
        assert_eq!(
            watchers.batch,
            Some(BatchDeclaration {
                batch_size: Some(2),
                object_identifier: "id".to_string()
            })
        );
    }

    #[test]
    fn rename_to_a_missing_field_is_a_schema_mismatch() {
        let overall = Schema::parse("type Query { a: String @renamed(from: \"nope\") }").unwrap();
        let underlying = Schema::parse("type Query { b: String }").unwrap();
        let result = TransformationRegistry::build(&[ServiceSchemas {
            name: "s",
            contribution: &overall,
            underlying: &underlying,
        }]);

        assert!(matches!(result, Err(GatewayError::SchemaMismatch(_))));
    }
}
