use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::GatewayError;
use crate::query_executor::{InstrumentedServiceExecution, ServiceExecution};
use crate::schema::{Schema, named_type};
use crate::transformations::{
    DYNAMIC_SERVICE_DIRECTIVE, NAMESPACED_DIRECTIVE, ServiceSchemas, TransformationRegistry,
};

/// What a service declares when it joins the gateway.
#[derive(Clone, Debug)]
pub struct ServiceDefinition {
    pub name: String,
    /// The service's contribution to the overall schema, carrying the transformation directives.
    pub schema: String,
    /// The service's own schema; the contribution is used when absent.
    pub underlying_schema: Option<String>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>, schema: impl Into<String>) -> Self {
        ServiceDefinition {
            name: name.into(),
            schema: schema.into(),
            underlying_schema: None,
        }
    }

    pub fn with_underlying_schema(mut self, schema: impl Into<String>) -> Self {
        self.underlying_schema = Some(schema.into());
        self
    }
}

pub struct Service {
    pub name: String,
    pub underlying_schema: Arc<Schema>,
    pub execution: Arc<dyn ServiceExecution>,
}

impl Service {
    pub fn new(
        name: impl Into<String>,
        underlying_schema: Schema,
        execution: Arc<dyn ServiceExecution>,
    ) -> Self {
        let name = name.into();
        Service {
            execution: Arc::new(InstrumentedServiceExecution::new(name.clone(), execution)),
            underlying_schema: Arc::new(underlying_schema),
            name,
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service").field("name", &self.name).finish()
    }
}

/// Immutable snapshot of every registered service, shared by all requests.
#[derive(Debug)]
pub struct FederatedSchema {
    pub overall: Arc<Schema>,
    pub services: IndexMap<String, Arc<Service>>,
    pub transformations: TransformationRegistry,
    /// (type, field) -> services that declare it, for root and namespace types.
    field_owners: HashMap<(String, String), Vec<String>>,
    namespaced: HashSet<(String, String)>,
    dynamic: HashSet<(String, String)>,
}

impl FederatedSchema {
    pub fn build(
        definitions: Vec<(ServiceDefinition, Arc<dyn ServiceExecution>)>,
    ) -> Result<Self, GatewayError> {
        let mut parsed = Vec::with_capacity(definitions.len());
        for (definition, execution) in definitions {
            let contribution = Schema::parse(&definition.schema).map_err(|e| {
                GatewayError::SchemaParse(format!("service '{}': {e}", definition.name))
            })?;
            let underlying = match &definition.underlying_schema {
                Some(sdl) => Schema::parse(sdl).map_err(|e| {
                    GatewayError::SchemaParse(format!("service '{}': {e}", definition.name))
                })?,
                None => contribution.clone(),
            };
            parsed.push((definition.name, contribution, underlying, execution));
        }

        let transformations = TransformationRegistry::build(
            &parsed
                .iter()
                .map(|(name, contribution, underlying, _)| ServiceSchemas {
                    name,
                    contribution,
                    underlying,
                })
                .collect::<Vec<_>>(),
        )?;

        let mut overall = Schema::default();
        let mut field_owners: HashMap<(String, String), Vec<String>> = HashMap::new();
        let mut namespaced = HashSet::new();
        let mut dynamic = HashSet::new();

        for (name, contribution, _, _) in &parsed {
            for root_type in contribution.root_type_names() {
                let Some(typedef) = contribution.get_type(root_type) else {
                    continue;
                };
                for field in typedef.fields.values() {
                    let key = (root_type.to_string(), field.name.clone());
                    field_owners.entry(key.clone()).or_default().push(name.clone());
                    if field.has_directive(DYNAMIC_SERVICE_DIRECTIVE) {
                        dynamic.insert(key.clone());
                    }
                    if field.has_directive(NAMESPACED_DIRECTIVE) {
                        namespaced.insert(key);
                        let namespace_type = named_type(&field.field_type);
                        if let Some(namespace) = contribution.get_type(namespace_type) {
                            for inner in namespace.fields.keys() {
                                field_owners
                                    .entry((namespace_type.to_string(), inner.clone()))
                                    .or_default()
                                    .push(name.clone());
                            }
                        }
                    }
                }
            }
        }

        let mut services = IndexMap::new();
        for (name, contribution, underlying, execution) in parsed {
            overall.merge(contribution);
            services.insert(
                name.clone(),
                Arc::new(Service::new(name, underlying, execution)),
            );
        }

        debug!(
            services = services.len(),
            owned_fields = field_owners.len(),
            "built federated schema"
        );
        Ok(FederatedSchema {
            overall: Arc::new(overall),
            services,
            transformations,
            field_owners,
            namespaced,
            dynamic,
        })
    }

    /// The statically owning service of a root or namespace field.
    pub fn owner(&self, type_name: &str, field_name: &str) -> Option<&Arc<Service>> {
        self.owners(type_name, field_name).into_iter().next()
    }

    pub fn owners(&self, type_name: &str, field_name: &str) -> Vec<&Arc<Service>> {
        self.field_owners
            .get(&(type_name.to_string(), field_name.to_string()))
            .map(|names| names.iter().filter_map(|name| self.services.get(name)).collect())
            .unwrap_or_default()
    }

    pub fn is_namespaced(&self, type_name: &str, field_name: &str) -> bool {
        self.namespaced
            .contains(&(type_name.to_string(), field_name.to_string()))
    }

    pub fn is_dynamic(&self, type_name: &str, field_name: &str) -> bool {
        self.dynamic
            .contains(&(type_name.to_string(), field_name.to_string()))
    }

    pub fn service(&self, name: &str) -> Option<&Arc<Service>> {
        self.services.get(name)
    }
}

type ServiceMap = IndexMap<String, (ServiceDefinition, Arc<dyn ServiceExecution>)>;

#[async_trait]
pub trait SchemaRegistry {
    async fn register_service(
        &mut self,
        service: ServiceDefinition,
        execution: Arc<dyn ServiceExecution>,
    ) -> Result<(), GatewayError>;
    async fn get_schema(&self) -> Result<Arc<FederatedSchema>, GatewayError>;
}

#[derive(Default)]
pub struct InMemorySchemaRegistry {
    services: Arc<RwLock<ServiceMap>>,
    federated_schema: Arc<RwLock<Option<Arc<FederatedSchema>>>>,
}

impl InMemorySchemaRegistry {
    pub fn new() -> Self {
        InMemorySchemaRegistry::default()
    }
}

#[async_trait]
impl SchemaRegistry for InMemorySchemaRegistry {
    async fn register_service(
        &mut self,
        service: ServiceDefinition,
        execution: Arc<dyn ServiceExecution>,
    ) -> Result<(), GatewayError> {
        let mut services = self.services.write().await;
        services.insert(service.name.clone(), (service, execution));

        let mut federated_schema = self.federated_schema.write().await;
        *federated_schema = None;

        Ok(())
    }

    async fn get_schema(&self) -> Result<Arc<FederatedSchema>, GatewayError> {
        let cached_schema = self.federated_schema.read().await;
        if let Some(schema) = &*cached_schema {
            return Ok(schema.clone());
        }
        drop(cached_schema);

        let services = self.services.read().await;
        let schema = Arc::new(FederatedSchema::build(services.values().cloned().collect())?);

        let mut federated_schema = self.federated_schema.write().await;
        *federated_schema = Some(schema.clone());

        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FnExecution;

    const ISSUES: &str = r#"
        type Query {
            issue(id: ID): Issue
            workspace: Workspace @namespaced
            search(text: String): String @dynamicServiceResolution
        }
        type Workspace { issues: [Issue] }
        type Issue { id: ID }
    "#;
    const BOARDS: &str = r#"
        type Query { workspace: Workspace @namespaced }
        type Workspace { boards: [String] }
    "#;

    #[tokio::test]
    async fn ownership_covers_root_and_namespace_fields() {
        let mut registry = InMemorySchemaRegistry::new();
        registry
            .register_service(ServiceDefinition::new("issues", ISSUES), FnExecution::empty())
            .await
            .unwrap();
        registry
            .register_service(ServiceDefinition::new("boards", BOARDS), FnExecution::empty())
            .await
            .unwrap();

        let schema = registry.get_schema().await.unwrap();

        assert_eq!(schema.owner("Query", "issue").unwrap().name, "issues");
        assert_eq!(schema.owners("Query", "workspace").len(), 2);
        assert_eq!(schema.owner("Workspace", "boards").unwrap().name, "boards");
        assert!(schema.is_namespaced("Query", "workspace"));
        assert!(schema.is_dynamic("Query", "search"));
        assert!(schema.overall.field("Workspace", "issues").is_some());
        assert!(schema.overall.field("Workspace", "boards").is_some());
    }

    #[tokio::test]
    async fn registration_invalidates_the_cached_schema() {
        let mut registry = InMemorySchemaRegistry::new();
        registry
            .register_service(ServiceDefinition::new("issues", ISSUES), FnExecution::empty())
            .await
            .unwrap();
        let first = registry.get_schema().await.unwrap();
        assert!(Arc::ptr_eq(&first, &registry.get_schema().await.unwrap()));

        registry
            .register_service(ServiceDefinition::new("boards", BOARDS), FnExecution::empty())
            .await
            .unwrap();

        let second = registry.get_schema().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.services.len(), 2);
    }

    #[test]
    fn unparsable_schemas_name_the_service() {
        let error = FederatedSchema::build(vec![(
            ServiceDefinition::new("broken", "type Query {"),
            FnExecution::empty(),
        )])
        .unwrap_err();

        assert!(error.to_string().contains("broken"));
    }
}
