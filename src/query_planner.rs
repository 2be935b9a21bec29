use async_trait::async_trait;
use futures::future::try_join_all;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ErrorKind, GatewayError, GraphQLError};
use crate::federation_gateway::ExecutionContext;
use crate::field_authorization::ForbiddenFields;
use crate::hooks::ServiceContext;
use crate::normalized_query::{NormalizedField, NormalizedFieldId};
use crate::query_ast::{Field, Selection, should_include};
use crate::query_transformer::TopLevelField;
use crate::result_tree::ResultPath;
use crate::schema_registry::Service;

/// How one top-level field of the operation gets its value.
pub enum PlannedField {
    Service {
        service: Arc<Service>,
        field: TopLevelField,
        service_context: ServiceContext,
    },
    /// Resolved to `null` with an error, without calling any service.
    EarlyFailure {
        field: NormalizedFieldId,
        error: GraphQLError,
    },
    /// A top-level `__typename`, answered by the gateway itself.
    Typename { field: NormalizedFieldId },
}

#[async_trait]
pub trait QueryPlanner {
    async fn plan_query(
        &self,
        ctx: &ExecutionContext,
        forbidden: &ForbiddenFields,
    ) -> Result<Vec<PlannedField>, GatewayError>;
}

/// Routes fields by the ownership declared in the service schemas.
#[derive(Default)]
pub struct OwnershipQueryPlanner;

impl OwnershipQueryPlanner {
    pub fn new() -> Self {
        OwnershipQueryPlanner
    }
}

enum Step {
    Service(Arc<Service>, TopLevelField),
    EarlyFailure(NormalizedFieldId, GraphQLError),
    Typename(NormalizedFieldId),
}

#[async_trait]
impl QueryPlanner for OwnershipQueryPlanner {
    async fn plan_query(
        &self,
        ctx: &ExecutionContext,
        forbidden: &ForbiddenFields,
    ) -> Result<Vec<PlannedField>, GatewayError> {
        let mut occurrences: IndexMap<NormalizedFieldId, Vec<&Field>> = IndexMap::new();
        let mut top_level = Vec::new();
        flatten(ctx, &ctx.operation.selection_set, &mut top_level)?;
        for field in top_level {
            if let Some(id) = ctx.normalized.fields_for(field.id).first() {
                occurrences.entry(*id).or_default().push(field);
            }
        }

        let root_type = ctx.root_type_name();
        let mut steps = Vec::with_capacity(occurrences.len());
        for (id, fields) in occurrences {
            let normalized = ctx.normalized.get(id);
            if normalized.is_typename() {
                steps.push(Step::Typename(id));
                continue;
            }
            let field = merge_occurrences(&fields);
            let name = &normalized.field_name;

            if ctx.schema.is_namespaced(root_type, name) {
                match forbidden.get(&id) {
                    Some(error) => steps.push(Step::EarlyFailure(id, error.clone())),
                    None => steps.extend(split_namespaced(ctx, normalized, field)?),
                }
            } else if ctx.schema.is_dynamic(root_type, name) {
                steps.push(resolve_dynamic(ctx, normalized, field).await);
            } else {
                let service = ctx
                    .schema
                    .owner(root_type, name)
                    .ok_or_else(|| GatewayError::NoServiceForField(format!("{root_type}.{name}")))?;
                steps.push(Step::Service(service.clone(), TopLevelField::new(field)));
            }
        }

        let factory = &ctx.hooks.service_context_factory;
        let contexts = try_join_all(steps.iter().filter_map(|step| match step {
            Step::Service(service, _) => Some(async move {
                factory
                    .create_service_context(service, &ctx.caller_context)
                    .await
                    .map_err(|reason| GatewayError::ServiceContext {
                        service: service.name.clone(),
                        reason,
                    })
            }),
            _ => None,
        }))
        .await?;

        let mut contexts = contexts.into_iter();
        let mut planned = Vec::with_capacity(steps.len());
        for step in steps {
            planned.push(match step {
                Step::Service(service, field) => {
                    debug!(service = %service.name, field = %field.field.result_key(), "planned field");
                    let service_context = contexts.next().ok_or_else(|| {
                        GatewayError::ServiceContext {
                            service: service.name.clone(),
                            reason: "service context missing".into(),
                        }
                    })?;
                    PlannedField::Service {
                        service,
                        field,
                        service_context,
                    }
                }
                Step::EarlyFailure(field, error) => PlannedField::EarlyFailure { field, error },
                Step::Typename(field) => PlannedField::Typename { field },
            });
        }
        Ok(planned)
    }
}

/// Expands fragments so only field occurrences remain.
fn flatten<'d>(
    ctx: &'d ExecutionContext,
    selections: &'d [Selection],
    out: &mut Vec<&'d Field>,
) -> Result<(), GatewayError> {
    for selection in selections {
        match selection {
            Selection::Field(field) => out.push(field),
            Selection::InlineFragment(inline) => {
                if should_include(&inline.directives, &ctx.variables) {
                    flatten(ctx, &inline.selection_set, out)?;
                }
            }
            Selection::FragmentSpread(spread) => {
                if should_include(&spread.directives, &ctx.variables) {
                    let fragment = ctx.document.fragment(&spread.fragment_name)?;
                    flatten(ctx, &fragment.selection_set, out)?;
                }
            }
        }
    }
    Ok(())
}

/// One field carrying the selections of every occurrence that shares its result key.
fn merge_occurrences(fields: &[&Field]) -> Field {
    let mut merged = fields[0].clone();
    for other in &fields[1..] {
        merged.selection_set.extend(other.selection_set.iter().cloned());
    }
    merged
}

/// Splits a namespaced field into one field per service owning part of its selection.
fn split_namespaced(
    ctx: &ExecutionContext,
    normalized: &NormalizedField,
    field: Field,
) -> Result<Vec<Step>, GatewayError> {
    let namespace_type = normalized.output_type();
    let mut inner = Vec::new();
    flatten(ctx, &field.selection_set, &mut inner)?;

    let mut buckets: IndexMap<String, (Arc<Service>, Vec<Selection>)> = IndexMap::new();
    let mut typenames = Vec::new();
    for selected in inner {
        let Some(child) = ctx.normalized.fields_for(selected.id).first() else {
            continue;
        };
        let child = ctx.normalized.get(*child);
        if child.is_typename() {
            typenames.push(Selection::Field(selected.clone()));
            continue;
        }
        let service = ctx
            .schema
            .owner(namespace_type, &child.field_name)
            .ok_or_else(|| {
                GatewayError::NoServiceForField(format!("{namespace_type}.{}", child.field_name))
            })?;
        buckets
            .entry(service.name.clone())
            .or_insert_with(|| (service.clone(), Vec::new()))
            .1
            .push(Selection::Field(selected.clone()));
    }

    if !typenames.is_empty() {
        match buckets.first_mut() {
            Some((_, (_, selections))) => selections.extend(typenames),
            None => {
                let service = ctx
                    .schema
                    .owner(ctx.root_type_name(), &normalized.field_name)
                    .ok_or_else(|| GatewayError::NoServiceForField(normalized.field_name.clone()))?;
                buckets.insert(service.name.clone(), (service.clone(), typenames));
            }
        }
    }

    debug!(
        field = %normalized.result_key,
        services = buckets.len(),
        "split namespaced field"
    );
    Ok(buckets
        .into_values()
        .map(|(service, selection_set)| {
            let mut part = field.clone();
            part.selection_set = selection_set;
            Step::Service(service, TopLevelField::new(part))
        })
        .collect())
}

async fn resolve_dynamic(ctx: &ExecutionContext, normalized: &NormalizedField, field: Field) -> Step {
    let path = ResultPath::root().with_key(&normalized.result_key);
    let Some(resolver) = &ctx.hooks.service_resolver else {
        warn!(field = %normalized.field_name, "no service resolver for dynamically resolved field");
        let error = GraphQLError::new(format!(
            "no service resolver is configured for '{}'",
            normalized.field_name
        ))
        .with_kind(ErrorKind::DynamicResolutionFailure)
        .with_path(path);
        return Step::EarlyFailure(normalized.id, error);
    };

    let services: Vec<Arc<Service>> = ctx.schema.services.values().cloned().collect();
    match resolver
        .resolve_service(&services, normalized, &ctx.caller_context)
        .await
    {
        Ok(service) => Step::Service(service, TopLevelField::new(field)),
        Err(error) => {
            let error = match error.kind() {
                Some(_) => error,
                None => error.with_kind(ErrorKind::DynamicResolutionFailure),
            };
            Step::EarlyFailure(normalized.id, error.or_path(&path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{CallerContext, GatewayHooks, ServiceResolver};
    use crate::test_support::{FnExecution, context, context_with};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const ISSUES: &str = r#"
        type Query {
            issue: Issue
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

    fn services(planned: &[PlannedField]) -> Vec<String> {
        planned
            .iter()
            .map(|planned| match planned {
                PlannedField::Service { service, field, .. } => {
                    format!("{}:{}", service.name, field.field.selection_set.len())
                }
                PlannedField::EarlyFailure { .. } => "failure".to_string(),
                PlannedField::Typename { .. } => "typename".to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn namespaced_fields_split_per_owner() {
        let ctx = context(
            &[
                ("issues", ISSUES, None, FnExecution::empty()),
                ("boards", BOARDS, None, FnExecution::empty()),
            ],
            "{ __typename workspace { __typename boards issues { id } } issue { id } }",
        )
        .await;

        let planned = OwnershipQueryPlanner::new()
            .plan_query(&ctx, &Default::default())
            .await
            .unwrap();

        assert_eq!(
            services(&planned),
            vec!["typename", "boards:2", "issues:1", "issues:1"]
        );
    }

    struct NoService;

    #[async_trait]
    impl ServiceResolver for NoService {
        async fn resolve_service(
            &self,
            _services: &[Arc<Service>],
            field: &NormalizedField,
            _caller: &CallerContext,
        ) -> Result<Arc<Service>, GraphQLError> {
            Err(GraphQLError::new(format!("cannot route {}", field.field_name)))
        }
    }

    #[tokio::test]
    async fn dynamic_resolution_failures_are_planned_as_early_failures() {
        let ctx = context_with(
            &[("issues", ISSUES, None, FnExecution::empty())],
            r#"{ found: search(text: "x") }"#,
            json!({}),
            GatewayHooks::default().with_service_resolver(NoService),
        )
        .await;

        let planned = OwnershipQueryPlanner::new()
            .plan_query(&ctx, &Default::default())
            .await
            .unwrap();

        let [PlannedField::EarlyFailure { error, .. }] = &planned[..] else {
            panic!("expected an early failure");
        };
        assert_eq!(error.message, "cannot route search");
        assert_eq!(error.kind(), Some("DynamicResolutionFailure"));
        assert_eq!(error.path, Some(ResultPath::root().with_key("found")));
    }

    #[tokio::test]
    async fn namespaced_fields_with_one_owner_stay_whole() {
        let ctx = context(
            &[("boards", BOARDS, None, FnExecution::empty())],
            "{ workspace { boards } }",
        )
        .await;
        let planned = OwnershipQueryPlanner::new()
            .plan_query(&ctx, &Default::default())
            .await
            .unwrap();
        assert_eq!(services(&planned), vec!["boards:1"]);
    }
}
