//! Asks the authorization hook about every selected field before any service is called.
use std::collections::HashMap;

use futures::FutureExt;
use futures::future::{BoxFuture, try_join_all};
use tracing::debug;

use crate::error::{ErrorKind, GatewayError, GraphQLError};
use crate::federation_gateway::ExecutionContext;
use crate::normalized_query::NormalizedFieldId;

/// Forbidden normalized fields and the error reported in their place.
pub type ForbiddenFields = HashMap<NormalizedFieldId, GraphQLError>;

pub struct FieldAuthorizationScanner<'a> {
    ctx: &'a ExecutionContext,
}

impl<'a> FieldAuthorizationScanner<'a> {
    pub fn new(ctx: &'a ExecutionContext) -> Self {
        FieldAuthorizationScanner { ctx }
    }

    pub async fn scan_operation(&self) -> Result<ForbiddenFields, GatewayError> {
        let roots = self
            .ctx
            .normalized
            .top_level_fields()
            .map(|field| field.id)
            .collect();
        let forbidden = self.scan_fields(roots).await?;
        if !forbidden.is_empty() {
            debug!(forbidden = forbidden.len(), "fields denied by authorization");
        }
        Ok(forbidden)
    }

    fn scan_fields(
        &self,
        fields: Vec<NormalizedFieldId>,
    ) -> BoxFuture<'_, Result<ForbiddenFields, GatewayError>> {
        async move {
            let decisions = try_join_all(fields.into_iter().map(|id| self.scan_field(id))).await?;
            Ok(decisions.into_iter().flatten().collect())
        }
        .boxed()
    }

    async fn scan_field(&self, id: NormalizedFieldId) -> Result<ForbiddenFields, GatewayError> {
        let ctx = self.ctx;
        let field = ctx.normalized.get(id);
        if field.is_typename() {
            return Ok(ForbiddenFields::new());
        }

        let decision = ctx
            .hooks
            .authorizer
            .authorize(field, &ctx.variables, &ctx.schema.overall, &ctx.caller_context)
            .await
            .map_err(GatewayError::Authorization)?;

        match decision {
            Some(error) => {
                let error = match error.kind() {
                    Some(_) => error,
                    None => error.with_kind(ErrorKind::AuthorizationDenied),
                };
                Ok(ForbiddenFields::from([(id, error)]))
            }
            None => self.scan_fields(field.children.clone()).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{FieldAuthorizer, GatewayHooks};
    use crate::test_support::{FnExecution, context_with, deny_fields};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    const SDL: &str = r#"
        type Query { me: User }
        type User { name: String secret: Secret friends: [User] }
        type Secret { code: String }
    "#;

    #[tokio::test]
    async fn forbidden_fields_are_not_descended() {
        let ctx = context_with(
            &[("users", SDL, None, FnExecution::empty())],
            "{ me { name secret { code } friends { secret { code } } } }",
            json!({}),
            deny_fields(&["secret"]),
        )
        .await;

        let forbidden = FieldAuthorizationScanner::new(&ctx)
            .scan_operation()
            .await
            .unwrap();

        assert_eq!(forbidden.len(), 2);
        for (id, error) in &forbidden {
            assert_eq!(ctx.normalized.get(*id).field_name, "secret");
            assert_eq!(error.kind(), Some("AuthorizationDenied"));
        }
    }

    struct Recording(Mutex<Vec<String>>);

    #[async_trait]
    impl FieldAuthorizer for Recording {
        async fn authorize(
            &self,
            field: &crate::normalized_query::NormalizedField,
            _variables: &crate::query_ast::JsonMap,
            _schema: &crate::schema::Schema,
            _caller: &crate::hooks::CallerContext,
        ) -> Result<Option<GraphQLError>, crate::error::BoxError> {
            self.0.lock().unwrap().push(field.field_name.clone());
            if field.field_name == "friends" {
                return Err("policy store unavailable".into());
            }
            Ok(None)
        }
    }

    #[tokio::test]
    async fn typename_is_never_checked_and_hook_failures_propagate() {
        let ctx = context_with(
            &[("users", SDL, None, FnExecution::empty())],
            "{ me { __typename name } }",
            json!({}),
            GatewayHooks::default().with_authorizer(Recording(Mutex::new(Vec::new()))),
        )
        .await;
        assert!(
            FieldAuthorizationScanner::new(&ctx)
                .scan_operation()
                .await
                .unwrap()
                .is_empty()
        );

        let failing = context_with(
            &[("users", SDL, None, FnExecution::empty())],
            "{ me { friends { name } } }",
            json!({}),
            GatewayHooks::default().with_authorizer(Recording(Mutex::new(Vec::new()))),
        )
        .await;
        let error = FieldAuthorizationScanner::new(&failing)
            .scan_operation()
            .await
            .unwrap_err();
        assert!(matches!(error, GatewayError::Authorization(_)));
    }

    #[tokio::test]
    async fn fields_selected_through_fragments_are_scanned() {
        let ctx = context_with(
            &[("users", SDL, None, FnExecution::empty())],
            "{ me { ...Private } } fragment Private on User { name secret { code } }",
            json!({}),
            deny_fields(&["secret"]),
        )
        .await;

        let forbidden = FieldAuthorizationScanner::new(&ctx)
            .scan_operation()
            .await
            .unwrap();

        assert_eq!(forbidden.len(), 1);
    }
}
