//! Converts a service's raw payload into a result tree typed by that service's own schema.
use serde_json::Value as JsonValue;

use crate::error::GatewayError;
use crate::normalized_query::{NormalizedField, NormalizedQuery};
use crate::query_ast::{JsonMap, QueryDocument, Type};
use crate::result_tree::{ExecutionResultNode, NodeHeader, ResultPath};
use crate::schema::Schema;

pub struct ServiceResultConverter<'a> {
    schema: &'a Schema,
    query: NormalizedQuery,
    hint_alias: &'a str,
}

impl<'a> ServiceResultConverter<'a> {
    /// Normalizes the document that was sent against the underlying schema.
    pub fn new(
        schema: &'a Schema,
        document: &QueryDocument,
        variables: &JsonMap,
        hint_alias: &'a str,
    ) -> Result<Self, GatewayError> {
        let operation = document.operation(None)?;
        let query = NormalizedQuery::new(schema, document, operation, variables)?;
        Ok(ServiceResultConverter {
            schema,
            query,
            hint_alias,
        })
    }

    pub fn convert(&self, root_type: &str, data: Option<JsonMap>) -> ExecutionResultNode {
        let mut data = data.unwrap_or_default();
        let children = self
            .query
            .top_level_fields()
            .filter_map(|field| {
                let value = data.remove(&field.result_key)?;
                let header = NodeHeader::for_field(field, ResultPath::root().with_key(&field.result_key));
                Some(self.convert_value(field, &field.field_type, value, header))
            })
            .collect();
        ExecutionResultNode::root(root_type, children)
    }

    fn convert_value(
        &self,
        field: &NormalizedField,
        ty: &Type,
        value: JsonValue,
        header: NodeHeader,
    ) -> ExecutionResultNode {
        match (ty, value) {
            (_, JsonValue::Null) => ExecutionResultNode::null(header),
            (Type::NonNullType(inner), value) => self.convert_value(field, inner, value, header),
            (Type::ListType(inner), JsonValue::Array(items)) => {
                let children = items
                    .into_iter()
                    .enumerate()
                    .map(|(index, item)| {
                        self.convert_value(field, inner, item, header.element(index))
                    })
                    .collect();
                ExecutionResultNode::list(header, children)
            }
            (Type::NamedType(name), JsonValue::Object(mut object))
                if self.schema.is_composite(name) =>
            {
                let resolved_type = self.resolved_type(name, &object);
                let children = self
                    .query
                    .children(field.id)
                    .filter(|child| child.object_type == resolved_type)
                    .filter_map(|child| {
                        let value = object.remove(&child.result_key)?;
                        let header =
                            NodeHeader::for_field(child, header.path.with_key(&child.result_key));
                        Some(self.convert_value(child, &child.field_type, value, header))
                    })
                    .collect();
                ExecutionResultNode::object(header, resolved_type, children)
            }
            (_, value) => ExecutionResultNode::leaf(header, value),
        }
    }

    fn resolved_type(&self, declared: &str, object: &JsonMap) -> String {
        if !self.schema.is_abstract(declared) {
            return declared.to_string();
        }
        [self.hint_alias, "__typename"]
            .iter()
            .find_map(|key| object.get(*key).and_then(JsonValue::as_str))
            .unwrap_or(declared)
            .to_string()
    }
}
