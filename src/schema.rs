use graphql_parser::schema as sdl;
use indexmap::IndexMap;

use crate::error::GatewayError;
use crate::query_ast::{Directive, OperationKind, Type, Value, own_directive, own_type, own_value};

const BUILT_IN_SCALARS: [&str; 5] = ["Int", "Float", "String", "Boolean", "ID"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeKind {
    Scalar,
    Object,
    Interface,
    Union,
    Enum,
    InputObject,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InputValueDefinition {
    pub name: String,
    pub value_type: Type,
    pub default_value: Option<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldDefinition {
    pub name: String,
    pub arguments: Vec<InputValueDefinition>,
    pub field_type: Type,
    pub directives: Vec<Directive>,
}

impl FieldDefinition {
    pub fn has_directive(&self, name: &str) -> bool {
        self.directives.iter().any(|directive| directive.name == name)
    }

    pub fn directive(&self, name: &str) -> Option<&Directive> {
        self.directives.iter().find(|directive| directive.name == name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeDefinition {
    pub name: String,
    pub kind: TypeKind,
    pub fields: IndexMap<String, FieldDefinition>,
    pub input_fields: IndexMap<String, InputValueDefinition>,
    pub interfaces: Vec<String>,
    pub members: Vec<String>,
    pub directives: Vec<Directive>,
}

impl TypeDefinition {
    fn new(name: &str, kind: TypeKind) -> Self {
        TypeDefinition {
            name: name.to_string(),
            kind,
            fields: IndexMap::new(),
            input_fields: IndexMap::new(),
            interfaces: Vec::new(),
            members: Vec::new(),
            directives: Vec::new(),
        }
    }

    pub fn directive(&self, name: &str) -> Option<&Directive> {
        self.directives.iter().find(|directive| directive.name == name)
    }

    fn absorb(&mut self, other: TypeDefinition) {
        for (name, field) in other.fields {
            self.fields.entry(name).or_insert(field);
        }
        for (name, field) in other.input_fields {
            self.input_fields.entry(name).or_insert(field);
        }
        for interface in other.interfaces {
            if !self.interfaces.contains(&interface) {
                self.interfaces.push(interface);
            }
        }
        for member in other.members {
            if !self.members.contains(&member) {
                self.members.push(member);
            }
        }
        self.directives.extend(other.directives);
    }
}

/// Read-only model of one schema: the overall schema, or a service's underlying schema.
#[derive(Clone, Debug)]
pub struct Schema {
    types: IndexMap<String, TypeDefinition>,
    query_type: String,
    mutation_type: Option<String>,
    subscription_type: Option<String>,
    typename_field: FieldDefinition,
}

impl Default for Schema {
    fn default() -> Self {
        let mut types = IndexMap::new();
        for scalar in BUILT_IN_SCALARS {
            types.insert(
                scalar.to_string(),
                TypeDefinition::new(scalar, TypeKind::Scalar),
            );
        }
        Schema {
            types,
            query_type: "Query".to_string(),
            mutation_type: None,
            subscription_type: None,
            typename_field: FieldDefinition {
                name: "__typename".to_string(),
                arguments: Vec::new(),
                field_type: Type::NonNullType(Box::new(Type::NamedType("String".to_string()))),
                directives: Vec::new(),
            },
        }
    }
}

impl Schema {
    pub fn parse(source: &str) -> Result<Self, GatewayError> {
        let document = sdl::parse_schema::<String>(source)
            .map_err(|e| GatewayError::SchemaParse(e.to_string()))?;
        Ok(Schema::from_document(&document))
    }

    pub fn from_document(document: &sdl::Document<'_, String>) -> Self {
        let mut schema = Schema::default();
        let mut explicit_roots = false;

        for definition in &document.definitions {
            match definition {
                sdl::Definition::SchemaDefinition(roots) => {
                    explicit_roots = true;
                    if let Some(query) = &roots.query {
                        schema.query_type = query.clone();
                    }
                    schema.mutation_type = roots.mutation.clone();
                    schema.subscription_type = roots.subscription.clone();
                }
                sdl::Definition::TypeDefinition(typedef) => schema.add(convert_type(typedef)),
                sdl::Definition::TypeExtension(extension) => {
                    if let Some(extension) = convert_extension(extension) {
                        schema.add(extension)
                    }
                }
                sdl::Definition::DirectiveDefinition(_) => {}
            }
        }

        if !explicit_roots {
            if schema.types.contains_key("Mutation") {
                schema.mutation_type = Some("Mutation".to_string());
            }
            if schema.types.contains_key("Subscription") {
                schema.subscription_type = Some("Subscription".to_string());
            }
        }
        schema
    }

    fn add(&mut self, typedef: TypeDefinition) {
        match self.types.get_mut(&typedef.name) {
            Some(existing) => existing.absorb(typedef),
            None => {
                self.types.insert(typedef.name.clone(), typedef);
            }
        }
    }

    /// Unions another schema into this one. Existing fields win over incoming ones.
    pub fn merge(&mut self, other: Schema) {
        if self.mutation_type.is_none() {
            self.mutation_type = other.mutation_type;
        }
        if self.subscription_type.is_none() {
            self.subscription_type = other.subscription_type;
        }
        for (_, typedef) in other.types {
            self.add(typedef);
        }
    }

    pub fn get_type(&self, name: &str) -> Option<&TypeDefinition> {
        self.types.get(name)
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeDefinition> {
        self.types.values()
    }

    /// Looks a field up on a type, answering the `__typename` meta field for every composite type.
    pub fn field(&self, type_name: &str, field_name: &str) -> Option<&FieldDefinition> {
        if field_name == "__typename" {
            return Some(&self.typename_field);
        }
        self.types.get(type_name)?.fields.get(field_name)
    }

    pub fn root_type_name(&self, kind: OperationKind) -> Option<&str> {
        match kind {
            OperationKind::Query => Some(self.query_type.as_str()),
            OperationKind::Mutation => self.mutation_type.as_deref(),
            OperationKind::Subscription => self.subscription_type.as_deref(),
        }
    }

    pub fn root_type_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.query_type.as_str())
            .chain(self.mutation_type.as_deref())
            .chain(self.subscription_type.as_deref())
    }

    pub fn is_abstract(&self, name: &str) -> bool {
        matches!(
            self.types.get(name).map(|typedef| typedef.kind),
            Some(TypeKind::Interface | TypeKind::Union)
        )
    }

    pub fn is_composite(&self, name: &str) -> bool {
        matches!(
            self.types.get(name).map(|typedef| typedef.kind),
            Some(TypeKind::Object | TypeKind::Interface | TypeKind::Union)
        )
    }

    /// Object types a value of `name` can be at runtime.
    pub fn possible_types(&self, name: &str) -> Vec<String> {
        let Some(typedef) = self.types.get(name) else {
            return Vec::new();
        };
        match typedef.kind {
            TypeKind::Object => vec![name.to_string()],
            TypeKind::Union => typedef.members.clone(),
            TypeKind::Interface => self
                .types
                .values()
                .filter(|candidate| {
                    candidate.kind == TypeKind::Object
                        && candidate.interfaces.iter().any(|interface| interface == name)
                })
                .map(|candidate| candidate.name.clone())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Whether an object type matches a fragment's type condition.
    pub fn type_satisfies(&self, object_type: &str, condition: &str) -> bool {
        object_type == condition
            || self
                .possible_types(condition)
                .iter()
                .any(|possible| possible == object_type)
    }
}

pub fn named_type(ty: &Type) -> &str {
    match ty {
        Type::NamedType(name) => name,
        Type::ListType(inner) | Type::NonNullType(inner) => named_type(inner),
    }
}

pub fn is_list_type(ty: &Type) -> bool {
    match ty {
        Type::NamedType(_) => false,
        Type::ListType(_) => true,
        Type::NonNullType(inner) => is_list_type(inner),
    }
}

fn convert_field(field: &sdl::Field<'_, String>) -> FieldDefinition {
    FieldDefinition {
        name: field.name.clone(),
        arguments: field.arguments.iter().map(convert_input_value).collect(),
        field_type: own_type(&field.field_type),
        directives: field.directives.iter().map(own_directive).collect(),
    }
}

fn convert_input_value(value: &sdl::InputValue<'_, String>) -> InputValueDefinition {
    InputValueDefinition {
        name: value.name.clone(),
        value_type: own_type(&value.value_type),
        default_value: value.default_value.as_ref().map(own_value),
    }
}

fn object_like(
    name: &str,
    kind: TypeKind,
    interfaces: &[String],
    directives: &[sdl::Directive<'_, String>],
    fields: &[sdl::Field<'_, String>],
) -> TypeDefinition {
    let mut typedef = TypeDefinition::new(name, kind);
    typedef.interfaces = interfaces.to_vec();
    typedef.directives = directives.iter().map(own_directive).collect();
    typedef.fields = fields
        .iter()
        .map(|field| (field.name.clone(), convert_field(field)))
        .collect();
    typedef
}

fn convert_type(typedef: &sdl::TypeDefinition<'_, String>) -> TypeDefinition {
    match typedef {
        sdl::TypeDefinition::Object(object) => object_like(
            &object.name,
            TypeKind::Object,
            &object.implements_interfaces,
            &object.directives,
            &object.fields,
        ),
        sdl::TypeDefinition::Interface(interface) => object_like(
            &interface.name,
            TypeKind::Interface,
            &interface.implements_interfaces,
            &interface.directives,
            &interface.fields,
        ),
        sdl::TypeDefinition::Union(union_type) => {
            let mut converted = TypeDefinition::new(&union_type.name, TypeKind::Union);
            converted.members = union_type.types.clone();
            converted.directives = union_type.directives.iter().map(own_directive).collect();
            converted
        }
        sdl::TypeDefinition::Scalar(scalar) => {
            let mut converted = TypeDefinition::new(&scalar.name, TypeKind::Scalar);
            converted.directives = scalar.directives.iter().map(own_directive).collect();
            converted
        }
        sdl::TypeDefinition::Enum(enum_type) => {
            let mut converted = TypeDefinition::new(&enum_type.name, TypeKind::Enum);
            converted.directives = enum_type.directives.iter().map(own_directive).collect();
            converted
        }
        sdl::TypeDefinition::InputObject(input) => {
            let mut converted = TypeDefinition::new(&input.name, TypeKind::InputObject);
            converted.directives = input.directives.iter().map(own_directive).collect();
            converted.input_fields = input
                .fields
                .iter()
                .map(|field| (field.name.clone(), convert_input_value(field)))
                .collect();
            converted
        }
    }
}

fn convert_extension(extension: &sdl::TypeExtension<'_, String>) -> Option<TypeDefinition> {
    match extension {
        sdl::TypeExtension::Object(object) => Some(object_like(
            &object.name,
            TypeKind::Object,
            &object.implements_interfaces,
            &object.directives,
            &object.fields,
        )),
        sdl::TypeExtension::Interface(interface) => Some(object_like(
            &interface.name,
            TypeKind::Interface,
            &[],
            &interface.directives,
            &interface.fields,
        )),
        sdl::TypeExtension::Union(union_type) => {
            let mut converted = TypeDefinition::new(&union_type.name, TypeKind::Union);
            converted.members = union_type.types.clone();
            Some(converted)
        }
        sdl::TypeExtension::InputObject(input) => {
            let mut converted = TypeDefinition::new(&input.name, TypeKind::InputObject);
            converted.input_fields = input
                .fields
                .iter()
                .map(|field| (field.name.clone(), convert_input_value(field)))
                .collect();
            Some(converted)
        }
        sdl::TypeExtension::Scalar(_) | sdl::TypeExtension::Enum(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDL: &str = r#"
        type Query { node(id: ID!): Node pets: [Pet!]! }
        interface Node { id: ID! }
        type Dog implements Node { id: ID! bark: String }
        type Cat implements Node { id: ID! meow: String }
        union Pet = Dog | Cat
        extend type Query { me: Dog }
    "#;

    #[test]
    fn abstract_types_know_their_possible_types() {
        let schema = Schema::parse(SDL).unwrap();

        assert!(schema.is_abstract("Node"));
        assert!(schema.is_abstract("Pet"));
        assert!(!schema.is_abstract("Dog"));
        assert_eq!(schema.possible_types("Node"), vec!["Dog", "Cat"]);
        assert_eq!(schema.possible_types("Pet"), vec!["Dog", "Cat"]);
        assert!(schema.type_satisfies("Cat", "Node"));
        assert!(!schema.type_satisfies("Cat", "Dog"));
    }

    #[test]
    fn extensions_and_meta_fields() {
        let schema = Schema::parse(SDL).unwrap();

        assert!(schema.field("Query", "me").is_some());
        assert_eq!(
            named_type(&schema.field("Dog", "__typename").unwrap().field_type),
            "String"
        );
        assert!(is_list_type(&schema.field("Query", "pets").unwrap().field_type));
        assert_eq!(schema.root_type_name(OperationKind::Query), Some("Query"));
        assert_eq!(schema.root_type_name(OperationKind::Mutation), None);
    }

    #[test]
    fn merging_keeps_the_first_field_declaration() {
        let mut schema = Schema::parse("type Query { a: String } type User { id: ID }").unwrap();
        schema.merge(
            Schema::parse("type Query { b: Int } type User { id: String name: String }").unwrap(),
        );

        let user = schema.get_type("User").unwrap();
        assert_eq!(user.fields.len(), 2);
        assert_eq!(named_type(&user.fields["id"].field_type), "ID");
        assert!(schema.field("Query", "b").is_some());
    }
}
