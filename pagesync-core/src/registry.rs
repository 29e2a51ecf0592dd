//! Component registry: the `type`-keyed catalogue of field schemas and
//! default props.
//!
//! The registry knows nothing about rendering. Tree utilities use it to
//! tell which component types exist and which props hold nested children
//! (slots); editors use it to create nodes and validate props.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::transform::TransformError;
use crate::{ComponentNode, ImageData, PageDocument, Props};

/// Shape a single prop is expected to have.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Text,
    Number,
    Boolean,
    /// URL or path string.
    Link,
    /// `ImageData` object.
    Image,
    /// Named gradient token.
    Gradient,
    Select(Vec<String>),
    /// Array of objects, each described by the nested fields.
    List(Vec<FieldSchema>),
    /// Array of nested component nodes.
    Slot,
    /// Serialized `QueryConfig`.
    Query,
    /// Anything JSON.
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentSchema {
    pub name: String,
    pub fields: Vec<FieldSchema>,
    pub defaults: Props,
}

impl ComponentSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            defaults: Props::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSchema::new(name, kind));
        self
    }

    pub fn default_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(name.into(), value);
        self
    }

    pub fn field_schema(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn slot_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| f.kind == FieldKind::Slot)
            .map(|f| f.name.as_str())
    }
}

/// A prop that does not match its declared field kind.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaViolation {
    /// Location of the offending node, e.g. `content[2]` or `zones[Hero-1:content][0]`.
    pub path: String,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}: {}", self.path, self.field, self.message)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ComponentRegistry {
    schemas: BTreeMap<String, ComponentSchema>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the site builder's block library.
    pub fn page_builder() -> Self {
        let mut registry = Self::new();
        for schema in builtin_schemas() {
            registry.register(schema);
        }
        registry
    }

    /// Adds or replaces a component definition.
    pub fn register(&mut self, schema: ComponentSchema) {
        self.schemas.insert(schema.name.clone(), schema);
    }

    pub fn contains(&self, component_type: &str) -> bool {
        self.schemas.contains_key(component_type)
    }

    pub fn schema(&self, component_type: &str) -> Option<&ComponentSchema> {
        self.schemas.get(component_type)
    }

    pub fn require(&self, component_type: &str) -> Result<&ComponentSchema, TransformError> {
        self.schema(component_type)
            .ok_or_else(|| TransformError::UnknownComponentType(component_type.to_string()))
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Slot fields declared for `component_type`; empty for unknown types.
    pub fn slot_fields<'a>(&'a self, component_type: &str) -> Vec<&'a str> {
        self.schema(component_type)
            .map(|s| s.slot_fields().collect())
            .unwrap_or_default()
    }

    /// Creates a node with the default props and a fresh `id`.
    pub fn create_node(&self, component_type: &str) -> Result<ComponentNode, TransformError> {
        let schema = self.require(component_type)?;
        let mut props = schema.defaults.clone();
        props.insert(
            "id".to_string(),
            Value::String(format!("{}-{}", component_type, Uuid::new_v4())),
        );
        Ok(ComponentNode::new(component_type, props))
    }

    /// Checks a node (and its slot children) against the registered schema.
    pub fn validate_node(&self, node: &ComponentNode) -> Vec<SchemaViolation> {
        let mut violations = Vec::new();
        self.validate_at(node, "node", &mut violations);
        violations
    }

    pub fn validate_document(&self, doc: &PageDocument) -> Vec<SchemaViolation> {
        let mut violations = Vec::new();
        for (i, node) in doc.content.iter().enumerate() {
            self.validate_at(node, &format!("content[{i}]"), &mut violations);
        }
        for (key, nodes) in &doc.zones {
            for (i, node) in nodes.iter().enumerate() {
                self.validate_at(node, &format!("zones[{key}][{i}]"), &mut violations);
            }
        }
        violations
    }

    fn validate_at(&self, node: &ComponentNode, path: &str, out: &mut Vec<SchemaViolation>) {
        let Some(schema) = self.schema(&node.component_type) else {
            out.push(SchemaViolation {
                path: path.to_string(),
                field: "type".to_string(),
                message: format!("unknown component type '{}'", node.component_type),
            });
            return;
        };

        for field in &schema.fields {
            let Some(value) = node.props.get(&field.name) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            if field.kind == FieldKind::Slot {
                match value.as_array() {
                    Some(children) => {
                        for (i, child) in children.iter().enumerate() {
                            let child_path = format!("{path}.{}[{i}]", field.name);
                            match serde_json::from_value::<ComponentNode>(child.clone()) {
                                Ok(child) => self.validate_at(&child, &child_path, out),
                                Err(e) => out.push(SchemaViolation {
                                    path: child_path,
                                    field: field.name.clone(),
                                    message: format!("not a component node: {e}"),
                                }),
                            }
                        }
                    }
                    None => out.push(violation(path, &field.name, "expected a list of components")),
                }
                continue;
            }
            check_value(path, &field.name, &field.kind, value, out);
        }
    }
}

fn violation(path: &str, field: &str, message: impl Into<String>) -> SchemaViolation {
    SchemaViolation {
        path: path.to_string(),
        field: field.to_string(),
        message: message.into(),
    }
}

fn check_value(path: &str, field: &str, kind: &FieldKind, value: &Value, out: &mut Vec<SchemaViolation>) {
    let ok = match kind {
        FieldKind::Text | FieldKind::Link | FieldKind::Gradient => value.is_string(),
        FieldKind::Number => value.is_number(),
        FieldKind::Boolean => value.is_boolean(),
        FieldKind::Image => ImageData::from_value(value).is_some(),
        FieldKind::Select(options) => value
            .as_str()
            .map(|s| options.iter().any(|o| o == s))
            .unwrap_or(false),
        FieldKind::Query => serde_json::from_value::<crate::query::QueryConfig>(value.clone()).is_ok(),
        FieldKind::Json | FieldKind::Slot => true,
        FieldKind::List(item_fields) => {
            let Some(items) = value.as_array() else {
                out.push(violation(path, field, "expected a list"));
                return;
            };
            for (i, item) in items.iter().enumerate() {
                let item_path = format!("{path}.{field}[{i}]");
                let Some(obj) = item.as_object() else {
                    out.push(violation(&item_path, field, "expected an object"));
                    continue;
                };
                for item_field in item_fields {
                    if let Some(v) = obj.get(&item_field.name).filter(|v| !v.is_null()) {
                        check_value(&item_path, &item_field.name, &item_field.kind, v, out);
                    }
                }
            }
            true
        }
    };
    if !ok {
        out.push(violation(path, field, format!("expected {}", describe(kind))));
    }
}

fn describe(kind: &FieldKind) -> &'static str {
    match kind {
        FieldKind::Text => "text",
        FieldKind::Number => "a number",
        FieldKind::Boolean => "a boolean",
        FieldKind::Link => "a link",
        FieldKind::Image => "image data",
        FieldKind::Gradient => "a gradient name",
        FieldKind::Select(_) => "one of the allowed options",
        FieldKind::List(_) => "a list",
        FieldKind::Slot => "a list of components",
        FieldKind::Query => "a query configuration",
        FieldKind::Json => "JSON",
    }
}

fn select(options: &[&str]) -> FieldKind {
    FieldKind::Select(options.iter().map(|s| s.to_string()).collect())
}

fn builtin_schemas() -> Vec<ComponentSchema> {
    use FieldKind::*;

    vec![
        ComponentSchema::new("Section")
            .field("backgroundImage", Image)
            .field("backgroundGradient", Gradient)
            .field("padding", select(&["none", "sm", "md", "lg", "xl"]))
            .field("content", Slot)
            .default_value("padding", json!("md")),
        ComponentSchema::new("Heading")
            .field("text", Text)
            .field("level", select(&["h1", "h2", "h3", "h4"]))
            .field("align", select(&["left", "center", "right"]))
            .default_value("text", json!("Heading"))
            .default_value("level", json!("h2")),
        ComponentSchema::new("Text")
            .field("text", Text)
            .field("align", select(&["left", "center", "right"]))
            .default_value("text", json!("")),
        ComponentSchema::new("Button")
            .field("label", Text)
            .field("href", Link)
            .field("variant", select(&["primary", "secondary", "outline", "ghost"]))
            .default_value("label", json!("Learn more"))
            .default_value("href", json!("#"))
            .default_value("variant", json!("primary")),
        ComponentSchema::new("Image")
            .field("image", Image)
            .field("link", Link)
            .field("caption", Text),
        ComponentSchema::new("Hero")
            .field("title", Text)
            .field("subtitle", Text)
            .field("backgroundImage", Image)
            .field("backgroundGradient", Gradient)
            .field("primaryButtonText", Text)
            .field("primaryButtonHref", Link)
            .field("secondaryButtonText", Text)
            .field("secondaryButtonHref", Link)
            .default_value("title", json!("Welcome"))
            .default_value("subtitle", json!("")),
        ComponentSchema::new("CTA")
            .field("title", Text)
            .field("description", Text)
            .field("buttonText", Text)
            .field("buttonHref", Link)
            .field("gradient", Gradient)
            .default_value("buttonText", json!("Get started")),
        ComponentSchema::new("Features")
            .field("title", Text)
            .field(
                "cards",
                List(vec![
                    FieldSchema::new("title", Text),
                    FieldSchema::new("description", Text),
                    FieldSchema::new("image", Image),
                    FieldSchema::new("link", Link),
                ]),
            )
            .default_value("cards", json!([])),
        ComponentSchema::new("Stats")
            .field(
                "stats",
                List(vec![
                    FieldSchema::new("label", Text),
                    FieldSchema::new("value", Text),
                    FieldSchema::new("gradient", Gradient),
                ]),
            )
            .default_value("stats", json!([])),
        ComponentSchema::new("TeamGrid")
            .field("title", Text)
            .field(
                "members",
                List(vec![
                    FieldSchema::new("name", Text),
                    FieldSchema::new("role", Text),
                    FieldSchema::new("photo", Image),
                ]),
            )
            .default_value("members", json!([])),
        ComponentSchema::new("CardGrid")
            .field("columns", Number)
            .field(
                "cards",
                List(vec![
                    FieldSchema::new("title", Text),
                    FieldSchema::new("description", Text),
                    FieldSchema::new("image", Image),
                    FieldSchema::new("link", Link),
                ]),
            )
            .default_value("columns", json!(3))
            .default_value("cards", json!([])),
        ComponentSchema::new("LogoCloud")
            .field(
                "logos",
                List(vec![
                    FieldSchema::new("name", Text),
                    FieldSchema::new("logo", Image),
                    FieldSchema::new("link", Link),
                ]),
            )
            .default_value("logos", json!([])),
        ComponentSchema::new("DynamicList")
            .field("title", Text)
            .field("dataSource", select(&["manual", "database"]))
            .field("collection", Text)
            .field("query", Query)
            .field("fieldMapping", Json)
            .field("items", Json)
            .field("avatar", Image)
            .field("link", Link)
            .default_value("dataSource", json!("manual"))
            .default_value("items", json!([])),
        ComponentSchema::new("Spacer")
            .field("size", select(&["sm", "md", "lg"]))
            .default_value("size", json!("md")),
    ]
}
