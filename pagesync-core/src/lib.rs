use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub mod backend;
pub mod cache;
pub mod collab;
pub mod query;
pub mod registry;
pub mod transform;

pub use registry::{ComponentRegistry, ComponentSchema, FieldKind, FieldSchema, SchemaViolation};
pub use transform::{NodePath, TransformError, TreeTransformer};

/// Open property bag of a component node.
pub type Props = Map<String, Value>;

/// A page as the page builder sees it: page-level settings, the ordered
/// top-level component list, and nested zone content.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct PageDocument {
    pub root: RootNode,
    #[serde(default)]
    pub content: Vec<ComponentNode>,
    #[serde(default)]
    pub zones: BTreeMap<String, Vec<ComponentNode>>,
}

impl PageDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content(content: Vec<ComponentNode>) -> Self {
        Self {
            content,
            ..Self::default()
        }
    }

    /// Children stored in the zone `zone` of the component `parent_id`.
    pub fn zone(&self, parent_id: &str, zone: &str) -> Option<&[ComponentNode]> {
        self.zones.get(&zone_key(parent_id, zone)).map(Vec::as_slice)
    }

    /// Total number of nodes held directly in `content` and the zone lists.
    /// Slot children nested inside props are not counted here.
    pub fn top_level_len(&self) -> usize {
        self.content.len() + self.zones.values().map(Vec::len).sum::<usize>()
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Builds the key under which a parent's named zone is stored.
pub fn zone_key(parent_id: &str, zone: &str) -> String {
    format!("{parent_id}:{zone}")
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct RootNode {
    #[serde(default)]
    pub props: RootProps,
}

/// Page-level configuration. Keys the page builder adds beyond the known
/// ones are preserved in `extra`.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RootProps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical_spacing: Option<String>,
    #[serde(flatten)]
    pub extra: Props,
}

/// One node of the component tree. `component_type` selects the registry
/// entry that describes `props`.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ComponentNode {
    #[serde(rename = "type")]
    pub component_type: String,
    #[serde(default)]
    pub props: Props,
}

impl ComponentNode {
    pub fn new(component_type: impl Into<String>, props: Props) -> Self {
        Self {
            component_type: component_type.into(),
            props,
        }
    }

    /// Convenience constructor from a JSON object literal.
    /// Non-object values produce an empty props bag.
    pub fn from_value(component_type: impl Into<String>, props: Value) -> Self {
        let props = match props {
            Value::Object(map) => map,
            _ => Props::new(),
        };
        Self::new(component_type, props)
    }

    pub fn id(&self) -> Option<&str> {
        self.props.get("id").and_then(Value::as_str)
    }

    pub fn is_type(&self, component_type: &str) -> bool {
        self.component_type == component_type
    }
}

/// Subset of the three top-level keys, used for partial writes.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct PartialPageDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<RootNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ComponentNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zones: Option<BTreeMap<String, Vec<ComponentNode>>>,
}

impl PartialPageDocument {
    pub fn content(content: Vec<ComponentNode>) -> Self {
        Self {
            content: Some(content),
            ..Self::default()
        }
    }

    pub fn root(root: RootNode) -> Self {
        Self {
            root: Some(root),
            ..Self::default()
        }
    }

    pub fn zones(zones: BTreeMap<String, Vec<ComponentNode>>) -> Self {
        Self {
            zones: Some(zones),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none() && self.content.is_none() && self.zones.is_none()
    }
}

impl From<PageDocument> for PartialPageDocument {
    fn from(doc: PageDocument) -> Self {
        Self {
            root: Some(doc.root),
            content: Some(doc.content),
            zones: Some(doc.zones),
        }
    }
}

/// Image reference held by image-bearing props.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ImageData {
    Url {
        url: String,
        #[serde(default)]
        alt: String,
    },
    Upload {
        #[serde(rename = "fileId")]
        file_id: String,
        url: String,
        #[serde(default)]
        alt: String,
    },
}

impl ImageData {
    pub fn url(&self) -> &str {
        match self {
            ImageData::Url { url, .. } | ImageData::Upload { url, .. } => url,
        }
    }

    pub fn alt(&self) -> &str {
        match self {
            ImageData::Url { alt, .. } | ImageData::Upload { alt, .. } => alt,
        }
    }

    pub fn file_id(&self) -> Option<&str> {
        match self {
            ImageData::Upload { file_id, .. } => Some(file_id),
            ImageData::Url { .. } => None,
        }
    }

    /// Reads an image from a prop value, if it has the image shape.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}
