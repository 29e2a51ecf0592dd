//! Bulk, type-scoped rewrites over a whole `PageDocument`.
//!
//! Every operation walks `content`, each zone list and the nested children
//! held in slot fields the registry declares. Inputs are never mutated:
//! results come back as `Cow::Borrowed(input)` when nothing matched and as
//! `Cow::Owned` when something changed, so callers get cheap change
//! detection with `matches!(out, Cow::Owned(_))`.
//!
//! None of this is concurrency-aware. Callers editing a live session push
//! the result back through `set_data`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::query::QueryConfig;
use crate::registry::ComponentRegistry;
use crate::{ComponentNode, PageDocument, Props};

/// Object props holding an image directly.
pub const IMAGE_FIELDS: &[&str] = &["backgroundImage", "image", "avatar"];
/// `(list prop, item key)` pairs holding images inside list items.
pub const IMAGE_LIST_FIELDS: &[(&str, &str)] =
    &[("cards", "image"), ("members", "photo"), ("logos", "logo")];
/// String props holding links.
pub const LINK_FIELDS: &[&str] =
    &["href", "link", "primaryButtonHref", "secondaryButtonHref", "buttonHref"];
pub const LINK_LIST_FIELDS: &[(&str, &str)] = &[("cards", "link")];
pub const GRADIENT_FIELDS: &[&str] = &["backgroundGradient", "gradient"];
pub const GRADIENT_LIST_FIELDS: &[(&str, &str)] = &[("stats", "gradient")];

/// Props rewritten when a component switches between static and
/// collection-backed data.
pub const BINDING_FIELDS: &[&str] = &["collection", "query", "fieldMapping"];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransformError {
    #[error("unknown component type: {0}")]
    UnknownComponentType(String),
    #[error("failed to serialize binding: {0}")]
    Serialization(String),
}

/// Where a node sits in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodePath {
    Content(usize),
    Zone { key: String, index: usize },
    Slot { parent: Box<NodePath>, field: String, index: usize },
}

impl NodePath {
    /// Nesting depth; top-level content and zone entries are 0.
    pub fn depth(&self) -> usize {
        match self {
            NodePath::Content(_) | NodePath::Zone { .. } => 0,
            NodePath::Slot { parent, .. } => parent.depth() + 1,
        }
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodePath::Content(i) => write!(f, "content[{i}]"),
            NodePath::Zone { key, index } => write!(f, "zones[{key}][{index}]"),
            NodePath::Slot { parent, field, index } => write!(f, "{parent}.{field}[{index}]"),
        }
    }
}

/// Collection-backed data binding applied by `convert_to_database`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseBinding {
    pub collection: String,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub field_mapping: BTreeMap<String, String>,
}

type NodeFn<'f> = dyn FnMut(&ComponentNode) -> Option<Props> + 'f;

pub struct TreeTransformer<'r> {
    registry: &'r ComponentRegistry,
}

impl<'r> TreeTransformer<'r> {
    pub fn new(registry: &'r ComponentRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ComponentRegistry {
        self.registry
    }

    // ---------------------------------------------------------------
    // Traversal
    // ---------------------------------------------------------------

    /// Visits every node, parents before their slot children.
    pub fn walk(&self, doc: &PageDocument, visitor: &mut dyn FnMut(&NodePath, &ComponentNode)) {
        for (i, node) in doc.content.iter().enumerate() {
            self.walk_node(&NodePath::Content(i), node, visitor);
        }
        for (key, nodes) in &doc.zones {
            for (index, node) in nodes.iter().enumerate() {
                let path = NodePath::Zone { key: key.clone(), index };
                self.walk_node(&path, node, visitor);
            }
        }
    }

    fn walk_node(
        &self,
        path: &NodePath,
        node: &ComponentNode,
        visitor: &mut dyn FnMut(&NodePath, &ComponentNode),
    ) {
        visitor(path, node);
        for field in self.registry.slot_fields(&node.component_type) {
            let Some(children) = slot_children(&node.props, field) else {
                continue;
            };
            for (index, child) in children.iter().enumerate() {
                let child_path = NodePath::Slot {
                    parent: Box::new(path.clone()),
                    field: field.to_string(),
                    index,
                };
                self.walk_node(&child_path, child, visitor);
            }
        }
    }

    /// Rewrites nodes through `f`, which returns replacement props for the
    /// nodes it changes.
    pub fn map_nodes<'d>(&self, doc: &'d PageDocument, f: &mut NodeFn<'_>) -> Cow<'d, PageDocument> {
        let content = self.map_list(&doc.content, f);

        let mut zones: Option<BTreeMap<String, Vec<ComponentNode>>> = None;
        for (key, nodes) in &doc.zones {
            if let Some(rewritten) = self.map_list(nodes, f) {
                zones
                    .get_or_insert_with(|| doc.zones.clone())
                    .insert(key.clone(), rewritten);
            }
        }

        if content.is_none() && zones.is_none() {
            return Cow::Borrowed(doc);
        }
        Cow::Owned(PageDocument {
            root: doc.root.clone(),
            content: content.unwrap_or_else(|| doc.content.clone()),
            zones: zones.unwrap_or_else(|| doc.zones.clone()),
        })
    }

    fn map_list(&self, nodes: &[ComponentNode], f: &mut NodeFn<'_>) -> Option<Vec<ComponentNode>> {
        let mut out: Option<Vec<ComponentNode>> = None;
        for (i, node) in nodes.iter().enumerate() {
            match self.map_node(node, f) {
                Some(rewritten) => out.get_or_insert_with(|| nodes[..i].to_vec()).push(rewritten),
                None => {
                    if let Some(out) = out.as_mut() {
                        out.push(node.clone());
                    }
                }
            }
        }
        out
    }

    fn map_node(&self, node: &ComponentNode, f: &mut NodeFn<'_>) -> Option<ComponentNode> {
        let mut props: Cow<'_, Props> = match f(node) {
            Some(replaced) => Cow::Owned(replaced),
            None => Cow::Borrowed(&node.props),
        };

        for field in self.registry.slot_fields(&node.component_type) {
            let rewritten = match props.get(field).and_then(Value::as_array) {
                Some(items) => self.map_slot(items, f),
                None => None,
            };
            if let Some(items) = rewritten {
                props.to_mut().insert(field.to_string(), Value::Array(items));
            }
        }

        match props {
            Cow::Owned(props) => Some(ComponentNode {
                component_type: node.component_type.clone(),
                props,
            }),
            Cow::Borrowed(_) => None,
        }
    }

    /// Rewrites slot items in place: only an item's `props` is replaced, so
    /// any other keys stored next to `type` survive.
    fn map_slot(&self, items: &[Value], f: &mut NodeFn<'_>) -> Option<Vec<Value>> {
        let children = slot_children_of(items)?;
        let mut out: Option<Vec<Value>> = None;
        for (i, (item, child)) in items.iter().zip(&children).enumerate() {
            match self.map_node(child, f) {
                Some(rewritten) => {
                    let mut item = item.clone();
                    if let Some(obj) = item.as_object_mut() {
                        obj.insert("props".to_string(), Value::Object(rewritten.props));
                    }
                    out.get_or_insert_with(|| items[..i].to_vec()).push(item);
                }
                None => {
                    if let Some(out) = out.as_mut() {
                        out.push(item.clone());
                    }
                }
            }
        }
        out
    }

    // ---------------------------------------------------------------
    // Bulk updates
    // ---------------------------------------------------------------

    /// Merges `updater(props)` over the props of every node of `component_type`.
    pub fn update_components_by_type<'d, F>(
        &self,
        doc: &'d PageDocument,
        component_type: &str,
        updater: F,
    ) -> Result<Cow<'d, PageDocument>, TransformError>
    where
        F: Fn(&Props) -> Props,
    {
        self.registry.require(component_type)?;
        Ok(self.map_nodes(doc, &mut |node| {
            if !node.is_type(component_type) {
                return None;
            }
            let mut merged = node.props.clone();
            merged.extend(updater(&node.props));
            (merged != node.props).then_some(merged)
        }))
    }

    /// Rewrites the `url` of every recognised image prop. Props outside
    /// `IMAGE_FIELDS`/`IMAGE_LIST_FIELDS` are left alone even when they
    /// hold image-shaped data.
    pub fn update_all_image_urls<'d, F>(&self, doc: &'d PageDocument, transform: F) -> Cow<'d, PageDocument>
    where
        F: Fn(&str) -> String,
    {
        let rewrite = |value: &mut Value| -> bool {
            let Some(url) = value.get("url").and_then(Value::as_str) else {
                return false;
            };
            let next = transform(url);
            if next == url {
                return false;
            }
            value["url"] = Value::String(next);
            true
        };
        self.map_nodes(doc, &mut |node| {
            rewrite_fields(&node.props, IMAGE_FIELDS, IMAGE_LIST_FIELDS, &mut |v| {
                v.is_object() && rewrite(v)
            })
        })
    }

    /// Replaces `old_domain` with `new_domain` inside link props.
    ///
    /// This is a plain substring replacement, not a URL-aware rewrite:
    /// `https://notold.com` becomes `https://notnew.com` when replacing
    /// `old.com`.
    pub fn update_all_links<'d>(
        &self,
        doc: &'d PageDocument,
        old_domain: &str,
        new_domain: &str,
    ) -> Cow<'d, PageDocument> {
        if old_domain.is_empty() || old_domain == new_domain {
            return Cow::Borrowed(doc);
        }
        self.map_nodes(doc, &mut |node| {
            rewrite_fields(&node.props, LINK_FIELDS, LINK_LIST_FIELDS, &mut |v| match v.as_str() {
                Some(s) if s.contains(old_domain) => {
                    *v = Value::String(s.replace(old_domain, new_domain));
                    true
                }
                _ => false,
            })
        })
    }

    /// Renames a gradient token wherever it is used verbatim.
    pub fn update_gradients<'d>(&self, doc: &'d PageDocument, old_name: &str, new_name: &str) -> Cow<'d, PageDocument> {
        if old_name == new_name {
            return Cow::Borrowed(doc);
        }
        self.map_nodes(doc, &mut |node| {
            rewrite_fields(&node.props, GRADIENT_FIELDS, GRADIENT_LIST_FIELDS, &mut |v| {
                if v.as_str() == Some(old_name) {
                    *v = Value::String(new_name.to_string());
                    true
                } else {
                    false
                }
            })
        })
    }

    // ---------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------

    pub fn count_components_by_type(&self, doc: &PageDocument) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        self.walk(doc, &mut |_, node| {
            *counts.entry(node.component_type.clone()).or_insert(0) += 1;
        });
        counts
    }

    /// Owned copies: slot children only exist as JSON inside their parent.
    pub fn find_components<P>(&self, doc: &PageDocument, predicate: P) -> Vec<ComponentNode>
    where
        P: Fn(&ComponentNode) -> bool,
    {
        let mut found = Vec::new();
        self.walk(doc, &mut |_, node| {
            if predicate(node) {
                found.push(node.clone());
            }
        });
        found
    }

    // ---------------------------------------------------------------
    // Structural edits (top level only)
    // ---------------------------------------------------------------

    /// Drops matching entries from `content` and from each zone list.
    /// A removed container takes its whole subtree with it.
    pub fn remove_components_by_type<'d>(
        &self,
        doc: &'d PageDocument,
        component_type: &str,
    ) -> Result<Cow<'d, PageDocument>, TransformError> {
        self.registry.require(component_type)?;

        let matches = doc.content.iter().any(|n| n.is_type(component_type))
            || doc.zones.values().flatten().any(|n| n.is_type(component_type));
        if !matches {
            return Ok(Cow::Borrowed(doc));
        }

        let keep = |nodes: &Vec<ComponentNode>| -> Vec<ComponentNode> {
            nodes.iter().filter(|n| !n.is_type(component_type)).cloned().collect()
        };
        Ok(Cow::Owned(PageDocument {
            root: doc.root.clone(),
            content: keep(&doc.content),
            zones: doc.zones.iter().map(|(k, v)| (k.clone(), keep(v))).collect(),
        }))
    }

    /// Appends a copy of every matching top-level `content` entry to the end
    /// of `content`, with `-copy` appended to the copy's `id`.
    pub fn duplicate_components_by_type<'d>(
        &self,
        doc: &'d PageDocument,
        component_type: &str,
    ) -> Result<Cow<'d, PageDocument>, TransformError> {
        self.registry.require(component_type)?;

        let copies: Vec<ComponentNode> = doc
            .content
            .iter()
            .filter(|n| n.is_type(component_type))
            .map(|n| {
                let mut copy = n.clone();
                if let Some(id) = n.id() {
                    copy.props.insert("id".to_string(), Value::String(format!("{id}-copy")));
                }
                copy
            })
            .collect();
        if copies.is_empty() {
            return Ok(Cow::Borrowed(doc));
        }

        let mut out = doc.clone();
        out.content.extend(copies);
        Ok(Cow::Owned(out))
    }

    // ---------------------------------------------------------------
    // Data binding
    // ---------------------------------------------------------------

    pub fn convert_to_database<'d>(
        &self,
        doc: &'d PageDocument,
        component_type: &str,
        binding: &DatabaseBinding,
    ) -> Result<Cow<'d, PageDocument>, TransformError> {
        let query = serde_json::to_value(&binding.query)
            .map_err(|e| TransformError::Serialization(e.to_string()))?;
        let mapping: Map<String, Value> = binding
            .field_mapping
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();

        let mut patch = Props::new();
        patch.insert("dataSource".into(), Value::String("database".into()));
        patch.insert("collection".into(), Value::String(binding.collection.clone()));
        patch.insert("query".into(), query);
        patch.insert("fieldMapping".into(), Value::Object(mapping));

        self.update_components_by_type(doc, component_type, |_| patch.clone())
    }

    pub fn reset_to_manual<'d>(
        &self,
        doc: &'d PageDocument,
        component_type: &str,
    ) -> Result<Cow<'d, PageDocument>, TransformError> {
        self.registry.require(component_type)?;
        Ok(self.map_nodes(doc, &mut |node| {
            if !node.is_type(component_type) {
                return None;
            }
            let mut props = node.props.clone();
            props.insert("dataSource".into(), Value::String("manual".into()));
            for field in BINDING_FIELDS {
                props.remove(*field);
            }
            (props != node.props).then_some(props)
        }))
    }
}

/// Parses the component nodes held in a slot prop. Entries that are not
/// component nodes make the whole slot unreadable.
fn slot_children(props: &Props, field: &str) -> Option<Vec<ComponentNode>> {
    slot_children_of(props.get(field)?.as_array()?)
}

fn slot_children_of(items: &[Value]) -> Option<Vec<ComponentNode>> {
    items
        .iter()
        .map(|item| serde_json::from_value(item.clone()).ok())
        .collect()
}

/// Applies `edit` to the direct `fields` and the `(list, key)` item fields
/// of `props`. Returns the edited copy when anything changed.
fn rewrite_fields(
    props: &Props,
    fields: &[&str],
    list_fields: &[(&str, &str)],
    edit: &mut dyn FnMut(&mut Value) -> bool,
) -> Option<Props> {
    let touches = fields.iter().any(|f| props.contains_key(*f))
        || list_fields.iter().any(|(list, _)| props.contains_key(*list));
    if !touches {
        return None;
    }

    let mut out = props.clone();
    let mut changed = false;
    for field in fields {
        if let Some(value) = out.get_mut(*field) {
            changed |= edit(value);
        }
    }
    for (list, key) in list_fields {
        if let Some(Value::Array(items)) = out.get_mut(*list) {
            for item in items.iter_mut() {
                if let Some(value) = item.as_object_mut().and_then(|o| o.get_mut(*key)) {
                    changed |= edit(value);
                }
            }
        }
    }
    changed.then_some(out)
}
