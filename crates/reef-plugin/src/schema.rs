//! Entry schema graphs and the schema-mode validator.
//!
//! Whether a plugin participates in schema mode is decided once, when its
//! root loads, and frozen for the plugin's lifetime. With the mode on,
//! every entry in the subtree must advertise `schema` and carry a
//! `type_id` present in the graph the root prefetched; with it off, no
//! entry may advertise `schema`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::decode::EntryDescriptor;
use crate::error::{PluginError, Result};
use reef_types::Method;

/// One vertex of a plugin's schema graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaNode {
    /// Human-readable label for the entry kind.
    pub label: String,

    /// Methods entries of this kind advertise.
    pub methods: Vec<Method>,

    /// Whether exactly one entry of this kind exists under its parent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub singleton: Option<bool>,

    /// Prose description of the entry kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// `type_id`s of the kinds this kind may list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<String>>,

    /// JSON-Schema document for the `meta` attribute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_attribute_schema: Option<serde_json::Value>,

    /// JSON-Schema document for full `metadata` results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_schema: Option<serde_json::Value>,
}

/// A plugin's full type graph: `type_id` to node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaGraph {
    nodes: HashMap<String, SchemaNode>,
}

impl SchemaGraph {
    /// Decodes a graph from the plugin's `schema` JSON output.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|err| PluginError::Decode(format!("invalid schema graph: {err}")))
    }

    /// Looks up one node.
    pub fn node(&self, type_id: &str) -> Option<&SchemaNode> {
        self.nodes.get(type_id)
    }

    /// True when the graph knows the `type_id`.
    pub fn contains(&self, type_id: &str) -> bool {
        self.nodes.contains_key(type_id)
    }

    /// Number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Verifies every `type_id` reachable from `root_type` is present.
    ///
    /// Unreferenced nodes are permitted. Returns the first missing
    /// `type_id` as the error reason.
    pub fn check_reachable(&self, root_type: &str, root_path: &str) -> Result<()> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([root_type.to_owned()]);
        while let Some(type_id) = queue.pop_front() {
            if !seen.insert(type_id.clone()) {
                continue;
            }
            let node = self.nodes.get(&type_id).ok_or_else(|| PluginError::Schema {
                path: root_path.to_owned(),
                reason: format!("schema graph is missing reachable type '{type_id}'"),
            })?;
            if let Some(children) = &node.children {
                queue.extend(children.iter().cloned());
            }
        }
        Ok(())
    }
}

/// The frozen schema mode of one loaded plugin.
#[derive(Debug, Clone)]
pub enum SchemaMode {
    /// The root advertised `schema`; the graph it prefetched binds every
    /// entry in the subtree.
    On(Arc<SchemaGraph>),
    /// No entry in the subtree may advertise `schema`.
    Off,
}

impl SchemaMode {
    /// The stored graph, when schema mode is on.
    pub fn graph(&self) -> Option<&Arc<SchemaGraph>> {
        match self {
            SchemaMode::On(graph) => Some(graph),
            SchemaMode::Off => None,
        }
    }

    /// Validates one freshly decoded entry against the mode.
    ///
    /// `path` is the virtual path the entry will materialize at, used in
    /// error messages. Non-root entries must not prefetch `schema`; that
    /// is checked here because descriptor decoding itself is
    /// position-blind.
    pub fn check_entry(&self, desc: &EntryDescriptor, path: &str) -> Result<()> {
        match self {
            SchemaMode::On(graph) => {
                if !desc.methods.contains(&Method::Schema) {
                    return Err(PluginError::Schema {
                        path: path.to_owned(),
                        reason: "schema mode is on but the entry does not advertise schema".into(),
                    });
                }
                if desc.prefetched.contains_key(&Method::Schema) {
                    return Err(PluginError::Schema {
                        path: path.to_owned(),
                        reason: "only the plugin root may prefetch its schema".into(),
                    });
                }
                let type_id = desc.type_id.as_deref().filter(|t| !t.is_empty()).ok_or_else(
                    || PluginError::Schema {
                        path: path.to_owned(),
                        reason: "schema mode is on but the entry carries no type_id".into(),
                    },
                )?;
                if !graph.contains(type_id) {
                    return Err(PluginError::Schema {
                        path: path.to_owned(),
                        reason: format!("type_id '{type_id}' is not in the plugin's schema graph"),
                    });
                }
                Ok(())
            }
            SchemaMode::Off => {
                if desc.methods.contains(&Method::Schema) {
                    return Err(PluginError::Schema {
                        path: path.to_owned(),
                        reason: "schema mode is off but the entry advertises schema".into(),
                    });
                }
                Ok(())
            }
        }
    }

    /// Validates a listed child's type against its parent's declared
    /// child set, when the parent's node declares one.
    pub fn check_child_type(
        &self,
        parent_type: Option<&str>,
        child: &EntryDescriptor,
        child_path: &str,
    ) -> Result<()> {
        let SchemaMode::On(graph) = self else {
            return Ok(());
        };
        let Some(parent_type) = parent_type else {
            return Ok(());
        };
        let Some(expected) = graph.node(parent_type).and_then(|n| n.children.as_ref()) else {
            return Ok(());
        };
        let child_type = child.type_id.as_deref().unwrap_or("");
        if !expected.iter().any(|t| t == child_type) {
            return Err(PluginError::Schema {
                path: child_path.to_owned(),
                reason: format!(
                    "type_id '{child_type}' is not a declared child of '{parent_type}'"
                ),
            });
        }
        Ok(())
    }
}
