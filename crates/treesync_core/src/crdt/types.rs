//! Core types for the change protocol.
//!
//! This module defines the JSON-facing data structures exchanged with UI
//! layers and other replicas: serialized nodes, node specs, change commands
//! (inbound) and change notifications (outbound), plus the update records
//! kept by storage.
//!
//! All protocol types use camelCase JSON and export TypeScript bindings.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{Result, TreeSyncError};

/// Ordered attribute name → value mapping.
pub type AttributeMap = IndexMap<String, serde_json::Value>;

fn is_false(value: &bool) -> bool {
    !*value
}

// ==================== Serialized Nodes ====================

/// A plain, JSON-legible snapshot of a node.
///
/// ```json
/// {"element": {"tagName": "div", "attributes": {"$id": "c1"}, "children": []}}
/// {"text": {"delta": [{"insert": "Hello "}, {"insert": "World", "attributes": {"bold": true}}]}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "bindings/")]
pub enum SerializedNode {
    /// An element with its full attribute map (identifier included)
    Element(SerializedElement),
    /// A text run as a sequence of styled spans
    Text(SerializedText),
}

/// Serialized form of an element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct SerializedElement {
    /// Tag name
    pub tag_name: String,
    /// All attributes, including the `$id` identifier
    pub attributes: AttributeMap,
    /// Children in document order
    pub children: Vec<SerializedNode>,
}

/// Serialized form of a text run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct SerializedText {
    /// Styled spans in order
    pub delta: Vec<TextSpan>,
}

/// A run of characters sharing one set of formatting attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TextSpan {
    /// The characters of this span
    pub insert: String,
    /// Formatting attributes, absent for plain text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub attributes: Option<AttributeMap>,
}

impl TextSpan {
    /// An unformatted span.
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            insert: text.into(),
            attributes: None,
        }
    }

    /// A span carrying formatting attributes.
    pub fn formatted(text: impl Into<String>, attributes: AttributeMap) -> Self {
        Self {
            insert: text.into(),
            attributes: Some(attributes),
        }
    }
}

// ==================== Node Specs ====================

/// Description of a node to create.
///
/// Anything other than `element` or `text` is rejected when the spec is
/// deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "bindings/")]
pub enum NodeSpec {
    /// An element, optionally with children
    Element(ElementSpec),
    /// A text run. Only valid as the sole child of a `text` element.
    Text(TextSpec),
}

/// Spec for a new element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct ElementSpec {
    /// Tag name
    pub tag_name: String,
    /// Explicit identifier. Falls back to an `$id` attribute, then to a fresh one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub id: Option<String>,
    /// Attributes to set on creation
    #[serde(default)]
    #[ts(as = "Option<AttributeMap>", optional)]
    pub attributes: AttributeMap,
    /// Children to build inside the element
    #[serde(default)]
    #[ts(as = "Option<Vec<NodeSpec>>", optional)]
    pub children: Vec<NodeSpec>,
}

/// Spec for a new text run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TextSpec {
    /// Initial content
    #[serde(default)]
    #[ts(as = "Option<Vec<TextSpan>>", optional)]
    pub delta: Vec<TextSpan>,
}

impl NodeSpec {
    /// Element spec without attributes or children.
    pub fn element(tag_name: impl Into<String>) -> Self {
        NodeSpec::Element(ElementSpec {
            tag_name: tag_name.into(),
            ..Default::default()
        })
    }

    /// Element spec with an explicit identifier.
    pub fn element_with_id(tag_name: impl Into<String>, id: impl Into<String>) -> Self {
        NodeSpec::Element(ElementSpec {
            tag_name: tag_name.into(),
            id: Some(id.into()),
            ..Default::default()
        })
    }

    /// A `text` element wrapping a run with the given plain content.
    pub fn text_element(id: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        let delta = if content.is_empty() {
            Vec::new()
        } else {
            vec![TextSpan::plain(content)]
        };
        NodeSpec::Element(ElementSpec {
            tag_name: super::identity::TEXT_TAG.to_string(),
            id: Some(id.into()),
            attributes: AttributeMap::new(),
            children: vec![NodeSpec::Text(TextSpec { delta })],
        })
    }
}

impl From<SerializedNode> for NodeSpec {
    fn from(node: SerializedNode) -> Self {
        match node {
            SerializedNode::Element(element) => NodeSpec::Element(ElementSpec {
                tag_name: element.tag_name,
                id: None,
                attributes: element.attributes,
                children: element.children.into_iter().map(NodeSpec::from).collect(),
            }),
            SerializedNode::Text(text) => NodeSpec::Text(TextSpec { delta: text.delta }),
        }
    }
}

// ==================== Change Commands ====================

/// An identifier-addressed mutation request.
///
/// Present actions run in a fixed order: `delete`, `insertChildren`,
/// `deleteChildren`, `removeAttributes`, `setAttributes`, `insertText`,
/// `formatText`, `deleteText`, `undo`, `redo`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[ts(export, export_to = "bindings/")]
pub struct ChangeCommand {
    /// Target element; the document root when absent
    #[serde(rename = "nodeID")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub node_id: Option<String>,

    /// Remove the target from its parent
    #[serde(default, skip_serializing_if = "is_false")]
    #[ts(as = "Option<bool>", optional)]
    pub delete: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub insert_children: Option<InsertChildren>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub delete_children: Option<DeleteChildren>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub remove_attributes: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub set_attributes: Option<AttributeMap>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub insert_text: Option<InsertText>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub format_text: Option<FormatText>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub delete_text: Option<DeleteText>,

    /// Undo the most recent tracked change
    #[serde(default, skip_serializing_if = "is_false")]
    #[ts(as = "Option<bool>", optional)]
    pub undo: bool,

    /// Redo the most recently undone change
    #[serde(default, skip_serializing_if = "is_false")]
    #[ts(as = "Option<bool>", optional)]
    pub redo: bool,
}

/// Insert new children into the target element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct InsertChildren {
    /// Insert right after the child with this identifier (wins over `index`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub after: Option<String>,
    /// Insert at this position; append when neither `after` nor `index` is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub index: Option<u32>,
    /// Nodes to build and insert
    pub children: Vec<NodeSpec>,
}

/// Remove a run of consecutive children from the target element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct DeleteChildren {
    /// Start right after the child with this identifier (wins over `index`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub after: Option<String>,
    /// Start at this position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub index: Option<u32>,
    /// Number of children to remove
    pub length: u32,
}

/// Insert characters into the run of a `text` element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct InsertText {
    /// Position in UTF-16 code units
    pub index: u32,
    /// Characters to insert
    pub text: String,
    /// Formatting for the inserted characters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub attributes: Option<AttributeMap>,
}

/// Apply formatting to a range of a `text` element's run.
///
/// A `null` attribute value removes that formatting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct FormatText {
    /// Start position in UTF-16 code units
    pub from: u32,
    /// Range length in UTF-16 code units
    pub length: u32,
    /// Formatting to apply
    pub attributes: AttributeMap,
}

/// Remove a range of characters from a `text` element's run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct DeleteText {
    /// Start position in UTF-16 code units
    pub index: u32,
    /// Range length in UTF-16 code units
    pub length: u32,
}

impl ChangeCommand {
    /// An empty command addressed to the element with the given identifier.
    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Default::default()
        }
    }

    /// An empty command addressed to the document root.
    pub fn for_root() -> Self {
        Self::default()
    }

    /// Whether the command changes the tree itself (as opposed to only
    /// moving through history).
    pub fn has_mutations(&self) -> bool {
        self.delete
            || self.insert_children.is_some()
            || self.delete_children.is_some()
            || self.remove_attributes.is_some()
            || self.set_attributes.is_some()
            || self.insert_text.is_some()
            || self.format_text.is_some()
            || self.delete_text.is_some()
    }
}

/// Decode a JSON array of change commands.
///
/// Malformed input, unknown fields and node specs that are neither `element`
/// nor `text` all fail here with [`TreeSyncError::InvalidCommand`].
pub fn parse_commands(json: &str) -> Result<Vec<ChangeCommand>> {
    serde_json::from_str(json).map_err(|e| TreeSyncError::InvalidCommand(e.to_string()))
}

// ==================== Change Notifications ====================

/// Structured description of one deep-change event.
///
/// Exactly one of `elements` / `text` is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ChangeNotification {
    /// The event's node is the document root
    pub root: bool,
    /// Identifier of the changed element (the parent element for text changes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub target: Option<String>,
    /// Child list delta, for element events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub elements: Option<Vec<ElementDelta>>,
    /// Attribute changes, reported with their resulting values
    #[serde(default)]
    pub attributes: AttributeChanges,
    /// Character delta, for text events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub text: Option<Vec<TextDelta>>,
}

impl ChangeNotification {
    /// Encode as a JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One entry of a child list delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ElementDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub retain: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub insert: Option<Vec<SerializedNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub delete: Option<u32>,
}

impl ElementDelta {
    /// Skip over `count` unchanged children.
    pub fn retain(count: u32) -> Self {
        Self {
            retain: Some(count),
            ..Default::default()
        }
    }

    /// Children inserted at the current position.
    pub fn insert(nodes: Vec<SerializedNode>) -> Self {
        Self {
            insert: Some(nodes),
            ..Default::default()
        }
    }

    /// `count` children removed at the current position.
    pub fn delete(count: u32) -> Self {
        Self {
            delete: Some(count),
            ..Default::default()
        }
    }
}

/// One entry of a character delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TextDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub retain: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub insert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub delete: Option<u32>,
    /// Formatting of inserted characters, or formatting applied to retained ones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub attributes: Option<AttributeMap>,
}

/// Attribute changes of one event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct AttributeChanges {
    /// Added or updated attributes with their current value
    pub set: Vec<AttributeSet>,
    /// Names of removed attributes
    pub delete: Vec<String>,
}

/// An attribute and the value it holds after the change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct AttributeSet {
    pub name: String,
    pub value: serde_json::Value,
}

// ==================== Update Records ====================

/// A CRDT update record, stored for persistence and sync purposes.
#[derive(Debug, Clone)]
pub struct CrdtUpdate {
    /// Unique identifier for this update
    pub update_id: i64,

    /// Name of the document this update belongs to
    pub doc_name: String,

    /// Binary yrs update data
    pub data: Vec<u8>,

    /// Unix timestamp when this update was created (milliseconds)
    pub timestamp: i64,

    /// Origin of this update (local edit, remote sync, etc.)
    pub origin: UpdateOrigin,
}

/// Origin of a CRDT update, used to distinguish local vs remote changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOrigin {
    /// Update originated from a local change command
    Local,

    /// Update received from a remote peer
    Remote,

    /// Update from initial sync handshake
    Sync,
}

impl std::fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateOrigin::Local => write!(f, "local"),
            UpdateOrigin::Remote => write!(f, "remote"),
            UpdateOrigin::Sync => write!(f, "sync"),
        }
    }
}
