//! Node construction from specs.
//!
//! Building is split in two steps so that a change command either applies
//! completely or not at all:
//!
//! 1. [`prepare_nodes`] validates the specs and fixes every identifier,
//!    without touching the tree.
//! 2. [`insert_nodes`] writes the prepared nodes; it cannot fail.
//!
//! The text-run invariant is enforced in the first step: a text spec is only
//! accepted as the sole child of a `text` element, and a `text` element
//! without children gets an empty run.

use std::sync::Arc;

use yrs::{Any, Text, TransactionMut, Xml, XmlElementPrelim, XmlFragment, XmlTextPrelim};

use super::identity::{ID_ATTRIBUTE, TEXT_TAG, assign_identifier};
use super::types::{AttributeMap, ElementSpec, NodeSpec, TextSpan};
use super::value::{attrs_from_map, json_to_any};
use crate::error::{Result, TreeSyncError};

/// A validated node, ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedNode {
    /// An element with its final identifier
    Element {
        /// Tag name
        tag_name: String,
        /// Identifier, written as the `$id` attribute
        id: String,
        /// Attributes other than the identifier
        attributes: AttributeMap,
        /// Children, in order
        children: Vec<PreparedNode>,
    },
    /// A text run with its initial content
    Text {
        /// Styled spans, in order
        delta: Vec<TextSpan>,
    },
}

impl PreparedNode {
    /// Identifier of a prepared element.
    pub fn id(&self) -> Option<&str> {
        match self {
            PreparedNode::Element { id, .. } => Some(id),
            PreparedNode::Text { .. } => None,
        }
    }
}

/// Validate specs destined for an ordinary container and assign identifiers.
pub fn prepare_nodes(specs: &[NodeSpec]) -> Result<Vec<PreparedNode>> {
    specs
        .iter()
        .map(|spec| match spec {
            NodeSpec::Element(element) => prepare_element(element),
            NodeSpec::Text(_) => Err(misplaced_text()),
        })
        .collect()
}

fn prepare_element(spec: &ElementSpec) -> Result<PreparedNode> {
    if spec.tag_name.is_empty() {
        return Err(TreeSyncError::InvalidCommand(
            "element spec without a tag name".to_string(),
        ));
    }

    let explicit = spec
        .id
        .as_deref()
        .filter(|id| !id.is_empty())
        .or_else(|| spec.attributes.get(ID_ATTRIBUTE).and_then(|v| v.as_str()));
    let id = assign_identifier(explicit);

    let attributes: AttributeMap = spec
        .attributes
        .iter()
        .filter(|(name, _)| name.as_str() != ID_ATTRIBUTE)
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    let children = if spec.tag_name == TEXT_TAG {
        match spec.children.as_slice() {
            [] => vec![PreparedNode::Text { delta: Vec::new() }],
            [NodeSpec::Text(text)] => vec![PreparedNode::Text {
                delta: text.delta.clone(),
            }],
            _ => {
                return Err(TreeSyncError::InvalidCommand(format!(
                    "<{}> element must contain exactly one text run",
                    TEXT_TAG
                )));
            }
        }
    } else {
        prepare_nodes(&spec.children)?
    };

    Ok(PreparedNode::Element {
        tag_name: spec.tag_name.clone(),
        id,
        attributes,
        children,
    })
}

fn misplaced_text() -> TreeSyncError {
    TreeSyncError::InvalidCommand(format!(
        "text runs may only appear as the sole child of a <{}> element",
        TEXT_TAG
    ))
}

/// Write prepared nodes into `parent`, starting at `index`.
pub fn insert_nodes<F: XmlFragment>(
    txn: &mut TransactionMut,
    parent: &F,
    index: u32,
    nodes: &[PreparedNode],
) {
    for (offset, node) in nodes.iter().enumerate() {
        insert_node(txn, parent, index + offset as u32, node);
    }
}

fn insert_node<F: XmlFragment>(txn: &mut TransactionMut, parent: &F, index: u32, node: &PreparedNode) {
    match node {
        PreparedNode::Element {
            tag_name,
            id,
            attributes,
            children,
        } => {
            let element = parent.insert(txn, index, XmlElementPrelim::empty(tag_name.as_str()));
            element.insert_attribute(txn, ID_ATTRIBUTE, Any::String(Arc::from(id.as_str())));
            for (name, value) in attributes {
                element.insert_attribute(txn, name.as_str(), json_to_any(value));
            }
            insert_nodes(txn, &element, 0, children);
        }
        PreparedNode::Text { delta } => {
            let run = parent.insert(txn, index, XmlTextPrelim::new(""));
            // Write the characters first, then format, so no span inherits
            // the formatting of the one before it.
            let content: String = delta.iter().map(|span| span.insert.as_str()).collect();
            if !content.is_empty() {
                run.insert(txn, 0, &content);
            }
            let mut start = 0;
            for span in delta {
                let len = utf16_len(&span.insert);
                if let Some(attributes) = span.attributes.as_ref().filter(|a| !a.is_empty()) {
                    run.format(txn, start, len, attrs_from_map(attributes));
                }
                start += len;
            }
        }
    }
}

/// Length of a string in UTF-16 code units, the unit of every text offset.
pub fn utf16_len(s: &str) -> u32 {
    s.encode_utf16().count() as u32
}
