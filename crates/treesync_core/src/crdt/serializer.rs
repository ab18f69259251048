//! Tree serialization.
//!
//! Converts live tree nodes into [`SerializedNode`] values. The identifier is
//! an ordinary attribute in the output, so rebuilding a serialized subtree
//! with [`prepare_nodes`](super::builder::prepare_nodes) keeps every identifier.

use yrs::types::text::YChange;
use yrs::{Any, Out, ReadTxn, Text, Xml, XmlElementRef, XmlFragment, XmlOut, XmlTextRef};

use super::builder::utf16_len;
use super::types::{AttributeMap, SerializedElement, SerializedNode, SerializedText, TextSpan};
use super::value::{attrs_to_map, out_to_json};
use crate::error::{Result, TreeSyncError};

/// A node of the synchronized tree.
///
/// The tree holds exactly two kinds of nodes. Anything else reported by the
/// engine is converted into a [`TreeSyncError::ProtocolViolation`] at the
/// point it enters this layer.
#[derive(Debug, Clone)]
pub enum TreeNode {
    /// An element with attributes and children
    Element(XmlElementRef),
    /// A run of styled characters
    Text(XmlTextRef),
}

impl TryFrom<XmlOut> for TreeNode {
    type Error = TreeSyncError;

    fn try_from(node: XmlOut) -> Result<Self> {
        match node {
            XmlOut::Element(element) => Ok(TreeNode::Element(element)),
            XmlOut::Text(text) => Ok(TreeNode::Text(text)),
            XmlOut::Fragment(_) => Err(TreeSyncError::ProtocolViolation(
                "nested XML fragment in the document tree".to_string(),
            )),
        }
    }
}

impl TryFrom<&Out> for TreeNode {
    type Error = TreeSyncError;

    fn try_from(value: &Out) -> Result<Self> {
        match value {
            Out::YXmlElement(element) => Ok(TreeNode::Element(element.clone())),
            Out::YXmlText(text) => Ok(TreeNode::Text(text.clone())),
            other => Err(TreeSyncError::ProtocolViolation(format!(
                "unexpected value in the document tree: {:?}",
                other
            ))),
        }
    }
}

/// Serialize a node and everything below it.
pub fn serialize<T: ReadTxn>(txn: &T, node: &TreeNode) -> Result<SerializedNode> {
    match node {
        TreeNode::Element(element) => Ok(SerializedNode::Element(serialize_element(txn, element)?)),
        TreeNode::Text(text) => Ok(SerializedNode::Text(SerializedText {
            delta: text_spans(txn, text),
        })),
    }
}

/// Serialize every child of a container, in order.
pub fn serialize_children<T, F>(txn: &T, parent: &F) -> Result<Vec<SerializedNode>>
where
    T: ReadTxn,
    F: XmlFragment,
{
    let mut children = Vec::new();
    for index in 0..parent.len(txn) {
        if let Some(child) = parent.get(txn, index) {
            children.push(serialize(txn, &TreeNode::try_from(child)?)?);
        }
    }
    Ok(children)
}

fn serialize_element<T: ReadTxn>(txn: &T, element: &XmlElementRef) -> Result<SerializedElement> {
    Ok(SerializedElement {
        tag_name: element.tag().to_string(),
        attributes: element_attributes(txn, element),
        children: serialize_children(txn, element)?,
    })
}

/// All attributes of an element, sorted by name.
pub fn element_attributes<T: ReadTxn>(txn: &T, element: &XmlElementRef) -> AttributeMap {
    let mut attributes: Vec<(String, serde_json::Value)> = element
        .attributes(txn)
        .map(|(name, value)| (name.to_string(), out_to_json(txn, &value)))
        .collect();
    attributes.sort_by(|a, b| a.0.cmp(&b.0));
    attributes.into_iter().collect()
}

/// Content of a text run as styled spans.
pub fn text_spans<T: ReadTxn>(txn: &T, text: &XmlTextRef) -> Vec<TextSpan> {
    text.diff(txn, YChange::identity)
        .into_iter()
        .map(|chunk| TextSpan {
            insert: match &chunk.insert {
                Out::Any(Any::String(s)) => s.to_string(),
                other => other.clone().to_string(txn),
            },
            attributes: chunk.attributes.map(|attrs| attrs_to_map(&attrs)),
        })
        .collect()
}

/// Length of a text run in UTF-16 code units. An embed counts as one unit.
pub fn text_len<T: ReadTxn>(txn: &T, text: &XmlTextRef) -> u32 {
    text.diff(txn, YChange::identity)
        .iter()
        .map(|chunk| match &chunk.insert {
            Out::Any(Any::String(s)) => utf16_len(s),
            _ => 1,
        })
        .sum()
}
