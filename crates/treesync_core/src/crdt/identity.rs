//! Stable node identity.
//!
//! Every element carries its logical identifier in the reserved `$id`
//! attribute. Identifiers are the only addresses that cross message
//! boundaries: positions shift under concurrent edits, identifiers never do.
//!
//! Resolution is a depth-first pre-order search from the document root.
//! Deleted elements are no longer reachable, so a stale identifier resolves
//! to "not found" rather than to whatever node took its old place.

use yrs::{Any, Out, ReadTxn, Xml, XmlElementRef, XmlFragment, XmlFragmentRef, XmlOut};

use crate::error::{Result, TreeSyncError};

/// Attribute holding an element's logical identifier.
pub const ID_ATTRIBUTE: &str = "$id";

/// Tag of the elements whose sole child is a text run.
pub const TEXT_TAG: &str = "text";

/// Return `explicit` when it is a non-empty identifier, otherwise a fresh UUID.
pub fn assign_identifier(explicit: Option<&str>) -> String {
    match explicit {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => uuid::Uuid::new_v4().to_string(),
    }
}

/// A node that can be addressed by a change command.
#[derive(Debug, Clone)]
pub enum Target {
    /// The document root
    Root(XmlFragmentRef),
    /// An element, found by identifier
    Element(XmlElementRef),
}

impl Target {
    /// Short description for error messages.
    pub fn describe(&self) -> String {
        match self {
            Target::Root(_) => "document root".to_string(),
            Target::Element(element) => format!("<{}>", element.tag()),
        }
    }
}

/// Resolve a command target. An absent or empty identifier means the root.
pub fn resolve<T: ReadTxn>(txn: &T, root: &XmlFragmentRef, node_id: Option<&str>) -> Result<Target> {
    match node_id.filter(|id| !id.is_empty()) {
        None => Ok(Target::Root(root.clone())),
        Some(id) => find_element(txn, root, id)
            .map(Target::Element)
            .ok_or_else(|| TreeSyncError::NotFound(id.to_string())),
    }
}

/// Read an element's identifier.
pub fn element_id<T: ReadTxn>(txn: &T, element: &XmlElementRef) -> Option<String> {
    match element.get_attribute(txn, ID_ATTRIBUTE) {
        Some(Out::Any(Any::String(id))) => Some(id.to_string()),
        _ => None,
    }
}

/// Depth-first pre-order search for the element with identifier `id`
/// anywhere below `scope` (the scope itself is not compared).
pub fn find_element<T, F>(txn: &T, scope: &F, id: &str) -> Option<XmlElementRef>
where
    T: ReadTxn,
    F: XmlFragment,
{
    let mut stack = child_elements(txn, scope);
    stack.reverse();
    while let Some(element) = stack.pop() {
        if element_id(txn, &element).as_deref() == Some(id) {
            return Some(element);
        }
        let mut children = child_elements(txn, &element);
        children.reverse();
        stack.extend(children);
    }
    None
}

/// Position of `node` among the children of `parent`, by structural identity.
pub fn child_index_of<T, F>(txn: &T, parent: &F, node: &XmlElementRef) -> Option<u32>
where
    T: ReadTxn,
    F: XmlFragment,
{
    (0..parent.len(txn)).find(
        |&index| matches!(parent.get(txn, index), Some(XmlOut::Element(child)) if &child == node),
    )
}

/// Identifiers of the immediate children, in order (`None` for text runs
/// and identifier-less elements).
pub fn child_ids<T, F>(txn: &T, parent: &F) -> Vec<Option<String>>
where
    T: ReadTxn,
    F: XmlFragment,
{
    (0..parent.len(txn))
        .map(|index| match parent.get(txn, index) {
            Some(XmlOut::Element(child)) => element_id(txn, &child),
            _ => None,
        })
        .collect()
}

fn child_elements<T, F>(txn: &T, parent: &F) -> Vec<XmlElementRef>
where
    T: ReadTxn,
    F: XmlFragment,
{
    (0..parent.len(txn))
        .filter_map(|index| match parent.get(txn, index) {
            Some(XmlOut::Element(child)) => Some(child),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{Doc, Transact, XmlElementPrelim};

    fn element(
        txn: &mut yrs::TransactionMut,
        parent: &impl XmlFragment,
        index: u32,
        tag: &str,
        id: &str,
    ) -> XmlElementRef {
        let child = parent.insert(txn, index, XmlElementPrelim::empty(tag));
        child.insert_attribute(txn, ID_ATTRIBUTE, Any::String(id.into()));
        child
    }

    #[test]
    fn test_assign_identifier() {
        assert_eq!(assign_identifier(Some("abc")), "abc");

        let generated = assign_identifier(None);
        assert!(uuid::Uuid::parse_str(&generated).is_ok());

        let from_empty = assign_identifier(Some(""));
        assert!(!from_empty.is_empty());
        assert_ne!(from_empty, generated);
    }

    #[test]
    fn test_resolve_root_and_nested() {
        let doc = Doc::new();
        let root = doc.get_or_insert_xml_fragment("document");
        {
            let mut txn = doc.transact_mut();
            let a = element(&mut txn, &root, 0, "div", "a");
            element(&mut txn, &a, 0, "span", "b");
            element(&mut txn, &root, 1, "div", "c");
        }

        let txn = doc.transact();
        assert!(matches!(resolve(&txn, &root, None), Ok(Target::Root(_))));
        assert!(matches!(resolve(&txn, &root, Some("")), Ok(Target::Root(_))));

        match resolve(&txn, &root, Some("b")).unwrap() {
            Target::Element(found) => assert_eq!(found.tag().as_ref(), "span"),
            Target::Root(_) => panic!("expected element"),
        }

        assert!(matches!(
            resolve(&txn, &root, Some("missing")),
            Err(TreeSyncError::NotFound(id)) if id == "missing"
        ));
    }

    #[test]
    fn test_deleted_identifier_is_not_found() {
        let doc = Doc::new();
        let root = doc.get_or_insert_xml_fragment("document");
        {
            let mut txn = doc.transact_mut();
            element(&mut txn, &root, 0, "div", "a");
            element(&mut txn, &root, 1, "div", "b");
        }
        {
            let mut txn = doc.transact_mut();
            root.remove_range(&mut txn, 0, 1);
        }

        let txn = doc.transact();
        assert!(find_element(&txn, &root, "a").is_none());
        assert!(find_element(&txn, &root, "b").is_some());
    }

    #[test]
    fn test_identifier_survives_reordering() {
        let doc = Doc::new();
        let root = doc.get_or_insert_xml_fragment("document");
        {
            let mut txn = doc.transact_mut();
            element(&mut txn, &root, 0, "p", "x");
        }
        let before = {
            let txn = doc.transact();
            find_element(&txn, &root, "x").unwrap()
        };
        {
            let mut txn = doc.transact_mut();
            element(&mut txn, &root, 0, "p", "y");
            element(&mut txn, &root, 0, "p", "z");
        }

        let txn = doc.transact();
        let after = find_element(&txn, &root, "x").unwrap();
        assert!(after == before);
        assert_eq!(child_index_of(&txn, &root, &after), Some(2));
        assert_eq!(
            child_ids(&txn, &root),
            vec![Some("z".to_string()), Some("y".to_string()), Some("x".to_string())]
        );
    }
}
