//! Change observation.
//!
//! [`ChangeObserver`] subscribes to the deep-change feed of the document
//! root and translates every engine event into one [`ChangeNotification`].
//!
//! Translation has to happen inside the engine callback, because the
//! transaction that describes the change only lives that long. The callback
//! cannot hand notifications to user code directly: a sink that edits the
//! document would need a new transaction while the current one is still
//! open. Translated notifications are therefore queued, and the replica
//! drains the queue as soon as the transaction has committed (see
//! [`Replica`](super::Replica)).
//!
//! Events are never merged: a batch of three events yields three
//! notifications, in the engine's order.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use yrs::types::xml::{XmlEvent, XmlTextEvent};
use yrs::types::{Change, Delta, EntryChange, Event};
use yrs::{Any, DeepObservable, Out, Subscription, TransactionMut, Xml, XmlFragmentRef, XmlOut};

use super::identity::element_id;
use super::serializer::{TreeNode, serialize};
use super::types::{AttributeChanges, AttributeSet, ChangeNotification, ElementDelta, TextDelta};
use super::value::{attrs_to_map, out_to_json};
use crate::error::{Result, TreeSyncError};

type Queue = Arc<Mutex<Vec<Result<ChangeNotification>>>>;

fn lock(queue: &Queue) -> MutexGuard<'_, Vec<Result<ChangeNotification>>> {
    // The queue only ever holds plain values, so a poisoned lock is still usable.
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Deep subscription on the document root that queues translated notifications.
pub struct ChangeObserver {
    queue: Queue,
    _subscription: Subscription,
}

impl ChangeObserver {
    /// Subscribe to every change below `root`.
    pub fn attach(root: &XmlFragmentRef) -> Self {
        let queue: Queue = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&queue);

        let subscription = root.observe_deep(move |txn, events| {
            let mut translated = Vec::new();
            for event in events.iter() {
                let result = translate_event(txn, event);
                let failed = result.is_err();
                translated.push(result);
                if failed {
                    break;
                }
            }
            lock(&sink).extend(translated);
        });

        Self {
            queue,
            _subscription: subscription,
        }
    }

    /// Take every notification queued so far, oldest first.
    pub fn take_pending(&self) -> Vec<Result<ChangeNotification>> {
        std::mem::take(&mut *lock(&self.queue))
    }

    /// Drop queued notifications without delivering them.
    pub fn discard_pending(&self) -> usize {
        let discarded = self.take_pending().len();
        if discarded > 0 {
            log::debug!("ChangeObserver: discarded {} notifications", discarded);
        }
        discarded
    }
}

impl std::fmt::Debug for ChangeObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeObserver")
            .field("pending", &lock(&self.queue).len())
            .finish_non_exhaustive()
    }
}

/// Translate one engine event into a notification.
pub fn translate_event(txn: &TransactionMut, event: &Event) -> Result<ChangeNotification> {
    match event {
        Event::XmlFragment(event) => translate_element_event(txn, event),
        Event::XmlText(event) => translate_text_event(txn, event),
        _ => Err(TreeSyncError::ProtocolViolation(
            "change reported on a node that is neither an element nor a text run".to_string(),
        )),
    }
}

fn translate_element_event(txn: &TransactionMut, event: &XmlEvent) -> Result<ChangeNotification> {
    let (root, element) = match event.target() {
        XmlOut::Fragment(_) => (true, None),
        XmlOut::Element(element) => (false, Some(element)),
        XmlOut::Text(_) => {
            return Err(TreeSyncError::ProtocolViolation(
                "child list change reported on a text run".to_string(),
            ));
        }
    };
    let target = element.and_then(|element| element_id(txn, element));

    let mut elements = Vec::new();
    for change in event.delta(txn) {
        elements.push(match change {
            Change::Added(values) => {
                let mut inserted = Vec::with_capacity(values.len());
                for value in values {
                    inserted.push(serialize(txn, &TreeNode::try_from(value)?)?);
                }
                ElementDelta::insert(inserted)
            }
            Change::Removed(count) => ElementDelta::delete(*count),
            Change::Retain(count) => ElementDelta::retain(*count),
        });
    }

    let mut keys: Vec<_> = event.keys(txn).iter().collect();
    keys.sort_by(|a, b| a.0.cmp(b.0));

    let mut attributes = AttributeChanges::default();
    for (name, change) in keys {
        match change {
            EntryChange::Inserted(new) | EntryChange::Updated(_, new) => {
                // Report the value the attribute holds now, not the payload
                let current = element
                    .and_then(|element| element.get_attribute(txn, name))
                    .unwrap_or_else(|| new.clone());
                attributes.set.push(AttributeSet {
                    name: name.to_string(),
                    value: out_to_json(txn, &current),
                });
            }
            EntryChange::Removed(_) => attributes.delete.push(name.to_string()),
        }
    }

    Ok(ChangeNotification {
        root,
        target,
        elements: Some(elements),
        attributes,
        text: None,
    })
}

fn translate_text_event(txn: &TransactionMut, event: &XmlTextEvent) -> Result<ChangeNotification> {
    // A text run has no identifier of its own; address its parent element
    let target = match event.target().parent() {
        Some(XmlOut::Element(parent)) => element_id(txn, &parent),
        _ => None,
    };

    let text = event
        .delta(txn)
        .iter()
        .map(|delta| match delta {
            Delta::Inserted(value, attributes) => TextDelta {
                insert: Some(inserted_text(txn, value)),
                attributes: attributes.as_ref().map(|attrs| attrs_to_map(attrs)),
                ..Default::default()
            },
            Delta::Deleted(count) => TextDelta {
                delete: Some(*count),
                ..Default::default()
            },
            Delta::Retain(count, attributes) => TextDelta {
                retain: Some(*count),
                attributes: attributes.as_ref().map(|attrs| attrs_to_map(attrs)),
                ..Default::default()
            },
        })
        .collect();

    Ok(ChangeNotification {
        root: false,
        target,
        elements: None,
        attributes: AttributeChanges::default(),
        text: Some(text),
    })
}

fn inserted_text(txn: &TransactionMut, value: &Out) -> String {
    match value {
        Out::Any(Any::String(s)) => s.to_string(),
        Out::Any(any) => match super::value::any_to_json(any) {
            Value::String(s) => s,
            other => other.to_string(),
        },
        other => other.clone().to_string(txn),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::builder::{insert_nodes, prepare_nodes};
    use crate::crdt::types::NodeSpec;
    use serde_json::json;
    use yrs::{Doc, Text, Transact, XmlElementPrelim, XmlFragment};

    fn setup() -> (Doc, XmlFragmentRef, ChangeObserver) {
        let doc = Doc::new();
        let root = doc.get_or_insert_xml_fragment("document");
        let observer = ChangeObserver::attach(&root);
        (doc, root, observer)
    }

    fn take_ok(observer: &ChangeObserver) -> Vec<ChangeNotification> {
        observer
            .take_pending()
            .into_iter()
            .map(|result| result.unwrap())
            .collect()
    }

    #[test]
    fn test_insert_into_root() {
        let (doc, root, observer) = setup();
        let nodes = prepare_nodes(&[NodeSpec::element_with_id("div", "c1")]).unwrap();
        {
            let mut txn = doc.transact_mut();
            insert_nodes(&mut txn, &root, 0, &nodes);
        }

        let notifications = take_ok(&observer);
        assert_eq!(notifications.len(), 1);
        assert_eq!(
            serde_json::to_value(&notifications[0]).unwrap(),
            json!({
                "root": true,
                "elements": [{"insert": [{"element": {
                    "tagName": "div",
                    "attributes": {"$id": "c1"},
                    "children": []
                }}]}],
                "attributes": {"set": [], "delete": []}
            })
        );
        assert!(observer.take_pending().is_empty());
    }

    #[test]
    fn test_attribute_changes_report_current_value() {
        let (doc, root, observer) = setup();
        let element = {
            let mut txn = doc.transact_mut();
            let element = root.insert(&mut txn, 0, XmlElementPrelim::empty("div"));
            element.insert_attribute(&mut txn, "$id", Any::String("a".into()));
            element.insert_attribute(&mut txn, "old", Any::Bool(true));
            element
        };
        observer.discard_pending();

        {
            let mut txn = doc.transact_mut();
            element.insert_attribute(&mut txn, "color", Any::String("red".into()));
            element.insert_attribute(&mut txn, "color", Any::String("blue".into()));
            element.remove_attribute(&mut txn, &"old");
        }

        let notifications = take_ok(&observer);
        assert_eq!(notifications.len(), 1);
        let notification = &notifications[0];
        assert!(!notification.root);
        assert_eq!(notification.target.as_deref(), Some("a"));
        assert_eq!(notification.elements, Some(vec![]));
        assert_eq!(
            notification.attributes.set,
            vec![AttributeSet {
                name: "color".to_string(),
                value: json!("blue"),
            }]
        );
        assert_eq!(notification.attributes.delete, vec!["old".to_string()]);
    }

    #[test]
    fn test_child_delete_with_retain() {
        let (doc, root, observer) = setup();
        let nodes = prepare_nodes(&[
            NodeSpec::element_with_id("p", "a"),
            NodeSpec::element_with_id("p", "b"),
            NodeSpec::element_with_id("p", "c"),
        ])
        .unwrap();
        {
            let mut txn = doc.transact_mut();
            insert_nodes(&mut txn, &root, 0, &nodes);
        }
        observer.discard_pending();

        {
            let mut txn = doc.transact_mut();
            root.remove_range(&mut txn, 1, 2);
        }

        let notifications = take_ok(&observer);
        assert_eq!(
            notifications[0].elements,
            Some(vec![ElementDelta::retain(1), ElementDelta::delete(2)])
        );
    }

    #[test]
    fn test_text_change_targets_parent() {
        let (doc, root, observer) = setup();
        let nodes = prepare_nodes(&[NodeSpec::text_element("t1", "Hello")]).unwrap();
        {
            let mut txn = doc.transact_mut();
            insert_nodes(&mut txn, &root, 0, &nodes);
        }
        observer.discard_pending();

        let run = {
            let txn = doc.transact();
            match root.get(&txn, 0) {
                Some(XmlOut::Element(element)) => match element.get(&txn, 0) {
                    Some(XmlOut::Text(run)) => run,
                    _ => panic!("expected text run"),
                },
                _ => panic!("expected element"),
            }
        };
        {
            let mut txn = doc.transact_mut();
            run.insert(&mut txn, 5, " World");
        }

        let notifications = take_ok(&observer);
        assert_eq!(notifications.len(), 1);
        let notification = &notifications[0];
        assert!(!notification.root);
        assert_eq!(notification.target.as_deref(), Some("t1"));
        assert!(notification.elements.is_none());
        assert_eq!(
            notification.text,
            Some(vec![
                TextDelta {
                    retain: Some(5),
                    ..Default::default()
                },
                TextDelta {
                    insert: Some(" World".to_string()),
                    ..Default::default()
                },
            ])
        );
    }
}
