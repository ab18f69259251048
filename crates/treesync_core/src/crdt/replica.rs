//! One replica of a synchronized tree.
//!
//! [`Replica`] ties the layers of this crate together: it owns the yrs
//! document, keeps a [`ChangeObserver`] and a [`HistoryController`] attached
//! to the document root, applies [`ChangeCommand`]s, merges remote updates,
//! and hands every resulting [`ChangeNotification`] to the registered sink.
//!
//! # Delivery order
//!
//! Notifications are delivered after the transaction that produced them has
//! committed, before the triggering call returns. A sink may call back into
//! the same replica; the notifications of that nested call are delivered
//! before the outer delivery loop moves on (depth-first).
//!
//! # Halting
//!
//! A change the observer cannot translate is a [`TreeSyncError::ProtocolViolation`].
//! It is returned from the call that caused it, and every later call on the
//! replica fails with the same error.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use treesync_core::config::ReplicaConfig;
//! use treesync_core::crdt::{MemoryStorage, Replica};
//!
//! let replica = Replica::new(Arc::new(MemoryStorage::new()), "page", ReplicaConfig::default());
//! replica.notify_changes(Arc::new(|notification| {
//!     println!("{}", notification.to_json().unwrap());
//! }));
//! replica.apply_changes_json(r#"[{"insertChildren": {"children": [
//!     {"element": {"tagName": "div", "id": "c1"}}
//! ]}}]"#)?;
//! ```

use std::sync::{Arc, Mutex, RwLock};

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, OffsetKind, Options, ReadTxn, StateVector, Subscription, Transact, Update, XmlFragmentRef,
};

use super::applier::apply_command;
use super::history::{HistoryController, LOCAL_ORIGIN, REMOTE_ORIGIN};
use super::identity::{find_element, resolve};
use super::observer::ChangeObserver;
use super::serializer::{TreeNode, serialize, serialize_children};
use super::storage::{CrdtStorage, StorageResult};
use super::types::{
    ChangeCommand, ChangeNotification, CrdtUpdate, InsertChildren, NodeSpec, SerializedNode,
    UpdateOrigin, parse_commands,
};
use crate::config::ReplicaConfig;
use crate::error::{Result, TreeSyncError};

/// Receiver of change notifications.
pub type ChangeSink = Arc<dyn Fn(&ChangeNotification) + Send + Sync>;

/// A replicated tree document with identifier-addressed commands and notifications.
pub struct Replica {
    doc: Doc,
    root: XmlFragmentRef,
    observer: ChangeObserver,
    history: HistoryController,
    storage: Arc<dyn CrdtStorage>,
    doc_name: String,
    sink: RwLock<Option<ChangeSink>>,
    /// Message of the protocol violation that halted this replica
    fault: Mutex<Option<String>>,
}

impl Replica {
    /// Create an empty replica.
    pub fn new(storage: Arc<dyn CrdtStorage>, doc_name: impl Into<String>, config: ReplicaConfig) -> Self {
        let doc = create_doc(&config);
        Self::attach(doc, storage, doc_name.into(), &config)
    }

    /// Restore a replica from its stored snapshot and update log.
    ///
    /// Entries that fail to decode or apply are skipped with a warning; the
    /// replica starts from whatever state could be restored.
    pub fn load(
        storage: Arc<dyn CrdtStorage>,
        doc_name: impl Into<String>,
        config: ReplicaConfig,
    ) -> StorageResult<Self> {
        let doc_name = doc_name.into();
        let doc = create_doc(&config);

        let mut restored = Vec::new();
        if let Some(state) = storage.load_doc(&doc_name)? {
            restored.push(state);
        }
        restored.extend(
            storage
                .get_all_updates(&doc_name)?
                .into_iter()
                .map(|update| update.data),
        );

        {
            let mut txn = doc.transact_mut_with(REMOTE_ORIGIN);
            for data in &restored {
                let applied = Update::decode_v1(data)
                    .map_err(|e| e.to_string())
                    .and_then(|update| txn.apply_update(update).map_err(|e| e.to_string()));
                if let Err(e) = applied {
                    log::warn!("Failed to restore stored state for replica {}: {}", doc_name, e);
                }
            }
        }
        log::debug!(
            "Replica {}: restored from {} stored entries",
            doc_name,
            restored.len()
        );

        Ok(Self::attach(doc, storage, doc_name, &config))
    }

    /// Create a replica whose root starts with the given children.
    ///
    /// The initial content is persisted like any local change but is not
    /// undoable.
    pub fn with_document(
        storage: Arc<dyn CrdtStorage>,
        doc_name: impl Into<String>,
        config: ReplicaConfig,
        children: Vec<NodeSpec>,
    ) -> Result<Self> {
        let replica = Self::new(storage, doc_name, config);
        let mut command = ChangeCommand::for_root();
        command.insert_children = Some(InsertChildren {
            after: None,
            index: None,
            children,
        });
        replica.apply_changes(std::slice::from_ref(&command))?;
        replica.history.clear();
        Ok(replica)
    }

    fn attach(doc: Doc, storage: Arc<dyn CrdtStorage>, doc_name: String, config: &ReplicaConfig) -> Self {
        let root = doc.get_or_insert_xml_fragment(config.root_name.as_str());
        let observer = ChangeObserver::attach(&root);
        let history = if config.track_history {
            HistoryController::new(&doc, &root)
        } else {
            HistoryController::disabled()
        };

        Self {
            doc,
            root,
            observer,
            history,
            storage,
            doc_name,
            sink: RwLock::new(None),
            fault: Mutex::new(None),
        }
    }

    /// Get the document name.
    pub fn doc_name(&self) -> &str {
        &self.doc_name
    }

    // ==================== Notifications ====================

    /// Register the receiver of change notifications, replacing any previous one.
    pub fn notify_changes(&self, sink: ChangeSink) {
        let mut slot = self.sink.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(sink);
    }

    /// Deliver every queued notification to the sink.
    fn dispatch(&self) -> Result<()> {
        for result in self.observer.take_pending() {
            let notification = result.map_err(|e| self.halt(e))?;
            log::debug!(
                "Replica {}: notification root={} target={:?}",
                self.doc_name,
                notification.root,
                notification.target
            );
            // Clone the sink out so a reentrant call can take the lock again
            let sink = self
                .sink
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone();
            if let Some(sink) = sink {
                sink(&notification);
            }
        }
        Ok(())
    }

    fn halt(&self, error: TreeSyncError) -> TreeSyncError {
        let message = match error {
            TreeSyncError::ProtocolViolation(message) => message,
            other => other.to_string(),
        };
        log::error!("Replica {} halted: {}", self.doc_name, message);
        self.observer.discard_pending();
        *self.fault.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(message.clone());
        TreeSyncError::ProtocolViolation(message)
    }

    fn ensure_healthy(&self) -> Result<()> {
        match &*self.fault.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) {
            Some(message) => Err(TreeSyncError::ProtocolViolation(message.clone())),
            None => Ok(()),
        }
    }

    /// Whether a protocol violation has stopped this replica.
    pub fn is_halted(&self) -> bool {
        self.ensure_healthy().is_err()
    }

    // ==================== Commands ====================

    /// Apply commands in order.
    ///
    /// Each command applies completely or not at all. The batch stops at the
    /// first failing command; commands before it stay applied.
    ///
    /// A [`TreeSyncError::Storage`] error is the exception: the command's
    /// change was committed and its notifications delivered, but appending it
    /// to the update log failed.
    pub fn apply_changes(&self, commands: &[ChangeCommand]) -> Result<()> {
        for (position, command) in commands.iter().enumerate() {
            if let Err(e) = self.apply_change(command) {
                log::debug!(
                    "Replica {}: command {} of {} failed: {}",
                    self.doc_name,
                    position + 1,
                    commands.len(),
                    e
                );
                return Err(e);
            }
        }
        Ok(())
    }

    /// Decode a JSON array of commands and apply it.
    pub fn apply_changes_json(&self, json: &str) -> Result<()> {
        self.apply_changes(&parse_commands(json)?)
    }

    fn apply_change(&self, command: &ChangeCommand) -> Result<()> {
        self.ensure_healthy()?;

        if command.has_mutations() {
            let sv_before = self.state_vector();
            {
                let mut txn = self.doc.transact_mut_with(LOCAL_ORIGIN);
                apply_command(&mut txn, &self.root, command)?;
            }
            self.history.seal();
            self.persist_committed(self.record_update(&sv_before))?;
        } else {
            let txn = self.doc.transact();
            resolve(&txn, &self.root, command.node_id.as_deref())?;
        }

        if command.undo {
            self.undo()?;
        }
        if command.redo {
            self.redo()?;
        }
        Ok(())
    }

    /// Revert the most recent local change. Does nothing when there is none.
    pub fn undo(&self) -> Result<()> {
        self.step_history(HistoryController::undo)
    }

    /// Reapply the most recently undone change. Does nothing when there is none.
    pub fn redo(&self) -> Result<()> {
        self.step_history(HistoryController::redo)
    }

    fn step_history(&self, step: fn(&HistoryController) -> bool) -> Result<()> {
        self.ensure_healthy()?;
        let sv_before = self.state_vector();
        let recorded = if step(&self.history) {
            self.record_update(&sv_before)
        } else {
            Ok(())
        };
        self.persist_committed(recorded)
    }

    /// Whether [`undo`](Self::undo) would change anything.
    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    /// Whether [`redo`](Self::redo) would change anything.
    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    // ==================== Reading ====================

    /// Serialize the element with the given identifier and its subtree.
    pub fn serialize(&self, node_id: &str) -> Result<SerializedNode> {
        let txn = self.doc.transact();
        let element = find_element(&txn, &self.root, node_id)
            .ok_or_else(|| TreeSyncError::NotFound(node_id.to_string()))?;
        serialize(&txn, &TreeNode::Element(element))
    }

    /// Serialize every child of the document root.
    pub fn snapshot(&self) -> Result<Vec<SerializedNode>> {
        let txn = self.doc.transact();
        serialize_children(&txn, &self.root)
    }

    // ==================== Sync Operations ====================

    fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// Encode the current state vector for sync.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.state_vector().encode_v1()
    }

    /// Encode the full state as an update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the changes a peer with the given state vector is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| TreeSyncError::Crdt(format!("Failed to decode state vector: {}", e)))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Merge update bytes received from another replica.
    pub fn merge_remote_bytes(&self, update: &[u8]) -> Result<i64> {
        self.apply_update(update, UpdateOrigin::Remote)
    }

    /// Merge an update, persist it with the given origin and deliver the
    /// resulting notifications. Returns the ID of the stored update.
    pub fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<i64> {
        self.ensure_healthy()?;

        let decoded = Update::decode_v1(update)
            .map_err(|e| TreeSyncError::Crdt(format!("Failed to decode update: {}", e)))?;
        let applied = {
            let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
            txn.apply_update(decoded)
                .map_err(|e| TreeSyncError::Crdt(format!("Failed to apply update: {}", e)))
        };
        if let Err(e) = applied {
            self.dispatch()?;
            return Err(e);
        }
        log::debug!(
            "Replica {}: merged {} byte update ({})",
            self.doc_name,
            update.len(),
            origin
        );

        self.persist_committed(self.storage.append_update(&self.doc_name, update, origin))
    }

    /// Observe raw v1 updates of every transaction on this replica.
    pub fn observe_updates<F>(&self, callback: F) -> Result<Subscription>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |_, event| {
                callback(&event.update);
            })
            .map_err(|e| TreeSyncError::Crdt(format!("Failed to observe document updates: {:?}", e)))
    }

    // ==================== Persistence ====================

    /// Deliver the notifications of a committed transaction, then report
    /// whether storing it succeeded. A storage failure leaves the change
    /// applied and notified; only its log entry is missing until the next
    /// [`save`](Self::save).
    fn persist_committed<T>(&self, stored: Result<T>) -> Result<T> {
        self.dispatch()?;
        stored.inspect_err(|e| {
            log::warn!(
                "Replica {}: change applied but not persisted: {}",
                self.doc_name,
                e
            );
        })
    }

    /// Helper to record an update in storage after a mutation.
    fn record_update(&self, sv_before: &StateVector) -> Result<()> {
        let update = {
            let txn = self.doc.transact();
            txn.encode_state_as_update_v1(sv_before)
        };

        if !update.is_empty() {
            self.storage
                .append_update(&self.doc_name, &update, UpdateOrigin::Local)?;
        }
        Ok(())
    }

    /// Write a full snapshot and drop the log entries it covers.
    pub fn save(&self) -> Result<()> {
        // Read the log position first so the snapshot covers every entry up to it
        let through_id = self.storage.latest_update_id(&self.doc_name)?;
        let state = self.encode_state_as_update();
        self.storage.save_doc(&self.doc_name, &state)?;
        self.storage.truncate_log(&self.doc_name, through_id)?;
        log::debug!(
            "Replica {}: saved {} byte snapshot, log truncated through {}",
            self.doc_name,
            state.len(),
            through_id
        );
        Ok(())
    }

    /// Get the update history for this document.
    pub fn get_history(&self) -> Result<Vec<CrdtUpdate>> {
        self.storage.get_all_updates(&self.doc_name)
    }
}

fn create_doc(config: &ReplicaConfig) -> Doc {
    let mut options = match config.client_id {
        Some(client_id) => Options::with_client_id(client_id.into()),
        None => Options::default(),
    };
    options.offset_kind = OffsetKind::Utf16;
    Doc::with_options(options)
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("doc_name", &self.doc_name)
            .field("halted", &self.is_halted())
            .field("history", &self.history)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::MemoryStorage;
    use crate::crdt::types::ElementDelta;
    use serde_json::json;

    fn create_replica(name: &str) -> Replica {
        Replica::new(Arc::new(MemoryStorage::new()), name, ReplicaConfig::default())
    }

    fn collect(replica: &Replica) -> Arc<Mutex<Vec<ChangeNotification>>> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        replica.notify_changes(Arc::new(move |notification: &ChangeNotification| {
            sink.lock().unwrap().push(notification.clone());
        }));
        received
    }

    fn root_ids(replica: &Replica) -> Vec<String> {
        replica
            .snapshot()
            .unwrap()
            .into_iter()
            .map(|node| match node {
                SerializedNode::Element(element) => {
                    element.attributes["$id"].as_str().unwrap().to_string()
                }
                SerializedNode::Text(_) => panic!("expected element"),
            })
            .collect()
    }

    #[test]
    fn test_concrete_insert_notification() {
        let replica = create_replica("page");
        let received = collect(&replica);

        replica
            .apply_changes_json(
                r#"[{"insertChildren": {"index": 0, "children": [
                    {"element": {"tagName": "div", "id": "c1"}}
                ]}}]"#,
            )
            .unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(
            serde_json::to_value(&received[0]).unwrap(),
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
    }

    #[test]
    fn test_insert_delta_matches_serialized_nodes() {
        let replica = create_replica("page");
        replica
            .apply_changes_json(r#"[{"insertChildren": {"children": [{"element": {"tagName": "p", "id": "a"}}]}}]"#)
            .unwrap();
        let received = collect(&replica);

        replica
            .apply_changes_json(
                r#"[{"insertChildren": {"after": "a", "children": [
                    {"element": {"tagName": "section", "id": "s", "attributes": {"n": 1}, "children": [
                        {"element": {"tagName": "text", "id": "t", "children": [
                            {"text": {"delta": [{"insert": "hi"}]}}
                        ]}}
                    ]}},
                    {"element": {"tagName": "hr", "id": "h"}}
                ]}}]"#,
            )
            .unwrap();

        let expected = vec![replica.serialize("s").unwrap(), replica.serialize("h").unwrap()];
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(
            received[0].elements,
            Some(vec![ElementDelta::retain(1), ElementDelta::insert(expected)])
        );
    }

    #[test]
    fn test_partial_batch_keeps_earlier_commands() {
        let replica = create_replica("page");
        let result = replica.apply_changes_json(
            r#"[
                {"insertChildren": {"children": [{"element": {"tagName": "p", "id": "a"}}]}},
                {"nodeID": "missing", "setAttributes": {"x": 1}},
                {"insertChildren": {"children": [{"element": {"tagName": "p", "id": "b"}}]}}
            ]"#,
        );

        assert!(matches!(result, Err(TreeSyncError::NotFound(id)) if id == "missing"));
        assert_eq!(root_ids(&replica), vec!["a"]);
    }

    #[test]
    fn test_reentrant_sink_is_depth_first() {
        let replica = Arc::new(create_replica("page"));
        let order = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&replica);
        let log = Arc::clone(&order);
        replica.notify_changes(Arc::new(move |notification: &ChangeNotification| {
            let label = match notification.target.as_deref() {
                Some(target) => format!("element {}", target),
                None => "root".to_string(),
            };
            log.lock().unwrap().push(format!("start {}", label));
            // Tag every new root child from inside the sink
            if notification.root {
                if let Some(replica) = weak.upgrade() {
                    let id = match &notification.elements.as_ref().unwrap()[0].insert {
                        Some(nodes) => match &nodes[0] {
                            SerializedNode::Element(element) => {
                                element.attributes["$id"].as_str().unwrap().to_string()
                            }
                            SerializedNode::Text(_) => unreachable!(),
                        },
                        None => unreachable!(),
                    };
                    let mut tag = ChangeCommand::for_node(id);
                    let mut attributes = crate::crdt::types::AttributeMap::new();
                    attributes.insert("seen".to_string(), json!(true));
                    tag.set_attributes = Some(attributes);
                    replica.apply_changes(&[tag]).unwrap();
                }
            }
            log.lock().unwrap().push(format!("end {}", label));
        }));

        replica
            .apply_changes_json(r#"[{"insertChildren": {"children": [{"element": {"tagName": "p", "id": "a"}}]}}]"#)
            .unwrap();

        assert_eq!(
            *order.lock().unwrap(),
            vec!["start root", "start element a", "end element a", "end root"]
        );
        match replica.serialize("a").unwrap() {
            SerializedNode::Element(element) => assert_eq!(element.attributes["seen"], json!(true)),
            SerializedNode::Text(_) => panic!("expected element"),
        }
    }

    #[test]
    fn test_undo_redo_per_command() {
        let replica = create_replica("page");
        replica
            .apply_changes_json(r#"[{"insertChildren": {"children": [{"element": {"tagName": "p", "id": "a"}}]}}]"#)
            .unwrap();
        replica
            .apply_changes_json(r#"[{"insertChildren": {"children": [{"element": {"tagName": "p", "id": "b"}}]}}]"#)
            .unwrap();
        assert!(replica.can_undo());

        let received = collect(&replica);
        replica.apply_changes_json(r#"[{"undo": true}]"#).unwrap();
        assert_eq!(root_ids(&replica), vec!["a"]);
        assert_eq!(
            received.lock().unwrap()[0].elements,
            Some(vec![ElementDelta::retain(1), ElementDelta::delete(1)])
        );

        replica.redo().unwrap();
        assert_eq!(root_ids(&replica), vec!["a", "b"]);
    }

    #[test]
    fn test_undo_on_empty_stack_is_no_op() {
        let replica = create_replica("page");
        let received = collect(&replica);
        replica.undo().unwrap();
        replica.redo().unwrap();
        assert!(received.lock().unwrap().is_empty());
        assert!(replica.snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_initial_document_is_not_undoable() {
        let replica = Replica::with_document(
            Arc::new(MemoryStorage::new()),
            "page",
            ReplicaConfig::default(),
            vec![NodeSpec::text_element("t1", "Hello World")],
        )
        .unwrap();

        assert!(!replica.can_undo());
        replica.undo().unwrap();
        assert_eq!(root_ids(&replica), vec!["t1"]);
    }

    #[test]
    fn test_remote_merge_notifies_and_is_not_undoable() {
        let local = create_replica("page");
        let remote = create_replica("page");
        remote
            .apply_changes_json(r#"[{"insertChildren": {"children": [{"element": {"tagName": "p", "id": "r"}}]}}]"#)
            .unwrap();

        let received = collect(&local);
        local.merge_remote_bytes(&remote.encode_state_as_update()).unwrap();

        assert_eq!(root_ids(&local), vec!["r"]);
        assert_eq!(received.lock().unwrap().len(), 1);
        assert!(received.lock().unwrap()[0].root);
        assert!(!local.can_undo());
    }

    #[test]
    fn test_local_changes_are_logged() {
        let storage = Arc::new(MemoryStorage::new());
        let replica = Replica::new(storage.clone(), "page", ReplicaConfig::default());
        replica
            .apply_changes_json(r#"[{"insertChildren": {"children": [{"element": {"tagName": "p", "id": "a"}}]}}]"#)
            .unwrap();

        let history = replica.get_history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].origin, UpdateOrigin::Local);

        let reloaded = Replica::load(storage, "page", ReplicaConfig::default()).unwrap();
        assert_eq!(root_ids(&reloaded), vec!["a"]);
    }

    #[test]
    fn test_save_and_load() {
        let storage = Arc::new(MemoryStorage::new());
        {
            let replica = Replica::new(storage.clone(), "page", ReplicaConfig::default());
            replica
                .apply_changes_json(r#"[{"insertChildren": {"children": [{"element": {"tagName": "p", "id": "a"}}]}}]"#)
                .unwrap();
            replica.save().unwrap();
        }

        let replica = Replica::load(storage, "page", ReplicaConfig::default()).unwrap();
        assert_eq!(root_ids(&replica), vec!["a"]);
        assert!(!replica.can_undo());
    }

    #[test]
    fn test_encode_diff() {
        let a = create_replica("page");
        let b = create_replica("page");
        a.apply_changes_json(r#"[{"insertChildren": {"children": [{"element": {"tagName": "p", "id": "x"}}]}}]"#)
            .unwrap();
        b.merge_remote_bytes(&a.encode_state_as_update()).unwrap();

        let sv = b.encode_state_vector();
        a.apply_changes_json(r#"[{"insertChildren": {"children": [{"element": {"tagName": "p", "id": "y"}}]}}]"#)
            .unwrap();

        b.merge_remote_bytes(&a.encode_diff(&sv).unwrap()).unwrap();
        assert_eq!(root_ids(&b), vec!["x", "y"]);
    }

    #[test]
    fn test_invalid_update_bytes() {
        let replica = create_replica("page");
        let result = replica.merge_remote_bytes(&[0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(TreeSyncError::Crdt(_))));
        assert!(!replica.is_halted());
    }

    #[test]
    fn test_halted_replica_rejects_everything() {
        let replica = create_replica("page");
        replica.halt(TreeSyncError::ProtocolViolation("unexpected node".to_string()));

        let result = replica.apply_changes(&[ChangeCommand::for_root()]);
        assert!(matches!(result, Err(TreeSyncError::ProtocolViolation(m)) if m == "unexpected node"));
        assert!(matches!(replica.undo(), Err(TreeSyncError::ProtocolViolation(_))));
        assert!(matches!(
            replica.merge_remote_bytes(&[]),
            Err(TreeSyncError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_non_tree_node_change_halts_replica() {
        use yrs::{Map, MapPrelim, Text, XmlFragment, XmlOut};

        let a = create_replica("page");
        let b = create_replica("page");
        a.apply_changes_json(
            r#"[{"insertChildren": {"children": [{"element": {"tagName": "text", "id": "t", "children": [
                {"text": {"delta": [{"insert": "Hello"}]}}
            ]}}]}}]"#,
        )
        .unwrap();
        b.merge_remote_bytes(&a.encode_state_as_update()).unwrap();

        let run = {
            let txn = a.doc.transact();
            match find_element(&txn, &a.root, "t").unwrap().get(&txn, 0) {
                Some(XmlOut::Text(run)) => run,
                _ => panic!("expected text run"),
            }
        };
        let map = {
            let mut txn = a.doc.transact_mut();
            run.insert_embed(&mut txn, 5, MapPrelim::default())
        };
        b.merge_remote_bytes(&a.encode_diff(&b.encode_state_vector()).unwrap())
            .unwrap();
        assert!(!b.is_halted());

        {
            let mut txn = a.doc.transact_mut();
            map.insert(&mut txn, "k", "v");
        }
        let result = b.merge_remote_bytes(&a.encode_diff(&b.encode_state_vector()).unwrap());
        assert!(matches!(result, Err(TreeSyncError::ProtocolViolation(_))));
        assert!(b.is_halted());
        assert!(matches!(
            b.apply_changes(&[ChangeCommand::for_root()]),
            Err(TreeSyncError::ProtocolViolation(_))
        ));
    }

    /// Storage whose update log rejects every write.
    #[derive(Default)]
    struct ReadOnlyLog {
        inner: MemoryStorage,
    }

    impl CrdtStorage for ReadOnlyLog {
        fn load_doc(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
            self.inner.load_doc(name)
        }

        fn save_doc(&self, name: &str, state: &[u8]) -> StorageResult<()> {
            self.inner.save_doc(name, state)
        }

        fn append_update(&self, _: &str, _: &[u8], _: UpdateOrigin) -> StorageResult<i64> {
            Err(TreeSyncError::Storage("log is read-only".to_string()))
        }

        fn get_updates_since(&self, name: &str, since_id: i64) -> StorageResult<Vec<CrdtUpdate>> {
            self.inner.get_updates_since(name, since_id)
        }

        fn latest_update_id(&self, name: &str) -> StorageResult<i64> {
            self.inner.latest_update_id(name)
        }

        fn truncate_log(&self, name: &str, through_id: i64) -> StorageResult<()> {
            self.inner.truncate_log(name, through_id)
        }
    }

    #[test]
    fn test_storage_failure_still_delivers_committed_change() {
        let replica = Replica::new(Arc::new(ReadOnlyLog::default()), "page", ReplicaConfig::default());
        let received = collect(&replica);

        let result = replica
            .apply_changes_json(r#"[{"insertChildren": {"children": [{"element": {"tagName": "p", "id": "a"}}]}}]"#);
        assert!(matches!(result, Err(TreeSyncError::Storage(_))));
        assert_eq!(root_ids(&replica), vec!["a"]);
        assert_eq!(received.lock().unwrap().len(), 1);
        assert!(!replica.is_halted());

        // Nothing stale is left queued for a later call
        replica.undo().unwrap_err();
        assert_eq!(received.lock().unwrap().len(), 2);
        assert!(root_ids(&replica).is_empty());

        let peer = create_replica("page");
        peer.apply_changes_json(r#"[{"insertChildren": {"children": [{"element": {"tagName": "p", "id": "b"}}]}}]"#)
            .unwrap();
        let merged = replica.merge_remote_bytes(&peer.encode_state_as_update());
        assert!(matches!(merged, Err(TreeSyncError::Storage(_))));
        assert_eq!(root_ids(&replica), vec!["b"]);
        assert_eq!(received.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_save_truncates_update_log() {
        let storage = Arc::new(MemoryStorage::new());
        let replica = Replica::new(storage.clone(), "page", ReplicaConfig::default());
        for i in 0..50 {
            replica
                .apply_changes_json(&format!(
                    r#"[{{"insertChildren": {{"children": [{{"element": {{"tagName": "p", "id": "n{}"}}}}]}}}}]"#,
                    i
                ))
                .unwrap();
        }
        assert_eq!(replica.get_history().unwrap().len(), 50);

        replica.save().unwrap();
        assert!(replica.get_history().unwrap().is_empty());

        replica
            .apply_changes_json(r#"[{"nodeID": "n0", "setAttributes": {"late": true}}]"#)
            .unwrap();
        assert_eq!(replica.get_history().unwrap().len(), 1);

        let reloaded = Replica::load(storage, "page", ReplicaConfig::default()).unwrap();
        assert_eq!(reloaded.snapshot().unwrap(), replica.snapshot().unwrap());
    }

    #[test]
    fn test_serialize_unknown_node() {
        let replica = create_replica("page");
        assert!(matches!(replica.serialize("nope"), Err(TreeSyncError::NotFound(_))));
    }

    #[test]
    fn test_history_disabled_by_config() {
        let config = ReplicaConfig {
            track_history: false,
            ..ReplicaConfig::default()
        };
        let replica = Replica::new(Arc::new(MemoryStorage::new()), "page", config);
        replica
            .apply_changes_json(r#"[{"insertChildren": {"children": [{"element": {"tagName": "p", "id": "a"}}]}}]"#)
            .unwrap();
        assert!(!replica.can_undo());
        replica.undo().unwrap();
        assert_eq!(root_ids(&replica), vec!["a"]);
    }
}
