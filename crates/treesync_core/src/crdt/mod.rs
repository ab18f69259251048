#![doc = include_str!(concat!(env!("OUT_DIR"), "/crdt_README.md"))]

mod applier;
mod builder;
mod history;
mod identity;
mod memory_storage;
mod observer;
mod replica;
mod serializer;
mod storage;
mod sync;
mod types;
mod value;

pub use applier::{Plan, apply_command, execute_plan, plan_command};
pub use builder::{PreparedNode, insert_nodes, prepare_nodes, utf16_len};
pub use history::{HistoryController, LOCAL_ORIGIN, REMOTE_ORIGIN};
pub use identity::{ID_ATTRIBUTE, TEXT_TAG, Target, assign_identifier, element_id, find_element, resolve};
pub use memory_storage::MemoryStorage;
pub use observer::ChangeObserver;
pub use replica::{ChangeSink, Replica};
pub use serializer::{TreeNode, serialize, serialize_children};
pub use storage::{CrdtStorage, StorageResult};
pub use sync::{SyncMessage, SyncProtocol};
pub use types::{
    AttributeChanges, AttributeMap, AttributeSet, ChangeCommand, ChangeNotification, CrdtUpdate,
    DeleteChildren, DeleteText, ElementDelta, ElementSpec, FormatText, InsertChildren, InsertText,
    NodeSpec, SerializedElement, SerializedNode, SerializedText, TextDelta, TextSpan, TextSpec,
    UpdateOrigin, parse_commands,
};
