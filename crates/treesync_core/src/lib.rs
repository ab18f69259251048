#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Replica configuration (TOML)
pub mod config;

/// Replicated tree: commands, notifications, storage and sync
pub mod crdt;

/// Error (common error types)
pub mod error;

pub use config::ReplicaConfig;
pub use crdt::{ChangeCommand, ChangeNotification, NodeSpec, Replica, SerializedNode};
pub use error::{Result, TreeSyncError};
