//! Y-sync framing for replica-to-replica transport.
//!
//! Update bytes produced by a [`Replica`] are opaque; this module wraps them
//! in the y-protocols sync messages so replicas can talk to any y-sync peer.
//!
//! # Protocol Overview
//!
//! 1. **SyncStep1**: a peer sends its state vector
//! 2. **SyncStep2**: the other side answers with the updates the peer is missing
//!
//! After the handshake, updates are exchanged as they happen.
//!
//! # Wire Format (y-protocols compatible)
//!
//! - `varUint(0)`: Sync message type
//!   - `varUint(0)`: SyncStep1, payload is a state vector
//!   - `varUint(1)`: SyncStep2, payload is an update
//!   - `varUint(2)`: Update, payload is an update
//! - `varUint(1)`: Awareness message (ignored)
//!
//! Byte arrays are encoded as `varUint(length) + raw bytes`.

use std::sync::Arc;

use super::replica::Replica;
use super::types::UpdateOrigin;
use crate::error::{Result, TreeSyncError};

/// Write a variable-length unsigned integer to a buffer.
/// Uses 7 bits per byte, with MSB indicating continuation.
fn write_var_uint(buf: &mut Vec<u8>, mut num: u64) {
    loop {
        let mut byte = (num & 0x7F) as u8;
        num >>= 7;
        if num > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if num == 0 {
            break;
        }
    }
}

/// Read a variable-length unsigned integer.
/// Returns (value, bytes_consumed), or None if the buffer ends first.
fn read_var_uint(data: &[u8]) -> Option<(u64, usize)> {
    let mut num: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        num |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((num, i + 1));
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
    None
}

fn write_var_byte_array(buf: &mut Vec<u8>, data: &[u8]) {
    write_var_uint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Read a length-prefixed byte array.
fn read_var_byte_array(data: &[u8]) -> Option<(Vec<u8>, usize)> {
    let (len, len_bytes) = read_var_uint(data)?;
    let total = len_bytes.checked_add(usize::try_from(len).ok()?)?;
    if data.len() < total {
        return None;
    }
    Some((data[len_bytes..total].to_vec(), total))
}

mod msg_type {
    pub const SYNC: u64 = 0;
    #[cfg(test)]
    pub const AWARENESS: u64 = 1;
}

mod sync_type {
    pub const STEP1: u64 = 0;
    pub const STEP2: u64 = 1;
    pub const UPDATE: u64 = 2;
}

/// Y-sync message types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// State vector of the sender
    SyncStep1(Vec<u8>),
    /// Updates the receiver is missing
    SyncStep2(Vec<u8>),
    /// Incremental update
    Update(Vec<u8>),
}

impl SyncMessage {
    fn parts(&self) -> (u64, &'static str, &[u8]) {
        match self {
            SyncMessage::SyncStep1(sv) => (sync_type::STEP1, "SyncStep1", sv.as_slice()),
            SyncMessage::SyncStep2(update) => (sync_type::STEP2, "SyncStep2", update.as_slice()),
            SyncMessage::Update(update) => (sync_type::UPDATE, "Update", update.as_slice()),
        }
    }

    /// Encode as `varUint(msgType) + varUint(syncType) + varByteArray(payload)`.
    pub fn encode(&self) -> Vec<u8> {
        Self::encode_combined(std::slice::from_ref(self))
    }

    /// Encode several sub-messages behind a single message type, the form
    /// [`decode_all`](Self::decode_all) reads back.
    pub fn encode_combined(messages: &[SyncMessage]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_var_uint(&mut buf, msg_type::SYNC);
        for message in messages {
            let (sync_type, name, payload) = message.parts();
            log::debug!("[Y-sync] Encoding {}, {} bytes", name, payload.len());
            write_var_uint(&mut buf, sync_type);
            write_var_byte_array(&mut buf, payload);
        }
        buf
    }

    /// Decode the first sub-message of a sync message.
    /// Returns None for empty, incomplete, or non-sync messages.
    pub fn decode(data: &[u8]) -> Result<Option<Self>> {
        Ok(Self::decode_all(data)?.into_iter().next())
    }

    fn decode_sub_message(data: &[u8]) -> Result<(Option<Self>, usize)> {
        let Some((sync_type_val, sync_type_bytes)) = read_var_uint(data) else {
            log::debug!("[Y-sync] Incomplete sync type");
            return Ok((None, 0));
        };
        let Some((payload, payload_bytes)) = read_var_byte_array(&data[sync_type_bytes..]) else {
            log::debug!("[Y-sync] Incomplete payload");
            return Ok((None, 0));
        };

        let msg = match sync_type_val {
            sync_type::STEP1 => SyncMessage::SyncStep1(payload),
            sync_type::STEP2 => SyncMessage::SyncStep2(payload),
            sync_type::UPDATE => SyncMessage::Update(payload),
            other => {
                return Err(TreeSyncError::Crdt(format!("Unknown sync type: {}", other)));
            }
        };
        Ok((Some(msg), sync_type_bytes + payload_bytes))
    }

    /// Decode every sub-message of a combined sync message
    /// (e.g. SyncStep2 followed by SyncStep1).
    pub fn decode_all(data: &[u8]) -> Result<Vec<Self>> {
        let mut messages = Vec::new();

        let Some((msg_type_val, msg_type_bytes)) = read_var_uint(data) else {
            return Ok(messages);
        };
        if msg_type_val != msg_type::SYNC {
            log::debug!("[Y-sync] Non-sync message type: {} (expected 0)", msg_type_val);
            return Ok(messages);
        }

        let mut offset = msg_type_bytes;
        while offset < data.len() {
            let (msg, consumed) = Self::decode_sub_message(&data[offset..])?;
            if consumed == 0 {
                break;
            }
            messages.extend(msg);
            offset += consumed;
        }

        log::debug!("[Y-sync] Decoded {} sub-messages", messages.len());
        Ok(messages)
    }
}

/// Sync protocol handler bound to one replica.
///
/// Merges go through [`Replica::apply_update`], so a synced change fires
/// change notifications like any other merge.
#[derive(Debug, Clone)]
pub struct SyncProtocol {
    replica: Arc<Replica>,
}

impl SyncProtocol {
    /// Create a sync protocol handler for a replica.
    pub fn new(replica: Arc<Replica>) -> Self {
        Self { replica }
    }

    /// Get the underlying replica.
    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    /// Create a SyncStep1 message containing the local state vector.
    pub fn create_sync_step1(&self) -> Vec<u8> {
        SyncMessage::SyncStep1(self.replica.encode_state_vector()).encode()
    }

    /// Create a SyncStep2 message with the updates the remote peer is missing.
    pub fn create_sync_step2(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let diff = self.replica.encode_diff(remote_state_vector)?;
        Ok(SyncMessage::SyncStep2(diff).encode())
    }

    /// Create an update message for broadcasting a local change.
    pub fn create_update_message(&self, update: &[u8]) -> Vec<u8> {
        SyncMessage::Update(update.to_vec()).encode()
    }

    /// Handle an incoming message and return the reply to send back, if any.
    ///
    /// - **SyncStep1**: replies with SyncStep2 followed by our own SyncStep1,
    ///   combined into one message
    /// - **SyncStep2**: merges the update (origin Sync)
    /// - **Update**: merges the update (origin Remote)
    pub fn handle_message(&self, msg: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut reply = Vec::new();

        for sync_msg in SyncMessage::decode_all(msg)? {
            match sync_msg {
                SyncMessage::SyncStep1(remote_sv) => {
                    reply.push(SyncMessage::SyncStep2(self.replica.encode_diff(&remote_sv)?));
                    reply.push(SyncMessage::SyncStep1(self.replica.encode_state_vector()));
                }
                SyncMessage::SyncStep2(update) => {
                    if !update.is_empty() {
                        log::debug!("[Y-sync] Applying SyncStep2 update, {} bytes", update.len());
                        self.replica.apply_update(&update, UpdateOrigin::Sync)?;
                    }
                }
                SyncMessage::Update(update) => {
                    if !update.is_empty() {
                        log::debug!("[Y-sync] Applying Update, {} bytes", update.len());
                        self.replica.apply_update(&update, UpdateOrigin::Remote)?;
                    }
                }
            }
        }

        if reply.is_empty() {
            return Ok(None);
        }
        Ok(Some(SyncMessage::encode_combined(&reply)))
    }
}
