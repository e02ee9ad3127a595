//! Binary server status feed
//!
//! Layout (format version 1, all integers little-endian):
//!
//! ```text
//! +---------+--------------------------------------------+
//! | version | record 0 | record 1 | ... | record N-1      |
//! |  1 byte |  9 bytes each                              |
//! +---------+--------------------------------------------+
//!
//! record: index u32 | load f32 (IEEE-754) | flags u8 (bit 0 = online)
//! ```
//!
//! The record count follows from the payload length, so decoding allocates
//! exactly once. Anything that does not match the layout is rejected whole.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::Server;
use crate::error::DecodeError;

pub const FORMAT_VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 1;
pub const RECORD_SIZE: usize = 9;

const FLAG_ONLINE: u8 = 0x01;

/// Live status of one server record
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub index: u32,
    pub load: f32,
    pub online: bool,
}

impl StatusEntry {
    pub fn new(index: u32, load: f32, online: bool) -> Self {
        Self { index, load, online }
    }
}

/// A fully decoded status payload
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatusUpdate {
    version: u8,
    entries: HashMap<u32, StatusEntry>,
}

/// Decode a raw status payload
pub fn decode(raw: &[u8]) -> Result<StatusUpdate, DecodeError> {
    let mut buf = raw;
    if !buf.has_remaining() {
        return Err(DecodeError::Empty);
    }

    let version = buf.get_u8();
    if version != FORMAT_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    if buf.remaining() % RECORD_SIZE != 0 {
        return Err(DecodeError::MisalignedLength {
            len: buf.remaining(),
            record_size: RECORD_SIZE,
        });
    }

    let count = buf.remaining() / RECORD_SIZE;
    let mut entries = HashMap::with_capacity(count);

    for position in 0..count {
        let index = buf.get_u32_le();
        let load = buf.get_f32_le();
        let flags = buf.get_u8();

        if !load.is_finite() || !(0.0..=100.0).contains(&load) {
            return Err(DecodeError::InvalidLoad { position, load });
        }

        let entry = StatusEntry {
            index,
            load,
            online: flags & FLAG_ONLINE != 0,
        };
        if entries.insert(index, entry).is_some() {
            return Err(DecodeError::DuplicateIndex(index));
        }
    }

    debug!("Decoded status payload v{} with {} records", version, count);
    Ok(StatusUpdate { version, entries })
}

/// Encode status records in the version 1 layout
pub fn encode(entries: &[StatusEntry]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + entries.len() * RECORD_SIZE);
    buf.put_u8(FORMAT_VERSION);
    for entry in entries {
        buf.put_u32_le(entry.index);
        buf.put_f32_le(entry.load);
        buf.put_u8(if entry.online { FLAG_ONLINE } else { 0 });
    }
    buf.freeze()
}

impl StatusUpdate {
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&StatusEntry> {
        self.entries.get(&index)
    }

    /// Records sorted by index
    pub fn entries(&self) -> Vec<StatusEntry> {
        let mut entries: Vec<StatusEntry> = self.entries.values().copied().collect();
        entries.sort_by_key(|entry| entry.index);
        entries
    }

    /// New record for `server` after this update, or `None` if nothing changes.
    ///
    /// Servers without a status reference are never touched. Referenced servers
    /// missing from the payload are hidden, keeping the rest of their data.
    pub fn apply_to(&self, server: &Server) -> Option<Server> {
        let reference = server.status_reference?;

        let (load, online, visible) = match self.entries.get(&reference.index) {
            Some(entry) => (entry.load, entry.online, true),
            None => (server.load, false, false),
        };

        if server.load == load && server.online == online && server.visible == visible {
            return None;
        }

        let mut updated = server.clone();
        updated.load = load;
        updated.online = online;
        updated.visible = visible;
        Some(updated)
    }

    /// Copy-on-write application over a server list; unchanged records are shared.
    pub fn apply(&self, servers: &[Arc<Server>]) -> Vec<Arc<Server>> {
        servers
            .iter()
            .map(|server| match self.apply_to(server) {
                Some(updated) => Arc::new(updated),
                None => Arc::clone(server),
            })
            .collect()
    }
}
