//! Flat per-table index
//!
//! A fixed-capacity array of entries, one per live or pending record, checkpointed as a
//! whole with a temp-then-rename write. An entry's `active` field names the data file
//! holding the committed image, or is one of the two pending markers.
//!
//! ```text
//! header: "BRIX" | version u16 | reserved u16 | key_size u32 | capacity u32
//! entry:  key[key_size] | page u32 | row u32 | active i32 | shadow i32
//!         | dirty u8 | pad[3] | owner u128
//! ```

use std::path::Path;

use bytes::{Buf, BufMut};

use super::page::FORMAT_VERSION;
use crate::error::{BedrockError, Result};
use crate::fsutil;
use crate::types::TxnId;

pub const INDEX_MAGIC: [u8; 4] = *b"BRIX";
pub const INDEX_HEADER_SIZE: usize = 16;

/// Inserted by a transaction that has not committed yet
pub const ACTIVE_INSERTED: i32 = -1;
/// Deleted by a transaction that has not committed yet
pub const ACTIVE_DELETED: i32 = -2;

pub fn entry_size(key_size: u32) -> usize {
    key_size as usize + 4 + 4 + 4 + 4 + 1 + 3 + 16
}

/// Encode a string key into its fixed-width, zero-padded form.
pub fn encode_key(key: &str, key_size: u32) -> Result<Vec<u8>> {
    if key.is_empty() || key.len() > key_size as usize || key.contains('\0') {
        return Err(BedrockError::OutOfSpace(format!(
            "key '{}' must be 1..={} bytes without NUL",
            key, key_size
        )));
    }
    let mut bytes = key.as_bytes().to_vec();
    bytes.resize(key_size as usize, 0);
    Ok(bytes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Zero-padded key; all zero marks a free slot
    pub key: Vec<u8>,
    pub page: u32,
    pub row: u32,
    pub active: i32,
    pub shadow: i32,
    pub dirty: bool,
    pub owner: TxnId,
}

impl IndexEntry {
    pub fn free(key_size: u32) -> Self {
        Self {
            key: vec![0; key_size as usize],
            page: 0,
            row: 0,
            active: 0,
            shadow: 0,
            dirty: false,
            owner: TxnId::NIL,
        }
    }

    pub fn is_free(&self) -> bool {
        self.key.iter().all(|b| *b == 0)
    }

    pub fn key_str(&self) -> String {
        let end = self.key.iter().position(|b| *b == 0).unwrap_or(self.key.len());
        String::from_utf8_lossy(&self.key[..end]).into_owned()
    }

    /// Pending change owned by a transaction other than `txn`?
    pub fn owned_by_other(&self, txn: TxnId) -> bool {
        !self.owner.is_nil() && self.owner != txn
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_slice(&self.key);
        buf.put_u32_le(self.page);
        buf.put_u32_le(self.row);
        buf.put_i32_le(self.active);
        buf.put_i32_le(self.shadow);
        buf.put_u8(self.dirty as u8);
        buf.put_slice(&[0u8; 3]);
        buf.put_u128_le(self.owner.as_u128());
    }

    fn decode_from(bytes: &mut &[u8], key_size: u32) -> Self {
        let mut key = vec![0u8; key_size as usize];
        bytes.copy_to_slice(&mut key);
        let page = bytes.get_u32_le();
        let row = bytes.get_u32_le();
        let active = bytes.get_i32_le();
        let shadow = bytes.get_i32_le();
        let dirty = bytes.get_u8() != 0;
        bytes.advance(3);
        let owner = TxnId::from_u128(bytes.get_u128_le());
        Self {
            key,
            page,
            row,
            active,
            shadow,
            dirty,
            owner,
        }
    }
}

/// In-memory image of an index file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    key_size: u32,
    entries: Vec<IndexEntry>,
}

impl Index {
    pub fn new(key_size: u32, capacity: u32) -> Self {
        Self {
            key_size,
            entries: vec![IndexEntry::free(key_size); capacity as usize],
        }
    }

    pub fn key_size(&self) -> u32 {
        self.key_size
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn used(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_free()).count()
    }

    pub fn entries(&self) -> impl Iterator<Item = (usize, &IndexEntry)> {
        self.entries.iter().enumerate().filter(|(_, e)| !e.is_free())
    }

    pub fn find(&self, key: &[u8]) -> Option<usize> {
        self.entries.iter().position(|e| e.key == key)
    }

    pub fn get(&self, slot: usize) -> &IndexEntry {
        &self.entries[slot]
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut IndexEntry {
        &mut self.entries[slot]
    }

    /// Store `entry` in the first free slot.
    pub fn insert(&mut self, entry: IndexEntry) -> Result<usize> {
        let slot = self
            .entries
            .iter()
            .position(IndexEntry::is_free)
            .ok_or_else(|| {
                BedrockError::OutOfSpace(format!("index full ({} entries)", self.entries.len()))
            })?;
        self.entries[slot] = entry;
        Ok(slot)
    }

    pub fn clear(&mut self, slot: usize) {
        self.entries[slot] = IndexEntry::free(self.key_size);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(INDEX_HEADER_SIZE + self.entries.len() * entry_size(self.key_size));
        buf.put_slice(&INDEX_MAGIC);
        buf.put_u16_le(FORMAT_VERSION);
        buf.put_u16_le(0);
        buf.put_u32_le(self.key_size);
        buf.put_u32_le(self.entries.len() as u32);
        for entry in &self.entries {
            entry.encode_into(&mut buf);
        }
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < INDEX_HEADER_SIZE {
            return Err(BedrockError::corrupt("index header truncated"));
        }
        let mut magic = [0u8; 4];
        bytes.copy_to_slice(&mut magic);
        if magic != INDEX_MAGIC {
            return Err(BedrockError::corrupt(format!("bad index magic {:?}", magic)));
        }
        let version = bytes.get_u16_le();
        if version != FORMAT_VERSION {
            return Err(BedrockError::corrupt(format!("unsupported index version {}", version)));
        }
        bytes.advance(2);
        let key_size = bytes.get_u32_le();
        let capacity = bytes.get_u32_le();
        if bytes.len() < capacity as usize * entry_size(key_size) {
            return Err(BedrockError::corrupt(format!(
                "index holds {} bytes, {} entries need {}",
                bytes.len(),
                capacity,
                capacity as usize * entry_size(key_size)
            )));
        }
        let entries = (0..capacity)
            .map(|_| IndexEntry::decode_from(&mut bytes, key_size))
            .collect();
        Ok(Self { key_size, entries })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::decode(&bytes)
    }

    /// Checkpoint the whole index with an atomic replace.
    pub fn save(&self, path: &Path) -> Result<()> {
        fsutil::write_atomic(path, &self.encode())
    }
}
