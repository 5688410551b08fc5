//! Per-transaction update log
//!
//! Writes are buffered here until prepare. Each entry already knows its row slot and
//! the data file its image goes to, so prepare only has to copy images out and
//! retarget index entries.

use crate::types::TxnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEntry {
    pub op: UpdateOp,
    pub table: String,
    pub key: String,
    pub page: u32,
    pub row: u32,
    /// Full row image (empty for deletes)
    pub image: Vec<u8>,
    /// Insert/Update: file the image is written to. Delete: file holding the image
    /// being deleted.
    pub shadow: i32,
    pub txn: TxnId,
}

#[derive(Debug, Clone, Default)]
pub struct TxnLog {
    pub entries: Vec<UpdateEntry>,
    /// Set once every entry has been materialised
    pub prepared: bool,
}

impl TxnLog {
    pub fn find(&self, table: &str, key: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.table == table && e.key == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Names of the tables this log touches, each once
    pub fn tables(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for entry in &self.entries {
            if !names.contains(&entry.table) {
                names.push(entry.table.clone());
            }
        }
        names
    }
}
