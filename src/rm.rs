//! In-process resource manager
//!
//! An inventory store built from one lock manager and one database. Each resource
//! kind ("flight", "car", ...) is a table keyed by resource id; rows are
//! bincode-encoded [`Resource`] records. Reads take Read locks and writes take Write
//! locks on `(kind, id)`. Adding or removing a resource also write-locks the kind as
//! a whole, which `list` read-locks, so a listing never sees phantoms.
//!
//! Locks are held until commit or abort, both of which release everything the
//! transaction holds.

use std::path::Path;

use crate::coordinator::Participant;
use crate::error::{BedrockError, Result};
use crate::lock::{LockConfig, LockManager};
use crate::storage::{Database, StorageConfig};
use crate::types::{Resource, ResourceKey, TxnId};

/// Lock key kind used for whole-table locks
const TABLE_LOCK_KIND: &str = "table";

pub struct ResourceManager {
    name: String,
    locks: LockManager<ResourceKey>,
    db: Database,
}

impl ResourceManager {
    pub fn new(name: impl Into<String>, locks: LockManager<ResourceKey>, db: Database) -> Result<Self> {
        let name = name.into();
        if !crate::coordinator::log::valid_participant_name(&name) {
            return Err(BedrockError::Internal(format!(
                "'{}' cannot be used as a participant name",
                name
            )));
        }
        Ok(Self { name, locks, db })
    }

    /// Open the store in `dir`, finishing nothing: prepared transactions found on
    /// disk wait for the coordinator to commit or abort them.
    pub fn open(
        name: impl Into<String>,
        dir: &Path,
        lock_config: LockConfig,
        storage_config: StorageConfig,
    ) -> Result<Self> {
        let db = Database::open(dir, storage_config)?;
        Self::new(name, LockManager::new(lock_config), db)
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn locks(&self) -> &LockManager<ResourceKey> {
        &self.locks
    }

    /// Mint an id for a new transaction
    pub fn start(&self) -> TxnId {
        TxnId::generate()
    }

    fn ensure_table(&self, kind: &str) -> Result<()> {
        if self.db.table_exists(kind) {
            return Ok(());
        }
        match self.db.create_table(kind) {
            Err(BedrockError::Table(_)) if self.db.table_exists(kind) => Ok(()),
            other => other,
        }
    }

    fn encode(resource: &Resource) -> Result<Vec<u8>> {
        Ok(bincode::serialize(resource)?)
    }

    fn decode(bytes: &[u8]) -> Result<Resource> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn read(&self, txn: TxnId, kind: &str, id: &str) -> Result<Option<Resource>> {
        if !self.db.table_exists(kind) {
            return Ok(None);
        }
        match self.db.read_record(txn, kind, id) {
            Ok(bytes) => Ok(Some(Self::decode(&bytes)?)),
            Err(BedrockError::RecordNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Add `count` units of a resource, creating it if needed. The price is always
    /// overwritten.
    pub fn add(&self, txn: TxnId, kind: &str, id: &str, count: i64, price: i64) -> Result<()> {
        self.locks.lock_for_write(txn, &ResourceKey::new(kind, id))?;
        self.ensure_table(kind)?;

        match self.read(txn, kind, id)? {
            Some(mut resource) => {
                resource.count = resource.count.checked_add(count).ok_or_else(|| {
                    BedrockError::Transaction(format!(
                        "adding {} to '{}' would overflow its count",
                        count, id
                    ))
                })?;
                resource.price = price;
                self.db.update_record(txn, kind, id, &Self::encode(&resource)?)
            }
            None => {
                self.locks
                    .lock_for_write(txn, &ResourceKey::new(TABLE_LOCK_KIND, kind))?;
                let resource = Resource::new(id, count, price);
                self.db.insert_record(txn, kind, id, &Self::encode(&resource)?)
            }
        }
    }

    pub fn query(&self, txn: TxnId, kind: &str, id: &str) -> Result<Option<Resource>> {
        self.locks.lock_for_read(txn, &ResourceKey::new(kind, id))?;
        self.read(txn, kind, id)
    }

    /// Delete a resource. Returns false if it did not exist.
    pub fn remove(&self, txn: TxnId, kind: &str, id: &str) -> Result<bool> {
        self.locks.lock_for_write(txn, &ResourceKey::new(kind, id))?;
        if self.read(txn, kind, id)?.is_none() {
            return Ok(false);
        }
        self.locks
            .lock_for_write(txn, &ResourceKey::new(TABLE_LOCK_KIND, kind))?;
        self.db.delete_record(txn, kind, id)?;
        Ok(true)
    }

    /// Take `n` units of a resource. Fails without changing anything if fewer
    /// than `n` are left.
    pub fn reserve(&self, txn: TxnId, kind: &str, id: &str, n: i64) -> Result<Resource> {
        self.locks.lock_for_write(txn, &ResourceKey::new(kind, id))?;
        let mut resource = self.read(txn, kind, id)?.ok_or_else(|| {
            BedrockError::record_not_found(kind, id)
        })?;
        if resource.count < n {
            return Err(BedrockError::Transaction(format!(
                "Only {} of '{}' left in '{}', {} requested",
                resource.count, id, kind, n
            )));
        }
        resource.count -= n;
        self.db.update_record(txn, kind, id, &Self::encode(&resource)?)?;
        Ok(resource)
    }

    /// Every resource of `kind`, sorted by id
    pub fn list(&self, txn: TxnId, kind: &str) -> Result<Vec<Resource>> {
        self.locks
            .lock_for_read(txn, &ResourceKey::new(TABLE_LOCK_KIND, kind))?;
        if !self.db.table_exists(kind) {
            return Ok(Vec::new());
        }
        self.db
            .read_all_records(txn, kind)?
            .iter()
            .map(|(_, bytes)| Self::decode(bytes))
            .collect()
    }
}

impl Participant for ResourceManager {
    fn name(&self) -> String {
        self.name.clone()
    }

    /// Votes no for a transaction this manager has no trace of. That is the
    /// case after a restart that lost its unprepared writes.
    fn prepare(&self, txn: TxnId) -> Result<()> {
        if self.db.pending(txn) == 0 && !self.locks.holds_any(txn) {
            log::warn!("[{}] refusing to prepare unknown transaction {}", self.name, txn);
            return Err(BedrockError::Transaction(format!(
                "{} has no work or locks at '{}'",
                txn, self.name
            )));
        }
        self.db.prepare(txn)
    }

    fn commit(&self, txn: TxnId) -> Result<()> {
        let result = self.db.commit(txn);
        self.locks.unlock_all(txn);
        if let Err(e) = &result {
            log::error!("[{}] commit of {} failed: {}", self.name, txn, e);
        }
        result
    }

    fn abort(&self, txn: TxnId) -> Result<()> {
        let result = self.db.abort(txn);
        self.locks.unlock_all(txn);
        if let Err(e) = &result {
            log::error!("[{}] abort of {} failed: {}", self.name, txn, e);
        }
        result
    }
}
