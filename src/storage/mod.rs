//! Shadow-paged record store
//!
//! ## Directory Structure
//! ```text
//! data/
//! ├── manifest.json       # Table geometry and file generations
//! ├── flights.1.0.dat     # Data file 0 of table 'flights', generation 1
//! ├── flights.1.1.dat     # Data file 1
//! └── flights.1.idx       # Flat index
//! ```
//!
//! Every record has one row slot (page, row) shared by both data files. The index
//! entry's `active` names the file holding the committed image; an update writes the
//! other file and flips `active` on commit. Uncommitted inserts and deletes are
//! marked with [`ACTIVE_INSERTED`] and [`ACTIVE_DELETED`].
//!
//! ## Write path
//! 1. Insert/update/delete append to the transaction's in-memory update log. Inserts
//!    reserve their row slot right away so concurrent inserts of one key collide.
//! 2. `prepare` writes shadow images, tags index entries with the owner, and
//!    checkpoints the index.
//! 3. `commit` promotes shadows to active, or clears deleted entries, and
//!    checkpoints again. `abort` undoes whatever prepare did.
//!
//! On open, index entries still tagged with an owner are turned back into prepared
//! update logs so the coordinator can finish them.

mod index;
mod manifest;
mod page;
mod table;
mod txlog;

pub use index::{ACTIVE_DELETED, ACTIVE_INSERTED};
pub use manifest::TableMeta;
pub use txlog::UpdateOp;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{BedrockError, Result};
use crate::types::TxnId;
use index::IndexEntry;
use manifest::Manifest;
use table::Table;
use txlog::{TxnLog, UpdateEntry};

/// When writes reach the data files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Buffer until prepare, promote on commit
    #[default]
    TwoPhase,
    /// Materialise, promote and checkpoint inside each write call.
    /// prepare/commit/abort become no-ops.
    Direct,
}

/// Geometry for new tables plus the write mode
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub page_count: u32,
    pub rows_per_page: u32,
    pub row_size: u32,
    pub key_size: u32,
    /// Defaults to `page_count * rows_per_page`
    pub index_capacity: Option<u32>,
    pub write_mode: WriteMode,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            page_count: 64,
            rows_per_page: 32,
            row_size: 128,
            key_size: 32,
            index_capacity: None,
            write_mode: WriteMode::TwoPhase,
        }
    }
}

impl StorageConfig {
    /// Tiny tables, handy for tests and examples
    pub fn small() -> Self {
        Self {
            page_count: 8,
            rows_per_page: 4,
            row_size: 64,
            key_size: 16,
            index_capacity: None,
            write_mode: WriteMode::TwoPhase,
        }
    }

    pub fn direct(mut self) -> Self {
        self.write_mode = WriteMode::Direct;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.page_count == 0 || self.rows_per_page == 0 || self.row_size == 0 || self.key_size == 0 {
            return Err(BedrockError::Table(format!(
                "Invalid table geometry: {:?}",
                self
            )));
        }
        if self.index_capacity == Some(0) {
            return Err(BedrockError::Table("Index capacity must be positive".into()));
        }
        let page_body = self.rows_per_page.checked_mul(self.row_size);
        let page_fits = page_body
            .and_then(|body| body.checked_add(page::PAGE_HEADER_SIZE as u32))
            .is_some();
        if !page_fits || self.page_count.checked_mul(self.rows_per_page).is_none() {
            return Err(BedrockError::Table(format!(
                "Table geometry too large: {:?}",
                self
            )));
        }
        Ok(())
    }

    fn table_meta(&self, version: u64) -> TableMeta {
        TableMeta {
            version,
            page_count: self.page_count,
            rows_per_page: self.rows_per_page,
            row_size: self.row_size,
            key_size: self.key_size,
            index_capacity: self
                .index_capacity
                .unwrap_or_else(|| self.page_count.saturating_mul(self.rows_per_page)),
        }
    }
}

/// Validate a table name; it becomes part of file names.
fn validate_table_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BedrockError::Table("Table name cannot be empty".into()));
    }
    if name.contains("..") || name.contains(['/', '\\', '\0', '.']) {
        return Err(BedrockError::Table(format!(
            "Invalid table name '{}': contains forbidden characters",
            name
        )));
    }
    if name.len() > 200 {
        return Err(BedrockError::Table("Table name too long".into()));
    }
    Ok(())
}

/// Which data file a reader in `txn` sees for this entry, if any
fn visible_file(entry: &IndexEntry, txn: TxnId) -> Option<i32> {
    match entry.active {
        ACTIVE_INSERTED if entry.owner == txn => Some(entry.shadow),
        ACTIVE_INSERTED => None,
        ACTIVE_DELETED if entry.owner == txn => None,
        ACTIVE_DELETED => Some(entry.shadow),
        active => Some(active),
    }
}

pub struct Database {
    dir: PathBuf,
    config: StorageConfig,
    /// Table bookkeeping; taken before `tables` when both are needed
    manifest: Mutex<Manifest>,
    tables: RwLock<HashMap<String, Arc<Table>>>,
    logs: Mutex<HashMap<TxnId, TxnLog>>,
}

impl Database {
    /// Open (or create) the database in `dir` and rebuild the update logs of
    /// transactions that were prepared but not finished.
    pub fn open(dir: impl Into<PathBuf>, config: StorageConfig) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        config.validate()?;

        let manifest = Manifest::load(&dir)?;
        let mut tables = HashMap::new();
        for (name, meta) in &manifest.tables {
            let table = Table::open(&dir, name, *meta)?;
            tables.insert(name.clone(), Arc::new(table));
        }

        let db = Self {
            dir,
            config,
            manifest: Mutex::new(manifest),
            tables: RwLock::new(tables),
            logs: Mutex::new(HashMap::new()),
        };
        db.recover()?;
        Ok(db)
    }

    fn recover(&self) -> Result<()> {
        let tables: Vec<Arc<Table>> = self.tables.read().unwrap().values().cloned().collect();
        let mut logs = self.logs.lock().unwrap();
        let mut recovered = 0;

        for table in tables {
            let pending: Vec<IndexEntry> = table
                .index()
                .entries()
                .filter(|(_, e)| !e.owner.is_nil())
                .map(|(_, e)| e.clone())
                .collect();

            for entry in pending {
                let (op, image) = match entry.active {
                    ACTIVE_INSERTED => (
                        UpdateOp::Insert,
                        table.read_image(entry.shadow, entry.page, entry.row)?,
                    ),
                    ACTIVE_DELETED => (UpdateOp::Delete, Vec::new()),
                    _ => (
                        UpdateOp::Update,
                        table.read_image(entry.shadow, entry.page, entry.row)?,
                    ),
                };
                let log = logs.entry(entry.owner).or_default();
                log.prepared = true;
                log.entries.push(UpdateEntry {
                    op,
                    table: table.name().to_string(),
                    key: entry.key_str(),
                    page: entry.page,
                    row: entry.row,
                    image,
                    shadow: entry.shadow,
                    txn: entry.owner,
                });
                recovered += 1;
            }
        }

        if recovered > 0 {
            log::info!(
                "Recovered {} pending change(s) across {} prepared transaction(s)",
                recovered,
                logs.len()
            );
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Create a table with the database's default geometry
    pub fn create_table(&self, name: &str) -> Result<()> {
        let config = self.config.clone();
        self.create_table_with(name, &config)
    }

    pub fn create_table_with(&self, name: &str, geometry: &StorageConfig) -> Result<()> {
        validate_table_name(name)?;
        geometry.validate()?;

        let mut manifest = self.manifest.lock().unwrap();
        if manifest.tables.contains_key(name) {
            return Err(BedrockError::table_already_exists(name));
        }

        let version = manifest.allocate_version();
        let meta = geometry.table_meta(version);
        let table = Table::create(&self.dir, name, meta)?;
        manifest.tables.insert(name.to_string(), meta);
        if let Err(e) = manifest.save(&self.dir) {
            manifest.tables.remove(name);
            return Err(e);
        }
        self.tables
            .write()
            .unwrap()
            .insert(name.to_string(), Arc::new(table));

        log::info!(
            "Created table '{}' ({} pages x {} rows of {} bytes)",
            name,
            meta.page_count,
            meta.rows_per_page,
            meta.row_size
        );
        Ok(())
    }

    /// Drop a table and delete its files. Refused while a transaction has pending
    /// changes against it.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let mut manifest = self.manifest.lock().unwrap();
        if !manifest.tables.contains_key(name) {
            return Err(BedrockError::table_not_found(name));
        }
        {
            let logs = self.logs.lock().unwrap();
            if let Some((txn, _)) = logs
                .iter()
                .find(|(_, log)| log.entries.iter().any(|e| e.table == name))
            {
                return Err(BedrockError::Transaction(format!(
                    "Table '{}' has pending changes from transaction {}",
                    name, txn
                )));
            }
        }

        manifest.tables.remove(name);
        manifest.save(&self.dir)?;
        let table = self.tables.write().unwrap().remove(name);
        if let Some(table) = table {
            for path in table.file_paths() {
                if let Err(e) = fs::remove_file(&path) {
                    log::warn!("Could not remove '{}': {}", path.display(), e);
                }
            }
        }
        log::info!("Dropped table '{}'", name);
        Ok(())
    }

    pub fn tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.tables.read().unwrap().contains_key(name)
    }

    pub fn table_geometry(&self, name: &str) -> Result<TableMeta> {
        Ok(*self.table(name)?.meta())
    }

    /// Number of buffered entries in `txn`'s update log
    pub fn pending(&self, txn: TxnId) -> usize {
        self.logs
            .lock()
            .unwrap()
            .get(&txn)
            .map(TxnLog::len)
            .unwrap_or(0)
    }

    /// Transactions with an update log, prepared or not
    pub fn transactions(&self) -> Vec<TxnId> {
        let mut txns: Vec<TxnId> = self.logs.lock().unwrap().keys().copied().collect();
        txns.sort();
        txns
    }

    fn table(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| BedrockError::table_not_found(name))
    }

    fn check_open(txn: TxnId, log: &TxnLog) -> Result<()> {
        if log.prepared {
            return Err(BedrockError::Transaction(format!(
                "Transaction {} is already prepared",
                txn
            )));
        }
        Ok(())
    }

    /// Slot and active file of a committed record that `txn` may change
    fn durable_target(table: &Table, txn: TxnId, key: &str) -> Result<(u32, u32, i32)> {
        let key_bytes = table.encode_key(key)?;
        let index = table.index();
        let slot = index
            .find(&key_bytes)
            .ok_or_else(|| BedrockError::record_not_found(table.name(), key))?;
        let entry = index.get(slot);
        if entry.active == ACTIVE_INSERTED && entry.owner != txn {
            return Err(BedrockError::record_not_found(table.name(), key));
        }
        if entry.owned_by_other(txn) {
            return Err(BedrockError::Transaction(format!(
                "'{}' in '{}' has a pending change from transaction {}",
                key,
                table.name(),
                entry.owner
            )));
        }
        if entry.active < 0 {
            return Err(BedrockError::record_not_found(table.name(), key));
        }
        Ok((entry.page, entry.row, entry.active))
    }

    fn push(&self, entry: UpdateEntry) -> Result<()> {
        let mut logs = self.logs.lock().unwrap();
        let log = logs.entry(entry.txn).or_default();
        Self::check_open(entry.txn, log)?;
        log.entries.push(entry);
        Ok(())
    }

    pub fn insert_record(&self, txn: TxnId, table: &str, key: &str, row: &[u8]) -> Result<()> {
        let t = self.table(table)?;
        t.encode_key(key)?;
        let image = t.pad_row(row)?;

        if self.config.write_mode == WriteMode::TwoPhase {
            let mut logs = self.logs.lock().unwrap();
            if let Some(log) = logs.get_mut(&txn) {
                Self::check_open(txn, log)?;
                if let Some(i) = log.find(table, key) {
                    let entry = &mut log.entries[i];
                    return match entry.op {
                        UpdateOp::Insert | UpdateOp::Update => {
                            Err(BedrockError::duplicate_key(table, key))
                        }
                        UpdateOp::Delete => {
                            entry.op = UpdateOp::Update;
                            entry.shadow = 1 - entry.shadow;
                            entry.image = image;
                            Ok(())
                        }
                    };
                }
            }
        }

        let (page, row) = t.reserve_insert(key, txn)?;
        let entry = UpdateEntry {
            op: UpdateOp::Insert,
            table: table.to_string(),
            key: key.to_string(),
            page,
            row,
            image,
            shadow: 0,
            txn,
        };
        let result = match self.config.write_mode {
            WriteMode::TwoPhase => self.push(entry),
            WriteMode::Direct => self.apply_direct(&t, &entry),
        };
        if result.is_err() {
            t.release(key, page, row, txn);
        }
        result
    }

    pub fn update_record(&self, txn: TxnId, table: &str, key: &str, row: &[u8]) -> Result<()> {
        let t = self.table(table)?;
        t.encode_key(key)?;
        let image = t.pad_row(row)?;

        if self.config.write_mode == WriteMode::TwoPhase {
            let mut logs = self.logs.lock().unwrap();
            if let Some(log) = logs.get_mut(&txn) {
                Self::check_open(txn, log)?;
                if let Some(i) = log.find(table, key) {
                    let entry = &mut log.entries[i];
                    return match entry.op {
                        UpdateOp::Insert | UpdateOp::Update => {
                            entry.image = image;
                            Ok(())
                        }
                        UpdateOp::Delete => Err(BedrockError::record_not_found(table, key)),
                    };
                }
            }
        }

        let (page, row, active) = Self::durable_target(&t, txn, key)?;
        let entry = UpdateEntry {
            op: UpdateOp::Update,
            table: table.to_string(),
            key: key.to_string(),
            page,
            row,
            image,
            shadow: 1 - active,
            txn,
        };
        match self.config.write_mode {
            WriteMode::TwoPhase => self.push(entry),
            WriteMode::Direct => self.apply_direct(&t, &entry),
        }
    }

    pub fn delete_record(&self, txn: TxnId, table: &str, key: &str) -> Result<()> {
        let t = self.table(table)?;
        t.encode_key(key)?;

        if self.config.write_mode == WriteMode::TwoPhase {
            let cancelled = {
                let mut logs = self.logs.lock().unwrap();
                match logs.get_mut(&txn) {
                    Some(log) => {
                        Self::check_open(txn, log)?;
                        match log.find(table, key) {
                            Some(i) => match log.entries[i].op {
                                UpdateOp::Insert => Some(log.entries.remove(i)),
                                UpdateOp::Update => {
                                    let entry = &mut log.entries[i];
                                    entry.op = UpdateOp::Delete;
                                    entry.shadow = 1 - entry.shadow;
                                    entry.image.clear();
                                    return Ok(());
                                }
                                UpdateOp::Delete => {
                                    return Err(BedrockError::record_not_found(table, key))
                                }
                            },
                            None => None,
                        }
                    }
                    None => None,
                }
            };
            if let Some(insert) = cancelled {
                t.release(key, insert.page, insert.row, txn);
                return Ok(());
            }
        }

        let (page, row, active) = Self::durable_target(&t, txn, key)?;
        let entry = UpdateEntry {
            op: UpdateOp::Delete,
            table: table.to_string(),
            key: key.to_string(),
            page,
            row,
            image: Vec::new(),
            shadow: active,
            txn,
        };
        match self.config.write_mode {
            WriteMode::TwoPhase => self.push(entry),
            WriteMode::Direct => self.apply_direct(&t, &entry),
        }
    }

    /// `Some(Some(image))` for a buffered insert/update, `Some(None)` for a buffered
    /// delete, `None` when `txn` has not touched the key.
    fn own_image(&self, txn: TxnId, table: &str, key: &str) -> Option<Option<Vec<u8>>> {
        let logs = self.logs.lock().unwrap();
        let log = logs.get(&txn)?;
        let entry = &log.entries[log.find(table, key)?];
        match entry.op {
            UpdateOp::Delete => Some(None),
            _ => Some(Some(entry.image.clone())),
        }
    }

    /// Read one record as `txn` sees it: its own pending writes first, then the
    /// committed image. Other transactions' uncommitted inserts are invisible and
    /// their uncommitted deletes still show the old image.
    pub fn read_record(&self, txn: TxnId, table: &str, key: &str) -> Result<Vec<u8>> {
        let t = self.table(table)?;
        let key_bytes = t.encode_key(key)?;

        if let Some(own) = self.own_image(txn, table, key) {
            return own.ok_or_else(|| BedrockError::record_not_found(table, key));
        }

        let (file, page, row) = {
            let index = t.index();
            let slot = index
                .find(&key_bytes)
                .ok_or_else(|| BedrockError::record_not_found(table, key))?;
            let entry = index.get(slot);
            let file = visible_file(entry, txn)
                .ok_or_else(|| BedrockError::record_not_found(table, key))?;
            (file, entry.page, entry.row)
        };
        t.read_image(file, page, row)
    }

    /// Every record of `table` visible to `txn`, sorted by key
    pub fn read_all_records(&self, txn: TxnId, table: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let t = self.table(table)?;
        let own: Vec<UpdateEntry> = {
            let logs = self.logs.lock().unwrap();
            logs.get(&txn)
                .map(|log| {
                    log.entries
                        .iter()
                        .filter(|e| e.table == table)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        let committed: Vec<(String, i32, u32, u32)> = {
            let index = t.index();
            index
                .entries()
                .map(|(_, e)| (e.key_str(), e))
                .filter(|(key, _)| !own.iter().any(|o| &o.key == key))
                .filter_map(|(key, e)| visible_file(e, txn).map(|file| (key, file, e.page, e.row)))
                .collect()
        };

        let mut records = Vec::with_capacity(committed.len() + own.len());
        for (key, file, page, row) in committed {
            records.push((key, t.read_image(file, page, row)?));
        }
        for entry in own {
            if entry.op != UpdateOp::Delete {
                records.push((entry.key, entry.image));
            }
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }

    /// Write shadow images and tag index entries with the owner. Nothing is
    /// checkpointed here.
    fn materialize(&self, t: &Table, entry: &UpdateEntry) -> Result<()> {
        let key_bytes = t.encode_key(&entry.key)?;
        match entry.op {
            UpdateOp::Insert => {
                t.write_image(entry.shadow, entry.page, entry.row, &entry.image)?;
                t.settle_insert(&entry.key, entry.page, entry.row, entry.txn, |index| {
                    let pending = IndexEntry {
                        key: key_bytes.clone(),
                        page: entry.page,
                        row: entry.row,
                        active: ACTIVE_INSERTED,
                        shadow: entry.shadow,
                        dirty: true,
                        owner: entry.txn,
                    };
                    match index.find(&key_bytes) {
                        Some(slot) if index.get(slot).owner == entry.txn => {
                            *index.get_mut(slot) = pending;
                        }
                        Some(_) => return Err(BedrockError::duplicate_key(t.name(), &entry.key)),
                        None => {
                            index.insert(pending)?;
                        }
                    }
                    Ok(())
                })
            }
            UpdateOp::Update | UpdateOp::Delete => {
                let mut index = t.index_mut();
                let slot = index
                    .find(&key_bytes)
                    .ok_or_else(|| BedrockError::record_not_found(t.name(), &entry.key))?;
                let current = index.get_mut(slot);
                if current.owned_by_other(entry.txn) {
                    return Err(BedrockError::Transaction(format!(
                        "'{}' in '{}' has a pending change from transaction {}",
                        entry.key,
                        t.name(),
                        current.owner
                    )));
                }

                if entry.op == UpdateOp::Update {
                    if current.active != 1 - entry.shadow {
                        return Err(BedrockError::Transaction(format!(
                            "'{}' in '{}' changed after it was buffered",
                            entry.key,
                            t.name()
                        )));
                    }
                    t.write_image(entry.shadow, entry.page, entry.row, &entry.image)?;
                    current.shadow = entry.shadow;
                } else if current.active != ACTIVE_DELETED {
                    if current.active != entry.shadow {
                        return Err(BedrockError::Transaction(format!(
                            "'{}' in '{}' changed after it was buffered",
                            entry.key,
                            t.name()
                        )));
                    }
                    current.shadow = current.active;
                    current.active = ACTIVE_DELETED;
                }
                current.dirty = true;
                current.owner = entry.txn;
                Ok(())
            }
        }
    }

    /// Make a materialised entry the committed state.
    fn promote(&self, t: &Table, entry: &UpdateEntry) -> Result<()> {
        let key_bytes = t.encode_key(&entry.key)?;
        let mut index = t.index_mut();
        let slot = match index.find(&key_bytes) {
            Some(slot) => slot,
            None => return Ok(()),
        };
        if index.get(slot).owner != entry.txn {
            return Ok(());
        }
        match entry.op {
            UpdateOp::Insert | UpdateOp::Update => {
                let current = index.get_mut(slot);
                current.active = current.shadow;
                current.dirty = false;
                current.owner = TxnId::NIL;
            }
            UpdateOp::Delete => index.clear(slot),
        }
        Ok(())
    }

    /// Reverse whatever `materialize` did for `entry`. Returns whether the index
    /// changed.
    fn undo(&self, t: &Table, entry: &UpdateEntry) -> Result<bool> {
        let key_bytes = t.encode_key(&entry.key)?;
        let changed = {
            let mut index = t.index_mut();
            match index.find(&key_bytes) {
                Some(slot) if index.get(slot).owner == entry.txn => {
                    if index.get(slot).active == ACTIVE_INSERTED {
                        index.clear(slot);
                    } else {
                        let current = index.get_mut(slot);
                        if current.active == ACTIVE_DELETED {
                            current.active = current.shadow;
                        } else {
                            current.shadow = current.active;
                        }
                        current.dirty = false;
                        current.owner = TxnId::NIL;
                    }
                    true
                }
                _ => false,
            }
        };
        if entry.op == UpdateOp::Insert {
            t.release(&entry.key, entry.page, entry.row, entry.txn);
        }
        Ok(changed)
    }

    fn apply_direct(&self, t: &Table, entry: &UpdateEntry) -> Result<()> {
        if let Err(e) = self.materialize(t, entry) {
            self.undo(t, entry)?;
            return Err(e);
        }
        self.promote(t, entry)?;
        t.checkpoint()
    }

    fn touched_tables(&self, log: &TxnLog) -> Result<Vec<Arc<Table>>> {
        log.tables().iter().map(|name| self.table(name)).collect()
    }

    /// Materialise `txn`'s update log and checkpoint the touched indexes. After this
    /// the transaction survives a restart. Idempotent.
    pub fn prepare(&self, txn: TxnId) -> Result<()> {
        let log = {
            let logs = self.logs.lock().unwrap();
            match logs.get(&txn) {
                None => return Ok(()),
                Some(log) if log.prepared => return Ok(()),
                Some(log) => log.clone(),
            }
        };

        let tables = self.touched_tables(&log)?;
        for entry in &log.entries {
            let t = self.table(&entry.table)?;
            self.materialize(&t, entry)?;
        }
        for t in &tables {
            t.checkpoint()?;
        }

        if let Some(log) = self.logs.lock().unwrap().get_mut(&txn) {
            log.prepared = true;
        }
        log::debug!("Prepared {} ({} entries)", txn, log.len());
        Ok(())
    }

    /// Promote `txn`'s changes, preparing first if needed. Idempotent; committing an
    /// unknown transaction succeeds.
    pub fn commit(&self, txn: TxnId) -> Result<()> {
        let prepared = match self.logs.lock().unwrap().get(&txn) {
            None => return Ok(()),
            Some(log) => log.prepared,
        };
        if !prepared {
            self.prepare(txn)?;
        }

        let log = match self.logs.lock().unwrap().get(&txn) {
            None => return Ok(()),
            Some(log) => log.clone(),
        };
        let tables = self.touched_tables(&log)?;
        for entry in &log.entries {
            let t = self.table(&entry.table)?;
            self.promote(&t, entry)?;
        }
        for t in &tables {
            t.checkpoint()?;
        }

        self.logs.lock().unwrap().remove(&txn);
        log::debug!("Committed {} ({} entries)", txn, log.len());
        Ok(())
    }

    /// Discard `txn`'s changes. Idempotent; aborting an unknown transaction succeeds.
    pub fn abort(&self, txn: TxnId) -> Result<()> {
        let log = match self.logs.lock().unwrap().get(&txn) {
            None => return Ok(()),
            Some(log) => log.clone(),
        };

        let tables = self.touched_tables(&log)?;
        let mut changed = false;
        for entry in &log.entries {
            let t = self.table(&entry.table)?;
            changed |= self.undo(&t, entry)?;
        }
        if changed {
            for t in &tables {
                t.checkpoint()?;
            }
        }

        self.logs.lock().unwrap().remove(&txn);
        log::debug!("Aborted {} ({} entries)", txn, log.len());
        Ok(())
    }
}
