//! One table: two data files, the index, and row placement

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use sha2::{Digest, Sha256};

use super::index::{self, Index};
use super::manifest::TableMeta;
use super::page::{DataFile, DataFileHeader, Page, PageHeader};
use crate::error::{BedrockError, Result};
use crate::types::TxnId;

/// Home bucket (and first probed page) of a key.
pub fn bucket_of(key: &str, page_count: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_le_bytes(head) % page_count as u64) as u32
}

/// Placement state: allocated pages and slots handed to uncommitted inserts
struct Placement {
    pages: Vec<Option<PageHeader>>,
    slots: HashMap<(u32, u32), TxnId>,
    keys: HashMap<String, TxnId>,
}

pub struct Table {
    name: String,
    meta: TableMeta,
    index_path: PathBuf,
    files: [DataFile; 2],
    index: RwLock<Index>,
    placement: Mutex<Placement>,
}

impl Table {
    fn file_header(meta: &TableMeta) -> DataFileHeader {
        DataFileHeader::new(meta.page_count, meta.rows_per_page, meta.row_size)
    }

    /// Create the files of a new, empty table.
    pub fn create(dir: &Path, name: &str, meta: TableMeta) -> Result<Self> {
        let header = Self::file_header(&meta);
        let files = [
            DataFile::create(&meta.data_path(dir, name, 0), header)?,
            DataFile::create(&meta.data_path(dir, name, 1), header)?,
        ];
        let index = Index::new(meta.key_size, meta.index_capacity);
        let index_path = meta.index_path(dir, name);
        index.save(&index_path)?;

        Ok(Self {
            name: name.to_string(),
            meta,
            index_path,
            files,
            index: RwLock::new(index),
            placement: Mutex::new(Placement {
                pages: vec![None; meta.page_count as usize],
                slots: HashMap::new(),
                keys: HashMap::new(),
            }),
        })
    }

    pub fn open(dir: &Path, name: &str, meta: TableMeta) -> Result<Self> {
        let header = Self::file_header(&meta);
        let files = [
            DataFile::open(&meta.data_path(dir, name, 0), header)?,
            DataFile::open(&meta.data_path(dir, name, 1), header)?,
        ];
        let index_path = meta.index_path(dir, name);
        let index = Index::load(&index_path)?;
        if index.key_size() != meta.key_size || index.capacity() != meta.index_capacity as usize {
            return Err(BedrockError::corrupt(format!(
                "index of '{}' does not match manifest geometry",
                name
            )));
        }

        let mut pages = Vec::with_capacity(meta.page_count as usize);
        for page in 0..meta.page_count {
            let header = files[0].read_page_header(page)?;
            if let Some(h) = &header {
                if h.page_index != page {
                    return Err(BedrockError::corrupt(format!(
                        "'{}' page {} claims index {}",
                        name, page, h.page_index
                    )));
                }
            }
            pages.push(header);
        }

        Ok(Self {
            name: name.to_string(),
            meta,
            index_path,
            files,
            index: RwLock::new(index),
            placement: Mutex::new(Placement {
                pages,
                slots: HashMap::new(),
                keys: HashMap::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    pub fn file_paths(&self) -> Vec<PathBuf> {
        vec![
            self.files[0].path().to_path_buf(),
            self.files[1].path().to_path_buf(),
            self.index_path.clone(),
        ]
    }

    pub fn encode_key(&self, key: &str) -> Result<Vec<u8>> {
        index::encode_key(key, self.meta.key_size)
    }

    /// Zero-pad a row image to the table's row size.
    pub fn pad_row(&self, image: &[u8]) -> Result<Vec<u8>> {
        if image.len() > self.meta.row_size as usize {
            return Err(BedrockError::OutOfSpace(format!(
                "row of {} bytes does not fit '{}' (row size {})",
                image.len(),
                self.name,
                self.meta.row_size
            )));
        }
        let mut row = image.to_vec();
        row.resize(self.meta.row_size as usize, 0);
        Ok(row)
    }

    pub fn index(&self) -> RwLockReadGuard<'_, Index> {
        self.index.read().unwrap()
    }

    pub fn index_mut(&self) -> RwLockWriteGuard<'_, Index> {
        self.index.write().unwrap()
    }

    /// Check `key` is free and hand out a row slot for it.
    ///
    /// A key is taken if the index holds it in any state or another transaction has
    /// a pending insert of it.
    pub fn reserve_insert(&self, key: &str, txn: TxnId) -> Result<(u32, u32)> {
        let key_bytes = self.encode_key(key)?;
        let mut placement = self.placement.lock().unwrap();
        let index = self.index.read().unwrap();

        if index.find(&key_bytes).is_some() {
            return Err(BedrockError::duplicate_key(&self.name, key));
        }
        if let Some(owner) = placement.keys.get(key) {
            if *owner != txn {
                return Err(BedrockError::duplicate_key(&self.name, key));
            }
        }
        if index.used() + placement.keys.len() >= index.capacity() {
            return Err(BedrockError::OutOfSpace(format!(
                "index of '{}' is full",
                self.name
            )));
        }

        let (page, row) = self.place(&mut placement, &index, key)?;
        placement.slots.insert((page, row), txn);
        placement.keys.insert(key.to_string(), txn);
        Ok((page, row))
    }

    /// Probe pages from the key's bucket for a free row, allocating a page if the
    /// probe reaches an unallocated one first.
    fn place(&self, placement: &mut Placement, index: &Index, key: &str) -> Result<(u32, u32)> {
        let page_count = self.meta.page_count;
        let bucket = bucket_of(key, page_count);

        for step in 0..page_count {
            let page = (bucket + step) % page_count;
            match placement.pages[page as usize] {
                Some(header) if header.bucket == bucket => {
                    if let Some(row) = self.free_row(placement, index, &header) {
                        let cursor = &mut placement.pages[page as usize];
                        if let Some(h) = cursor {
                            h.next_free_row = (row + 1) % self.meta.rows_per_page;
                        }
                        return Ok((page, row));
                    }
                }
                Some(_) => {}
                None => {
                    let header = PageHeader {
                        page_index: page,
                        row_size: self.meta.row_size,
                        rows_per_page: self.meta.rows_per_page,
                        next_free_row: 1 % self.meta.rows_per_page,
                        bucket,
                    };
                    let blank = Page::new(header);
                    for file in &self.files {
                        file.write_page(&blank)?;
                    }
                    log::debug!(
                        "Allocated page {} of '{}' for bucket {}",
                        page,
                        self.name,
                        bucket
                    );
                    placement.pages[page as usize] = Some(header);
                    return Ok((page, 0));
                }
            }
        }

        Err(BedrockError::OutOfSpace(format!(
            "no free row for '{}' in '{}'",
            key, self.name
        )))
    }

    fn free_row(&self, placement: &Placement, index: &Index, header: &PageHeader) -> Option<u32> {
        let taken: HashSet<u32> = index
            .entries()
            .filter(|(_, e)| e.page == header.page_index)
            .map(|(_, e)| e.row)
            .collect();
        let rows = self.meta.rows_per_page;
        (0..rows)
            .map(|offset| (header.next_free_row + offset) % rows)
            .find(|row| {
                !taken.contains(row) && !placement.slots.contains_key(&(header.page_index, *row))
            })
    }

    /// Drop a reservation made by [`Table::reserve_insert`].
    pub fn release(&self, key: &str, page: u32, row: u32, txn: TxnId) {
        let mut placement = self.placement.lock().unwrap();
        if placement.slots.get(&(page, row)) == Some(&txn) {
            placement.slots.remove(&(page, row));
        }
        if placement.keys.get(key) == Some(&txn) {
            placement.keys.remove(key);
        }
    }

    /// Run `f` on the index while holding the placement lock, so a materialised insert
    /// trades its reservation for an index entry in one step.
    pub fn settle_insert<R>(
        &self,
        key: &str,
        page: u32,
        row: u32,
        txn: TxnId,
        f: impl FnOnce(&mut Index) -> Result<R>,
    ) -> Result<R> {
        let mut placement = self.placement.lock().unwrap();
        let mut index = self.index.write().unwrap();
        let out = f(&mut *index)?;
        if placement.slots.get(&(page, row)) == Some(&txn) {
            placement.slots.remove(&(page, row));
        }
        if placement.keys.get(key) == Some(&txn) {
            placement.keys.remove(key);
        }
        Ok(out)
    }

    fn file(&self, id: i32) -> Result<&DataFile> {
        match id {
            0 => Ok(&self.files[0]),
            1 => Ok(&self.files[1]),
            other => Err(BedrockError::corrupt(format!(
                "'{}' has no data file {}",
                self.name, other
            ))),
        }
    }

    pub fn read_image(&self, file: i32, page: u32, row: u32) -> Result<Vec<u8>> {
        self.file(file)?.read_row(page, row)
    }

    pub fn write_image(&self, file: i32, page: u32, row: u32, image: &[u8]) -> Result<()> {
        self.file(file)?.write_row(page, row, image)
    }

    /// Flush data files, then replace the index file with the in-memory index.
    pub fn checkpoint(&self) -> Result<()> {
        {
            let placement = self.placement.lock().unwrap();
            for header in placement.pages.iter().flatten() {
                for file in &self.files {
                    file.write_page_header(header)?;
                }
            }
        }
        for file in &self.files {
            file.sync()?;
        }
        let index = self.index.read().unwrap();
        index.save(&self.index_path)
    }
}
