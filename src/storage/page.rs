//! Pages and data files
//!
//! ## Data file layout
//! ```text
//! +--------------------+ 0
//! | DataFileHeader     | 32 bytes
//! +--------------------+ 32
//! | page 0             | page_size bytes
//! | page 1             |
//! | ...                |
//! +--------------------+ 32 + page_count * page_size
//! ```
//!
//! ## Page layout
//! ```text
//! +--------------------+ 0
//! | PageHeader         | 32 bytes
//! +--------------------+ 32
//! | row 0              | row_size bytes
//! | ...                |
//! | row rows_per_page-1|
//! +--------------------+
//! ```
//!
//! All integers are little-endian at fixed offsets. A page whose header is all zero
//! has never been allocated; data files are created sparse.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::{Buf, BufMut};

use crate::error::{BedrockError, Result};

pub const DATA_MAGIC: [u8; 4] = *b"BRDT";
pub const PAGE_MAGIC: [u8; 4] = *b"BRPG";
pub const FORMAT_VERSION: u16 = 1;

pub const DATA_HEADER_SIZE: usize = 32;
pub const PAGE_HEADER_SIZE: usize = 32;

/// Fixed header at the start of each data file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFileHeader {
    pub page_count: u32,
    pub page_size: u32,
    pub row_size: u32,
    pub rows_per_page: u32,
}

impl DataFileHeader {
    pub fn new(page_count: u32, rows_per_page: u32, row_size: u32) -> Self {
        Self {
            page_count,
            page_size: page_size(rows_per_page, row_size),
            row_size,
            rows_per_page,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DATA_HEADER_SIZE);
        buf.put_slice(&DATA_MAGIC);
        buf.put_u16_le(FORMAT_VERSION);
        buf.put_u16_le(0);
        buf.put_u32_le(self.page_count);
        buf.put_u32_le(self.page_size);
        buf.put_u32_le(self.row_size);
        buf.put_u32_le(self.rows_per_page);
        buf.resize(DATA_HEADER_SIZE, 0);
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DATA_HEADER_SIZE {
            return Err(BedrockError::corrupt("data file header truncated"));
        }
        let mut magic = [0u8; 4];
        bytes.copy_to_slice(&mut magic);
        if magic != DATA_MAGIC {
            return Err(BedrockError::corrupt(format!("bad data file magic {:?}", magic)));
        }
        let version = bytes.get_u16_le();
        if version != FORMAT_VERSION {
            return Err(BedrockError::corrupt(format!(
                "unsupported data file version {}",
                version
            )));
        }
        bytes.advance(2);
        Ok(Self {
            page_count: bytes.get_u32_le(),
            page_size: bytes.get_u32_le(),
            row_size: bytes.get_u32_le(),
            rows_per_page: bytes.get_u32_le(),
        })
    }
}

pub fn page_size(rows_per_page: u32, row_size: u32) -> u32 {
    rows_per_page
        .saturating_mul(row_size)
        .saturating_add(PAGE_HEADER_SIZE as u32)
}

/// Header at the start of each page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub page_index: u32,
    pub row_size: u32,
    pub rows_per_page: u32,
    /// Where the next free-row search starts
    pub next_free_row: u32,
    /// Hash bucket that allocated this page
    pub bucket: u32,
}

impl PageHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PAGE_HEADER_SIZE);
        buf.put_slice(&PAGE_MAGIC);
        buf.put_u16_le(FORMAT_VERSION);
        buf.put_u16_le(0);
        buf.put_u32_le(self.page_index);
        buf.put_u32_le(self.row_size);
        buf.put_u32_le(self.rows_per_page);
        buf.put_u32_le(self.next_free_row);
        buf.put_u32_le(self.bucket);
        buf.resize(PAGE_HEADER_SIZE, 0);
        buf
    }

    /// `None` for an unallocated (all-zero) header.
    pub fn decode(mut bytes: &[u8]) -> Result<Option<Self>> {
        if bytes.len() < PAGE_HEADER_SIZE {
            return Err(BedrockError::corrupt("page header truncated"));
        }
        if bytes[..PAGE_HEADER_SIZE].iter().all(|b| *b == 0) {
            return Ok(None);
        }
        let mut magic = [0u8; 4];
        bytes.copy_to_slice(&mut magic);
        if magic != PAGE_MAGIC {
            return Err(BedrockError::corrupt(format!("bad page magic {:?}", magic)));
        }
        let version = bytes.get_u16_le();
        if version != FORMAT_VERSION {
            return Err(BedrockError::corrupt(format!("unsupported page version {}", version)));
        }
        bytes.advance(2);
        Ok(Some(Self {
            page_index: bytes.get_u32_le(),
            row_size: bytes.get_u32_le(),
            rows_per_page: bytes.get_u32_le(),
            next_free_row: bytes.get_u32_le(),
            bucket: bytes.get_u32_le(),
        }))
    }
}

/// A whole page: header plus fixed row slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub header: PageHeader,
    rows: Vec<u8>,
}

impl Page {
    pub fn new(header: PageHeader) -> Self {
        let len = header.rows_per_page as usize * header.row_size as usize;
        Self {
            header,
            rows: vec![0; len],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.header.encode();
        buf.extend_from_slice(&self.rows);
        buf
    }
}

/// One of a table's two physical data files
pub struct DataFile {
    path: PathBuf,
    header: DataFileHeader,
    file: Mutex<File>,
}

impl DataFile {
    /// Create a new, fully unallocated data file
    pub fn create(path: &Path, header: DataFileHeader) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all(&header.encode())?;
        file.set_len(DATA_HEADER_SIZE as u64 + header.page_count as u64 * header.page_size as u64)?;
        file.sync_all()?;
        Ok(Self {
            path: path.to_path_buf(),
            header,
            file: Mutex::new(file),
        })
    }

    /// Open an existing data file, checking its geometry against `expected`
    pub fn open(path: &Path, expected: DataFileHeader) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut buf = [0u8; DATA_HEADER_SIZE];
        file.read_exact(&mut buf)?;
        let header = DataFileHeader::decode(&buf)?;
        if header != expected {
            return Err(BedrockError::corrupt(format!(
                "'{}' geometry {:?} does not match manifest {:?}",
                path.display(),
                header,
                expected
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            header,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn page_offset(&self, page: u32) -> u64 {
        DATA_HEADER_SIZE as u64 + page as u64 * self.header.page_size as u64
    }

    fn check_slot(&self, page: u32, row: u32) -> Result<()> {
        if page >= self.header.page_count || row >= self.header.rows_per_page {
            return Err(BedrockError::corrupt(format!(
                "slot ({}, {}) outside {} pages x {} rows",
                page, row, self.header.page_count, self.header.rows_per_page
            )));
        }
        Ok(())
    }

    pub fn read_page_header(&self, page: u32) -> Result<Option<PageHeader>> {
        self.check_slot(page, 0)?;
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(self.page_offset(page)))?;
        file.read_exact(&mut buf)?;
        PageHeader::decode(&buf)
    }

    pub fn write_page_header(&self, header: &PageHeader) -> Result<()> {
        self.check_slot(header.page_index, 0)?;
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(self.page_offset(header.page_index)))?;
        file.write_all(&header.encode())?;
        Ok(())
    }

    pub fn write_page(&self, page: &Page) -> Result<()> {
        self.check_slot(page.header.page_index, 0)?;
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(self.page_offset(page.header.page_index)))?;
        file.write_all(&page.encode())?;
        Ok(())
    }

    /// Read one row image, validating the page header first.
    pub fn read_row(&self, page: u32, row: u32) -> Result<Vec<u8>> {
        self.check_slot(page, row)?;
        let header = self.read_page_header(page)?.ok_or_else(|| {
            BedrockError::corrupt(format!(
                "'{}' page {} read before allocation",
                self.path.display(),
                page
            ))
        })?;
        if header.page_index != page || header.row_size != self.header.row_size {
            return Err(BedrockError::corrupt(format!(
                "'{}' page {} header mismatch: {:?}",
                self.path.display(),
                page,
                header
            )));
        }

        let offset = self.page_offset(page)
            + PAGE_HEADER_SIZE as u64
            + row as u64 * self.header.row_size as u64;
        let mut buf = vec![0u8; self.header.row_size as usize];
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_row(&self, page: u32, row: u32, image: &[u8]) -> Result<()> {
        self.check_slot(page, row)?;
        if image.len() != self.header.row_size as usize {
            return Err(BedrockError::Internal(format!(
                "row image is {} bytes, row size is {}",
                image.len(),
                self.header.row_size
            )));
        }
        let offset = self.page_offset(page)
            + PAGE_HEADER_SIZE as u64
            + row as u64 * self.header.row_size as u64;
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(image)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().unwrap().sync_data()?;
        Ok(())
    }
}
