//! Database manifest
//!
//! ```json
//! {
//!   "format_version": 1,
//!   "next_version": 3,
//!   "tables": {
//!     "flights": {
//!       "version": 1,
//!       "page_count": 64,
//!       "rows_per_page": 32,
//!       "row_size": 128,
//!       "key_size": 32,
//!       "index_capacity": 2048
//!     }
//!   }
//! }
//! ```
//!
//! `version` is the table's file generation: every file belonging to the table carries
//! it in its name, so a table dropped and created again never reuses old files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BedrockError, Result};
use crate::fsutil;

pub const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_VERSION: u32 = 1;

/// Geometry and generation of one table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub version: u64,
    pub page_count: u32,
    pub rows_per_page: u32,
    pub row_size: u32,
    pub key_size: u32,
    pub index_capacity: u32,
}

impl TableMeta {
    pub fn index_path(&self, dir: &Path, table: &str) -> PathBuf {
        dir.join(format!("{}.{}.idx", table, self.version))
    }

    /// Path of data file 0 or 1
    pub fn data_path(&self, dir: &Path, table: &str, file: usize) -> PathBuf {
        dir.join(format!("{}.{}.{}.dat", table, self.version, file))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub next_version: u64,
    pub tables: BTreeMap<String, TableMeta>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            format_version: MANIFEST_VERSION,
            next_version: 1,
            tables: BTreeMap::new(),
        }
    }
}

impl Manifest {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    /// Load the manifest of `dir`, or an empty one for a new database.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = Self::path(dir);
        let bytes = match fsutil::read_with_backup(&path)? {
            Some(bytes) => bytes,
            None => return Ok(Self::default()),
        };
        let manifest: Manifest = serde_json::from_slice(&bytes).map_err(|e| {
            BedrockError::Encoding(format!(
                "Failed to parse manifest '{}': {}",
                path.display(),
                e
            ))
        })?;
        if manifest.format_version != MANIFEST_VERSION {
            return Err(BedrockError::corrupt(format!(
                "unsupported manifest version {}",
                manifest.format_version
            )));
        }
        Ok(manifest)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        fsutil::replace_with_backup(&Self::path(dir), &bytes)
    }

    /// Hand out the next file generation
    pub fn allocate_version(&mut self) -> u64 {
        let version = self.next_version;
        self.next_version += 1;
        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn meta(version: u64) -> TableMeta {
        TableMeta {
            version,
            page_count: 4,
            rows_per_page: 2,
            row_size: 16,
            key_size: 8,
            index_capacity: 8,
        }
    }

    #[test]
    fn test_missing_manifest_is_empty() {
        let dir = tempdir().unwrap();
        assert_eq!(Manifest::load(dir.path()).unwrap(), Manifest::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let mut manifest = Manifest::default();
        let version = manifest.allocate_version();
        manifest.tables.insert("cars".into(), meta(version));
        manifest.save(dir.path()).unwrap();

        let loaded = Manifest::load(dir.path()).unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.next_version, 2);
    }

    #[test]
    fn test_file_names_carry_version() {
        let dir = Path::new("/data");
        let meta = meta(3);
        assert_eq!(meta.index_path(dir, "cars"), Path::new("/data/cars.3.idx"));
        assert_eq!(meta.data_path(dir, "cars", 1), Path::new("/data/cars.3.1.dat"));
    }

    #[test]
    fn test_garbage_manifest_fails() {
        let dir = tempdir().unwrap();
        std::fs::write(Manifest::path(dir.path()), b"{not json").unwrap();
        assert!(matches!(Manifest::load(dir.path()), Err(BedrockError::Encoding(_))));
    }
}
