use std::path::PathBuf;
use std::fs;
use crate::core::error::Result;

/// Directory structure for index files
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub base_dir: PathBuf,      // Root directory, one subdirectory per partition
}

impl StorageLayout {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir)?;
        Ok(StorageLayout { base_dir })
    }

    pub fn meta_index_path(&self) -> PathBuf {
        self.base_dir.join("meta-index")
    }
}
