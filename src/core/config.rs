use std::fs;
use std::path::{Path, PathBuf};
use serde::{Serialize, Deserialize};
use crate::core::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage_path: PathBuf,

    // Partitioning
    pub max_partition_size: u64,               // Events per partition before rotation
    pub in_mem_partitions: usize,              // Resident sealed partitions (active excluded)

    // Query scheduling
    pub taste_partitions: usize,               // Partitions dispatched on query arrival
    pub num_workers: usize,                    // Evaluation worker threads
    pub strict_queries: bool,                  // Default for QueryOptions::strict
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage_path: PathBuf::from("./index"),
            max_partition_size: 1 << 20,
            in_mem_partitions: 10,
            taste_partitions: 5,
            num_workers: num_cpus::get(),
            strict_queries: false,
        }
    }
}

impl Config {
    pub fn with_storage_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.storage_path = path.into();
        self
    }

    /// Loads a JSON config file. Missing keys fall back to the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let config: Config = serde_json::from_slice(&data)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_partition_size == 0 {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "max_partition_size must be greater than zero".to_string(),
            ));
        }
        if self.in_mem_partitions == 0 {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "in_mem_partitions must be greater than zero".to_string(),
            ));
        }
        if self.num_workers == 0 {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "num_workers must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
