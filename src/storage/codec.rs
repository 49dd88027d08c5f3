use std::fs;
use std::path::Path;
use serde::{Serialize, Deserialize};
use serde::de::DeserializeOwned;
use crate::core::error::{Error, ErrorKind, Result};

/// On-disk envelope shared by every persisted structure
#[derive(Serialize, Deserialize)]
struct FileBlock {
    version: u32,
    checksum: u32,        // CRC32 of version, original_size and data
    original_size: usize,
    data: Vec<u8>,        // LZ4-compressed bincode payload
}

impl FileBlock {
    const VERSION: u32 = 1;

    // LZ4 cannot expand a block by more than this factor.
    const MAX_EXPANSION: usize = 255;

    fn seal(payload: &[u8]) -> Self {
        let data = lz4_flex::compress(payload);
        FileBlock {
            version: Self::VERSION,
            checksum: Self::digest(Self::VERSION, payload.len(), &data),
            original_size: payload.len(),
            data,
        }
    }

    fn digest(version: u32, original_size: usize, data: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&version.to_le_bytes());
        hasher.update(&(original_size as u64).to_le_bytes());
        hasher.update(data);
        hasher.finalize()
    }

    fn open(&self) -> Result<Vec<u8>> {
        if self.version != Self::VERSION {
            return Err(Error::new(
                ErrorKind::Corrupt,
                format!("unsupported format version {}", self.version),
            ));
        }
        if Self::digest(self.version, self.original_size, &self.data) != self.checksum {
            return Err(Error::new(ErrorKind::Corrupt, "checksum mismatch".to_string()));
        }
        // Decompression allocates original_size up front.
        if self.original_size > self.data.len().saturating_mul(Self::MAX_EXPANSION) {
            return Err(Error::new(
                ErrorKind::Corrupt,
                format!("declared size {} exceeds what {} compressed bytes can hold", self.original_size, self.data.len()),
            ));
        }
        lz4_flex::decompress(&self.data, self.original_size)
            .map_err(|e| Error::new(ErrorKind::Corrupt, e.to_string()))
    }
}

/// Serializes `value` to `path`. The file is written next to its target and
/// renamed into place, so readers never observe a partial write.
pub fn write_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let payload = bincode::serialize(value)?;
    let block = bincode::serialize(&FileBlock::seal(&payload))?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, block)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|e| {
        let err = Error::from(e);
        Error::new(err.kind, format!("{}: {}", path.display(), err.context))
    })?;
    let corrupt = |e: bincode::Error| {
        Error::new(ErrorKind::Corrupt, format!("{}: {}", path.display(), e))
    };
    let block: FileBlock = bincode::deserialize(&bytes).map_err(corrupt)?;
    let payload = block
        .open()
        .map_err(|e| Error::new(e.kind, format!("{}: {}", path.display(), e.context)))?;
    bincode::deserialize(&payload).map_err(corrupt)
}
