use roaring::RoaringTreemap;
use crate::core::error::{Error, ErrorKind, Result};

/// Compressed set of event ids
pub type Ids = RoaringTreemap;

pub fn to_bytes(ids: &Ids) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(ids.serialized_size());
    ids.serialize_into(&mut buf)?;
    Ok(buf)
}

pub fn from_bytes(bytes: &[u8]) -> Result<Ids> {
    Ids::deserialize_from(bytes)
        .map_err(|e| Error::new(ErrorKind::Corrupt, format!("bitmap: {}", e)))
}

/// Unions a sequence of id sets
pub fn union_all<'a, I: IntoIterator<Item = &'a Ids>>(sets: I) -> Ids {
    let mut result = Ids::new();
    for set in sets {
        result |= set;
    }
    result
}
