use std::collections::HashSet;
use std::fmt;
use serde::{Serialize, Deserialize};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::ValueType;

/// Leaf field of a record layout. Nested records are flattened into dotted
/// names such as `id.orig_h`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub field_type: ValueType,
}

/// Record layout shared by every row of a table slice
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordLayout {
    pub name: String,
    pub fields: Vec<FieldDefinition>,
}

/// Stable digest of a layout; names the layout's directory inside a partition
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LayoutDigest(String);

impl LayoutDigest {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LayoutDigest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl RecordLayout {
    pub fn new(name: &str) -> Self {
        RecordLayout {
            name: name.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: &str, field_type: ValueType) -> Self {
        self.fields.push(FieldDefinition {
            name: name.to_string(),
            field_type,
        });
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::new(ErrorKind::InvalidInput, "layout name is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.is_empty() || !seen.insert(field.name.as_str()) {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("layout {} has an empty or duplicate field {:?}", self.name, field.name),
                ));
            }
        }
        Ok(())
    }

    /// Digest over the layout name and field names. Field types are not part
    /// of it, so a layout that changes a field type under the same structure
    /// collides with the registered one and surfaces as a schema conflict.
    pub fn digest(&self) -> LayoutDigest {
        let mut forward = crc32fast::Hasher::new();
        let mut seeded = crc32fast::Hasher::new_with_initial(0x9e37_79b9);
        for part in std::iter::once(&self.name).chain(self.fields.iter().map(|f| &f.name)) {
            forward.update(part.as_bytes());
            forward.update(&[0]);
            seeded.update(&[0xff]);
            seeded.update(part.as_bytes());
        }
        LayoutDigest(format!("{:08x}{:08x}", forward.finalize(), seeded.finalize()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, index: usize) -> Option<&FieldDefinition> {
        self.fields.get(index)
    }

    /// Indices of the fields a key refers to: exact name, dotted suffix, or
    /// `layout.field` qualification.
    pub fn resolve(&self, key: &str) -> Vec<usize> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| self.key_matches(key, &f.name))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn fields_of_type(&self, field_type: ValueType) -> Vec<usize> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.field_type == field_type)
            .map(|(i, _)| i)
            .collect()
    }

    fn key_matches(&self, key: &str, field: &str) -> bool {
        if key == field {
            return true;
        }
        if let Some(prefix) = field.strip_suffix(key) {
            if prefix.ends_with('.') {
                return true;
            }
        }
        key.strip_prefix(self.name.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .is_some_and(|rest| rest == field)
    }
}
