use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Per-table document identifier.
///
/// Zero is never assigned; the store hands out 1..=u32::MAX and reports
/// exhaustion past that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocId(pub u32);

impl DocId {
    pub fn new(id: u32) -> Self {
        DocId(id)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl From<u32> for DocId {
    fn from(id: u32) -> Self {
        DocId(id)
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tagged attribute value mirrored from a source column.
///
/// Null only occurs transiently (missing column during sorting); it is never
/// persisted in dumps — absence of the attribute represents it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    Str(String),
    F64(f64),
}

impl AttributeValue {
    /// Wire tag used by the dump codec. Null has no tag (never written).
    pub fn tag(&self) -> Option<u8> {
        match self {
            AttributeValue::Null => None,
            AttributeValue::Bool(_) => Some(0),
            AttributeValue::I8(_) => Some(1),
            AttributeValue::U8(_) => Some(2),
            AttributeValue::I16(_) => Some(3),
            AttributeValue::U16(_) => Some(4),
            AttributeValue::I32(_) => Some(5),
            AttributeValue::U32(_) => Some(6),
            AttributeValue::I64(_) => Some(7),
            AttributeValue::Str(_) => Some(8),
            AttributeValue::F64(_) => Some(9),
        }
    }

    /// Approximate heap footprint for memory accounting.
    pub fn memory_usage(&self) -> usize {
        match self {
            AttributeValue::Str(s) => std::mem::size_of::<Self>() + s.len(),
            _ => std::mem::size_of::<Self>(),
        }
    }

    /// Render for protocol responses (GET, JSON bodies).
    pub fn display_string(&self) -> String {
        match self {
            AttributeValue::Null => "NULL".to_string(),
            AttributeValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            AttributeValue::I8(v) => v.to_string(),
            AttributeValue::U8(v) => v.to_string(),
            AttributeValue::I16(v) => v.to_string(),
            AttributeValue::U16(v) => v.to_string(),
            AttributeValue::I32(v) => v.to_string(),
            AttributeValue::U32(v) => v.to_string(),
            AttributeValue::I64(v) => v.to_string(),
            AttributeValue::Str(s) => s.clone(),
            AttributeValue::F64(v) => v.to_string(),
        }
    }
}

/// Attribute map keyed by column name.
pub type Attributes = HashMap<String, AttributeValue>;

/// A mirrored row: DocId, source primary key, and filter attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub doc_id: DocId,
    pub primary_key: String,
    pub attrs: Attributes,
}

impl Document {
    pub fn new(doc_id: DocId, primary_key: impl Into<String>) -> Self {
        Document {
            doc_id,
            primary_key: primary_key.into(),
            attrs: HashMap::new(),
        }
    }

    pub fn get_attr(&self, name: &str) -> Option<&AttributeValue> {
        self.attrs.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_assignment_matches_dump_layout() {
        assert_eq!(AttributeValue::Bool(true).tag(), Some(0));
        assert_eq!(AttributeValue::I8(-1).tag(), Some(1));
        assert_eq!(AttributeValue::U8(1).tag(), Some(2));
        assert_eq!(AttributeValue::I16(-1).tag(), Some(3));
        assert_eq!(AttributeValue::U16(1).tag(), Some(4));
        assert_eq!(AttributeValue::I32(-1).tag(), Some(5));
        assert_eq!(AttributeValue::U32(1).tag(), Some(6));
        assert_eq!(AttributeValue::I64(-1).tag(), Some(7));
        assert_eq!(AttributeValue::Str("x".into()).tag(), Some(8));
        assert_eq!(AttributeValue::F64(1.0).tag(), Some(9));
        assert_eq!(AttributeValue::Null.tag(), None);
    }

    #[test]
    fn test_doc_id_ordering() {
        assert!(DocId(1) < DocId(2));
        assert_eq!(DocId::new(7).value(), 7);
    }
}
