use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::{Read, Write};

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{AttributeValue, Attributes, DocId, Document};

const STORE_MAGIC: &[u8; 4] = b"MGDS";
const STORE_VERSION: u32 = 1;

struct StoreInner {
    next_doc_id: u32,
    exhausted: bool,
    doc_to_pk: HashMap<DocId, String>,
    pk_to_doc: HashMap<String, DocId>,
    attrs: HashMap<DocId, Attributes>,
}

impl StoreInner {
    fn empty() -> Self {
        StoreInner {
            next_doc_id: 1,
            exhausted: false,
            doc_to_pk: HashMap::new(),
            pk_to_doc: HashMap::new(),
            attrs: HashMap::new(),
        }
    }

    fn allocate(&mut self) -> Result<DocId> {
        if self.exhausted {
            return Err(Error::new(
                ErrorKind::DocIdExhausted,
                "DocID space exhausted: 4294967295 documents reached, no further inserts possible",
            ));
        }
        let id = DocId(self.next_doc_id);
        if self.next_doc_id == u32::MAX {
            self.exhausted = true;
        } else {
            self.next_doc_id += 1;
        }
        Ok(id)
    }
}

/// Per-table document store: the DocId <-> primary-key bijection plus the
/// per-document attribute map, all behind one readers-writer lock.
pub struct DocumentStore {
    inner: RwLock<StoreInner>,
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore {
    pub fn new() -> Self {
        DocumentStore {
            inner: RwLock::new(StoreInner::empty()),
        }
    }

    /// Assign a DocId to a primary key. Idempotent: a repeated primary key
    /// returns the original DocId, leaves attributes untouched, and does not
    /// consume a new id (so it cannot trip overflow detection).
    pub fn add_document(&self, primary_key: &str, attrs: Attributes) -> Result<DocId> {
        let mut inner = self.inner.write();
        if let Some(&existing) = inner.pk_to_doc.get(primary_key) {
            tracing::warn!(pk = primary_key, doc_id = existing.0, "primary key already exists");
            return Ok(existing);
        }
        let doc_id = inner.allocate()?;
        inner.doc_to_pk.insert(doc_id, primary_key.to_string());
        inner.pk_to_doc.insert(primary_key.to_string(), doc_id);
        if !attrs.is_empty() {
            inner.attrs.insert(doc_id, attrs);
        }
        tracing::debug!(doc_id = doc_id.0, pk = primary_key, "document added");
        Ok(doc_id)
    }

    /// Batch insert with per-element idempotence. Stops at the first
    /// overflow and surfaces it; earlier assignments remain.
    pub fn add_document_batch(&self, items: &[(String, Attributes)]) -> Result<Vec<DocId>> {
        let mut inner = self.inner.write();
        let mut assigned = Vec::with_capacity(items.len());
        for (primary_key, attrs) in items {
            if let Some(&existing) = inner.pk_to_doc.get(primary_key) {
                assigned.push(existing);
                continue;
            }
            let doc_id = inner.allocate()?;
            inner.doc_to_pk.insert(doc_id, primary_key.clone());
            inner.pk_to_doc.insert(primary_key.clone(), doc_id);
            if !attrs.is_empty() {
                inner.attrs.insert(doc_id, attrs.clone());
            }
            assigned.push(doc_id);
        }
        Ok(assigned)
    }

    /// Replace a document's attributes wholesale.
    pub fn update_document(&self, doc_id: DocId, attrs: Attributes) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.doc_to_pk.contains_key(&doc_id) {
            return Err(Error::new(
                ErrorKind::DocumentNotFound,
                format!("document {} does not exist", doc_id),
            ));
        }
        inner.attrs.insert(doc_id, attrs);
        Ok(())
    }

    /// Remove a document and its reverse mapping. Returns false when the
    /// DocId was unknown. The primary key is copied to an owned string
    /// before the forward entry is erased; the reverse-map key aliases the
    /// forward value and must not be read after that erase.
    pub fn remove_document(&self, doc_id: DocId) -> bool {
        let mut inner = self.inner.write();
        let primary_key = match inner.doc_to_pk.get(&doc_id) {
            Some(pk) => pk.clone(),
            None => return false,
        };
        inner.doc_to_pk.remove(&doc_id);
        inner.pk_to_doc.remove(&primary_key);
        inner.attrs.remove(&doc_id);
        tracing::debug!(doc_id = doc_id.0, pk = %primary_key, "document removed");
        true
    }

    pub fn get_document(&self, doc_id: DocId) -> Option<Document> {
        let inner = self.inner.read();
        let primary_key = inner.doc_to_pk.get(&doc_id)?.clone();
        Some(Document {
            doc_id,
            primary_key,
            attrs: inner.attrs.get(&doc_id).cloned().unwrap_or_default(),
        })
    }

    pub fn get_doc_id(&self, primary_key: &str) -> Option<DocId> {
        self.inner.read().pk_to_doc.get(primary_key).copied()
    }

    pub fn get_primary_key(&self, doc_id: DocId) -> Option<String> {
        self.inner.read().doc_to_pk.get(&doc_id).cloned()
    }

    pub fn get_filter_value(&self, doc_id: DocId, name: &str) -> Option<AttributeValue> {
        self.inner.read().attrs.get(&doc_id)?.get(name).cloned()
    }

    /// All DocIds whose attribute equals the value, sorted for stable
    /// responses.
    pub fn filter_by_value(&self, name: &str, value: &AttributeValue) -> Vec<DocId> {
        let inner = self.inner.read();
        let mut results: Vec<DocId> = inner
            .attrs
            .iter()
            .filter(|(_, attrs)| attrs.get(name) == Some(value))
            .map(|(&doc_id, _)| doc_id)
            .collect();
        results.sort_unstable();
        results
    }

    pub fn len(&self) -> usize {
        self.inner.read().doc_to_pk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn next_doc_id(&self) -> u32 {
        self.inner.read().next_doc_id
    }

    pub fn memory_usage(&self) -> usize {
        let inner = self.inner.read();
        let mut total = 0;
        for (_, pk) in inner.doc_to_pk.iter() {
            total += std::mem::size_of::<DocId>() + pk.len();
        }
        for (pk, _) in inner.pk_to_doc.iter() {
            total += pk.len() + std::mem::size_of::<DocId>();
        }
        for (_, attrs) in inner.attrs.iter() {
            total += std::mem::size_of::<DocId>();
            for (name, value) in attrs {
                total += name.len() + value.memory_usage();
            }
        }
        total
    }

    /// Empty the store without replacing the instance. Long-lived borrowers
    /// (the apply engine's TableContext handle) must stay valid across SYNC
    /// and LOAD, so there is deliberately no "replace" operation.
    pub fn clear_in_place(&self) {
        let mut inner = self.inner.write();
        *inner = StoreInner::empty();
        tracing::info!("document store cleared");
    }

    /// Write the dump stream: magic, version, next_doc_id, replication
    /// cursor, document count, then per document the id, primary key and
    /// tagged attributes. Little-endian throughout.
    pub fn save_to<W: Write>(&self, writer: &mut W, replication_cursor: &str) -> Result<()> {
        let inner = self.inner.read();

        writer.write_all(STORE_MAGIC)?;
        writer.write_u32::<LittleEndian>(STORE_VERSION)?;
        writer.write_u32::<LittleEndian>(inner.next_doc_id)?;
        writer.write_u32::<LittleEndian>(replication_cursor.len() as u32)?;
        writer.write_all(replication_cursor.as_bytes())?;
        writer.write_u64::<LittleEndian>(inner.doc_to_pk.len() as u64)?;

        for (doc_id, primary_key) in inner.doc_to_pk.iter() {
            writer.write_u32::<LittleEndian>(doc_id.0)?;
            writer.write_u32::<LittleEndian>(primary_key.len() as u32)?;
            writer.write_all(primary_key.as_bytes())?;

            // Null attributes are represented by absence
            let empty = Attributes::new();
            let attrs = inner.attrs.get(doc_id).unwrap_or(&empty);
            let tagged: Vec<(&String, &AttributeValue, u8)> = attrs
                .iter()
                .filter_map(|(name, value)| value.tag().map(|t| (name, value, t)))
                .collect();

            writer.write_u32::<LittleEndian>(tagged.len() as u32)?;
            for (name, value, tag) in tagged {
                writer.write_u32::<LittleEndian>(name.len() as u32)?;
                writer.write_all(name.as_bytes())?;
                writer.write_u8(tag)?;
                match value {
                    AttributeValue::Bool(v) => writer.write_u8(*v as u8)?,
                    AttributeValue::I8(v) => writer.write_i8(*v)?,
                    AttributeValue::U8(v) => writer.write_u8(*v)?,
                    AttributeValue::I16(v) => writer.write_i16::<LittleEndian>(*v)?,
                    AttributeValue::U16(v) => writer.write_u16::<LittleEndian>(*v)?,
                    AttributeValue::I32(v) => writer.write_i32::<LittleEndian>(*v)?,
                    AttributeValue::U32(v) => writer.write_u32::<LittleEndian>(*v)?,
                    AttributeValue::I64(v) => writer.write_i64::<LittleEndian>(*v)?,
                    AttributeValue::Str(v) => {
                        writer.write_u32::<LittleEndian>(v.len() as u32)?;
                        writer.write_all(v.as_bytes())?;
                    }
                    AttributeValue::F64(v) => writer.write_f64::<LittleEndian>(*v)?,
                    AttributeValue::Null => unreachable!("null attributes are never persisted"),
                }
            }
        }

        tracing::info!(docs = inner.doc_to_pk.len(), "document store saved");
        Ok(())
    }

    /// Restore from a dump stream into this instance (cleared in place
    /// first). Returns the embedded replication cursor.
    pub fn load_from<R: Read>(&self, reader: &mut R) -> Result<String> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(Error::new(ErrorKind::Codec, "bad document store magic"));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != STORE_VERSION {
            return Err(Error::new(
                ErrorKind::Codec,
                format!("unsupported document store version: {}", version),
            ));
        }

        let next_doc_id = reader.read_u32::<LittleEndian>()?;
        let cursor_len = reader.read_u32::<LittleEndian>()? as usize;
        let mut cursor_bytes = vec![0u8; cursor_len];
        reader.read_exact(&mut cursor_bytes)?;
        let replication_cursor = String::from_utf8(cursor_bytes)
            .map_err(|_| Error::new(ErrorKind::Codec, "non-utf8 replication cursor"))?;

        let doc_count = reader.read_u64::<LittleEndian>()?;

        let mut fresh = StoreInner::empty();
        fresh.next_doc_id = next_doc_id;

        for _ in 0..doc_count {
            let doc_id = DocId(reader.read_u32::<LittleEndian>()?);
            let pk_len = reader.read_u32::<LittleEndian>()? as usize;
            let mut pk_bytes = vec![0u8; pk_len];
            reader.read_exact(&mut pk_bytes)?;
            let primary_key = String::from_utf8(pk_bytes)
                .map_err(|_| Error::new(ErrorKind::Codec, "non-utf8 primary key"))?;

            let attr_count = reader.read_u32::<LittleEndian>()?;
            let mut attrs = Attributes::new();
            for _ in 0..attr_count {
                let name_len = reader.read_u32::<LittleEndian>()? as usize;
                let mut name_bytes = vec![0u8; name_len];
                reader.read_exact(&mut name_bytes)?;
                let name = String::from_utf8(name_bytes)
                    .map_err(|_| Error::new(ErrorKind::Codec, "non-utf8 attribute name"))?;

                let tag = reader.read_u8()?;
                let value = match tag {
                    0 => AttributeValue::Bool(reader.read_u8()? != 0),
                    1 => AttributeValue::I8(reader.read_i8()?),
                    2 => AttributeValue::U8(reader.read_u8()?),
                    3 => AttributeValue::I16(reader.read_i16::<LittleEndian>()?),
                    4 => AttributeValue::U16(reader.read_u16::<LittleEndian>()?),
                    5 => AttributeValue::I32(reader.read_i32::<LittleEndian>()?),
                    6 => AttributeValue::U32(reader.read_u32::<LittleEndian>()?),
                    7 => AttributeValue::I64(reader.read_i64::<LittleEndian>()?),
                    8 => {
                        let len = reader.read_u32::<LittleEndian>()? as usize;
                        let mut bytes = vec![0u8; len];
                        reader.read_exact(&mut bytes)?;
                        AttributeValue::Str(String::from_utf8(bytes).map_err(|_| {
                            Error::new(ErrorKind::Codec, "non-utf8 string attribute")
                        })?)
                    }
                    9 => AttributeValue::F64(reader.read_f64::<LittleEndian>()?),
                    other => {
                        return Err(Error::new(
                            ErrorKind::Codec,
                            format!("unknown attribute tag: {}", other),
                        ));
                    }
                };
                attrs.insert(name, value);
            }

            fresh.doc_to_pk.insert(doc_id, primary_key.clone());
            fresh.pk_to_doc.insert(primary_key, doc_id);
            if !attrs.is_empty() {
                fresh.attrs.insert(doc_id, attrs);
            }
        }

        let mut inner = self.inner.write();
        *inner = fresh;
        tracing::info!(docs = inner.doc_to_pk.len(), "document store loaded");
        Ok(replication_cursor)
    }
}
