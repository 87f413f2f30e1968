use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::RwLock;
use roaring::RoaringBitmap;
use std::io::{Read, Write};

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::DocId;

/// Default density threshold for switching to the bitmap strategy (18%).
pub const DEFAULT_ROARING_THRESHOLD: f64 = 0.18;

/// Below this many delta entries, Contains uses a linear scan; binary search
/// only pays off past the break-even point.
const BINARY_SEARCH_MIN_ENTRIES: usize = 16;

/// Storage strategies for a posting list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostingStrategy {
    DeltaCompressed,
    RoaringBitmap,
}

enum Repr {
    /// First DocId as-is, subsequent entries as gaps. Compact when sparse.
    Delta(Vec<u32>),
    /// Compressed bitmap. Fast for dense sets and bitmap-bitmap set ops.
    Bitmap(RoaringBitmap),
}

impl Repr {
    fn strategy(&self) -> PostingStrategy {
        match self {
            Repr::Delta(_) => PostingStrategy::DeltaCompressed,
            Repr::Bitmap(_) => PostingStrategy::RoaringBitmap,
        }
    }
}

/// Posting list for a single term: a sorted set of DocIds behind a
/// readers-writer lock, stored as a delta array or a roaring bitmap
/// depending on density.
///
/// Not Clone: copies go through `clone_optimized`, which produces a new
/// shared handle with the strategy already re-evaluated.
pub struct PostingList {
    inner: RwLock<Repr>,
    roaring_threshold: f64,
}

fn encode_delta(doc_ids: &[u32]) -> Vec<u32> {
    if doc_ids.is_empty() {
        return Vec::new();
    }
    let mut encoded = Vec::with_capacity(doc_ids.len());
    encoded.push(doc_ids[0]);
    for i in 1..doc_ids.len() {
        encoded.push(doc_ids[i] - doc_ids[i - 1]);
    }
    encoded
}

fn decode_delta(encoded: &[u32]) -> Vec<u32> {
    if encoded.is_empty() {
        return Vec::new();
    }
    let mut decoded = Vec::with_capacity(encoded.len());
    decoded.push(encoded[0]);
    for i in 1..encoded.len() {
        decoded.push(decoded[i - 1] + encoded[i]);
    }
    decoded
}

impl PostingList {
    pub fn new(roaring_threshold: f64) -> Self {
        PostingList {
            inner: RwLock::new(Repr::Delta(Vec::new())),
            roaring_threshold,
        }
    }

    pub fn with_default_threshold() -> Self {
        Self::new(DEFAULT_ROARING_THRESHOLD)
    }

    pub fn strategy(&self) -> PostingStrategy {
        self.inner.read().strategy()
    }

    /// Idempotent sorted insert.
    pub fn add(&self, doc_id: DocId) {
        let mut inner = self.inner.write();
        match &mut *inner {
            Repr::Delta(encoded) => {
                let mut docs = decode_delta(encoded);
                match docs.binary_search(&doc_id.0) {
                    Ok(_) => {}
                    Err(pos) => {
                        docs.insert(pos, doc_id.0);
                        *encoded = encode_delta(&docs);
                    }
                }
            }
            Repr::Bitmap(bitmap) => {
                bitmap.insert(doc_id.0);
            }
        }
    }

    /// Merge a pre-sorted batch of DocIds in O(n + m).
    pub fn add_batch(&self, sorted_doc_ids: &[DocId]) {
        if sorted_doc_ids.is_empty() {
            return;
        }
        debug_assert!(sorted_doc_ids.windows(2).all(|w| w[0] < w[1]));
        let mut inner = self.inner.write();
        match &mut *inner {
            Repr::Delta(encoded) => {
                let existing = decode_delta(encoded);
                let mut merged = Vec::with_capacity(existing.len() + sorted_doc_ids.len());
                let (mut i, mut j) = (0, 0);
                while i < existing.len() && j < sorted_doc_ids.len() {
                    let (a, b) = (existing[i], sorted_doc_ids[j].0);
                    if a < b {
                        merged.push(a);
                        i += 1;
                    } else if b < a {
                        merged.push(b);
                        j += 1;
                    } else {
                        merged.push(a);
                        i += 1;
                        j += 1;
                    }
                }
                merged.extend_from_slice(&existing[i..]);
                merged.extend(sorted_doc_ids[j..].iter().map(|d| d.0));
                *encoded = encode_delta(&merged);
            }
            Repr::Bitmap(bitmap) => {
                for doc_id in sorted_doc_ids {
                    bitmap.insert(doc_id.0);
                }
            }
        }
    }

    /// Idempotent delete.
    pub fn remove(&self, doc_id: DocId) {
        let mut inner = self.inner.write();
        match &mut *inner {
            Repr::Delta(encoded) => {
                let mut docs = decode_delta(encoded);
                if let Ok(pos) = docs.binary_search(&doc_id.0) {
                    docs.remove(pos);
                    *encoded = encode_delta(&docs);
                }
            }
            Repr::Bitmap(bitmap) => {
                bitmap.remove(doc_id.0);
            }
        }
    }

    pub fn contains(&self, doc_id: DocId) -> bool {
        let inner = self.inner.read();
        match &*inner {
            Repr::Delta(encoded) => {
                let docs = decode_delta(encoded);
                if docs.len() > BINARY_SEARCH_MIN_ENTRIES {
                    docs.binary_search(&doc_id.0).is_ok()
                } else {
                    docs.contains(&doc_id.0)
                }
            }
            Repr::Bitmap(bitmap) => bitmap.contains(doc_id.0),
        }
    }

    pub fn len(&self) -> u64 {
        let inner = self.inner.read();
        match &*inner {
            Repr::Delta(encoded) => encoded.len() as u64,
            Repr::Bitmap(bitmap) => bitmap.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_usage(&self) -> usize {
        let inner = self.inner.read();
        match &*inner {
            Repr::Delta(encoded) => encoded.len() * std::mem::size_of::<u32>(),
            Repr::Bitmap(bitmap) => bitmap.serialized_size(),
        }
    }

    /// All DocIds in ascending order.
    pub fn get_all(&self) -> Vec<DocId> {
        let inner = self.inner.read();
        match &*inner {
            Repr::Delta(encoded) => decode_delta(encoded).into_iter().map(DocId).collect(),
            Repr::Bitmap(bitmap) => bitmap.iter().map(DocId).collect(),
        }
    }

    /// Up to `limit` DocIds (0 = all), highest first when `reverse`.
    ///
    /// The bitmap path walks a reverse iterator without materializing the
    /// full list, which is what makes "ORDER BY pk DESC LIMIT n" cheap on
    /// a single hot term.
    pub fn get_top_n(&self, limit: usize, reverse: bool) -> Vec<DocId> {
        let inner = self.inner.read();
        match &*inner {
            Repr::Delta(encoded) => {
                let docs = decode_delta(encoded);
                let take = if limit == 0 { docs.len() } else { limit.min(docs.len()) };
                if reverse {
                    docs.iter().rev().take(take).map(|&d| DocId(d)).collect()
                } else {
                    docs.iter().take(take).map(|&d| DocId(d)).collect()
                }
            }
            Repr::Bitmap(bitmap) => {
                let take = if limit == 0 { bitmap.len() as usize } else { limit };
                if reverse {
                    bitmap.iter().rev().take(take).map(DocId).collect()
                } else {
                    bitmap.iter().take(take).map(DocId).collect()
                }
            }
        }
    }

    /// Intersection. Bitmap AND when both inputs are bitmaps; sorted-array
    /// set intersection otherwise (result stays delta-compressed).
    pub fn intersect(&self, other: &PostingList) -> PostingList {
        let lhs = self.inner.read();
        let rhs = other.inner.read();
        let repr = match (&*lhs, &*rhs) {
            (Repr::Bitmap(a), Repr::Bitmap(b)) => Repr::Bitmap(a & b),
            _ => {
                let a = match &*lhs {
                    Repr::Delta(e) => decode_delta(e),
                    Repr::Bitmap(b) => b.iter().collect(),
                };
                let b = match &*rhs {
                    Repr::Delta(e) => decode_delta(e),
                    Repr::Bitmap(b) => b.iter().collect(),
                };
                Repr::Delta(encode_delta(&sorted_intersection(&a, &b)))
            }
        };
        PostingList {
            inner: RwLock::new(repr),
            roaring_threshold: self.roaring_threshold,
        }
    }

    /// Union. Bitmap OR when both inputs are bitmaps; sorted-array union
    /// (delta result) otherwise.
    pub fn union(&self, other: &PostingList) -> PostingList {
        let lhs = self.inner.read();
        let rhs = other.inner.read();
        let repr = match (&*lhs, &*rhs) {
            (Repr::Bitmap(a), Repr::Bitmap(b)) => Repr::Bitmap(a | b),
            _ => {
                let a = match &*lhs {
                    Repr::Delta(e) => decode_delta(e),
                    Repr::Bitmap(b) => b.iter().collect(),
                };
                let b = match &*rhs {
                    Repr::Delta(e) => decode_delta(e),
                    Repr::Bitmap(b) => b.iter().collect(),
                };
                Repr::Delta(encode_delta(&sorted_union(&a, &b)))
            }
        };
        PostingList {
            inner: RwLock::new(repr),
            roaring_threshold: self.roaring_threshold,
        }
    }

    /// Re-evaluate the storage strategy against the current density.
    ///
    /// Hysteresis: convert to bitmap at density >= threshold, convert back
    /// to delta only below threshold * 0.5, so lists hovering around the
    /// boundary don't thrash. Contents are never changed.
    pub fn optimize(&self, total_docs: u64) {
        if total_docs == 0 {
            return;
        }
        let mut inner = self.inner.write();
        let size = match &*inner {
            Repr::Delta(encoded) => encoded.len() as u64,
            Repr::Bitmap(bitmap) => bitmap.len(),
        };
        let density = size as f64 / total_docs as f64;

        match &*inner {
            Repr::Delta(encoded) if density >= self.roaring_threshold => {
                let mut bitmap = RoaringBitmap::new();
                for doc in decode_delta(encoded) {
                    bitmap.insert(doc);
                }
                tracing::debug!(density, "posting list converted to bitmap");
                *inner = Repr::Bitmap(bitmap);
            }
            Repr::Bitmap(bitmap) if density < self.roaring_threshold * 0.5 => {
                let docs: Vec<u32> = bitmap.iter().collect();
                tracing::debug!(density, "posting list converted to delta");
                *inner = Repr::Delta(encode_delta(&docs));
            }
            _ => {}
        }
    }

    /// New shared handle with identical contents and the strategy already
    /// chosen for the given corpus size.
    pub fn clone_optimized(&self, total_docs: u64) -> std::sync::Arc<PostingList> {
        let copy = PostingList {
            inner: RwLock::new(match &*self.inner.read() {
                Repr::Delta(encoded) => Repr::Delta(encoded.clone()),
                Repr::Bitmap(bitmap) => Repr::Bitmap(bitmap.clone()),
            }),
            roaring_threshold: self.roaring_threshold,
        };
        copy.optimize(total_docs);
        std::sync::Arc::new(copy)
    }

    /// Serialize as: u8 strategy tag, then the payload.
    /// Delta: u32 count + count u32 gaps. Bitmap: u32 byte length + roaring
    /// portable serialization.
    pub fn serialize_into<W: Write>(&self, writer: &mut W) -> Result<()> {
        let inner = self.inner.read();
        match &*inner {
            Repr::Delta(encoded) => {
                writer.write_u8(0)?;
                writer.write_u32::<LittleEndian>(encoded.len() as u32)?;
                for gap in encoded {
                    writer.write_u32::<LittleEndian>(*gap)?;
                }
            }
            Repr::Bitmap(bitmap) => {
                writer.write_u8(1)?;
                let mut bytes = Vec::with_capacity(bitmap.serialized_size());
                bitmap
                    .serialize_into(&mut bytes)
                    .map_err(|e| Error::new(ErrorKind::Codec, e.to_string()))?;
                writer.write_u32::<LittleEndian>(bytes.len() as u32)?;
                writer.write_all(&bytes)?;
            }
        }
        Ok(())
    }

    pub fn deserialize_from<R: Read>(reader: &mut R, roaring_threshold: f64) -> Result<PostingList> {
        let tag = reader.read_u8()?;
        let repr = match tag {
            0 => {
                let count = reader.read_u32::<LittleEndian>()? as usize;
                let mut encoded = Vec::with_capacity(count);
                for _ in 0..count {
                    encoded.push(reader.read_u32::<LittleEndian>()?);
                }
                Repr::Delta(encoded)
            }
            1 => {
                let len = reader.read_u32::<LittleEndian>()? as usize;
                let mut bytes = vec![0u8; len];
                reader.read_exact(&mut bytes)?;
                let bitmap = RoaringBitmap::deserialize_from(&bytes[..])
                    .map_err(|e| Error::new(ErrorKind::Codec, e.to_string()))?;
                Repr::Bitmap(bitmap)
            }
            other => {
                return Err(Error::new(
                    ErrorKind::Codec,
                    format!("unknown posting strategy tag: {}", other),
                ));
            }
        };
        Ok(PostingList {
            inner: RwLock::new(repr),
            roaring_threshold,
        })
    }
}

fn sorted_intersection(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] < b[j] {
            i += 1;
        } else if b[j] < a[i] {
            j += 1;
        } else {
            out.push(a[i]);
            i += 1;
            j += 1;
        }
    }
    out
}

fn sorted_union(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] < b[j] {
            out.push(a[i]);
            i += 1;
        } else if b[j] < a[i] {
            out.push(b[j]);
            j += 1;
        } else {
            out.push(a[i]);
            i += 1;
            j += 1;
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}
