use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::analysis::ngram::NgramGenerator;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::DocId;
use crate::index::posting::{PostingList, PostingStrategy};

/// Magic prefix of the index snapshot stream.
const INDEX_MAGIC: &[u8; 4] = b"MGIX";
const INDEX_VERSION: u32 = 1;

/// Minimum posting size before the n-way bitmap merge join is considered.
const MERGE_JOIN_MIN_SIZE: u64 = 10_000;
/// Minimum selectivity (smallest/largest) for merge join and block probing.
const MERGE_JOIN_MIN_SELECTIVITY: f64 = 0.5;
/// Candidates probed per block in the batch-block search.
const BATCH_BLOCK_SIZE: usize = 1024;

/// N-gram inverted index for one table.
///
/// Single-writer / many-reader term map. Readers snapshot an `Arc` handle
/// under a shared map lock, release it, then work against the posting's own
/// lock, so map mutations never invalidate a held posting. Optimization
/// flips representations in place on the shared handles, which is why
/// concurrent additions during `optimize_in_batches` are never lost.
pub struct Index {
    postings: RwLock<HashMap<String, Arc<PostingList>>>,
    generator: NgramGenerator,
    roaring_threshold: f64,
    optimizing: AtomicBool,
}

impl Index {
    pub fn new(ngram_size: usize, kanji_ngram_size: usize, roaring_threshold: f64) -> Self {
        Index {
            postings: RwLock::new(HashMap::new()),
            generator: NgramGenerator::new(ngram_size, kanji_ngram_size),
            roaring_threshold,
            optimizing: AtomicBool::new(false),
        }
    }

    pub fn generator(&self) -> &NgramGenerator {
        &self.generator
    }

    fn get_posting(&self, term: &str) -> Option<Arc<PostingList>> {
        self.postings.read().get(term).cloned()
    }

    fn get_or_create_posting(&self, term: &str) -> Arc<PostingList> {
        if let Some(posting) = self.get_posting(term) {
            return posting;
        }
        let mut map = self.postings.write();
        map.entry(term.to_string())
            .or_insert_with(|| Arc::new(PostingList::new(self.roaring_threshold)))
            .clone()
    }

    pub fn add_document(&self, doc_id: DocId, text: &str) {
        for term in self.generator.generate(text) {
            self.get_or_create_posting(&term).add(doc_id);
        }
    }

    /// Batch insertion: accumulate per-term sorted DocId vectors and issue
    /// one `add_batch` per term.
    pub fn add_document_batch(&self, docs: &[(DocId, String)]) {
        let mut per_term: HashMap<String, Vec<DocId>> = HashMap::new();
        for (doc_id, text) in docs {
            for term in self.generator.generate(text) {
                per_term.entry(term).or_default().push(*doc_id);
            }
        }
        for (term, mut doc_ids) in per_term {
            doc_ids.sort_unstable();
            doc_ids.dedup();
            self.get_or_create_posting(&term).add_batch(&doc_ids);
        }
    }

    /// Merge a pre-sorted DocId batch into one term's posting. Bulk loaders
    /// that generate terms out-of-band use this instead of re-tokenizing.
    pub fn add_term_batch(&self, term: &str, sorted_doc_ids: &[DocId]) {
        self.get_or_create_posting(term).add_batch(sorted_doc_ids);
    }

    /// Re-index a document whose text changed. Terms shared between the old
    /// and new text are untouched; additions are applied before removals so
    /// there is no observable moment where the document is in neither set.
    pub fn update_document(&self, doc_id: DocId, old_text: &str, new_text: &str) {
        let old_terms = self.generator.generate(old_text);
        let new_terms = self.generator.generate(new_text);

        for term in new_terms.difference(&old_terms) {
            self.get_or_create_posting(term).add(doc_id);
        }
        for term in old_terms.difference(&new_terms) {
            if let Some(posting) = self.get_posting(term) {
                posting.remove(doc_id);
            }
        }
    }

    pub fn remove_document(&self, doc_id: DocId, text: &str) {
        for term in self.generator.generate(text) {
            if let Some(posting) = self.get_posting(&term) {
                posting.remove(doc_id);
            }
        }
    }

    /// Documents containing every term. `limit` of 0 means unbounded;
    /// `reverse` returns highest DocIds first.
    pub fn search_and(&self, terms: &[String], limit: usize, reverse: bool) -> Vec<DocId> {
        if terms.is_empty() {
            return Vec::new();
        }

        // Snapshot handles; any missing term short-circuits to empty.
        let mut lists: Vec<Arc<PostingList>> = Vec::with_capacity(terms.len());
        for term in terms {
            match self.get_posting(term) {
                Some(posting) => lists.push(posting),
                None => return Vec::new(),
            }
        }

        // Single term with a limit and reverse order: read straight off the
        // posting without materializing it.
        if lists.len() == 1 {
            return lists[0].get_top_n(if reverse { limit } else { 0 }, reverse);
        }

        lists.sort_by_key(|list| list.len());

        let min_size = lists[0].len();
        let max_size = lists[lists.len() - 1].len();
        if min_size == 0 {
            return Vec::new();
        }
        let selectivity = min_size as f64 / max_size as f64;

        let all_bitmap = lists
            .iter()
            .all(|l| l.strategy() == PostingStrategy::RoaringBitmap);

        if all_bitmap && min_size >= MERGE_JOIN_MIN_SIZE && selectivity >= MERGE_JOIN_MIN_SELECTIVITY {
            return self.merge_join(&lists, limit, reverse);
        }

        if limit > 0 && selectivity >= MERGE_JOIN_MIN_SELECTIVITY && min_size as usize > BATCH_BLOCK_SIZE {
            if let Some(hits) = self.batch_block_search(&lists, limit, reverse) {
                return hits;
            }
        }

        // General path: intersect the two smallest, fold the rest in order
        // of ascending size.
        let mut acc = lists[0].intersect(&lists[1]);
        for list in &lists[2..] {
            if acc.is_empty() {
                return Vec::new();
            }
            acc = acc.intersect(list);
        }

        let mut result = acc.get_all();
        if reverse {
            result.reverse();
        }
        if limit > 0 && result.len() > limit {
            result.truncate(limit);
        }
        result
    }

    /// Lockstep advance over all lists, emitting in sorted order and
    /// stopping at `limit`. Only entered when every list is a bitmap and
    /// the size/selectivity profile makes the cursor walk worthwhile.
    fn merge_join(&self, lists: &[Arc<PostingList>], limit: usize, reverse: bool) -> Vec<DocId> {
        let materialized: Vec<Vec<DocId>> = lists.iter().map(|l| l.get_all()).collect();
        let mut cursors = vec![0usize; materialized.len()];
        let mut out = Vec::new();

        'outer: loop {
            // Candidate from the first list
            let candidate = match materialized[0].get(cursors[0]) {
                Some(&d) => d,
                None => break,
            };
            let mut agreed = candidate;
            let mut advanced = false;
            for (list, cursor) in materialized.iter().zip(cursors.iter_mut()).skip(1) {
                while *cursor < list.len() && list[*cursor] < agreed {
                    *cursor += 1;
                }
                match list.get(*cursor) {
                    Some(&d) if d == agreed => {}
                    Some(&d) => {
                        agreed = d;
                        advanced = true;
                    }
                    None => break 'outer,
                }
            }
            if advanced {
                // Re-align the first cursor with the raised candidate.
                while cursors[0] < materialized[0].len() && materialized[0][cursors[0]] < agreed {
                    cursors[0] += 1;
                }
                continue;
            }
            out.push(agreed);
            for cursor in cursors.iter_mut() {
                *cursor += 1;
            }
            if !reverse && limit > 0 && out.len() >= limit {
                break;
            }
        }

        if reverse {
            out.reverse();
            if limit > 0 && out.len() > limit {
                out.truncate(limit);
            }
        }
        out
    }

    /// Scan the largest list in blocks, probing each candidate in the
    /// smaller list(s). Returns None when the first block yields no hits
    /// at all (low effective selectivity), signalling fallback to the
    /// exact intersection.
    fn batch_block_search(
        &self,
        lists: &[Arc<PostingList>],
        limit: usize,
        reverse: bool,
    ) -> Option<Vec<DocId>> {
        // Lists arrive sorted by ascending size: the last one drives
        let Some((driver_list, probes)) = lists.split_last() else {
            return None;
        };
        let driver = driver_list.get_all();
        let mut out = Vec::with_capacity(limit);
        let mut first_block = true;

        let mut scan = |block: &[DocId], out: &mut Vec<DocId>| {
            for &doc_id in block {
                if probes.iter().all(|p| p.contains(doc_id)) {
                    out.push(doc_id);
                    if out.len() >= limit {
                        return true;
                    }
                }
            }
            false
        };

        if reverse {
            for block in driver.rchunks(BATCH_BLOCK_SIZE) {
                let mut candidates: Vec<DocId> = block.to_vec();
                candidates.reverse();
                let done = scan(&candidates, &mut out);
                if first_block && out.is_empty() {
                    return None;
                }
                first_block = false;
                if done {
                    return Some(out);
                }
            }
        } else {
            for block in driver.chunks(BATCH_BLOCK_SIZE) {
                let done = scan(block, &mut out);
                if first_block && out.is_empty() {
                    return None;
                }
                first_block = false;
                if done {
                    return Some(out);
                }
            }
        }

        // Exhausted the driver list: the partial result is exact.
        Some(out)
    }

    /// Documents containing any of the terms.
    pub fn search_or(&self, terms: &[String]) -> Vec<DocId> {
        let mut acc: Option<PostingList> = None;
        for term in terms {
            if let Some(posting) = self.get_posting(term) {
                acc = Some(match acc {
                    Some(current) => current.union(&posting),
                    None => posting.union(&PostingList::new(self.roaring_threshold)),
                });
            }
        }
        acc.map(|a| a.get_all()).unwrap_or_default()
    }

    /// Documents in `universe` containing none of the terms.
    pub fn search_not(&self, universe: &[DocId], terms: &[String]) -> Vec<DocId> {
        let excluded = self.search_or(terms);
        if excluded.is_empty() {
            return universe.to_vec();
        }
        let excluded_set: std::collections::HashSet<DocId> = excluded.into_iter().collect();
        universe
            .iter()
            .filter(|d| !excluded_set.contains(d))
            .copied()
            .collect()
    }

    pub fn count(&self, term: &str) -> u64 {
        self.get_posting(term).map(|p| p.len()).unwrap_or(0)
    }

    pub fn term_count(&self) -> usize {
        self.postings.read().len()
    }

    pub fn memory_usage(&self) -> usize {
        let map = self.postings.read();
        map.iter()
            .map(|(term, posting)| term.len() + posting.memory_usage())
            .sum()
    }

    fn begin_optimize(&self) -> Result<()> {
        if self
            .optimizing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::new(ErrorKind::Busy, "optimization already in progress"));
        }
        Ok(())
    }

    /// Re-evaluate every posting's storage strategy.
    ///
    /// Handles are copied out of the map under a shared lock, then optimized
    /// one by one with the map lock released, so searches and writes proceed
    /// throughout. Returns Busy if an optimization is already running.
    pub fn optimize(&self, total_docs: u64) -> Result<()> {
        self.begin_optimize()?;
        let handles: Vec<Arc<PostingList>> = self.postings.read().values().cloned().collect();
        for posting in handles {
            posting.optimize(total_docs);
        }
        self.optimizing.store(false, Ordering::Release);
        Ok(())
    }

    /// Same outcome as `optimize`, yielding between batches so long runs
    /// interleave with concurrent mutations. Because optimization switches
    /// representation in place on the shared handles, DocIds added while a
    /// batch runs land in the same posting instance and are never lost.
    pub fn optimize_in_batches(&self, total_docs: u64, batch_size: usize) -> Result<()> {
        self.begin_optimize()?;
        let handles: Vec<Arc<PostingList>> = self.postings.read().values().cloned().collect();
        let batch_size = batch_size.max(1);
        for batch in handles.chunks(batch_size) {
            for posting in batch {
                posting.optimize(total_docs);
            }
            std::thread::yield_now();
        }
        self.optimizing.store(false, Ordering::Release);
        Ok(())
    }

    pub fn is_optimizing(&self) -> bool {
        self.optimizing.load(Ordering::Acquire)
    }

    /// Drop every term. Used by SYNC cleanup; the Index instance itself is
    /// preserved so long-lived borrowers stay valid.
    pub fn clear_in_place(&self) {
        self.postings.write().clear();
    }

    /// Snapshot stream: magic, version, term count, then per term the
    /// length-prefixed key and posting payload, and a crc32 of everything
    /// after the header.
    pub fn save_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let map = self.postings.read();
        writer.write_all(INDEX_MAGIC)?;
        writer.write_u32::<LittleEndian>(INDEX_VERSION)?;
        writer.write_u64::<LittleEndian>(map.len() as u64)?;

        let mut body = Vec::new();
        for (term, posting) in map.iter() {
            body.write_u32::<LittleEndian>(term.len() as u32)?;
            body.extend_from_slice(term.as_bytes());
            posting.serialize_into(&mut body)?;
        }
        let checksum = crc32fast::hash(&body);
        writer.write_all(&body)?;
        writer.write_u32::<LittleEndian>(checksum)?;
        Ok(())
    }

    pub fn load_from<R: Read>(&self, reader: &mut R) -> Result<()> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != INDEX_MAGIC {
            return Err(Error::new(ErrorKind::Codec, "bad index snapshot magic"));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != INDEX_VERSION {
            return Err(Error::new(
                ErrorKind::Codec,
                format!("unsupported index snapshot version: {}", version),
            ));
        }
        let term_count = reader.read_u64::<LittleEndian>()?;

        let mut body = Vec::new();
        reader.read_to_end(&mut body)?;
        if body.len() < 4 {
            return Err(Error::new(ErrorKind::Codec, "truncated index snapshot"));
        }
        let checksum_offset = body.len() - 4;
        let stored = u32::from_le_bytes(body[checksum_offset..].try_into().unwrap());
        let payload = &body[..checksum_offset];
        if crc32fast::hash(payload) != stored {
            return Err(Error::new(ErrorKind::Codec, "index snapshot checksum mismatch"));
        }

        let mut cursor = std::io::Cursor::new(payload);
        let mut map = HashMap::with_capacity(term_count as usize);
        for _ in 0..term_count {
            let term_len = cursor.read_u32::<LittleEndian>()? as usize;
            let mut term_bytes = vec![0u8; term_len];
            cursor.read_exact(&mut term_bytes)?;
            let term = String::from_utf8(term_bytes)
                .map_err(|_| Error::new(ErrorKind::Codec, "non-utf8 term in index snapshot"))?;
            let posting = PostingList::deserialize_from(&mut cursor, self.roaring_threshold)?;
            map.insert(term, Arc::new(posting));
        }

        // Swap contents, not the map instance holder
        let mut current = self.postings.write();
        current.clear();
        current.extend(map);
        Ok(())
    }
}
