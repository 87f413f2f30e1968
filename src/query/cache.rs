use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::DocId;

/// Invalidation bookkeeping for one cached entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheMetadata {
    pub table: String,
    pub ngrams: HashSet<String>,
}

/// A cached query result: the paginated DocIds and the pre-pagination total.
struct CacheEntry {
    payload: Payload,
    total: usize,
    metadata: CacheMetadata,
    cost_ms: f64,
    size_bytes: usize,
    inserted_at: Instant,
}

enum Payload {
    Plain(Vec<DocId>),
    Compressed(Vec<u8>),
}

impl Payload {
    fn docs(&self) -> Vec<DocId> {
        match self {
            Payload::Plain(docs) => docs.clone(),
            Payload::Compressed(bytes) => {
                let raw = lz4_flex::decompress_size_prepended(bytes).unwrap_or_default();
                raw.chunks_exact(4)
                    .map(|c| DocId(u32::from_le_bytes(c.try_into().unwrap())))
                    .collect()
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub invalidation_batches: u64,
    pub entries: usize,
    pub bytes: usize,
    pub capacity_bytes: usize,
}

struct CacheState {
    entries: LruCache<String, CacheEntry>,
    current_bytes: usize,
}

/// Bytes-bounded LRU cache of query results.
///
/// Storage is allocated at construction; a cache constructed disabled has no
/// storage and can never be enabled later. Eviction runs in batches and
/// reports the evicted metadata so the mediator can unregister it.
pub struct QueryCache {
    state: Option<Mutex<CacheState>>,
    enabled: AtomicBool,
    max_bytes: usize,
    min_cost_ms: f64,
    ttl: Option<Duration>,
    compression: bool,
    eviction_batch_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    invalidation_batches: AtomicU64,
}

/// Result of a cache insert: whether the entry went in, plus the entries
/// that had to be evicted to make room.
pub struct InsertOutcome {
    pub inserted: bool,
    pub evicted: Vec<(String, CacheMetadata)>,
}

pub enum LookupOutcome {
    Hit { docs: Vec<DocId>, total: usize },
    Miss,
    Expired(CacheMetadata),
}

impl QueryCache {
    pub fn new(
        max_bytes: usize,
        min_cost_ms: f64,
        ttl_seconds: u64,
        compression: bool,
        eviction_batch_size: usize,
        enabled: bool,
    ) -> Self {
        QueryCache {
            state: enabled.then(|| {
                Mutex::new(CacheState {
                    // Capacity is governed by the byte budget, not entry count
                    entries: LruCache::unbounded(),
                    current_bytes: 0,
                })
            }),
            enabled: AtomicBool::new(enabled),
            max_bytes,
            min_cost_ms,
            ttl: (ttl_seconds > 0).then(|| Duration::from_secs(ttl_seconds)),
            compression,
            eviction_batch_size: eviction_batch_size.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            invalidation_batches: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Toggle at runtime. Enabling requires that storage exists, i.e. the
    /// cache was constructed enabled.
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        if enabled && self.state.is_none() {
            return Err(Error::new(
                ErrorKind::PreconditionFailed,
                "cache was disabled at construction and has no storage",
            ));
        }
        self.enabled.store(enabled, Ordering::Release);
        Ok(())
    }

    fn entry_size(fingerprint: &str, payload: &Payload, metadata: &CacheMetadata) -> usize {
        let payload_bytes = match payload {
            Payload::Plain(docs) => docs.len() * 4,
            Payload::Compressed(bytes) => bytes.len(),
        };
        fingerprint.len()
            + payload_bytes
            + metadata.table.len()
            + metadata.ngrams.iter().map(|n| n.len()).sum::<usize>()
            + std::mem::size_of::<CacheEntry>()
    }

    /// Insert a result. Rejected when disabled or when the query was cheaper
    /// than the configured floor.
    pub fn insert(
        &self,
        fingerprint: String,
        docs: Vec<DocId>,
        total: usize,
        metadata: CacheMetadata,
        cost_ms: f64,
    ) -> InsertOutcome {
        if !self.is_enabled() || cost_ms < self.min_cost_ms {
            return InsertOutcome {
                inserted: false,
                evicted: Vec::new(),
            };
        }
        let Some(state) = &self.state else {
            return InsertOutcome {
                inserted: false,
                evicted: Vec::new(),
            };
        };

        let payload = if self.compression {
            let mut raw = Vec::with_capacity(docs.len() * 4);
            for doc in &docs {
                raw.extend_from_slice(&doc.0.to_le_bytes());
            }
            Payload::Compressed(lz4_flex::compress_prepend_size(&raw))
        } else {
            Payload::Plain(docs)
        };

        let size_bytes = Self::entry_size(&fingerprint, &payload, &metadata);
        let entry = CacheEntry {
            payload,
            total,
            metadata,
            cost_ms,
            size_bytes,
            inserted_at: Instant::now(),
        };

        let mut state = state.lock();
        if let Some(old) = state.entries.put(fingerprint, entry) {
            state.current_bytes -= old.size_bytes;
        }
        state.current_bytes += size_bytes;

        // Evict LRU entries in batches until under budget
        let mut evicted = Vec::new();
        while state.current_bytes > self.max_bytes && !state.entries.is_empty() {
            for _ in 0..self.eviction_batch_size {
                match state.entries.pop_lru() {
                    Some((fp, entry)) => {
                        state.current_bytes -= entry.size_bytes;
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        evicted.push((fp, entry.metadata));
                    }
                    None => break,
                }
            }
        }

        InsertOutcome {
            inserted: true,
            evicted,
        }
    }

    pub fn lookup(&self, fingerprint: &str) -> LookupOutcome {
        if !self.is_enabled() {
            return LookupOutcome::Miss;
        }
        let Some(state) = &self.state else {
            return LookupOutcome::Miss;
        };
        let mut state = state.lock();
        let expired = match state.entries.get(fingerprint) {
            Some(entry) => match self.ttl {
                Some(ttl) if entry.inserted_at.elapsed() > ttl => true,
                _ => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return LookupOutcome::Hit {
                        docs: entry.payload.docs(),
                        total: entry.total,
                    };
                }
            },
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return LookupOutcome::Miss;
            }
        };
        debug_assert!(expired);
        let entry = state.entries.pop(fingerprint).expect("entry present");
        state.current_bytes -= entry.size_bytes;
        self.misses.fetch_add(1, Ordering::Relaxed);
        LookupOutcome::Expired(entry.metadata)
    }

    /// Remove one entry, returning its metadata for unregistration.
    pub fn erase(&self, fingerprint: &str) -> Option<CacheMetadata> {
        let state = self.state.as_ref()?;
        let mut state = state.lock();
        let entry = state.entries.pop(fingerprint)?;
        state.current_bytes -= entry.size_bytes;
        Some(entry.metadata)
    }

    pub fn clear(&self) {
        if let Some(state) = &self.state {
            let mut state = state.lock();
            state.entries.clear();
            state.current_bytes = 0;
        }
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        match &self.state {
            Some(state) => state.lock().entries.contains(fingerprint),
            None => false,
        }
    }

    pub fn note_invalidation(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn note_invalidation_batch(&self) {
        self.invalidation_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn statistics(&self) -> CacheStatistics {
        let (entries, bytes) = match &self.state {
            Some(state) => {
                let state = state.lock();
                (state.entries.len(), state.current_bytes)
            }
            None => (0, 0),
        };
        CacheStatistics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            invalidation_batches: self.invalidation_batches.load(Ordering::Relaxed),
            entries,
            bytes,
            capacity_bytes: self.max_bytes,
        }
    }
}

/// Reverse index from (table, ngram) to the fingerprints whose cached
/// results touched that ngram.
#[derive(Default)]
pub struct InvalidationEngine {
    inner: Mutex<EngineState>,
}

#[derive(Default)]
struct EngineState {
    by_ngram: HashMap<(String, String), HashSet<String>>,
    by_fingerprint: HashMap<String, CacheMetadata>,
}

impl InvalidationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, fingerprint: &str, metadata: CacheMetadata) {
        let mut inner = self.inner.lock();
        for ngram in &metadata.ngrams {
            inner
                .by_ngram
                .entry((metadata.table.clone(), ngram.clone()))
                .or_default()
                .insert(fingerprint.to_string());
        }
        inner
            .by_fingerprint
            .insert(fingerprint.to_string(), metadata);
    }

    pub fn unregister(&self, fingerprint: &str) {
        let mut inner = self.inner.lock();
        let Some(metadata) = inner.by_fingerprint.remove(fingerprint) else {
            return;
        };
        for ngram in &metadata.ngrams {
            let key = (metadata.table.clone(), ngram.clone());
            if let Some(set) = inner.by_ngram.get_mut(&key) {
                set.remove(fingerprint);
                if set.is_empty() {
                    inner.by_ngram.remove(&key);
                }
            }
        }
    }

    /// Fingerprints whose results touched any of the ngrams in this table.
    pub fn collect(&self, table: &str, ngrams: &HashSet<String>) -> HashSet<String> {
        let inner = self.inner.lock();
        let mut fingerprints = HashSet::new();
        for ngram in ngrams {
            let key = (table.to_string(), ngram.clone());
            if let Some(set) = inner.by_ngram.get(&key) {
                fingerprints.extend(set.iter().cloned());
            }
        }
        fingerprints
    }

    pub fn tracked_entry_count(&self) -> usize {
        self.inner.lock().by_fingerprint.len()
    }

    pub fn tracked_ngram_count(&self, table: &str) -> usize {
        self.inner
            .lock()
            .by_ngram
            .keys()
            .filter(|(t, _)| t == table)
            .count()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.by_ngram.clear();
        inner.by_fingerprint.clear();
    }
}

/// Mediator that owns the cache and the reverse index and keeps them in
/// lock-step: every cache state transition performs the matching
/// invalidation transition. Nothing else mutates either structure.
pub struct CacheManager {
    cache: QueryCache,
    engine: InvalidationEngine,
}

impl CacheManager {
    pub fn new(cache: QueryCache) -> Self {
        CacheManager {
            cache,
            engine: InvalidationEngine::new(),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn engine(&self) -> &InvalidationEngine {
        &self.engine
    }

    pub fn insert(
        &self,
        fingerprint: String,
        docs: Vec<DocId>,
        total: usize,
        metadata: CacheMetadata,
        cost_ms: f64,
    ) {
        let outcome = self
            .cache
            .insert(fingerprint.clone(), docs, total, metadata.clone(), cost_ms);
        if outcome.inserted {
            self.engine.register(&fingerprint, metadata);
        }
        // Unregister before the entries are gone for good: a failure past
        // this point must not strand reverse-index metadata
        for (evicted_fp, _) in &outcome.evicted {
            self.engine.unregister(evicted_fp);
        }
    }

    pub fn lookup(&self, fingerprint: &str) -> Option<(Vec<DocId>, usize)> {
        match self.cache.lookup(fingerprint) {
            LookupOutcome::Hit { docs, total } => Some((docs, total)),
            LookupOutcome::Miss => None,
            LookupOutcome::Expired(_) => {
                self.engine.unregister(fingerprint);
                None
            }
        }
    }

    /// Erase every entry in `table` whose touched ngrams intersect the set.
    /// Returns the number of erased entries.
    pub fn invalidate_ngrams(&self, table: &str, ngrams: &HashSet<String>) -> usize {
        let fingerprints = self.engine.collect(table, ngrams);
        for fingerprint in &fingerprints {
            // Unregister first, then erase
            self.engine.unregister(fingerprint);
            self.cache.erase(fingerprint);
        }
        let count = fingerprints.len();
        if count > 0 {
            self.cache.note_invalidation(count as u64);
            tracing::debug!(table, count, "cache entries invalidated");
        }
        count
    }

    pub fn clear(&self) {
        self.cache.clear();
        self.engine.clear();
    }

    pub fn statistics(&self) -> CacheStatistics {
        self.cache.statistics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_bytes: usize, min_cost: f64) -> QueryCache {
        QueryCache::new(max_bytes, min_cost, 0, false, 10, true)
    }

    fn meta(table: &str, ngrams: &[&str]) -> CacheMetadata {
        CacheMetadata {
            table: table.to_string(),
            ngrams: ngrams.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn docs(ids: &[u32]) -> Vec<DocId> {
        ids.iter().map(|&i| DocId(i)).collect()
    }

    #[test]
    fn test_insert_and_lookup() {
        let manager = CacheManager::new(cache(1 << 20, 10.0));
        manager.insert(
            "q1".into(),
            docs(&[1, 2, 3]),
            3,
            meta("posts", &["gol", "ola"]),
            15.0,
        );
        let (result, total) = manager.lookup("q1").unwrap();
        assert_eq!(result, docs(&[1, 2, 3]));
        assert_eq!(total, 3);
        assert_eq!(manager.engine().tracked_entry_count(), 1);
    }

    #[test]
    fn test_cheap_query_not_cached() {
        let manager = CacheManager::new(cache(1 << 20, 10.0));
        manager.insert("q1".into(), docs(&[1]), 1, meta("posts", &["a"]), 5.0);
        assert!(manager.lookup("q1").is_none());
        assert_eq!(manager.engine().tracked_entry_count(), 0);
    }

    #[test]
    fn test_disabled_at_construction_cannot_enable() {
        let cache = QueryCache::new(1 << 20, 1.0, 0, false, 10, false);
        assert!(!cache.is_enabled());
        let err = cache.set_enabled(true).unwrap_err();
        assert_eq!(err.kind, ErrorKind::PreconditionFailed);
    }

    #[test]
    fn test_runtime_disable_and_reenable() {
        let cache = cache(1 << 20, 1.0);
        cache.set_enabled(false).unwrap();
        assert!(matches!(cache.lookup("x"), LookupOutcome::Miss));
        cache.set_enabled(true).unwrap();
        assert!(cache.is_enabled());
    }

    #[test]
    fn test_invalidate_ngrams_precision() {
        let manager = CacheManager::new(cache(1 << 20, 1.0));
        manager.insert("q-gol".into(), docs(&[1]), 1, meta("posts", &["gol", "ola"]), 5.0);
        manager.insert("q-rus".into(), docs(&[2]), 1, meta("posts", &["rus", "ust"]), 5.0);

        let touched: HashSet<String> = ["gol".to_string()].into();
        let count = manager.invalidate_ngrams("posts", &touched);
        assert_eq!(count, 1);
        assert!(manager.lookup("q-gol").is_none());
        assert!(manager.lookup("q-rus").is_some());
        // Reverse index metadata is fully cleaned up for the erased entry
        assert_eq!(manager.engine().tracked_entry_count(), 1);
    }

    #[test]
    fn test_invalidation_respects_table() {
        let manager = CacheManager::new(cache(1 << 20, 1.0));
        manager.insert("q-posts".into(), docs(&[1]), 1, meta("posts", &["tes"]), 5.0);
        manager.insert("q-comments".into(), docs(&[2]), 1, meta("comments", &["tes"]), 5.0);

        let touched: HashSet<String> = ["tes".to_string()].into();
        manager.invalidate_ngrams("posts", &touched);
        assert!(manager.lookup("q-posts").is_none());
        assert!(manager.lookup("q-comments").is_some());
    }

    #[test]
    fn test_eviction_unregisters_metadata() {
        // Budget small enough that the second insert evicts the first
        let manager = CacheManager::new(QueryCache::new(400, 1.0, 0, false, 10, true));
        manager.insert(
            "q1".into(),
            docs(&(0..50).collect::<Vec<u32>>()),
            50,
            meta("posts", &["aaa"]),
            5.0,
        );
        assert_eq!(manager.engine().tracked_entry_count(), 1);
        manager.insert(
            "q2".into(),
            docs(&(0..50).collect::<Vec<u32>>()),
            50,
            meta("posts", &["bbb"]),
            5.0,
        );
        // q1 evicted by the byte budget; its reverse-index entry is gone
        assert!(manager.lookup("q1").is_none());
        let stats = manager.statistics();
        assert!(stats.evictions >= 1);
        assert!(manager.engine().tracked_ngram_count("posts") <= 1);
    }

    #[test]
    fn test_clear_empties_both_structures() {
        let manager = CacheManager::new(cache(1 << 20, 1.0));
        manager.insert("q1".into(), docs(&[1]), 1, meta("posts", &["abc"]), 5.0);
        manager.clear();
        assert!(manager.lookup("q1").is_none());
        assert_eq!(manager.engine().tracked_entry_count(), 0);
        assert_eq!(manager.engine().tracked_ngram_count("posts"), 0);
        assert_eq!(manager.statistics().entries, 0);
    }

    #[test]
    fn test_ttl_expiry_unregisters() {
        let cache = QueryCache::new(1 << 20, 1.0, 1, false, 10, true);
        let manager = CacheManager::new(cache);
        manager.insert("q1".into(), docs(&[1]), 1, meta("posts", &["abc"]), 5.0);
        // Entry is live immediately
        assert!(manager.lookup("q1").is_some());
        std::thread::sleep(Duration::from_millis(1100));
        assert!(manager.lookup("q1").is_none());
        assert_eq!(manager.engine().tracked_entry_count(), 0);
    }

    #[test]
    fn test_compressed_round_trip() {
        let cache = QueryCache::new(1 << 20, 1.0, 0, true, 10, true);
        let manager = CacheManager::new(cache);
        let ids: Vec<u32> = (0..1000).collect();
        manager.insert("q1".into(), docs(&ids), 1000, meta("posts", &["abc"]), 5.0);
        let (result, total) = manager.lookup("q1").unwrap();
        assert_eq!(total, 1000);
        assert_eq!(result, docs(&ids));
    }

    #[test]
    fn test_hit_miss_counters() {
        let manager = CacheManager::new(cache(1 << 20, 1.0));
        manager.insert("q1".into(), docs(&[1]), 1, meta("posts", &["abc"]), 5.0);
        manager.lookup("q1");
        manager.lookup("q1");
        manager.lookup("missing");
        let stats = manager.statistics();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }
}
