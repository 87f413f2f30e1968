use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::core::catalog::TableCatalog;
use crate::query::cache::CacheManager;

/// One pending write notification: the affected table and the union of the
/// ngrams of the old and new text, computed with that table's ngram sizes.
#[derive(Debug, Clone)]
struct PendingInvalidation {
    table: String,
    ngrams: HashSet<String>,
}

/// Asynchronous invalidation worker.
///
/// Write events enqueue (table, ngrams) batches; a worker thread flushes
/// when either the batch-size or the max-delay threshold fires, collapsing
/// duplicate (table, ngram) pairs within a batch. While the worker is
/// stopped, invalidation runs synchronously inside the enqueue lock, so no
/// event is ever buffered into the void. The `running` transition happens
/// under the queue mutex: a stop cannot slip between an enqueue's check and
/// its push.
pub struct InvalidationQueue {
    manager: Arc<CacheManager>,
    catalog: Arc<TableCatalog>,
    queue: Mutex<VecDeque<PendingInvalidation>>,
    condvar: Condvar,
    running: AtomicBool,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    batch_size: AtomicUsize,
    max_delay_ms: AtomicU64,
}

impl InvalidationQueue {
    pub fn new(
        manager: Arc<CacheManager>,
        catalog: Arc<TableCatalog>,
        batch_size: usize,
        max_delay_ms: u64,
    ) -> Arc<Self> {
        Arc::new(InvalidationQueue {
            manager,
            catalog,
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
            batch_size: AtomicUsize::new(batch_size.max(1)),
            max_delay_ms: AtomicU64::new(max_delay_ms),
        })
    }

    pub fn set_batch_size(&self, batch_size: usize) {
        self.batch_size.store(batch_size.max(1), Ordering::Release);
    }

    pub fn set_max_delay(&self, max_delay_ms: u64) {
        self.max_delay_ms.store(max_delay_ms, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Notify the queue of a write. Empty `old_text` denotes INSERT, empty
    /// `new_text` denotes DELETE, both non-empty denotes UPDATE. Ngrams are
    /// generated with the *target table's* sizes.
    pub fn enqueue(&self, table: &str, old_text: &str, new_text: &str) {
        let Ok(context) = self.catalog.get(table) else {
            tracing::warn!(table, "invalidation for unknown table dropped");
            return;
        };
        let generator = context.index.generator();
        let mut ngrams = generator.generate(old_text);
        ngrams.extend(generator.generate(new_text));
        if ngrams.is_empty() {
            return;
        }

        let pending = PendingInvalidation {
            table: table.to_string(),
            ngrams,
        };

        // The running check and the push form one critical section
        let mut queue = self.queue.lock();
        if self.running.load(Ordering::Acquire) {
            queue.push_back(pending);
            self.condvar.notify_one();
        } else {
            // Synchronous path: invalidate inline, still inside the enqueue
            // lock, so metadata cleanup cannot race a concurrent Start
            self.manager
                .invalidate_ngrams(&pending.table, &pending.ngrams);
            self.manager.cache().note_invalidation_batch();
        }
    }

    /// Start the worker. Safe against concurrent starts; a second call is a
    /// no-op while the worker lives.
    pub fn start(self: &Arc<Self>) {
        let _queue = self.queue.lock();
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("invalidation-worker".to_string())
            .spawn(move || this.worker_loop())
            .expect("failed to spawn invalidation worker");
        *self.worker.lock() = Some(handle);
    }

    /// Stop the worker, flushing whatever is queued as a final batch. Safe
    /// against concurrent stops and stop-without-start.
    pub fn stop(&self) {
        {
            let _queue = self.queue.lock();
            if self
                .running
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            self.condvar.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn worker_loop(&self) {
        loop {
            let batch: Vec<PendingInvalidation> = {
                let mut queue = self.queue.lock();
                let deadline = Instant::now()
                    + Duration::from_millis(self.max_delay_ms.load(Ordering::Acquire));
                while queue.len() < self.batch_size.load(Ordering::Acquire)
                    && self.running.load(Ordering::Acquire)
                {
                    // Condvar wakeups may be spurious; the loop re-checks
                    // both thresholds
                    if self.condvar.wait_until(&mut queue, deadline).timed_out() {
                        break;
                    }
                }
                if queue.is_empty() {
                    if !self.running.load(Ordering::Acquire) {
                        return;
                    }
                    continue;
                }
                queue.drain(..).collect()
            };

            self.flush(batch);

            if !self.running.load(Ordering::Acquire) && self.queue.lock().is_empty() {
                return;
            }
        }
    }

    /// Merge a drained batch per table (deduplicating ngrams) and apply it.
    fn flush(&self, batch: Vec<PendingInvalidation>) {
        let mut merged: HashMap<String, HashSet<String>> = HashMap::new();
        for pending in batch {
            merged
                .entry(pending.table)
                .or_default()
                .extend(pending.ngrams);
        }
        for (table, ngrams) in merged {
            self.manager.invalidate_ngrams(&table, &ngrams);
        }
        self.manager.cache().note_invalidation_batch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::query::cache::{CacheMetadata, QueryCache};
    use crate::core::types::DocId;

    fn setup() -> (Arc<CacheManager>, Arc<TableCatalog>) {
        let raw = r#"{
            "tables": [
                {"name": "posts", "ngram_size": 3, "kanji_ngram_size": 2},
                {"name": "comments", "ngram_size": 2, "kanji_ngram_size": 2}
            ]
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        let catalog = Arc::new(TableCatalog::from_config(&config));
        let manager = Arc::new(CacheManager::new(QueryCache::new(
            1 << 20,
            1.0,
            0,
            false,
            10,
            true,
        )));
        (manager, catalog)
    }

    fn register(manager: &CacheManager, fp: &str, table: &str, ngrams: &[&str]) {
        manager.insert(
            fp.to_string(),
            vec![DocId(1)],
            1,
            CacheMetadata {
                table: table.to_string(),
                ngrams: ngrams.iter().map(|s| s.to_string()).collect(),
            },
            10.0,
        );
    }

    #[test]
    fn test_basic_enqueue_and_process() {
        let (manager, catalog) = setup();
        let queue = InvalidationQueue::new(Arc::clone(&manager), catalog, 100, 50);
        register(&manager, "q1", "posts", &["gol", "ola", "lan", "ang"]);

        queue.start();
        queue.enqueue("posts", "", "golang tutorial");
        std::thread::sleep(Duration::from_millis(200));
        queue.stop();

        assert!(manager.lookup("q1").is_none());
        assert_eq!(manager.engine().tracked_entry_count(), 0);
    }

    #[test]
    fn test_batch_size_threshold() {
        let (manager, catalog) = setup();
        let queue = InvalidationQueue::new(Arc::clone(&manager), catalog, 5, 10_000);
        for i in 0..10 {
            register(&manager, &format!("q{}", i), "posts", &["tes", "est"]);
        }

        queue.start();
        for i in 0..10 {
            queue.enqueue("posts", "", &format!("test{}", i));
        }
        std::thread::sleep(Duration::from_millis(200));
        queue.stop();

        for i in 0..10 {
            assert!(manager.lookup(&format!("q{}", i)).is_none());
        }
    }

    #[test]
    fn test_max_delay_threshold() {
        let (manager, catalog) = setup();
        let queue = InvalidationQueue::new(Arc::clone(&manager), catalog, 1000, 50);
        register(&manager, "q1", "posts", &["gol", "ola", "lan", "ang"]);

        queue.start();
        queue.enqueue("posts", "", "golang");
        std::thread::sleep(Duration::from_millis(300));

        // Flushed by the delay threshold, well before any batch fills
        assert!(manager.lookup("q1").is_none());
        queue.stop();
    }

    #[test]
    fn test_update_invalidates_old_and_new_ngrams() {
        let (manager, catalog) = setup();
        let queue = InvalidationQueue::new(Arc::clone(&manager), catalog, 100, 50);
        register(&manager, "q-rus", "posts", &["rus", "ust"]);
        register(&manager, "q-gol", "posts", &["gol", "ola", "lan", "ang"]);

        queue.start();
        queue.enqueue("posts", "rust programming", "golang programming");
        std::thread::sleep(Duration::from_millis(200));
        queue.stop();

        assert!(manager.lookup("q-rus").is_none());
        assert!(manager.lookup("q-gol").is_none());
    }

    #[test]
    fn test_table_isolation_with_per_table_ngram_sizes() {
        let (manager, catalog) = setup();
        let queue = InvalidationQueue::new(Arc::clone(&manager), catalog, 100, 50);
        // posts uses 3-grams, comments uses 2-grams: "test" touches "tes"
        // in posts and "te" in comments
        register(&manager, "q-posts", "posts", &["tes", "est"]);
        register(&manager, "q-comments", "comments", &["te", "es", "st"]);

        queue.start();
        queue.enqueue("posts", "", "testing");
        std::thread::sleep(Duration::from_millis(200));
        queue.stop();

        // Only the posts entry goes; the comments entry survives even
        // though its 2-grams overlap the written text
        assert!(manager.lookup("q-posts").is_none());
        assert!(manager.lookup("q-comments").is_some());
    }

    #[test]
    fn test_synchronous_path_when_stopped() {
        let (manager, catalog) = setup();
        let queue = InvalidationQueue::new(Arc::clone(&manager), catalog, 100, 50);
        for i in 0..10 {
            register(&manager, &format!("q{}", i), "posts", &["tes", "est"]);
        }
        assert!(!queue.is_running());
        assert_eq!(manager.engine().tracked_entry_count(), 10);

        // Worker never started: enqueue invalidates inline
        for i in 0..10 {
            queue.enqueue("posts", "", &format!("test{}", i));
        }

        for i in 0..10 {
            assert!(manager.lookup(&format!("q{}", i)).is_none());
        }
        // Metadata cleaned up on the synchronous path too
        assert_eq!(manager.engine().tracked_entry_count(), 0);
        assert_eq!(manager.engine().tracked_ngram_count("posts"), 0);
    }

    #[test]
    fn test_stop_without_start() {
        let (manager, catalog) = setup();
        let queue = InvalidationQueue::new(manager, catalog, 100, 50);
        queue.stop();
        assert!(!queue.is_running());
    }

    #[test]
    fn test_multiple_start_stop_cycles() {
        let (manager, catalog) = setup();
        let queue = InvalidationQueue::new(manager, catalog, 100, 50);
        for _ in 0..3 {
            queue.start();
            assert!(queue.is_running());
            queue.stop();
            assert!(!queue.is_running());
        }
    }

    #[test]
    fn test_concurrent_start_and_stop() {
        let (manager, catalog) = setup();
        let queue = InvalidationQueue::new(manager, catalog, 100, 50);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(std::thread::spawn(move || {
                for _ in 0..20 {
                    queue.start();
                    queue.stop();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!queue.is_running());
    }

    #[test]
    fn test_dedup_within_batch() {
        let (manager, catalog) = setup();
        let queue = InvalidationQueue::new(Arc::clone(&manager), catalog, 100, 100);
        register(&manager, "q1", "posts", &["gol", "ola", "lan", "ang"]);

        queue.start();
        for _ in 0..50 {
            queue.enqueue("posts", "", "golang tips");
        }
        std::thread::sleep(Duration::from_millis(300));
        queue.stop();

        assert!(manager.lookup("q1").is_none());
    }

    #[test]
    fn test_batch_counter() {
        let (manager, catalog) = setup();
        let queue = InvalidationQueue::new(Arc::clone(&manager), catalog, 100, 50);
        register(&manager, "q1", "posts", &["foo", "bar"]);

        let before = manager.statistics().invalidation_batches;
        queue.start();
        queue.enqueue("posts", "", "foo bar");
        queue.stop();

        let after = manager.statistics().invalidation_batches;
        assert_eq!(after, before + 1);
        assert!(manager.lookup("q1").is_none());
    }

    #[test]
    fn test_high_frequency_enqueue() {
        let (manager, catalog) = setup();
        let queue = InvalidationQueue::new(Arc::clone(&manager), catalog, 50, 20);
        for i in 0..100 {
            register(&manager, &format!("q{}", i), "posts", &["tes", "est"]);
        }

        queue.start();
        for i in 0..1000 {
            queue.enqueue("posts", "", &format!("test{}", i % 10));
        }
        std::thread::sleep(Duration::from_millis(500));
        queue.stop();

        for i in 0..100 {
            assert!(manager.lookup(&format!("q{}", i)).is_none());
        }
    }
}
