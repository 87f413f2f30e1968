use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::core::catalog::{TableCatalog, TableContext};
use crate::core::config::BuildConfig;
use crate::core::error::Result;
use crate::lifecycle::coordinator::LifecycleCoordinator;
use crate::replication::event::RowImage;

/// Source of rows for a bulk table load. The production implementation
/// reads a consistent snapshot from the source database; tests feed vectors.
pub trait SnapshotSource: Send {
    /// Next batch of at most `limit` rows. An empty batch ends the load.
    fn fetch_batch(&mut self, limit: usize) -> Result<Vec<RowImage>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub rows_loaded: usize,
}

/// Runs per-table bulk loads and tracks their progress for SYNC STATUS.
pub struct SyncManager {
    coordinator: Arc<LifecycleCoordinator>,
    catalog: Arc<TableCatalog>,
    build: BuildConfig,
    pool: rayon::ThreadPool,
    progress: Mutex<HashMap<String, SyncProgress>>,
}

impl SyncManager {
    pub fn new(
        coordinator: Arc<LifecycleCoordinator>,
        catalog: Arc<TableCatalog>,
        build: BuildConfig,
    ) -> Self {
        let threads = if build.parallelism == 0 {
            num_cpus::get()
        } else {
            build.parallelism
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("sync-indexer-{}", i))
            .build()
            .expect("failed to build sync thread pool");
        SyncManager {
            coordinator,
            catalog,
            build,
            pool,
            progress: Mutex::new(HashMap::new()),
        }
    }

    pub fn progress(&self) -> Vec<(String, SyncProgress)> {
        let mut entries: Vec<(String, SyncProgress)> = self
            .progress
            .lock()
            .iter()
            .map(|(table, progress)| (table.clone(), progress.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn set_progress(&self, table: &str, phase: SyncPhase, rows_loaded: usize) {
        self.progress
            .lock()
            .insert(table.to_string(), SyncProgress { phase, rows_loaded });
    }

    /// Bulk-load one table from a snapshot source.
    ///
    /// The table is emptied in place first; on failure or shutdown the
    /// partially-loaded state is emptied in place again. The Index and
    /// DocumentStore instances are never replaced — the apply engine holds
    /// long-lived handles to them.
    pub fn run_sync(
        &self,
        table: &str,
        source: &mut dyn SnapshotSource,
    ) -> Result<usize> {
        let _sync_guard = self.coordinator.begin_sync(table)?;
        let context = self.catalog.get(table)?;

        self.set_progress(table, SyncPhase::Running, 0);
        context.clear_in_place();

        let mut loaded = 0usize;
        let batch_size = self.build.batch_size.max(1);

        let outcome = loop {
            if self.coordinator.is_shutdown_requested() {
                break Err(crate::core::error::Error::new(
                    crate::core::error::ErrorKind::PreconditionFailed,
                    "sync cancelled by shutdown",
                ));
            }
            let batch = match source.fetch_batch(batch_size) {
                Ok(batch) => batch,
                Err(err) => break Err(err),
            };
            if batch.is_empty() {
                break Ok(loaded);
            }
            if let Err(err) = self.load_batch(&context, &batch) {
                break Err(err);
            }
            loaded += batch.len();
            self.set_progress(table, SyncPhase::Running, loaded);

            if self.build.throttle_ms > 0 {
                std::thread::sleep(Duration::from_millis(self.build.throttle_ms));
            }
        };

        match outcome {
            Ok(total) => {
                self.set_progress(table, SyncPhase::Completed, total);
                tracing::info!(table, rows = total, "sync completed");
                Ok(total)
            }
            Err(err) => {
                // Cleanup keeps instance identity: empty in place, never
                // replace
                context.clear_in_place();
                self.set_progress(table, SyncPhase::Failed, loaded);
                tracing::error!(table, error = %err, "sync failed; table emptied");
                Err(err)
            }
        }
    }

    fn load_batch(&self, context: &TableContext, batch: &[RowImage]) -> Result<()> {
        let items: Vec<(String, crate::core::types::Attributes)> = batch
            .iter()
            .map(|row| (row.primary_key.clone(), row.attrs.clone()))
            .collect();

        let _latch = context.latch.write();
        let doc_ids = context.store.add_document_batch(&items)?;

        // N-gram generation dominates bulk load cost; fan it out before the
        // single-threaded posting merge
        let generator = context.index.generator().clone();
        let per_doc: Vec<(crate::core::types::DocId, std::collections::HashSet<String>)> =
            self.pool.install(|| {
                doc_ids
                    .par_iter()
                    .zip(batch.par_iter())
                    .map(|(&doc_id, row)| (doc_id, generator.generate(&row.text)))
                    .collect()
            });

        let mut per_term: HashMap<String, Vec<crate::core::types::DocId>> = HashMap::new();
        for (doc_id, terms) in per_doc {
            for term in terms {
                per_term.entry(term).or_default().push(doc_id);
            }
        }
        for (term, mut ids) in per_term {
            ids.sort_unstable();
            ids.dedup();
            context.index.add_term_batch(&term, &ids);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::core::error::{Error, ErrorKind};

    struct VecSource {
        rows: Vec<RowImage>,
        offset: usize,
        fail_after: Option<usize>,
    }

    impl VecSource {
        fn new(rows: Vec<RowImage>) -> Self {
            VecSource {
                rows,
                offset: 0,
                fail_after: None,
            }
        }
    }

    impl SnapshotSource for VecSource {
        fn fetch_batch(&mut self, limit: usize) -> Result<Vec<RowImage>> {
            if let Some(fail_at) = self.fail_after {
                if self.offset >= fail_at {
                    return Err(Error::new(ErrorKind::SourceTransient, "snapshot read failed"));
                }
            }
            let end = (self.offset + limit).min(self.rows.len());
            let batch = self.rows[self.offset..end].to_vec();
            self.offset = end;
            Ok(batch)
        }
    }

    fn setup() -> (Arc<TableCatalog>, SyncManager) {
        let raw = r#"{
            "tables": [{"name": "posts", "ngram_size": 2, "kanji_ngram_size": 2}],
            "build": {"batch_size": 10}
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        let catalog = Arc::new(TableCatalog::from_config(&config));
        let coordinator = Arc::new(LifecycleCoordinator::new());
        let manager = SyncManager::new(coordinator, Arc::clone(&catalog), config.build.clone());
        (catalog, manager)
    }

    fn rows(count: usize) -> Vec<RowImage> {
        (0..count)
            .map(|i| RowImage::new(i.to_string(), format!("document body {}", i)))
            .collect()
    }

    #[test]
    fn test_bulk_load() {
        let (catalog, manager) = setup();
        let mut source = VecSource::new(rows(35));
        let loaded = manager.run_sync("posts", &mut source).unwrap();
        assert_eq!(loaded, 35);

        let context = catalog.get("posts").unwrap();
        assert_eq!(context.store.len(), 35);
        let hits = context.index.search_and(&["do".to_string()], 0, false);
        assert_eq!(hits.len(), 35);

        let progress = manager.progress();
        assert_eq!(progress[0].1.phase, SyncPhase::Completed);
        assert_eq!(progress[0].1.rows_loaded, 35);
    }

    #[test]
    fn test_sync_replaces_existing_contents() {
        let (catalog, manager) = setup();
        let context = catalog.get("posts").unwrap();
        let stale = context
            .store
            .add_document("stale", crate::core::types::Attributes::new())
            .unwrap();
        context.index.add_document(stale, "stale content");

        let mut source = VecSource::new(rows(5));
        manager.run_sync("posts", &mut source).unwrap();

        assert_eq!(context.store.get_doc_id("stale"), None);
        assert_eq!(context.store.len(), 5);
    }

    #[test]
    fn test_failed_sync_empties_in_place() {
        let (catalog, manager) = setup();
        let context = catalog.get("posts").unwrap();
        let pointer_before = Arc::as_ptr(&context) as usize;

        let mut source = VecSource::new(rows(50));
        source.fail_after = Some(20);
        let err = manager.run_sync("posts", &mut source).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SourceTransient);

        // Emptied in place: same instance, zero contents
        let context_after = catalog.get("posts").unwrap();
        assert_eq!(pointer_before, Arc::as_ptr(&context_after) as usize);
        assert_eq!(context_after.store.len(), 0);
        assert_eq!(context_after.index.term_count(), 0);

        let progress = manager.progress();
        assert_eq!(progress[0].1.phase, SyncPhase::Failed);
    }

    #[test]
    fn test_unknown_table_rejected() {
        let (_, manager) = setup();
        let mut source = VecSource::new(rows(1));
        let err = manager.run_sync("missing", &mut source).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TableNotFound);
    }
}
