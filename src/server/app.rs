use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::core::catalog::TableCatalog;
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::ServerStats;
use crate::lifecycle::coordinator::LifecycleCoordinator;
use crate::lifecycle::sync::{SnapshotSource, SyncManager};
use crate::query::cache::{CacheManager, QueryCache};
use crate::query::invalidation::InvalidationQueue;
use crate::query::parser::QueryParser;
use crate::query::planner::QueryExecutor;
use crate::replication::apply::BinlogApplyEngine;
use crate::replication::runner::{EventSource, ReplicationRunner};
use crate::storage::snapshot::DumpManager;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Factory producing a snapshot source for a table's bulk SYNC. Provided by
/// the embedding binary; tests and minimal deployments run without one.
pub type SyncSourceFactory =
    Box<dyn Fn(&str) -> Result<Box<dyn SnapshotSource>> + Send + Sync>;

/// Factory producing the binlog event source for REPLICATION START.
pub type ReplicationSourceFactory = Box<dyn Fn() -> Result<Box<dyn EventSource>> + Send + Sync>;

/// The wired application: every component of the engine plus the shared
/// statistics both servers render from.
pub struct App {
    pub config: Config,
    pub catalog: Arc<TableCatalog>,
    pub coordinator: Arc<LifecycleCoordinator>,
    pub cache: Arc<CacheManager>,
    pub invalidation: Arc<InvalidationQueue>,
    pub executor: QueryExecutor,
    pub apply_engine: Arc<BinlogApplyEngine>,
    pub sync_manager: Arc<SyncManager>,
    pub dump_manager: Arc<DumpManager>,
    pub stats: Arc<ServerStats>,
    pub parser: QueryParser,
    sync_sources: Mutex<Option<SyncSourceFactory>>,
    replication_sources: Mutex<Option<ReplicationSourceFactory>>,
}

impl App {
    pub fn from_config(config: Config) -> Result<Arc<App>> {
        let catalog = Arc::new(TableCatalog::from_config(&config));
        let coordinator = Arc::new(LifecycleCoordinator::new());
        let stats = Arc::new(ServerStats::new());

        let cache = Arc::new(CacheManager::new(QueryCache::new(
            config.cache.max_memory_mb * 1024 * 1024,
            config.cache.min_query_cost_ms,
            config.cache.ttl_seconds,
            config.cache.compression_enabled,
            config.cache.eviction_batch_size,
            config.cache.enabled,
        )));

        let invalidation = InvalidationQueue::new(
            Arc::clone(&cache),
            Arc::clone(&catalog),
            config.cache.invalidation.batch_size,
            config.cache.invalidation.max_delay_ms,
        );
        // max_delay of zero forces the synchronous path: callers who need
        // total ordering get it by never starting the worker
        if config.cache.invalidation.max_delay_ms > 0 {
            invalidation.start();
        }

        let executor = QueryExecutor::new(Arc::clone(&catalog), Arc::clone(&cache));
        let apply_engine = Arc::new(BinlogApplyEngine::new(
            Arc::clone(&catalog),
            Arc::clone(&invalidation),
            Arc::clone(&stats),
            config.replication.start_from.clone(),
        ));
        let sync_manager = Arc::new(SyncManager::new(
            Arc::clone(&coordinator),
            Arc::clone(&catalog),
            config.build.clone(),
        ));
        let dump_manager = Arc::new(DumpManager::new(&config.dump)?);
        let parser = QueryParser::new(config.api.default_limit);

        Ok(Arc::new(App {
            catalog,
            coordinator,
            cache,
            invalidation,
            executor,
            apply_engine,
            sync_manager,
            dump_manager,
            stats,
            parser,
            config,
            sync_sources: Mutex::new(None),
            replication_sources: Mutex::new(None),
        }))
    }

    pub fn set_sync_source_factory(&self, factory: SyncSourceFactory) {
        *self.sync_sources.lock() = Some(factory);
    }

    pub fn set_replication_source_factory(&self, factory: ReplicationSourceFactory) {
        *self.replication_sources.lock() = Some(factory);
    }

    /// Start the auto-dump timer when configured.
    pub fn start_auto_dump(self: &Arc<Self>) {
        let engine = Arc::clone(&self.apply_engine);
        Arc::clone(&self.dump_manager).spawn_auto_dump_timer(
            Arc::clone(&self.catalog),
            Arc::clone(&self.coordinator),
            Arc::new(move || engine.cursor()),
            self.config.dump.interval_sec,
        );
    }

    /// REPLICATION START: flip the coordinator state and, when a source
    /// factory is wired, spawn the apply runner.
    pub fn start_replication(self: &Arc<Self>) -> Result<()> {
        self.coordinator.start_replication(&self.apply_engine.cursor())?;
        let factory = self.replication_sources.lock();
        if let Some(factory) = factory.as_ref() {
            match factory() {
                Ok(source) => {
                    let runner = ReplicationRunner::new(
                        Arc::clone(&self.apply_engine),
                        Arc::clone(&self.coordinator),
                        self.config.replication.clone(),
                    );
                    runner.spawn(source);
                }
                Err(err) => {
                    let _ = self.coordinator.stop_replication();
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// SYNC <table>: kick off the bulk load on a background thread.
    pub fn start_sync(self: &Arc<Self>, table: &str) -> Result<()> {
        // Validate the table up front so the caller gets a crisp error
        self.catalog.get(table)?;
        let mut source = {
            let factory = self.sync_sources.lock();
            let Some(factory) = factory.as_ref() else {
                return Err(Error::new(
                    ErrorKind::PreconditionFailed,
                    "no snapshot source configured for SYNC",
                ));
            };
            factory(table)?
        };

        let sync_manager = Arc::clone(&self.sync_manager);
        let table = table.to_string();
        let handle = std::thread::Builder::new()
            .name(format!("sync-{}", table))
            .spawn(move || {
                if let Err(err) = sync_manager.run_sync(&table, source.as_mut()) {
                    tracing::error!(table = %table, error = %err, "sync failed");
                }
            })
            .map_err(|e| Error::new(ErrorKind::Internal, e.to_string()))?;
        self.coordinator.register_worker(handle);
        Ok(())
    }

    /// OPTIMIZE <table>: run the index optimization in the background,
    /// holding the coordinator's exclusive optimize latch.
    pub fn start_optimize(self: &Arc<Self>, table: &str) -> Result<()> {
        let context = self.catalog.get(table)?;
        let guard = self.coordinator.begin_optimize()?;
        let batch_size = self.config.build.batch_size.max(1);
        let handle = std::thread::Builder::new()
            .name(format!("optimize-{}", table))
            .spawn(move || {
                let _guard = guard;
                let total_docs = context.store.len() as u64;
                if let Err(err) = context.index.optimize_in_batches(total_docs, batch_size) {
                    tracing::warn!(error = %err, "optimize skipped");
                }
            })
            .map_err(|e| Error::new(ErrorKind::Internal, e.to_string()))?;
        self.coordinator.register_worker(handle);
        Ok(())
    }

    /// Reject data queries while a load is in progress.
    pub fn check_serving(&self) -> Result<()> {
        if self.coordinator.is_loading() {
            return Err(Error::new(
                ErrorKind::PreconditionFailed,
                "server is loading a dump; queries are unavailable",
            ));
        }
        Ok(())
    }

    pub fn note_error(&self) {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Stop background machinery in dependency-safe order.
    pub fn shutdown(&self) {
        self.coordinator.request_shutdown();
        let _ = self.coordinator.stop_replication();
        self.invalidation.stop();
        self.coordinator.shutdown();
    }
}
