use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::error::{Error, ErrorKind, Result};

/// Process-wide state machine gating replication, SYNC, DUMP SAVE,
/// DUMP LOAD and OPTIMIZE against each other.
///
/// Allowed transitions:
///
/// | Operation         | Pre-requirement                                   |
/// |-------------------|---------------------------------------------------|
/// | REPLICATION START | cursor set; !loading; !read_only; !paused_for_dump|
/// | REPLICATION STOP  | replication running                               |
/// | SYNC <table>      | !loading; table not already syncing               |
/// | DUMP SAVE         | !read_only                                        |
/// | DUMP LOAD         | !loading; !replicating                            |
/// | OPTIMIZE          | not already optimizing                            |
///
/// All flags are atomics read in every public operation's preamble; checks
/// live here and nowhere else. `request_shutdown` flips its flag without
/// taking any mutex a worker could be holding, so destruction can never
/// deadlock against a worker blocked on that mutex.
pub struct LifecycleCoordinator {
    loading: AtomicBool,
    read_only: AtomicBool,
    optimization_in_progress: AtomicBool,
    replication_paused_for_dump: AtomicBool,
    source_reconnecting: AtomicBool,
    replication_running: AtomicBool,
    shutdown_requested: AtomicBool,
    syncing_tables: Mutex<HashSet<String>>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Default for LifecycleCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleCoordinator {
    pub fn new() -> Self {
        LifecycleCoordinator {
            loading: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            optimization_in_progress: AtomicBool::new(false),
            replication_paused_for_dump: AtomicBool::new(false),
            source_reconnecting: AtomicBool::new(false),
            replication_running: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            syncing_tables: Mutex::new(HashSet::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn is_optimizing(&self) -> bool {
        self.optimization_in_progress.load(Ordering::Acquire)
    }

    pub fn is_replication_running(&self) -> bool {
        self.replication_running.load(Ordering::Acquire)
    }

    pub fn is_replication_paused_for_dump(&self) -> bool {
        self.replication_paused_for_dump.load(Ordering::Acquire)
    }

    pub fn is_source_reconnecting(&self) -> bool {
        self.source_reconnecting.load(Ordering::Acquire)
    }

    pub fn set_source_reconnecting(&self, reconnecting: bool) {
        self.source_reconnecting.store(reconnecting, Ordering::Release);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// Flag shutdown. Deliberately touches no mutex.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
    }

    /// Track a background worker so shutdown can join it.
    pub fn register_worker(&self, handle: std::thread::JoinHandle<()>) {
        self.workers.lock().push(handle);
    }

    /// Request shutdown and join all registered workers. Safe to call more
    /// than once.
    pub fn shutdown(&self) {
        self.request_shutdown();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn start_replication(&self, cursor: &str) -> Result<()> {
        if cursor.is_empty() {
            return Err(Error::new(
                ErrorKind::PreconditionFailed,
                "replication cannot start without a cursor position",
            ));
        }
        if self.is_loading() {
            return Err(Error::new(
                ErrorKind::PreconditionFailed,
                "replication cannot start while a load is in progress",
            ));
        }
        if self.is_read_only() {
            return Err(Error::new(
                ErrorKind::PreconditionFailed,
                "replication cannot start in read-only mode",
            ));
        }
        if self.is_replication_paused_for_dump() {
            return Err(Error::new(
                ErrorKind::PreconditionFailed,
                "replication is paused for a dump",
            ));
        }
        if self
            .replication_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::new(
                ErrorKind::PreconditionFailed,
                "replication is already running",
            ));
        }
        tracing::info!("replication started");
        Ok(())
    }

    pub fn stop_replication(&self) -> Result<()> {
        if self
            .replication_running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::new(
                ErrorKind::PreconditionFailed,
                "replication is not running",
            ));
        }
        tracing::info!("replication stopped");
        Ok(())
    }

    /// Acquire the per-table sync latch. Parallel SYNCs of the same table
    /// serialize through the name set.
    pub fn begin_sync(self: &Arc<Self>, table: &str) -> Result<SyncGuard> {
        if self.is_loading() {
            return Err(Error::new(
                ErrorKind::PreconditionFailed,
                "sync cannot start while a load is in progress",
            ));
        }
        let mut syncing = self.syncing_tables.lock();
        if !syncing.insert(table.to_string()) {
            return Err(Error::new(
                ErrorKind::Busy,
                format!("sync already running for table: {}", table),
            ));
        }
        Ok(SyncGuard {
            coordinator: Arc::clone(self),
            table: table.to_string(),
        })
    }

    pub fn syncing_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.syncing_tables.lock().iter().cloned().collect();
        tables.sort();
        tables
    }

    /// Pause replication and enter read-only mode for the duration of a
    /// dump save. Flags restore on drop, on every exit path. The read_only
    /// transition is a single compare-exchange so two saves can never both
    /// pass the gate.
    pub fn begin_dump_save(self: &Arc<Self>) -> Result<DumpSaveGuard> {
        if self
            .read_only
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::new(
                ErrorKind::PreconditionFailed,
                "a dump is already in progress",
            ));
        }
        if self.is_replication_running() {
            self.replication_paused_for_dump.store(true, Ordering::Release);
        }
        Ok(DumpSaveGuard {
            coordinator: Arc::clone(self),
        })
    }

    pub fn begin_dump_load(self: &Arc<Self>) -> Result<DumpLoadGuard> {
        if self.is_replication_running() {
            return Err(Error::new(
                ErrorKind::PreconditionFailed,
                "stop replication before loading a dump",
            ));
        }
        if self
            .loading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::new(
                ErrorKind::PreconditionFailed,
                "a load is already in progress",
            ));
        }
        Ok(DumpLoadGuard {
            coordinator: Arc::clone(self),
        })
    }

    pub fn begin_optimize(self: &Arc<Self>) -> Result<OptimizeGuard> {
        if self
            .optimization_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::new(ErrorKind::Busy, "optimization already in progress"));
        }
        Ok(OptimizeGuard {
            coordinator: Arc::clone(self),
        })
    }
}

impl Drop for LifecycleCoordinator {
    fn drop(&mut self) {
        // Flag first (no mutex), then join whatever registered
        self.shutdown_requested.store(true, Ordering::Release);
        let handles: Vec<_> = self.workers.get_mut().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

pub struct SyncGuard {
    coordinator: Arc<LifecycleCoordinator>,
    table: String,
}

impl std::fmt::Debug for SyncGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncGuard")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.coordinator.syncing_tables.lock().remove(&self.table);
    }
}

pub struct DumpSaveGuard {
    coordinator: Arc<LifecycleCoordinator>,
}

impl Drop for DumpSaveGuard {
    fn drop(&mut self) {
        self.coordinator.read_only.store(false, Ordering::Release);
        self.coordinator
            .replication_paused_for_dump
            .store(false, Ordering::Release);
    }
}

pub struct DumpLoadGuard {
    coordinator: Arc<LifecycleCoordinator>,
}

impl Drop for DumpLoadGuard {
    fn drop(&mut self) {
        self.coordinator.loading.store(false, Ordering::Release);
    }
}

pub struct OptimizeGuard {
    coordinator: Arc<LifecycleCoordinator>,
}

impl std::fmt::Debug for OptimizeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizeGuard").finish_non_exhaustive()
    }
}

impl Drop for OptimizeGuard {
    fn drop(&mut self) {
        self.coordinator
            .optimization_in_progress
            .store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn coordinator() -> Arc<LifecycleCoordinator> {
        Arc::new(LifecycleCoordinator::new())
    }

    #[test]
    fn test_replication_requires_cursor() {
        let c = coordinator();
        let err = c.start_replication("").unwrap_err();
        assert_eq!(err.kind, ErrorKind::PreconditionFailed);
        assert!(c.start_replication("uuid:1-5").is_ok());
        assert!(c.is_replication_running());
        assert!(c.stop_replication().is_ok());
        assert!(c.stop_replication().is_err());
    }

    #[test]
    fn test_replication_blocked_during_dump_save() {
        let c = coordinator();
        c.start_replication("uuid:1-5").unwrap();
        let guard = c.begin_dump_save().unwrap();
        assert!(c.is_read_only());
        assert!(c.is_replication_paused_for_dump());
        // A second save is rejected while the first holds read_only
        assert!(c.begin_dump_save().is_err());
        drop(guard);
        assert!(!c.is_read_only());
        assert!(!c.is_replication_paused_for_dump());
    }

    #[test]
    fn test_replication_start_blocked_while_loading() {
        let c = coordinator();
        let guard = c.begin_dump_load().unwrap();
        let err = c.start_replication("uuid:1-5").unwrap_err();
        assert_eq!(err.kind, ErrorKind::PreconditionFailed);
        drop(guard);
        assert!(c.start_replication("uuid:1-5").is_ok());
    }

    #[test]
    fn test_dump_load_blocked_while_replicating() {
        let c = coordinator();
        c.start_replication("uuid:1-5").unwrap();
        assert!(c.begin_dump_load().is_err());
        c.stop_replication().unwrap();
        assert!(c.begin_dump_load().is_ok());
    }

    #[test]
    fn test_sync_latch_serializes_per_table() {
        let c = coordinator();
        let guard = c.begin_sync("posts").unwrap();
        let err = c.begin_sync("posts").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Busy);
        // A different table syncs in parallel
        assert!(c.begin_sync("comments").is_ok());
        drop(guard);
        assert!(c.begin_sync("posts").is_ok());
    }

    #[test]
    fn test_concurrent_dump_save_attempts_single_winner() {
        let c = coordinator();
        let winners = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = Arc::clone(&c);
            let winners = Arc::clone(&winners);
            let barrier = Arc::clone(&barrier);
            handles.push(std::thread::spawn(move || {
                // All threads hit the gate together
                barrier.wait();
                if let Ok(guard) = c.begin_dump_save() {
                    winners.fetch_add(1, Ordering::Relaxed);
                    // Hold the latch while the losers bounce off
                    std::thread::sleep(Duration::from_millis(50));
                    drop(guard);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // The single atomic gate admits exactly one saver
        assert_eq!(winners.load(Ordering::Relaxed), 1);
        assert!(!c.is_read_only());
    }

    #[test]
    fn test_optimize_exclusive() {
        let c = coordinator();
        let guard = c.begin_optimize().unwrap();
        assert_eq!(c.begin_optimize().unwrap_err().kind, ErrorKind::Busy);
        drop(guard);
        assert!(c.begin_optimize().is_ok());
    }

    #[test]
    fn test_shutdown_joins_workers_without_deadlock() {
        let c = coordinator();
        // Worker that loops on the syncing-tables mutex until shutdown is
        // flagged; request_shutdown never takes that mutex, so the join
        // cannot deadlock
        let worker = {
            let c = Arc::clone(&c);
            std::thread::spawn(move || {
                while !c.is_shutdown_requested() {
                    let _tables = c.syncing_tables();
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };
        c.register_worker(worker);
        c.shutdown();
        assert!(c.is_shutdown_requested());
    }

    #[test]
    fn test_concurrent_shutdown_requests() {
        let c = coordinator();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let c = Arc::clone(&c);
            handles.push(std::thread::spawn(move || c.request_shutdown()));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(c.is_shutdown_requested());
    }

    #[test]
    fn test_concurrent_status_checks() {
        let c = coordinator();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = Arc::clone(&c);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let _ = c.is_loading();
                    let _ = c.is_read_only();
                    let _ = c.syncing_tables();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
