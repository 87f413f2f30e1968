use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Process-wide counters shared between the TCP and HTTP servers.
///
/// Both surfaces render from the same instance (one `Arc`), so /info and
/// /metrics always agree with the text protocol's INFO output.
pub struct ServerStats {
    start_time: Instant,
    pub total_requests: AtomicU64,
    pub active_connections: AtomicU64,
    pub total_connections: AtomicU64,
    pub search_queries: AtomicU64,
    pub count_queries: AtomicU64,
    pub get_queries: AtomicU64,
    pub errors: AtomicU64,
    pub replication_events_applied: AtomicU64,
    pub replication_rows_skipped: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_evictions: AtomicU64,
    pub cache_invalidations: AtomicU64,
    pub cache_invalidation_batches: AtomicU64,
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerStats {
    pub fn new() -> Self {
        ServerStats {
            start_time: Instant::now(),
            total_requests: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            search_queries: AtomicU64::new(0),
            count_queries: AtomicU64::new(0),
            get_queries: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            replication_events_applied: AtomicU64::new(0),
            replication_rows_skipped: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_evictions: AtomicU64::new(0),
            cache_invalidations: AtomicU64::new(0),
            cache_invalidation_batches: AtomicU64::new(0),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let stats = ServerStats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        assert_eq!(ServerStats::get(&stats.active_connections), 1);
        assert_eq!(ServerStats::get(&stats.total_connections), 2);
    }
}
