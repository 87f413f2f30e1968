use crate::core::catalog::TableCatalog;
use crate::core::config::Config;
use crate::core::stats::ServerStats;
use crate::core::types::Document;
use crate::query::cache::CacheStatistics;
use crate::query::types::DebugInfo;

/// Text-protocol response rendering. Stateless; the transport appends the
/// trailing CRLF (multi-line responses use CRLF between lines too).
pub struct ResponseFormatter;

impl ResponseFormatter {
    pub fn search(page: &[Document], total: usize, debug: Option<&DebugInfo>) -> String {
        let mut line = format!("OK RESULTS {}", total);
        for doc in page {
            line.push(' ');
            line.push_str(&doc.primary_key);
        }
        if let Some(debug) = debug {
            line.push(' ');
            line.push_str(&debug.render());
        }
        line
    }

    pub fn count(count: usize, debug: Option<&DebugInfo>) -> String {
        let mut line = format!("OK COUNT {}", count);
        if let Some(debug) = debug {
            line.push(' ');
            line.push_str(&debug.render());
        }
        line
    }

    pub fn get(doc: &Document) -> String {
        let mut line = format!("OK DOC {}", doc.primary_key);
        let mut names: Vec<&String> = doc.attrs.keys().collect();
        names.sort();
        for name in names {
            line.push(' ');
            line.push_str(name);
            line.push('=');
            line.push_str(&doc.attrs[name].display_string());
        }
        line
    }

    pub fn saved(path: &str) -> String {
        format!("OK SAVED {}", path)
    }

    pub fn loaded(path: &str) -> String {
        format!("OK LOADED {}", path)
    }

    pub fn error(message: &str) -> String {
        format!("ERROR {}", message)
    }

    pub fn replication_status(running: bool, reconnecting: bool, cursor: &str, applied: u64) -> String {
        format!(
            "OK REPLICATION running={} reconnecting={} cursor={} applied={}",
            running,
            reconnecting,
            if cursor.is_empty() { "-" } else { cursor },
            applied
        )
    }

    /// Multi-line INFO block terminated by END.
    pub fn info(
        version: &str,
        catalog: &TableCatalog,
        stats: &ServerStats,
        cache_stats: &CacheStatistics,
        replication_cursor: &str,
    ) -> Vec<String> {
        let mut lines = Vec::new();
        lines.push(format!("version: {}", version));
        lines.push(format!("uptime_sec: {}", stats.uptime_secs()));
        lines.push(format!(
            "total_requests: {}",
            ServerStats::get(&stats.total_requests)
        ));
        lines.push(format!(
            "active_connections: {}",
            ServerStats::get(&stats.active_connections)
        ));

        for (name, context) in catalog.iter() {
            lines.push(format!("table_{}_documents: {}", name, context.store.len()));
            lines.push(format!("table_{}_terms: {}", name, context.index.term_count()));
            lines.push(format!(
                "table_{}_index_bytes: {}",
                name,
                context.index.memory_usage()
            ));
            lines.push(format!(
                "table_{}_store_bytes: {}",
                name,
                context.store.memory_usage()
            ));
        }

        lines.push(format!("cache_entries: {}", cache_stats.entries));
        lines.push(format!("cache_bytes: {}", cache_stats.bytes));
        lines.push(format!("cache_hits: {}", cache_stats.hits));
        lines.push(format!("cache_misses: {}", cache_stats.misses));
        lines.push(format!("cache_evictions: {}", cache_stats.evictions));
        lines.push(format!("cache_invalidations: {}", cache_stats.invalidations));
        lines.push(format!(
            "replication_cursor: {}",
            if replication_cursor.is_empty() { "-" } else { replication_cursor }
        ));
        lines.push(format!(
            "replication_events_applied: {}",
            ServerStats::get(&stats.replication_events_applied)
        ));
        lines.push("END".to_string());
        lines
    }

    /// Multi-line CONFIG block (secrets masked) terminated by END.
    pub fn config(config: &Config) -> Vec<String> {
        let mut lines = config.sanitized_lines();
        lines.push("END".to_string());
        lines
    }

    pub fn sync_started(table: &str) -> String {
        format!("OK SYNC STARTED {}", table)
    }

    pub fn sync_status(entries: &[(String, crate::lifecycle::sync::SyncProgress)]) -> String {
        if entries.is_empty() {
            return "OK SYNC idle".to_string();
        }
        let mut line = "OK SYNC".to_string();
        for (table, progress) in entries {
            let phase = match progress.phase {
                crate::lifecycle::sync::SyncPhase::Running => "running",
                crate::lifecycle::sync::SyncPhase::Completed => "completed",
                crate::lifecycle::sync::SyncPhase::Failed => "failed",
            };
            line.push_str(&format!(" {}:{}:{}", table, phase, progress.rows_loaded));
        }
        line
    }

    /// Prometheus text exposition (v0.0.4) for /metrics.
    pub fn prometheus_metrics(
        catalog: &TableCatalog,
        stats: &ServerStats,
        cache_stats: &CacheStatistics,
    ) -> String {
        let mut out = String::new();
        let mut counter = |name: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        };
        counter(
            "ngramdb_requests_total",
            "Total protocol requests handled",
            ServerStats::get(&stats.total_requests),
        );
        counter(
            "ngramdb_search_queries_total",
            "SEARCH queries executed",
            ServerStats::get(&stats.search_queries),
        );
        counter(
            "ngramdb_cache_hits_total",
            "Query cache hits",
            cache_stats.hits,
        );
        counter(
            "ngramdb_cache_misses_total",
            "Query cache misses",
            cache_stats.misses,
        );
        counter(
            "ngramdb_cache_evictions_total",
            "Query cache evictions",
            cache_stats.evictions,
        );
        counter(
            "ngramdb_replication_events_applied_total",
            "Binlog events applied",
            ServerStats::get(&stats.replication_events_applied),
        );

        out.push_str("# HELP ngramdb_table_documents Documents per table\n");
        out.push_str("# TYPE ngramdb_table_documents gauge\n");
        for (name, context) in catalog.iter() {
            out.push_str(&format!(
                "ngramdb_table_documents{{table=\"{}\"}} {}\n",
                name,
                context.store.len()
            ));
        }
        out.push_str("# HELP ngramdb_table_terms Index terms per table\n");
        out.push_str("# TYPE ngramdb_table_terms gauge\n");
        for (name, context) in catalog.iter() {
            out.push_str(&format!(
                "ngramdb_table_terms{{table=\"{}\"}} {}\n",
                name,
                context.index.term_count()
            ));
        }
        out.push_str(&format!(
            "# HELP ngramdb_uptime_seconds Process uptime\n# TYPE ngramdb_uptime_seconds gauge\nngramdb_uptime_seconds {}\n",
            stats.uptime_secs()
        ));
        out
    }
}
