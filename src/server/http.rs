use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{Request, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tower_http::cors::{Any, CorsLayer};

use crate::core::error::{Error, ErrorKind};
use crate::core::stats::ServerStats;
use crate::core::types::Document;
use crate::query::types::{FilterCondition, FilterOp, OrderBy, Query, QueryOp, SortOrder};
use crate::server::app::{App, VERSION};
use crate::server::formatter::ResponseFormatter;

/// JSON HTTP front end sharing the App (and its statistics) with the TCP
/// server. Data endpoints answer 503 while a dump load is in progress;
/// liveness always answers 200.
pub struct HttpServer {
    app: Arc<App>,
}

#[derive(Clone)]
struct HttpState {
    app: Arc<App>,
    allowlist: Arc<CidrAllowlist>,
}

impl HttpServer {
    pub fn new(app: Arc<App>) -> Self {
        HttpServer { app }
    }

    pub fn router(app: Arc<App>) -> Router {
        let allowlist = Arc::new(CidrAllowlist::parse(&app.config.network.allow_cidrs));
        let state = HttpState {
            app: Arc::clone(&app),
            allowlist,
        };

        let mut router = Router::new()
            .route("/info", get(info_handler))
            .route("/config", get(config_handler))
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .route("/health/live", get(health_live_handler))
            .route("/health/ready", get(health_ready_handler))
            .route("/health/detail", get(health_detail_handler))
            .route("/replication/status", get(replication_status_handler))
            .route("/:table/search", post(search_handler))
            .route("/:table/:doc_id", get(document_handler))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                access_control,
            ))
            .with_state(state);

        if app.config.api.http.enable_cors {
            let cors = if app.config.api.http.cors_allow_origin == "*" {
                CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
            } else {
                CorsLayer::new()
                    .allow_origin(
                        app.config
                            .api
                            .http
                            .cors_allow_origin
                            .parse::<header::HeaderValue>()
                            .unwrap_or(header::HeaderValue::from_static("*")),
                    )
                    .allow_methods(Any)
                    .allow_headers(Any)
            };
            router = router.layer(cors);
        }
        router
    }

    pub async fn run(&self) -> std::io::Result<()> {
        let bind = format!(
            "{}:{}",
            self.app.config.api.http.bind, self.app.config.api.http.port
        );
        let listener = tokio::net::TcpListener::bind(&bind).await?;
        tracing::info!(addr = %bind, "http server listening");
        axum::serve(
            listener,
            Self::router(Arc::clone(&self.app))
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    }
}

/// IPv4 CIDR allowlist. An empty list admits everyone; loopback is always
/// admitted so local health probes keep working.
struct CidrAllowlist {
    entries: Vec<(u32, u32)>,
    allow_all: bool,
}

impl CidrAllowlist {
    fn parse(cidrs: &[String]) -> Self {
        let mut entries = Vec::new();
        for cidr in cidrs {
            match Self::parse_one(cidr) {
                Some(entry) => entries.push(entry),
                None => tracing::warn!(cidr = %cidr, "ignoring unparsable CIDR"),
            }
        }
        CidrAllowlist {
            allow_all: cidrs.is_empty(),
            entries,
        }
    }

    fn parse_one(cidr: &str) -> Option<(u32, u32)> {
        let (addr, prefix) = match cidr.split_once('/') {
            Some((addr, prefix)) => (addr, prefix.parse::<u32>().ok()?),
            None => (cidr, 32),
        };
        if prefix > 32 {
            return None;
        }
        let addr: std::net::Ipv4Addr = addr.parse().ok()?;
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        Some((u32::from(addr) & mask, mask))
    }

    fn allows(&self, ip: IpAddr) -> bool {
        if self.allow_all || ip.is_loopback() {
            return true;
        }
        let v4 = match ip {
            IpAddr::V4(v4) => u32::from(v4),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => u32::from(v4),
                None => return false,
            },
        };
        self.entries
            .iter()
            .any(|(network, mask)| v4 & mask == *network)
    }
}

async fn access_control(
    State(state): State<HttpState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.allowlist.allows(peer.ip()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "address not allowed"})),
        )
            .into_response();
    }
    next.run(request).await
}

fn error_response(err: Error) -> Response {
    let status = match err.kind {
        ErrorKind::InvalidQuery => StatusCode::BAD_REQUEST,
        ErrorKind::TableNotFound | ErrorKind::DocumentNotFound | ErrorKind::ColumnNotFound => {
            StatusCode::NOT_FOUND
        }
        ErrorKind::PreconditionFailed => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Busy => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": err.context}))).into_response()
}

fn document_json(doc: &Document) -> Value {
    let filters: serde_json::Map<String, Value> = doc
        .attrs
        .iter()
        .map(|(name, value)| (name.clone(), Value::String(value.display_string())))
        .collect();
    json!({
        "doc_id": doc.doc_id.0,
        "primary_key": doc.primary_key,
        "filters": filters,
    })
}

#[derive(Debug, Deserialize)]
struct SearchBody {
    q: String,
    #[serde(default)]
    filters: Vec<FilterBody>,
    limit: Option<u32>,
    offset: Option<u32>,
    sort: Option<SortBody>,
}

#[derive(Debug, Deserialize)]
struct FilterBody {
    column: String,
    op: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct SortBody {
    #[serde(default)]
    column: String,
    #[serde(default = "default_order")]
    order: String,
}

fn default_order() -> String {
    "desc".to_string()
}

async fn search_handler(
    State(state): State<HttpState>,
    Path(table): Path<String>,
    Json(body): Json<SearchBody>,
) -> Response {
    let app = &state.app;
    if let Err(err) = app.check_serving() {
        return error_response(err);
    }
    ServerStats::incr(&app.stats.search_queries);

    let mut query = Query::new(QueryOp::Search, table);
    query.search_text = body.q;
    query.limit = app.config.api.default_limit;
    if let Some(limit) = body.limit {
        if limit == 0 || limit > crate::query::parser::MAX_LIMIT {
            return error_response(Error::new(
                ErrorKind::InvalidQuery,
                format!("limit must be between 1 and {}", crate::query::parser::MAX_LIMIT),
            ));
        }
        query.limit = limit;
        query.limit_explicit = true;
    }
    query.offset = body.offset.unwrap_or(0);
    for filter in body.filters {
        let Some(op) = FilterOp::parse(&filter.op) else {
            return error_response(Error::new(
                ErrorKind::InvalidQuery,
                format!("invalid filter operator: {}", filter.op),
            ));
        };
        query.filters.push(FilterCondition {
            column: filter.column,
            op,
            value: filter.value,
        });
    }
    if let Some(sort) = body.sort {
        let order = match sort.order.to_ascii_lowercase().as_str() {
            "asc" => SortOrder::Asc,
            "desc" => SortOrder::Desc,
            other => {
                return error_response(Error::new(
                    ErrorKind::InvalidQuery,
                    format!("invalid sort order: {}", other),
                ));
            }
        };
        query.order_by = Some(OrderBy {
            column: sort.column,
            order,
        });
    }

    match app.executor.execute(&query) {
        Ok(outcome) => {
            let results: Vec<Value> = outcome.page.iter().map(document_json).collect();
            Json(json!({
                "count": outcome.total,
                "limit": query.limit,
                "offset": query.offset,
                "results": results,
            }))
            .into_response()
        }
        Err(err) => {
            app.note_error();
            error_response(err)
        }
    }
}

async fn document_handler(
    State(state): State<HttpState>,
    Path((table, doc_id)): Path<(String, String)>,
) -> Response {
    let app = &state.app;
    if let Err(err) = app.check_serving() {
        return error_response(err);
    }
    ServerStats::incr(&app.stats.get_queries);

    let Ok(doc_id) = doc_id.parse::<u32>() else {
        return error_response(Error::new(ErrorKind::InvalidQuery, "doc_id must be numeric"));
    };
    let context = match app.catalog.get(&table) {
        Ok(context) => context,
        Err(err) => return error_response(err),
    };
    match context.store.get_document(crate::core::types::DocId(doc_id)) {
        Some(doc) => Json(document_json(&doc)).into_response(),
        None => error_response(Error::new(
            ErrorKind::DocumentNotFound,
            format!("document {} not found", doc_id),
        )),
    }
}

async fn info_handler(State(state): State<HttpState>) -> Response {
    let app = &state.app;
    let cache_stats = app.cache.statistics();
    let tables: serde_json::Map<String, Value> = app
        .catalog
        .iter()
        .map(|(name, context)| {
            (
                name.clone(),
                json!({
                    "documents": context.store.len(),
                    "terms": context.index.term_count(),
                    "index_bytes": context.index.memory_usage(),
                    "store_bytes": context.store.memory_usage(),
                }),
            )
        })
        .collect();
    Json(json!({
        "version": VERSION,
        "uptime_sec": app.stats.uptime_secs(),
        "total_requests": ServerStats::get(&app.stats.total_requests),
        "active_connections": ServerStats::get(&app.stats.active_connections),
        "tables": tables,
        "cache": {
            "entries": cache_stats.entries,
            "bytes": cache_stats.bytes,
            "hits": cache_stats.hits,
            "misses": cache_stats.misses,
            "evictions": cache_stats.evictions,
            "invalidations": cache_stats.invalidations,
        },
        "replication_cursor": app.apply_engine.cursor(),
    }))
    .into_response()
}

async fn config_handler(State(state): State<HttpState>) -> Response {
    Json(json!({"config": state.app.config.sanitized_lines()})).into_response()
}

async fn metrics_handler(State(state): State<HttpState>) -> Response {
    let app = &state.app;
    let body = ResponseFormatter::prometheus_metrics(
        &app.catalog,
        &app.stats,
        &app.cache.statistics(),
    );
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

async fn health_handler(State(state): State<HttpState>) -> Response {
    if state.app.coordinator.is_loading() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "loading"})),
        )
            .into_response();
    }
    Json(json!({"status": "ok"})).into_response()
}

async fn health_live_handler() -> Response {
    // Liveness never degrades: the process is up
    Json(json!({"status": "alive"})).into_response()
}

async fn health_ready_handler(State(state): State<HttpState>) -> Response {
    if state.app.coordinator.is_loading() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "loading"})),
        )
            .into_response();
    }
    Json(json!({"status": "ready"})).into_response()
}

async fn health_detail_handler(State(state): State<HttpState>) -> Response {
    let coordinator = &state.app.coordinator;
    Json(json!({
        "loading": coordinator.is_loading(),
        "read_only": coordinator.is_read_only(),
        "optimizing": coordinator.is_optimizing(),
        "replication_running": coordinator.is_replication_running(),
        "replication_paused_for_dump": coordinator.is_replication_paused_for_dump(),
        "source_reconnecting": coordinator.is_source_reconnecting(),
        "syncing_tables": coordinator.syncing_tables(),
    }))
    .into_response()
}

async fn replication_status_handler(State(state): State<HttpState>) -> Response {
    let app = &state.app;
    Json(json!({
        "running": app.coordinator.is_replication_running(),
        "reconnecting": app.coordinator.is_source_reconnecting(),
        "cursor": app.apply_engine.cursor(),
        "events_applied": ServerStats::get(&app.stats.replication_events_applied),
        "rows_skipped": ServerStats::get(&app.stats.replication_rows_skipped),
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_parse_and_match() {
        let allowlist = CidrAllowlist::parse(&[
            "10.0.0.0/8".to_string(),
            "192.168.1.42".to_string(),
        ]);
        assert!(allowlist.allows("10.1.2.3".parse().unwrap()));
        assert!(allowlist.allows("192.168.1.42".parse().unwrap()));
        assert!(!allowlist.allows("192.168.1.43".parse().unwrap()));
        assert!(!allowlist.allows("8.8.8.8".parse().unwrap()));
        // Loopback always admitted
        assert!(allowlist.allows("127.0.0.1".parse().unwrap()));
        assert!(allowlist.allows("::1".parse().unwrap()));
    }

    #[test]
    fn test_empty_allowlist_admits_everyone() {
        let allowlist = CidrAllowlist::parse(&[]);
        assert!(allowlist.allows("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_bad_cidr_ignored() {
        let allowlist = CidrAllowlist::parse(&["not-a-cidr".to_string()]);
        assert!(allowlist.entries.is_empty());
        // Non-empty configured list that parsed to nothing: closed by
        // default except loopback
        assert!(!allowlist.allow_all);
        assert!(!allowlist.allows("8.8.8.8".parse().unwrap()));
    }
}
