use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::core::stats::ServerStats;
use crate::query::parser::Command;
use crate::query::types::QueryOp;
use crate::server::app::{App, VERSION};
use crate::server::formatter::ResponseFormatter;

/// Per-connection state for the text protocol.
#[derive(Default)]
pub struct ConnectionContext {
    pub debug: bool,
}

/// Line-oriented TCP front end. One request per CRLF-terminated line, one
/// response per request (INFO and CONFIG respond with multiple lines ending
/// in END). Commands are case-insensitive.
pub struct TcpServer {
    app: Arc<App>,
}

impl TcpServer {
    pub fn new(app: Arc<App>) -> Self {
        TcpServer { app }
    }

    pub async fn run(&self) -> std::io::Result<()> {
        let bind = format!(
            "{}:{}",
            self.app.config.api.tcp.bind, self.app.config.api.tcp.port
        );
        let listener = TcpListener::bind(&bind).await?;
        tracing::info!(addr = %bind, "tcp server listening");

        loop {
            let (socket, peer) = listener.accept().await?;
            let app = Arc::clone(&self.app);
            tokio::spawn(async move {
                app.stats.connection_opened();
                tracing::debug!(peer = %peer, "connection opened");
                let mut ctx = ConnectionContext::default();
                let (read_half, mut write_half) = socket.into_split();
                let mut lines = BufReader::new(read_half).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let response = process_request(&app, &line, &mut ctx);
                    let payload = format!("{}\r\n", response);
                    if write_half.write_all(payload.as_bytes()).await.is_err() {
                        break;
                    }
                }
                app.stats.connection_closed();
                tracing::debug!(peer = %peer, "connection closed");
            });
        }
    }
}

/// Handle one protocol line and produce the full response (multi-line
/// responses joined with CRLF; the caller appends the final CRLF).
pub fn process_request(app: &Arc<App>, line: &str, ctx: &mut ConnectionContext) -> String {
    app.stats.total_requests.fetch_add(1, Ordering::Relaxed);

    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return ResponseFormatter::error("Empty query");
    }
    if line.len() > app.config.api.max_query_length {
        app.note_error();
        return ResponseFormatter::error("Query too long");
    }

    let command = match app.parser.parse(line) {
        Ok(command) => command,
        Err(err) => {
            app.note_error();
            return ResponseFormatter::error(&err.context);
        }
    };

    match dispatch(app, command, ctx) {
        Ok(response) => response,
        Err(err) => {
            app.note_error();
            ResponseFormatter::error(&err.context)
        }
    }
}

fn dispatch(
    app: &Arc<App>,
    command: Command,
    ctx: &mut ConnectionContext,
) -> crate::core::error::Result<String> {
    match command {
        Command::Query(mut query) => {
            app.check_serving()?;
            query.debug = ctx.debug;
            match query.op {
                QueryOp::Search => {
                    ServerStats::incr(&app.stats.search_queries);
                    let outcome = app.executor.execute(&query)?;
                    Ok(ResponseFormatter::search(
                        &outcome.page,
                        outcome.total,
                        outcome.debug.as_ref(),
                    ))
                }
                QueryOp::Count => {
                    ServerStats::incr(&app.stats.count_queries);
                    let outcome = app.executor.execute(&query)?;
                    Ok(ResponseFormatter::count(outcome.total, outcome.debug.as_ref()))
                }
                QueryOp::Get => {
                    ServerStats::incr(&app.stats.get_queries);
                    let doc = app
                        .executor
                        .get_document(&query.table, &query.primary_key)?;
                    Ok(ResponseFormatter::get(&doc))
                }
            }
        }
        Command::Info => {
            let lines = ResponseFormatter::info(
                VERSION,
                &app.catalog,
                &app.stats,
                &app.cache.statistics(),
                &app.apply_engine.cursor(),
            );
            Ok(lines.join("\r\n"))
        }
        Command::Config => Ok(ResponseFormatter::config(&app.config).join("\r\n")),
        Command::DumpSave(name) => {
            let path = app.dump_manager.save(
                &app.catalog,
                &app.coordinator,
                &app.apply_engine.cursor(),
                name.as_deref(),
            )?;
            Ok(ResponseFormatter::saved(&path.display().to_string()))
        }
        Command::DumpLoad { name, force } => {
            let (path, cursor) = app.dump_manager.load(
                &app.catalog,
                &app.coordinator,
                &app.apply_engine.cursor(),
                name.as_deref(),
                force,
            )?;
            app.apply_engine.set_cursor(cursor);
            Ok(ResponseFormatter::loaded(&path.display().to_string()))
        }
        Command::ReplicationStart => {
            app.start_replication()?;
            Ok("OK REPLICATION STARTED".to_string())
        }
        Command::ReplicationStop => {
            app.coordinator.stop_replication()?;
            Ok("OK REPLICATION STOPPED".to_string())
        }
        Command::ReplicationStatus => Ok(ResponseFormatter::replication_status(
            app.coordinator.is_replication_running(),
            app.coordinator.is_source_reconnecting(),
            &app.apply_engine.cursor(),
            ServerStats::get(&app.stats.replication_events_applied),
        )),
        Command::Sync(table) => {
            app.start_sync(&table)?;
            Ok(ResponseFormatter::sync_started(&table))
        }
        Command::SyncStatus => Ok(ResponseFormatter::sync_status(&app.sync_manager.progress())),
        Command::DebugOn => {
            ctx.debug = true;
            Ok("OK DEBUG ON".to_string())
        }
        Command::DebugOff => {
            ctx.debug = false;
            Ok("OK DEBUG OFF".to_string())
        }
        Command::Optimize(table) => {
            app.start_optimize(&table)?;
            Ok(format!("OK OPTIMIZE STARTED {}", table))
        }
    }
}
