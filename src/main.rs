use std::sync::Arc;

use ngramdb::core::config::Config;
use ngramdb::server::app::App;
use ngramdb::server::http::HttpServer;
use ngramdb::server::tcp::TcpServer;

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    if config.logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args().nth(1);
    let config = match &config_path {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("failed to load config {}: {}", path, err);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    init_logging(&config);
    tracing::info!(
        version = ngramdb::server::app::VERSION,
        config = config_path.as_deref().unwrap_or("<defaults>"),
        "starting"
    );

    let app = match App::from_config(config) {
        Ok(app) => app,
        Err(err) => {
            tracing::error!(error = %err, "failed to initialize");
            std::process::exit(1);
        }
    };

    app.start_auto_dump();

    // The binlog reader and snapshot loader connect to the source database
    // and are wired here by the deployment; without them REPLICATION START
    // and SYNC report a precondition error.

    let http_enabled = app.config.api.http.enable;
    let tcp = TcpServer::new(Arc::clone(&app));

    if http_enabled {
        let http = HttpServer::new(Arc::clone(&app));
        tokio::select! {
            result = tcp.run() => {
                if let Err(err) = result {
                    tracing::error!(error = %err, "tcp server exited");
                }
            }
            result = http.run() => {
                if let Err(err) = result {
                    tracing::error!(error = %err, "http server exited");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
            }
        }
    } else {
        tokio::select! {
            result = tcp.run() => {
                if let Err(err) = result {
                    tracing::error!(error = %err, "tcp server exited");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
            }
        }
    }

    app.shutdown();
}
