//! `lexbulk` HTTP service.
//!
//! Usage: `lexbulk [config-file]`. Without a file, `lexbulk.{toml,yaml,json}`
//! in the working directory is used when present; `LEXBULK_*` environment
//! variables override either.

use std::process::ExitCode;
use std::sync::Arc;

use lexbulk::config::{EngineConfig, StoreMode};
use lexbulk::interface::BulkInterface;
use lexbulk::persist::SqliteStore;
use lexbulk::server;
use lexbulk::store::{MemoryStore, RecordStore};
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let path = std::env::args().nth(1);
    let config = match EngineConfig::load(path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .init();

    let store: Arc<dyn RecordStore> = match config.store.mode {
        StoreMode::Memory => Arc::new(MemoryStore::new()),
        StoreMode::Sqlite => match SqliteStore::open(config.persistence_mode()) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, "could not open record store");
                return ExitCode::FAILURE;
            }
        },
    };
    let bind = config.server.bind.clone();
    info!(concurrency = config.concurrency, store = ?config.store.mode, "engine configured");
    let app = server::router(Arc::new(BulkInterface::new(store, config)));

    let listener = match TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, %bind, "failed to bind");
            return ExitCode::FAILURE;
        }
    };
    info!("lexbulk listening on {bind}");
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "server error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
