//! Folio backend: collaboration WebSocket relay and compile HTTP service
//! in one process.

mod config;

use std::sync::Arc;
use tokio::net::TcpListener;

use folio_collab::{CollabServer, DocumentRegistry};
use folio_compile::{router, AppState, CompileQueue, CompileRunner, Toolchains};
use folio_core::{FsProjectStore, ProjectStore};

use config::ServerConfig;

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(e) = run(ServerConfig::from_env()).await {
        log::error!("Folio server failed: {e}");
        std::process::exit(1);
    }
}

async fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    log::info!("Starting Folio server with {config:?}");

    let store: Arc<dyn ProjectStore> = Arc::new(FsProjectStore::open(&config.data_dir).await?);

    let registry = DocumentRegistry::new(store.clone(), config.collab.registry.clone());
    let collab = CollabServer::with_registry(config.collab.bind_addr.clone(), registry.clone());

    let runner = CompileRunner::new(store.clone(), Toolchains::from_config(&config.toolchains));
    let queue = CompileQueue::new(config.queue.clone(), runner);
    let sweeper = queue.spawn_sweeper();

    let listener = TcpListener::bind(&config.http.bind_addr).await?;
    log::info!("Compile API listening on {}", config.http.bind_addr);
    let app = router(AppState::new(queue, store));

    let result = tokio::select! {
        res = collab.run() => res,
        res = axum::serve(listener, app) => res.map_err(Into::into),
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutdown requested");
            Ok(())
        }
    };

    sweeper.abort();
    let flushed = registry.debouncer().flush_all().await;
    log::info!("Flushed {flushed} pending document writes");
    result
}
