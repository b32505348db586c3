use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use palaver_core::config::default_codecs;
use palaver_core::media::mock::MockMediaEngine;
use palaver_core::media::{MediaEngine, MediaWorker, WorkerPool, WorkerSettings};
use palaver_core::room::LOBBY_ROOM;
use palaver_core::{logging, Config, SessionHub};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration (PALAVER_CONFIG_PATH > ./palaver.toml > env/defaults)
    let config_path = std::env::var("PALAVER_CONFIG_PATH").ok();
    let config = Config::load(Some(
        config_path.as_deref().unwrap_or("palaver.toml"),
    ))?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Palaver server starting...");
    info!("Listen address: {}", config.listen_address());

    // 4. Build the media engine and worker pool. A pool that cannot be
    // created means the engine is unusable; restarting the process is the
    // recovery strategy, so creation failure aborts startup.
    let engine: Arc<dyn MediaEngine> = match config.media.engine.as_str() {
        "mock" => Arc::new(MockMediaEngine::new()),
        other => {
            return Err(anyhow::anyhow!(
                "unknown media engine backend: {other} (a real engine plugs in behind the MediaEngine trait)"
            ))
        }
    };

    let settings = WorkerSettings::from_config(&config.media);
    let pool = WorkerPool::build(engine.as_ref(), &settings, config.media.num_workers)
        .await
        .map_err(|e| anyhow::anyhow!("failed to start media workers: {e}"))?;
    info!("Media worker pool started ({} workers)", pool.len());

    // 5. One router for the whole process, from a round-robin worker.
    let router = pool
        .next_worker()
        .create_router(&default_codecs())
        .await
        .map_err(|e| anyhow::anyhow!("failed to create media router: {e}"))?;
    info!("Media router created");

    // 6. Build the session hub; the lobby room exists from here on.
    let hub = SessionHub::new(router, &config.media);
    info!("Session hub initialized, room \"{LOBBY_ROOM}\" ready");

    // 7. Serve
    let app = palaver_api::create_router(hub);
    let listener = tokio::net::TcpListener::bind(config.listen_address()).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Palaver server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
    }
}
