mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use cli::Cli;
use maputnik_desktop::server::{self, Bridge};
use maputnik_desktop::{BridgeConfig, ChangeWatcher, StyleFileAccessor, log_event, logging};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => BridgeConfig::load(path),
        None => BridgeConfig::load_from_dir(&std::env::current_dir()?),
    };
    let (mut config, config_error) = match loaded {
        Ok(config) => (config, None),
        Err(err) => (BridgeConfig::default(), Some(err)),
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.verbose {
        config.logging.default = "debug".to_string();
    }
    logging::init_with_config(&config.logging);
    if let Some(err) = config_error {
        tracing::warn!("[config] {err}. Using defaults.");
    }

    let mut bridge = Bridge {
        static_dir: cli.static_dir,
        ..Bridge::default()
    };
    // Keep alive until shutdown: dropping it releases the filesystem watch.
    let mut watch_handle = None;

    if let Some(file) = &cli.file {
        let path = std::path::absolute(file)
            .with_context(|| format!("cannot resolve {}", file.display()))?;
        println!("{} is accessible via Maputnik", file.display());
        bridge.accessor = Some(Arc::new(StyleFileAccessor::new(path.clone())));

        if cli.watch {
            let watcher = ChangeWatcher::new(path, config.watch.options());
            match watcher.start() {
                Ok(handle) => {
                    log_event!("watcher", "started", "{}", watcher.path().display());
                    watch_handle = Some(handle);
                }
                Err(err) => {
                    tracing::error!("[watcher] failed to start, live reload disabled: {err}");
                }
            }
            bridge.watcher = Some(watcher);
        }
    }

    let watcher = bridge.watcher.clone();
    let app = server::router(bridge, &config);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    println!("Exposing Maputnik on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Closes every websocket so the graceful shutdown can finish.
            if let Some(watcher) = watcher {
                watcher.shutdown();
            }
        })
        .await?;

    drop(watch_handle);
    log_event!("http", "stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("[http] failed to listen for ctrl+c: {err}");
        std::future::pending::<()>().await;
    }
    log_event!("http", "shutting down");
}
