//! consume-drop server binary.
//!
//! A password-protected upload page that drops documents into a consume
//! directory watched by a document-management system. The entry point
//! validates configuration, builds the Axum router and serves it until a
//! shutdown signal arrives.

mod app;
mod atomic;
mod auth;
mod background;
mod config;
mod error;
mod flash;
mod health;
mod http;
mod logging;
mod pages;
mod rate_limit;
mod storage;
mod upload;

use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

use crate::app::{AppParts, build_router};
use crate::background::spawn_background_tasks;
use crate::config::{Args, Settings};
use crate::rate_limit::RateLimiter;

shadow!(build);

/// Starts the upload server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    // `.env` is optional; real environment variables win.
    let _ = dotenvy::dotenv();
    logging::init_logging();

    let args = Args::parse();
    let settings = match Settings::from_args(args) {
        Ok(settings) => settings,
        Err(err) => {
            error!("invalid configuration: {err}");
            std::process::exit(1);
        }
    };

    let limiter = Arc::new(RateLimiter::new());
    let parts = AppParts::from_settings(&settings, limiter.clone());
    if let Err(err) = parts.consume_dir.ensure_root().await {
        // Uploads retry the directory creation, so startup continues.
        error!(
            folder = %parts.consume_dir.root_path().display(),
            "failed to create upload folder: {err}"
        );
    }
    let app = build_router(parts);

    let addr = SocketAddr::new(settings.host, settings.port);
    let handle = Handle::new();

    info!("🚀 Starting HTTP server at {}", addr);
    info!(
        folder = %settings.upload_folder.display(),
        extensions = %settings.allowed_extensions,
        max_file_size = settings.max_file_size,
        "📂 Uploads go to the consume folder"
    );

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(limiter);
    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
