//! The datapull exporter binary.
//!
//! Loads the configuration, serves the scrape surface and reacts to
//! SIGHUP (reload) and SIGTERM/SIGINT (graceful shutdown).

mod cli;
mod handlers;
mod routes;
mod state;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use datapull_config::{Config, SafeConfig};

use crate::cli::Cli;
use crate::routes::create_router;
use crate::state::AppState;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting datapull");

    if cli.config_check {
        match Config::load(&cli.config_file) {
            Ok(_) => {
                info!("config file is ok, exiting...");
                return;
            }
            Err(err) => {
                error!(%err, "error loading config");
                std::process::exit(1);
            }
        }
    }

    let config = match SafeConfig::load(cli.config_file.clone()) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "error loading config");
            std::process::exit(1);
        }
    };
    info!(path = %cli.config_file.display(), "loaded config file");

    spawn_sighup_reloader(config.clone());

    let prefix = cli.normalized_route_prefix();
    let app = create_router(AppState::new(config), &prefix);

    let bind = cli.bind_address();
    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, address = %bind, "error starting HTTP server");
            std::process::exit(1);
        }
    };
    info!(address = %bind, "listening on address");

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(%err, "HTTP server error");
        std::process::exit(1);
    }
    info!("shut down gracefully");
}

fn spawn_sighup_reloader(config: SafeConfig) {
    tokio::spawn(async move {
        let Ok(mut hup) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        else {
            error!("failed to install SIGHUP handler");
            return;
        };
        while hup.recv().await.is_some() {
            match config.reload() {
                Ok(()) => info!("reloaded config file"),
                Err(err) => error!(%err, "error reloading config"),
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(err) => error!(%err, "failed to install SIGTERM handler"),
        }
    };
    tokio::select! {
        () = ctrl_c => info!("received interrupt, exiting gracefully..."),
        () = terminate => info!("received SIGTERM, exiting gracefully..."),
    }
}
