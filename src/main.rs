#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # hostmirror
//!
//! Hands out random subdomains for internal backend services and writes a
//! front-end proxy config file for each one.
//!
//! ## Subcommands
//!
//! - `hostmirror serve` (default): run the provisioning server on every
//!   `server.listen` address
//! - `hostmirror proxy`: run the hostname-rewriting reverse proxy described
//!   by the `[proxy]` section
//!
//! ## Provisioning surface
//!
//! Routes come from `[[handler]]` config sections:
//!
//! | Kind     | Method | Body                                   | Response                 |
//! |----------|--------|----------------------------------------|--------------------------|
//! | `form`   | any    | `host`, `ip`, `port`, `tls`, `header`  | `res_template`           |
//! | `json`   | POST   | `[{host, ip, port, tls, blockedHeaders}]` | `res_template` or stream |
//! | `static` | any    | ignored                                | `res_file`               |
//!
//! Rejected descriptors answer `412` and write nothing. Failures after
//! validation answer `500`. Every error body is one line of text.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hostmirror::config::Config;
use hostmirror::{proxy, routes};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Random-subdomain provisioning with a hostname-rewriting reverse proxy.
#[derive(Parser)]
#[command(name = "hostmirror", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the provisioning server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the rewriting reverse proxy from the `[proxy]` section.
    Proxy {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Proxy { config }) => run_proxy(config.as_deref()).await,
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // tracing may not be initialised yet if the config failed to load
            eprintln!("hostmirror: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

async fn run_server(config_path: Option<&str>) -> Result<(), BoxError> {
    let config = Config::load(config_path)?;
    init_tracing(&config);

    info!("hostmirror v{} starting", env!("CARGO_PKG_VERSION"));

    let handlers = config.handlers()?;
    if handlers.is_empty() {
        return Err("no [[handler]] sections configured".into());
    }
    if config.server.listen.is_empty() {
        return Err("no listen addresses configured".into());
    }
    let app = routes::build_router(handlers, config.server.max_body_bytes)?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let mut servers = JoinSet::new();
    for addr in &config.server.listen {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| format!("unable to bind {addr} - {e}"))?;
        info!("Listening on {addr}");

        let app = app.clone();
        let stop = shutdown.clone();
        servers.spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(stop.cancelled_owned())
            .await
        });
    }

    info!("Server ready");

    while let Some(joined) = servers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("listener failed: {e}");
                shutdown.cancel();
            }
            Err(e) => {
                error!("listener task failed: {e}");
                shutdown.cancel();
            }
        }
    }

    info!("Goodbye");
    Ok(())
}

async fn run_proxy(config_path: Option<&str>) -> Result<(), BoxError> {
    let config = Config::load(config_path)?;
    init_tracing(&config);

    let section = config
        .proxy
        .as_ref()
        .ok_or("no [proxy] section configured")?;

    info!("hostmirror v{} starting proxy", env!("CARGO_PKG_VERSION"));

    let shutdown = CancellationToken::new();
    let rewrite = section.build(shutdown.clone())?;
    info!(
        external = %section.external_host,
        internal = %section.internal_host,
        target = %rewrite.target(),
        "Proxying"
    );
    let app = proxy::router(Arc::new(rewrite));

    let listener = TcpListener::bind(&section.listen)
        .await
        .map_err(|e| format!("unable to bind {} - {e}", section.listen))?;
    info!("Listening on {}", section.listen);

    tokio::spawn(wait_for_signal(shutdown.clone()));

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned())
    .await?;

    info!("Goodbye");
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn wait_for_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("unable to listen for SIGTERM: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
    info!("Shutting down...");
    token.cancel();
}
