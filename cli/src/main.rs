//! cona-bridge - relays phone notifications into Matrix and replies back.
//!
//! # Startup
//!
//! ```text
//! main() -> BridgeConfig::from_env() -> TitleStore::open() -> Bridge::new()
//!                                                                |
//!                                                                v
//!                                   cona_server::serve() until Ctrl-C / SIGTERM
//! ```
//!
//! Only startup can fail. Once the listener is up, every failure is logged
//! and the process keeps serving.

use std::future::pending;
use std::io::stderr;
use std::sync::Arc;

use anyhow::{Context, Result};
use cona_config::BridgeConfig;
use cona_core::{Bridge, HttpReplySink, ReplySink, TitleStore};
use cona_matrix::{AppserviceClient, ChatNetwork};
use cona_server::AppState;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(stderr))
        .with(env_filter)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};

        match unix_signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = BridgeConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        operator = %config.operator,
        homeserver = %config.homeserver_url,
        domain = %config.domain,
        bot = %config.bot_user_id(),
        reply_url = %config.reply_url,
        "Starting bridge"
    );

    let network: Arc<dyn ChatNetwork> = Arc::new(
        AppserviceClient::new(config.homeserver_url.clone(), config.as_token.clone())
            .context("failed to build homeserver client")?,
    );
    let replies: Arc<dyn ReplySink> = Arc::new(
        HttpReplySink::new(config.reply_url.clone()).context("failed to build reply client")?,
    );
    let store = Arc::new(TitleStore::open(&config.title_map_path));

    let bridge = Bridge::new(&config, network, store, replies);
    let (state, drain) = AppState::for_bridge(&bridge, &config);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    cona_server::serve(listener, state, shutdown_signal())
        .await
        .context("server error")?;

    // Queued replies are dropped, matching the at-most-once delivery of
    // everything else.
    drain.abort();
    tracing::info!("Bridge stopped");
    Ok(())
}
