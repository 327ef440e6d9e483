use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use huddle::auth::{InsecureValidator, JwtValidator, TokenValidator};
use huddle::config::Config;
use huddle::hub::Hub;
use huddle::server::SignalingServer;

#[tokio::main]
async fn main() -> ExitCode {
    // Config path from the single optional CLI argument, else
    // ./huddle.toml merged with HUDDLE_* environment variables.
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("huddle={}", config.log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let validator: Box<dyn TokenValidator> = match (&config.jwt_secret, config.dev_mode) {
        (Some(secret), _) => Box::new(JwtValidator::new(secret.as_bytes())),
        (None, true) => {
            info!("dev mode without jwt_secret: accepting any token");
            Box::new(InsecureValidator)
        }
        (None, false) => {
            eprintln!("jwt_secret is required unless dev_mode is set");
            return ExitCode::FAILURE;
        }
    };

    // The networked bus and media plane are deployment-provided
    // implementations of the respective traits; without them this is a
    // single-instance, signaling-only server.
    if config.bus_addr.is_some() {
        info!("bus_addr is set but no bus backend is linked in; running single-instance");
    }
    if config.enable_media_plane {
        info!("media plane enabled at {:?}", config.media_plane_addr);
    }

    let hub = Hub::new(config, validator, None, None);
    let server = match SignalingServer::bind(hub.clone()).await {
        Ok(server) => server,
        Err(e) => {
            error!("failed to bind: {e}");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    server.run(shutdown).await;
    hub.shutdown().await;
    ExitCode::SUCCESS
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt()).expect("signal handler");
    let mut terminate = signal(SignalKind::terminate()).expect("signal handler");
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
