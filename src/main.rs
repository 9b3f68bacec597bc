//! Cauldron - session gateway for BoilingData queries

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cauldron::{
    auth::CognitoProvider,
    config::{Args, LogFormat},
    registry::SessionRegistry,
    server::{self, AppState},
    session::WsConnector,
    signing::UnconfiguredSigner,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("cauldron={},info", args.log_level).into());
    match args.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let session_config = args.session_config();

    info!("======================================");
    info!("  Cauldron - BoilingData session gateway");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Query service: {}", session_config.url);
    info!("Region: {}", args.region);
    info!("Idle timeout: {}s", session_config.idle_timeout.as_secs());
    match session_config.query_timeout {
        Some(timeout) => info!("Query timeout: {}s", timeout.as_secs()),
        None => info!("Query timeout: none"),
    }
    info!("======================================");

    let provider = CognitoProvider::new(
        &args.region,
        args.cognito_client_id.clone().unwrap_or_default(),
    )?;

    // Sessions start unsigned; /connect installs a pre-signed URL per session
    let registry = Arc::new(SessionRegistry::new(
        session_config,
        Arc::new(WsConnector),
        Arc::new(UnconfiguredSigner),
    ));

    let state = Arc::new(AppState::new(args, registry, Arc::new(provider)));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    server::run(state, shutdown).await?;

    info!("Cauldron stopped");
    Ok(())
}
