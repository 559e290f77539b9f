//! Game Hub Server
//!
//! Serves the hub API over HTTP and a WebSocket gateway. Configuration comes from
//! the environment; see `ServerConfig`, `LoaderConfig`, `LaunchConfig` and
//! `AuthConfig`.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use game_hub::hub::launch::LaunchConfig;
use game_hub::hub::loader::{HttpModuleFetcher, LoaderConfig, ModuleLoader};
use game_hub::network::auth::AuthConfig;
use game_hub::{
    ApiRouter, HubServer, HubServices, ManifestRegistry, ServerConfig, SharedClock, SystemClock,
    HUB_PROTOCOL_VERSION, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(version = VERSION, protocol = %HUB_PROTOCOL_VERSION, "Game Hub server starting");

    let server_config = ServerConfig::from_env();
    let loader_config = LoaderConfig::from_env();
    let launch_config = LaunchConfig::from_env();
    let auth_config = AuthConfig::from_env();

    let registry = match &server_config.manifests_path {
        Some(path) => ManifestRegistry::load(path)
            .with_context(|| format!("loading manifests from {}", path.display()))?,
        None => {
            warn!("HUB_MANIFESTS not set, serving an empty catalog");
            ManifestRegistry::new(Vec::new())?
        }
    };
    info!(games = registry.len(), "manifest catalog loaded");

    if !auth_config.is_configured() {
        warn!("no auth configured, every caller is a guest");
    }

    let client = reqwest::Client::builder()
        .timeout(loader_config.stage_timeout)
        .build()
        .context("building module fetch client")?;
    let loader = ModuleLoader::new(Arc::new(HttpModuleFetcher::new(client)), loader_config);

    let clock: SharedClock = Arc::new(SystemClock);
    let services = HubServices::new(registry, loader, launch_config, clock);
    let server = Arc::new(HubServer::new(
        server_config,
        ApiRouter::new(Arc::new(services), auth_config),
    ));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received");
            signal_server.shutdown();
        }
    });

    server.run().await.context("server failed")?;
    info!("Game Hub server stopped");
    Ok(())
}
