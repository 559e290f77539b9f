//! Hub Server
//!
//! Two listeners over one [`ApiRouter`]: the HTTP front (see
//! [`crate::network::http`]) and a WebSocket gateway carrying API envelopes.
//! Each text frame is one [`ApiRequest`]; the matching [`ApiResponse`]
//! echoes its `id`, so clients may pipeline requests on one connection.
//!
//! A background loop sweeps expired launch sessions.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::hub::launch::LaunchManager;
use crate::network::http;
use crate::network::protocol::{ApiRequest, ApiResponse};
use crate::network::routes::ApiRouter;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP bind address. Module URLs under `HUB_PUBLIC_URL` must reach it.
    pub bind_addr: SocketAddr,
    /// WebSocket gateway bind address.
    pub ws_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Connections silent for this long are closed.
    pub idle_timeout: Duration,
    /// How often expired launch sessions are swept.
    pub sweep_interval: Duration,
    /// Manifest catalog file.
    pub manifests_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            ws_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            manifests_path: None,
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |name: &str| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
        };
        Self {
            bind_addr: std::env::var("HUB_BIND_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bind_addr),
            ws_addr: std::env::var("HUB_WS_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.ws_addr),
            max_connections: std::env::var("HUB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            idle_timeout: secs("HUB_IDLE_TIMEOUT_SECS").unwrap_or(defaults.idle_timeout),
            sweep_interval: secs("HUB_SWEEP_INTERVAL_SECS").unwrap_or(defaults.sweep_interval),
            manifests_path: std::env::var("HUB_MANIFESTS").ok().map(PathBuf::from),
        }
    }
}

/// Gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// HTTP front stopped with an I/O error.
    #[error("HTTP front failed: {0}")]
    Http(std::io::Error),
}

// =============================================================================
// SERVER
// =============================================================================

/// Connected client state.
struct ConnectedClient {
    connected_at: Instant,
    requests: u64,
}

/// The API gateway.
pub struct HubServer {
    config: ServerConfig,
    router: Arc<ApiRouter>,
    clients: Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl HubServer {
    /// Create a new gateway.
    pub fn new(config: ServerConfig, router: ApiRouter) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            router: Arc::new(router),
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Bind both configured addresses and serve until shutdown.
    #[instrument(skip(self), fields(http = %self.config.bind_addr, ws = %self.config.ws_addr))]
    pub async fn run(&self) -> Result<(), GatewayError> {
        let http_listener = TcpListener::bind(&self.config.bind_addr).await?;
        let ws_listener = TcpListener::bind(&self.config.ws_addr).await?;

        let launches = self.router.services().launches.clone();
        let sweep_every = self.config.sweep_interval;
        let sweep_handle = tokio::spawn(async move {
            Self::run_sweep_loop(launches, sweep_every).await;
        });

        let result = tokio::try_join!(self.serve_http(http_listener), self.serve_ws(ws_listener));
        sweep_handle.abort();
        result.map(|_| ())
    }

    /// Serve the HTTP front on an already-bound listener until shutdown.
    pub async fn serve_http(&self, listener: TcpListener) -> Result<(), GatewayError> {
        info!(addr = %listener.local_addr()?, "HTTP front listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, http::app(self.router.clone()))
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
            .map_err(GatewayError::Http)
    }

    /// Serve the WebSocket gateway on an already-bound listener until shutdown.
    pub async fn serve_ws(&self, listener: TcpListener) -> Result<(), GatewayError> {
        info!(addr = %listener.local_addr()?, "WebSocket gateway listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!(%addr, limit = self.config.max_connections, "connection limit reached, rejecting");
                                continue;
                            }

                            debug!(%addr, "new connection");
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!(error = %e, "accept error");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let router = self.router.clone();
        let idle_timeout = self.config.idle_timeout;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(%addr, error = %e, "WebSocket handshake failed");
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ApiResponse>(64);

            clients
                .write()
                .await
                .insert(addr, ConnectedClient { connected_at: Instant::now(), requests: 0 });

            let sender_task = tokio::spawn(async move {
                while let Some(response) = msg_rx.recv().await {
                    let text = match response.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!(error = %e, "failed to serialize response");
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            loop {
                tokio::select! {
                    msg = tokio::time::timeout(idle_timeout, ws_receiver.next()) => {
                        match msg {
                            Ok(Some(Ok(Message::Text(text)))) => {
                                let request = match ApiRequest::from_json(&text) {
                                    Ok(r) => r,
                                    Err(e) => {
                                        debug!(%addr, error = %e, "invalid request envelope");
                                        let _ = msg_tx.send(ApiResponse::error(400, "Invalid request envelope")).await;
                                        continue;
                                    }
                                };

                                if let Some(client) = clients.write().await.get_mut(&addr) {
                                    client.requests += 1;
                                }

                                let router = router.clone();
                                let reply = msg_tx.clone();
                                tokio::spawn(async move {
                                    let response = router.handle(request).await;
                                    let _ = reply.send(response).await;
                                });
                            }
                            Ok(Some(Ok(Message::Binary(_)))) => {
                                let _ = msg_tx.send(ApiResponse::error(400, "Binary frames are not supported")).await;
                            }
                            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                                debug!(%addr, "client disconnected");
                                break;
                            }
                            Ok(Some(Err(e))) => {
                                warn!(%addr, error = %e, "WebSocket error");
                                break;
                            }
                            Ok(Some(Ok(_))) => {}
                            Err(_) => {
                                debug!(%addr, "idle connection closed");
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            drop(msg_tx);
            sender_task.abort();

            if let Some(client) = clients.write().await.remove(&addr) {
                debug!(
                    %addr,
                    requests = client.requests,
                    connected_secs = client.connected_at.elapsed().as_secs(),
                    "client cleaned up"
                );
            }
        });
    }

    /// Expire and purge launch sessions on a fixed interval.
    async fn run_sweep_loop(launches: Arc<LaunchManager>, every: Duration) {
        let mut interval = interval(every);

        loop {
            interval.tick().await;
            let report = launches.sweep().await;
            if report.expired > 0 || report.purged > 0 || report.forgotten > 0 {
                info!(
                    expired = report.expired,
                    purged = report.purged,
                    forgotten = report.forgotten,
                    "launch sessions swept"
                );
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::services::tests::services;
    use crate::network::auth::AuthConfig;
    use serde_json::json;
    use tokio_tungstenite::connect_async;

    fn server() -> HubServer {
        let (hub, _) = services();
        HubServer::new(ServerConfig::default(), ApiRouter::new(Arc::new(hub), AuthConfig::default()))
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.ws_addr.port(), 8081);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_server_creation() {
        assert_eq!(server().connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_envelopes_over_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(server());
        let serving = server.clone();
        let handle = tokio::spawn(async move { serving.serve_ws(listener).await });

        let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();

        let mut request = ApiRequest::post("/sessions/start", json!({"gameId": "math-blitz"}));
        request.id = json!(1);
        ws.send(Message::Text(request.to_json().unwrap())).await.unwrap();

        let reply = loop {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                break ApiResponse::from_json(&text).unwrap();
            }
        };
        assert_eq!(reply.id, json!(1));
        assert_eq!(reply.status, 200);
        assert!(reply.body["launchToken"].is_string());

        ws.send(Message::Text("not json".into())).await.unwrap();
        let reply = loop {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                break ApiResponse::from_json(&text).unwrap();
            }
        };
        assert_eq!(reply.status, 400);

        server.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_http_front_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(server());
        let serving = server.clone();
        let handle = tokio::spawn(async move { serving.serve_http(listener).await });

        let health = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        assert_eq!(health.status(), 200);
        let body: serde_json::Value = health.json().await.unwrap();
        assert_eq!(body["status"], json!("ok"));

        server.shutdown();
        handle.await.unwrap().unwrap();
    }
}
