//! API Router
//!
//! Transport-independent implementation of the hub's JSON contract. The
//! HTTP front and the WebSocket gateway both feed it [`ApiRequest`]s.
//!
//! ```text
//! GET  /health
//! GET  /games                          ?playerId&hubVersion&capability&search
//! GET  /games/{id}
//! GET  /games/{id}/module/{hop}        entry | adapter | adapter-bundle
//! POST /sessions/start                 {gameId}
//! POST /sessions/{id}/finish           {score, timeMs, progress?}
//! GET  /progress/{gameId}/load         ?sessionId
//! POST /progress/{gameId}/save         {sessionId, data, timestamp?}
//! POST /telemetry/batch                {events}
//! GET  /leaderboard/{gameId}           ?period&limit
//! ```

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::core::version::Version;
use crate::hub::host::HostError;
use crate::hub::launch::LaunchError;
use crate::hub::leaderboard::{Period, DEFAULT_LIMIT};
use crate::hub::loader::LoadError;
use crate::hub::manifest::{DiscoveryFilter, RegistryError};
use crate::hub::progress::ProgressError;
use crate::hub::services::HubServices;
use crate::hub::telemetry::TelemetryError;
use crate::network::auth::{identify, AuthConfig, AuthError, Identity};
use crate::network::modules::{render_module, ModuleError, ModuleHop, MODULE_CACHE_CONTROL, MODULE_CONTENT_TYPE};
use crate::network::protocol::{
    ApiRequest, ApiResponse, FinishBody, FinishResponse, HealthBody, IncompatibleBody, Method,
    SaveProgressBody, SaveProgressResponse, StartSessionBody, TelemetryResponse,
};
use crate::{HUB_PROTOCOL_VERSION, VERSION};

/// Header listing version-gated game ids on `GET /games`.
pub const INCOMPATIBLE_HEADER: &str = "X-Incompatible-Games";

// =============================================================================
// ERRORS
// =============================================================================

/// Every failure the API reports, with its status mapping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// Caller must fix the request.
    #[error("{0}")]
    Validation(String),

    /// Caller's bearer token was rejected.
    #[error("{0}")]
    Unauthorized(String),

    /// Nothing at this path.
    #[error("{0}")]
    NotFound(String),

    /// Launch session expired; restart with a new launch.
    #[error("Session expired")]
    SessionExpired,

    /// State conflict, e.g. finishing twice.
    #[error("{0}")]
    Conflict(String),

    /// Game needs a newer hub.
    #[error("Incompatible hub version")]
    IncompatibleHostVersion {
        /// Required version.
        required: Version,
        /// Declared version.
        declared: Version,
    },

    /// A module stage failed. Details are logged, not returned.
    #[error("Failed to load game")]
    ModuleLoadFailure,

    /// Backing store unreachable.
    #[error("{0}")]
    Upstream(String),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// Status code.
    pub fn status(&self) -> u16 {
        match self {
            ApiError::Validation(_) => 400,
            ApiError::Unauthorized(_) => 401,
            ApiError::NotFound(_) => 404,
            ApiError::Conflict(_) | ApiError::IncompatibleHostVersion { .. } => 409,
            ApiError::SessionExpired => 410,
            ApiError::ModuleLoadFailure | ApiError::Upstream(_) => 502,
            ApiError::Internal(_) => 500,
        }
    }

    /// Response with the error body.
    pub fn into_response(self) -> ApiResponse {
        let status = self.status();
        match self {
            ApiError::IncompatibleHostVersion { required, declared } => ApiResponse::json(
                status,
                IncompatibleBody { error: "Incompatible hub version".into(), required, declared },
            ),
            other => ApiResponse::error(status, other.to_string()),
        }
    }
}

impl From<LaunchError> for ApiError {
    fn from(err: LaunchError) -> Self {
        match err {
            LaunchError::NotFound => ApiError::NotFound("Session not found".into()),
            LaunchError::SessionExpired => ApiError::SessionExpired,
            LaunchError::AlreadyFinished => ApiError::Conflict("Session already finished".into()),
            LaunchError::TokenAlreadyUsed => ApiError::Conflict("Launch token already used".into()),
            LaunchError::InvalidToken => ApiError::Unauthorized("Invalid launch token".into()),
            LaunchError::IdExhausted(n) => ApiError::Internal(format!("no unique id after {n} attempts")),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) | RegistryError::Disabled(_) | RegistryError::NotInRollout(_) => {
                ApiError::NotFound("Game not found".into())
            }
            RegistryError::IncompatibleHostVersion { game_id, required, declared } => {
                info!(%game_id, %required, %declared, "launch refused by version gate");
                ApiError::IncompatibleHostVersion { required, declared }
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<LoadError> for ApiError {
    fn from(err: LoadError) -> Self {
        warn!(stage = %err.stage(), error = %err, "game failed to load");
        ApiError::ModuleLoadFailure
    }
}

impl From<ProgressError> for ApiError {
    fn from(err: ProgressError) -> Self {
        match err {
            ProgressError::Validation(msg) => ApiError::Validation(msg),
            ProgressError::SessionExpired => ApiError::SessionExpired,
            ProgressError::Upstream(e) => ApiError::Upstream(e.to_string()),
        }
    }
}

impl From<TelemetryError> for ApiError {
    fn from(err: TelemetryError) -> Self {
        match err {
            TelemetryError::InvalidPayload(msg) => ApiError::Validation(msg),
            TelemetryError::SessionExpired(_) => ApiError::SessionExpired,
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::Unauthorized(err.to_string())
    }
}

impl From<ModuleError> for ApiError {
    fn from(err: ModuleError) -> Self {
        match &err {
            ModuleError::NotModule(_) => ApiError::Validation(err.to_string()),
            ModuleError::UnknownHop(_) => ApiError::NotFound(err.to_string()),
        }
    }
}

impl From<HostError> for ApiError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::Registry(e) => e.into(),
            HostError::Load(e) => e.into(),
            HostError::Launch(e) => e.into(),
            HostError::Container(e) => ApiError::Conflict(e.to_string()),
            HostError::Control(e) => ApiError::Conflict(e.to_string()),
            HostError::NoActiveGame => ApiError::NotFound("No active game".into()),
        }
    }
}

// =============================================================================
// ROUTER
// =============================================================================

/// Allow any origin.
pub fn with_cors(response: ApiResponse) -> ApiResponse {
    response.with_header("Access-Control-Allow-Origin", "*")
}

fn parse_body<T: DeserializeOwned + Default>(request: &ApiRequest) -> Result<T, ApiError> {
    match &request.body {
        None | Some(Value::Null) => Ok(T::default()),
        Some(body) => serde_json::from_value(body.clone()).map_err(|e| {
            debug!(path = %request.path, error = %e, "malformed request body");
            ApiError::Validation("Invalid request body".into())
        }),
    }
}

fn required<T>(value: Option<T>, message: &str) -> Result<T, ApiError> {
    value.ok_or_else(|| ApiError::Validation(message.to_string()))
}

/// Routes API requests to the hub services.
pub struct ApiRouter {
    services: Arc<HubServices>,
    auth: AuthConfig,
}

impl ApiRouter {
    /// Create a router.
    pub fn new(services: Arc<HubServices>, auth: AuthConfig) -> Self {
        Self { services, auth }
    }

    /// Services behind this router.
    pub fn services(&self) -> &Arc<HubServices> {
        &self.services
    }

    /// Handle one request. Never fails: errors become error responses.
    pub async fn handle(&self, request: ApiRequest) -> ApiResponse {
        let mut response = match self.route(&request).await {
            Ok(response) => response,
            Err(err) => {
                if err.status() >= 500 {
                    error!(method = ?request.method, path = %request.path, error = %err, "request failed");
                } else {
                    debug!(method = ?request.method, path = %request.path, status = err.status(), "request rejected");
                }
                err.into_response()
            }
        };
        response.id = request.id;
        with_cors(response)
    }

    async fn route(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        if request.method == Method::Options {
            return Ok(ApiResponse::empty(204)
                .with_header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
                .with_header("Access-Control-Allow-Headers", "Content-Type, Authorization"));
        }

        let segments = request.segments();
        let path: Vec<&str> = segments.iter().map(String::as_str).collect();

        match (request.method, path.as_slice()) {
            (Method::Get, ["health"]) => Ok(self.health()),
            (Method::Get, ["games"]) => self.list_games(request),
            (Method::Get, ["games", game_id]) => self.get_game(game_id),
            (Method::Get, ["games", game_id, "module", hop]) => self.module(game_id, hop),
            (Method::Post, ["sessions", "start"]) => self.start_session(request).await,
            (Method::Post, ["sessions", session_id, "finish"]) => self.finish_session(request, session_id).await,
            (Method::Get, ["progress", game_id, "load"]) => self.load_progress(request, game_id).await,
            (Method::Post, ["progress", game_id, "save"]) => self.save_progress(request, game_id).await,
            (Method::Post, ["telemetry", "batch"]) => self.telemetry(request).await,
            (Method::Get, ["leaderboard", game_id]) => self.leaderboard(request, game_id).await,
            _ => Err(ApiError::NotFound("Not found".into())),
        }
    }

    fn identity(&self, request: &ApiRequest, fallback: Option<&str>) -> Result<Identity, ApiError> {
        Ok(identify(request.header("authorization"), fallback, &self.auth)?)
    }

    fn health(&self) -> ApiResponse {
        ApiResponse::json(200, HealthBody { status: "ok", version: VERSION, protocol: HUB_PROTOCOL_VERSION })
    }

    fn list_games(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let query = request.query();
        let hub_version = query
            .get("hubVersion")
            .map(|v| v.parse::<Version>())
            .transpose()
            .map_err(|e| ApiError::Validation(e.to_string()))?;

        // A verified token outranks a playerId in the query.
        let identity = self.identity(request, query.get("playerId").map(String::as_str))?;
        let player_id = (identity.verified || query.contains_key("playerId")).then_some(identity.player_id);

        let filter = DiscoveryFilter {
            player_id,
            hub_version,
            capability: query.get("capability").cloned(),
            search: query.get("search").cloned(),
        };
        let discovery = self.services.registry.list_games(&filter);

        let mut response = ApiResponse::json(200, &discovery.games);
        if !discovery.incompatible.is_empty() {
            let ids: Vec<&str> = discovery.incompatible.iter().map(|g| g.game_id.as_str()).collect();
            info!(games = ?ids, "games hidden by hub version gate");
            response = response.with_header(INCOMPATIBLE_HEADER, ids.join(","));
        }
        Ok(response)
    }

    fn get_game(&self, game_id: &str) -> Result<ApiResponse, ApiError> {
        match self.services.registry.get(game_id) {
            Some(manifest) if !manifest.disabled => Ok(ApiResponse::json(200, manifest)),
            _ => Err(ApiError::NotFound("Game not found".into())),
        }
    }

    fn module(&self, game_id: &str, hop: &str) -> Result<ApiResponse, ApiError> {
        let manifest = self
            .services
            .registry
            .get(game_id)
            .ok_or_else(|| ApiError::NotFound("Game not found".into()))?;
        let hop: ModuleHop = hop.parse()?;
        let source = render_module(manifest, hop, self.services.loader.config())?;

        let mut response = ApiResponse::empty(200)
            .with_header("Content-Type", MODULE_CONTENT_TYPE)
            .with_header("Cache-Control", MODULE_CACHE_CONTROL);
        response.body = Value::String(source);
        Ok(response)
    }

    async fn start_session(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let body: StartSessionBody = parse_body(request)?;
        let game_id = required(body.game_id.filter(|g| !g.is_empty()), "gameId is required")?;
        let identity = self.identity(request, body.player_id.as_deref())?;

        let manifest = self
            .services
            .registry
            .resolve_launchable(&game_id, &identity.player_id, body.hub_version.as_ref())?;
        // No credential is issued for a game whose module chain cannot load.
        let runtime = self.services.loader.runtime_for(manifest);
        self.services.loader.load(&runtime).await?;
        let credential = self.services.launches.start_session(&manifest.id, &identity.player_id).await?;
        Ok(ApiResponse::json(200, credential))
    }

    async fn finish_session(&self, request: &ApiRequest, session_id: &str) -> Result<ApiResponse, ApiError> {
        let body: FinishBody = parse_body(request)?;
        let score = required(body.score, "score is required")?;
        let time_ms = required(body.time_ms, "timeMs is required")?;
        let identity = self.identity(request, None)?;
        // A token only names the entry of a session its holder owns.
        let owner = self.services.launches.state(session_id).await.map(|s| s.player_id);
        let player_name = (identity.verified && owner.as_deref() == Some(identity.player_id.as_str()))
            .then(|| identity.display_name().to_string());

        let finished = self
            .services
            .finish_session(session_id, score, time_ms, body.progress, player_name.as_deref())
            .await?;
        Ok(ApiResponse::json(
            200,
            FinishResponse {
                success: true,
                session_id: finished.session_id,
                score: finished.score,
                time_ms: finished.time_ms,
            },
        ))
    }

    async fn load_progress(&self, request: &ApiRequest, game_id: &str) -> Result<ApiResponse, ApiError> {
        let query = request.query();
        let session_id = required(query.get("sessionId").filter(|s| !s.is_empty()), "sessionId is required")?;
        match self.services.progress.load(game_id, session_id).await? {
            Some(record) => Ok(ApiResponse::json(200, record)),
            None => Err(ApiError::NotFound("No saved progress found".into())),
        }
    }

    async fn save_progress(&self, request: &ApiRequest, game_id: &str) -> Result<ApiResponse, ApiError> {
        let body: SaveProgressBody = parse_body(request)?;
        let (session_id, data) = match (body.session_id, body.data) {
            (Some(s), Some(d)) if !s.is_empty() && !d.is_null() => (s, d),
            _ => return Err(ApiError::Validation("sessionId and data are required".into())),
        };

        let ack = self.services.progress.save(game_id, &session_id, data, body.timestamp).await?;
        Ok(ApiResponse::json(
            200,
            SaveProgressResponse {
                success: true,
                game_id: ack.game_id,
                session_id: ack.session_id,
                timestamp: ack.timestamp,
            },
        ))
    }

    async fn telemetry(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let events = request
            .body
            .as_ref()
            .and_then(|b| b.get("events"))
            .filter(|e| e.is_array())
            .ok_or_else(|| ApiError::Validation("events must be an array".into()))?;

        let receipt = self.services.telemetry.submit_batch(events).await?;
        Ok(ApiResponse::json(200, TelemetryResponse { success: true, processed: receipt.processed }))
    }

    async fn leaderboard(&self, request: &ApiRequest, game_id: &str) -> Result<ApiResponse, ApiError> {
        let query = request.query();
        let period = match query.get("period") {
            Some(p) => p.parse::<Period>().map_err(|e| ApiError::Validation(e.to_string()))?,
            None => Period::AllTime,
        };
        let limit = match query.get("limit") {
            Some(l) => l
                .parse::<usize>()
                .map_err(|_| ApiError::Validation("limit must be a positive integer".into()))?
                .clamp(1, DEFAULT_LIMIT),
            None => DEFAULT_LIMIT,
        };

        let snapshot = self.services.leaderboard.standings(game_id, period, limit).await;
        Ok(ApiResponse::json(200, snapshot))
    }
}
