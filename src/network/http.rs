//! HTTP Front
//!
//! Serves the [`ApiRouter`] contract over plain HTTP. Each request becomes
//! one [`ApiRequest`] and the router's [`ApiResponse`] goes back with its
//! status and headers. String bodies under a non-JSON content type (module
//! sources) are written verbatim; everything else is JSON.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method as HttpMethod, StatusCode, Uri};
use axum::response::Response;
use axum::Router;
use serde_json::Value;
use tracing::{debug, warn};

use crate::network::protocol::{ApiRequest, ApiResponse, Method};
use crate::network::routes::{with_cors, ApiRouter};

const JSON_CONTENT_TYPE: &str = "application/json";
const ALLOWED_METHODS: &str = "GET, POST, OPTIONS";

/// HTTP application over a router. Every path falls through to the router.
pub fn app(router: Arc<ApiRouter>) -> Router {
    Router::new().fallback(dispatch).with_state(router)
}

async fn dispatch(
    State(router): State<Arc<ApiRouter>>,
    method: HttpMethod,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(method) = api_method(&method) else {
        debug!(%method, path = %uri.path(), "method not allowed");
        let mut response = into_http(with_cors(ApiResponse::error(405, "Method not allowed")));
        response.headers_mut().insert(header::ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
        return response;
    };

    let body = match json_body(&body) {
        Ok(body) => body,
        Err(e) => {
            debug!(path = %uri.path(), error = %e, "unparseable request body");
            return into_http(with_cors(ApiResponse::error(400, "Invalid JSON body")));
        }
    };

    let request = ApiRequest {
        id: Value::Null,
        method,
        path: uri.path_and_query().map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string()),
        headers: header_map(&headers),
        body,
    };
    into_http(router.handle(request).await)
}

fn api_method(method: &HttpMethod) -> Option<Method> {
    if *method == HttpMethod::GET {
        Some(Method::Get)
    } else if *method == HttpMethod::POST {
        Some(Method::Post)
    } else if *method == HttpMethod::OPTIONS {
        Some(Method::Options)
    } else {
        None
    }
}

/// Blank bodies read as absent.
fn json_body(raw: &[u8]) -> Result<Option<Value>, serde_json::Error> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(raw).map(Some)
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect()
}

fn into_http(api: ApiResponse) -> Response {
    let ApiResponse { status, headers, body, .. } = api;
    let content_type = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        .map(|(_, v)| v.as_str());

    let (body, json) = match (body, content_type) {
        (Value::Null, None) => (Body::empty(), false),
        (Value::String(text), Some(ct)) if ct != JSON_CONTENT_TYPE => (Body::from(text), false),
        (value, _) => match serde_json::to_vec(&value) {
            Ok(bytes) => (Body::from(bytes), true),
            Err(e) => {
                warn!(error = %e, "response body not encodable");
                (Body::empty(), false)
            }
        },
    };

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    for (name, value) in &headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => warn!(header = %name, "dropping unrepresentable header"),
        }
    }
    if json && !response.headers().contains_key(header::CONTENT_TYPE) {
        response.headers_mut().insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::hub::launch::LaunchConfig;
    use crate::hub::loader::{FetchFuture, HttpModuleFetcher, LoaderConfig, ModuleFetcher, ModuleLoader, StaticModuleFetcher};
    use crate::hub::manifest::tests::manifest;
    use crate::hub::manifest::{ManifestRegistry, RuntimeKind};
    use crate::hub::services::tests::services;
    use crate::hub::services::HubServices;
    use crate::network::auth::AuthConfig;
    use crate::network::modules::{DEFAULT_UI_RUNTIME_URL, MODULE_CACHE_CONTROL, MODULE_CONTENT_TYPE};
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        (listener, base)
    }

    fn spawn_front(listener: TcpListener, router: ApiRouter) {
        tokio::spawn(async move { axum::serve(listener, app(Arc::new(router))).await });
    }

    /// Hub URLs go over HTTP, everything else is served from memory.
    struct SplitFetcher {
        hub: String,
        http: HttpModuleFetcher,
        rest: StaticModuleFetcher,
    }

    impl ModuleFetcher for SplitFetcher {
        fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a> {
            if url.starts_with(&self.hub) {
                self.http.fetch(url)
            } else {
                self.rest.fetch(url)
            }
        }
    }

    #[tokio::test]
    async fn test_json_api_over_http() {
        let (listener, base) = listen().await;
        let (hub, _) = services();
        spawn_front(listener, ApiRouter::new(Arc::new(hub), AuthConfig::default()));
        let client = reqwest::Client::new();

        let games = client.get(format!("{base}/games")).send().await.unwrap();
        assert_eq!(games.status(), 200);
        assert_eq!(games.headers()["content-type"], JSON_CONTENT_TYPE);
        assert_eq!(games.headers()["access-control-allow-origin"], "*");
        let body: Value = games.json().await.unwrap();
        assert_eq!(body.as_array().unwrap().len(), 2);

        let start = client
            .post(format!("{base}/sessions/start"))
            .json(&json!({"gameId": "math-blitz", "playerId": "p1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(start.status(), 200);
        let credential: Value = start.json().await.unwrap();
        assert_eq!(credential["playerId"], json!("p1"));
        assert!(credential["launchToken"].is_string());

        let missing = client.get(format!("{base}/progress/math-blitz/load?sessionId=nobody")).send().await.unwrap();
        assert_eq!(missing.status(), 404);
        assert_eq!(missing.json::<Value>().await.unwrap(), json!({"error": "No saved progress found"}));
    }

    #[tokio::test]
    async fn test_protocol_edges_over_http() {
        let (listener, base) = listen().await;
        let (hub, _) = services();
        spawn_front(listener, ApiRouter::new(Arc::new(hub), AuthConfig::default()));
        let client = reqwest::Client::new();

        let garbled = client
            .post(format!("{base}/sessions/start"))
            .header("content-type", JSON_CONTENT_TYPE)
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(garbled.status(), 400);
        assert_eq!(garbled.headers()["access-control-allow-origin"], "*");

        let preflight = client.request(HttpMethod::OPTIONS, format!("{base}/telemetry/batch")).send().await.unwrap();
        assert_eq!(preflight.status(), 204);
        assert_eq!(preflight.headers()["access-control-allow-methods"], ALLOWED_METHODS);
        assert!(preflight.bytes().await.unwrap().is_empty());

        let put = client.put(format!("{base}/games")).send().await.unwrap();
        assert_eq!(put.status(), 405);
        assert_eq!(put.headers()["allow"], ALLOWED_METHODS);
    }

    #[tokio::test]
    async fn test_module_hops_are_raw_javascript() {
        let (listener, base) = listen().await;
        let mut blitz = manifest("math-blitz");
        blitz.runtime = RuntimeKind::EsmModule;
        let hub = HubServices::new(
            ManifestRegistry::new(vec![blitz]).unwrap(),
            ModuleLoader::new(Arc::new(StaticModuleFetcher::new()), LoaderConfig { public_url: base.clone(), ..Default::default() }),
            LaunchConfig::default(),
            Arc::new(ManualClock::starting_now()),
        );
        spawn_front(listener, ApiRouter::new(Arc::new(hub), AuthConfig::default()));

        let entry = reqwest::get(format!("{base}/games/math-blitz/module/entry")).await.unwrap();
        assert_eq!(entry.status(), 200);
        assert_eq!(entry.headers()["content-type"], MODULE_CONTENT_TYPE);
        assert_eq!(entry.headers()["cache-control"], MODULE_CACHE_CONTROL);
        let source = entry.text().await.unwrap();
        assert!(source.starts_with("export * from "));
        assert!(source.contains(&format!("{base}/games/math-blitz/module/adapter")));
    }

    #[tokio::test]
    async fn test_start_resolves_own_module_chain_over_http() {
        let (listener, base) = listen().await;
        let mut blitz = manifest("math-blitz");
        blitz.runtime = RuntimeKind::EsmModule;
        let fetcher = SplitFetcher {
            hub: base.clone(),
            http: HttpModuleFetcher::new(reqwest::Client::new()),
            rest: StaticModuleFetcher::new().with_module(DEFAULT_UI_RUNTIME_URL, "export const h = () => {};"),
        };
        let hub = HubServices::new(
            ManifestRegistry::new(vec![blitz]).unwrap(),
            ModuleLoader::new(Arc::new(fetcher), LoaderConfig { public_url: base.clone(), ..Default::default() }),
            LaunchConfig::default(),
            Arc::new(ManualClock::starting_now()),
        );
        let hub = Arc::new(hub);
        spawn_front(listener, ApiRouter::new(hub.clone(), AuthConfig::default()));

        let start = reqwest::Client::new()
            .post(format!("{base}/sessions/start"))
            .json(&json!({"gameId": "math-blitz"}))
            .send()
            .await
            .unwrap();
        assert_eq!(start.status(), 200);
        assert_eq!(hub.launches.count().await, 1);
    }
}
