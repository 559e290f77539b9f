//! Protocol Messages
//!
//! Request/response envelopes carried over the WebSocket gateway, and the
//! JSON bodies of the hub API. Every payload is camelCase JSON.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::version::Version;

// =============================================================================
// ENVELOPES
// =============================================================================

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// Read.
    Get,
    /// Write.
    Post,
    /// CORS preflight.
    Options,
}

/// One API request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    /// Correlation id echoed in the response.
    #[serde(default)]
    pub id: Value,
    /// Request method.
    pub method: Method,
    /// Path with optional query string.
    pub path: String,
    /// Request headers. Names are matched case-insensitively.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// JSON body.
    #[serde(default)]
    pub body: Option<Value>,
}

impl ApiRequest {
    /// `GET path`.
    pub fn get(path: impl Into<String>) -> Self {
        Self { id: Value::Null, method: Method::Get, path: path.into(), headers: BTreeMap::new(), body: None }
    }

    /// `POST path` with a JSON body.
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self { id: Value::Null, method: Method::Post, path: path.into(), headers: BTreeMap::new(), body: Some(body) }
    }

    /// `OPTIONS path`.
    pub fn options(path: impl Into<String>) -> Self {
        Self { id: Value::Null, method: Method::Options, path: path.into(), headers: BTreeMap::new(), body: None }
    }

    /// Add a header.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Decoded path segments, without the query string.
    pub fn segments(&self) -> Vec<String> {
        let path = self.path.split('?').next().unwrap_or_default();
        path.split('/')
            .filter(|s| !s.is_empty())
            .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
            .collect()
    }

    /// Decoded query parameters. Later duplicates win.
    pub fn query(&self) -> BTreeMap<String, String> {
        let Some((_, query)) = self.path.split_once('?') else {
            return BTreeMap::new();
        };
        query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                (decode_component(k), decode_component(v))
            })
            .collect()
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn decode_component(s: &str) -> String {
    percent_decode_str(&s.replace('+', " ")).decode_utf8_lossy().into_owned()
}

/// One API response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    /// Correlation id of the request.
    #[serde(default)]
    pub id: Value,
    /// HTTP-style status code.
    pub status: u16,
    /// Response headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// JSON body, or a string for module sources.
    #[serde(default)]
    pub body: Value,
}

impl ApiResponse {
    /// JSON response.
    pub fn json(status: u16, body: impl Serialize) -> Self {
        let body = serde_json::to_value(body)
            .unwrap_or_else(|e| Value::String(format!("unserializable response: {e}")));
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        Self { id: Value::Null, status, headers, body }
    }

    /// Error response with `{error}` body.
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self::json(status, ErrorBody { error: message.into() })
    }

    /// Empty response.
    pub fn empty(status: u16) -> Self {
        Self { id: Value::Null, status, headers: BTreeMap::new(), body: Value::Null }
    }

    /// Add a header.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    /// Header value by exact name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

// =============================================================================
// REQUEST BODIES
// =============================================================================

/// `POST /sessions/start`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionBody {
    /// Game to launch.
    pub game_id: Option<String>,
    /// Unverified player id, used without a bearer token.
    pub player_id: Option<String>,
    /// Caller's hub protocol version.
    pub hub_version: Option<Version>,
}

/// `POST /sessions/{id}/finish`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishBody {
    /// Final score.
    pub score: Option<i64>,
    /// Play time in milliseconds.
    pub time_ms: Option<u64>,
    /// Progress blob to save alongside.
    #[serde(default)]
    pub progress: Option<Value>,
}

/// `POST /progress/{gameId}/save`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveProgressBody {
    /// Launch session.
    pub session_id: Option<String>,
    /// Opaque data.
    #[serde(default)]
    pub data: Option<Value>,
    /// Save time, defaults to now.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

// =============================================================================
// RESPONSE BODIES
// =============================================================================

/// `{error}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
}

/// Version-gate rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncompatibleBody {
    /// Human-readable message.
    pub error: String,
    /// Hub version the game requires.
    pub required: Version,
    /// Hub version the caller declared.
    pub declared: Version,
}

/// Finish acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishResponse {
    /// Always true.
    pub success: bool,
    /// Session id.
    pub session_id: String,
    /// Recorded score.
    pub score: i64,
    /// Recorded play time.
    pub time_ms: u64,
}

/// Save acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveProgressResponse {
    /// Always true.
    pub success: bool,
    /// Game id.
    pub game_id: String,
    /// Session id.
    pub session_id: String,
    /// Stored timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Telemetry acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TelemetryResponse {
    /// Always true.
    pub success: bool,
    /// Events accepted.
    pub processed: usize,
}

/// `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthBody {
    /// Always `ok`.
    pub status: &'static str,
    /// Crate version.
    pub version: &'static str,
    /// Hub protocol version.
    pub protocol: Version,
}
