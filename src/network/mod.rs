//! Network Layer
//!
//! The hub's JSON API: envelopes, routing, auth and the module endpoints,
//! carried over HTTP and a WebSocket gateway. All hub state lives in `hub/`.

pub mod auth;
pub mod http;
pub mod modules;
pub mod protocol;
pub mod routes;
pub mod server;

pub use auth::{identify, validate_token, AuthConfig, AuthError, Identity, TokenClaims};
pub use modules::{render_module, ModuleError, ModuleHop};
pub use protocol::{ApiRequest, ApiResponse, Method};
pub use routes::{ApiError, ApiRouter};
pub use server::{GatewayError, HubServer, ServerConfig};
