//! HTTP gateway for Thinkgate.
//!
//! Exposes the thinking engine as `POST /api/v1/chat` (JSON or server-sent
//! events), key administration under `/api/v1/keys`, and the operational
//! health endpoints `/health`, `/ready`, `/startup` and `/metrics`. Every `/api` route
//! and `/metrics` require a bearer API key; requests are rate limited per key.

/// Chat endpoint.
pub mod chat;
/// HTTP error mapping.
pub mod error;
/// Key administration endpoints.
pub mod keys;
/// Auth, rate limiting and scope checks.
pub mod middleware;
/// Router and shared state.
pub mod server;
/// Health endpoints and metrics.
pub mod status;

pub use chat::{ChatRequest, ChatResponse};
pub use error::ApiError;
pub use server::{AppState, GatewayServer};
