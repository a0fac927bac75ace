//! Axum HTTP API server.
//!
//! This crate provides:
//! - `POST /api/v1/merge`, guarded by a shared `X-API-Key`
//! - Liveness and readiness probes
//! - Rate limiting, CORS and security headers
//! - Prometheus metrics

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
