//! HTTP API module
//!
//! Thin axum surface over the command/query layers: the OAuth endpoints,
//! the user-facing device approval calls, and health.

pub mod routes;

pub use routes::{create_router, AppState};
