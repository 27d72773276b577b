//! Library crate for presence-keeper, exposing modules for binaries and integration tests.

/// Tunable timings and thresholds.
pub mod config;
/// Persistence of connection records and subjects.
pub mod dao;
/// HTTP and SSE payloads.
pub mod dto;
/// Service and HTTP error types.
pub mod error;
/// Axum routers.
pub mod routes;
/// Presence lifecycle logic.
pub mod services;
/// Shared application state and the connection state machine.
pub mod state;
#[cfg(test)]
mod test_support;
