/// Connection-quality analytics.
pub mod anomaly;
/// Disconnect path and deferred finalize handling.
pub mod disconnection;
/// OpenAPI document.
pub mod documentation;
/// Health check.
pub mod health_service;
/// Presence facade.
pub mod presence_service;
/// Reconnect path with duplicate suppression.
pub mod reconnection;
/// Transactional connection record writes.
pub mod recorder;
/// Deferred finalize scheduling.
pub mod scheduler;
/// Presence event publishers.
pub mod sse_events;
/// SSE stream plumbing.
pub mod sse_service;
