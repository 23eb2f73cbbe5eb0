//! HTTP route handlers.
//!
//! The worker's real traffic is the WebSocket at `/` (see [`crate::ws`]); the
//! only plain HTTP endpoint is the health check.

pub mod health;
