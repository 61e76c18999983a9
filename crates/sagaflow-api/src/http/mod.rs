//! HTTP/REST API layer for Sagaflow.
//!
//! Axum-based REST API at `/api/v1/` with envelope responses, CORS, and a
//! Server-Sent Events feed of engine events.

pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
