//! HTTP + SSE boundary toward the chat transport.
//!
//! Inbound actions (messages, approvals, settings, mission control) are plain
//! JSON endpoints; everything outbound is an [`events::UplinkEvent`] on
//! `GET /api/events`.

pub mod events;
pub mod routes;
pub mod types;

pub use routes::{router, serve, AppState};
