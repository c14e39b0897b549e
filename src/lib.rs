//! # Enigma Uplink
//!
//! A chat-driven supervisor for an external command-line agent.
//!
//! This library provides:
//! - A per-conversation process supervisor with an interactive approval
//!   handshake and a resume-failure retry
//! - Mission blueprints: persisted multi-step plans executed node by node
//!   with progress telemetry
//! - An HTTP + SSE API that a chat transport drives
//!
//! ## Example
//!
//! ```rust,ignore
//! use enigma_uplink::{api, config::Config};
//!
//! let config = Config::from_env()?;
//! api::serve(config).await?;
//! ```

pub mod api;
pub mod config;
pub mod mission;
pub mod settings;
pub mod supervisor;

pub use config::Config;
