//! Configuration management for Enigma Uplink.
//!
//! Configuration can be set via environment variables:
//! - `APP_ROOT` - Optional. Working directory for worker processes. Defaults to current directory.
//! - `DATA_DIR` - Optional. Where mission and settings files live. Defaults to `$APP_ROOT/data`.
//! - `WORKER_BIN` - Optional. Worker executable. Defaults to `gemini`.
//! - `APP_ENV` - Optional. Exported to workers as `NODE_ENV`. Defaults to `development`.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `AUTHORIZED_CHAT_ID` - Optional. Conversation that receives mission telemetry.
//! - `SHADOW_MODE` - Optional. Simulate worker responses instead of spawning. Defaults to `false`.
//! - `REFLECTION_COMMAND` - Optional. Program for the reflection node. Defaults to `node`.
//! - `REFLECTION_SCRIPT` - Optional. Script passed to the reflection program.
//! - `SHUTDOWN_GRACE_SECS` - Optional. Grace window on shutdown. Defaults to `5`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// How the worker CLI is launched.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Executable name or path
    pub program: String,

    /// Value exported as `NODE_ENV`
    pub env_name: String,

    /// Wait after killing a superseded worker before launching its replacement
    pub interrupt_delay: Duration,

    /// Simulate responses instead of spawning
    pub shadow_mode: bool,

    /// Simulated latency in shadow mode
    pub shadow_latency: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "gemini".to_string(),
            env_name: "development".to_string(),
            interrupt_delay: Duration::from_millis(300),
            shadow_mode: false,
            shadow_latency: Duration::from_millis(800),
        }
    }
}

/// Mission blueprint configuration.
#[derive(Debug, Clone)]
pub struct MissionConfig {
    /// Program run by the first node of a reflection blueprint
    pub reflection_command: String,

    /// Script handed to `reflection_command`
    pub reflection_script: String,

    /// Pause before each telemetry burst
    pub telemetry_delay: Duration,
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            reflection_command: "node".to_string(),
            reflection_script: "scripts/generate_reflection.js".to_string(),
            telemetry_delay: Duration::from_millis(500),
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Application root; the working directory of every worker
    pub app_root: PathBuf,

    /// Directory holding `active_mission.json` and `settings.json`
    pub data_dir: PathBuf,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Conversation that receives mission telemetry
    pub authorized_chat_id: Option<String>,

    /// Bounded grace window for overall shutdown
    pub shutdown_grace: Duration,

    pub worker: WorkerConfig,

    pub mission: MissionConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric or boolean variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let app_root = std::env::var("APP_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| app_root.join("data"));

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?;

        let authorized_chat_id = std::env::var("AUTHORIZED_CHAT_ID")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let shadow_mode = std::env::var("SHADOW_MODE")
            .ok()
            .map(|v| {
                parse_bool(&v).map_err(|e| ConfigError::InvalidValue("SHADOW_MODE".to_string(), e))
            })
            .transpose()?
            .unwrap_or(false);

        let shutdown_grace_secs = std::env::var("SHUTDOWN_GRACE_SECS")
            .ok()
            .map(|v| {
                v.parse::<u64>().map_err(|e| {
                    ConfigError::InvalidValue("SHUTDOWN_GRACE_SECS".to_string(), format!("{}", e))
                })
            })
            .transpose()?
            .unwrap_or(5);

        let worker = WorkerConfig {
            program: std::env::var("WORKER_BIN").unwrap_or_else(|_| "gemini".to_string()),
            env_name: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
            shadow_mode,
            ..WorkerConfig::default()
        };

        let defaults = MissionConfig::default();
        let mission = MissionConfig {
            reflection_command: std::env::var("REFLECTION_COMMAND")
                .unwrap_or(defaults.reflection_command),
            reflection_script: std::env::var("REFLECTION_SCRIPT")
                .unwrap_or(defaults.reflection_script),
            telemetry_delay: defaults.telemetry_delay,
        };

        Ok(Self {
            app_root,
            data_dir,
            host,
            port,
            authorized_chat_id,
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
            worker,
            mission,
        })
    }

    /// Create a config rooted at `app_root` with short timings (useful for testing).
    pub fn new(app_root: PathBuf) -> Self {
        Self {
            data_dir: app_root.join("data"),
            app_root,
            host: "127.0.0.1".to_string(),
            port: 3000,
            authorized_chat_id: None,
            shutdown_grace: Duration::from_secs(5),
            worker: WorkerConfig {
                interrupt_delay: Duration::from_millis(20),
                shadow_latency: Duration::from_millis(10),
                ..WorkerConfig::default()
            },
            mission: MissionConfig {
                telemetry_delay: Duration::from_millis(1),
                ..MissionConfig::default()
            },
        }
    }

    pub fn mission_file(&self) -> PathBuf {
        self.data_dir.join("active_mission.json")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Ok(false),
        other => Err(format!("expected boolean-like value, got: {}", other)),
    }
}
