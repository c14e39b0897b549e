//! Per-conversation generation settings.
//!
//! Persists to `{data_dir}/settings.json` as a map from conversation id to
//! `{ "temperature": .., "topP": .. }`. A missing or unreadable file yields an
//! empty store; write failures are logged and never reach the caller.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 1.0;

/// Generation parameters for one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            temperature: Some(DEFAULT_TEMPERATURE),
            top_p: Some(DEFAULT_TOP_P),
        }
    }
}

impl ChatSettings {
    /// Extra worker arguments carrying these parameters.
    pub fn worker_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(temperature) = self.temperature {
            args.push("--temperature".to_string());
            args.push(temperature.to_string());
        }
        if let Some(top_p) = self.top_p {
            args.push("--top-p".to_string());
            args.push(top_p.to_string());
        }
        args
    }
}

/// In-memory store for chat settings with disk persistence.
#[derive(Debug)]
pub struct ChatSettingsStore {
    settings: RwLock<HashMap<String, ChatSettings>>,
    storage_path: Option<PathBuf>,
}

impl ChatSettingsStore {
    /// Create a store backed by `storage_path`, loading it if present.
    pub fn load(storage_path: &Path) -> Self {
        let settings = if storage_path.exists() {
            match Self::load_from_path(storage_path) {
                Ok(s) => {
                    tracing::info!(
                        "Loaded settings for {} conversations from {}",
                        s.len(),
                        storage_path.display()
                    );
                    s
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to load settings from {}: {}, starting empty",
                        storage_path.display(),
                        e
                    );
                    HashMap::new()
                }
            }
        } else {
            tracing::debug!("No settings file at {}", storage_path.display());
            HashMap::new()
        };

        Self {
            settings: RwLock::new(settings),
            storage_path: Some(storage_path.to_path_buf()),
        }
    }

    /// Create a store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            settings: RwLock::new(HashMap::new()),
            storage_path: None,
        }
    }

    fn load_from_path(path: &Path) -> Result<HashMap<String, ChatSettings>, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    async fn save_to_disk(&self) {
        let Some(path) = self.storage_path.as_ref() else {
            return;
        };
        let contents = {
            let settings = self.settings.read().await;
            serde_json::to_string_pretty(&*settings)
        };
        let result = match contents {
            Ok(contents) => write_file(path, contents).await,
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        };
        match result {
            Ok(()) => tracing::debug!("Saved settings to {}", path.display()),
            Err(e) => tracing::warn!("Failed to save settings to {}: {}", path.display(), e),
        }
    }

    /// Settings stored for a conversation, if any.
    pub async fn get(&self, chat_id: &str) -> Option<ChatSettings> {
        self.settings.read().await.get(chat_id).copied()
    }

    /// Settings for a conversation, falling back to defaults.
    pub async fn get_or_default(&self, chat_id: &str) -> ChatSettings {
        self.get(chat_id).await.unwrap_or_default()
    }

    /// Extra worker arguments for a conversation; empty when nothing is stored.
    pub async fn worker_args(&self, chat_id: &str) -> Vec<String> {
        self.get(chat_id)
            .await
            .map(|s| s.worker_args())
            .unwrap_or_default()
    }

    pub async fn set_temperature(&self, chat_id: &str, value: f64) -> ChatSettings {
        self.modify(chat_id, |s| s.temperature = Some(value)).await
    }

    pub async fn set_top_p(&self, chat_id: &str, value: f64) -> ChatSettings {
        self.modify(chat_id, |s| s.top_p = Some(value)).await
    }

    /// Restore the defaults for a conversation.
    pub async fn reset(&self, chat_id: &str) -> ChatSettings {
        self.modify(chat_id, |s| *s = ChatSettings::default()).await
    }

    async fn modify(&self, chat_id: &str, f: impl FnOnce(&mut ChatSettings)) -> ChatSettings {
        let mut settings = self.settings.write().await;
        let entry = settings.entry(chat_id.to_string()).or_default();
        f(entry);
        let updated = *entry;
        drop(settings); // Release lock before saving
        self.save_to_disk().await;
        updated
    }
}

async fn write_file(path: &Path, contents: String) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await
}

/// Shared settings store wrapped in Arc for concurrent access.
pub type SharedChatSettings = Arc<ChatSettingsStore>;
