//! JSON-file mission store.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::MissionStore;
use crate::mission::types::MissionState;

/// Keeps the active mission in a single pretty-printed JSON file.
#[derive(Debug, Clone)]
pub struct FileMissionStore {
    path: PathBuf,
}

impl FileMissionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn write(&self, state: &MissionState) -> std::io::Result<()> {
        let contents = serde_json::to_string_pretty(state)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so a crash never leaves a half-written mission.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }
}

#[async_trait]
impl MissionStore for FileMissionStore {
    async fn load(&self) -> Option<MissionState> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No mission file at {}", self.path.display());
                return None;
            }
            Err(e) => {
                warn!("Failed to read mission file {}: {}", self.path.display(), e);
                return None;
            }
        };
        match serde_json::from_str::<MissionState>(&contents) {
            Ok(state) => {
                info!(mission_id = %state.blueprint.id, "Active mission recovered from persistence");
                Some(state)
            }
            Err(e) => {
                warn!("Ignoring unreadable mission file {}: {}", self.path.display(), e);
                None
            }
        }
    }

    async fn save(&self, state: &MissionState) {
        if let Err(e) = self.write(state).await {
            warn!(mission_id = %state.blueprint.id, "Failed to save mission state: {}", e);
        }
    }

    async fn clear(&self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!("Removed mission file {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove mission file {}: {}", self.path.display(), e),
        }
    }
}
