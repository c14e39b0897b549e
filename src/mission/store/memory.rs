//! In-memory mission store (non-persistent).

use super::MissionStore;
use crate::mission::types::MissionState;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct InMemoryMissionStore {
    mission: Arc<RwLock<Option<MissionState>>>,
}

impl InMemoryMissionStore {
    pub fn new() -> Self {
        Self {
            mission: Arc::new(RwLock::new(None)),
        }
    }
}

impl Default for InMemoryMissionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MissionStore for InMemoryMissionStore {
    async fn load(&self) -> Option<MissionState> {
        self.mission.read().await.clone()
    }

    async fn save(&self, state: &MissionState) {
        *self.mission.write().await = Some(state.clone());
    }

    async fn clear(&self) {
        self.mission.write().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mission::types::{MissionBlueprint, MissionPhase};

    #[tokio::test]
    async fn save_load_clear() {
        let store = InMemoryMissionStore::new();
        assert!(store.load().await.is_none());

        let state = MissionState {
            state: MissionPhase::Staging,
            blueprint: MissionBlueprint::technical("Improve Core"),
        };
        store.save(&state).await;
        assert_eq!(store.load().await, Some(state));

        store.clear().await;
        store.clear().await;
        assert!(store.load().await.is_none());
    }
}
