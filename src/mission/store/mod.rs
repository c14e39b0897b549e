//! Mission persistence.
//!
//! At most one mission exists at a time. Backends never surface I/O errors:
//! a failed read is "no mission", a failed write is logged and dropped.

mod file;
mod memory;

pub use file::FileMissionStore;
pub use memory::InMemoryMissionStore;

use async_trait::async_trait;

use super::types::MissionState;

#[async_trait]
pub trait MissionStore: Send + Sync {
    /// The stored mission, or `None` if absent or unreadable.
    async fn load(&self) -> Option<MissionState>;

    /// Replace the stored mission.
    async fn save(&self, state: &MissionState);

    /// Delete the stored mission. Clearing an empty store is a no-op.
    async fn clear(&self);
}
