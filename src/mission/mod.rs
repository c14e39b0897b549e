//! Mission blueprints: planning, sequential node execution, persistence
//! and progress reporting.

pub mod executor;
pub mod reflection;
pub mod runner;
pub mod store;
pub mod telemetry;
pub mod types;

pub use executor::{NodeExecutor, NodeFailure, ProcessNodeExecutor};
pub use reflection::{Reflection, ReflectionBuffer, ReflectionPublisher};
pub use runner::{MissionError, MissionRun, MissionRunner};
pub use store::{FileMissionStore, InMemoryMissionStore, MissionStore};
pub use telemetry::{format_blueprint, TelemetryBurst, TelemetrySink};
pub use types::{MissionBlueprint, MissionPhase, MissionState};
