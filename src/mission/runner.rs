//! Mission runner - sequences a blueprint's nodes.
//!
//! Lifecycle: `plan()` enters STAGING, `start()` enters ACTIVE, and a run
//! ends either by completing every node (final report, then the mission is
//! deleted) or by `clear()`. A failing node stops the run and leaves the
//! mission ACTIVE with that node still STAGED; the next explicit `start()`
//! picks up from it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use super::executor::NodeExecutor;
use super::reflection::{harvest_reflection, Reflection, ReflectionBuffer};
use super::store::MissionStore;
use super::telemetry::{
    TelemetryBurst, TelemetrySink, ACTION_EXECUTION_FAILURE, ACTION_EXECUTION_SUCCESS,
    ACTION_INTERNAL_SYNC, INTEGRITY_ERROR, INTEGRITY_OK,
};
use super::types::{
    parse_reflection_directive, BlueprintType, MissionBlueprint, MissionPhase, MissionState,
    NodeStatus,
};
use crate::config::MissionConfig;

#[derive(Debug, Error)]
pub enum MissionError {
    #[error("No active mission")]
    NoActiveMission,

    #[error("Mission is already running")]
    AlreadyRunning,

    #[error("Mission was cleared while running")]
    Aborted,

    #[error("Mission failed at node {node_id} (code {code:?}): {stderr}")]
    NodeFailed {
        node_id: u32,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Reflection output could not be parsed: {0}")]
    ReflectionParse(String),
}

/// Resets the running flag however the run ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A claimed run that has not started yet. Holding one keeps every other
/// `start` out; dropping it without running releases the claim.
pub struct MissionRun {
    runner: Arc<MissionRunner>,
}

impl MissionRun {
    pub async fn run(self) -> Result<MissionBlueprint, MissionError> {
        self.runner.run_nodes().await
    }
}

impl Drop for MissionRun {
    fn drop(&mut self) {
        self.runner.running.store(false, Ordering::SeqCst);
    }
}

pub struct MissionRunner {
    store: Arc<dyn MissionStore>,
    executor: Arc<dyn NodeExecutor>,
    telemetry: Arc<dyn TelemetrySink>,
    reflections: Arc<ReflectionBuffer>,
    config: MissionConfig,
    active: Mutex<Option<MissionState>>,
    /// Bumped whenever the mission is replaced or cleared, so a run can tell
    /// that the mission it was executing no longer exists.
    epoch: AtomicU64,
    running: AtomicBool,
}

impl MissionRunner {
    pub fn new(
        store: Arc<dyn MissionStore>,
        executor: Arc<dyn NodeExecutor>,
        telemetry: Arc<dyn TelemetrySink>,
        reflections: Arc<ReflectionBuffer>,
        config: MissionConfig,
    ) -> Self {
        Self {
            store,
            executor,
            telemetry,
            reflections,
            config,
            active: Mutex::new(None),
            epoch: AtomicU64::new(0),
            running: AtomicBool::new(false),
        }
    }

    pub fn reflections(&self) -> &Arc<ReflectionBuffer> {
        &self.reflections
    }

    /// Load whatever mission the store holds. An ACTIVE mission is not
    /// resumed automatically.
    pub async fn restore(&self) -> Option<MissionState> {
        let loaded = self.store.load().await;
        let mut active = self.active.lock().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        *active = loaded.clone();
        if let Some(state) = &loaded {
            if state.state == MissionPhase::Active {
                let done = state.blueprint.nodes.iter().filter(|n| n.is_completed()).count();
                warn!(
                    mission_id = %state.blueprint.id,
                    completed = done,
                    total = state.blueprint.nodes.len(),
                    "Recovered an interrupted mission; start it again to resume"
                );
            }
        }
        loaded
    }

    pub async fn current(&self) -> Option<MissionState> {
        self.active.lock().await.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Build and persist a blueprint for `objective`, replacing any staged mission.
    pub async fn plan(&self, objective: &str) -> Result<MissionBlueprint, MissionError> {
        if self.is_running() {
            return Err(MissionError::AlreadyRunning);
        }
        info!(objective = %objective, "Planning new mission");

        let blueprint = match parse_reflection_directive(objective) {
            Some(params) => MissionBlueprint::reflection(
                objective,
                params,
                &self.config.reflection_command,
                &self.config.reflection_script,
            ),
            None => MissionBlueprint::technical(objective),
        };
        let state = MissionState {
            state: MissionPhase::Staging,
            blueprint: blueprint.clone(),
        };

        let mut active = self.active.lock().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.store.save(&state).await;
        *active = Some(state);
        Ok(blueprint)
    }

    /// Execute the remaining nodes in order. Completed nodes are skipped.
    pub async fn start(&self) -> Result<MissionBlueprint, MissionError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MissionError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.running);
        self.run_nodes().await
    }

    /// Claim the run now and execute it later, e.g. on a background task.
    pub fn try_begin(self: &Arc<Self>) -> Result<MissionRun, MissionError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MissionError::AlreadyRunning);
        }
        Ok(MissionRun {
            runner: Arc::clone(self),
        })
    }

    async fn run_nodes(&self) -> Result<MissionBlueprint, MissionError> {
        let (epoch, blueprint) = {
            let mut active = self.active.lock().await;
            let state = active.as_mut().ok_or(MissionError::NoActiveMission)?;
            state.state = MissionPhase::Active;
            self.store.save(state).await;
            (self.epoch.load(Ordering::SeqCst), state.blueprint.clone())
        };
        info!(mission_id = %blueprint.id, kind = ?blueprint.kind, "Mission started");

        for node in blueprint.nodes.iter().filter(|n| !n.is_completed()) {
            let burst = match &node.command {
                Some(command) => {
                    let args = node.args.clone().unwrap_or_default();
                    let result = self.executor.execute(node.id, command, &args).await;
                    drop(self.current_guard(epoch).await?);
                    let stdout = match result {
                        Ok(stdout) => stdout,
                        Err(failure) => {
                            error!(mission_id = %blueprint.id, node_id = node.id, "Mission failed at node");
                            self.emit(TelemetryBurst::new(
                                node.id,
                                ACTION_EXECUTION_FAILURE,
                                format!("Error: {}", failure.stderr),
                                INTEGRITY_ERROR,
                            ))
                            .await;
                            return Err(MissionError::NodeFailed {
                                node_id: node.id,
                                code: failure.code,
                                stderr: failure.stderr,
                            });
                        }
                    };
                    let reflection = if blueprint.kind == BlueprintType::Reflection && node.id == 1 {
                        let reflection = harvest_reflection(&stdout).map_err(|e| {
                            error!(mission_id = %blueprint.id, "Reflection harvest failed: {}", e);
                            MissionError::ReflectionParse(e.to_string())
                        })?;
                        Some(reflection)
                    } else {
                        None
                    };
                    self.complete_node(epoch, node.id, reflection).await?;
                    TelemetryBurst::new(
                        node.id,
                        ACTION_EXECUTION_SUCCESS,
                        format!("Command finished: {}", command),
                        INTEGRITY_OK,
                    )
                }
                None => {
                    self.complete_node(epoch, node.id, None).await?;
                    TelemetryBurst::new(node.id, ACTION_INTERNAL_SYNC, node.task.clone(), INTEGRITY_OK)
                }
            };
            self.emit(burst).await;
        }

        self.finish(Some(epoch)).await
    }

    /// Emit the completion summary and delete the mission.
    pub async fn report_final_status(&self) -> Result<MissionBlueprint, MissionError> {
        self.finish(None).await
    }

    /// Delete the mission whatever its state. Returns whether one existed.
    pub async fn clear(&self) -> bool {
        let mut active = self.active.lock().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let existed = active.take();
        self.store.clear().await;
        if let Some(state) = &existed {
            info!(mission_id = %state.blueprint.id, "Mission cleared");
        }
        existed.is_some()
    }

    /// Lock the active mission, failing if it is not the one this run started with.
    async fn current_guard(&self, epoch: u64) -> Result<MutexGuard<'_, Option<MissionState>>, MissionError> {
        let active = self.active.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch || active.is_none() {
            info!("Mission run aborted");
            return Err(MissionError::Aborted);
        }
        Ok(active)
    }

    /// Mark a node COMPLETED and persist it. A harvested reflection is staged
    /// under the same lock, so a concurrent `clear()` drops both or neither.
    async fn complete_node(
        &self,
        epoch: u64,
        node_id: u32,
        reflection: Option<Reflection>,
    ) -> Result<(), MissionError> {
        let mut active = self.current_guard(epoch).await?;
        let state = active.as_mut().ok_or(MissionError::Aborted)?;
        if let Some(node) = state.blueprint.nodes.iter_mut().find(|n| n.id == node_id) {
            node.status = NodeStatus::Completed;
        }
        self.store.save(state).await;
        if let Some(reflection) = reflection {
            self.reflections.stage(reflection).await;
        }
        Ok(())
    }

    async fn emit(&self, burst: TelemetryBurst) {
        tokio::time::sleep(self.config.telemetry_delay).await;
        self.telemetry.telemetry(&burst).await;
    }

    async fn finish(&self, epoch: Option<u64>) -> Result<MissionBlueprint, MissionError> {
        let mut active = match epoch {
            Some(epoch) => self.current_guard(epoch).await?,
            None => self.active.lock().await,
        };
        let state = active.take().ok_or(MissionError::NoActiveMission)?;
        self.epoch.fetch_add(1, Ordering::SeqCst);

        info!(mission_id = %state.blueprint.id, "Mission accomplished");
        self.telemetry.final_report(&state.blueprint).await;
        self.store.clear().await;
        Ok(state.blueprint)
    }
}
