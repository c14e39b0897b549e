//! Process execution for mission nodes.
//!
//! Nodes run to completion: there is no interruption, no approval handshake
//! and no retry at this layer. A non-zero exit is a [`NodeFailure`].

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info};

use crate::supervisor::accumulator::OutputAccumulator;
use crate::supervisor::output::{truncate_bytes, MAX_ERROR_BYTES};
use crate::supervisor::process::{SpawnedWorker, WorkerCommand, WorkerEvent};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("node exited with code {code:?}: {stderr}")]
pub struct NodeFailure {
    /// `None` when the process never started or died by signal.
    pub code: Option<i32>,
    pub stderr: String,
}

/// Runs the external command behind a node and returns its stdout.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(&self, node_id: u32, command: &str, args: &[String])
        -> Result<String, NodeFailure>;
}

/// Spawns node commands as child processes in the application root.
#[derive(Debug, Clone)]
pub struct ProcessNodeExecutor {
    cwd: PathBuf,
    env: Vec<(String, String)>,
}

impl ProcessNodeExecutor {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn command(&self, program: &str) -> WorkerCommand {
        self.env
            .iter()
            .fold(WorkerCommand::new(program, &self.cwd), |cmd, (k, v)| {
                cmd.with_env(k, v)
            })
    }
}

#[async_trait]
impl NodeExecutor for ProcessNodeExecutor {
    async fn execute(
        &self,
        node_id: u32,
        command: &str,
        args: &[String],
    ) -> Result<String, NodeFailure> {
        info!(node_id, command = %command, "Executing mission node");

        let SpawnedWorker {
            mut child,
            mut events,
            handle,
        } = self.command(command).spawn(args).map_err(|e| NodeFailure {
            code: None,
            stderr: truncate_bytes(&e.to_string(), MAX_ERROR_BYTES).to_string(),
        })?;
        handle.close_input().await;

        let mut stdout = OutputAccumulator::stdout();
        let mut stderr = OutputAccumulator::stderr();
        while let Some(event) = events.recv().await {
            match event {
                WorkerEvent::Stdout(text) => stdout.push(&text),
                WorkerEvent::Stderr(text) => stderr.push(&text),
            }
        }

        let status = child.wait().await;
        handle.mark_exited();
        let code = match status {
            Ok(status) if status.success() => {
                info!(node_id, "Mission node finished");
                return Ok(stdout.as_str().to_string());
            }
            Ok(status) => status.code(),
            Err(e) => {
                error!(node_id, "Failed to wait for mission node: {}", e);
                None
            }
        };

        let err = truncate_bytes(stderr.as_str().trim(), MAX_ERROR_BYTES).to_string();
        error!(node_id, code = ?code, err = %err, "Mission node failed");
        Err(NodeFailure { code, stderr: err })
    }
}
