//! Worker process launch and the handle used to steer a live worker.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::output::Utf8Chunker;
use super::SupervisorError;

/// Exit code the worker uses when it could not resume the previous context.
pub const RESUME_FAILED_EXIT_CODE: i32 = 42;

/// Stdout text accompanying [`RESUME_FAILED_EXIT_CODE`].
pub const RESUME_ERROR_MARKER: &str = "Error resuming session";

const READ_BUF_SIZE: usize = 8 * 1024;
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);

/// How to start the worker CLI.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: String,
    base_args: Vec<String>,
    cwd: PathBuf,
    env: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
        }
    }

    /// Arguments placed before the task arguments (e.g. a script for an interpreter).
    pub fn with_base_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Task arguments for one request.
    pub fn task_args(payload: &str, resume: bool, extra: &[String]) -> Vec<String> {
        let mut args = vec!["--prompt".to_string(), payload.to_string()];
        if resume {
            args.push("--resume".to_string());
            args.push("latest".to_string());
        }
        args.extend(
            ["--output-format", "text", "--approval-mode", "default"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.extend(extra.iter().cloned());
        args
    }

    /// Spawn the worker and start pumping its output into an event channel.
    pub fn spawn(&self, args: &[String]) -> Result<SpawnedWorker, SupervisorError> {
        let mut child = Command::new(&self.program)
            .args(&self.base_args)
            .args(args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&self.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn(format!("{}: {}", self.program, e)))?;

        let (tx, events) = mpsc::channel(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, tx.clone(), WorkerEvent::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, tx, WorkerEvent::Stderr));
        }

        let handle = Arc::new(WorkerHandle::new(child.id(), child.stdin.take()));
        Ok(SpawnedWorker {
            child,
            events,
            handle,
        })
    }
}

/// Output arriving from a worker, in arrival order per stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Stdout(String),
    Stderr(String),
}

/// A freshly spawned worker. The channel closes once both streams hit EOF.
#[derive(Debug)]
pub struct SpawnedWorker {
    pub child: Child,
    pub events: mpsc::Receiver<WorkerEvent>,
    pub handle: Arc<WorkerHandle>,
}

async fn pump<R>(mut reader: R, tx: mpsc::Sender<WorkerEvent>, wrap: fn(String) -> WorkerEvent)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut decoder = Utf8Chunker::default();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.push(&buf[..n]);
                if !text.is_empty() && tx.send(wrap(text)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("Worker stream read failed: {}", e);
                break;
            }
        }
    }
    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = tx.send(wrap(rest)).await;
    }
}

/// Handle to a running worker, shared between the registry and the task
/// that owns the process. The owning task performs the actual kill once
/// [`WorkerHandle::kill`] cancels it.
pub struct WorkerHandle {
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    cancel: CancellationToken,
    exited: watch::Sender<bool>,
}

impl WorkerHandle {
    fn new(pid: Option<u32>, stdin: Option<ChildStdin>) -> Self {
        let (exited, _) = watch::channel(false);
        Self {
            pid,
            stdin: Mutex::new(stdin),
            cancel: CancellationToken::new(),
            exited,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn mark_exited(&self) {
        self.exited.send_replace(true);
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Write a literal token to the worker's stdin.
    pub async fn write_input(&self, token: &str) -> Result<(), SupervisorError> {
        if self.has_exited() {
            return Err(SupervisorError::Exited);
        }
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or(SupervisorError::Exited)?;
        pipe.write_all(token.as_bytes())
            .await
            .map_err(SupervisorError::Input)?;
        pipe.flush().await.map_err(SupervisorError::Input)
    }

    /// Close stdin so the worker sees EOF.
    pub async fn close_input(&self) {
        self.stdin.lock().await.take();
    }

    /// Kill the worker and wait (briefly) for the owning task to confirm.
    ///
    /// Returns `false` when the confirmation did not arrive in time.
    pub async fn kill(&self) -> bool {
        let mut exited = self.exited.subscribe();
        self.cancel.cancel();
        let confirmed = match tokio::time::timeout(KILL_CONFIRM_TIMEOUT, exited.wait_for(|done| *done)).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) => true,
            Err(_) => {
                warn!(pid = ?self.pid, "Worker did not confirm kill in time");
                false
            }
        };
        confirmed
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .finish()
    }
}
