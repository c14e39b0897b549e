//! Process supervisor - one worker process per conversation.
//!
//! The supervisor owns a registry from conversation id to the live worker.
//! A new request for a conversation always wins: the running worker is
//! killed, the conversation is told, and the replacement starts after a
//! short pause. Each worker's output is consumed by a single coordinating
//! future (the one awaiting [`ProcessSupervisor::submit`]), which feeds the
//! bounded accumulators and the approval gate.

pub mod accumulator;
pub mod approval;
pub mod output;
pub mod process;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::settings::SharedChatSettings;

use accumulator::OutputAccumulator;
use approval::ApprovalGate;
use output::{clean_output, escape_html, split_parts, truncate_bytes, MAX_ERROR_BYTES, MAX_PART_CHARS};
use process::{
    SpawnedWorker, WorkerCommand, WorkerEvent, WorkerHandle, RESUME_ERROR_MARKER,
    RESUME_FAILED_EXIT_CODE,
};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to start worker: {0}")]
    Spawn(String),

    #[error("Failed to wait for worker: {0}")]
    Wait(std::io::Error),

    #[error("Failed to write to worker input: {0}")]
    Input(std::io::Error),

    #[error("Worker has already exited")]
    Exited,
}

/// Outbound notifications the supervisor needs from the chat transport.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// The conversation's previous task was killed in favour of a new one.
    async fn task_interrupted(&self, chat_id: &str);

    /// The worker is waiting for a yes/no answer.
    async fn approval_requested(&self, chat_id: &str);
}

/// How a submitted task ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Cleaned output, split into transport-sized parts (in order).
    Completed { parts: Vec<String> },
    /// Non-zero exit with nothing usable on stdout.
    Failed { code: i32, stderr: String },
    /// Clean exit, no output, no approval requested.
    Empty,
    /// Clean exit with no output after an approval request was surfaced.
    ApprovalOnly,
    /// Superseded by a newer request (or killed on shutdown).
    Interrupted,
    /// The worker could not be started.
    SpawnFailed { message: String },
}

impl TaskOutcome {
    /// Chat messages (HTML parse mode) reporting this outcome.
    pub fn messages(&self) -> Vec<String> {
        match self {
            TaskOutcome::Completed { parts } => parts
                .iter()
                .map(|part| format!("<pre>{}</pre>", escape_html(part)))
                .collect(),
            TaskOutcome::Failed { code, stderr } => vec![format!(
                "⚠️ <b>Worker error (Code {}):</b>\n<pre>{}</pre>",
                code,
                escape_html(stderr)
            )],
            TaskOutcome::Empty => vec!["Worker finished but returned no output.".to_string()],
            TaskOutcome::SpawnFailed { message } => {
                vec![format!("❌ Error: {}", escape_html(message))]
            }
            TaskOutcome::ApprovalOnly | TaskOutcome::Interrupted => Vec::new(),
        }
    }
}

/// Result of routing an approve/reject action to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalResolution {
    Approved,
    Rejected,
    /// No live worker for the conversation (it may already have exited).
    NoActiveSession,
}

impl ApprovalResolution {
    pub fn message(&self) -> &'static str {
        match self {
            ApprovalResolution::Approved => "Approved. Executing...",
            ApprovalResolution::Rejected => "Rejected. Skipping...",
            ApprovalResolution::NoActiveSession => "Session not found or already finished.",
        }
    }
}

struct ActiveTask {
    generation: u64,
    handle: Arc<WorkerHandle>,
}

enum Attempt {
    Exited(Option<i32>),
    Interrupted,
}

/// Launches, tracks, interrupts and retries per-conversation workers.
pub struct ProcessSupervisor {
    worker: WorkerCommand,
    settings: SharedChatSettings,
    transport: Arc<dyn ChatTransport>,
    registry: Mutex<HashMap<String, ActiveTask>>,
    next_generation: AtomicU64,
    interrupt_delay: Duration,
    shadow_latency: Option<Duration>,
}

impl ProcessSupervisor {
    pub fn new(
        worker: WorkerCommand,
        settings: SharedChatSettings,
        transport: Arc<dyn ChatTransport>,
        interrupt_delay: Duration,
    ) -> Self {
        Self {
            worker,
            settings,
            transport,
            registry: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            interrupt_delay,
            shadow_latency: None,
        }
    }

    pub fn from_config(
        config: &Config,
        settings: SharedChatSettings,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        let worker = WorkerCommand::new(&config.worker.program, &config.app_root)
            .with_env("NODE_ENV", &config.worker.env_name);
        let mut supervisor = Self::new(worker, settings, transport, config.worker.interrupt_delay);
        if config.worker.shadow_mode {
            supervisor.shadow_latency = Some(config.worker.shadow_latency);
        }
        supervisor
    }

    /// Replace real workers with simulated responses.
    pub fn with_shadow_mode(mut self, latency: Duration) -> Self {
        self.shadow_latency = Some(latency);
        self
    }

    /// Whether a worker is currently tracked for the conversation.
    pub async fn is_running(&self, chat_id: &str) -> bool {
        self.registry.lock().await.contains_key(chat_id)
    }

    pub async fn active_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Run `payload` for a conversation and wait for the outcome.
    pub async fn submit(&self, chat_id: &str, payload: &str) -> TaskOutcome {
        info!(chat_id = %chat_id, "Submitting task");

        if let Some(latency) = self.shadow_latency {
            info!(chat_id = %chat_id, "SHADOW_MODE: simulating worker response");
            tokio::time::sleep(latency).await;
            return shadow_outcome(payload);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;

        let previous = self.registry.lock().await.remove(chat_id);
        if let Some(previous) = previous {
            self.interrupt(chat_id, previous).await;
            tokio::time::sleep(self.interrupt_delay).await;
        }

        let extra = self.settings.worker_args(chat_id).await;
        let mut stdout = OutputAccumulator::stdout();
        let mut stderr = OutputAccumulator::stderr();
        let mut gate = ApprovalGate::default();
        let mut resume = true;

        let code = loop {
            let args = WorkerCommand::task_args(payload, resume, &extra);
            let retry = !resume;
            let attempt = self
                .run_attempt(chat_id, generation, retry, &args, &mut stdout, &mut stderr, &mut gate)
                .await;
            match attempt {
                Err(e) => {
                    error!(chat_id = %chat_id, "Worker failed to run: {}", e);
                    self.release(chat_id, generation).await;
                    return TaskOutcome::SpawnFailed {
                        message: truncate_bytes(&e.to_string(), MAX_ERROR_BYTES).to_string(),
                    };
                }
                Ok(Attempt::Interrupted) => {
                    info!(chat_id = %chat_id, "Task interrupted");
                    self.release(chat_id, generation).await;
                    return TaskOutcome::Interrupted;
                }
                Ok(Attempt::Exited(code)) => {
                    let resume_failed = code == Some(RESUME_FAILED_EXIT_CODE)
                        && stdout.as_str().contains(RESUME_ERROR_MARKER);
                    if resume_failed && resume {
                        if !self.owns(chat_id, generation).await {
                            info!(chat_id = %chat_id, "Task superseded before resume retry");
                            self.release(chat_id, generation).await;
                            return TaskOutcome::Interrupted;
                        }
                        warn!(chat_id = %chat_id, "Resume failed, retrying without resume");
                        resume = false;
                        stdout.clear();
                        stderr.clear();
                        gate.rewire();
                        continue;
                    }
                    if resume_failed {
                        self.release(chat_id, generation).await;
                        error!(chat_id = %chat_id, "Retry without resume also failed");
                        let detail = match stderr.as_str().trim() {
                            "" => RESUME_ERROR_MARKER,
                            s => s,
                        };
                        return TaskOutcome::Failed {
                            code: RESUME_FAILED_EXIT_CODE,
                            stderr: truncate_bytes(detail, MAX_ERROR_BYTES).to_string(),
                        };
                    }
                    break code;
                }
            }
        };

        self.release(chat_id, generation).await;
        info!(chat_id = %chat_id, code = ?code, "Worker process closed");
        if stdout.is_truncated() {
            warn!(chat_id = %chat_id, "Worker output exceeded the capture ceiling and was truncated");
        }
        let outcome = resolve_outcome(code, &stdout, &stderr, gate.sent());
        if let TaskOutcome::Failed { code, stderr } = &outcome {
            error!(chat_id = %chat_id, code = code, err = %stderr, "Worker process failed");
        }
        outcome
    }

    /// Route an approve/reject answer to the conversation's live worker.
    pub async fn resolve(&self, chat_id: &str, approved: bool) -> ApprovalResolution {
        let handle = self
            .registry
            .lock()
            .await
            .get(chat_id)
            .map(|task| Arc::clone(&task.handle));
        let Some(handle) = handle else {
            info!(chat_id = %chat_id, "Approval answer with no active session");
            return ApprovalResolution::NoActiveSession;
        };

        let token = if approved { "y\n" } else { "n\n" };
        match handle.write_input(token).await {
            Ok(()) if approved => {
                info!(chat_id = %chat_id, "User approved action");
                ApprovalResolution::Approved
            }
            Ok(()) => {
                info!(chat_id = %chat_id, "User rejected action");
                ApprovalResolution::Rejected
            }
            Err(e) => {
                warn!(chat_id = %chat_id, "Approval answer not delivered: {}", e);
                ApprovalResolution::NoActiveSession
            }
        }
    }

    /// Kill every tracked worker. Returns how many were tracked.
    pub async fn shutdown(&self) -> usize {
        let tasks: Vec<(String, ActiveTask)> = self.registry.lock().await.drain().collect();
        let count = tasks.len();
        for (chat_id, task) in tasks {
            info!(chat_id = %chat_id, "Killing lingering worker during shutdown");
            if !task.handle.kill().await {
                warn!(chat_id = %chat_id, pid = ?task.handle.pid(), "Failed to kill worker during shutdown");
            }
        }
        count
    }

    async fn interrupt(&self, chat_id: &str, task: ActiveTask) {
        info!(chat_id = %chat_id, "Interrupting active task");
        if !task.handle.kill().await {
            warn!(chat_id = %chat_id, pid = ?task.handle.pid(), "Failed to kill process");
        }
        self.transport.task_interrupted(chat_id).await;
    }

    /// Register a freshly spawned worker. Fails when a newer request for the
    /// same conversation already owns the slot. A retry only replaces its own
    /// entry: once that entry is gone the request has been superseded.
    async fn install(
        &self,
        chat_id: &str,
        generation: u64,
        retry: bool,
        handle: Arc<WorkerHandle>,
    ) -> bool {
        let mut registry = self.registry.lock().await;
        match registry.get(chat_id) {
            Some(current) if current.generation > generation => return false,
            Some(current) if retry && current.generation != generation => return false,
            None if retry => return false,
            _ => {}
        }
        let displaced = registry.insert(chat_id.to_string(), ActiveTask { generation, handle });
        drop(registry);

        if let Some(displaced) = displaced {
            if displaced.generation != generation {
                self.interrupt(chat_id, displaced).await;
            }
        }
        true
    }

    /// Whether the conversation's registry entry still belongs to this request.
    async fn owns(&self, chat_id: &str, generation: u64) -> bool {
        self.registry
            .lock()
            .await
            .get(chat_id)
            .is_some_and(|task| task.generation == generation)
    }

    /// Drop the registry entry if it still belongs to this request.
    async fn release(&self, chat_id: &str, generation: u64) {
        let mut registry = self.registry.lock().await;
        if registry
            .get(chat_id)
            .is_some_and(|task| task.generation == generation)
        {
            registry.remove(chat_id);
        }
    }

    async fn run_attempt(
        &self,
        chat_id: &str,
        generation: u64,
        retry: bool,
        args: &[String],
        stdout: &mut OutputAccumulator,
        stderr: &mut OutputAccumulator,
        gate: &mut ApprovalGate,
    ) -> Result<Attempt, SupervisorError> {
        let SpawnedWorker {
            mut child,
            mut events,
            handle,
        } = self.worker.spawn(args)?;
        info!(chat_id = %chat_id, pid = ?handle.pid(), "Worker started");

        if !self.install(chat_id, generation, retry, Arc::clone(&handle)).await {
            kill_child(chat_id, &mut child).await;
            handle.mark_exited();
            return Ok(Attempt::Interrupted);
        }

        let cancel = handle.cancel_token();
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                event = events.recv() => Some(event),
            };
            match event {
                None => {
                    kill_child(chat_id, &mut child).await;
                    handle.mark_exited();
                    return Ok(Attempt::Interrupted);
                }
                Some(Some(WorkerEvent::Stdout(text))) => {
                    stdout.push(&text);
                    if gate.observe(&text) {
                        info!(chat_id = %chat_id, "Tool approval requested");
                        self.transport.approval_requested(chat_id).await;
                    }
                }
                Some(Some(WorkerEvent::Stderr(text))) => stderr.push(&text),
                Some(None) => break,
            }
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let Some(status) = status else {
            kill_child(chat_id, &mut child).await;
            handle.mark_exited();
            return Ok(Attempt::Interrupted);
        };
        handle.mark_exited();
        let status = status.map_err(SupervisorError::Wait)?;
        Ok(Attempt::Exited(status.code()))
    }
}

async fn kill_child(chat_id: &str, child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(chat_id = %chat_id, "Failed to kill worker: {}", e);
    }
}

fn resolve_outcome(
    code: Option<i32>,
    stdout: &OutputAccumulator,
    stderr: &OutputAccumulator,
    approval_sent: bool,
) -> TaskOutcome {
    let clean = clean_output(stdout.as_str());
    if !clean.is_empty() {
        return TaskOutcome::Completed {
            parts: split_parts(&clean, MAX_PART_CHARS),
        };
    }
    match code {
        Some(code) if code != 0 => {
            let err = match stderr.as_str().trim() {
                "" => "Process interrupted",
                s => s,
            };
            TaskOutcome::Failed {
                code,
                stderr: truncate_bytes(err, MAX_ERROR_BYTES).to_string(),
            }
        }
        _ if approval_sent => TaskOutcome::ApprovalOnly,
        _ => TaskOutcome::Empty,
    }
}

fn shadow_outcome(payload: &str) -> TaskOutcome {
    TaskOutcome::Completed {
        parts: vec![format!(
            "SHADOW_MODE: Simulated Uplink\n\n\
             I have received your signal: \"{}\"\n\n\
             The worker is operating in a simulated environment. Operational integrity is 100%.",
            payload
        )],
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::settings::ChatSettingsStore;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingTransport {
        events: StdMutex<Vec<(String, &'static str)>>,
    }

    impl RecordingTransport {
        fn count(&self, chat_id: &str, kind: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, k)| c == chat_id && *k == kind)
                .count()
        }
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        async fn task_interrupted(&self, chat_id: &str) {
            self.events
                .lock()
                .unwrap()
                .push((chat_id.to_string(), "interrupted"));
        }

        async fn approval_requested(&self, chat_id: &str) {
            self.events
                .lock()
                .unwrap()
                .push((chat_id.to_string(), "approval"));
        }
    }

    /// Supervisor whose worker is `sh -c <script>`; `$2` is the payload.
    fn supervisor(
        script: &str,
        settings: SharedChatSettings,
    ) -> (Arc<ProcessSupervisor>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let worker = WorkerCommand::new("sh", std::env::temp_dir())
            .with_base_args(["-c", script, "worker"]);
        let supervisor = ProcessSupervisor::new(
            worker,
            settings,
            transport.clone(),
            Duration::from_millis(20),
        );
        (Arc::new(supervisor), transport)
    }

    fn no_settings() -> SharedChatSettings {
        Arc::new(ChatSettingsStore::in_memory())
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..500 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn completed_output_is_cleaned() {
        let (sup, _) = supervisor(
            "echo 'Loaded cached credentials.'; echo \"reply: $2\"",
            no_settings(),
        );
        let outcome = sup.submit("c1", "hello").await;
        assert_eq!(
            outcome,
            TaskOutcome::Completed {
                parts: vec!["reply: hello".to_string()]
            }
        );
        assert!(!sup.is_running("c1").await);
    }

    #[tokio::test]
    async fn new_request_interrupts_running_task() {
        let (sup, transport) = supervisor(
            "case \"$2\" in slow) exec sleep 5;; esac; echo \"done $2\"",
            no_settings(),
        );

        let first = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move { sup.submit("c1", "slow").await })
        };
        wait_until(|| {
            let sup = Arc::clone(&sup);
            async move { sup.is_running("c1").await }
        })
        .await;

        let second = sup.submit("c1", "fast").await;
        let first = first.await.expect("join");

        assert_eq!(first, TaskOutcome::Interrupted);
        assert_eq!(
            second,
            TaskOutcome::Completed {
                parts: vec!["done fast".to_string()]
            }
        );
        assert_eq!(transport.count("c1", "interrupted"), 1);
        assert_eq!(sup.active_count().await, 0);
    }

    #[tokio::test]
    async fn conversations_do_not_interrupt_each_other() {
        let (sup, transport) = supervisor("sleep 0.2; echo \"done $2\"", no_settings());
        let (a, b) = tokio::join!(sup.submit("a", "one"), sup.submit("b", "two"));
        assert_eq!(
            a,
            TaskOutcome::Completed {
                parts: vec!["done one".to_string()]
            }
        );
        assert_eq!(
            b,
            TaskOutcome::Completed {
                parts: vec!["done two".to_string()]
            }
        );
        assert_eq!(transport.count("a", "interrupted"), 0);
        assert_eq!(transport.count("b", "interrupted"), 0);
    }

    #[tokio::test]
    async fn approval_round_trip_sends_prompt_once() {
        let (sup, transport) = supervisor(
            "printf 'Allow write? [y/'; sleep 0.1; printf 'N]\\n'; \
             read answer; echo \"answer=$answer\"; echo 'Allow again? [y/N]'",
            no_settings(),
        );

        let task = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move { sup.submit("c1", "write it").await })
        };
        wait_until(|| {
            let transport = Arc::clone(&transport);
            async move { transport.count("c1", "approval") == 1 }
        })
        .await;

        assert_eq!(sup.resolve("c1", true).await, ApprovalResolution::Approved);
        let outcome = task.await.expect("join");

        assert_eq!(
            outcome,
            TaskOutcome::Completed {
                parts: vec!["answer=y".to_string()]
            }
        );
        assert_eq!(transport.count("c1", "approval"), 1);
    }

    #[tokio::test]
    async fn resolving_without_session_is_not_an_error() {
        let (sup, _) = supervisor("echo hi", no_settings());
        assert_eq!(
            sup.resolve("nobody", false).await,
            ApprovalResolution::NoActiveSession
        );
    }

    #[tokio::test]
    async fn resume_failure_retries_once_without_resume() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("calls.log");
        let script = format!(
            "echo \"$*\" >> '{}'; \
             case \" $* \" in *' --resume '*) echo 'Error resuming session'; exit 42;; esac; \
             echo 'fresh start'",
            log.display()
        );
        let (sup, _) = supervisor(&script, no_settings());

        let outcome = sup.submit("c1", "continue").await;
        assert_eq!(
            outcome,
            TaskOutcome::Completed {
                parts: vec!["fresh start".to_string()]
            }
        );

        let calls = std::fs::read_to_string(&log).expect("log");
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].contains("--resume latest"));
        assert!(!calls[1].contains("--resume"));
    }

    #[tokio::test]
    async fn superseded_request_cannot_reinstall_its_retry() {
        let (sup, transport) = supervisor("exit 0", no_settings());

        let first = sup.worker.spawn(&[]).expect("spawn");
        assert!(sup.install("c1", 1, false, Arc::clone(&first.handle)).await);
        let mut first_child = first.child;
        first_child.wait().await.expect("wait");
        first.handle.mark_exited();

        // A retry for a request that still owns its entry replaces it in place.
        let retry = sup.worker.spawn(&[]).expect("spawn");
        assert!(sup.owns("c1", 1).await);
        assert!(sup.install("c1", 1, true, Arc::clone(&retry.handle)).await);
        assert_eq!(transport.count("c1", "interrupted"), 0);
        let mut retry_child = retry.child;
        retry_child.wait().await.expect("wait");
        retry.handle.mark_exited();

        // A newer request takes the slot between the exit and the next retry.
        let previous = sup.registry.lock().await.remove("c1").expect("entry");
        sup.interrupt("c1", previous).await;
        assert!(!sup.owns("c1", 1).await);

        let late = sup.worker.spawn(&[]).expect("spawn");
        assert!(!sup.install("c1", 1, true, Arc::clone(&late.handle)).await);
        assert!(!sup.is_running("c1").await);

        // The newer request installs without a second notice.
        assert!(sup.install("c1", 2, false, Arc::clone(&late.handle)).await);
        assert_eq!(transport.count("c1", "interrupted"), 1);

        sup.release("c1", 1).await;
        assert!(sup.owns("c1", 2).await);
        sup.release("c1", 2).await;
        assert_eq!(sup.active_count().await, 0);
        let mut late_child = late.child;
        late_child.wait().await.expect("wait");
    }

    #[tokio::test]
    async fn second_resume_failure_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("calls.log");
        let script = format!(
            "echo call >> '{}'; echo 'Error resuming session'; echo 'no session' >&2; exit 42",
            log.display()
        );
        let (sup, _) = supervisor(&script, no_settings());

        let outcome = sup.submit("c1", "continue").await;
        assert_eq!(
            outcome,
            TaskOutcome::Failed {
                code: 42,
                stderr: "no session".to_string()
            }
        );
        let calls = std::fs::read_to_string(&log).expect("log");
        assert_eq!(calls.lines().count(), 2);
    }

    #[tokio::test]
    async fn exit_42_without_marker_is_not_retried() {
        let (sup, _) = supervisor("echo 'oops' >&2; exit 42", no_settings());
        assert_eq!(
            sup.submit("c1", "x").await,
            TaskOutcome::Failed {
                code: 42,
                stderr: "oops".to_string()
            }
        );
    }

    #[tokio::test]
    async fn failure_carries_truncated_stderr() {
        let (sup, _) = supervisor(
            "head -c 900 /dev/zero | tr '\\0' 'e' >&2; exit 3",
            no_settings(),
        );
        match sup.submit("c1", "x").await {
            TaskOutcome::Failed { code, stderr } => {
                assert_eq!(code, 3);
                assert_eq!(stderr.len(), MAX_ERROR_BYTES);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn silent_exit_reports_empty() {
        let (sup, _) = supervisor("exit 0", no_settings());
        assert_eq!(sup.submit("c1", "x").await, TaskOutcome::Empty);
    }

    #[tokio::test]
    async fn oversized_output_is_truncated() {
        let (sup, _) = supervisor(
            "head -c 2000000 /dev/zero | tr '\\0' 'x'",
            no_settings(),
        );
        match sup.submit("c1", "x").await {
            TaskOutcome::Completed { parts } => {
                let total: String = parts.concat();
                assert!(total.len() < accumulator::MAX_OUTPUT_BYTES + 64);
                assert!(total.ends_with("...[Output Truncated]"));
                assert!(parts.iter().all(|p| p.chars().count() <= MAX_PART_CHARS));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn chat_settings_become_worker_flags() {
        let settings = no_settings();
        settings.set_temperature("c1", 0.5).await;
        let (sup, _) = supervisor("echo \"$*\"", settings);
        match sup.submit("c1", "x").await {
            TaskOutcome::Completed { parts } => {
                assert!(parts[0].contains("--temperature 0.5 --top-p 1"));
                assert!(parts[0].contains("--resume latest"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn shutdown_kills_tracked_workers() {
        let (sup, _) = supervisor("exec sleep 5", no_settings());
        let task = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move { sup.submit("c1", "x").await })
        };
        wait_until(|| {
            let sup = Arc::clone(&sup);
            async move { sup.is_running("c1").await }
        })
        .await;

        assert_eq!(sup.shutdown().await, 1);
        assert_eq!(task.await.expect("join"), TaskOutcome::Interrupted);
        assert_eq!(sup.shutdown().await, 0);
    }

    #[tokio::test]
    async fn shadow_mode_skips_the_worker() {
        let (sup, _) = supervisor("exit 1", no_settings());
        let sup = Arc::try_unwrap(sup)
            .ok()
            .expect("sole owner")
            .with_shadow_mode(Duration::from_millis(1));
        match sup.submit("c1", "Hello Borg").await {
            TaskOutcome::Completed { parts } => assert!(parts[0].contains("Hello Borg")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn outcome_messages_escape_output() {
        let outcome = TaskOutcome::Completed {
            parts: vec!["<b>".to_string()],
        };
        assert_eq!(outcome.messages(), vec!["<pre>&lt;b&gt;</pre>".to_string()]);
        assert!(TaskOutcome::Interrupted.messages().is_empty());
    }
}
