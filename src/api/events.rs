//! Outbound event stream.
//!
//! Everything the service wants to tell a chat client goes through one
//! broadcast channel of [`UplinkEvent`]s, consumed over SSE by the chat
//! transport. [`BroadcastTransport`] is the single producer side: it serves
//! both the supervisor (interrupt and approval notices) and the mission
//! runner (telemetry and final reports).

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::routes::AppState;
use crate::mission::reflection::{Reflection, ReflectionPublisher};
use crate::mission::telemetry::{render_final_report, TelemetryBurst, TelemetrySink};
use crate::mission::types::MissionBlueprint;
use crate::supervisor::{ChatTransport, TaskOutcome};

pub const ACTION_REQUIRED: &str = "Action Required: the worker needs approval to proceed.";
pub const TASK_INTERRUPTED: &str = "Previous task interrupted. Starting new one...";

/// A message for the chat client, keyed by conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UplinkEvent {
    Message { chat_id: String, text: String },
    /// Offer approve/reject actions for the conversation's live worker.
    ApprovalRequested { chat_id: String, text: String },
    TaskInterrupted { chat_id: String, text: String },
    Telemetry { chat_id: String, text: String },
    /// Final mission summary; `sync` and `archive` are the offered follow-ups.
    MissionReport { chat_id: String, text: String },
    /// Published reflection, for downstream channels subscribed to the stream.
    ReflectionDispatched { reflection: Reflection },
}

impl UplinkEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            UplinkEvent::Message { .. } => "message",
            UplinkEvent::ApprovalRequested { .. } => "approval_requested",
            UplinkEvent::TaskInterrupted { .. } => "task_interrupted",
            UplinkEvent::Telemetry { .. } => "telemetry",
            UplinkEvent::MissionReport { .. } => "mission_report",
            UplinkEvent::ReflectionDispatched { .. } => "reflection_dispatched",
        }
    }

    pub fn chat_id(&self) -> Option<&str> {
        match self {
            UplinkEvent::Message { chat_id, .. }
            | UplinkEvent::ApprovalRequested { chat_id, .. }
            | UplinkEvent::TaskInterrupted { chat_id, .. }
            | UplinkEvent::Telemetry { chat_id, .. }
            | UplinkEvent::MissionReport { chat_id, .. } => Some(chat_id),
            UplinkEvent::ReflectionDispatched { .. } => None,
        }
    }
}

/// Broadcast-backed transport. Sending with no subscribers is not an error:
/// the event is simply dropped.
#[derive(Debug, Clone)]
pub struct BroadcastTransport {
    tx: broadcast::Sender<UplinkEvent>,
    /// Conversation that receives mission telemetry and reports.
    mission_chat: Option<String>,
}

impl BroadcastTransport {
    pub fn new(capacity: usize, mission_chat: Option<String>) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, mission_chat }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UplinkEvent> {
        self.tx.subscribe()
    }

    pub fn send(&self, event: UplinkEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("No uplink subscribers; event dropped");
        }
    }

    pub fn send_message(&self, chat_id: &str, text: String) {
        self.send(UplinkEvent::Message {
            chat_id: chat_id.to_string(),
            text,
        });
    }

    /// Report a finished task to its conversation.
    pub fn deliver_outcome(&self, chat_id: &str, outcome: &TaskOutcome) {
        for text in outcome.messages() {
            self.send_message(chat_id, text);
        }
    }

    /// Send a plain message to the conversation that follows missions.
    pub fn send_to_mission_chat(&self, text: String) {
        if let Some(chat_id) = self.mission_chat() {
            self.send_message(chat_id, text);
        }
    }

    fn mission_chat(&self) -> Option<&str> {
        let chat = self.mission_chat.as_deref();
        if chat.is_none() {
            tracing::debug!("No authorized chat configured; mission update not delivered");
        }
        chat
    }
}

#[async_trait]
impl ChatTransport for BroadcastTransport {
    async fn task_interrupted(&self, chat_id: &str) {
        self.send(UplinkEvent::TaskInterrupted {
            chat_id: chat_id.to_string(),
            text: TASK_INTERRUPTED.to_string(),
        });
    }

    async fn approval_requested(&self, chat_id: &str) {
        self.send(UplinkEvent::ApprovalRequested {
            chat_id: chat_id.to_string(),
            text: ACTION_REQUIRED.to_string(),
        });
    }
}

#[async_trait]
impl TelemetrySink for BroadcastTransport {
    async fn telemetry(&self, burst: &TelemetryBurst) {
        if let Some(chat_id) = self.mission_chat() {
            self.send(UplinkEvent::Telemetry {
                chat_id: chat_id.to_string(),
                text: burst.render(),
            });
        }
    }

    async fn final_report(&self, blueprint: &MissionBlueprint) {
        if let Some(chat_id) = self.mission_chat() {
            self.send(UplinkEvent::MissionReport {
                chat_id: chat_id.to_string(),
                text: render_final_report(blueprint),
            });
        }
    }
}

/// Publishes reflections onto the uplink stream. Fails when nobody is
/// listening, so the reflection stays staged for a later attempt.
#[async_trait]
impl ReflectionPublisher for BroadcastTransport {
    async fn publish(&self, reflection: &Reflection) -> Result<(), String> {
        self.tx
            .send(UplinkEvent::ReflectionDispatched {
                reflection: reflection.clone(),
            })
            .map(|_| ())
            .map_err(|_| "no uplink subscribers".to_string())
    }
}

/// `GET /api/events` - SSE stream of uplink events. Ends when the service
/// begins shutting down.
pub async fn stream(State(state): State<Arc<AppState>>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.transport.subscribe();
    let shutdown = state.shutdown_token.clone();
    let stream_id = Uuid::new_v4();
    tracing::info!(stream_id = %stream_id, "Uplink SSE stream opened");

    struct StreamDropGuard {
        stream_id: Uuid,
    }

    impl Drop for StreamDropGuard {
        fn drop(&mut self) {
            tracing::info!(stream_id = %self.stream_id, "Uplink SSE stream closed");
        }
    }

    let drop_guard = StreamDropGuard { stream_id };

    let stream = async_stream::stream! {
        let _guard = drop_guard;
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(stream_id = %stream_id, "Uplink SSE stream ended by shutdown");
                    break;
                }
                next = rx.recv() => next,
            };
            match next {
                Ok(ev) => {
                    tracing::debug!(
                        stream_id = %stream_id,
                        event = %ev.event_name(),
                        chat_id = ?ev.chat_id(),
                        "Uplink SSE event"
                    );
                    match Event::default().event(ev.event_name()).json_data(&ev) {
                        Ok(sse) => yield Ok(sse),
                        Err(e) => {
                            tracing::error!(
                                stream_id = %stream_id,
                                error = %e,
                                "Failed to serialize SSE event; dropping"
                            );
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(stream_id = %stream_id, skipped = n, "Uplink SSE stream lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}
