//! API request and response types.

use serde::{Deserialize, Serialize};

use crate::mission::reflection::Reflection;
use crate::mission::types::MissionBlueprint;
use crate::supervisor::ApprovalResolution;

/// Inbound chat message for a conversation.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitMessageRequest {
    /// Prompt handed to the worker
    pub text: String,
}

/// Response after accepting a message.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitMessageResponse {
    pub chat_id: String,

    /// Whether an earlier task for this conversation is being replaced
    pub interrupts_previous: bool,
}

/// Result of an approve/reject action.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalResponse {
    pub resolved: ApprovalResolution,

    /// Short text for the actor
    pub message: String,
}

/// Partial update of a conversation's generation parameters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSettingsRequest {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
}

/// Request to plan a new mission.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanMissionRequest {
    /// Free-form objective, or `REFLECT:<MODE>:<summary>`
    pub objective: String,
}

/// A planned blueprint together with its chat rendering.
#[derive(Debug, Clone, Serialize)]
pub struct PlanMissionResponse {
    pub blueprint: MissionBlueprint,
    pub text: String,
}

/// Plain acknowledgement carrying text for the actor.
#[derive(Debug, Clone, Serialize)]
pub struct AckResponse {
    pub message: String,
}

impl AckResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReflectionResponse {
    pub reflection: Option<Reflection>,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Whether worker responses are simulated
    pub shadow_mode: bool,

    /// Conversations with a live worker
    pub active_tasks: usize,
}
