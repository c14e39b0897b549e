//! Mission blueprint data model.
//!
//! The persisted document has the shape
//! `{ state, blueprint: { id, objective, type, params?, nodes: [{ id, task, status, command?, args? }] } }`.

use serde::{Deserialize, Serialize};

/// Objective prefix selecting a reflection blueprint: `REFLECT:<MODE>:<summary>`.
pub const REFLECTION_PREFIX: &str = "REFLECT:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlueprintType {
    Technical,
    Reflection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Staged,
    Completed,
}

/// Persisted phase of a mission. Completed and aborted missions are deleted,
/// so they have no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionPhase {
    Staging,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectionParams {
    pub mode: String,
    pub summary: String,
}

/// One step of a blueprint. A node without `command` is an internal step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: u32,
    pub task: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
}

impl Node {
    fn internal(id: u32, task: &str) -> Self {
        Self {
            id,
            task: task.to_string(),
            status: NodeStatus::Staged,
            command: None,
            args: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == NodeStatus::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionBlueprint {
    pub id: String,
    pub objective: String,
    #[serde(rename = "type")]
    pub kind: BlueprintType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<ReflectionParams>,
    pub nodes: Vec<Node>,
}

impl MissionBlueprint {
    /// Generic three-step technical plan.
    pub fn technical(objective: &str) -> Self {
        Self {
            id: new_blueprint_id(),
            objective: objective.to_string(),
            kind: BlueprintType::Technical,
            params: None,
            nodes: vec![
                Node::internal(1, "Environment Preparation"),
                Node::internal(2, "Core Logic Implementation"),
                Node::internal(3, "Verification & Audit"),
            ],
        }
    }

    /// Two-step reflection plan: a generator process, then an internal staging step.
    pub fn reflection(objective: &str, params: ReflectionParams, command: &str, script: &str) -> Self {
        let generator = Node {
            id: 1,
            task: "Prime Intelligence Consultation".to_string(),
            status: NodeStatus::Staged,
            command: Some(command.to_string()),
            args: Some(vec![
                script.to_string(),
                params.summary.clone(),
                params.mode.clone(),
            ]),
        };
        Self {
            id: new_blueprint_id(),
            objective: objective.to_string(),
            kind: BlueprintType::Reflection,
            params: Some(params),
            nodes: vec![generator, Node::internal(2, "Staging Area Preparation")],
        }
    }

    pub fn node(&self, id: u32) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn is_complete(&self) -> bool {
        self.nodes.iter().all(Node::is_completed)
    }
}

/// The single persisted mission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionState {
    pub state: MissionPhase,
    pub blueprint: MissionBlueprint,
}

/// Split a `REFLECT:<MODE>:<summary>` objective. The summary keeps any further colons.
pub fn parse_reflection_directive(objective: &str) -> Option<ReflectionParams> {
    let rest = objective.strip_prefix(REFLECTION_PREFIX)?;
    let (mode, summary) = rest.split_once(':').unwrap_or((rest, ""));
    Some(ReflectionParams {
        mode: mode.to_string(),
        summary: summary.to_string(),
    })
}

fn new_blueprint_id() -> String {
    format!("{:x}", chrono::Utc::now().timestamp_millis())
}
