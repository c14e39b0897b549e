//! Mission progress reporting.

use async_trait::async_trait;
use serde::Serialize;

use super::types::{MissionBlueprint, NodeStatus};
use crate::supervisor::output::escape_html;

pub const ACTION_EXECUTION_SUCCESS: &str = "EXECUTION_SUCCESS";
pub const ACTION_EXECUTION_FAILURE: &str = "EXECUTION_FAILURE";
pub const ACTION_INTERNAL_SYNC: &str = "INTERNAL_SYNC";

pub const INTEGRITY_OK: &str = "100%";
pub const INTEGRITY_ERROR: &str = "ERROR";

/// One per-node progress notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryBurst {
    pub node_id: u32,
    pub action: String,
    pub logic: String,
    pub integrity: String,
}

impl TelemetryBurst {
    pub fn new(node_id: u32, action: &str, logic: impl Into<String>, integrity: &str) -> Self {
        Self {
            node_id,
            action: action.to_string(),
            logic: logic.into(),
            integrity: integrity.to_string(),
        }
    }

    /// HTML rendering for chat delivery.
    pub fn render(&self) -> String {
        format!(
            "🛰️ <b>Telemetry Burst [Node-{}]</b>\n\n\
             <b>Action</b>: {}\n\
             <b>Logic</b>: <i>{}</i>\n\
             <b>Integrity</b>: {}\n\n\
             Uplink stable. Next sub-node initiating...",
            self.node_id,
            escape_html(&self.action),
            escape_html(&self.logic),
            escape_html(&self.integrity)
        )
    }
}

/// Where mission progress goes. Delivery failures are the sink's problem;
/// the runner never waits on or reacts to them.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn telemetry(&self, burst: &TelemetryBurst);

    async fn final_report(&self, blueprint: &MissionBlueprint);
}

/// Completion summary offering the advisory `sync` and `archive` follow-ups.
pub fn render_final_report(blueprint: &MissionBlueprint) -> String {
    format!(
        "🏁 <b>Mission Accomplished</b>\n\n\
         <b>ID</b>: {}\n\
         <b>Objective</b>: <i>{}</i>\n\n\
         All sub-nodes verified. Architectural integrity confirmed.\n\
         Follow-ups: sync (push to uplink) or archive (keep locally).",
        escape_html(&blueprint.id),
        escape_html(&blueprint.objective)
    )
}

/// Blueprint summary shown when a mission is planned.
pub fn format_blueprint(blueprint: &MissionBlueprint) -> String {
    let nodes = blueprint
        .nodes
        .iter()
        .map(|n| {
            let mark = match n.status {
                NodeStatus::Staged => "⬜",
                NodeStatus::Completed => "✅",
            };
            format!("[{}] Node-{}: {}", mark, n.id, n.task)
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "🛰️ <b>Mission Blueprint: {}</b>\n\n\
         <b>Objective</b>: <i>{}</i>\n\n\
         <b>Sub-Nodes</b>:\n{}\n\n\
         Confirm to initiate the Mission Control Protocol.",
        escape_html(&blueprint.id),
        escape_html(&blueprint.objective),
        escape_html(&nodes)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_escapes_logic() {
        let burst = TelemetryBurst::new(2, ACTION_EXECUTION_FAILURE, "Error: <stdin> & co", INTEGRITY_ERROR);
        let text = burst.render();
        assert!(text.contains("Telemetry Burst [Node-2]"));
        assert!(text.contains("<b>Action</b>: EXECUTION_FAILURE"));
        assert!(text.contains("<i>Error: &lt;stdin&gt; &amp; co</i>"));
        assert!(text.contains("<b>Integrity</b>: ERROR"));
    }

    #[test]
    fn blueprint_marks_completed_nodes() {
        let mut bp = MissionBlueprint::technical("Ship <v2>");
        bp.nodes[0].status = NodeStatus::Completed;
        let text = format_blueprint(&bp);
        assert!(text.contains("[✅] Node-1: Environment Preparation"));
        assert!(text.contains("[⬜] Node-2: Core Logic Implementation"));
        assert!(text.contains("[⬜] Node-3: Verification &amp; Audit"));
        assert!(text.contains("<i>Ship &lt;v2&gt;</i>"));
    }

    #[test]
    fn final_report_names_mission() {
        let bp = MissionBlueprint::technical("Improve Core");
        let text = render_final_report(&bp);
        assert!(text.contains("Mission Accomplished"));
        assert!(text.contains(&bp.id));
        assert!(text.contains("<i>Improve Core</i>"));
    }
}
