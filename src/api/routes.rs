//! HTTP routes and application state.

use std::future::IntoFuture;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::events::{self, BroadcastTransport};
use super::types::{
    AckResponse, ApprovalResponse, HealthResponse, PlanMissionRequest, PlanMissionResponse,
    ReflectionResponse, SubmitMessageRequest, SubmitMessageResponse, UpdateSettingsRequest,
};
use crate::config::Config;
use crate::mission::reflection::{DispatchError, ReflectionBuffer};
use crate::mission::runner::{MissionError, MissionRunner};
use crate::mission::store::FileMissionStore;
use crate::mission::telemetry::format_blueprint;
use crate::mission::types::MissionState;
use crate::mission::ProcessNodeExecutor;
use crate::settings::{ChatSettings, ChatSettingsStore, SharedChatSettings};
use crate::supervisor::ProcessSupervisor;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub settings: SharedChatSettings,
    pub transport: Arc<BroadcastTransport>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub missions: Arc<MissionRunner>,
    /// Cancelled once shutdown begins; open event streams end on it.
    pub shutdown_token: CancellationToken,
}

impl AppState {
    /// Wire every component from configuration and recover persisted state.
    pub async fn build(config: Config) -> Arc<Self> {
        let settings: SharedChatSettings = Arc::new(ChatSettingsStore::load(&config.settings_file()));
        let transport = Arc::new(BroadcastTransport::new(
            EVENT_CHANNEL_CAPACITY,
            config.authorized_chat_id.clone(),
        ));
        let supervisor = Arc::new(ProcessSupervisor::from_config(
            &config,
            Arc::clone(&settings),
            transport.clone(),
        ));

        let executor = ProcessNodeExecutor::new(&config.app_root)
            .with_env("NODE_ENV", &config.worker.env_name);
        let missions = Arc::new(MissionRunner::new(
            Arc::new(FileMissionStore::new(config.mission_file())),
            Arc::new(executor),
            transport.clone(),
            Arc::new(ReflectionBuffer::new()),
            config.mission.clone(),
        ));
        if let Some(state) = missions.restore().await {
            info!(mission_id = %state.blueprint.id, state = ?state.state, "Mission state loaded");
        }

        Arc::new(Self {
            config,
            settings,
            transport,
            supervisor,
            missions,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Kill lingering workers, bounded by the configured grace window.
    pub async fn shutdown(&self) {
        match tokio::time::timeout(self.config.shutdown_grace, self.supervisor.shutdown()).await {
            Ok(killed) => info!(killed, "Worker shutdown complete"),
            Err(_) => warn!("Worker shutdown exceeded grace window; exiting anyway"),
        }
    }
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/events", get(events::stream))
        .route("/chats/:chat_id/messages", post(submit_message))
        .route("/chats/:chat_id/approve", post(approve))
        .route("/chats/:chat_id/reject", post(reject))
        .route("/chats/:chat_id/settings", get(get_settings).put(update_settings))
        .route("/chats/:chat_id/settings/reset", post(reset_settings))
        .route("/mission", get(get_mission).post(plan_mission).delete(clear_mission))
        .route("/mission/start", post(start_mission))
        .route("/mission/sync", post(sync_mission))
        .route("/mission/archive", post(archive_mission))
        .route("/reflection", get(get_reflection).delete(purge_reflection))
        .route("/reflection/dispatch", post(dispatch_reflection))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server and run until a shutdown signal arrives.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::build(config).await;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);

    let token = state.shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });
    let served = run_server(listener, Arc::clone(&state)).await;

    info!("Shutting down");
    state.shutdown().await;
    served?;
    Ok(())
}

/// Serve until the shutdown token fires. Connections still open after the
/// grace window are abandoned.
async fn run_server(listener: tokio::net::TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    let token = state.shutdown_token.clone();
    let grace = state.config.shutdown_grace;
    let signal = {
        let token = token.clone();
        async move { token.cancelled().await }
    };
    let server = axum::serve(listener, router(state))
        .with_graceful_shutdown(signal)
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        served = &mut server => served,
        _ = async {
            token.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!("Connections still open after the grace window; closing anyway");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

// ─────────────────────────────────────────────────────────────────────────────
// Chat
// ─────────────────────────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        shadow_mode: state.config.worker.shadow_mode,
        active_tasks: state.supervisor.active_count().await,
    })
}

/// Run the message in the background; the outcome arrives on the event stream.
async fn submit_message(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<String>,
    Json(req): Json<SubmitMessageRequest>,
) -> Result<(StatusCode, Json<SubmitMessageResponse>), (StatusCode, String)> {
    let text = req.text.trim().to_string();
    if text.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Message text is empty".to_string()));
    }

    let interrupts_previous = state.supervisor.is_running(&chat_id).await;
    let supervisor = Arc::clone(&state.supervisor);
    let transport = Arc::clone(&state.transport);
    let chat = chat_id.clone();
    tokio::spawn(async move {
        let outcome = supervisor.submit(&chat, &text).await;
        transport.deliver_outcome(&chat, &outcome);
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitMessageResponse {
            chat_id,
            interrupts_previous,
        }),
    ))
}

async fn approve(State(state): State<Arc<AppState>>, Path(chat_id): Path<String>) -> Json<ApprovalResponse> {
    resolve(&state, &chat_id, true).await
}

async fn reject(State(state): State<Arc<AppState>>, Path(chat_id): Path<String>) -> Json<ApprovalResponse> {
    resolve(&state, &chat_id, false).await
}

async fn resolve(state: &AppState, chat_id: &str, approved: bool) -> Json<ApprovalResponse> {
    let resolved = state.supervisor.resolve(chat_id, approved).await;
    Json(ApprovalResponse {
        resolved,
        message: resolved.message().to_string(),
    })
}

async fn get_settings(State(state): State<Arc<AppState>>, Path(chat_id): Path<String>) -> Json<ChatSettings> {
    Json(state.settings.get_or_default(&chat_id).await)
}

async fn update_settings(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<String>,
    Json(req): Json<UpdateSettingsRequest>,
) -> Result<Json<ChatSettings>, (StatusCode, String)> {
    if req.temperature.is_none() && req.top_p.is_none() {
        return Err((StatusCode::BAD_REQUEST, "Nothing to update".to_string()));
    }
    if let Some(t) = req.temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err((StatusCode::BAD_REQUEST, "temperature must be within 0.0..=2.0".to_string()));
        }
    }
    if let Some(p) = req.top_p {
        if !(0.0..=1.0).contains(&p) {
            return Err((StatusCode::BAD_REQUEST, "topP must be within 0.0..=1.0".to_string()));
        }
    }

    let mut updated = state.settings.get_or_default(&chat_id).await;
    if let Some(t) = req.temperature {
        updated = state.settings.set_temperature(&chat_id, t).await;
        info!(chat_id = %chat_id, temperature = t, "Temperature updated");
    }
    if let Some(p) = req.top_p {
        updated = state.settings.set_top_p(&chat_id, p).await;
        info!(chat_id = %chat_id, top_p = p, "Top-P updated");
    }
    Ok(Json(updated))
}

async fn reset_settings(State(state): State<Arc<AppState>>, Path(chat_id): Path<String>) -> Json<ChatSettings> {
    info!(chat_id = %chat_id, "Settings reset");
    Json(state.settings.reset(&chat_id).await)
}

// ─────────────────────────────────────────────────────────────────────────────
// Missions
// ─────────────────────────────────────────────────────────────────────────────

fn mission_error(e: MissionError) -> (StatusCode, String) {
    let status = match &e {
        MissionError::NoActiveMission => StatusCode::NOT_FOUND,
        MissionError::AlreadyRunning => StatusCode::CONFLICT,
        MissionError::Aborted => StatusCode::GONE,
        MissionError::NodeFailed { .. } | MissionError::ReflectionParse(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, e.to_string())
}

async fn get_mission(State(state): State<Arc<AppState>>) -> Json<Option<MissionState>> {
    Json(state.missions.current().await)
}

async fn plan_mission(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PlanMissionRequest>,
) -> Result<Json<PlanMissionResponse>, (StatusCode, String)> {
    let objective = req.objective.trim();
    if objective.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Objective is empty".to_string()));
    }
    let blueprint = state.missions.plan(objective).await.map_err(mission_error)?;
    let text = format_blueprint(&blueprint);
    Ok(Json(PlanMissionResponse { blueprint, text }))
}

/// Start the staged mission in the background; progress arrives as telemetry.
async fn start_mission(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<AckResponse>), (StatusCode, String)> {
    if state.missions.current().await.is_none() {
        return Err(mission_error(MissionError::NoActiveMission));
    }
    let run = state.missions.try_begin().map_err(mission_error)?;

    let transport = Arc::clone(&state.transport);
    tokio::spawn(async move {
        match run.run().await {
            Ok(blueprint) => info!(mission_id = %blueprint.id, "Mission run finished"),
            Err(MissionError::Aborted) => info!("Mission run stopped by abort"),
            Err(e @ (MissionError::NoActiveMission | MissionError::AlreadyRunning)) => {
                info!("Mission run did not start: {}", e)
            }
            Err(e) => {
                error!("Mission run failed: {}", e);
                transport.send_to_mission_chat(format!(
                    "❌ <b>Mission Failed</b>: {}",
                    crate::supervisor::output::escape_html(&e.to_string())
                ));
            }
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(AckResponse::new("Mission Control Protocol initiated.")),
    ))
}

async fn clear_mission(State(state): State<Arc<AppState>>) -> Json<AckResponse> {
    state.missions.clear().await;
    Json(AckResponse::new("Mission Aborted. Blueprint purged."))
}

async fn sync_mission() -> Json<AckResponse> {
    Json(AckResponse::new("Uplink sync initiated."))
}

async fn archive_mission() -> Json<AckResponse> {
    Json(AckResponse::new("Mission archived locally."))
}

// ─────────────────────────────────────────────────────────────────────────────
// Reflections
// ─────────────────────────────────────────────────────────────────────────────

async fn get_reflection(State(state): State<Arc<AppState>>) -> Json<ReflectionResponse> {
    Json(ReflectionResponse {
        reflection: state.missions.reflections().peek().await,
    })
}

async fn purge_reflection(State(state): State<Arc<AppState>>) -> Json<AckResponse> {
    state.missions.reflections().purge().await;
    Json(AckResponse::new("Dispatch purged. Reflection cleared from buffer."))
}

async fn dispatch_reflection(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReflectionResponse>, (StatusCode, String)> {
    match state.missions.reflections().dispatch(state.transport.as_ref()).await {
        Ok(reflection) => Ok(Json(ReflectionResponse {
            reflection: Some(reflection),
        })),
        Err(e @ DispatchError::NothingPending) => Err((StatusCode::NOT_FOUND, e.to_string())),
        Err(e @ DispatchError::Publish(_)) => Err((StatusCode::BAD_GATEWAY, e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::events::UplinkEvent;
    use crate::mission::types::BlueprintType;
    use crate::supervisor::ApprovalResolution;

    async fn state(dir: &tempfile::TempDir, authorized: Option<&str>) -> Arc<AppState> {
        let mut config = Config::new(dir.path().to_path_buf());
        config.worker.shadow_mode = true;
        config.authorized_chat_id = authorized.map(str::to_string);
        AppState::build(config).await
    }

    #[tokio::test]
    async fn shadow_message_is_delivered_on_the_stream() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(&dir, None).await;
        let mut rx = state.transport.subscribe();

        let (status, Json(body)) = submit_message(
            State(state.clone()),
            Path("42".to_string()),
            Json(SubmitMessageRequest {
                text: "ping".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(!body.interrupts_previous);

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("outcome delivered")
            .unwrap();
        match event {
            UplinkEvent::Message { chat_id, text } => {
                assert_eq!(chat_id, "42");
                assert!(text.contains("ping"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(&dir, None).await;
        let err = submit_message(
            State(state),
            Path("42".to_string()),
            Json(SubmitMessageRequest {
                text: "   ".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn approval_without_session_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(&dir, None).await;
        let Json(body) = approve(State(state.clone()), Path("1".to_string())).await;
        assert_eq!(body.resolved, ApprovalResolution::NoActiveSession);
        let Json(body) = reject(State(state), Path("1".to_string())).await;
        assert_eq!(body.message, "Session not found or already finished.");
    }

    #[tokio::test]
    async fn settings_update_and_reset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(&dir, None).await;

        let Json(initial) = get_settings(State(state.clone()), Path("5".to_string())).await;
        assert_eq!(initial, ChatSettings::default());

        let Json(updated) = update_settings(
            State(state.clone()),
            Path("5".to_string()),
            Json(UpdateSettingsRequest {
                temperature: Some(0.2),
                top_p: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(updated.temperature, Some(0.2));
        assert_eq!(updated.top_p, Some(1.0));

        let err = update_settings(
            State(state.clone()),
            Path("5".to_string()),
            Json(UpdateSettingsRequest {
                temperature: None,
                top_p: Some(3.0),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let Json(reset) = reset_settings(State(state.clone()), Path("5".to_string())).await;
        assert_eq!(reset, ChatSettings::default());
        assert!(dir.path().join("data").join("settings.json").exists());
    }

    #[tokio::test]
    async fn mission_plan_run_and_clear() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(&dir, Some("7")).await;
        let mut rx = state.transport.subscribe();

        let err = start_mission(State(state.clone())).await.unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);

        let Json(planned) = plan_mission(
            State(state.clone()),
            Json(PlanMissionRequest {
                objective: "Improve Core".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(planned.blueprint.kind, BlueprintType::Technical);
        assert!(planned.text.contains("[⬜] Node-1: Environment Preparation"));
        assert!(dir.path().join("data").join("active_mission.json").exists());

        let (status, _) = start_mission(State(state.clone())).await.unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        let mut names = Vec::new();
        while names.last() != Some(&"mission_report") {
            let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .expect("mission progress")
                .unwrap();
            names.push(event.event_name());
        }
        assert_eq!(names, vec!["telemetry", "telemetry", "telemetry", "mission_report"]);
        assert!(state.missions.current().await.is_none());

        // Advisory follow-ups never resurrect the mission.
        sync_mission().await;
        archive_mission().await;
        clear_mission(State(state.clone())).await;
        clear_mission(State(state.clone())).await;
        let Json(current) = get_mission(State(state)).await;
        assert!(current.is_none());
    }

    #[tokio::test]
    async fn second_start_is_refused_while_first_runs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(&dir, Some("7")).await;
        let mut rx = state.transport.subscribe();
        plan_mission(
            State(state.clone()),
            Json(PlanMissionRequest {
                objective: "Improve Core".to_string(),
            }),
        )
        .await
        .unwrap();

        let (status, _) = start_mission(State(state.clone())).await.unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        let err = start_mission(State(state.clone())).await.unwrap_err();
        assert_eq!(err.0, StatusCode::CONFLICT);

        let mut events = Vec::new();
        while events.last().map(UplinkEvent::event_name) != Some("mission_report") {
            let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .expect("mission progress")
                .unwrap();
            events.push(event);
        }
        assert!(events.iter().all(|e| e.event_name() != "message"));
        assert!(!state.missions.is_running());
    }

    #[tokio::test]
    async fn shutdown_ends_open_event_streams() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::new(dir.path().to_path_buf());
        config.worker.shadow_mode = true;
        config.shutdown_grace = std::time::Duration::from_secs(60);
        let state = AppState::build(config).await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(run_server(listener, Arc::clone(&state)));

        let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"GET /api/events HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut buf = vec![0u8; 4096];
        let mut read = None;
        for _ in 0..100 {
            state.transport.send_message("0", "ping".to_string());
            if let Ok(n) = tokio::time::timeout(std::time::Duration::from_millis(50), conn.read(&mut buf)).await {
                read = Some(n.unwrap());
                break;
            }
        }
        let n = read.expect("stream opened");
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200"));

        state.shutdown_token.cancel();
        let served = tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("server stopped with a stream still connected")
            .expect("join");
        assert!(served.is_ok());
    }

    #[tokio::test]
    async fn dispatch_without_reflection_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(&dir, None).await;
        let err = dispatch_reflection(State(state.clone())).await.unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
        let Json(body) = get_reflection(State(state)).await;
        assert!(body.reflection.is_none());
    }
}
