use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use goldenpath_core::observer::spawn_observer_poller;
use goldenpath_core::roster::Roster;
use goldenpath_core::session::Session;
use goldenpath_core::types::PauseDecision;

use crate::AppState;

// ── Error helper ──────────────────────────────────────────────────────────

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

// ── Request body types ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct StartBody {
    pub session: String,
    #[serde(default)]
    pub services: Option<Vec<String>>,
    #[serde(default)]
    pub skip_qa: bool,
    #[serde(default)]
    pub user: String,
}

#[derive(Deserialize)]
pub(crate) struct SessionBody {
    pub session: String,
}

#[derive(Deserialize)]
pub(crate) struct ActionBody {
    pub session: String,
    pub action_id: String,
}

async fn session_for(state: &AppState, id: &str) -> Arc<Session> {
    let mut sessions = state.sessions.lock().await;
    if let Some(sess) = sessions.get(id) {
        return Arc::clone(sess);
    }
    let sess = Session::new(id);
    let roster = Roster::load(&state.config.roster_path());
    sess.init_from(&state.shared, roster).await;
    spawn_observer_poller(Arc::clone(&sess), Arc::clone(&state.shared));
    sessions.insert(id.to_string(), Arc::clone(&sess));
    sess
}

// ── Health ────────────────────────────────────────────────────────────────

pub(crate) async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ── Sessions ──────────────────────────────────────────────────────────────

/// Page-load entry: creates the session cell (starting its observer poller)
/// and returns the mirrored snapshot.
pub(crate) async fn open_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let sess = session_for(&state, &id).await;
    let inner = sess.state.lock().await;
    Ok(Json(json!({
        "session": id,
        "state": &inner.snap,
        "is_executor": inner.is_executor,
    })))
}

pub(crate) async fn session_state(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let sess = session_for(&state, &id).await;
    let inner = sess.state.lock().await;
    Ok(Json(json!({
        "state": &inner.snap,
        "is_executor": inner.is_executor,
        "roster": &inner.roster,
    })))
}

pub(crate) async fn select_run(
    State(state): State<Arc<AppState>>,
    Path((id, run_id)): Path<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    let sess = session_for(&state, &id).await;
    let mut inner = sess.state.lock().await;
    inner.select_run(&run_id);
    Ok(Json(json!({ "ok": true })))
}

// ── Pipeline control ──────────────────────────────────────────────────────

pub(crate) async fn start_pipeline(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartBody>,
) -> Result<Json<Value>, StatusCode> {
    let sess = session_for(&state, &body.session).await;
    let pipeline = Arc::clone(&state.pipeline);
    let user = body.user.clone();
    let services = body.services.clone();
    let skip_qa = body.skip_qa;
    tokio::spawn(async move {
        if let Err(e) = pipeline.start(&sess, services, skip_qa, &user).await {
            tracing::error!("pipeline run failed: {e:#}");
        }
    });
    Ok(Json(json!({ "ok": true })))
}

async fn pause_decision(
    state: &Arc<AppState>,
    body: &SessionBody,
    decision: PauseDecision,
) -> Json<Value> {
    // Mirror the decision into the caller's session and the shared slot so
    // the executor sees it wherever it runs.
    let sess = session_for(state, &body.session).await;
    sess.state.lock().await.pause_action = decision.as_str().to_string();
    state.shared.set_pause_action(decision.as_str());
    if decision == PauseDecision::Abort {
        state.shared.request_abort();
    }
    Json(json!({ "ok": true }))
}

pub(crate) async fn retry(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SessionBody>,
) -> Json<Value> {
    pause_decision(&state, &body, PauseDecision::Retry).await
}

pub(crate) async fn force_proceed(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SessionBody>,
) -> Json<Value> {
    pause_decision(&state, &body, PauseDecision::Proceed).await
}

pub(crate) async fn rollback(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SessionBody>,
) -> Json<Value> {
    pause_decision(&state, &body, PauseDecision::Rollback).await
}

pub(crate) async fn abort_pipeline(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SessionBody>,
) -> Json<Value> {
    pause_decision(&state, &body, PauseDecision::Abort).await
}

// ── Remediation actions ───────────────────────────────────────────────────

pub(crate) async fn approve_action(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ActionBody>,
) -> Json<Value> {
    let sess = session_for(&state, &body.session).await;
    let pipeline = Arc::clone(&state.pipeline);
    let action_id = body.action_id.clone();
    tokio::spawn(async move {
        pipeline.approve_action(&sess, &action_id).await;
    });
    Json(json!({ "ok": true }))
}

pub(crate) async fn skip_action(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ActionBody>,
) -> Json<Value> {
    let sess = session_for(&state, &body.session).await;
    state.pipeline.skip_action(&sess, &body.action_id).await;
    Json(json!({ "ok": true }))
}

// ── Roster ────────────────────────────────────────────────────────────────

pub(crate) async fn get_roster(State(state): State<Arc<AppState>>) -> Json<Roster> {
    Json(Roster::load(&state.config.roster_path()))
}

pub(crate) async fn put_roster(
    State(state): State<Arc<AppState>>,
    Json(roster): Json<Roster>,
) -> Result<Json<Value>, StatusCode> {
    roster
        .save(&state.config.roster_path())
        .map_err(internal)?;
    let mut sessions = state.sessions.lock().await;
    for sess in sessions.values_mut() {
        sess.state.lock().await.roster = roster.clone();
    }
    tracing::info!("Roster saved");
    Ok(Json(json!({ "ok": true })))
}

// ── Runs ──────────────────────────────────────────────────────────────────

pub(crate) async fn list_runs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let records = state.pipeline.run_store.load().map_err(internal)?;
    Ok(Json(json!(records)))
}

// ── Shared snapshot (debug / headless clients) ────────────────────────────

pub(crate) async fn shared_state(State(state): State<Arc<AppState>>) -> Json<Value> {
    let (snapshot, version) = state.shared.read();
    Json(json!({ "version": version, "state": snapshot }))
}

// ── SSE process logs ──────────────────────────────────────────────────────

/// Replay the log ring, then tail the live broadcast. Lagged subscribers
/// simply skip the lines they missed.
pub(crate) async fn sse_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (history, live) = state.process_log.subscribe();
    let stream = tokio_stream::iter(history)
        .chain(BroadcastStream::new(live).filter_map(|line| line.ok()))
        .map(|line| Ok::<_, std::convert::Infallible>(Event::default().data(line)));
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}

