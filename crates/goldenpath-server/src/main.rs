mod clients;
mod logging;
mod routes;

use std::{collections::HashMap, sync::Arc};

use axum::{
    routing::{get, post, put},
    Router,
};
use tokio::sync::Mutex as TokioMutex;
use tower_http::cors::CorsLayer;
use tracing::info;

use goldenpath_core::{
    config::Config,
    diagnostics::DiagnosticsEngine,
    llm::AnthropicModel,
    pipeline::Pipeline,
    registry::SharedState,
    session::Session,
};

use clients::{
    BasicEvidence, CliImageRegistry, JenkinsWorker, RestDeployController, RestSourceHost,
    WebhookNotifier,
};

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub config: Arc<Config>,
    pub shared: Arc<SharedState>,
    pub pipeline: Arc<Pipeline>,
    pub sessions: TokioMutex<HashMap<String, Arc<Session>>>,
    pub process_log: Arc<logging::ProcessLog>,
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let process_log = logging::ProcessLog::new();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "goldenpath_server=info,goldenpath_core=info,tower_http=warn".into()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(logging::ProcessLogLayer(Arc::clone(&process_log)))
        .init();

    let config = Arc::new(Config::from_env()?);
    std::fs::create_dir_all(&config.data_dir)?;

    let shared = Arc::new(SharedState::new(config.live_state_path()));
    // Surface any interrupted run from the previous process immediately in
    // the shared snapshot; sessions created later mirror it from here.
    if let Some(saved) = shared.load_from_disk() {
        let mut boot = goldenpath_core::session::SessionInner::new();
        boot.restore_from(saved);
        shared.publish(boot.snap, false);
    }

    let host = Arc::new(RestSourceHost::new(&config));
    let image_registry = Arc::new(CliImageRegistry::new(&config));
    let ci = Arc::new(JenkinsWorker::new(&config));
    let controller: Arc<RestDeployController> = Arc::new(RestDeployController::new(&config));
    let notifier = Arc::new(WebhookNotifier::new(&config));
    let model = Arc::new(AnthropicModel::new(
        config.api_key.clone(),
        config.model.clone(),
    ));
    let evidence = Arc::new(BasicEvidence::new(
        &config,
        Arc::clone(&controller) as Arc<dyn goldenpath_core::clients::DeployController>,
    ));
    let diagnostics = DiagnosticsEngine::new(model, evidence);

    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&config),
        Arc::clone(&shared),
        host,
        image_registry,
        ci,
        controller,
        notifier,
        diagnostics,
    ));

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        shared,
        pipeline,
        sessions: TokioMutex::new(HashMap::new()),
        process_log,
    });

    let app = Router::new()
        // Health
        .route("/api/health", get(routes::health))
        // Sessions
        .route("/api/sessions/:id", post(routes::open_session))
        .route("/api/sessions/:id/state", get(routes::session_state))
        .route("/api/sessions/:id/runs/:run_id", post(routes::select_run))
        // Pipeline
        .route("/api/pipeline/start", post(routes::start_pipeline))
        .route("/api/pipeline/retry", post(routes::retry))
        .route("/api/pipeline/proceed", post(routes::force_proceed))
        .route("/api/pipeline/rollback", post(routes::rollback))
        .route("/api/pipeline/abort", post(routes::abort_pipeline))
        // Remediation actions
        .route("/api/actions/approve", post(routes::approve_action))
        .route("/api/actions/skip", post(routes::skip_action))
        // Roster
        .route("/api/roster", get(routes::get_roster))
        .route("/api/roster", put(routes::put_roster))
        // Runs
        .route("/api/runs", get(routes::list_runs))
        // Shared snapshot
        .route("/api/state", get(routes::shared_state))
        // SSE logs
        .route("/api/logs", get(routes::sse_logs))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.web_bind, config.web_port);
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
