use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use control::{ControlState, DryRunEngine, SimulationWorker, WorkerHandle};
use server_api::{
    end_simulation, poll_batch_creation, poll_render_finished, status, step_batch, step_sample,
    ApiContext,
};
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{
        BatchCreationReply, EndSimulationReply, RenderFinishedReply, SimulationStatus,
        StepBatchReply, StepSampleReply, StepSampleRequest,
    },
};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;

use app_state::AppState;
use config::{load_settings, Settings};

const MAX_REQUEST_BYTES: usize = 16 * 1024;

type HttpError = (StatusCode, Json<ApiError>);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    // Inbound calls are served by a small fixed pool; generation work never runs on it.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.service_threads)
        .thread_name("control-service")
        .enable_all()
        .build()?;
    runtime.block_on(serve(settings))
}

async fn serve(settings: Settings) -> anyhow::Result<()> {
    let control = Arc::new(ControlState::new(settings.output_id_offset));
    let worker = SimulationWorker::new(
        Arc::clone(&control),
        DryRunEngine::new(settings.dry_run_config()),
    )
    .with_idle_interval(settings.worker_idle())
    .spawn()?;

    let state = AppState {
        api: ApiContext::new(Arc::clone(&control)),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        %addr,
        run_id = %control.run_id().0,
        output_id_offset = control.output_id_offset(),
        output_path = %settings.output_path.display(),
        "control service listening"
    );

    end_on_interrupt(Arc::clone(&control));
    axum::serve(listener, app)
        .with_graceful_shutdown(worker_finished(worker, settings.shutdown_linger()))
        .await?;
    info!("control service stopped");
    Ok(())
}

fn end_on_interrupt(control: Arc<ControlState>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; ending simulation");
            if control.request_end().is_err() {
                debug!("simulation was already ending");
            }
        }
    });
}

// Resolves once the worker has shut the engine down, so the process lifetime
// is exactly one simulation run.
async fn worker_finished(worker: WorkerHandle, linger: Duration) {
    match tokio::task::spawn_blocking(move || worker.join()).await {
        Ok(Ok(())) => info!("scene worker exited"),
        Ok(Err(_)) => error!("scene worker thread panicked"),
        Err(error) => error!(%error, "failed to join scene worker"),
    }
    tokio::time::sleep(linger).await;
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(http_status))
        .route("/step/batch", post(http_step_batch))
        .route("/step/sample", post(http_step_sample))
        .route("/poll/batch", get(http_poll_batch))
        // Draining the manifest mutates state, so this poll is not a GET.
        .route("/poll/render", post(http_poll_render))
        .route("/end", post(http_end_simulation))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::ProtocolSequence => StatusCode::CONFLICT,
        ErrorCode::AlreadyEnded => StatusCode::GONE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn http_error(err: ApiError) -> HttpError {
    (status_for(err.code), Json(err))
}

async fn http_status(State(state): State<Arc<AppState>>) -> Json<SimulationStatus> {
    Json(status(&state.api))
}

async fn http_step_batch(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StepBatchReply>, HttpError> {
    step_batch(&state.api).map(Json).map_err(http_error)
}

async fn http_step_sample(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<StepSampleRequest>, JsonRejection>,
) -> Result<Json<StepSampleReply>, HttpError> {
    let Json(req) = payload.map_err(|rejection| {
        let status = match rejection.status() {
            StatusCode::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        };
        let err = ApiError::new(
            ErrorCode::Validation,
            format!("invalid sample request: {}", rejection.body_text()),
        );
        (status, Json(err))
    })?;
    let reply = step_sample(&state.api, &req.pose).map_err(http_error)?;
    info!(
        batch_id = %reply.batch_id,
        sample_id = %reply.sample_id,
        coalesced = reply.coalesced,
        "sample step accepted"
    );
    Ok(Json(reply))
}

async fn http_poll_batch(
    State(state): State<Arc<AppState>>,
) -> Result<Json<BatchCreationReply>, HttpError> {
    poll_batch_creation(&state.api)
        .map(Json)
        .map_err(http_error)
}

async fn http_poll_render(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RenderFinishedReply>, HttpError> {
    poll_render_finished(&state.api)
        .map(Json)
        .map_err(http_error)
}

async fn http_end_simulation(
    State(state): State<Arc<AppState>>,
) -> Result<Json<EndSimulationReply>, HttpError> {
    end_simulation(&state.api).map(Json).map_err(http_error)
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
