use super::*;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use shared::{
    domain::{BatchCreationState, BatchId, RenderingState, RunId, SampleId},
    error::ErrorCode,
};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

const FAST: PollSettings = PollSettings {
    interval: Duration::from_millis(5),
    timeout: Duration::from_secs(5),
};

#[derive(Clone, Default)]
struct MockService {
    status_calls: Arc<Mutex<u32>>,
    received_poses: Arc<Mutex<Vec<SensorPoseRequest>>>,
    render_polls: Arc<Mutex<u32>>,
}

fn status_reply(calls: u32) -> SimulationStatus {
    // The sample is claimed on the second status call and finished on the third.
    let (sample_requested, rendering_state, sample_id) = match calls {
        0 => (true, RenderingState::Done, SampleId(1)),
        1 => (false, RenderingState::InProgress, SampleId(2)),
        _ => (false, RenderingState::Done, SampleId(2)),
    };
    SimulationStatus {
        run_id: RunId::new(),
        started_at: Utc::now(),
        output_id_offset: 10,
        batch_id: BatchId(11),
        sample_id,
        batch_state: BatchCreationState::Idle,
        rendering_state,
        batch_requested: false,
        sample_requested,
        batches_completed: 1,
        samples_completed: u64::from(calls.min(2)),
        end_requested: false,
        ended: false,
        last_error: None,
    }
}

async fn status_handler(State(mock): State<MockService>) -> Json<SimulationStatus> {
    let mut calls = mock.status_calls.lock().expect("lock");
    let reply = status_reply(*calls);
    *calls += 1;
    Json(reply)
}

async fn step_sample_handler(
    State(mock): State<MockService>,
    Json(req): Json<StepSampleRequest>,
) -> Json<StepSampleReply> {
    mock.received_poses.lock().expect("lock").push(req.pose);
    Json(StepSampleReply {
        accepted: true,
        coalesced: false,
        batch_id: BatchId(11),
        sample_id: SampleId(2),
    })
}

async fn poll_render_handler(State(mock): State<MockService>) -> Json<RenderFinishedReply> {
    let mut polls = mock.render_polls.lock().expect("lock");
    *polls += 1;
    let file_paths = if *polls == 1 {
        vec!["output/batch_0011/rgb/0002_rgb.json".to_string()]
    } else {
        Vec::new()
    };
    Json(RenderFinishedReply {
        state: RenderingState::Done,
        file_paths,
        error: None,
    })
}

async fn step_batch_conflict() -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::GONE,
        Json(ApiError::new(
            ErrorCode::AlreadyEnded,
            "the simulation has ended",
        )),
    )
}

async fn spawn_mock(mock: MockService) -> anyhow::Result<String> {
    let app = Router::new()
        .route("/status", get(status_handler))
        .route("/step/sample", post(step_sample_handler))
        .route("/step/batch", post(step_batch_conflict))
        .route("/poll/render", post(poll_render_handler))
        .with_state(mock);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}"))
}

#[test]
fn rejects_unparsable_server_url() {
    let err = SimulationClient::new("not a url").err().expect("invalid");
    assert!(matches!(err, ClientError::InvalidUrl(_)));
}

#[test]
fn base_path_is_kept_when_joining_endpoints() {
    let client = SimulationClient::new("http://localhost:50051/sim").expect("client");
    assert_eq!(client.server_url().as_str(), "http://localhost:50051/sim/");
    assert_eq!(
        client.endpoint("poll/render").expect("join").as_str(),
        "http://localhost:50051/sim/poll/render"
    );
}

#[tokio::test]
async fn step_sample_sends_pose_and_returns_ticket() {
    let mock = MockService::default();
    let url = spawn_mock(mock.clone()).await.expect("mock");
    let client = SimulationClient::new(&url).expect("client");

    let pose = SensorPoseRequest {
        x: Some(0.25),
        qw: Some(1.0),
        ..Default::default()
    };
    let ticket = client.step_sample(pose).await.expect("step");
    assert_eq!(ticket.batch_id, BatchId(11));
    assert_eq!(ticket.sample_id, SampleId(2));
    assert_eq!(*mock.received_poses.lock().expect("lock"), vec![pose]);
}

#[tokio::test]
async fn error_replies_become_api_exceptions() {
    let url = spawn_mock(MockService::default()).await.expect("mock");
    let client = SimulationClient::new(&url).expect("client");

    match client.step_batch().await {
        Err(ClientError::Api(err)) => assert_eq!(err.code, ErrorCode::AlreadyEnded),
        other => panic!("expected api error, got {other:?}"),
    }
}

#[tokio::test]
async fn wait_for_render_skips_stale_done_and_takes_manifest_once() {
    let mock = MockService::default();
    let url = spawn_mock(mock.clone()).await.expect("mock");
    let client = SimulationClient::new(&url).expect("client");

    let ticket = StepSampleReply {
        accepted: true,
        coalesced: false,
        batch_id: BatchId(11),
        sample_id: SampleId(2),
    };
    let reply = client.wait_for_render(&ticket, FAST).await.expect("render");
    assert_eq!(reply.state, RenderingState::Done);
    assert_eq!(reply.file_paths.len(), 1);
    assert_eq!(*mock.status_calls.lock().expect("lock"), 3);
    assert_eq!(*mock.render_polls.lock().expect("lock"), 1);
}

#[tokio::test]
async fn wait_for_render_times_out_when_ticket_never_completes() {
    let url = spawn_mock(MockService::default()).await.expect("mock");
    let client = SimulationClient::new(&url).expect("client");

    let ticket = StepSampleReply {
        accepted: true,
        coalesced: false,
        batch_id: BatchId(11),
        sample_id: SampleId(5),
    };
    let poll = PollSettings {
        interval: Duration::from_millis(5),
        timeout: Duration::from_millis(50),
    };
    match client.wait_for_render(&ticket, poll).await {
        Err(ClientError::Timeout { what, .. }) => assert_eq!(what, "sample render"),
        other => panic!("expected timeout, got {other:?}"),
    }
}

/// Replays status snapshots in order, repeating the last one.
#[derive(Clone)]
struct ScriptedService {
    statuses: Arc<Mutex<Vec<SimulationStatus>>>,
    status_calls: Arc<Mutex<u32>>,
    batch_reply: BatchCreationReply,
    render_reply: RenderFinishedReply,
}

impl ScriptedService {
    fn new(statuses: Vec<SimulationStatus>) -> Self {
        Self {
            statuses: Arc::new(Mutex::new(statuses)),
            status_calls: Arc::new(Mutex::new(0)),
            batch_reply: BatchCreationReply {
                state: BatchCreationState::Done,
                error: None,
            },
            render_reply: RenderFinishedReply {
                state: RenderingState::Done,
                file_paths: vec!["output/batch_0001/rgb/0001_rgb.json".to_string()],
                error: None,
            },
        }
    }
}

fn snapshot(batch_id: i64, sample_id: i64) -> SimulationStatus {
    let mut status = status_reply(2);
    status.batch_id = BatchId(batch_id);
    status.sample_id = SampleId(sample_id);
    status
}

async fn scripted_status(State(mock): State<ScriptedService>) -> Json<SimulationStatus> {
    *mock.status_calls.lock().expect("lock") += 1;
    let mut statuses = mock.statuses.lock().expect("lock");
    let reply = if statuses.len() > 1 {
        statuses.remove(0)
    } else {
        statuses[0].clone()
    };
    Json(reply)
}

async fn scripted_poll_batch(State(mock): State<ScriptedService>) -> Json<BatchCreationReply> {
    Json(mock.batch_reply.clone())
}

async fn scripted_poll_render(State(mock): State<ScriptedService>) -> Json<RenderFinishedReply> {
    Json(mock.render_reply.clone())
}

async fn spawn_scripted(mock: ScriptedService) -> anyhow::Result<String> {
    let app = Router::new()
        .route("/status", get(scripted_status))
        .route("/poll/batch", get(scripted_poll_batch))
        .route("/poll/render", post(scripted_poll_render))
        .with_state(mock);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}"))
}

fn ticket(batch_id: i64, sample_id: i64) -> StepSampleReply {
    StepSampleReply {
        accepted: true,
        coalesced: false,
        batch_id: BatchId(batch_id),
        sample_id: SampleId(sample_id),
    }
}

#[tokio::test]
async fn wait_for_batch_waits_out_pending_and_in_progress() {
    let mut pending = snapshot(1, 0);
    pending.batch_requested = true;
    pending.batch_state = BatchCreationState::Done;
    let mut running = snapshot(2, 0);
    running.batch_state = BatchCreationState::InProgress;
    let mut done = snapshot(2, 0);
    done.batch_state = BatchCreationState::Done;

    let mock = ScriptedService::new(vec![pending, running, done]);
    let url = spawn_scripted(mock.clone()).await.expect("mock");
    let client = SimulationClient::new(&url).expect("client");

    let reply = client.wait_for_batch(FAST).await.expect("batch");
    assert_eq!(reply.state, BatchCreationState::Done);
    assert_eq!(*mock.status_calls.lock().expect("lock"), 3);
}

#[tokio::test]
async fn failed_batch_becomes_engine_failure() {
    let mut failed = snapshot(1, 0);
    failed.batch_state = BatchCreationState::Failed;
    let mut mock = ScriptedService::new(vec![failed]);
    mock.batch_reply = BatchCreationReply {
        state: BatchCreationState::Failed,
        error: Some("terrain asset missing".to_string()),
    };
    let url = spawn_scripted(mock).await.expect("mock");
    let client = SimulationClient::new(&url).expect("client");

    match client.wait_for_batch(FAST).await {
        Err(ClientError::EngineFailed(message)) => assert_eq!(message, "terrain asset missing"),
        other => panic!("expected engine failure, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_render_becomes_engine_failure() {
    let mut failed = snapshot(1, 1);
    failed.rendering_state = RenderingState::Failed;
    let mut mock = ScriptedService::new(vec![failed]);
    mock.render_reply = RenderFinishedReply {
        state: RenderingState::Failed,
        file_paths: Vec::new(),
        error: Some("renderer crashed".to_string()),
    };
    let url = spawn_scripted(mock).await.expect("mock");
    let client = SimulationClient::new(&url).expect("client");

    match client.wait_for_render(&ticket(1, 1), FAST).await {
        Err(ClientError::EngineFailed(message)) => assert_eq!(message, "renderer crashed"),
        other => panic!("expected engine failure, got {other:?}"),
    }
}

#[tokio::test]
async fn newer_batch_supersedes_a_waiting_render() {
    let mut replaced = snapshot(3, 0);
    replaced.batch_state = BatchCreationState::InProgress;
    let url = spawn_scripted(ScriptedService::new(vec![replaced]))
        .await
        .expect("mock");
    let client = SimulationClient::new(&url).expect("client");

    match client.wait_for_render(&ticket(2, 4), FAST).await {
        Err(ClientError::EngineFailed(message)) => {
            assert_eq!(message, "sample 4 of batch 2 was superseded")
        }
        other => panic!("expected superseded sample, got {other:?}"),
    }
}
