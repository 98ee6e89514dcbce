use std::sync::Arc;

use control::{ControlError, ControlState};
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{
        BatchCreationReply, EndSimulationReply, RenderFinishedReply, SensorPoseRequest,
        SimulationStatus, StepBatchReply, StepSampleReply,
    },
};
use tracing::debug;

#[derive(Clone)]
pub struct ApiContext {
    pub control: Arc<ControlState>,
}

impl ApiContext {
    pub fn new(control: Arc<ControlState>) -> Self {
        Self { control }
    }
}

pub fn step_batch(ctx: &ApiContext) -> Result<StepBatchReply, ApiError> {
    let ack = ctx.control.request_batch().map_err(rejected)?;
    Ok(StepBatchReply {
        accepted: true,
        coalesced: ack.coalesced,
    })
}

pub fn step_sample(ctx: &ApiContext, pose: &SensorPoseRequest) -> Result<StepSampleReply, ApiError> {
    let ticket = ctx.control.request_sample(pose).map_err(rejected)?;
    Ok(StepSampleReply {
        accepted: true,
        coalesced: ticket.coalesced,
        batch_id: ticket.batch_id,
        sample_id: ticket.sample_id,
    })
}

pub fn poll_batch_creation(ctx: &ApiContext) -> Result<BatchCreationReply, ApiError> {
    let poll = ctx.control.poll_batch_status().map_err(rejected)?;
    Ok(BatchCreationReply {
        state: poll.state,
        error: poll.error,
    })
}

pub fn poll_render_finished(ctx: &ApiContext) -> Result<RenderFinishedReply, ApiError> {
    let poll = ctx.control.poll_render_status().map_err(rejected)?;
    Ok(RenderFinishedReply {
        state: poll.state,
        file_paths: poll.file_paths,
        error: poll.error,
    })
}

pub fn end_simulation(ctx: &ApiContext) -> Result<EndSimulationReply, ApiError> {
    ctx.control.request_end().map_err(rejected)?;
    Ok(EndSimulationReply { accepted: true })
}

pub fn status(ctx: &ApiContext) -> SimulationStatus {
    ctx.control.status()
}

fn rejected(err: ControlError) -> ApiError {
    debug!(error = %err, "control request rejected");
    let code = match &err {
        ControlError::InvalidPose(_) => ErrorCode::Validation,
        ControlError::Sequence(_) => ErrorCode::ProtocolSequence,
        ControlError::AlreadyEnded => ErrorCode::AlreadyEnded,
    };
    ApiError::new(code, err.to_string())
}
