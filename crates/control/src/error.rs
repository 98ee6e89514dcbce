use shared::error::PoseError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControlError {
    #[error("invalid sensor pose: {0}")]
    InvalidPose(#[from] PoseError),
    #[error("{0}")]
    Sequence(&'static str),
    #[error("simulation has already ended")]
    AlreadyEnded,
}
