use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{BatchCreationState, BatchId, RenderingState, RunId, SampleId, SensorPose},
    error::PoseError,
};

const QUATERNION_NORM_TOLERANCE: f64 = 1e-3;

/// Per-sample pose metadata as sent by the client. Absent fields are zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SensorPoseRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qw: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qx: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qz: Option<f64>,
}

impl SensorPoseRequest {
    pub fn from_pose(pose: &SensorPose) -> Self {
        let [x, y, z] = pose.position;
        let [qw, qx, qy, qz] = pose.orientation;
        Self {
            x: Some(x),
            y: Some(y),
            z: Some(z),
            qw: Some(qw),
            qx: Some(qx),
            qy: Some(qy),
            qz: Some(qz),
        }
    }

    pub fn normalize(&self) -> Result<SensorPose, PoseError> {
        let position = [
            finite("x", self.x)?,
            finite("y", self.y)?,
            finite("z", self.z)?,
        ];

        let components = [
            ("qw", self.qw),
            ("qx", self.qx),
            ("qy", self.qy),
            ("qz", self.qz),
        ];
        let mut orientation = [0.0; 4];
        for (slot, (field, value)) in orientation.iter_mut().zip(components) {
            let value = finite(field, value)?;
            if !(-1.0..=1.0).contains(&value) {
                return Err(PoseError::ComponentOutOfRange { field, value });
            }
            *slot = value;
        }

        // An entirely absent orientation is accepted as the zero quaternion.
        if components.iter().any(|(_, value)| value.is_some()) {
            let norm = orientation.iter().map(|c| c * c).sum::<f64>().sqrt();
            if (norm - 1.0).abs() > QUATERNION_NORM_TOLERANCE {
                return Err(PoseError::NotUnitQuaternion { norm });
            }
        }

        Ok(SensorPose {
            position,
            orientation,
        })
    }
}

fn finite(field: &'static str, value: Option<f64>) -> Result<f64, PoseError> {
    let value = value.unwrap_or_default();
    if value.is_finite() {
        Ok(value)
    } else {
        Err(PoseError::NotFinite { field })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepSampleRequest {
    #[serde(default)]
    pub pose: SensorPoseRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepBatchReply {
    pub accepted: bool,
    /// True when an earlier batch request was still pending and absorbed this one.
    #[serde(default)]
    pub coalesced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSampleReply {
    pub accepted: bool,
    #[serde(default)]
    pub coalesced: bool,
    pub batch_id: BatchId,
    pub sample_id: SampleId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCreationReply {
    pub state: BatchCreationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderFinishedReply {
    pub state: RenderingState,
    #[serde(default)]
    pub file_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndSimulationReply {
    pub accepted: bool,
}

/// Read-only view of the whole control state, for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationStatus {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub output_id_offset: i64,
    /// Current batch id with the output offset applied.
    pub batch_id: BatchId,
    pub sample_id: SampleId,
    pub batch_state: BatchCreationState,
    pub rendering_state: RenderingState,
    pub batch_requested: bool,
    pub sample_requested: bool,
    pub batches_completed: u64,
    pub samples_completed: u64,
    pub end_requested: bool,
    pub ended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
