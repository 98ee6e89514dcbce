use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(BatchId);
id_newtype!(SampleId);

/// Identifies one simulation instance for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress of the scene (re)generation for the current batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchCreationState {
    #[default]
    Idle,
    InProgress,
    Done,
    Failed,
}

/// Progress of the most recently requested sample render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderingState {
    #[default]
    Idle,
    InProgress,
    Done,
    Failed,
}

impl BatchCreationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl RenderingState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Validated sensor pose handed to the scene engine for exactly one sample.
///
/// Orientation is stored as a `(w, x, y, z)` quaternion.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SensorPose {
    pub position: [f64; 3],
    pub orientation: [f64; 4],
}

impl SensorPose {
    pub fn identity_at(x: f64, y: f64, z: f64) -> Self {
        Self {
            position: [x, y, z],
            orientation: [1.0, 0.0, 0.0, 0.0],
        }
    }
}
