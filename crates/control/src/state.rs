//! Shared protocol progress, guarded by one mutex.
//!
//! The control service only ever sets request flags and reads progress; the
//! worker claims work and publishes results. Every transition happens inside
//! a single critical section so a poll never observes a cleared request flag
//! without the matching `in_progress` state.

use std::{
    mem,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{BatchCreationState, BatchId, RenderingState, RunId, SampleId, SensorPose},
    protocol::{SensorPoseRequest, SimulationStatus},
};
use tracing::{debug, error, info, warn};

use crate::error::ControlError;

/// Acknowledgement for a step request that carries no ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepAck {
    pub coalesced: bool,
}

/// Identifiers the pending sample will be produced under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTicket {
    pub batch_id: BatchId,
    pub sample_id: SampleId,
    pub coalesced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPoll {
    pub state: BatchCreationState,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderPoll {
    pub state: RenderingState,
    pub file_paths: Vec<String>,
    pub error: Option<String>,
}

/// A unit of work claimed by the worker. Begin transitions are already applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Work {
    Batch {
        batch_id: BatchId,
    },
    Sample {
        batch_id: BatchId,
        sample_id: SampleId,
        pose: SensorPose,
    },
    Shutdown,
}

#[derive(Debug, Default)]
struct ControlInner {
    batch_requested: bool,
    sample_requested: bool,
    // Set when a sample was already pending at the time a batch was requested,
    // so the sample is produced in the batch its ticket names.
    sample_precedes_batch: bool,
    pending_pose: SensorPose,

    batch_state: BatchCreationState,
    rendering_state: RenderingState,
    batch_counter: i64,
    sample_counter: i64,
    scene_ready: bool,

    batch_ever_requested: bool,
    sample_ever_requested: bool,

    manifest: Vec<String>,
    batch_error: Option<String>,
    render_error: Option<String>,
    last_error: Option<String>,
    batches_completed: u64,
    samples_completed: u64,

    end_requested: bool,
    ended: bool,
}

impl ControlInner {
    fn has_work(&self) -> bool {
        self.end_requested || self.batch_requested || self.sample_requested
    }
}

pub struct ControlState {
    inner: Mutex<ControlInner>,
    work_ready: Condvar,
    run_id: RunId,
    started_at: DateTime<Utc>,
    output_id_offset: i64,
}

impl ControlState {
    pub fn new(output_id_offset: i64) -> Self {
        Self {
            inner: Mutex::new(ControlInner::default()),
            work_ready: Condvar::new(),
            run_id: RunId::new(),
            started_at: Utc::now(),
            output_id_offset,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn output_id_offset(&self) -> i64 {
        self.output_id_offset
    }

    // Every critical section leaves the record consistent, so a panic while
    // holding the lock cannot expose a half-applied transition.
    fn lock(&self) -> MutexGuard<'_, ControlInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // `claim_work` never advances the counter past the last representable id.
    fn batch_id(&self, inner: &ControlInner) -> BatchId {
        BatchId(inner.batch_counter.saturating_add(self.output_id_offset))
    }

    fn next_batch_id(&self, inner: &ControlInner) -> Option<(i64, BatchId)> {
        let counter = inner.batch_counter.checked_add(1)?;
        let id = counter.checked_add(self.output_id_offset)?;
        Some((counter, BatchId(id)))
    }

    pub fn request_batch(&self) -> Result<StepAck, ControlError> {
        let mut inner = self.lock();
        if inner.end_requested {
            return Err(ControlError::AlreadyEnded);
        }

        let coalesced = inner.batch_requested;
        if !coalesced {
            inner.sample_precedes_batch = inner.sample_requested;
        }
        inner.batch_requested = true;
        inner.batch_ever_requested = true;
        drop(inner);
        self.work_ready.notify_one();

        if coalesced {
            warn!("batch step coalesced into the pending request");
        } else {
            debug!("batch step requested");
        }
        Ok(StepAck { coalesced })
    }

    pub fn request_sample(&self, pose: &SensorPoseRequest) -> Result<StepTicket, ControlError> {
        let mut inner = self.lock();
        if inner.end_requested {
            return Err(ControlError::AlreadyEnded);
        }
        let pose = pose.normalize()?;

        if inner.batch_requested || inner.batch_state == BatchCreationState::InProgress {
            return Err(ControlError::Sequence(
                "sample requested before the pending batch completed",
            ));
        }
        if inner.batch_state == BatchCreationState::Failed && !inner.scene_ready {
            return Err(ControlError::Sequence(
                "the current batch failed; request a new batch first",
            ));
        }
        if !inner.scene_ready {
            return Err(ControlError::Sequence(
                "sample requested before any batch was created",
            ));
        }

        let coalesced = inner.sample_requested;
        inner.sample_requested = true;
        inner.sample_ever_requested = true;
        inner.pending_pose = pose;
        let ticket = StepTicket {
            batch_id: self.batch_id(&inner),
            sample_id: SampleId(inner.sample_counter + 1),
            coalesced,
        };
        drop(inner);
        self.work_ready.notify_one();

        if coalesced {
            warn!(
                batch_id = %ticket.batch_id,
                sample_id = %ticket.sample_id,
                "sample step coalesced; pending pose replaced"
            );
        }
        Ok(ticket)
    }

    pub fn poll_batch_status(&self) -> Result<BatchPoll, ControlError> {
        let inner = self.lock();
        if inner.ended {
            return Err(ControlError::AlreadyEnded);
        }
        if !inner.batch_ever_requested {
            return Err(ControlError::Sequence("no batch step has been requested"));
        }

        let error = match inner.batch_state {
            BatchCreationState::Failed => inner.batch_error.clone(),
            _ => None,
        };
        Ok(BatchPoll {
            state: inner.batch_state,
            error,
        })
    }

    /// Reports render progress. A `done` manifest is handed out at most once.
    pub fn poll_render_status(&self) -> Result<RenderPoll, ControlError> {
        let mut inner = self.lock();
        if inner.ended {
            return Err(ControlError::AlreadyEnded);
        }
        if !inner.sample_ever_requested {
            return Err(ControlError::Sequence("no sample step has been requested"));
        }

        let (file_paths, error) = match inner.rendering_state {
            RenderingState::Done => (mem::take(&mut inner.manifest), None),
            RenderingState::Failed => (Vec::new(), inner.render_error.clone()),
            RenderingState::Idle | RenderingState::InProgress => (Vec::new(), None),
        };
        Ok(RenderPoll {
            state: inner.rendering_state,
            file_paths,
            error,
        })
    }

    pub fn request_end(&self) -> Result<(), ControlError> {
        let mut inner = self.lock();
        if inner.end_requested {
            return Err(ControlError::AlreadyEnded);
        }
        inner.end_requested = true;
        drop(inner);
        self.work_ready.notify_all();
        info!("end of simulation requested");
        Ok(())
    }

    pub fn is_ended(&self) -> bool {
        self.lock().ended
    }

    pub fn status(&self) -> SimulationStatus {
        let inner = self.lock();
        SimulationStatus {
            run_id: self.run_id,
            started_at: self.started_at,
            output_id_offset: self.output_id_offset,
            batch_id: self.batch_id(&inner),
            sample_id: SampleId(inner.sample_counter),
            batch_state: inner.batch_state,
            rendering_state: inner.rendering_state,
            batch_requested: inner.batch_requested,
            sample_requested: inner.sample_requested,
            batches_completed: inner.batches_completed,
            samples_completed: inner.samples_completed,
            end_requested: inner.end_requested,
            ended: inner.ended,
            last_error: inner.last_error.clone(),
        }
    }

    /// Claims the next unit of work, waiting up to `idle` for one to arrive.
    ///
    /// Termination wins over pending steps; pending steps are consumed in
    /// request order, batch first when both arrived together.
    pub fn claim_work(&self, idle: Duration) -> Option<Work> {
        let mut inner = self.lock();
        if !inner.has_work() {
            inner = match self.work_ready.wait_timeout(inner, idle) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        if inner.end_requested {
            if inner.batch_requested || inner.sample_requested {
                warn!(
                    batch_requested = inner.batch_requested,
                    sample_requested = inner.sample_requested,
                    "discarding pending steps at end of simulation"
                );
            }
            inner.batch_requested = false;
            inner.sample_requested = false;
            return Some(Work::Shutdown);
        }

        let sample_first = inner.sample_requested && inner.sample_precedes_batch;
        if inner.batch_requested && !sample_first {
            inner.batch_requested = false;
            inner.rendering_state = RenderingState::Idle;
            inner.sample_counter = 0;
            inner.scene_ready = false;
            inner.manifest.clear();

            let Some((counter, batch_id)) = self.next_batch_id(&inner) else {
                let message = format!(
                    "batch id space exhausted after batch {} (offset {})",
                    self.batch_id(&inner),
                    self.output_id_offset
                );
                error!(error = %message, "batch step rejected");
                inner.batch_state = BatchCreationState::Failed;
                inner.batch_error = Some(message.clone());
                inner.last_error = Some(message);
                return None;
            };
            inner.batch_counter = counter;
            inner.batch_state = BatchCreationState::InProgress;
            inner.batch_error = None;
            return Some(Work::Batch { batch_id });
        }

        if inner.sample_requested {
            inner.sample_requested = false;
            inner.sample_precedes_batch = false;
            inner.batch_state = BatchCreationState::Idle;
            inner.rendering_state = RenderingState::InProgress;
            inner.sample_counter += 1;
            inner.render_error = None;
            inner.manifest.clear();
            return Some(Work::Sample {
                batch_id: self.batch_id(&inner),
                sample_id: SampleId(inner.sample_counter),
                pose: mem::take(&mut inner.pending_pose),
            });
        }

        None
    }

    pub fn complete_batch(&self, result: Result<(), String>) {
        let mut inner = self.lock();
        match result {
            Ok(()) => {
                inner.batch_state = BatchCreationState::Done;
                inner.scene_ready = true;
                inner.batches_completed += 1;
            }
            Err(message) => {
                inner.batch_state = BatchCreationState::Failed;
                inner.batch_error = Some(message.clone());
                inner.last_error = Some(message);
            }
        }
    }

    pub fn complete_sample(&self, result: Result<Vec<String>, String>) {
        let mut inner = self.lock();
        match result {
            Ok(file_paths) => {
                inner.manifest = file_paths;
                inner.rendering_state = RenderingState::Done;
                inner.samples_completed += 1;
            }
            Err(message) => {
                inner.rendering_state = RenderingState::Failed;
                inner.render_error = Some(message.clone());
                inner.last_error = Some(message);
            }
        }
    }

    pub fn mark_ended(&self, shutdown_error: Option<String>) {
        let mut inner = self.lock();
        inner.ended = true;
        if let Some(message) = shutdown_error {
            inner.last_error = Some(message);
        }
    }
}

#[cfg(test)]
#[path = "tests/state_tests.rs"]
mod tests;
