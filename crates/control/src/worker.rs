use std::{
    any::Any,
    io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use shared::domain::{BatchId, SampleId};
use tracing::{error, info};

use crate::{
    engine::SceneEngine,
    state::{ControlState, Work},
};

pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Idle,
    Batch(BatchId),
    Sample(BatchId, SampleId),
    Finished,
}

/// The only execution context that calls into the scene engine.
pub struct SimulationWorker<E> {
    state: Arc<ControlState>,
    engine: E,
    idle_interval: Duration,
}

impl<E: SceneEngine> SimulationWorker<E> {
    pub fn new(state: Arc<ControlState>, engine: E) -> Self {
        Self {
            state,
            engine,
            idle_interval: DEFAULT_IDLE_INTERVAL,
        }
    }

    pub fn with_idle_interval(mut self, idle_interval: Duration) -> Self {
        self.idle_interval = idle_interval;
        self
    }

    pub fn spawn(self) -> io::Result<WorkerHandle>
    where
        E: 'static,
    {
        let thread = thread::Builder::new()
            .name("scene-worker".into())
            .spawn(move || self.run())?;
        Ok(WorkerHandle { thread })
    }

    pub fn run(mut self) {
        info!(run_id = %self.state.run_id().0, "scene worker started");
        while self.step() != StepOutcome::Finished {}
        info!(run_id = %self.state.run_id().0, "scene worker stopped");
    }

    /// Performs at most one unit of work, blocking up to the idle interval.
    pub fn step(&mut self) -> StepOutcome {
        let Some(work) = self.state.claim_work(self.idle_interval) else {
            return StepOutcome::Idle;
        };

        match work {
            Work::Batch { batch_id } => {
                info!(%batch_id, "creating batch");
                let engine = &mut self.engine;
                let result = guarded(|| engine.create_batch(batch_id));
                match &result {
                    Ok(()) => info!(%batch_id, "batch created"),
                    Err(message) => error!(%batch_id, error = %message, "batch creation failed"),
                }
                self.state.complete_batch(result);
                StepOutcome::Batch(batch_id)
            }
            Work::Sample {
                batch_id,
                sample_id,
                pose,
            } => {
                info!(%batch_id, %sample_id, position = ?pose.position, "rendering sample");
                let engine = &mut self.engine;
                let result = guarded(|| engine.render_sample(batch_id, sample_id, &pose));
                match &result {
                    Ok(file_paths) => info!(
                        %batch_id,
                        %sample_id,
                        files = file_paths.len(),
                        "sample rendered"
                    ),
                    Err(message) => {
                        error!(%batch_id, %sample_id, error = %message, "sample render failed")
                    }
                }
                self.state.complete_sample(result);
                StepOutcome::Sample(batch_id, sample_id)
            }
            Work::Shutdown => {
                let engine = &mut self.engine;
                let result = guarded(|| engine.shutdown());
                if let Err(message) = &result {
                    error!(error = %message, "scene engine shutdown failed");
                }
                self.state.mark_ended(result.err());
                StepOutcome::Finished
            }
        }
    }
}

pub struct WorkerHandle {
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn join(self) -> thread::Result<()> {
        self.thread.join()
    }
}

// Engine errors and panics both become a message stored in the control state,
// so a poll reports `failed` instead of waiting on `in_progress` forever.
fn guarded<T>(op: impl FnOnce() -> anyhow::Result<T>) -> Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(op)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(payload) => Err(format!("scene engine panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
#[path = "tests/worker_tests.rs"]
mod tests;
