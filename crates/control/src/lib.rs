//! Stepwise control of a single-threaded scene generation worker.
//!
//! [`ControlState`] is the only shared record between the network-facing
//! service and the [`SimulationWorker`], which owns the [`SceneEngine`] and
//! is the only context that ever calls into it.

pub mod dry_run;
pub mod engine;
pub mod error;
pub mod state;
pub mod worker;

pub use dry_run::{DryRunConfig, DryRunEngine};
pub use engine::SceneEngine;
pub use error::ControlError;
pub use state::{BatchPoll, ControlState, RenderPoll, StepAck, StepTicket, Work};
pub use worker::{SimulationWorker, StepOutcome, WorkerHandle};
