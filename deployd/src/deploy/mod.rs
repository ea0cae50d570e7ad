//! Deployment module

pub mod paths;
pub mod pipeline;
pub mod stage;
pub mod tasks;

pub use pipeline::{CancelHandle, Pipeline, PipelineBuilder, TransferSummary};
pub use stage::{RunOutcome, Stage, StageFailure};
