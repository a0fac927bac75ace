//! Merge run orchestration.
//!
//! A run moves through fetch, probe, validation, planning, transcode and
//! upload inside its own scratch directory, which is removed on every exit
//! path. Runs share nothing but the pipeline's collaborators.

pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod state;

pub use config::PipelineConfig;
pub use context::{CancelHandle, RunBudget, RunContext};
pub use error::{AbortReason, PipelineError, PipelineResult};
pub use logging::RunLogger;
pub use pipeline::{MergeOutcome, MergePipeline};
pub use state::{FailureKind, RunState, StateMachine};
