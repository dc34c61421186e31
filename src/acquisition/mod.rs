//! Acquisition orchestration.
//!
//! - [`Acquisition`]: the run loop over time points and rows
//! - [`AcquisitionParams`]: what to run, validated before any device call
//! - [`OutputSink`]: where stacks go ([`MemorySink`] keeps them in memory)
//! - [`ProgressReporter`]: non-blocking progress updates
//!
//! The continuous-capture worker is internal; its counters surface as
//! [`CaptureStats`] in the logs.

mod continuous;
pub mod orchestrator;
pub mod params;
pub mod progress;
pub mod sink;
pub mod status;

pub use continuous::CaptureStats;
pub use orchestrator::{Acquisition, AcquisitionOutcome, AppliedCorrection};
pub use params::{AcquisitionParams, DEFAULT_STEP_TIMEOUT};
pub use progress::{ProgressEvent, ProgressReporter};
pub use sink::{FinalImageResult, MemorySink, OutputSink, SinkEvent, Slice, StackSummary};
pub use status::AcquisitionStatus;
