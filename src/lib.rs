//! # SPIM DAQ Core Library
//!
//! Timed multi-position light-sheet acquisition: a sequence of rows (stage
//! positions with a Z range each) is visited once per time point, a Z stack
//! is captured at every row, and an optional drift controller re-centres the
//! sample between stacks.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: the orchestrator, its parameters, output sinks and
//!   progress reporting.
//! - **`config`**: layered TOML + environment configuration (`figment`).
//! - **`drift`**: projection reducer, offset estimators and the drift
//!   controller.
//! - **`error`**: the [`AcquisitionError`] taxonomy.
//! - **`hardware`**: capability traits, the driver registry and mock devices.
//! - **`sequence`**: axis value sets and rows.
//! - **`tracing_init`**: structured logging setup.
//! - **`watchdog`**: the settle watchdog.

pub mod acquisition;
pub mod config;
pub mod drift;
pub mod error;
pub mod hardware;
pub mod sequence;
pub mod tracing_init;
pub mod watchdog;

pub use acquisition::{
    Acquisition, AcquisitionOutcome, AcquisitionParams, AcquisitionStatus, MemorySink,
    OutputSink,
};
pub use error::{AcqResult, AcquisitionError};
pub use hardware::{DeviceSet, DriverRegistry};
pub use sequence::{Axis, AxisValueSet, Row};
pub use watchdog::Watchdog;
