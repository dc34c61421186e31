//! Row/sequence model: per-axis motion programs for each stage position.

pub mod row;
pub mod value_set;

pub use row::{Axis, DriftHandoff, Row};
pub use value_set::{AxisValueSet, ValueSetError, MAX_STEPS};
