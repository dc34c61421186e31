//! Output sink interface and the in-memory reference sink.
//!
//! The orchestrator calls a sink in strict order per stack
//! (`begin_stack`, N × `process_slice`, `finalize_stack`) and calls
//! `finalize_acquisition` exactly once per run. During continuous capture
//! the background worker also calls `process_slice`, so sinks take `&self`.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::hardware::Frame;

/// One captured plane with the stage position and metadata at capture.
#[derive(Debug, Clone)]
pub struct Slice {
    /// Camera frame
    pub frame: Frame,
    /// X stage position (0.0 when no X stage)
    pub x: f64,
    /// Y stage position (0.0 when no Y stage)
    pub y: f64,
    /// Z position; estimated from the sweep during continuous capture
    pub z: f64,
    /// Rotation stage angle (0.0 when no rotation stage)
    pub theta: f64,
    /// Seconds since the run started
    pub elapsed_secs: f64,
    /// Metadata device readings keyed by device id
    pub metadata: BTreeMap<String, f64>,
}

/// Summary of one finalized (or abandoned) stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackSummary {
    /// Time point index
    pub time_point: usize,
    /// Row index
    pub row: usize,
    /// Number of slices received
    pub slices: usize,
    /// Z of the first slice
    pub first_z: Option<f64>,
    /// Z of the last slice
    pub last_z: Option<f64>,
    /// Whether `finalize_stack` was called for it
    pub finalized: bool,
}

impl StackSummary {
    fn new(time_point: usize, row: usize) -> Self {
        Self {
            time_point,
            row,
            slices: 0,
            first_z: None,
            last_z: None,
            finalized: false,
        }
    }
}

/// What the sink produced for a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FinalImageResult {
    /// The success flag the run was finalized with
    pub success: bool,
    /// Stacks in the order they were begun
    pub stacks: Vec<StackSummary>,
    /// Slices across all stacks
    pub total_slices: usize,
}

impl FinalImageResult {
    /// Result for a sink that could not produce anything
    pub fn failed() -> Self {
        Self::default()
    }
}

/// Destination for captured stacks.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Open the stack for (`time_point`, `row`)
    async fn begin_stack(&self, time_point: usize, row: usize) -> Result<()>;

    /// Append one slice to the open stack for (`time_point`, `row`)
    async fn process_slice(&self, time_point: usize, row: usize, slice: Slice) -> Result<()>;

    /// Close the stack for (`time_point`, `row`), possibly partial
    async fn finalize_stack(&self, time_point: usize, row: usize) -> Result<()>;

    /// Close the run and hand back what was produced
    async fn finalize_acquisition(&self, success: bool) -> Result<FinalImageResult>;
}

/// Call made on a [`MemorySink`], for ordering assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    /// `begin_stack`
    BeginStack(usize, usize),
    /// `process_slice` (time point, row, z)
    Slice(usize, usize, f64),
    /// `finalize_stack`
    FinalizeStack(usize, usize),
    /// `finalize_acquisition`
    FinalizeAcquisition(bool),
}

#[derive(Default)]
struct MemoryState {
    stacks: Vec<StackSummary>,
    open: BTreeMap<(usize, usize), usize>,
    slices: Vec<(usize, usize, Slice)>,
    events: Vec<SinkEvent>,
    total_slices: usize,
    fail_after: Option<usize>,
}

/// Sink that keeps everything in memory.
///
/// Frames are only retained when built with [`MemorySink::keeping_frames`].
#[derive(Default)]
pub struct MemorySink {
    keep_frames: bool,
    state: Mutex<MemoryState>,
}

impl MemorySink {
    /// Sink that records summaries and events only
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that also retains every slice
    pub fn keeping_frames() -> Self {
        Self {
            keep_frames: true,
            ..Self::default()
        }
    }

    /// Reject every slice after the first `slices`
    pub fn fail_after_slices(&self, slices: usize) {
        self.state.lock().fail_after = Some(slices);
    }

    /// Calls received so far
    pub fn events(&self) -> Vec<SinkEvent> {
        self.state.lock().events.clone()
    }

    /// Stack summaries so far
    pub fn stacks(&self) -> Vec<StackSummary> {
        self.state.lock().stacks.clone()
    }

    /// Retained slices as (time point, row, slice)
    pub fn slices(&self) -> Vec<(usize, usize, Slice)> {
        self.state.lock().slices.clone()
    }

    /// Number of `finalize_acquisition` calls with their flags
    pub fn finalizations(&self) -> Vec<bool> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                SinkEvent::FinalizeAcquisition(success) => Some(*success),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn begin_stack(&self, time_point: usize, row: usize) -> Result<()> {
        let mut state = self.state.lock();
        if state.open.contains_key(&(time_point, row)) {
            bail!("stack t={time_point} row={row} is already open");
        }
        let index = state.stacks.len();
        state.stacks.push(StackSummary::new(time_point, row));
        state.open.insert((time_point, row), index);
        state.events.push(SinkEvent::BeginStack(time_point, row));
        Ok(())
    }

    async fn process_slice(&self, time_point: usize, row: usize, slice: Slice) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_after.is_some_and(|limit| state.total_slices >= limit) {
            bail!("MemorySink: storage full after {} slices", state.total_slices);
        }
        let index = *state
            .open
            .get(&(time_point, row))
            .ok_or_else(|| anyhow!("no open stack for t={time_point} row={row}"))?;

        let summary = &mut state.stacks[index];
        summary.slices += 1;
        summary.first_z.get_or_insert(slice.z);
        summary.last_z = Some(slice.z);

        state.total_slices += 1;
        state.events.push(SinkEvent::Slice(time_point, row, slice.z));
        if self.keep_frames {
            state.slices.push((time_point, row, slice));
        }
        Ok(())
    }

    async fn finalize_stack(&self, time_point: usize, row: usize) -> Result<()> {
        let mut state = self.state.lock();
        let index = state
            .open
            .remove(&(time_point, row))
            .ok_or_else(|| anyhow!("no open stack for t={time_point} row={row}"))?;
        state.stacks[index].finalized = true;
        state.events.push(SinkEvent::FinalizeStack(time_point, row));
        Ok(())
    }

    async fn finalize_acquisition(&self, success: bool) -> Result<FinalImageResult> {
        let mut state = self.state.lock();
        if !state.open.is_empty() {
            tracing::warn!(open = state.open.len(), "Finalizing with stacks still open");
            state.open.clear();
        }
        state.events.push(SinkEvent::FinalizeAcquisition(success));
        Ok(FinalImageResult {
            success,
            stacks: state.stacks.clone(),
            total_slices: state.total_slices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(z: f64) -> Slice {
        Slice {
            frame: Frame::filled(2, 2, 7),
            x: 0.0,
            y: 0.0,
            z,
            theta: 0.0,
            elapsed_secs: 0.0,
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn records_stack_lifecycle() {
        let sink = MemorySink::keeping_frames();
        sink.begin_stack(0, 1).await.unwrap();
        sink.process_slice(0, 1, slice(2.0)).await.unwrap();
        sink.process_slice(0, 1, slice(4.0)).await.unwrap();
        sink.finalize_stack(0, 1).await.unwrap();

        let result = sink.finalize_acquisition(true).await.unwrap();
        assert!(result.success);
        assert_eq!(result.total_slices, 2);
        assert_eq!(result.stacks[0].first_z, Some(2.0));
        assert_eq!(result.stacks[0].last_z, Some(4.0));
        assert!(result.stacks[0].finalized);
        assert_eq!(sink.slices().len(), 2);
        assert_eq!(sink.finalizations(), vec![true]);
    }

    #[tokio::test]
    async fn slices_need_an_open_stack() {
        let sink = MemorySink::new();
        assert!(sink.process_slice(0, 0, slice(0.0)).await.is_err());

        sink.begin_stack(0, 0).await.unwrap();
        sink.finalize_stack(0, 0).await.unwrap();
        assert!(sink.process_slice(0, 0, slice(0.0)).await.is_err());
        assert!(sink.slices().is_empty());
    }

    #[tokio::test]
    async fn injected_failure() {
        let sink = MemorySink::new();
        sink.fail_after_slices(1);
        sink.begin_stack(0, 0).await.unwrap();
        sink.process_slice(0, 0, slice(0.0)).await.unwrap();
        assert!(sink.process_slice(0, 0, slice(1.0)).await.is_err());
    }
}
