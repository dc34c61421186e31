//! Drift estimation against synthetic 3-D stacks
//!
//! A Gaussian blob is rendered slice by slice, translated by a known
//! integer offset, and the estimators must recover the translation.

use spim_daq::drift::{
    CentroidEstimator, CorrelationEstimator, DriftController, DriftControllerFactory,
    OffsetEstimator, ProjectionDriftFactory, Projections, ReferencePolicy, Vector3,
};
use spim_daq::hardware::Frame;
use spim_daq::sequence::{Axis, AxisValueSet, DriftHandoff, Row};
use std::sync::Arc;

const WIDTH: u32 = 96;
const HEIGHT: u32 = 96;
const DEPTH: usize = 64;
const SIGMA: f64 = 3.0;

/// Slices of a blob centred at `center` (x, y, z in pixels/slices).
fn blob_stack(center: Vector3) -> Vec<Frame> {
    let two_sigma_sq = 2.0 * SIGMA * SIGMA;
    (0..DEPTH)
        .map(|z| {
            let dz = z as f64 - center.z;
            let mut pixels = Vec::with_capacity((WIDTH * HEIGHT) as usize);
            for y in 0..HEIGHT {
                for x in 0..WIDTH {
                    let dx = x as f64 - center.x;
                    let dy = y as f64 - center.y;
                    let r2 = dx * dx + dy * dy + dz * dz;
                    let value = 100.0 + 10_000.0 * (-r2 / two_sigma_sq).exp();
                    pixels.push(value.round() as u16);
                }
            }
            Frame::from_u16(WIDTH, HEIGHT, pixels)
        })
        .collect()
}

fn project(frames: &[Frame]) -> Projections {
    let mut projections = Projections::new();
    for frame in frames {
        projections.tally(frame).unwrap();
    }
    projections
}

fn shifted_pair(shift: Vector3) -> (Projections, Projections) {
    let origin = Vector3::new(32.0, 32.0, 16.0);
    (
        project(&blob_stack(origin)),
        project(&blob_stack(origin + shift)),
    )
}

fn stepped_row() -> Row {
    Row::new().with(Axis::Z, AxisValueSet::stepped(0.0, 1.0, (DEPTH - 1) as f64).unwrap())
}

// =============================================================================
// Estimators
// =============================================================================

#[test]
fn test_correlation_recovers_integer_translation() {
    let shift = Vector3::new(16.0, 24.0, 32.0);
    let (first, latest) = shifted_pair(shift);

    let estimate = CorrelationEstimator::new().estimate(&first, &latest).unwrap();

    assert!(
        estimate.max_abs_diff(&shift) < 1e-4,
        "expected {shift}, got {estimate}"
    );
}

#[test]
fn test_correlation_recovers_negative_translation() {
    let (first, latest) = shifted_pair(Vector3::new(16.0, 24.0, 32.0));

    // Swapping the stacks reverses the offset
    let estimate = CorrelationEstimator::new().estimate(&latest, &first).unwrap();

    assert!(
        estimate.max_abs_diff(&Vector3::new(-16.0, -24.0, -32.0)) < 1e-4,
        "got {estimate}"
    );
}

#[test]
fn test_centroid_recovers_integer_translation() {
    let shift = Vector3::new(5.0, -3.0, 7.0);
    let (first, latest) = shifted_pair(shift);

    let estimate = CentroidEstimator::new().estimate(&first, &latest).unwrap();

    assert!(
        estimate.max_abs_diff(&shift) < 1e-3,
        "expected {shift}, got {estimate}"
    );
}

#[test]
fn test_identical_stacks_give_zero() {
    let (first, _) = shifted_pair(Vector3::zero());
    for estimator in [
        Box::new(CorrelationEstimator::new()) as Box<dyn OffsetEstimator>,
        Box::new(CentroidEstimator::new()),
    ] {
        let estimate = estimator.estimate(&first, &first).unwrap();
        assert!(estimate.norm() < 1e-6, "{}: {estimate}", estimator.name());
    }
}

#[test]
fn test_mismatched_frames_rejected() {
    let (first, _) = shifted_pair(Vector3::zero());
    let other = project(&[Frame::filled(8, 8, 100)]);
    assert!(CorrelationEstimator::new().estimate(&first, &other).is_err());
    assert!(CentroidEstimator::new().estimate(&first, &Projections::new()).is_err());
}

// =============================================================================
// Controller
// =============================================================================

#[tokio::test]
async fn test_first_stack_yields_zero() {
    let factory = ProjectionDriftFactory::new(Arc::new(CorrelationEstimator::new()));
    let mut controller = factory.create(0, &stepped_row());

    controller.start_new_stack();
    for frame in blob_stack(Vector3::new(40.0, 40.0, 20.0)) {
        controller.tally(&frame).unwrap();
    }

    assert_eq!(controller.finish_stack().await, Some(Vector3::zero()));
    assert!(controller.correction().cumulative.is_zero());
}

#[tokio::test]
async fn test_controller_converts_to_stage_units() {
    let handoff = DriftHandoff {
        invert_x: true,
        invert_y: false,
        invert_z: false,
        pixel_size: 0.5,
        z_step: Some(2.0),
    };
    let row = stepped_row().with_handoff(handoff);
    let factory = ProjectionDriftFactory::new(Arc::new(CorrelationEstimator::new()))
        .with_policy(ReferencePolicy::First);
    let mut controller = factory.create(3, &row);

    let origin = Vector3::new(32.0, 32.0, 16.0);
    for center in [origin, origin + Vector3::new(4.0, 6.0, 3.0)] {
        controller.start_new_stack();
        for frame in blob_stack(center) {
            controller.tally(&frame).unwrap();
        }
        let _ = controller.finish_stack().await;
    }

    let image = controller.correction().last_applied;
    assert!(image.max_abs_diff(&Vector3::new(4.0, 6.0, 3.0)) < 1e-4, "{image}");

    // Repeat the last stack to read back the stage-unit value
    controller.start_new_stack();
    for frame in blob_stack(origin + Vector3::new(4.0, 6.0, 3.0)) {
        controller.tally(&frame).unwrap();
    }
    let stage = controller.finish_stack().await.unwrap();
    assert!(
        stage.max_abs_diff(&Vector3::new(-2.0, 3.0, 6.0)) < 1e-4,
        "{stage}"
    );
}
