//! Per-row drift controllers.
//!
//! The orchestrator keeps one controller per row for the whole run so each
//! stack is compared with an earlier stack taken at the same position.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{DriftCorrection, OffsetEstimator, Projections, ReferencePolicy, Vector3};
use crate::hardware::Frame;
use crate::sequence::{DriftHandoff, Row};

/// Human confirmation of a proposed correction.
///
/// `proposed` is in image units (pixels, pixels, slices). The returned
/// vector is what gets applied; return zero to reject.
#[async_trait]
pub trait ManualReview: Send + Sync {
    /// Confirm or adjust a proposed offset for `row`
    async fn review(&self, row: usize, proposed: Vector3) -> Vector3;
}

/// Review that accepts every proposal unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl ManualReview for AcceptAll {
    async fn review(&self, _row: usize, proposed: Vector3) -> Vector3 {
        proposed
    }
}

/// Drift compensation state for one row.
#[async_trait]
pub trait DriftController: Send + Sync {
    /// Reset the projection accumulator for a new stack
    fn start_new_stack(&mut self);

    /// Fold one slice into the current stack's projections
    fn tally(&mut self, frame: &Frame) -> anyhow::Result<()>;

    /// Close the current stack and compute the stage correction to apply
    /// before the next cycle. `None` means nothing should be applied.
    async fn finish_stack(&mut self) -> Option<Vector3>;

    /// Applied-correction bookkeeping
    fn correction(&self) -> DriftCorrection;

    /// Drop the reference and all accumulated corrections
    fn reset(&mut self);
}

/// Builds one controller per row.
pub trait DriftControllerFactory: Send + Sync {
    /// Create the controller for row `row_index`
    fn create(&self, row_index: usize, row: &Row) -> Box<dyn DriftController>;
}

/// Projection-based controller: estimator, review, and hand-off to stage
/// units.
pub struct ProjectionDriftController {
    row_index: usize,
    handoff: DriftHandoff,
    z_spacing: Option<f64>,
    estimator: Arc<dyn OffsetEstimator>,
    review: Arc<dyn ManualReview>,
    policy: ReferencePolicy,
    current: Projections,
    reference: Option<Projections>,
    correction: DriftCorrection,
}

impl ProjectionDriftController {
    /// Controller for one row
    pub fn new(
        row_index: usize,
        row: &Row,
        estimator: Arc<dyn OffsetEstimator>,
        review: Arc<dyn ManualReview>,
        policy: ReferencePolicy,
    ) -> Self {
        Self {
            row_index,
            handoff: row.handoff,
            z_spacing: row.z_spacing(),
            estimator,
            review,
            policy,
            current: Projections::new(),
            reference: None,
            correction: DriftCorrection::default(),
        }
    }

    /// Projections of the reference stack, once one exists
    pub fn reference(&self) -> Option<&Projections> {
        self.reference.as_ref()
    }

    /// Record an externally reviewed offset (image units) and return it in
    /// stage units.
    pub fn apply_offset(&mut self, offset: Vector3) -> Vector3 {
        self.correction.apply(offset);
        self.handoff.to_stage(offset, self.z_spacing)
    }
}

#[async_trait]
impl DriftController for ProjectionDriftController {
    fn start_new_stack(&mut self) {
        self.current = Projections::new();
    }

    fn tally(&mut self, frame: &Frame) -> anyhow::Result<()> {
        self.current.tally(frame)?;
        Ok(())
    }

    async fn finish_stack(&mut self) -> Option<Vector3> {
        let latest = std::mem::take(&mut self.current);
        if latest.is_empty() {
            warn!(row = self.row_index, "Drift stack finished with no slices");
            return None;
        }

        let Some(reference) = self.reference.as_ref() else {
            debug!(row = self.row_index, slices = latest.slices(), "Drift reference stored");
            self.reference = Some(latest);
            return Some(Vector3::zero());
        };

        let raw = match self.estimator.estimate(reference, &latest) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(row = self.row_index, error = %e, "Drift estimate failed, no correction applied");
                return None;
            }
        };

        let proposed = match self.policy {
            ReferencePolicy::Previous => raw + self.correction.last_applied,
            ReferencePolicy::First => raw,
        };
        if self.policy == ReferencePolicy::Previous {
            self.reference = Some(latest);
        }

        let reviewed = self.review.review(self.row_index, proposed).await;
        let stage = self.apply_offset(reviewed);
        info!(
            row = self.row_index,
            estimator = self.estimator.name(),
            %raw,
            %reviewed,
            %stage,
            "Drift correction"
        );
        Some(stage)
    }

    fn correction(&self) -> DriftCorrection {
        self.correction
    }

    fn reset(&mut self) {
        self.current = Projections::new();
        self.reference = None;
        self.correction.reset();
    }
}

/// Factory for [`ProjectionDriftController`].
#[derive(Clone)]
pub struct ProjectionDriftFactory {
    estimator: Arc<dyn OffsetEstimator>,
    review: Arc<dyn ManualReview>,
    policy: ReferencePolicy,
}

impl ProjectionDriftFactory {
    /// Factory using `estimator`, accepting every proposal, measuring
    /// against the previous stack
    pub fn new(estimator: Arc<dyn OffsetEstimator>) -> Self {
        Self {
            estimator,
            review: Arc::new(AcceptAll),
            policy: ReferencePolicy::default(),
        }
    }

    /// Route proposals through `review`
    pub fn with_review(mut self, review: Arc<dyn ManualReview>) -> Self {
        self.review = review;
        self
    }

    /// Choose the reference stack policy
    pub fn with_policy(mut self, policy: ReferencePolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl DriftControllerFactory for ProjectionDriftFactory {
    fn create(&self, row_index: usize, row: &Row) -> Box<dyn DriftController> {
        Box::new(ProjectionDriftController::new(
            row_index,
            row,
            self.estimator.clone(),
            self.review.clone(),
            self.policy,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drift::{CentroidEstimator, DriftError};
    use crate::sequence::{Axis, AxisValueSet};
    use parking_lot::Mutex;

    /// Returns a fixed raw offset regardless of input.
    struct FixedEstimator(Vector3);

    impl OffsetEstimator for FixedEstimator {
        fn estimate(&self, _: &Projections, _: &Projections) -> Result<Vector3, DriftError> {
            Ok(self.0)
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    struct RecordingReview {
        seen: Mutex<Vec<Vector3>>,
        reply: Option<Vector3>,
    }

    #[async_trait]
    impl ManualReview for RecordingReview {
        async fn review(&self, _row: usize, proposed: Vector3) -> Vector3 {
            self.seen.lock().push(proposed);
            self.reply.unwrap_or(proposed)
        }
    }

    fn row() -> Row {
        Row::new().with(Axis::Z, AxisValueSet::stepped(0.0, 2.0, 4.0).unwrap())
    }

    fn stack(controller: &mut dyn DriftController, slices: usize) {
        controller.start_new_stack();
        for _ in 0..slices {
            controller.tally(&Frame::filled(4, 4, 1)).unwrap();
        }
    }

    #[tokio::test]
    async fn first_stack_returns_zero() {
        let factory = ProjectionDriftFactory::new(Arc::new(CentroidEstimator::new()));
        let mut controller = factory.create(0, &row());

        stack(controller.as_mut(), 3);
        assert_eq!(controller.finish_stack().await, Some(Vector3::zero()));
    }

    #[tokio::test]
    async fn empty_stack_applies_nothing() {
        let factory = ProjectionDriftFactory::new(Arc::new(CentroidEstimator::new()));
        let mut controller = factory.create(0, &row());

        controller.start_new_stack();
        assert_eq!(controller.finish_stack().await, None);
    }

    #[tokio::test]
    async fn previous_policy_builds_on_last_correction() {
        let factory = ProjectionDriftFactory::new(Arc::new(FixedEstimator(Vector3::new(
            1.0, 0.0, 0.5,
        ))));
        let mut controller = factory.create(0, &row());

        stack(controller.as_mut(), 2);
        controller.finish_stack().await;

        stack(controller.as_mut(), 2);
        // z is scaled by the row's Z step (2.0)
        assert_eq!(controller.finish_stack().await, Some(Vector3::new(1.0, 0.0, 1.0)));

        stack(controller.as_mut(), 2);
        assert_eq!(controller.finish_stack().await, Some(Vector3::new(2.0, 0.0, 2.0)));
        assert_eq!(controller.correction().cumulative, Vector3::new(3.0, 0.0, 1.5));
    }

    #[tokio::test]
    async fn descending_stack_flips_z_correction() {
        let factory = ProjectionDriftFactory::new(Arc::new(FixedEstimator(Vector3::new(
            0.0, 0.0, 1.0,
        ))));
        let descending = Row::new().with(Axis::Z, AxisValueSet::stepped(10.0, 1.0, 0.0).unwrap());
        let mut controller = factory.create(0, &descending);

        stack(controller.as_mut(), 3);
        controller.finish_stack().await;
        stack(controller.as_mut(), 3);

        // One slice further into a 10 -> 0 stack is one unit lower on the stage
        assert_eq!(controller.finish_stack().await, Some(Vector3::new(0.0, 0.0, -1.0)));
    }

    #[tokio::test]
    async fn first_policy_uses_raw_residual() {
        let factory = ProjectionDriftFactory::new(Arc::new(FixedEstimator(Vector3::new(
            1.0, 0.0, 0.0,
        ))))
        .with_policy(ReferencePolicy::First);
        let mut controller = factory.create(0, &row());

        for _ in 0..3 {
            stack(controller.as_mut(), 2);
            controller.finish_stack().await;
        }
        assert_eq!(controller.correction().last_applied, Vector3::new(1.0, 0.0, 0.0));
        assert_eq!(controller.correction().cumulative, Vector3::new(2.0, 0.0, 0.0));
    }

    #[tokio::test]
    async fn review_can_override() {
        let review = Arc::new(RecordingReview {
            seen: Mutex::new(Vec::new()),
            reply: Some(Vector3::zero()),
        });
        let factory = ProjectionDriftFactory::new(Arc::new(FixedEstimator(Vector3::new(
            3.0, 3.0, 0.0,
        ))))
        .with_review(review.clone());
        let mut controller = factory.create(1, &row());

        stack(controller.as_mut(), 1);
        controller.finish_stack().await;
        stack(controller.as_mut(), 1);
        assert_eq!(controller.finish_stack().await, Some(Vector3::zero()));
        assert_eq!(review.seen.lock().as_slice(), &[Vector3::new(3.0, 3.0, 0.0)]);
    }

    #[tokio::test]
    async fn reset_forgets_reference() {
        let factory = ProjectionDriftFactory::new(Arc::new(FixedEstimator(Vector3::new(
            1.0, 1.0, 1.0,
        ))));
        let mut controller = factory.create(0, &row());

        stack(controller.as_mut(), 1);
        controller.finish_stack().await;
        controller.reset();

        stack(controller.as_mut(), 1);
        assert_eq!(controller.finish_stack().await, Some(Vector3::zero()));
    }
}
