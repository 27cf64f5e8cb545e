//! The gradient-descent loop that actually synthesizes the image.
//!
//! One run moves through `INIT -> ITERATING -> {max-iters | converged |
//! cancelled | diverged}`. INIT caches the loss targets with a single
//! forward pass per reference image; every iteration after that is one
//! forward pass over the candidate, one loss evaluation, one backward
//! chain to pixel space and one optimizer step. The candidate tensor and
//! the optimizer moments are the only state mutated across iterations.

use crate::{
    loss::{LossEvaluator, Losses},
    optimizer::Adam,
    session::{ProgressUpdate, TransferProgress},
    tensor, Backbone, Error, FeatureMap,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Why a run stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The iteration budget was exhausted (the normal path)
    MaxIterations,
    /// The loss delta between consecutive iterations fell below the
    /// configured convergence threshold
    Converged,
    /// The external cancellation flag was raised
    Cancelled,
}

#[derive(Debug)]
pub(crate) struct TransferParams {
    pub(crate) content_weight: f32,
    pub(crate) style_weight: f32,
    pub(crate) content_layers: BTreeMap<String, f32>,
    pub(crate) style_layers: BTreeMap<String, f32>,
    pub(crate) max_iterations: usize,
    pub(crate) report_interval: usize,
    pub(crate) learning_rate: f32,
    pub(crate) convergence_threshold: Option<f32>,
}

pub(crate) struct Outcome {
    pub(crate) candidate: FeatureMap,
    pub(crate) stop: StopReason,
    pub(crate) iterations: usize,
    pub(crate) losses: Losses,
}

/// Owns the candidate tensor for the duration of one run.
pub(crate) struct Generator {
    candidate: FeatureMap,
}

impl Generator {
    pub(crate) fn new(candidate: FeatureMap) -> Self {
        Self { candidate }
    }

    pub(crate) fn optimize(
        mut self,
        backbone: &dyn Backbone,
        content: &FeatureMap,
        style: &FeatureMap,
        params: &TransferParams,
        mut progress: Option<Box<dyn TransferProgress>>,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Result<Outcome, Error> {
        // INIT: targets are computed exactly once, regardless of budget
        let evaluator = LossEvaluator::new(
            backbone,
            content,
            style,
            params.content_weight,
            params.style_weight,
            params.content_layers.clone(),
            params.style_layers.clone(),
        )?;
        let wanted = evaluator.requested_layers();

        let mut adam = Adam::new(params.learning_rate, self.candidate.dim());
        let start = Instant::now();

        let mut losses = Losses::default();
        let mut iterations = 0;
        let mut last_reported = 0;
        let mut previous_total: Option<f32> = None;
        let mut stop = StopReason::MaxIterations;

        for iteration in 0..params.max_iterations {
            if let Some(flag) = &cancel {
                if flag.load(Ordering::Relaxed) {
                    stop = StopReason::Cancelled;
                    break;
                }
            }

            let pass = backbone.extract(&self.candidate, &wanted)?;
            let (current, grads) = evaluator.evaluate(&pass.features, iteration)?;
            let grad = backbone.backward(&pass, grads);
            if !grad.iter().all(|g| g.is_finite()) {
                return Err(Error::NonFiniteLoss { iteration });
            }

            // the candidate only changes here, so an iteration is atomic
            // with respect to observable state
            adam.step(&mut self.candidate, &grad);

            losses = current;
            iterations = iteration + 1;

            if iterations % params.report_interval == 0 {
                if let Some(progress) = progress.as_mut() {
                    self.report(progress.as_mut(), iterations, losses, start);
                }
                last_reported = iterations;
            }

            if let (Some(threshold), Some(previous)) =
                (params.convergence_threshold, previous_total)
            {
                if (previous - losses.total).abs() <= threshold {
                    stop = StopReason::Converged;
                    break;
                }
            }
            previous_total = Some(losses.total);
        }

        // flush a final event if the last iteration missed the interval
        if iterations > 0 && last_reported != iterations {
            if let Some(progress) = progress.as_mut() {
                self.report(progress.as_mut(), iterations, losses, start);
            }
        }

        Ok(Outcome {
            candidate: self.candidate,
            stop,
            iterations,
            losses,
        })
    }

    fn report(
        &self,
        progress: &mut dyn TransferProgress,
        iteration: usize,
        losses: Losses,
        start: Instant,
    ) {
        let snapshot = tensor::to_image(&self.candidate);
        progress.update(ProgressUpdate {
            iteration,
            total_loss: losses.total,
            content_loss: losses.content,
            style_loss: losses.style,
            elapsed: start.elapsed(),
            image: &snapshot,
        });
    }
}
