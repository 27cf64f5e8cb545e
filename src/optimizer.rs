//! Adaptive-gradient update of the candidate's pixel values.

use crate::FeatureMap;
use ndarray::{Array4, Zip};

/// Adam state for a single `(1, 3, H, W)` parameter tensor.
///
/// The candidate image is the only trainable parameter of a run, so the
/// moment estimates live alongside it for the duration of the loop and
/// are discarded with it.
pub(crate) struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    m: Array4<f32>,
    v: Array4<f32>,
    t: i32,
}

impl Adam {
    pub(crate) fn new(learning_rate: f32, shape: (usize, usize, usize, usize)) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            m: Array4::zeros(shape),
            v: Array4::zeros(shape),
            t: 0,
        }
    }

    /// Applies one bias-corrected update step in place.
    pub(crate) fn step(&mut self, param: &mut FeatureMap, grad: &FeatureMap) {
        self.t += 1;
        let correction1 = 1.0 - self.beta1.powi(self.t);
        let correction2 = 1.0 - self.beta2.powi(self.t);

        let (lr, b1, b2, eps) = (self.learning_rate, self.beta1, self.beta2, self.epsilon);
        Zip::from(param)
            .and(&mut self.m)
            .and(&mut self.v)
            .and(grad)
            .for_each(|p, m, v, &g| {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                let m_hat = *m / correction1;
                let v_hat = *v / correction2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
    }
}
