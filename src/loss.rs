//! The composite content + style loss and its feature-space gradients.
//!
//! Targets are computed once, up front: content layers keep the raw
//! feature maps of the content image, style layers keep the Gram matrices
//! of the style image. Each evaluation then compares the candidate's
//! captured activations against those cached targets and produces both
//! the scalar losses and the gradient of the total loss with respect to
//! every captured feature map, ready to be chained back to the pixels by
//! [`Backbone::backward`](crate::Backbone::backward).

use crate::{gram::gram_matrix, Backbone, Error, FeatureMap};
use ndarray::Array2;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

/// Scalar loss values of one evaluation, reported through progress events.
#[derive(Clone, Copy, Debug, Default)]
pub struct Losses {
    /// `content_weight * content + style_weight * style`
    pub total: f32,
    /// Weighted sum of per-layer feature MSEs against the content targets
    pub content: f32,
    /// Weighted sum of per-layer Gram MSEs against the style targets,
    /// each normalized by that layer's `channels * height * width`
    pub style: f32,
}

pub(crate) struct LossEvaluator {
    content_weight: f32,
    style_weight: f32,
    content_layers: BTreeMap<String, f32>,
    style_layers: BTreeMap<String, f32>,
    content_targets: BTreeMap<String, FeatureMap>,
    style_targets: BTreeMap<String, Array2<f32>>,
}

impl LossEvaluator {
    /// Caches content and style targets with one forward pass each.
    pub(crate) fn new(
        backbone: &dyn Backbone,
        content: &FeatureMap,
        style: &FeatureMap,
        content_weight: f32,
        style_weight: f32,
        content_layers: BTreeMap<String, f32>,
        style_layers: BTreeMap<String, f32>,
    ) -> Result<Self, Error> {
        let content_ids: BTreeSet<String> = content_layers.keys().cloned().collect();
        let style_ids: BTreeSet<String> = style_layers.keys().cloned().collect();

        let content_targets = backbone.extract(content, &content_ids)?.features;

        let mut style_targets = BTreeMap::new();
        for (id, feature) in backbone.extract(style, &style_ids)?.features {
            let gram = gram_matrix(&feature)?;
            style_targets.insert(id, gram);
        }

        Ok(Self {
            content_weight,
            style_weight,
            content_layers,
            style_layers,
            content_targets,
            style_targets,
        })
    }

    /// The union of content and style layer ids, so one traversal serves
    /// both comparisons.
    pub(crate) fn requested_layers(&self) -> BTreeSet<String> {
        self.content_layers
            .keys()
            .chain(self.style_layers.keys())
            .cloned()
            .collect()
    }

    /// Compares the candidate's activations against the cached targets.
    ///
    /// Returns the scalar losses and, per captured layer, the gradient of
    /// the total loss with respect to that layer's feature map. Fails
    /// with `NonFiniteLoss` if any activation or loss term is NaN or
    /// infinite; `iteration` only provides error context.
    pub(crate) fn evaluate(
        &self,
        features: &BTreeMap<String, FeatureMap>,
        iteration: usize,
    ) -> Result<(Losses, BTreeMap<String, FeatureMap>), Error> {
        for feature in features.values() {
            if !feature.iter().all(|v| v.is_finite()) {
                return Err(Error::NonFiniteLoss { iteration });
            }
        }

        let mut losses = Losses::default();
        let mut grads: BTreeMap<String, FeatureMap> = BTreeMap::new();

        for (id, &layer_weight) in &self.content_layers {
            let feature = &features[id];
            let target = &self.content_targets[id];
            let count = feature.len() as f32;

            let diff = feature - target;
            let mse = diff.iter().map(|d| d * d).sum::<f32>() / count;
            losses.content += layer_weight * mse;

            let scale = 2.0 * self.content_weight * layer_weight / count;
            accumulate(&mut grads, id, diff.mapv(|d| d * scale));
        }

        for (id, &layer_weight) in &self.style_layers {
            let feature = &features[id];
            let (_, channels, height, width) = feature.dim();
            let spatial = (channels * height * width) as f32;

            let view = feature.view();
            let flat = view
                .to_shape((channels, height * width))
                .map_err(|e| Error::Shape(e.to_string()))?;
            let gram = flat.dot(&flat.t());

            let diff = &gram - &self.style_targets[id];
            let mse = diff.iter().map(|d| d * d).sum::<f32>() / (channels * channels) as f32;
            losses.style += layer_weight * mse / spatial;

            let scale =
                4.0 * self.style_weight * layer_weight / ((channels * channels) as f32 * spatial);
            let grad_flat = diff.dot(&flat).mapv(|g| g * scale);
            let grad = grad_flat
                .into_shape_with_order((1, channels, height, width))
                .map_err(|e| Error::Shape(e.to_string()))?;
            accumulate(&mut grads, id, grad);
        }

        losses.total = self.content_weight * losses.content + self.style_weight * losses.style;
        if !losses.total.is_finite() {
            return Err(Error::NonFiniteLoss { iteration });
        }

        Ok((losses, grads))
    }
}

// a layer may appear in both the content and the style set
fn accumulate(grads: &mut BTreeMap<String, FeatureMap>, id: &str, grad: FeatureMap) {
    match grads.entry(id.to_string()) {
        Entry::Occupied(mut e) => *e.get_mut() += &grad,
        Entry::Vacant(e) => {
            e.insert(grad);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backbone::{ConvNet, LayerOp};
    use ndarray::Array4;

    fn ramp(shape: (usize, usize, usize, usize), salt: usize) -> Array4<f32> {
        let mut a = Array4::zeros(shape);
        for (i, v) in a.iter_mut().enumerate() {
            *v = (((i * 7 + salt) % 13) as f32 - 6.0) / 6.0;
        }
        a
    }

    fn identity_net() -> ConvNet {
        // relu-only pipeline keeps the math easy to reason about
        ConvNet::from_layers(vec![("a".to_string(), LayerOp::Relu)])
    }

    fn evaluator(content: &Array4<f32>, style: &Array4<f32>, cw: f32, sw: f32) -> LossEvaluator {
        let mut layer = BTreeMap::new();
        layer.insert("a".to_string(), 1.0);

        LossEvaluator::new(&identity_net(), content, style, cw, sw, layer.clone(), layer).unwrap()
    }

    fn features_of(x: &Array4<f32>) -> BTreeMap<String, FeatureMap> {
        let mut features = BTreeMap::new();
        features.insert("a".to_string(), x.mapv(|v| v.max(0.0)));
        features
    }

    #[test]
    fn matching_inputs_produce_zero_loss_and_gradient() {
        let img = ramp((1, 2, 4, 4), 0);
        let eval = evaluator(&img, &img, 1.0, 1.0);

        let (losses, grads) = eval.evaluate(&features_of(&img), 0).unwrap();
        assert_eq!(losses.total, 0.0);
        assert_eq!(losses.content, 0.0);
        assert_eq!(losses.style, 0.0);
        assert!(grads["a"].iter().all(|g| *g == 0.0));
    }

    #[test]
    fn gradient_matches_numerical_gradient() {
        let content = ramp((1, 2, 3, 4), 0);
        let style = ramp((1, 2, 3, 4), 5);
        let eval = evaluator(&content, &style, 0.7, 1.3);

        let candidate = ramp((1, 2, 3, 4), 9);
        let (_, grads) = eval.evaluate(&features_of(&candidate), 0).unwrap();

        // perturb the *feature map* directly; the gradient is taken with
        // respect to it, not the pixels
        let base = features_of(&candidate);
        let total = |features: &BTreeMap<String, FeatureMap>| -> f32 {
            eval.evaluate(features, 0).unwrap().0.total
        };

        let eps = 1e-3;
        for idx in [(0, 0, 0, 0), (0, 1, 2, 3), (0, 0, 1, 2)] {
            let mut plus = base.clone();
            plus.get_mut("a").unwrap()[idx] += eps;
            let mut minus = base.clone();
            minus.get_mut("a").unwrap()[idx] -= eps;

            let numeric = (total(&plus) - total(&minus)) / (2.0 * eps);
            let got = grads["a"][idx];
            assert!(
                (numeric - got).abs() < 1e-2 * numeric.abs().max(1.0),
                "at {:?}: numeric {} vs analytic {}",
                idx,
                numeric,
                got
            );
        }
    }

    #[test]
    fn non_finite_activation_is_rejected() {
        let img = ramp((1, 2, 4, 4), 0);
        let eval = evaluator(&img, &img, 1.0, 1.0);

        let mut features = features_of(&img);
        features.get_mut("a").unwrap()[[0, 0, 0, 0]] = f32::NAN;

        match eval.evaluate(&features, 42) {
            Err(Error::NonFiniteLoss { iteration }) => assert_eq!(iteration, 42),
            other => panic!("expected NonFiniteLoss, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn loss_scales_with_configured_weights() {
        let content = ramp((1, 2, 4, 4), 0);
        let style = ramp((1, 2, 4, 4), 3);
        let candidate = ramp((1, 2, 4, 4), 7);

        let a = evaluator(&content, &style, 1.0, 1.0);
        let b = evaluator(&content, &style, 2.0, 3.0);

        let (la, _) = a.evaluate(&features_of(&candidate), 0).unwrap();
        let (lb, _) = b.evaluate(&features_of(&candidate), 0).unwrap();

        assert!((lb.total - (2.0 * la.content + 3.0 * la.style)).abs() < 1e-4);
    }
}
