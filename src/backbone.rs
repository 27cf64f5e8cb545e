//! The frozen feature-extraction backbone.
//!
//! A backbone is an ordered pipeline of named layers with addressable
//! intermediate outputs. The engine only ever differentiates *through* it,
//! back to the input pixels; the layer weights themselves are frozen by
//! construction (no weight-gradient path exists at all).
//!
//! [`ConvNet`] is the concrete implementation: a plain list of `(name,
//! op)` pairs over `ndarray`, with [`ConvNet::vgg19`] building the
//! standard VGG-19 layer table. The [`Backbone`] trait is the seam that
//! lets tests substitute a tiny synthetic pipeline for the real network.

use crate::Error;
use ndarray::{s, Array1, Array4, Zip};
use ndarray_rand::{rand_distr::Normal, RandomExt};
use rand::SeedableRng;
use rand_pcg::Pcg32;
use std::collections::{BTreeMap, BTreeSet};

/// A single named activation, shape `(1, channels, height, width)`.
pub type FeatureMap = Array4<f32>;

/// Activations captured during one forward traversal, plus the tape
/// needed to backpropagate through it.
pub struct FeaturePass {
    /// The requested activations, keyed by layer id.
    pub features: BTreeMap<String, FeatureMap>,
    /// Input to each executed layer, in execution order. The traversal
    /// stops after the deepest requested layer, so this holds exactly the
    /// executed prefix.
    pub inputs: Vec<FeatureMap>,
}

/// A layered feature pipeline with addressable intermediate outputs.
///
/// Implementations must be deterministic for a fixed input, and gradients
/// must flow only to the input tensor, never into the pipeline's own
/// parameters.
pub trait Backbone {
    /// Whether `id` is present in the layer name table.
    fn has_layer(&self, id: &str) -> bool;

    /// Runs the input through the layer pipeline, capturing activations at
    /// every requested id. Content and style requests are unioned by the
    /// caller so a single traversal serves both.
    fn extract(&self, input: &FeatureMap, ids: &BTreeSet<String>) -> Result<FeaturePass, Error>;

    /// Chains per-layer loss gradients down to the gradient with respect
    /// to the input tensor.
    fn backward(&self, pass: &FeaturePass, grads: BTreeMap<String, FeatureMap>) -> FeatureMap;
}

/// A 3x3 same-padding convolution with frozen weights.
pub struct Conv2d {
    /// `(out_channels, in_channels, kernel_h, kernel_w)`
    pub weight: Array4<f32>,
    pub bias: Array1<f32>,
}

impl Conv2d {
    /// He-initialized random weights drawn from the seed, zero bias.
    pub fn seeded(out_channels: usize, in_channels: usize, seed: u64) -> Self {
        let std = (2.0 / (in_channels * 9) as f32).sqrt();
        Self {
            weight: Array4::random_using(
                (out_channels, in_channels, 3, 3),
                Normal::new(0.0, std).unwrap(),
                &mut Pcg32::seed_from_u64(seed),
            ),
            bias: Array1::zeros(out_channels),
        }
    }

    fn forward(&self, input: &FeatureMap) -> FeatureMap {
        let (_, in_c, height, width) = input.dim();
        let (out_c, _, kh, kw) = self.weight.dim();
        let (ph, pw) = (kh / 2, kw / 2);

        let mut out = Array4::zeros((1, out_c, height, width));
        for oc in 0..out_c {
            out.slice_mut(s![0, oc, .., ..]).fill(self.bias[oc]);

            for ic in 0..in_c {
                for ky in 0..kh {
                    for kx in 0..kw {
                        let w = self.weight[[oc, ic, ky, kx]];

                        // output rows where the shifted input index stays in bounds
                        let y0 = ph.saturating_sub(ky);
                        let y1 = (height + ph).saturating_sub(ky).min(height);
                        let x0 = pw.saturating_sub(kx);
                        let x1 = (width + pw).saturating_sub(kx).min(width);
                        if y0 >= y1 || x0 >= x1 {
                            continue;
                        }

                        let src = input.slice(s![
                            0,
                            ic,
                            y0 + ky - ph..y1 + ky - ph,
                            x0 + kx - pw..x1 + kx - pw
                        ]);
                        out.slice_mut(s![0, oc, y0..y1, x0..x1]).scaled_add(w, &src);
                    }
                }
            }
        }

        out
    }

    fn backward(&self, input: &FeatureMap, grad_out: &FeatureMap) -> FeatureMap {
        let (_, in_c, height, width) = input.dim();
        let (out_c, _, kh, kw) = self.weight.dim();
        let (ph, pw) = (kh / 2, kw / 2);

        // scatter each output gradient back through the same shifted
        // windows the forward pass gathered from
        let mut grad_in = Array4::zeros((1, in_c, height, width));
        for oc in 0..out_c {
            for ic in 0..in_c {
                for ky in 0..kh {
                    for kx in 0..kw {
                        let w = self.weight[[oc, ic, ky, kx]];

                        let y0 = ph.saturating_sub(ky);
                        let y1 = (height + ph).saturating_sub(ky).min(height);
                        let x0 = pw.saturating_sub(kx);
                        let x1 = (width + pw).saturating_sub(kx).min(width);
                        if y0 >= y1 || x0 >= x1 {
                            continue;
                        }

                        let g = grad_out.slice(s![0, oc, y0..y1, x0..x1]);
                        grad_in
                            .slice_mut(s![
                                0,
                                ic,
                                y0 + ky - ph..y1 + ky - ph,
                                x0 + kx - pw..x1 + kx - pw
                            ])
                            .scaled_add(w, &g);
                    }
                }
            }
        }

        grad_in
    }
}

/// One step of the layer pipeline.
pub enum LayerOp {
    Conv(Conv2d),
    Relu,
    /// 2x2 max pooling with stride 2
    MaxPool,
    /// 2x2 average pooling with stride 2
    AvgPool,
}

impl LayerOp {
    fn forward(&self, input: &FeatureMap) -> FeatureMap {
        match self {
            Self::Conv(conv) => conv.forward(input),
            Self::Relu => input.mapv(|v| v.max(0.0)),
            Self::MaxPool => pool(input, |win| {
                win.iter().cloned().fold(f32::NEG_INFINITY, f32::max)
            }),
            Self::AvgPool => pool(input, |win| win.iter().sum::<f32>() / win.len() as f32),
        }
    }

    fn backward(&self, input: &FeatureMap, grad_out: &FeatureMap) -> FeatureMap {
        match self {
            Self::Conv(conv) => conv.backward(input, grad_out),
            Self::Relu => {
                let mut grad = grad_out.clone();
                Zip::from(&mut grad).and(input).for_each(|g, &x| {
                    if x <= 0.0 {
                        *g = 0.0;
                    }
                });
                grad
            }
            Self::MaxPool => {
                let (_, channels, height, width) = input.dim();
                let mut grad_in = Array4::zeros(input.dim());

                for c in 0..channels {
                    for y in 0..height / 2 {
                        for x in 0..width / 2 {
                            // route the gradient to the window's argmax
                            let (mut by, mut bx) = (2 * y, 2 * x);
                            for (dy, dx) in &[(0, 1), (1, 0), (1, 1)] {
                                if input[[0, c, 2 * y + dy, 2 * x + dx]] > input[[0, c, by, bx]] {
                                    by = 2 * y + dy;
                                    bx = 2 * x + dx;
                                }
                            }
                            grad_in[[0, c, by, bx]] += grad_out[[0, c, y, x]];
                        }
                    }
                }

                grad_in
            }
            Self::AvgPool => {
                let (_, channels, height, width) = input.dim();
                let mut grad_in = Array4::zeros(input.dim());

                for c in 0..channels {
                    for y in 0..height / 2 {
                        for x in 0..width / 2 {
                            let g = grad_out[[0, c, y, x]] / 4.0;
                            for dy in 0..2 {
                                for dx in 0..2 {
                                    grad_in[[0, c, 2 * y + dy, 2 * x + dx]] += g;
                                }
                            }
                        }
                    }
                }

                grad_in
            }
        }
    }
}

fn pool(input: &FeatureMap, reduce: impl Fn(ndarray::ArrayView2<'_, f32>) -> f32) -> FeatureMap {
    let (_, channels, height, width) = input.dim();
    let (oh, ow) = (height / 2, width / 2);

    let mut out = Array4::zeros((1, channels, oh, ow));
    for c in 0..channels {
        for y in 0..oh {
            for x in 0..ow {
                let win = input.slice(s![0, c, 2 * y..2 * y + 2, 2 * x..2 * x + 2]);
                out[[0, c, y, x]] = reduce(win);
            }
        }
    }

    out
}

/// A concrete backbone: an ordered list of named layer ops.
///
/// Build one from pretrained weights with [`ConvNet::from_layers`], or use
/// [`ConvNet::vgg19`] for the standard VGG-19 layer table with seeded
/// random weights (useful for experimentation and tests when no weights
/// file is at hand).
pub struct ConvNet {
    layers: Vec<(String, LayerOp)>,
    index: BTreeMap<String, usize>,
}

impl ConvNet {
    pub fn from_layers(layers: Vec<(String, LayerOp)>) -> Self {
        let index = layers
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (name.clone(), i))
            .collect();

        Self { layers, index }
    }

    /// The VGG-19 layer table: five blocks of 2/2/4/4/4 convolutions with
    /// 64/128/256/512/512 channels, `relu*` after each conv and `pool*`
    /// after each block. Weights are He-initialized from the seed, biases
    /// zero.
    pub fn vgg19(seed: u64) -> Self {
        let mut rng = Pcg32::seed_from_u64(seed);
        let mut layers = Vec::new();
        let mut in_c = 3;

        let blocks: [(usize, usize); 5] = [(2, 64), (2, 128), (4, 256), (4, 512), (4, 512)];
        for (block, &(convs, out_c)) in blocks.iter().enumerate() {
            for conv in 0..convs {
                let std = (2.0 / (in_c * 9) as f32).sqrt();
                let weight = Array4::random_using(
                    (out_c, in_c, 3, 3),
                    Normal::new(0.0, std).unwrap(),
                    &mut rng,
                );

                layers.push((
                    format!("conv{}_{}", block + 1, conv + 1),
                    LayerOp::Conv(Conv2d {
                        weight,
                        bias: Array1::zeros(out_c),
                    }),
                ));
                layers.push((format!("relu{}_{}", block + 1, conv + 1), LayerOp::Relu));
                in_c = out_c;
            }
            layers.push((format!("pool{}", block + 1), LayerOp::MaxPool));
        }

        Self::from_layers(layers)
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|(name, _)| name.as_str())
    }
}

impl Backbone for ConvNet {
    fn has_layer(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    fn extract(&self, input: &FeatureMap, ids: &BTreeSet<String>) -> Result<FeaturePass, Error> {
        let mut deepest = None;
        for id in ids {
            match self.index.get(id) {
                Some(&i) => deepest = deepest.max(Some(i)),
                None => return Err(Error::UnknownLayer(id.clone())),
            }
        }

        let mut features = BTreeMap::new();
        let mut inputs = Vec::new();
        let mut current = input.clone();

        if let Some(deepest) = deepest {
            // run only the prefix up to the deepest requested layer
            for (name, op) in &self.layers[..=deepest] {
                let output = op.forward(&current);
                inputs.push(current);
                if ids.contains(name) {
                    features.insert(name.clone(), output.clone());
                }
                current = output;
            }
        }

        Ok(FeaturePass { features, inputs })
    }

    fn backward(&self, pass: &FeaturePass, mut grads: BTreeMap<String, FeatureMap>) -> FeatureMap {
        let mut grad: Option<FeatureMap> = None;

        for i in (0..pass.inputs.len()).rev() {
            let (name, op) = &self.layers[i];

            if let Some(g) = grads.remove(name) {
                match grad.as_mut() {
                    Some(acc) => *acc += &g,
                    None => grad = Some(g),
                }
            }

            if let Some(g) = grad.take() {
                grad = Some(op.backward(&pass.inputs[i], &g));
            }
        }

        match grad {
            Some(g) => g,
            None => Array4::zeros(match pass.inputs.first() {
                Some(input) => input.dim(),
                None => (1, 0, 0, 0),
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tiny_conv(out_c: usize, in_c: usize, seed: u64) -> Conv2d {
        let mut rng = Pcg32::seed_from_u64(seed);
        Conv2d {
            weight: Array4::random_using(
                (out_c, in_c, 3, 3),
                Normal::new(0.0, 0.5).unwrap(),
                &mut rng,
            ),
            bias: Array1::zeros(out_c),
        }
    }

    fn ramp(shape: (usize, usize, usize, usize)) -> Array4<f32> {
        let mut a = Array4::zeros(shape);
        for (i, v) in a.iter_mut().enumerate() {
            *v = ((i * 7 % 13) as f32 - 6.0) / 6.0;
        }
        a
    }

    #[test]
    fn conv_preserves_spatial_dims() {
        let conv = tiny_conv(4, 2, 1);
        let out = conv.forward(&ramp((1, 2, 5, 7)));
        assert_eq!(out.dim(), (1, 4, 5, 7));
    }

    #[test]
    fn conv_backward_matches_numerical_gradient() {
        let conv = tiny_conv(3, 2, 2);
        let input = ramp((1, 2, 4, 4));

        // L = 0.5 * sum(out^2), so dL/dout = out
        let out = conv.forward(&input);
        let analytic = conv.backward(&input, &out);

        let loss = |inp: &Array4<f32>| -> f32 {
            conv.forward(inp).iter().map(|v| 0.5 * v * v).sum()
        };

        let eps = 1e-3;
        for idx in [(0, 0, 0, 0), (0, 1, 2, 3), (0, 0, 3, 1), (0, 1, 1, 2)] {
            let mut plus = input.clone();
            plus[idx] += eps;
            let mut minus = input.clone();
            minus[idx] -= eps;

            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
            let got = analytic[idx];
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
    fn relu_masks_gradient() {
        let input = ramp((1, 1, 2, 2));
        let grad_out = Array4::from_elem((1, 1, 2, 2), 1.0);
        let grad = LayerOp::Relu.backward(&input, &grad_out);

        for (g, &x) in grad.iter().zip(input.iter()) {
            assert_eq!(*g, if x > 0.0 { 1.0 } else { 0.0 });
        }
    }

    #[test]
    fn pools_halve_spatial_dims_and_route_gradient() {
        let input = ramp((1, 2, 6, 6));

        for op in [LayerOp::MaxPool, LayerOp::AvgPool].iter() {
            let out = op.forward(&input);
            assert_eq!(out.dim(), (1, 2, 3, 3));

            // total gradient mass is conserved by both pools
            let grad_out = Array4::from_elem((1, 2, 3, 3), 1.0);
            let grad_in = op.backward(&input, &grad_out);
            let total: f32 = grad_in.iter().sum();
            assert!((total - 18.0).abs() < 1e-4, "total {}", total);
        }
    }

    #[test]
    fn extract_stops_after_deepest_requested_layer() {
        let net = ConvNet::vgg19(7);
        let input = ramp((1, 3, 8, 8));

        let ids: BTreeSet<String> = ["conv1_2"].iter().map(|s| s.to_string()).collect();
        let pass = net.extract(&input, &ids).unwrap();

        // conv1_1, relu1_1, conv1_2 - nothing deeper ran
        assert_eq!(pass.inputs.len(), 3);
        assert_eq!(pass.features.len(), 1);
        assert_eq!(pass.features["conv1_2"].dim(), (1, 64, 8, 8));
    }

    #[test]
    fn extract_rejects_unknown_layer() {
        let net = ConvNet::vgg19(7);
        let input = ramp((1, 3, 4, 4));

        let ids: BTreeSet<String> = ["conv9_9"].iter().map(|s| s.to_string()).collect();
        match net.extract(&input, &ids) {
            Err(Error::UnknownLayer(id)) => assert_eq!(id, "conv9_9"),
            other => panic!("expected UnknownLayer, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn extract_is_deterministic() {
        let net = ConvNet::vgg19(3);
        let input = ramp((1, 3, 8, 8));
        let ids: BTreeSet<String> = ["relu1_1", "pool1"].iter().map(|s| s.to_string()).collect();

        let a = net.extract(&input, &ids).unwrap();
        let b = net.extract(&input, &ids).unwrap();

        for (id, fa) in &a.features {
            assert_eq!(fa, &b.features[id]);
        }
    }

    #[test]
    fn backward_chains_through_whole_prefix() {
        let net = ConvNet::from_layers(vec![
            ("c1".to_string(), LayerOp::Conv(tiny_conv(2, 1, 5))),
            ("r1".to_string(), LayerOp::Relu),
            ("c2".to_string(), LayerOp::Conv(tiny_conv(2, 2, 6))),
        ]);
        let input = ramp((1, 1, 4, 4));
        let ids: BTreeSet<String> = ["c2"].iter().map(|s| s.to_string()).collect();

        let pass = net.extract(&input, &ids).unwrap();
        let out = pass.features["c2"].clone();

        let mut grads = BTreeMap::new();
        grads.insert("c2".to_string(), out.clone());
        let analytic = net.backward(&pass, grads);
        assert_eq!(analytic.dim(), input.dim());

        // numeric check of d(0.5 * sum(c2^2)) / d(input)
        let loss = |inp: &Array4<f32>| -> f32 {
            let pass = net.extract(inp, &ids).unwrap();
            pass.features["c2"].iter().map(|v| 0.5 * v * v).sum()
        };

        let eps = 1e-3;
        for idx in [(0, 0, 0, 0), (0, 0, 2, 1), (0, 0, 3, 3)] {
            let mut plus = input.clone();
            plus[idx] += eps;
            let mut minus = input.clone();
            minus[idx] -= eps;

            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
            assert!(
                (numeric - analytic[idx]).abs() < 1e-2 * numeric.abs().max(1.0),
                "at {:?}: numeric {} vs analytic {}",
                idx,
                numeric,
                analytic[idx]
            );
        }
    }
}
