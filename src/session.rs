use crate::*;

use ndarray::Array4;
use ndarray_rand::{rand_distr::Normal, RandomExt};
use rand::SeedableRng;
use rand_pcg::Pcg32;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

// used when the builder is given no layer selection of its own
const DEFAULT_CONTENT_LAYER: &str = "conv4_2";
const DEFAULT_STYLE_LAYERS: [&str; 5] = ["conv1_1", "conv2_1", "conv3_1", "conv4_1", "conv5_1"];

/// Style transfer session.
///
/// Calling `run()` will optimize a candidate image against the session's
/// content and style references and return it, consuming the session in
/// the process. You can provide a `TransferProgress` implementation to
/// periodically get updates with the current loss values and a snapshot
/// of the candidate.
///
/// # Example
/// ```no_run
/// let session = style_transfer::Session::builder()
///     .content(&"imgs/tom.jpg")
///     .style(&"imgs/style.jpg")
///     .max_iterations(300)
///     .build().expect("failed to build session");
///
/// let stylized = session.run(None).expect("optimization failed");
/// stylized.save("stylized.jpg").expect("failed to save image");
/// ```
pub struct Session {
    content: FeatureMap,
    style: FeatureMap,
    candidate: FeatureMap,
    backbone: Box<dyn Backbone>,
    cancel: Option<Arc<AtomicBool>>,
    params: Parameters,
}

impl Session {
    /// Creates a new session with default parameters.
    pub fn builder<'a>() -> SessionBuilder<'a> {
        SessionBuilder::default()
    }

    /// Runs the optimization loop and returns the stylized image.
    pub fn run(
        self,
        progress: Option<Box<dyn TransferProgress>>,
    ) -> Result<StylizedImage, Error> {
        let outcome = Generator::new(self.candidate).optimize(
            self.backbone.as_ref(),
            &self.content,
            &self.style,
            &self.params.to_transfer_params(),
            progress,
            self.cancel,
        )?;

        Ok(StylizedImage {
            tensor: outcome.candidate,
            stop: outcome.stop,
            iterations: outcome.iterations,
            losses: outcome.losses,
        })
    }
}

enum TensorInput<'a> {
    Source(ImageSource<'a>),
    Tensor(FeatureMap),
}

enum CandidateInit<'a> {
    /// Start from a copy of the content image (the default)
    Content,
    /// Start from seeded gaussian noise in normalized space
    Noise { seed: u64 },
    /// Start from a caller-provided image
    Input(TensorInput<'a>),
}

/// Builds a session by setting parameters and adding input images, calling
/// `build` will load the provided inputs and verify that they can produce
/// a valid optimization run
pub struct SessionBuilder<'a> {
    content: Option<TensorInput<'a>>,
    style: Option<TensorInput<'a>>,
    init: CandidateInit<'a>,
    backbone: Option<Box<dyn Backbone>>,
    resize: Option<Dims>,
    cancel: Option<Arc<AtomicBool>>,
    params: Parameters,
}

impl<'a> Default for SessionBuilder<'a> {
    fn default() -> Self {
        Self {
            content: None,
            style: None,
            init: CandidateInit::Content,
            backbone: None,
            resize: None,
            cancel: None,
            params: Parameters::default(),
        }
    }
}

impl<'a> SessionBuilder<'a> {
    /// Creates a new `SessionBuilder`, can also be created via
    /// `Session::builder()`
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the content reference, whose high-level structure the output
    /// should preserve.
    pub fn content<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.content = Some(TensorInput::Source(img.into()));
        self
    }

    /// Sets the content reference from an already normalized tensor.
    pub fn content_tensor(mut self, tensor: FeatureMap) -> Self {
        self.content = Some(TensorInput::Tensor(tensor));
        self
    }

    /// Sets the style reference, whose texture statistics the output
    /// should adopt.
    pub fn style<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.style = Some(TensorInput::Source(img.into()));
        self
    }

    /// Sets the style reference from an already normalized tensor.
    pub fn style_tensor(mut self, tensor: FeatureMap) -> Self {
        self.style = Some(TensorInput::Tensor(tensor));
        self
    }

    /// Starts the optimization from the given image instead of a copy of
    /// the content image.
    pub fn initial_candidate<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.init = CandidateInit::Input(TensorInput::Source(img.into()));
        self
    }

    /// Starts the optimization from an already normalized tensor.
    pub fn initial_candidate_tensor(mut self, tensor: FeatureMap) -> Self {
        self.init = CandidateInit::Input(TensorInput::Tensor(tensor));
        self
    }

    /// Starts the optimization from seeded gaussian noise.
    pub fn noise_init(mut self, seed: u64) -> Self {
        self.init = CandidateInit::Noise { seed };
        self
    }

    /// How strongly the output is pulled toward the content reference.
    ///
    /// Default: 1.0
    pub fn content_weight(mut self, value: f32) -> Self {
        self.params.content_weight = value;
        self
    }

    /// How strongly the output is pulled toward the style statistics.
    ///
    /// Default: 1000.0
    pub fn style_weight(mut self, value: f32) -> Self {
        self.params.style_weight = value;
        self
    }

    /// Adds a content comparison layer. If none are added, `conv4_2` is
    /// used.
    pub fn content_layer<S: Into<String>>(mut self, id: S, weight: f32) -> Self {
        self.params.content_layers.push((id.into(), weight));
        self
    }

    /// Adds a style comparison layer. If none are added, `conv1_1`
    /// through `conv5_1` are used with equal weights.
    pub fn style_layer<S: Into<String>>(mut self, id: S, weight: f32) -> Self {
        self.params.style_layers.push((id.into(), weight));
        self
    }

    /// The iteration budget.
    ///
    /// Default: 500
    pub fn max_iterations(mut self, count: usize) -> Self {
        self.params.max_iterations = count;
        self
    }

    /// How often progress events are emitted, in iterations.
    ///
    /// Default: 50
    pub fn report_interval(mut self, interval: usize) -> Self {
        self.params.report_interval = interval;
        self
    }

    /// The optimizer step size.
    ///
    /// Default: 0.05
    pub fn learning_rate(mut self, value: f32) -> Self {
        self.params.learning_rate = value;
        self
    }

    /// Stops the run early once the loss delta between consecutive
    /// iterations drops below this threshold. Off by default; without it
    /// the run is bounded purely by the iteration budget.
    pub fn convergence_threshold(mut self, value: f32) -> Self {
        self.params.convergence_threshold = Some(value);
        self
    }

    /// Overwrite incoming images sizes
    pub fn resize_input(mut self, dims: Dims) -> Self {
        self.resize = Some(dims);
        self
    }

    /// Injects the frozen feature backbone. Without one, the VGG-19 layer
    /// table with seeded random weights is used; for faithful results
    /// inject pretrained weights through `ConvNet::from_layers`.
    pub fn backbone(mut self, backbone: Box<dyn Backbone>) -> Self {
        self.backbone = Some(backbone);
        self
    }

    /// A flag the loop checks once per iteration; raising it stops the
    /// run and returns the current candidate.
    pub fn cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Creates a `Session`, or returns an error if invalid parameters or
    /// input images were specified.
    pub fn build(self) -> Result<Session, Error> {
        self.check_parameters_validity()?;

        let backbone = match self.backbone {
            Some(backbone) => backbone,
            None => Box::new(ConvNet::vgg19(0)),
        };

        let mut params = self.params;
        if params.content_layers.is_empty() {
            params.content_layers.push((DEFAULT_CONTENT_LAYER.to_string(), 1.0));
        }
        if params.style_layers.is_empty() {
            for id in DEFAULT_STYLE_LAYERS.iter() {
                params.style_layers.push((id.to_string(), 0.2));
            }
        }

        let content = match self.content {
            Some(input) => resolve_input(input, self.resize)?,
            None => return Err(Error::MissingImage("content")),
        };
        let style = match self.style {
            Some(input) => resolve_input(input, self.resize)?,
            None => return Err(Error::MissingImage("style")),
        };

        let content_dims = tensor::dims(&content);
        check_dims(content_dims, tensor::dims(&style), "style")?;

        for (id, _) in params.content_layers.iter().chain(params.style_layers.iter()) {
            if !backbone.has_layer(id) {
                return Err(Error::UnknownLayer(id.clone()));
            }
        }

        let candidate = match self.init {
            CandidateInit::Content => content.clone(),
            CandidateInit::Noise { seed } => Array4::random_using(
                content.dim(),
                Normal::new(0.0, 1.0).unwrap(),
                &mut Pcg32::seed_from_u64(seed),
            ),
            CandidateInit::Input(input) => {
                let candidate = resolve_input(input, self.resize)?;
                check_dims(content_dims, tensor::dims(&candidate), "candidate")?;
                candidate
            }
        };

        Ok(Session {
            content,
            style,
            candidate,
            backbone,
            cancel: self.cancel,
            params,
        })
    }

    fn check_parameters_validity(&self) -> Result<(), Error> {
        if self.params.content_weight < 0.0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 0.0,
                max: f32::INFINITY,
                value: self.params.content_weight,
                name: "content-weight",
            }));
        }

        if self.params.style_weight < 0.0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 0.0,
                max: f32::INFINITY,
                value: self.params.style_weight,
                name: "style-weight",
            }));
        }

        for (layers, name) in [
            (&self.params.content_layers, "content-layer-weight"),
            (&self.params.style_layers, "style-layer-weight"),
        ] {
            if let Some((_, weight)) = layers.iter().find(|(_, w)| *w < 0.0) {
                return Err(Error::InvalidRange(errors::InvalidRange {
                    min: 0.0,
                    max: f32::INFINITY,
                    value: *weight,
                    name,
                }));
            }
        }

        if self.params.max_iterations == 0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: f32::INFINITY,
                value: 0.0,
                name: "max-iterations",
            }));
        }

        if self.params.report_interval == 0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: f32::INFINITY,
                value: 0.0,
                name: "report-interval",
            }));
        }

        if self.params.learning_rate <= 0.0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 0.0,
                max: f32::INFINITY,
                value: self.params.learning_rate,
                name: "learning-rate",
            }));
        }

        if let Some(threshold) = self.params.convergence_threshold {
            if threshold <= 0.0 {
                return Err(Error::InvalidRange(errors::InvalidRange {
                    min: 0.0,
                    max: f32::INFINITY,
                    value: threshold,
                    name: "convergence-threshold",
                }));
            }
        }

        Ok(())
    }
}

fn resolve_input(input: TensorInput<'_>, resize: Option<Dims>) -> Result<FeatureMap, Error> {
    match input {
        TensorInput::Source(src) => utils::load_tensor(src, resize),
        TensorInput::Tensor(tensor) => {
            let (batch, channels, _, _) = tensor.dim();
            if batch != 1 || channels != 3 {
                return Err(Error::Shape(format!(
                    "image tensors must be (1, 3, h, w), got ({}, {}, ..)",
                    batch, channels
                )));
            }
            Ok(tensor)
        }
    }
}

fn check_dims(expected: Dims, got: Dims, name: &'static str) -> Result<(), Error> {
    if expected.width != got.width || expected.height != got.height {
        return Err(Error::ShapeMismatch(errors::ShapeMismatch {
            expected: (expected.width, expected.height),
            got: (got.width, got.height),
            name,
        }));
    }
    Ok(())
}

/// The current state of the optimization, handed to external callers
pub struct ProgressUpdate<'a> {
    /// Number of completed iterations
    pub iteration: usize,
    /// `content_weight * content_loss + style_weight * style_loss`
    pub total_loss: f32,
    /// Unweighted content loss component
    pub content_loss: f32,
    /// Unweighted style loss component
    pub style_loss: f32,
    /// Wall time since the loop started
    pub elapsed: Duration,
    /// De-normalized snapshot of the current candidate
    pub image: &'a image::RgbaImage,
}

/// Allows the optimization loop to update external callers with the
/// current progress of the style transfer
pub trait TransferProgress {
    fn update(&mut self, info: ProgressUpdate<'_>);
}

impl<G> TransferProgress for G
where
    G: FnMut(ProgressUpdate<'_>) + Send,
{
    fn update(&mut self, info: ProgressUpdate<'_>) {
        self(info)
    }
}
