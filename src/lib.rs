// BEGIN - Embark standard lints v0.4
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v0.4

//! `style-transfer` is a light API for optimization-based neural style
//! transfer: it synthesizes an image whose texture statistics match a
//! *style* reference while its high-level structure follows a *content*
//! reference.
//!
//! First, you build a `Session` via a `SessionBuilder`, which follows the
//! builder pattern. Calling `build` on the `SessionBuilder` loads the input
//! images and checks for various errors.
//!
//! `Session` has a `run()` method that repeatedly adjusts the pixels of a
//! candidate image to minimize a composite content + style loss evaluated
//! through a frozen feature backbone, and returns the result as a
//! `StylizedImage`.
//!
//! You can save, stream, or inspect the image from `StylizedImage`.
//!
//! ## Usage
//! Session follows a "builder pattern" for defining parameters, meaning you
//! chain functions together.
//!
//! ```no_run
//! // Create a new session with default parameters
//! let session = style_transfer::Session::builder()
//!     // Specify the references
//!     .content(&"imgs/tom.jpg")
//!     .style(&"imgs/starry_night.jpg")
//!     // Set some parameters
//!     .style_weight(500.0)
//!     .max_iterations(300)
//!     // Build the session
//!     .build().expect("failed to build session");
//!
//! // Optimize a new image
//! let stylized = session.run(None).expect("optimization failed");
//!
//! // Save it to disk
//! stylized.save("stylized.jpg").expect("failed to save image");
//! ```
mod errors;
mod backbone;
mod gram;
mod loss;
mod optimizer;
pub mod session;
pub mod tensor;
mod transfer;
use transfer::*;
mod utils;

pub use image;
use std::path::Path;

pub use backbone::{Backbone, Conv2d, ConvNet, FeatureMap, FeaturePass, LayerOp};
pub use errors::Error;
pub use gram::gram_matrix;
pub use loss::Losses;
pub use session::{ProgressUpdate, Session, SessionBuilder, TransferProgress};
pub use transfer::StopReason;
pub use utils::{load_dynamic_image, ImageSource};

/// Simple dimensions struct
#[derive(Copy, Clone)]
#[cfg_attr(test, derive(Debug, PartialEq))]
pub struct Dims {
    pub width: u32,
    pub height: u32,
}

impl Dims {
    pub fn square(size: u32) -> Self {
        Self {
            width: size,
            height: size,
        }
    }
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

struct Parameters {
    content_weight: f32,
    style_weight: f32,
    content_layers: Vec<(String, f32)>,
    style_layers: Vec<(String, f32)>,
    max_iterations: usize,
    report_interval: usize,
    learning_rate: f32,
    convergence_threshold: Option<f32>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            content_weight: 1.0,
            style_weight: 1000.0,
            content_layers: Vec::new(),
            style_layers: Vec::new(),
            max_iterations: 500,
            report_interval: 50,
            learning_rate: 0.05,
            convergence_threshold: None,
        }
    }
}

impl Parameters {
    fn to_transfer_params(&self) -> TransferParams {
        // a layer listed twice contributes the sum of its weights
        let collect = |layers: &[(String, f32)]| {
            let mut map = std::collections::BTreeMap::new();
            for (id, weight) in layers {
                *map.entry(id.clone()).or_insert(0.0) += weight;
            }
            map
        };

        TransferParams {
            content_weight: self.content_weight,
            style_weight: self.style_weight,
            content_layers: collect(&self.content_layers),
            style_layers: collect(&self.style_layers),
            max_iterations: self.max_iterations,
            report_interval: self.report_interval,
            learning_rate: self.learning_rate,
            convergence_threshold: self.convergence_threshold,
        }
    }
}

/// An image produced by a `Session::run()`
pub struct StylizedImage {
    pub(crate) tensor: FeatureMap,
    pub(crate) stop: StopReason,
    pub(crate) iterations: usize,
    pub(crate) losses: Losses,
}

impl StylizedImage {
    /// Saves the image to the specified path
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        if let Some(parent_path) = path.parent() {
            std::fs::create_dir_all(&parent_path)?;
        }

        tensor::to_image(&self.tensor).save(&path)?;
        Ok(())
    }

    /// Returns the de-normalized, clamped output image
    pub fn into_image(self) -> image::DynamicImage {
        image::DynamicImage::ImageRgba8(tensor::to_image(&self.tensor))
    }

    /// The normalized output tensor, same shape as the inputs
    pub fn into_tensor(self) -> FeatureMap {
        self.tensor
    }

    /// Why the run stopped
    pub fn stop_reason(&self) -> StopReason {
        self.stop
    }

    /// How many optimizer steps were taken
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// The loss values of the final iteration
    pub fn losses(&self) -> Losses {
        self.losses
    }
}
