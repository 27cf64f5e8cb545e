//! The Gram matrix texture representation.
//!
//! Flattening a feature map's spatial axes and multiplying it with its own
//! transpose yields a `(channels, channels)` matrix of channel
//! co-activations, which captures texture statistics while discarding
//! spatial arrangement. Spatial-size normalization is deliberately *not*
//! applied here; the loss divides the style term by `C * H * W` itself.

use crate::{Error, FeatureMap};
use ndarray::Array2;

/// Computes the Gram matrix of a `(1, C, H, W)` feature map.
///
/// The result is symmetric up to floating-point error.
pub fn gram_matrix(feature: &FeatureMap) -> Result<Array2<f32>, Error> {
    let (batch, channels, height, width) = feature.dim();
    if batch != 1 {
        return Err(Error::Shape(format!(
            "gram matrix expects batch size 1, got {}",
            batch
        )));
    }

    let view = feature.view();
    let flat = view
        .to_shape((channels, height * width))
        .map_err(|e| Error::Shape(e.to_string()))?;

    Ok(flat.dot(&flat.t()))
}
