//! Pixel normalization and image to tensor conversion.

use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use image::RgbImage;
use tract_nnef::internal::*;
use tract_nnef::prelude::tract_ndarray::{Array3, Array4, Axis};

/// Maps `[0, 255]` to `[-1, 1]`: `x / 127.5 - 1`.
pub fn normalize(x: f32) -> f32 {
    x / 127.5 - 1.0
}

/// Inverse of [normalize].
pub fn denormalize(y: f32) -> f32 {
    (y + 1.0) * 127.5
}

/// Pixel normalization schemes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Normalization {
    /// `x / 127.5 - 1`
    #[default]
    Symmetric,
    /// `(x - 127) / 128`, as used to produce the reference outputs.
    Centered,
}

impl Normalization {
    pub fn apply(&self, x: f32) -> f32 {
        match self {
            Normalization::Symmetric => normalize(x),
            Normalization::Centered => (x - 127.0) / 128.0,
        }
    }

    pub fn invert(&self, y: f32) -> f32 {
        match self {
            Normalization::Symmetric => denormalize(y),
            Normalization::Centered => y * 128.0 + 127.0,
        }
    }
}

impl FromStr for Normalization {
    type Err = TractError;

    fn from_str(s: &str) -> TractResult<Normalization> {
        match s {
            "symmetric" => Ok(Normalization::Symmetric),
            "centered" => Ok(Normalization::Centered),
            _ => bail!("Unknown normalization `{}' (expected symmetric or centered)", s),
        }
    }
}

/// Applies `x / 127.5 - 1` to every element. Any numeric input type is
/// accepted, the result is f32 with the same shape.
pub fn preprocess_input(input: &Tensor) -> TractResult<Tensor> {
    normalize_tensor(input, Normalization::Symmetric)
}

pub fn normalize_tensor(input: &Tensor, normalization: Normalization) -> TractResult<Tensor> {
    let input = input.cast_to::<f32>()?;
    Ok(input.to_array_view::<f32>()?.mapv(|x| normalization.apply(x)).into())
}

pub fn load_image(path: impl AsRef<Path>) -> TractResult<RgbImage> {
    let path = path.as_ref();
    let image = image::open(path).with_context(|| format!("Decoding image {path:?}"))?;
    Ok(image.to_rgb8())
}

/// Bilinear resize with half-pixel centers and no antialiasing, without
/// rounding back to integers. Output is HWC.
pub fn resize_bilinear(image: &RgbImage, height: usize, width: usize) -> Array3<f32> {
    let (in_w, in_h) = (image.width() as usize, image.height() as usize);
    let source = Array3::from_shape_fn((in_h, in_w, 3), |(y, x, c)| {
        image.get_pixel(x as u32, y as u32)[c] as f32
    });
    if in_h == 0 || in_w == 0 {
        return Array3::zeros((height, width, 3));
    }
    let ys = interpolation_taps(in_h, height);
    let xs = interpolation_taps(in_w, width);
    Array3::from_shape_fn((height, width, 3), |(y, x, c)| {
        let (y0, y1, wy) = ys[y];
        let (x0, x1, wx) = xs[x];
        let top = source[(y0, x0, c)] + (source[(y0, x1, c)] - source[(y0, x0, c)]) * wx;
        let bottom = source[(y1, x0, c)] + (source[(y1, x1, c)] - source[(y1, x0, c)]) * wx;
        top + (bottom - top) * wy
    })
}

/// For each output coordinate: lower source index, upper source index, and
/// the weight of the upper one.
fn interpolation_taps(input: usize, output: usize) -> Vec<(usize, usize, f32)> {
    let scale = input as f32 / output as f32;
    (0..output)
        .map(|o| {
            let center = (o as f32 + 0.5) * scale - 0.5;
            let floor = center.floor();
            let lower = (floor.max(0.0) as usize).min(input - 1);
            let upper = (center.ceil().max(0.0) as usize).min(input - 1);
            (lower, upper, center - floor)
        })
        .collect()
}

/// Resizes and normalizes an image into a `[1, height, width, 3]` f32 tensor.
pub fn image_to_input(
    image: &RgbImage,
    (height, width): (usize, usize),
    normalization: Normalization,
) -> Tensor {
    let resized = resize_bilinear(image, height, width);
    let normalized: Array4<f32> = resized.mapv(|x| normalization.apply(x)).insert_axis(Axis(0));
    normalized.into()
}
