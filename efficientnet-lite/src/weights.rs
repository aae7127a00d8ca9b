//! Weight sources: Keras-named `.npz` archives or seeded random initialization.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use log::{debug, info};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tract_nnef::internal::*;
use tract_nnef::prelude::tract_ndarray::{Array1, ArrayD, Axis, IxDyn};

use crate::blocks::BN_EPSILON;
use crate::variant::Variant;

pub const WEIGHTS_HOME_ENV: &str = "EFFICIENTNET_LITE_HOME";

/// Where model parameters come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Weights {
    /// ImageNet-trained parameters, `efficientnet-liteN.npz` in [weights_dir].
    ImageNet,
    /// An explicit `.npz` archive.
    File(PathBuf),
    /// Deterministic random initialization.
    Random { seed: u64 },
}

impl Weights {
    pub fn is_imagenet(&self) -> bool {
        matches!(self, Weights::ImageNet)
    }

    /// Resolves the archive path, if any, for the given variant.
    pub fn path(&self, variant: Variant) -> TractResult<Option<PathBuf>> {
        match self {
            Weights::ImageNet => Ok(Some(weights_dir()?.join(variant.weights_file_name()))),
            Weights::File(p) => Ok(Some(p.clone())),
            Weights::Random { .. } => Ok(None),
        }
    }
}

impl FromStr for Weights {
    type Err = TractError;

    /// `imagenet`, `random`, `random:SEED`, or a path.
    fn from_str(s: &str) -> TractResult<Weights> {
        match s {
            "imagenet" => Ok(Weights::ImageNet),
            "random" => Ok(Weights::Random { seed: 0 }),
            _ => {
                if let Some(seed) = s.strip_prefix("random:") {
                    let seed = seed.parse().with_context(|| format!("Invalid seed in {s:?}"))?;
                    Ok(Weights::Random { seed })
                } else if s.is_empty() {
                    bail!("Empty weights argument")
                } else {
                    Ok(Weights::File(s.into()))
                }
            }
        }
    }
}

/// Directory holding ImageNet archives: `$EFFICIENTNET_LITE_HOME`, or
/// `~/.cache/efficientnet-lite`.
pub fn weights_dir() -> TractResult<PathBuf> {
    if let Some(dir) = std::env::var_os(WEIGHTS_HOME_ENV) {
        return Ok(dir.into());
    }
    let home = home::home_dir()
        .with_context(|| format!("No home directory, set {WEIGHTS_HOME_ENV}"))?;
    Ok(home.join(".cache").join("efficientnet-lite"))
}

/// How to synthesize a missing parameter in random mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Init {
    /// Normal with std `sqrt(2 / fan_out)`, fan_out over HWIO layout.
    ConvKernel,
    /// Uniform in `±1/sqrt(out)`, `[in, out]` layout.
    DenseKernel,
    Zeros,
    Ones,
}

#[derive(Debug)]
enum Source {
    Archive { path: PathBuf, arrays: HashMap<String, ArrayD<f32>> },
    Random(SmallRng),
}

/// Hands out parameters by Keras layer name, in Keras layout.
#[derive(Debug)]
pub struct WeightStore {
    source: Source,
}

impl WeightStore {
    pub fn open(weights: &Weights, variant: Variant) -> TractResult<WeightStore> {
        match weights {
            Weights::Random { seed } => Ok(WeightStore::random(*seed)),
            _ => {
                let path = weights.path(variant)?.context("Weights have no archive path")?;
                WeightStore::from_npz(path)
            }
        }
    }

    pub fn random(seed: u64) -> WeightStore {
        debug!("Random weights, seed {seed}");
        WeightStore { source: Source::Random(SmallRng::seed_from_u64(seed)) }
    }

    pub fn from_arrays(
        path: impl AsRef<Path>,
        arrays: HashMap<String, ArrayD<f32>>,
    ) -> WeightStore {
        WeightStore { source: Source::Archive { path: path.as_ref().to_owned(), arrays } }
    }

    pub fn from_npz(path: impl AsRef<Path>) -> TractResult<WeightStore> {
        let path = path.as_ref();
        let file = fs_err::File::open(path)?;
        let mut npz = ndarray_npy::NpzReader::new(file)
            .with_context(|| format!("Opening weights archive {path:?}"))?;
        let mut arrays = HashMap::new();
        for name in npz.names()? {
            let array: ArrayD<f32> = npz
                .by_name(&name)
                .with_context(|| format!("Reading {name} from {path:?} (f32 expected)"))?;
            arrays.insert(name.trim_end_matches(".npy").to_string(), array);
        }
        info!("Loaded {} arrays from {:?}", arrays.len(), path);
        Ok(WeightStore::from_arrays(path, arrays))
    }

    pub fn fetch(&mut self, name: &str, shape: &[usize], init: Init) -> TractResult<ArrayD<f32>> {
        match &mut self.source {
            Source::Archive { path, arrays } => {
                let array = arrays
                    .get(name)
                    .with_context(|| format!("Missing {name} in weights archive {path:?}"))?;
                if array.shape() != shape {
                    bail!(
                        "Shape mismatch for {} in {:?}: expected {:?}, got {:?}",
                        name,
                        path,
                        shape,
                        array.shape()
                    );
                }
                Ok(array.clone())
            }
            Source::Random(rng) => random_array(rng, shape, init),
        }
    }

    /// Regular convolution kernel, HWIO.
    pub fn conv_kernel(
        &mut self,
        layer: &str,
        kernel: usize,
        cin: usize,
        cout: usize,
    ) -> TractResult<ArrayD<f32>> {
        self.fetch(&format!("{layer}/kernel"), &[kernel, kernel, cin, cout], Init::ConvKernel)
    }

    /// Depthwise convolution kernel, HWC1.
    pub fn depthwise_kernel(
        &mut self,
        layer: &str,
        kernel: usize,
        channels: usize,
    ) -> TractResult<ArrayD<f32>> {
        let shape = [kernel, kernel, channels, 1];
        self.fetch(&format!("{layer}/depthwise_kernel"), &shape, Init::ConvKernel)
    }

    pub fn batch_norm(&mut self, layer: &str, channels: usize) -> TractResult<BatchNorm> {
        let mut get = |param: &str, init: Init| -> TractResult<Array1<f32>> {
            let array = self.fetch(&format!("{layer}/{param}"), &[channels], init)?;
            Ok(array.into_dimensionality()?)
        };
        Ok(BatchNorm {
            gamma: get("gamma", Init::Ones)?,
            beta: get("beta", Init::Zeros)?,
            mean: get("moving_mean", Init::Zeros)?,
            variance: get("moving_variance", Init::Ones)?,
        })
    }

    /// Dense kernel (`[in, out]`) and bias.
    pub fn dense(
        &mut self,
        layer: &str,
        cin: usize,
        cout: usize,
    ) -> TractResult<(ArrayD<f32>, ArrayD<f32>)> {
        let kernel = self.fetch(&format!("{layer}/kernel"), &[cin, cout], Init::DenseKernel)?;
        let bias = self.fetch(&format!("{layer}/bias"), &[cout], Init::Zeros)?;
        Ok((kernel, bias))
    }
}

fn random_array(rng: &mut SmallRng, dims: &[usize], init: Init) -> TractResult<ArrayD<f32>> {
    let shape = IxDyn(dims);
    Ok(match init {
        Init::Zeros => ArrayD::zeros(shape),
        Init::Ones => ArrayD::ones(shape),
        Init::ConvKernel => {
            if dims.len() != 4 {
                bail!("Convolution kernel must be HWIO, got {:?}", dims);
            }
            let fan_out = (dims[0] * dims[1] * dims[3]).max(1);
            let normal = Normal::new(0f32, (2.0 / fan_out as f32).sqrt())?;
            ArrayD::from_shape_simple_fn(shape, || normal.sample(rng))
        }
        Init::DenseKernel => {
            if dims.len() != 2 {
                bail!("Dense kernel must be [in, out], got {:?}", dims);
            }
            let range = 1.0 / (dims[1].max(1) as f32).sqrt();
            ArrayD::from_shape_simple_fn(shape, || rng.gen_range(-range..range))
        }
    })
}

/// Inference-mode batch normalization parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchNorm {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    pub mean: Array1<f32>,
    pub variance: Array1<f32>,
}

impl BatchNorm {
    /// Per-channel `(scale, shift)` so that `bn(x) = x * scale + shift`.
    pub fn scale_and_shift(&self) -> (Array1<f32>, Array1<f32>) {
        let scale = &self.gamma / &self.variance.mapv(|v| (v + BN_EPSILON).sqrt());
        let shift = &self.beta - &(&self.mean * &scale);
        (scale, shift)
    }

    /// Folds into a convolution with an O-leading kernel, returning the scaled
    /// kernel and the `[1, O]` bias.
    pub fn fold_into(&self, kernel: ArrayD<f32>) -> TractResult<(Tensor, Tensor)> {
        let (scale, shift) = self.scale_and_shift();
        if kernel.shape()[0] != scale.len() {
            bail!(
                "Can not fold batch norm over {} channels into kernel {:?}",
                scale.len(),
                kernel.shape()
            );
        }
        let mut kernel = kernel.as_standard_layout().into_owned();
        for (mut out, s) in kernel.axis_iter_mut(Axis(0)).zip(scale.iter()) {
            out.mapv_inplace(|k| k * s);
        }
        let bias = shift.insert_axis(Axis(0));
        Ok((kernel.into(), bias.into()))
    }
}

/// HWIO to OIHW.
pub fn hwio_to_oihw(kernel: ArrayD<f32>) -> ArrayD<f32> {
    kernel.permuted_axes(IxDyn(&[3, 2, 0, 1])).as_standard_layout().into_owned()
}

/// Depthwise HWC1 to grouped OIHW (`[C, 1, H, W]`).
pub fn depthwise_to_oihw(kernel: ArrayD<f32>) -> ArrayD<f32> {
    kernel.permuted_axes(IxDyn(&[2, 3, 0, 1])).as_standard_layout().into_owned()
}
