use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use image::RgbImage;
use log::info;
use tract_nnef::internal::*;

use crate::predict::{top_k, Prediction};
use crate::preprocess::{image_to_input, load_image, Normalization};
use crate::variant::Variant;
use crate::weights::{WeightStore, Weights};

/// Smallest accepted input side.
pub const MIN_INPUT_SIZE: usize = 32;
pub const IMAGENET_CLASSES: usize = 1000;

/// Global pooling applied to the feature map when the classifier is left out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Pooling {
    Avg,
    Max,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ClassifierActivation {
    #[default]
    Softmax,
    /// Raw logits.
    Linear,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelConfig {
    pub variant: Variant,
    pub weights: Weights,
    pub include_top: bool,
    /// (height, width), the variant resolution when None.
    pub input_size: Option<(usize, usize)>,
    pub batch_size: usize,
    pub classes: usize,
    pub pooling: Option<Pooling>,
    pub classifier_activation: ClassifierActivation,
}

impl ModelConfig {
    pub fn new(variant: Variant) -> ModelConfig {
        ModelConfig {
            variant,
            weights: Weights::ImageNet,
            include_top: true,
            input_size: None,
            batch_size: 1,
            classes: IMAGENET_CLASSES,
            pooling: None,
            classifier_activation: ClassifierActivation::Softmax,
        }
    }

    pub fn with_weights(self, weights: Weights) -> ModelConfig {
        ModelConfig { weights, ..self }
    }

    pub fn with_input_size(self, height: usize, width: usize) -> ModelConfig {
        ModelConfig { input_size: Some((height, width)), ..self }
    }

    pub fn with_batch_size(self, batch_size: usize) -> ModelConfig {
        ModelConfig { batch_size, ..self }
    }

    pub fn with_classes(self, classes: usize) -> ModelConfig {
        ModelConfig { classes, ..self }
    }

    /// Drops the classifier, optionally pooling the feature map.
    pub fn without_top(self, pooling: Option<Pooling>) -> ModelConfig {
        ModelConfig { include_top: false, pooling, ..self }
    }

    pub fn with_classifier_activation(self, activation: ClassifierActivation) -> ModelConfig {
        ModelConfig { classifier_activation: activation, ..self }
    }

    pub fn input_size(&self) -> (usize, usize) {
        self.input_size.unwrap_or_else(|| self.variant.input_size())
    }

    /// NHWC input shape.
    pub fn input_shape(&self) -> [usize; 4] {
        let (h, w) = self.input_size();
        [self.batch_size, h, w, 3]
    }

    pub fn validate(&self) -> TractResult<()> {
        let (h, w) = self.input_size();
        if h < MIN_INPUT_SIZE || w < MIN_INPUT_SIZE {
            bail!(
                "Input size {}x{} is below the {}x{} minimum",
                h,
                w,
                MIN_INPUT_SIZE,
                MIN_INPUT_SIZE
            );
        }
        if self.batch_size == 0 {
            bail!("Batch size must be at least 1");
        }
        if self.include_top {
            if self.classes == 0 {
                bail!("Classifier needs at least one class");
            }
            if self.weights.is_imagenet() && self.classes != IMAGENET_CLASSES {
                bail!(
                    "ImageNet weights with the classifier require {} classes, got {}",
                    IMAGENET_CLASSES,
                    self.classes
                );
            }
            if self.pooling.is_some() {
                bail!("Pooling only applies when the classifier is left out");
            }
        }
        Ok(())
    }
}

/// A ready-to-run EfficientNet-Lite network. Cloning shares the plan.
#[derive(Clone)]
pub struct EfficientNetLite {
    config: ModelConfig,
    plan: Arc<TypedSimplePlan<TypedModel>>,
}

impl std::fmt::Debug for EfficientNetLite {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EfficientNetLite").field("config", &self.config).finish()
    }
}

impl EfficientNetLite {
    /// Convenience for `ModelConfig::new(variant).with_weights(weights)`.
    pub fn pretrained(variant: Variant, weights: Weights) -> TractResult<EfficientNetLite> {
        EfficientNetLite::new(ModelConfig::new(variant).with_weights(weights))
    }

    pub fn new(config: ModelConfig) -> TractResult<EfficientNetLite> {
        let archive = EfficientNetLite::nnef_archive(&config)?;
        let model = tract_nnef::nnef()
            .model_for_read(&mut std::io::Cursor::new(archive))
            .with_context(|| format!("Loading generated {} graph", config.variant))?;
        let plan = model.into_optimized()?.into_runnable()?;
        info!("{} ready, input {:?}", config.variant, config.input_shape());
        Ok(EfficientNetLite { config, plan: Arc::new(plan) })
    }

    /// Generates the NNEF tar archive describing the network and its weights.
    pub fn nnef_archive(config: &ModelConfig) -> TractResult<Vec<u8>> {
        config.validate()?;
        let mut store = WeightStore::open(&config.weights, config.variant)?;
        let (writer, output) = crate::network::build(config, &mut store)?;
        writer.archive(&[&output])
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn variant(&self) -> Variant {
        self.config.variant
    }

    pub fn input_shape(&self) -> [usize; 4] {
        self.config.input_shape()
    }

    /// Runs inference on a preprocessed NHWC f32 tensor.
    pub fn run(&self, input: Tensor) -> TractResult<Tensor> {
        let expected = self.input_shape();
        if input.datum_type() != f32::datum_type() || input.shape() != expected {
            bail!(
                "{} expects a f32 input of shape {:?}, got {:?} {:?}",
                self.config.variant,
                expected,
                input.datum_type(),
                input.shape()
            );
        }
        let mut outputs = self.plan.run(tvec!(input.into_tvalue()))?;
        Ok(outputs.remove(0).into_tensor())
    }

    /// Resizes, normalizes and runs a single image.
    pub fn run_image(&self, image: &RgbImage, normalization: Normalization) -> TractResult<Tensor> {
        if self.config.batch_size != 1 {
            bail!("Single image inference needs a batch size of 1");
        }
        self.run(image_to_input(image, self.config.input_size(), normalization))
    }

    /// Top `k` classes for the image at `path`.
    pub fn predict(
        &self,
        path: impl AsRef<Path>,
        normalization: Normalization,
        k: usize,
    ) -> TractResult<Vec<Prediction>> {
        if !self.config.include_top {
            bail!("Predictions need the classifier");
        }
        let image = load_image(path)?;
        let output = self.run_image(&image, normalization)?;
        top_k(&output, k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ModelConfig::new(Variant::B2);
        assert_eq!(config.input_shape(), [1, 260, 260, 3]);
        assert_eq!(config.classes, 1000);
        assert!(config.include_top);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn custom_input_size() {
        let config = ModelConfig::new(Variant::B0).with_input_size(96, 128).with_batch_size(2);
        assert_eq!(config.input_shape(), [2, 96, 128, 3]);
    }

    #[test]
    fn rejects_invalid_configs() {
        let base = ModelConfig::new(Variant::B0);
        assert!(base.clone().with_classes(10).validate().is_err());
        let random = base.clone().with_weights(Weights::Random { seed: 0 });
        assert!(random.with_classes(10).validate().is_ok());
        assert!(base.clone().with_input_size(31, 224).validate().is_err());
        assert!(base.clone().with_batch_size(0).validate().is_err());
        let pooled_top = ModelConfig { pooling: Some(Pooling::Avg), ..base.clone() };
        assert!(pooled_top.validate().is_err());
        assert!(base.clone().without_top(Some(Pooling::Max)).with_classes(10).validate().is_ok());
        let no_class = base.with_weights(Weights::Random { seed: 0 }).with_classes(0);
        assert!(no_class.validate().is_err());
    }
}
