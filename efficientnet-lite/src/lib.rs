//! EfficientNet-Lite B0 to B4 image classifiers running on tract.
//!
//! The network for a [ModelConfig] is generated as an NNEF graph, with batch
//! norms folded into the convolutions, then loaded and optimized by
//! `tract-nnef`. Weights come from Keras-named `.npz` archives or from a
//! seeded random initializer.
//!
//! ```no_run
//! use efficientnet_lite::prelude::*;
//!
//! # fn main() -> TractResult<()> {
//! let model = EfficientNetLite::pretrained(Variant::B0, Weights::ImageNet)?;
//! for prediction in model.predict("panda.jpg", Normalization::Symmetric, 5)? {
//!     println!("{prediction}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod blocks;
pub mod compare;
pub mod graph;
pub mod model;
mod network;
pub mod predict;
pub mod preprocess;
pub mod variant;
pub mod weights;

pub use compare::{load_reference, Tolerance};
pub use model::{ClassifierActivation, EfficientNetLite, ModelConfig, Pooling};
pub use predict::{top_k, Prediction};
pub use preprocess::{normalize, preprocess_input, Normalization};
pub use tract_nnef;
pub use variant::Variant;
pub use weights::Weights;

pub mod prelude {
    pub use crate::compare::{load_reference, Tolerance};
    pub use crate::model::{ClassifierActivation, EfficientNetLite, ModelConfig, Pooling};
    pub use crate::predict::{load_labels, top_k, with_labels, Prediction};
    pub use crate::preprocess::{image_to_input, load_image, preprocess_input, Normalization};
    pub use crate::variant::Variant;
    pub use crate::weights::Weights;
    pub use tract_nnef::prelude::{tensor1, tensor2, Tensor, TractError, TractResult};
}
