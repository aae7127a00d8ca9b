//! EfficientNet-Lite architecture, emitted as an NNEF graph.

use log::debug;
use tract_nnef::internal::*;
use tract_nnef::prelude::tract_ndarray::Axis;

use crate::blocks::{blocks, BlockSpec, HEAD_FILTERS, STEM_FILTERS};
use crate::graph::{conv_output_size, same_padding, NnefWriter, Reducer};
use crate::model::{ClassifierActivation, ModelConfig, Pooling};
use crate::weights::{depthwise_to_oihw, hwio_to_oihw, WeightStore};

/// Graph under construction, tracking the NCHW activation and its spatial size.
struct Builder<'a> {
    writer: NnefWriter,
    store: &'a mut WeightStore,
    current: String,
    channels: usize,
    height: usize,
    width: usize,
}

impl Builder<'_> {
    /// Convolution followed by folded batch norm, SAME padding.
    fn conv_bn(
        &mut self,
        conv_layer: &str,
        bn_layer: &str,
        input: &str,
        kernel: usize,
        stride: usize,
        filters: usize,
    ) -> TractResult<String> {
        let hwio = self.store.conv_kernel(conv_layer, kernel, self.channels, filters)?;
        let bn = self.store.batch_norm(bn_layer, filters)?;
        let (filter, bias) = bn.fold_into(hwio_to_oihw(hwio))?;
        let padding = self.pad(kernel, stride);
        let output = self.writer.conv(conv_layer, input, filter, bias, stride, padding, 1)?;
        self.advance(kernel, stride, padding);
        self.channels = filters;
        Ok(output)
    }

    fn depthwise_bn(
        &mut self,
        conv_layer: &str,
        bn_layer: &str,
        input: &str,
        kernel: usize,
        stride: usize,
    ) -> TractResult<String> {
        let hwc1 = self.store.depthwise_kernel(conv_layer, kernel, self.channels)?;
        let bn = self.store.batch_norm(bn_layer, self.channels)?;
        let (filter, bias) = bn.fold_into(depthwise_to_oihw(hwc1))?;
        let padding = self.pad(kernel, stride);
        let groups = self.channels;
        let output = self.writer.conv(conv_layer, input, filter, bias, stride, padding, groups)?;
        self.advance(kernel, stride, padding);
        Ok(output)
    }

    fn pad(&self, kernel: usize, stride: usize) -> [(usize, usize); 2] {
        [same_padding(self.height, kernel, stride), same_padding(self.width, kernel, stride)]
    }

    fn advance(&mut self, kernel: usize, stride: usize, padding: [(usize, usize); 2]) {
        self.height = conv_output_size(self.height, kernel, stride, padding[0]);
        self.width = conv_output_size(self.width, kernel, stride, padding[1]);
    }

    fn relu6(&mut self, name: &str, input: &str) -> String {
        self.writer.clamp(name, input, 0.0, 6.0)
    }

    fn mbconv(&mut self, block: &BlockSpec) -> TractResult<()> {
        let p = &block.prefix;
        debug!(
            "{}: {}x{} {}->{} k{} s{} e{}",
            p, self.height, self.width, block.filters_in, block.filters_out, block.kernel,
            block.stride, block.expand_ratio
        );
        let input = self.current.clone();
        let mut x = input.clone();
        if block.has_expansion() {
            x = self.conv_bn(
                &format!("{p}expand_conv"),
                &format!("{p}expand_bn"),
                &x,
                1,
                1,
                block.expanded_filters(),
            )?;
            x = self.relu6(&format!("{p}expand_activation"), &x);
        }
        x = self.depthwise_bn(
            &format!("{p}dwconv"),
            &format!("{p}bn"),
            &x,
            block.kernel,
            block.stride,
        )?;
        x = self.relu6(&format!("{p}activation"), &x);
        x = self.conv_bn(
            &format!("{p}project_conv"),
            &format!("{p}project_bn"),
            &x,
            1,
            1,
            block.filters_out,
        )?;
        if block.has_residual() {
            x = self.writer.add(&format!("{p}add"), &x, &input);
        }
        self.current = x;
        Ok(())
    }
}

/// Builds the full network for `config`, returning the writer and the name
/// of the output identifier.
pub fn build(config: &ModelConfig, store: &mut WeightStore) -> TractResult<(NnefWriter, String)> {
    let (height, width) = config.input_size();
    let variant = config.variant;
    let mut writer = NnefWriter::new(&variant.model_name().replace('-', "_"));
    let input = writer.external("input", &config.input_shape());
    let nchw = writer.transpose("input_nchw", &input, &[0, 3, 1, 2]);
    let mut b = Builder { writer, store, current: nchw, channels: 3, height, width };

    let stem = b.current.clone();
    let stem = b.conv_bn("stem_conv", "stem_bn", &stem, 3, 2, STEM_FILTERS)?;
    b.current = b.relu6("stem_activation", &stem);

    for block in blocks(variant) {
        b.mbconv(&block)?;
    }

    let top = b.current.clone();
    let top = b.conv_bn("top_conv", "top_bn", &top, 1, 1, HEAD_FILTERS)?;
    let top = b.relu6("top_activation", &top);

    let output = if config.include_top {
        let pooled = b.writer.reduce("avg_pool_reduce", Reducer::Mean, &top, &[2, 3]);
        let pooled = b.writer.squeeze("avg_pool", &pooled, &[2, 3]);
        let (kernel, bias) = b.store.dense("predictions", HEAD_FILTERS, config.classes)?;
        let filter = kernel.reversed_axes().as_standard_layout().into_owned();
        let bias = bias.insert_axis(Axis(0));
        let logits = b.writer.linear("predictions", &pooled, filter.into(), bias.into())?;
        match config.classifier_activation {
            ClassifierActivation::Softmax => b.writer.softmax("probabilities", &logits, 1),
            ClassifierActivation::Linear => logits,
        }
    } else {
        match config.pooling {
            Some(pooling) => {
                let (name, reducer) = match pooling {
                    Pooling::Avg => ("avg_pool", Reducer::Mean),
                    Pooling::Max => ("max_pool", Reducer::Max),
                };
                let reduced = b.writer.reduce(&format!("{name}_reduce"), reducer, &top, &[2, 3]);
                b.writer.squeeze(name, &reduced, &[2, 3])
            }
            None => b.writer.transpose("features", &top, &[0, 2, 3, 1]),
        }
    };
    debug!("Output {} ({}x{} feature map)", output, b.height, b.width);
    Ok((b.writer, output))
}
