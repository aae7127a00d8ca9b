//! Textual NNEF graph emission.
//!
//! Networks are described as a `graph.nnef` document plus one `.dat` file per
//! variable, packed in an in-memory tar archive that tract-nnef loads like any
//! model on disk.

use anyhow::Context;
use itertools::Itertools;
use tract_nnef::internal::*;

pub const GRAPH_NNEF: &str = "graph.nnef";

/// Explicit (before, after) padding for each spatial axis.
pub type Padding = [(usize, usize); 2];

/// TensorFlow "SAME" padding for one spatial axis: output size is
/// `ceil(input / stride)`, the extra padding goes after.
pub fn same_padding(input: usize, kernel: usize, stride: usize) -> (usize, usize) {
    let output = input.div_ceil(stride);
    let total = ((output - 1) * stride + kernel).saturating_sub(input);
    (total / 2, total - total / 2)
}

pub fn conv_output_size(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: (usize, usize),
) -> usize {
    (input + padding.0 + padding.1 - kernel) / stride + 1
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reducer {
    Mean,
    Max,
}

impl Reducer {
    fn primitive(&self) -> &'static str {
        match self {
            Reducer::Mean => "mean_reduce",
            Reducer::Max => "max_reduce",
        }
    }
}

#[derive(Debug, Default)]
pub struct NnefWriter {
    graph_name: String,
    inputs: Vec<String>,
    body: Vec<String>,
    variables: Vec<(String, Tensor)>,
}

fn identifier(label: &str) -> String {
    label.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }).collect()
}

fn list(items: &[usize]) -> String {
    format!("[{}]", items.iter().join(", "))
}

impl NnefWriter {
    pub fn new(graph_name: &str) -> NnefWriter {
        NnefWriter { graph_name: identifier(graph_name), ..NnefWriter::default() }
    }

    fn assign(&mut self, name: &str, expr: String) -> String {
        let id = identifier(name);
        self.body.push(format!("{id} = {expr};"));
        id
    }

    pub fn external(&mut self, name: &str, shape: &[usize]) -> String {
        let id = self.assign(name, format!("external<scalar>(shape = {})", list(shape)));
        self.inputs.push(id.clone());
        id
    }

    /// Declares a variable backed by `tensor`, stored as `{label}.dat`.
    pub fn variable(&mut self, label: &str, tensor: Tensor) -> TractResult<String> {
        if tensor.datum_type() != f32::datum_type() {
            bail!("Variable {} must be f32, got {:?}", label, tensor.datum_type());
        }
        if self.variables.iter().any(|(l, _)| l == label) {
            bail!("Variable {} declared twice", label);
        }
        let id = self.assign(
            label,
            format!("variable<scalar>(label = '{}', shape = {})", label, list(tensor.shape())),
        );
        self.variables.push((label.to_string(), tensor));
        Ok(id)
    }

    /// 2D convolution over NCHW input. `filter` is OIHW, `bias` is `[1, O]`.
    #[allow(clippy::too_many_arguments)]
    pub fn conv(
        &mut self,
        name: &str,
        input: &str,
        filter: Tensor,
        bias: Tensor,
        stride: usize,
        padding: Padding,
        groups: usize,
    ) -> TractResult<String> {
        if filter.rank() != 4 {
            bail!("Convolution {} expects an OIHW filter, got shape {:?}", name, filter.shape());
        }
        if bias.shape() != [1, filter.shape()[0]] {
            bail!(
                "Convolution {} bias shape {:?} does not match {} output channels",
                name,
                bias.shape(),
                filter.shape()[0]
            );
        }
        let filter = self.variable(&format!("{name}/filter"), filter)?;
        let bias = self.variable(&format!("{name}/bias"), bias)?;
        let padding = padding.iter().map(|(b, a)| format!("({b}, {a})")).join(", ");
        Ok(self.assign(
            name,
            format!(
                "conv({input}, {filter}, {bias}, border = 'constant', padding = [{padding}], \
                 stride = [{stride}, {stride}], dilation = [1, 1], groups = {groups})"
            ),
        ))
    }

    pub fn clamp(&mut self, name: &str, input: &str, low: f32, high: f32) -> String {
        self.assign(name, format!("clamp({input}, {low:?}, {high:?})"))
    }

    pub fn add(&mut self, name: &str, a: &str, b: &str) -> String {
        self.assign(name, format!("add({a}, {b})"))
    }

    pub fn transpose(&mut self, name: &str, input: &str, axes: &[usize]) -> String {
        self.assign(name, format!("transpose({input}, axes = {})", list(axes)))
    }

    pub fn reduce(&mut self, name: &str, reducer: Reducer, input: &str, axes: &[usize]) -> String {
        self.assign(name, format!("{}({input}, axes = {})", reducer.primitive(), list(axes)))
    }

    pub fn squeeze(&mut self, name: &str, input: &str, axes: &[usize]) -> String {
        self.assign(name, format!("squeeze({input}, axes = {})", list(axes)))
    }

    /// Fully connected layer: `filter` is `[out, in]`, `bias` is `[1, out]`.
    pub fn linear(
        &mut self,
        name: &str,
        input: &str,
        filter: Tensor,
        bias: Tensor,
    ) -> TractResult<String> {
        let filter = self.variable(&format!("{name}/filter"), filter)?;
        let bias = self.variable(&format!("{name}/bias"), bias)?;
        Ok(self.assign(name, format!("linear({input}, {filter}, {bias})")))
    }

    pub fn softmax(&mut self, name: &str, input: &str, axis: usize) -> String {
        self.assign(name, format!("softmax({input}, axes = [{axis}])"))
    }

    pub fn variables(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.variables.iter().map(|(label, t)| (label.as_str(), t))
    }

    /// Renders the `graph.nnef` document with `outputs` as graph results.
    pub fn document(&self, outputs: &[&str]) -> String {
        let body = self.body.iter().map(|line| format!("    {line}\n")).join("");
        format!(
            "version 1.0;\n\ngraph {}( {} ) -> ( {} )\n{{\n{}}}\n",
            self.graph_name,
            self.inputs.join(", "),
            outputs.join(", "),
            body
        )
    }

    /// Packs the document and variables as an uncompressed NNEF tar archive.
    pub fn archive(&self, outputs: &[&str]) -> TractResult<Vec<u8>> {
        if outputs.is_empty() {
            bail!("Graph {} has no output", self.graph_name);
        }
        let mut ar = tar::Builder::new(vec![]);
        let document = self.document(outputs);
        append(&mut ar, GRAPH_NNEF, document.as_bytes())?;
        for (label, tensor) in &self.variables {
            let mut data = vec![];
            tract_nnef::tensors::write_tensor(&mut data, tensor)
                .with_context(|| format!("Serializing variable {label}"))?;
            append(&mut ar, &format!("{label}.dat"), &data)?;
        }
        ar.into_inner().context("Finalizing tar")
    }
}

fn append(ar: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) -> TractResult<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    ar.append_data(&mut header, path, data).with_context(|| format!("Appending {path}"))
}
