//! The assembled model graph: named inputs, convolutional branches, an
//! optional joint trunk, and per-channel output heads.

use std::collections::BTreeMap;

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::{stack_batches, Batch};
use crate::error::{Error, Result};
use crate::model::layers::{Feature, LayerOp, NamedLayer};
use crate::model::LossKind;

/// Declared input of one branch; shapes exclude the batch dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BranchInput {
    /// One-hot DNA window, input `dna` of shape `[wlen, 4]`.
    Dna { wlen: usize },
    /// CpG neighbor grid, inputs `cpg/state` and `cpg/dist` of shape
    /// `[replicates, wlen]`, stacked into a 2-channel grid before the
    /// convolution. `encoded_names` carries the `--`-joined replicate
    /// names of legacy models whose input keys embed them.
    Cpg {
        replicates: usize,
        wlen: usize,
        encoded_names: Option<String>,
    },
}

impl BranchInput {
    /// Input tensor names this branch consumes, in feed order.
    pub fn input_names(&self) -> Vec<String> {
        match self {
            BranchInput::Dna { .. } => vec!["dna".to_string()],
            BranchInput::Cpg { encoded_names, .. } => {
                let suffix = match encoded_names {
                    Some(names) => format!("/{}", names),
                    None => String::new(),
                };
                vec![format!("cpg/state{}", suffix), format!("cpg/dist{}", suffix)]
            }
        }
    }

    /// Input shapes matching [`Self::input_names`], batch dimension excluded.
    pub fn input_shapes(&self) -> Vec<Vec<usize>> {
        match *self {
            BranchInput::Dna { wlen } => vec![vec![wlen, 4]],
            BranchInput::Cpg {
                replicates, wlen, ..
            } => vec![vec![replicates, wlen], vec![replicates, wlen]],
        }
    }
}

/// One sub-network: a designated input and its ordered layer stack.
#[derive(Debug)]
pub struct Branch<B: Backend> {
    pub input: BranchInput,
    pub layers: Vec<NamedLayer<B>>,
}

/// One output head: channel name, loss kind, and its layer stack.
#[derive(Debug)]
pub struct Head<B: Backend> {
    pub name: String,
    pub loss: LossKind,
    pub layers: Vec<NamedLayer<B>>,
}

/// A directed acyclic computation graph over named layers.
///
/// Layer names are unique within the model; non-input layers of a scoped
/// model carry the `scope/` prefix so weight matching stays unambiguous
/// when weights are copied between differently-scoped models.
#[derive(Debug)]
pub struct Model<B: Backend> {
    pub name: String,
    pub scope: Option<String>,
    pub(crate) branches: Vec<Branch<B>>,
    pub(crate) trunk: Vec<NamedLayer<B>>,
    pub(crate) heads: Vec<Head<B>>,
    pub(crate) feature_width: usize,
}

impl<B: Backend> Model<B> {
    pub fn new(
        name: impl Into<String>,
        scope: Option<String>,
        branches: Vec<Branch<B>>,
        trunk: Vec<NamedLayer<B>>,
        feature_width: usize,
    ) -> Result<Self> {
        let model = Self {
            name: name.into(),
            scope,
            branches,
            trunk,
            heads: Vec::new(),
            feature_width,
        };
        model.validate()?;
        Ok(model)
    }

    /// Width of the stem output the heads consume.
    pub fn feature_width(&self) -> usize {
        self.feature_width
    }

    pub fn branches(&self) -> &[Branch<B>] {
        &self.branches
    }

    /// Consume the model, yielding its branches for reassembly.
    pub fn into_branches(self) -> Vec<Branch<B>> {
        self.branches
    }

    pub fn trunk(&self) -> &[NamedLayer<B>] {
        &self.trunk
    }

    pub fn heads(&self) -> &[Head<B>] {
        &self.heads
    }

    /// All input tensor names, in feed order.
    pub fn input_names(&self) -> Vec<String> {
        self.branches
            .iter()
            .flat_map(|b| b.input.input_names())
            .collect()
    }

    /// Output channel names, in head order.
    pub fn output_names(&self) -> Vec<String> {
        self.heads.iter().map(|h| h.name.clone()).collect()
    }

    /// All named layers, in execution order.
    pub fn layers(&self) -> impl Iterator<Item = &NamedLayer<B>> {
        self.branches
            .iter()
            .flat_map(|b| b.layers.iter())
            .chain(self.trunk.iter())
            .chain(self.heads.iter().flat_map(|h| h.layers.iter()))
    }

    pub fn layers_mut(&mut self) -> Vec<&mut NamedLayer<B>> {
        let mut layers: Vec<&mut NamedLayer<B>> = Vec::new();
        for branch in &mut self.branches {
            layers.extend(branch.layers.iter_mut());
        }
        layers.extend(self.trunk.iter_mut());
        for head in &mut self.heads {
            layers.extend(head.layers.iter_mut());
        }
        layers
    }

    /// Total number of trainable parameters.
    pub fn num_params(&self) -> usize {
        self.layers().map(|l| l.spec.num_params()).sum()
    }

    /// Enforce the name-uniqueness invariants.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for layer in self.layers() {
            if !seen.insert(layer.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate layer name '{}' in model '{}'",
                    layer.name, self.name
                )));
            }
        }
        let mut inputs = std::collections::BTreeSet::new();
        for name in self.input_names() {
            if !inputs.insert(name.clone()) {
                return Err(Error::Configuration(format!(
                    "duplicate input name '{}' in model '{}'",
                    name, self.name
                )));
            }
        }
        Ok(())
    }

    /// Attach output heads for the given channels.
    pub fn add_output_layers(
        &mut self,
        output_names: &[String],
        params: &crate::model::TargetParams,
        device: &B::Device,
    ) -> Result<()> {
        for name in output_names {
            let built = crate::model::builders::target_layers(params, self.feature_width, name);
            let layers = built
                .layers
                .into_iter()
                .map(|(local, spec)| NamedLayer::new(format!("{}/{}", name, local), spec, device))
                .collect();
            self.heads.push(Head {
                name: name.clone(),
                loss: built.loss,
                layers,
            });
        }
        self.validate()
    }

    fn branch_features(
        &self,
        branch: &Branch<B>,
        inputs: &BTreeMap<String, Feature<B>>,
    ) -> Result<Tensor<B, 2>> {
        let fetch = |name: &str| -> Result<Feature<B>> {
            inputs
                .get(name)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("model input '{}' not supplied", name)))
        };
        let names = branch.input.input_names();
        let mut x = match branch.input {
            BranchInput::Dna { .. } => fetch(&names[0])?,
            BranchInput::Cpg { .. } => {
                let state = match fetch(&names[0])? {
                    Feature::R3(t) => t,
                    other => {
                        return Err(Error::Validation(format!(
                            "input '{}' must be rank 3, got rank {}",
                            names[0],
                            other.rank()
                        )))
                    }
                };
                let dist = match fetch(&names[1])? {
                    Feature::R3(t) => t,
                    other => {
                        return Err(Error::Validation(format!(
                            "input '{}' must be rank 3, got rank {}",
                            names[1],
                            other.rank()
                        )))
                    }
                };
                let grid: Tensor<B, 4> = Tensor::stack(vec![state, dist], 1);
                Feature::R4(grid)
            }
        };
        for layer in &branch.layers {
            x = layer
                .op
                .forward(x)
                .map_err(|e| Error::Validation(format!("layer '{}': {}", layer.name, e)))?;
        }
        x.into_r2()
    }

    /// Run branches, concatenation, and the trunk; returns the stem output.
    pub fn features(&self, inputs: &BTreeMap<String, Feature<B>>) -> Result<Tensor<B, 2>> {
        let mut outputs = Vec::with_capacity(self.branches.len());
        for branch in &self.branches {
            outputs.push(self.branch_features(branch, inputs)?);
        }
        let mut x = if outputs.len() == 1 {
            outputs.remove(0)
        } else {
            Tensor::cat(outputs, 1)
        };
        for layer in &self.trunk {
            let out = layer
                .op
                .forward(Feature::R2(x))
                .map_err(|e| Error::Validation(format!("layer '{}': {}", layer.name, e)))?;
            x = out.into_r2()?;
        }
        Ok(x)
    }

    /// Full forward pass: one prediction tensor per output channel.
    pub fn forward(
        &self,
        inputs: &BTreeMap<String, Feature<B>>,
    ) -> Result<BTreeMap<String, Tensor<B, 2>>> {
        if self.heads.is_empty() {
            return Err(Error::Validation(format!(
                "model '{}' has no output heads",
                self.name
            )));
        }
        let stem = self.features(inputs)?;
        let mut outputs = BTreeMap::new();
        for head in &self.heads {
            let mut x = Feature::R2(stem.clone());
            for layer in &head.layers {
                x = layer
                    .op
                    .forward(x)
                    .map_err(|e| Error::Validation(format!("layer '{}': {}", layer.name, e)))?;
            }
            outputs.insert(head.name.clone(), x.into_r2()?);
        }
        Ok(outputs)
    }

    /// Locate the first convolutional layer over the 4-symbol DNA alphabet,
    /// optionally with its following activation layer.
    pub fn first_conv_layer(&self, get_act: bool) -> Result<(&NamedLayer<B>, Option<&NamedLayer<B>>)> {
        for branch in &self.branches {
            let mut conv_idx = None;
            for (i, layer) in branch.layers.iter().enumerate() {
                match &layer.spec {
                    crate::model::layers::LayerSpec::Conv1d { channels_in: 4, .. } => {
                        conv_idx = Some(i);
                        break;
                    }
                    _ => continue,
                }
            }
            if let Some(i) = conv_idx {
                let conv = &branch.layers[i];
                if !get_act {
                    return Ok((conv, None));
                }
                for layer in &branch.layers[i + 1..] {
                    if matches!(layer.spec, crate::model::layers::LayerSpec::Activation { .. }) {
                        return Ok((conv, Some(layer)));
                    }
                }
                return Err(Error::Validation("activation layer not found".to_string()));
            }
        }
        Err(Error::Validation("convolutional layer not found".to_string()))
    }

    /// Kernel decay penalty the external optimizer adds to its objective.
    pub fn regularization_loss(&self, device: &B::Device) -> Result<Tensor<B, 1>> {
        let mut total = Tensor::<B, 1>::zeros([1], device);
        for layer in self.layers() {
            let Some((l1, l2)) = layer.spec.decay() else {
                continue;
            };
            if l1 == 0.0 && l2 == 0.0 {
                continue;
            }
            let kernel = match &layer.op {
                LayerOp::Dense(linear) => Some(linear.weight.val().flatten::<1>(0, 1)),
                LayerOp::Conv1d(conv) => Some(conv.weight.val().flatten::<1>(0, 2)),
                LayerOp::Conv2d(conv) => Some(conv.weight.val().flatten::<1>(0, 3)),
                _ => None,
            };
            if let Some(kernel) = kernel {
                if l1 != 0.0 {
                    total = total + kernel.clone().abs().sum().mul_scalar(l1);
                }
                if l2 != 0.0 {
                    total = total + kernel.clone().powf_scalar(2.0).sum().mul_scalar(l2);
                }
            }
        }
        Ok(total)
    }

    /// Predict over a batch iterator, stopping at `nb_sample` if given.
    ///
    /// Returns per-channel predictions alongside the stacked ground-truth
    /// batch (outputs and sample weights) for downstream evaluation.
    pub fn predict_batches<I>(
        &self,
        batches: I,
        nb_sample: Option<usize>,
        device: &B::Device,
    ) -> Result<(BTreeMap<String, ArrayD<f32>>, Batch)>
    where
        I: IntoIterator<Item = Result<Batch>>,
    {
        let mut seen = 0usize;
        let mut collected: Vec<Batch> = Vec::new();
        let mut predictions: Vec<BTreeMap<String, ArrayD<f32>>> = Vec::new();

        for batch in batches {
            let mut batch = batch?;
            if let Some(cap) = nb_sample {
                batch.truncate(cap - seen);
            }
            let inputs = batch_features::<B>(&batch, device)?;
            let outputs = self.forward(&inputs)?;
            let mut preds = BTreeMap::new();
            for (name, tensor) in outputs {
                preds.insert(name, tensor_to_array(tensor)?);
            }
            seen += batch.len();
            predictions.push(preds);
            collected.push(batch);
            if nb_sample.is_some_and(|cap| seen >= cap) {
                break;
            }
        }
        debug!(samples = seen, "prediction pass finished");

        if collected.is_empty() {
            return Err(Error::Validation("no batches to predict on".to_string()));
        }

        let mut stacked_preds: BTreeMap<String, ArrayD<f32>> = BTreeMap::new();
        for name in predictions[0].keys() {
            let views: Vec<_> = predictions.iter().map(|p| p[name].view()).collect();
            let merged = ndarray::concatenate(ndarray::Axis(0), &views)
                .map_err(|e| Error::Validation(format!("stacking predictions '{}': {}", name, e)))?;
            stacked_preds.insert(name.clone(), merged);
        }
        Ok((stacked_preds, stack_batches(&collected)?))
    }
}

/// Convert a batch's input arrays to named feature tensors.
pub fn batch_features<B: Backend>(
    batch: &Batch,
    device: &B::Device,
) -> Result<BTreeMap<String, Feature<B>>> {
    let mut features = BTreeMap::new();
    for (name, array) in &batch.inputs {
        features.insert(name.clone(), array_to_feature(array, device)?);
    }
    Ok(features)
}

fn array_to_feature<B: Backend>(array: &ArrayD<f32>, device: &B::Device) -> Result<Feature<B>> {
    let shape = array.shape().to_vec();
    let values: Vec<f32> = array.iter().copied().collect();
    let data = TensorData::new(values, shape.clone());
    match shape.len() {
        2 => Ok(Feature::R2(Tensor::from_data(data, device))),
        3 => Ok(Feature::R3(Tensor::from_data(data, device))),
        4 => Ok(Feature::R4(Tensor::from_data(data, device))),
        rank => Err(Error::Validation(format!(
            "cannot feed rank-{} input array",
            rank
        ))),
    }
}

fn tensor_to_array<B: Backend>(tensor: Tensor<B, 2>) -> Result<ArrayD<f32>> {
    let shape = tensor.dims().to_vec();
    let data = tensor.into_data();
    let values = data
        .to_vec::<f32>()
        .map_err(|e| Error::Validation(format!("exporting prediction tensor: {:?}", e)))?;
    ArrayD::from_shape_vec(ndarray::IxDyn(&shape), values)
        .map_err(|e| Error::Validation(format!("reshaping prediction tensor: {}", e)))
}
