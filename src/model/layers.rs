//! Named computation layers.
//!
//! A model is an ordered list of `(name, operation)` pairs; names are
//! hierarchical (`scope/local`) and double as the key for weight matching
//! across differently-scoped models. Layer configurations are plain data
//! (`LayerSpec`) so architectures serialize independently of weights.

use burn::module::{Param, ParamId, RunningState};
use burn::nn::conv::{Conv1d, Conv1dConfig, Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool1d, MaxPool1dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{
    BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig1d,
    PaddingConfig2d,
};
use burn::tensor::activation::{relu, sigmoid, softmax, tanh};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Activation, InitKind};

/// A tensor of runtime-determined rank flowing through a layer list.
#[derive(Debug, Clone)]
pub enum Feature<B: Backend> {
    R2(Tensor<B, 2>),
    R3(Tensor<B, 3>),
    R4(Tensor<B, 4>),
}

impl<B: Backend> Feature<B> {
    pub fn rank(&self) -> usize {
        match self {
            Feature::R2(_) => 2,
            Feature::R3(_) => 3,
            Feature::R4(_) => 4,
        }
    }

    pub fn into_r2(self) -> Result<Tensor<B, 2>> {
        match self {
            Feature::R2(t) => Ok(t),
            other => Err(Error::Validation(format!(
                "expected rank-2 features, got rank {}",
                other.rank()
            ))),
        }
    }
}

/// Serializable description of a single layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerSpec {
    Dropout {
        rate: f64,
    },
    Conv1d {
        channels_in: usize,
        filters: usize,
        filter_len: usize,
        l1_decay: f64,
        l2_decay: f64,
        init: InitKind,
    },
    Conv2d {
        channels_in: usize,
        filters: usize,
        kernel: [usize; 2],
        l1_decay: f64,
        l2_decay: f64,
        init: InitKind,
    },
    MaxPool1d {
        pool_len: usize,
    },
    MaxPool2d {
        pool: [usize; 2],
    },
    Flatten,
    Dense {
        inputs: usize,
        units: usize,
        l1_decay: f64,
        l2_decay: f64,
        init: InitKind,
    },
    BatchNorm {
        features: usize,
    },
    Activation {
        activation: Activation,
    },
    ScaledSigmoid {
        scaling: f64,
    },
}

impl LayerSpec {
    /// Number of trainable parameters this layer holds.
    pub fn num_params(&self) -> usize {
        match *self {
            LayerSpec::Conv1d {
                channels_in,
                filters,
                filter_len,
                ..
            } => filters * channels_in * filter_len + filters,
            LayerSpec::Conv2d {
                channels_in,
                filters,
                kernel,
                ..
            } => filters * channels_in * kernel[0] * kernel[1] + filters,
            LayerSpec::Dense { inputs, units, .. } => inputs * units + units,
            LayerSpec::BatchNorm { features } => 2 * features,
            _ => 0,
        }
    }

    /// Instantiate the runtime operation for this description.
    pub fn init<B: Backend>(&self, device: &B::Device) -> LayerOp<B> {
        match *self {
            LayerSpec::Dropout { rate } => LayerOp::Dropout(DropoutConfig::new(rate).init()),
            LayerSpec::Conv1d {
                channels_in,
                filters,
                filter_len,
                init,
                ..
            } => LayerOp::Conv1d(
                Conv1dConfig::new(channels_in, filters, filter_len)
                    .with_padding(PaddingConfig1d::Same)
                    .with_initializer(init.initializer())
                    .init(device),
            ),
            LayerSpec::Conv2d {
                channels_in,
                filters,
                kernel,
                init,
                ..
            } => LayerOp::Conv2d(
                Conv2dConfig::new([channels_in, filters], kernel)
                    .with_padding(PaddingConfig2d::Same)
                    .with_initializer(init.initializer())
                    .init(device),
            ),
            LayerSpec::MaxPool1d { pool_len } => LayerOp::MaxPool1d(
                MaxPool1dConfig::new(pool_len).with_stride(pool_len).init(),
            ),
            LayerSpec::MaxPool2d { pool } => {
                LayerOp::MaxPool2d(MaxPool2dConfig::new(pool).with_strides(pool).init())
            }
            LayerSpec::Flatten => LayerOp::Flatten,
            LayerSpec::Dense {
                inputs,
                units,
                init,
                ..
            } => LayerOp::Dense(
                LinearConfig::new(inputs, units)
                    .with_bias(true)
                    .with_initializer(init.initializer())
                    .init(device),
            ),
            LayerSpec::BatchNorm { features } => {
                let norm: BatchNorm<B, 0> = BatchNormConfig::new(features).init(device);
                LayerOp::BatchNorm(norm)
            }
            LayerSpec::Activation { activation } => LayerOp::Activation(activation),
            LayerSpec::ScaledSigmoid { scaling } => LayerOp::ScaledSigmoid(scaling),
        }
    }

    /// L1/L2 decay coefficients of the kernel, if this layer carries one.
    pub fn decay(&self) -> Option<(f64, f64)> {
        match *self {
            LayerSpec::Conv1d {
                l1_decay, l2_decay, ..
            }
            | LayerSpec::Conv2d {
                l1_decay, l2_decay, ..
            }
            | LayerSpec::Dense {
                l1_decay, l2_decay, ..
            } => Some((l1_decay, l2_decay)),
            _ => None,
        }
    }
}

/// Runtime operation of a layer.
#[derive(Debug)]
pub enum LayerOp<B: Backend> {
    Dropout(Dropout),
    Conv1d(Conv1d<B>),
    Conv2d(Conv2d<B>),
    MaxPool1d(MaxPool1d),
    MaxPool2d(MaxPool2d),
    Flatten,
    Dense(Linear<B>),
    BatchNorm(BatchNorm<B, 0>),
    Activation(Activation),
    ScaledSigmoid(f64),
}

fn apply_activation<B: Backend, const D: usize>(
    activation: Activation,
    x: Tensor<B, D>,
) -> Tensor<B, D> {
    match activation {
        Activation::Relu => relu(x),
        Activation::Sigmoid => sigmoid(x),
        Activation::Tanh => tanh(x),
        Activation::Linear => x,
        Activation::Softmax => softmax(x, D - 1),
    }
}

impl<B: Backend> LayerOp<B> {
    /// Apply this operation to a feature tensor.
    ///
    /// Rank-3 features use the `[batch, position, channel]` layout; the
    /// convolution and pooling operations transpose to the backend's
    /// channel-first layout internally. Rank-4 features are the
    /// channel-first `[batch, channel, replicate, position]` CpG grid.
    pub fn forward(&self, x: Feature<B>) -> Result<Feature<B>> {
        match (self, x) {
            (LayerOp::Dropout(drop), Feature::R2(t)) => Ok(Feature::R2(drop.forward(t))),
            (LayerOp::Dropout(drop), Feature::R3(t)) => Ok(Feature::R3(drop.forward(t))),
            (LayerOp::Dropout(drop), Feature::R4(t)) => Ok(Feature::R4(drop.forward(t))),
            (LayerOp::Conv1d(conv), Feature::R3(t)) => {
                let t = conv.forward(t.swap_dims(1, 2)).swap_dims(1, 2);
                Ok(Feature::R3(t))
            }
            (LayerOp::Conv2d(conv), Feature::R4(t)) => Ok(Feature::R4(conv.forward(t))),
            (LayerOp::MaxPool1d(pool), Feature::R3(t)) => {
                let t = pool.forward(t.swap_dims(1, 2)).swap_dims(1, 2);
                Ok(Feature::R3(t))
            }
            (LayerOp::MaxPool2d(pool), Feature::R4(t)) => Ok(Feature::R4(pool.forward(t))),
            (LayerOp::Flatten, Feature::R2(t)) => Ok(Feature::R2(t)),
            (LayerOp::Flatten, Feature::R3(t)) => Ok(Feature::R2(t.flatten(1, 2))),
            (LayerOp::Flatten, Feature::R4(t)) => Ok(Feature::R2(t.flatten(1, 3))),
            (LayerOp::Dense(linear), Feature::R2(t)) => Ok(Feature::R2(linear.forward(t))),
            (LayerOp::BatchNorm(norm), Feature::R2(t)) => Ok(Feature::R2(norm.forward(t))),
            (LayerOp::Activation(act), Feature::R2(t)) => {
                Ok(Feature::R2(apply_activation(*act, t)))
            }
            (LayerOp::Activation(act), Feature::R3(t)) => {
                Ok(Feature::R3(apply_activation(*act, t)))
            }
            (LayerOp::Activation(act), Feature::R4(t)) => {
                Ok(Feature::R4(apply_activation(*act, t)))
            }
            (LayerOp::ScaledSigmoid(scaling), Feature::R2(t)) => {
                Ok(Feature::R2(sigmoid(t).mul_scalar(*scaling)))
            }
            (op, x) => Err(Error::Validation(format!(
                "{} cannot consume rank-{} features",
                op.kind_name(),
                x.rank()
            ))),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            LayerOp::Dropout(_) => "dropout",
            LayerOp::Conv1d(_) => "conv1d",
            LayerOp::Conv2d(_) => "conv2d",
            LayerOp::MaxPool1d(_) => "max_pool1d",
            LayerOp::MaxPool2d(_) => "max_pool2d",
            LayerOp::Flatten => "flatten",
            LayerOp::Dense(_) => "dense",
            LayerOp::BatchNorm(_) => "batch_norm",
            LayerOp::Activation(_) => "activation",
            LayerOp::ScaledSigmoid(_) => "scaled_sigmoid",
        }
    }

    /// Export this layer's weight tensors, kernel first.
    pub fn weights(&self) -> Result<Vec<TensorBlob>> {
        match self {
            LayerOp::Conv1d(conv) => {
                let mut blobs = vec![tensor_to_blob(&conv.weight.val())?];
                if let Some(bias) = &conv.bias {
                    blobs.push(tensor_to_blob(&bias.val())?);
                }
                Ok(blobs)
            }
            LayerOp::Conv2d(conv) => {
                let mut blobs = vec![tensor_to_blob(&conv.weight.val())?];
                if let Some(bias) = &conv.bias {
                    blobs.push(tensor_to_blob(&bias.val())?);
                }
                Ok(blobs)
            }
            LayerOp::Dense(linear) => {
                let mut blobs = vec![tensor_to_blob(&linear.weight.val())?];
                if let Some(bias) = &linear.bias {
                    blobs.push(tensor_to_blob(&bias.val())?);
                }
                Ok(blobs)
            }
            LayerOp::BatchNorm(norm) => Ok(vec![
                tensor_to_blob(&norm.gamma.val())?,
                tensor_to_blob(&norm.beta.val())?,
                tensor_to_blob(&norm.running_mean.value())?,
                tensor_to_blob(&norm.running_var.value())?,
            ]),
            _ => Ok(Vec::new()),
        }
    }

    /// Replace this layer's weight tensors with the given blobs.
    pub fn set_weights(&mut self, blobs: &[TensorBlob], device: &B::Device) -> Result<()> {
        match self {
            LayerOp::Conv1d(conv) => {
                expect_blobs(blobs, if conv.bias.is_some() { 2 } else { 1 })?;
                conv.weight = param_from_blob(&blobs[0], &conv.weight.val(), device)?;
                if let Some(bias) = conv.bias.take() {
                    conv.bias = Some(param_from_blob(&blobs[1], &bias.val(), device)?);
                }
                Ok(())
            }
            LayerOp::Conv2d(conv) => {
                expect_blobs(blobs, if conv.bias.is_some() { 2 } else { 1 })?;
                conv.weight = param_from_blob(&blobs[0], &conv.weight.val(), device)?;
                if let Some(bias) = conv.bias.take() {
                    conv.bias = Some(param_from_blob(&blobs[1], &bias.val(), device)?);
                }
                Ok(())
            }
            LayerOp::Dense(linear) => {
                expect_blobs(blobs, if linear.bias.is_some() { 2 } else { 1 })?;
                linear.weight = param_from_blob(&blobs[0], &linear.weight.val(), device)?;
                if let Some(bias) = linear.bias.take() {
                    linear.bias = Some(param_from_blob(&blobs[1], &bias.val(), device)?);
                }
                Ok(())
            }
            LayerOp::BatchNorm(norm) => {
                expect_blobs(blobs, 4)?;
                norm.gamma = param_from_blob(&blobs[0], &norm.gamma.val(), device)?;
                norm.beta = param_from_blob(&blobs[1], &norm.beta.val(), device)?;
                norm.running_mean = RunningState::new(blob_to_tensor(&blobs[2], device)?);
                norm.running_var = RunningState::new(blob_to_tensor(&blobs[3], device)?);
                Ok(())
            }
            _ => {
                expect_blobs(blobs, 0)?;
                Ok(())
            }
        }
    }
}

/// One named layer: hierarchical name, serializable spec, runtime op.
#[derive(Debug)]
pub struct NamedLayer<B: Backend> {
    pub name: String,
    pub spec: LayerSpec,
    pub op: LayerOp<B>,
}

impl<B: Backend> NamedLayer<B> {
    pub fn new(name: impl Into<String>, spec: LayerSpec, device: &B::Device) -> Self {
        let op = spec.init(device);
        Self {
            name: name.into(),
            spec,
            op,
        }
    }
}

/// CPU-side weight tensor: shape plus row-major values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorBlob {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

fn tensor_to_blob<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> Result<TensorBlob> {
    let data = tensor.to_data();
    let shape = data.shape.clone();
    let values = data
        .to_vec::<f32>()
        .map_err(|e| Error::Validation(format!("exporting weight tensor: {:?}", e)))?;
    Ok(TensorBlob { shape, values })
}

fn blob_to_tensor<B: Backend, const D: usize>(
    blob: &TensorBlob,
    device: &B::Device,
) -> Result<Tensor<B, D>> {
    if blob.shape.len() != D {
        return Err(Error::Validation(format!(
            "weight tensor of rank {} where rank {} expected",
            blob.shape.len(),
            D
        )));
    }
    let data = TensorData::new(blob.values.clone(), blob.shape.clone());
    Ok(Tensor::from_data(data, device))
}

fn param_from_blob<B: Backend, const D: usize>(
    blob: &TensorBlob,
    current: &Tensor<B, D>,
    device: &B::Device,
) -> Result<Param<Tensor<B, D>>> {
    if blob.shape != current.dims().to_vec() {
        return Err(Error::Validation(format!(
            "weight shape mismatch: source {:?}, destination {:?}",
            blob.shape,
            current.dims()
        )));
    }
    Ok(Param::initialized(ParamId::new(), blob_to_tensor(blob, device)?))
}

fn expect_blobs(blobs: &[TensorBlob], expected: usize) -> Result<()> {
    if blobs.len() != expected {
        return Err(Error::Validation(format!(
            "{} weight tensors supplied where {} expected",
            blobs.len(),
            expected
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DefaultBackend;
    use burn::tensor::backend::Backend;

    type B = DefaultBackend;

    fn device() -> <B as Backend>::Device {
        Default::default()
    }

    fn dense_spec(inputs: usize, units: usize) -> LayerSpec {
        LayerSpec::Dense {
            inputs,
            units,
            l1_decay: 0.0,
            l2_decay: 0.0,
            init: InitKind::GlorotUniform,
        }
    }

    #[test]
    fn test_conv1d_same_padding_keeps_length() {
        let spec = LayerSpec::Conv1d {
            channels_in: 4,
            filters: 8,
            filter_len: 5,
            l1_decay: 0.0,
            l2_decay: 0.0,
            init: InitKind::GlorotUniform,
        };
        let op = spec.init::<B>(&device());
        let x = Feature::R3(Tensor::<B, 3>::zeros([2, 11, 4], &device()));
        match op.forward(x).unwrap() {
            Feature::R3(t) => assert_eq!(t.dims(), [2, 11, 8]),
            _ => panic!("expected rank-3 output"),
        }
    }

    #[test]
    fn test_pool_flatten_dense_chain() {
        let pool = LayerSpec::MaxPool1d { pool_len: 2 }.init::<B>(&device());
        let flatten = LayerSpec::Flatten.init::<B>(&device());
        let dense = dense_spec(5 * 8, 3).init::<B>(&device());

        let x = Feature::R3(Tensor::<B, 3>::zeros([2, 11, 8], &device()));
        let x = pool.forward(x).unwrap();
        match &x {
            Feature::R3(t) => assert_eq!(t.dims(), [2, 5, 8]),
            _ => panic!("expected rank-3 output"),
        }
        let x = flatten.forward(x).unwrap();
        let x = dense.forward(x).unwrap().into_r2().unwrap();
        assert_eq!(x.dims(), [2, 3]);
    }

    #[test]
    fn test_conv2d_grid() {
        let spec = LayerSpec::Conv2d {
            channels_in: 2,
            filters: 4,
            kernel: [1, 3],
            l1_decay: 0.0,
            l2_decay: 0.0,
            init: InitKind::GlorotUniform,
        };
        let op = spec.init::<B>(&device());
        let x = Feature::R4(Tensor::<B, 4>::zeros([1, 2, 3, 10], &device()));
        match op.forward(x).unwrap() {
            Feature::R4(t) => assert_eq!(t.dims(), [1, 4, 3, 10]),
            _ => panic!("expected rank-4 output"),
        }
    }

    #[test]
    fn test_scaled_sigmoid_upper_bound() {
        let op = LayerSpec::ScaledSigmoid { scaling: 0.251 }.init::<B>(&device());
        let x = Feature::R2(Tensor::<B, 2>::from_floats([[100.0], [-100.0]], &device()));
        let y = op.forward(x).unwrap().into_r2().unwrap();
        let values = y.into_data().to_vec::<f32>().unwrap();
        assert!((values[0] - 0.251).abs() < 1e-4);
        assert!(values[1] < 1e-4);
    }

    #[test]
    fn test_rank_mismatch_is_validation_error() {
        let op = dense_spec(4, 2).init::<B>(&device());
        let x = Feature::R3(Tensor::<B, 3>::zeros([1, 2, 4], &device()));
        let err = op.forward(x).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_weight_blob_round_trip() {
        let mut a = dense_spec(3, 2).init::<B>(&device());
        let b = dense_spec(3, 2).init::<B>(&device());

        a.set_weights(&b.weights().unwrap(), &device()).unwrap();
        let x = Tensor::<B, 2>::from_floats([[1.0, 2.0, 3.0]], &device());
        let ya = a.forward(Feature::R2(x.clone())).unwrap().into_r2().unwrap();
        let yb = b.forward(Feature::R2(x)).unwrap().into_r2().unwrap();
        let va = ya.into_data().to_vec::<f32>().unwrap();
        let vb = yb.into_data().to_vec::<f32>().unwrap();
        for (a, b) in va.iter().zip(&vb) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_set_weights_shape_mismatch() {
        let mut a = dense_spec(3, 2).init::<B>(&device());
        let b = dense_spec(4, 2).init::<B>(&device());
        let err = a.set_weights(&b.weights().unwrap(), &device()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_num_params() {
        assert_eq!(dense_spec(10, 5).num_params(), 55);
        let conv = LayerSpec::Conv1d {
            channels_in: 4,
            filters: 2,
            filter_len: 3,
            l1_decay: 0.0,
            l2_decay: 0.0,
            init: InitKind::GlorotUniform,
        };
        assert_eq!(conv.num_params(), 2 * 4 * 3 + 2);
        assert_eq!(LayerSpec::Flatten.num_params(), 0);
    }

    #[test]
    fn test_layer_spec_serde_round_trip() {
        let spec = LayerSpec::ScaledSigmoid { scaling: 0.251 };
        let json = serde_json::to_string(&spec).unwrap();
        let back: LayerSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, back);
    }
}
