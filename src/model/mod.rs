pub mod builders;
pub mod graph;
pub mod joint;
pub mod layers;
pub mod loss;
pub mod persist;

use std::collections::BTreeMap;
use std::str::FromStr;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::OUTPUT_SEP;
use crate::error::{Error, Result};

/// Upper bound of the scaled-sigmoid activation on variance heads.
pub const VAR_SCALING: f64 = 0.251;

/// Number of classes of the categorical-variance output channel.
pub const NB_CAT_VAR: usize = 3;

/// Nonlinearity applied by activation layers and convolution stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Sigmoid,
    Tanh,
    Linear,
    Softmax,
}

impl FromStr for Activation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "relu" => Ok(Activation::Relu),
            "sigmoid" => Ok(Activation::Sigmoid),
            "tanh" => Ok(Activation::Tanh),
            "linear" => Ok(Activation::Linear),
            "softmax" => Ok(Activation::Softmax),
            other => Err(Error::NotFound(format!(
                "unknown activation '{}'; known: relu, sigmoid, tanh, linear, softmax",
                other
            ))),
        }
    }
}

/// Kernel initializer selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitKind {
    GlorotUniform,
    HeUniform,
}

impl InitKind {
    pub(crate) fn initializer(self) -> burn::nn::Initializer {
        match self {
            InitKind::GlorotUniform => burn::nn::Initializer::XavierUniform { gain: 1.0 },
            InitKind::HeUniform => burn::nn::Initializer::KaimingUniform {
                gain: 1.0,
                fan_out_only: false,
            },
        }
    }
}

/// Loss attached to an output head, resolved from the channel name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    BinaryCrossentropy,
    CategoricalCrossentropy,
    MeanSquaredError,
}

/// Resolve the training objective for each output channel name.
///
/// `bulk/...` channels and `mean`/`var`/`entropy` suffixes train with
/// squared error, `cat_var` with categorical cross-entropy, everything else
/// with binary cross-entropy.
pub fn get_objectives(output_names: &[String]) -> BTreeMap<String, LossKind> {
    let mut objectives = BTreeMap::new();
    for name in output_names {
        let parts: Vec<&str> = name.split(OUTPUT_SEP).collect();
        let kind = if parts[0] == "bulk" {
            LossKind::MeanSquaredError
        } else if matches!(parts[parts.len() - 1], "mean" | "var" | "entropy") {
            LossKind::MeanSquaredError
        } else if parts[parts.len() - 1] == "cat_var" {
            LossKind::CategoricalCrossentropy
        } else {
            LossKind::BinaryCrossentropy
        };
        objectives.insert(name.clone(), kind);
    }
    objectives
}

/// Hyperparameters of one convolutional branch (DNA or CpG).
#[derive(Config, Debug)]
pub struct BranchParams {
    /// Number of convolution filters
    #[config(default = "128")]
    pub nb_filter: usize,

    /// Length of the convolution filters
    #[config(default = "11")]
    pub filter_len: usize,

    /// Pooling length after the convolution
    #[config(default = "4")]
    pub pool_len: usize,

    /// Width of the fully-connected bottleneck; 0 disables it
    #[config(default = "128")]
    pub nb_hidden: usize,

    /// Dropout rate on the input; 0 disables it
    #[config(default = "0.0")]
    pub drop_in: f64,

    /// Dropout rate after flatten and after the bottleneck; 0 disables it
    #[config(default = "0.2")]
    pub drop_out: f64,

    /// Batch-normalize the bottleneck pre-activation
    #[config(default = "false")]
    pub batch_norm: bool,

    /// Nonlinearity of the convolution and bottleneck
    #[config(default = "Activation::Relu")]
    pub activation: Activation,

    /// L1 kernel decay coefficient
    #[config(default = "0.0")]
    pub l1_decay: f64,

    /// L2 kernel decay coefficient
    #[config(default = "0.0")]
    pub l2_decay: f64,

    /// Kernel initializer
    #[config(default = "InitKind::GlorotUniform")]
    pub init: InitKind,
}

/// Hyperparameters of the per-channel output heads.
#[derive(Config, Debug)]
pub struct TargetParams {
    /// Width of the head bottleneck; 0 disables it
    #[config(default = "0")]
    pub nb_hidden: usize,

    /// Dropout rate inside the bottleneck; 0 disables it
    #[config(default = "0.0")]
    pub drop_out: f64,

    /// Batch-normalize the bottleneck pre-activation
    #[config(default = "false")]
    pub batch_norm: bool,

    /// Nonlinearity of the bottleneck
    #[config(default = "Activation::Relu")]
    pub activation: Activation,

    /// L1 kernel decay coefficient
    #[config(default = "0.0")]
    pub l1_decay: f64,

    /// L2 kernel decay coefficient
    #[config(default = "0.0")]
    pub l2_decay: f64,

    /// Kernel initializer
    #[config(default = "InitKind::GlorotUniform")]
    pub init: InitKind,
}

/// Hyperparameters of the stacked fully-connected joint blocks.
#[derive(Config, Debug)]
pub struct JointParams {
    /// Width of each joint block
    #[config(default = "512")]
    pub nb_hidden: usize,

    /// Dropout rate after each block; 0 disables it
    #[config(default = "0.0")]
    pub drop_out: f64,

    /// L1 kernel decay coefficient
    #[config(default = "0.0")]
    pub l1_decay: f64,

    /// L2 kernel decay coefficient
    #[config(default = "0.0")]
    pub l2_decay: f64,

    /// Kernel initializer
    #[config(default = "InitKind::GlorotUniform")]
    pub init: InitKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_from_str() {
        assert_eq!("relu".parse::<Activation>().unwrap(), Activation::Relu);
        assert_eq!("softmax".parse::<Activation>().unwrap(), Activation::Softmax);
        let err = "gelu".parse::<Activation>().unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(err.to_string().contains("gelu"));
    }

    #[test]
    fn test_get_objectives() {
        let names: Vec<String> = [
            "cpg/mESC",
            "stats/mean",
            "stats/var",
            "stats/cat_var",
            "stats/entropy",
            "bulk/whole",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let objectives = get_objectives(&names);

        assert_eq!(objectives["cpg/mESC"], LossKind::BinaryCrossentropy);
        assert_eq!(objectives["stats/mean"], LossKind::MeanSquaredError);
        assert_eq!(objectives["stats/var"], LossKind::MeanSquaredError);
        assert_eq!(objectives["stats/cat_var"], LossKind::CategoricalCrossentropy);
        assert_eq!(objectives["stats/entropy"], LossKind::MeanSquaredError);
        assert_eq!(objectives["bulk/whole"], LossKind::MeanSquaredError);
    }

    #[test]
    fn test_branch_params_defaults() {
        let params = BranchParams::new();
        assert_eq!(params.nb_filter, 128);
        assert_eq!(params.pool_len, 4);
        assert_eq!(params.activation, Activation::Relu);
    }
}
