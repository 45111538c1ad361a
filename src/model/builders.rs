//! Sub-network builders.
//!
//! Pure functions mapping a hyperparameter record to an ordered list of
//! named layer descriptions. The shared stack is: optional input dropout,
//! one convolution with a decay-carrying kernel, activation, max-pooling,
//! flatten, optional dropout, optional fully-connected bottleneck (linear,
//! optional batch-norm, activation, optional dropout). The target-head
//! builder appends the final unit resolved from the output channel name.

use burn::tensor::backend::Backend;
use tracing::debug;

use crate::data::{DNA_ALPHABET_SIZE, OUTPUT_SEP};
use crate::error::Result;
use crate::model::graph::{Branch, BranchInput, Model};
use crate::model::layers::{LayerSpec, NamedLayer};
use crate::model::{
    get_objectives, Activation, BranchParams, LossKind, TargetParams, NB_CAT_VAR, VAR_SCALING,
};

/// Layer list of one builder invocation, with the width of its output.
#[derive(Debug, Clone)]
pub struct BuiltLayers {
    pub layers: Vec<(String, LayerSpec)>,
    pub output_width: usize,
}

/// Target-head layer list with the resolved loss kind.
#[derive(Debug, Clone)]
pub struct BuiltHead {
    pub layers: Vec<(String, LayerSpec)>,
    pub loss: LossKind,
}

fn bottleneck(
    params_hidden: usize,
    inputs: usize,
    batch_norm: bool,
    activation: Activation,
    drop_out: f64,
    l1_decay: f64,
    l2_decay: f64,
    init: crate::model::InitKind,
    layers: &mut Vec<(String, LayerSpec)>,
) {
    layers.push((
        "h1".to_string(),
        LayerSpec::Dense {
            inputs,
            units: params_hidden,
            l1_decay,
            l2_decay,
            init,
        },
    ));
    if batch_norm {
        layers.push((
            "h1b".to_string(),
            LayerSpec::BatchNorm {
                features: params_hidden,
            },
        ));
    }
    layers.push(("h1a".to_string(), LayerSpec::Activation { activation }));
    if drop_out > 0.0 {
        layers.push(("h1d".to_string(), LayerSpec::Dropout { rate: drop_out }));
    }
}

/// Build the DNA branch for windows of `seq_len` one-hot positions.
pub fn dna_layers(params: &BranchParams, seq_len: usize) -> BuiltLayers {
    let mut layers = Vec::new();
    if params.drop_in > 0.0 {
        layers.push(("xd".to_string(), LayerSpec::Dropout { rate: params.drop_in }));
    }
    layers.push((
        "c1".to_string(),
        LayerSpec::Conv1d {
            channels_in: DNA_ALPHABET_SIZE,
            filters: params.nb_filter,
            filter_len: params.filter_len,
            l1_decay: params.l1_decay,
            l2_decay: params.l2_decay,
            init: params.init,
        },
    ));
    layers.push((
        "c1a".to_string(),
        LayerSpec::Activation {
            activation: params.activation,
        },
    ));
    layers.push((
        "p1".to_string(),
        LayerSpec::MaxPool1d {
            pool_len: params.pool_len,
        },
    ));
    layers.push(("f1".to_string(), LayerSpec::Flatten));
    if params.drop_out > 0.0 {
        layers.push(("f1d".to_string(), LayerSpec::Dropout { rate: params.drop_out }));
    }

    let flat = params.nb_filter * (seq_len / params.pool_len);
    let mut output_width = flat;
    if params.nb_hidden > 0 {
        bottleneck(
            params.nb_hidden,
            flat,
            params.batch_norm,
            params.activation,
            params.drop_out,
            params.l1_decay,
            params.l2_decay,
            params.init,
            &mut layers,
        );
        output_width = params.nb_hidden;
    }
    BuiltLayers {
        layers,
        output_width,
    }
}

/// Build the CpG branch over a `replicates x cpg_len` neighbor grid with
/// state and distance channels.
pub fn cpg_layers(params: &BranchParams, replicates: usize, cpg_len: usize) -> BuiltLayers {
    let mut layers = Vec::new();
    if params.drop_in > 0.0 {
        layers.push(("xd".to_string(), LayerSpec::Dropout { rate: params.drop_in }));
    }
    layers.push((
        "c1".to_string(),
        LayerSpec::Conv2d {
            channels_in: 2,
            filters: params.nb_filter,
            kernel: [1, params.filter_len],
            l1_decay: params.l1_decay,
            l2_decay: params.l2_decay,
            init: params.init,
        },
    ));
    layers.push((
        "c1a".to_string(),
        LayerSpec::Activation {
            activation: params.activation,
        },
    ));
    layers.push((
        "p1".to_string(),
        LayerSpec::MaxPool2d {
            pool: [1, params.pool_len],
        },
    ));
    layers.push(("f1".to_string(), LayerSpec::Flatten));
    if params.drop_out > 0.0 {
        layers.push(("f1d".to_string(), LayerSpec::Dropout { rate: params.drop_out }));
    }

    let flat = params.nb_filter * replicates * (cpg_len / params.pool_len);
    let mut output_width = flat;
    if params.nb_hidden > 0 {
        bottleneck(
            params.nb_hidden,
            flat,
            params.batch_norm,
            params.activation,
            params.drop_out,
            params.l1_decay,
            params.l2_decay,
            params.init,
            &mut layers,
        );
        output_width = params.nb_hidden;
    }
    BuiltLayers {
        layers,
        output_width,
    }
}

/// Build the head for one output channel on top of a `feature_width` stem.
///
/// The channel name's suffix selects the final unit: `entropy` a rectified
/// single unit, `var` a single unit bounded by a scaled sigmoid, `cat_var`
/// a 3-way softmax, everything else (including `mean` and `bulk/...`) a
/// sigmoid unit. The loss kind follows [`get_objectives`].
pub fn target_layers(params: &TargetParams, feature_width: usize, output_name: &str) -> BuiltHead {
    let mut layers = Vec::new();
    let mut stem_width = feature_width;
    if params.nb_hidden > 0 {
        bottleneck(
            params.nb_hidden,
            feature_width,
            params.batch_norm,
            params.activation,
            params.drop_out,
            params.l1_decay,
            params.l2_decay,
            params.init,
            &mut layers,
        );
        stem_width = params.nb_hidden;
    }

    let suffix = output_name
        .rsplit(OUTPUT_SEP)
        .next()
        .unwrap_or(output_name);
    let dense = |units: usize| LayerSpec::Dense {
        inputs: stem_width,
        units,
        l1_decay: params.l1_decay,
        l2_decay: params.l2_decay,
        init: params.init,
    };
    match suffix {
        "entropy" => {
            layers.push(("o".to_string(), dense(1)));
            layers.push((
                "oa".to_string(),
                LayerSpec::Activation {
                    activation: Activation::Relu,
                },
            ));
        }
        "var" => {
            layers.push(("o".to_string(), dense(1)));
            layers.push(("os".to_string(), LayerSpec::ScaledSigmoid { scaling: VAR_SCALING }));
        }
        "cat_var" => {
            layers.push(("o".to_string(), dense(NB_CAT_VAR)));
            layers.push((
                "oa".to_string(),
                LayerSpec::Activation {
                    activation: Activation::Softmax,
                },
            ));
        }
        _ => {
            layers.push(("o".to_string(), dense(1)));
            layers.push((
                "oa".to_string(),
                LayerSpec::Activation {
                    activation: Activation::Sigmoid,
                },
            ));
        }
    }

    let loss = get_objectives(&[output_name.to_string()])[output_name];
    BuiltHead { layers, loss }
}

fn scoped<B: Backend>(
    scope: &str,
    layers: Vec<(String, LayerSpec)>,
    device: &B::Device,
) -> Vec<NamedLayer<B>> {
    layers
        .into_iter()
        .map(|(local, spec)| NamedLayer::new(format!("{}/{}", scope, local), spec, device))
        .collect()
}

/// Build a DNA-branch sub-model with layers scoped under `dna/`.
pub fn build_dna_model<B: Backend>(
    params: &BranchParams,
    seq_len: usize,
    device: &B::Device,
) -> Result<Model<B>> {
    let built = dna_layers(params, seq_len);
    debug!(seq_len, output_width = built.output_width, "built dna branch");
    let branch = Branch {
        input: BranchInput::Dna { wlen: seq_len },
        layers: scoped("dna", built.layers, device),
    };
    Model::new("dna", Some("dna".to_string()), vec![branch], Vec::new(), built.output_width)
}

/// Build a CpG-branch sub-model with layers scoped under `cpg/`.
pub fn build_cpg_model<B: Backend>(
    params: &BranchParams,
    replicates: usize,
    cpg_len: usize,
    device: &B::Device,
) -> Result<Model<B>> {
    let built = cpg_layers(params, replicates, cpg_len);
    debug!(
        replicates,
        cpg_len,
        output_width = built.output_width,
        "built cpg branch"
    );
    let branch = Branch {
        input: BranchInput::Cpg {
            replicates,
            wlen: cpg_len,
            encoded_names: None,
        },
        layers: scoped("cpg", built.layers, device),
    };
    Model::new("cpg", Some("cpg".to_string()), vec![branch], Vec::new(), built.output_width)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InitKind;

    fn params() -> BranchParams {
        BranchParams::new()
            .with_nb_filter(8)
            .with_filter_len(3)
            .with_pool_len(2)
            .with_nb_hidden(16)
            .with_drop_in(0.1)
            .with_drop_out(0.25)
            .with_batch_norm(true)
    }

    #[test]
    fn test_dna_layer_names_full_stack() {
        let built = dna_layers(&params(), 11);
        let names: Vec<&str> = built.layers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["xd", "c1", "c1a", "p1", "f1", "f1d", "h1", "h1b", "h1a", "h1d"]
        );
        assert_eq!(built.output_width, 16);
    }

    #[test]
    fn test_dna_layer_names_minimal() {
        let minimal = BranchParams::new()
            .with_nb_filter(8)
            .with_filter_len(3)
            .with_pool_len(2)
            .with_nb_hidden(0)
            .with_drop_in(0.0)
            .with_drop_out(0.0);
        let built = dna_layers(&minimal, 10);
        let names: Vec<&str> = built.layers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["c1", "c1a", "p1", "f1"]);
        // 8 filters, 10 positions pooled by 2
        assert_eq!(built.output_width, 8 * 5);
    }

    #[test]
    fn test_cpg_layers_grid_geometry() {
        let built = cpg_layers(&params(), 3, 10);
        let (_, conv) = &built.layers[1];
        assert_eq!(
            *conv,
            LayerSpec::Conv2d {
                channels_in: 2,
                filters: 8,
                kernel: [1, 3],
                l1_decay: 0.0,
                l2_decay: 0.0,
                init: InitKind::GlorotUniform,
            }
        );
        assert_eq!(built.output_width, 16);

        let no_hidden = BranchParams::new()
            .with_nb_filter(4)
            .with_pool_len(2)
            .with_nb_hidden(0)
            .with_drop_out(0.0);
        let built = cpg_layers(&no_hidden, 3, 10);
        assert_eq!(built.output_width, 4 * 3 * 5);
    }

    #[test]
    fn test_target_layers_table() {
        let params = TargetParams::new();

        let head = target_layers(&params, 32, "stats/entropy");
        assert_eq!(head.loss, LossKind::MeanSquaredError);
        assert!(matches!(
            head.layers.last(),
            Some((_, LayerSpec::Activation { activation: Activation::Relu }))
        ));

        let head = target_layers(&params, 32, "stats/var");
        assert_eq!(head.loss, LossKind::MeanSquaredError);
        assert!(matches!(
            head.layers.last(),
            Some((_, LayerSpec::ScaledSigmoid { scaling })) if *scaling == VAR_SCALING
        ));

        let head = target_layers(&params, 32, "stats/cat_var");
        assert_eq!(head.loss, LossKind::CategoricalCrossentropy);
        assert!(matches!(
            head.layers.iter().rev().nth(1),
            Some((_, LayerSpec::Dense { units: 3, .. }))
        ));

        let head = target_layers(&params, 32, "stats/mean");
        assert_eq!(head.loss, LossKind::MeanSquaredError);
        assert!(matches!(
            head.layers.last(),
            Some((_, LayerSpec::Activation { activation: Activation::Sigmoid }))
        ));

        let head = target_layers(&params, 32, "cpg/mESC");
        assert_eq!(head.loss, LossKind::BinaryCrossentropy);
        assert!(matches!(
            head.layers.last(),
            Some((_, LayerSpec::Activation { activation: Activation::Sigmoid }))
        ));
    }

    #[test]
    fn test_target_layers_with_bottleneck() {
        let params = TargetParams::new().with_nb_hidden(64).with_drop_out(0.1);
        let head = target_layers(&params, 32, "cpg/a");
        let names: Vec<&str> = head.layers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["h1", "h1a", "h1d", "o", "oa"]);
    }
}
