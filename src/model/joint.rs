//! Joint models combining independently built sub-networks.
//!
//! Sub-model stem outputs are concatenated along the feature axis; the
//! L1/L2/L3 variants stack that many fully-connected blocks on top, all
//! renamed under the `joint/` scope. Variants are resolved through an
//! explicit registry rather than reflective name lookup.

use std::collections::BTreeMap;

use burn::tensor::backend::Backend;
use once_cell::sync::Lazy;
use tracing::info;

use crate::error::{Error, Result};
use crate::model::graph::Model;
use crate::model::layers::{LayerSpec, NamedLayer};
use crate::model::{Activation, JointParams};

/// Joint-model variant: the number of stacked fully-connected blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JointKind {
    L0,
    L1,
    L2,
    L3,
}

impl JointKind {
    pub fn nb_layer(self) -> usize {
        match self {
            JointKind::L0 => 0,
            JointKind::L1 => 1,
            JointKind::L2 => 2,
            JointKind::L3 => 3,
        }
    }
}

/// Registry of joint-model variants, populated at first use.
static JOINT_REGISTRY: Lazy<BTreeMap<&'static str, JointKind>> = Lazy::new(|| {
    BTreeMap::from([
        ("joint_l0", JointKind::L0),
        ("joint_l1", JointKind::L1),
        ("joint_l2", JointKind::L2),
        ("joint_l3", JointKind::L3),
    ])
});

/// Look up a joint-model variant by its registry key.
pub fn get_joint(name: &str) -> Result<JointKind> {
    JOINT_REGISTRY.get(name).copied().ok_or_else(|| {
        let known: Vec<&str> = JOINT_REGISTRY.keys().copied().collect();
        Error::NotFound(format!(
            "unknown joint model '{}'; known: {}",
            name,
            known.join(", ")
        ))
    })
}

/// Registered joint-model names.
pub fn list_joint_models() -> Vec<&'static str> {
    JOINT_REGISTRY.keys().copied().collect()
}

/// Combine sub-models into one joint model.
///
/// Every sub-model input is carried over in order, so the joint model is
/// trainable end-to-end. Sub-models must be bare stems: no heads and no
/// trunk of their own.
pub fn join_models<B: Backend>(
    kind: JointKind,
    params: &JointParams,
    models: Vec<Model<B>>,
    device: &B::Device,
) -> Result<Model<B>> {
    if models.len() < 2 {
        return Err(Error::Configuration(format!(
            "joint model needs at least 2 sub-models, got {}",
            models.len()
        )));
    }

    let mut branches = Vec::new();
    let mut width = 0usize;
    for model in models {
        if !model.heads().is_empty() || !model.trunk().is_empty() {
            return Err(Error::Configuration(format!(
                "sub-model '{}' must be a bare stem to be joined",
                model.name
            )));
        }
        width += model.feature_width();
        branches.extend(model.into_branches());
    }

    let mut trunk = Vec::new();
    let mut inputs = width;
    for i in 1..=kind.nb_layer() {
        trunk.push(NamedLayer::new(
            format!("joint/h{}", i),
            LayerSpec::Dense {
                inputs,
                units: params.nb_hidden,
                l1_decay: params.l1_decay,
                l2_decay: params.l2_decay,
                init: params.init,
            },
            device,
        ));
        trunk.push(NamedLayer::new(
            format!("joint/h{}a", i),
            LayerSpec::Activation {
                activation: Activation::Relu,
            },
            device,
        ));
        trunk.push(NamedLayer::new(
            format!("joint/h{}d", i),
            LayerSpec::Dropout {
                rate: params.drop_out,
            },
            device,
        ));
        inputs = params.nb_hidden;
    }
    let feature_width = if kind.nb_layer() == 0 { width } else { params.nb_hidden };

    info!(
        variant = ?kind,
        concat_width = width,
        feature_width,
        "assembled joint model"
    );
    Model::new("joint", Some("joint".to_string()), branches, trunk, feature_width)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::builders::{build_cpg_model, build_dna_model};
    use crate::model::layers::Feature;
    use crate::model::BranchParams;
    use crate::DefaultBackend;
    use burn::tensor::Tensor;

    type B = DefaultBackend;

    fn device() -> <B as Backend>::Device {
        Default::default()
    }

    fn stems() -> (Model<B>, Model<B>) {
        let params = BranchParams::new()
            .with_nb_filter(4)
            .with_filter_len(3)
            .with_pool_len(2)
            .with_nb_hidden(6)
            .with_drop_out(0.0);
        let dna = build_dna_model::<B>(&params, 11, &device()).unwrap();
        let cpg = build_cpg_model::<B>(&params, 2, 10, &device()).unwrap();
        (dna, cpg)
    }

    fn joint_inputs(n: usize) -> BTreeMap<String, Feature<B>> {
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "dna".to_string(),
            Feature::R3(Tensor::<B, 3>::zeros([n, 11, 4], &device())),
        );
        inputs.insert(
            "cpg/state".to_string(),
            Feature::R3(Tensor::<B, 3>::zeros([n, 2, 10], &device())),
        );
        inputs.insert(
            "cpg/dist".to_string(),
            Feature::R3(Tensor::<B, 3>::zeros([n, 2, 10], &device())),
        );
        inputs
    }

    #[test]
    fn test_registry_lookup() {
        assert_eq!(get_joint("joint_l0").unwrap(), JointKind::L0);
        assert_eq!(get_joint("joint_l3").unwrap().nb_layer(), 3);
        let err = get_joint("joint_l9").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(err.to_string().contains("joint_l9"));
        assert!(err.to_string().contains("joint_l0"));
    }

    #[test]
    fn test_joint_l0_width_and_params() {
        let (dna, cpg) = stems();
        let sub_params = dna.num_params() + cpg.num_params();
        let expected_width = dna.feature_width() + cpg.feature_width();

        let joint =
            join_models(JointKind::L0, &JointParams::new(), vec![dna, cpg], &device()).unwrap();
        assert_eq!(joint.feature_width(), expected_width);
        // concatenation adds zero trainable parameters
        assert_eq!(joint.num_params(), sub_params);

        let features = joint.features(&joint_inputs(3)).unwrap();
        assert_eq!(features.dims(), [3, expected_width]);
    }

    #[test]
    fn test_joint_l2_trunk_scoped() {
        let (dna, cpg) = stems();
        let params = JointParams::new().with_nb_hidden(32).with_drop_out(0.1);
        let joint = join_models(JointKind::L2, &params, vec![dna, cpg], &device()).unwrap();

        let trunk_names: Vec<&str> = joint.trunk().iter().map(|l| l.name.as_str()).collect();
        assert_eq!(
            trunk_names,
            vec!["joint/h1", "joint/h1a", "joint/h1d", "joint/h2", "joint/h2a", "joint/h2d"]
        );
        assert_eq!(joint.feature_width(), 32);

        let features = joint.features(&joint_inputs(2)).unwrap();
        assert_eq!(features.dims(), [2, 32]);
    }

    #[test]
    fn test_joint_preserves_all_inputs() {
        let (dna, cpg) = stems();
        let joint =
            join_models(JointKind::L0, &JointParams::new(), vec![dna, cpg], &device()).unwrap();
        assert_eq!(
            joint.input_names(),
            vec!["dna".to_string(), "cpg/state".to_string(), "cpg/dist".to_string()]
        );
    }

    #[test]
    fn test_joint_needs_two_models() {
        let (dna, _) = stems();
        let err = join_models(JointKind::L0, &JointParams::new(), vec![dna], &device()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_joint_rejects_headed_submodel() {
        let (mut dna, cpg) = stems();
        dna.add_output_layers(
            &["cpg/a".to_string()],
            &crate::model::TargetParams::new(),
            &device(),
        )
        .unwrap();
        let err =
            join_models(JointKind::L0, &JointParams::new(), vec![dna, cpg], &device()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
