//! Model persistence and weight transplant.
//!
//! Architectures serialize as JSON layer-graph descriptions; weights as a
//! MessagePack map of layer name to weight tensors. The combined `.mpk`
//! format carries both in one file. Weight transplant copies tensors
//! between models by exact layer-name match only; no structural matching.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::graph::{Branch, BranchInput, Head, Model};
use crate::model::layers::{LayerSpec, NamedLayer, TensorBlob};
use crate::model::LossKind;

/// Extension of the combined architecture+weights format.
pub const COMBINED_EXT: &str = "mpk";

/// Weight blobs keyed by layer name.
pub type WeightMap = BTreeMap<String, Vec<TensorBlob>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedLayerSpec {
    pub name: String,
    pub layer: LayerSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSpec {
    pub input: BranchInput,
    pub layers: Vec<NamedLayerSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadSpec {
    pub name: String,
    pub loss: LossKind,
    pub layers: Vec<NamedLayerSpec>,
}

/// Serializable description of a model's layer graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub scope: Option<String>,
    pub feature_width: usize,
    pub branches: Vec<BranchSpec>,
    pub trunk: Vec<NamedLayerSpec>,
    pub heads: Vec<HeadSpec>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CombinedFile {
    spec: ModelSpec,
    weights: WeightMap,
}

fn named_specs<B: Backend>(layers: &[NamedLayer<B>]) -> Vec<NamedLayerSpec> {
    layers
        .iter()
        .map(|l| NamedLayerSpec {
            name: l.name.clone(),
            layer: l.spec.clone(),
        })
        .collect()
}

fn named_layers<B: Backend>(specs: &[NamedLayerSpec], device: &B::Device) -> Vec<NamedLayer<B>> {
    specs
        .iter()
        .map(|s| NamedLayer::new(s.name.clone(), s.layer.clone(), device))
        .collect()
}

impl<B: Backend> Model<B> {
    /// Describe this model's architecture as plain data.
    pub fn to_spec(&self) -> ModelSpec {
        ModelSpec {
            name: self.name.clone(),
            scope: self.scope.clone(),
            feature_width: self.feature_width(),
            branches: self
                .branches()
                .iter()
                .map(|b| BranchSpec {
                    input: b.input.clone(),
                    layers: named_specs(&b.layers),
                })
                .collect(),
            trunk: named_specs(self.trunk()),
            heads: self
                .heads()
                .iter()
                .map(|h| HeadSpec {
                    name: h.name.clone(),
                    loss: h.loss,
                    layers: named_specs(&h.layers),
                })
                .collect(),
        }
    }

    /// Rebuild a model (freshly initialized weights) from its description.
    pub fn from_spec(spec: &ModelSpec, device: &B::Device) -> Result<Self> {
        let branches = spec
            .branches
            .iter()
            .map(|b| Branch {
                input: b.input.clone(),
                layers: named_layers(&b.layers, device),
            })
            .collect();
        let mut model = Model::new(
            spec.name.clone(),
            spec.scope.clone(),
            branches,
            named_layers(&spec.trunk, device),
            spec.feature_width,
        )?;
        for head in &spec.heads {
            model.heads.push(Head {
                name: head.name.clone(),
                loss: head.loss,
                layers: named_layers(&head.layers, device),
            });
        }
        model.validate()?;
        Ok(model)
    }

    /// Export all weight-carrying layers as a name-keyed map.
    pub fn export_weights(&self) -> Result<WeightMap> {
        let mut weights = WeightMap::new();
        for layer in self.layers() {
            let blobs = layer.op.weights()?;
            if !blobs.is_empty() {
                weights.insert(layer.name.clone(), blobs);
            }
        }
        Ok(weights)
    }

    /// Load weights by layer name; every weight-carrying layer must be
    /// present in the map.
    pub fn import_weights(&mut self, weights: &WeightMap, device: &B::Device) -> Result<()> {
        for layer in self.layers_mut() {
            if layer.spec.num_params() == 0 {
                continue;
            }
            let blobs = weights.get(&layer.name).ok_or_else(|| {
                Error::MissingLayer(format!("no weights for layer '{}'", layer.name))
            })?;
            layer
                .op
                .set_weights(blobs, device)
                .map_err(|e| Error::Validation(format!("layer '{}': {}", layer.name, e)))?;
        }
        Ok(())
    }
}

/// Copy weights from `src` to `dst` wherever layer names match exactly.
///
/// With `must_exist`, the first destination layer without a source
/// counterpart fails with [`Error::MissingLayer`]; otherwise unmatched
/// layers are silently skipped. Returns the copied layer names.
pub fn copy_weights<B: Backend>(
    src: &Model<B>,
    dst: &mut Model<B>,
    must_exist: bool,
    device: &B::Device,
) -> Result<Vec<String>> {
    let src_weights: BTreeMap<String, Vec<TensorBlob>> = src
        .layers()
        .map(|l| Ok((l.name.clone(), l.op.weights()?)))
        .collect::<Result<_>>()?;

    let mut copied = Vec::new();
    for layer in dst.layers_mut() {
        match src_weights.get(&layer.name) {
            Some(blobs) => {
                layer
                    .op
                    .set_weights(blobs, device)
                    .map_err(|e| Error::Validation(format!("layer '{}': {}", layer.name, e)))?;
                copied.push(layer.name.clone());
            }
            None if must_exist => {
                return Err(Error::MissingLayer(format!(
                    "layer '{}' not found in source model",
                    layer.name
                )));
            }
            None => continue,
        }
    }
    debug!(copied = copied.len(), "weight transplant finished");
    Ok(copied)
}

fn has_combined_ext(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(COMBINED_EXT)
}

/// Save a model's architecture and weights.
///
/// A `.mpk` `model_file` stores both together; any other extension stores
/// the JSON architecture in `model_file` and, if `weights_file` is given,
/// the weight map next to it.
pub fn save_model<B: Backend>(
    model: &Model<B>,
    model_file: &Path,
    weights_file: Option<&Path>,
) -> Result<()> {
    if let Some(parent) = model_file.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if has_combined_ext(model_file) {
        let combined = CombinedFile {
            spec: model.to_spec(),
            weights: model.export_weights()?,
        };
        fs::write(model_file, rmp_serde::to_vec_named(&combined)?)?;
    } else {
        fs::write(model_file, serde_json::to_string_pretty(&model.to_spec())?)?;
        if let Some(weights_file) = weights_file {
            fs::write(weights_file, rmp_serde::to_vec_named(&model.export_weights()?)?)?;
        }
    }
    info!(model = %model_file.display(), "saved model");
    Ok(())
}

/// Search a directory for model files.
///
/// Prefers `model.json` paired with the first existing weight blob of
/// `model_weights.mpk`, `model_weights_val.mpk`, `model_weights_train.mpk`;
/// falls back to the combined `model.mpk`.
pub fn search_model_files(dirname: &Path) -> Result<Vec<PathBuf>> {
    let json_file = dirname.join("model.json");
    if json_file.is_file() {
        let order = ["model_weights.mpk", "model_weights_val.mpk", "model_weights_train.mpk"];
        for name in order {
            let weights_file = dirname.join(name);
            if weights_file.is_file() {
                return Ok(vec![json_file, weights_file]);
            }
        }
    }
    let combined = dirname.join(format!("model.{}", COMBINED_EXT));
    if combined.is_file() {
        return Ok(vec![combined]);
    }
    Err(Error::NotFound(format!(
        "no model files found in '{}'",
        dirname.display()
    )))
}

/// Load a model from one or two paths, or from a model directory.
pub fn load_model<B: Backend>(paths: &[PathBuf], device: &B::Device) -> Result<Model<B>> {
    let first = paths
        .first()
        .ok_or_else(|| Error::Configuration("no model files given".to_string()))?;
    let paths: Vec<PathBuf> = if first.is_dir() {
        let resolved = search_model_files(first)?;
        info!(
            files = %resolved.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(" "),
            "using model files"
        );
        resolved
    } else {
        paths.to_vec()
    };

    if has_combined_ext(&paths[0]) {
        let combined: CombinedFile = rmp_serde::from_slice(&fs::read(&paths[0])?)?;
        let mut model = Model::from_spec(&combined.spec, device)?;
        model.import_weights(&combined.weights, device)?;
        Ok(model)
    } else {
        let spec: ModelSpec = serde_json::from_str(&fs::read_to_string(&paths[0])?)?;
        let mut model = Model::from_spec(&spec, device)?;
        if let Some(weights_file) = paths.get(1) {
            let weights: WeightMap = rmp_serde::from_slice(&fs::read(weights_file)?)?;
            model.import_weights(&weights, device)?;
        }
        Ok(model)
    }
}
