pub mod preprocess;
pub mod reader;
pub mod source;

use std::collections::BTreeMap;

use ndarray::{ArrayD, Axis};

use crate::error::{Error, Result};

/// Sentinel marking an unobserved methylation state or label.
pub const CPG_NAN: f32 = -1.0;

/// Size of the DNA one-hot alphabet (A, T, G, C; N maps to the zero row).
pub const DNA_ALPHABET_SIZE: usize = 4;

/// Separator between components of hierarchical output names.
pub const OUTPUT_SEP: char = '/';

/// Near-zero sample weight assigned to sentinel-labelled samples so they
/// stay in the batch without contributing to the loss.
pub const NAN_WEIGHT: f32 = f32::EPSILON;

/// One chunk of raw storage records: field name to array, leading axis is
/// the sample axis.
pub type Chunk = BTreeMap<String, ArrayD<f32>>;

/// Per-channel class-weight overrides: channel name to label-value weights.
pub type ClassWeights = BTreeMap<String, BTreeMap<i64, f32>>;

/// The unit flowing from the data reader to the training engine.
///
/// Every array's leading dimension is the batch size, equal across all
/// three maps.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub inputs: BTreeMap<String, ArrayD<f32>>,
    pub outputs: BTreeMap<String, ArrayD<f32>>,
    pub weights: BTreeMap<String, ArrayD<f32>>,
}

impl Batch {
    /// Number of samples in this batch, taken from the first input array.
    pub fn len(&self) -> usize {
        self.inputs
            .values()
            .chain(self.outputs.values())
            .next()
            .map(|a| a.shape()[0])
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Truncate all arrays to at most `n` leading samples.
    pub fn truncate(&mut self, n: usize) {
        for map in [&mut self.inputs, &mut self.outputs, &mut self.weights] {
            for array in map.values_mut() {
                if array.shape()[0] > n {
                    *array = array.slice_axis(Axis(0), ndarray::Slice::from(0..n)).to_owned();
                }
            }
        }
    }

    /// Check the leading-dimension invariant across all three maps.
    pub fn validate(&self) -> Result<()> {
        let n = self.len();
        for (name, array) in self
            .inputs
            .iter()
            .chain(self.outputs.iter())
            .chain(self.weights.iter())
        {
            if array.shape()[0] != n {
                return Err(Error::Validation(format!(
                    "batch dimension mismatch: '{}' has {} samples, expected {}",
                    name,
                    array.shape()[0],
                    n
                )));
            }
        }
        Ok(())
    }
}

fn stack_maps(
    batches: &[Batch],
    select: fn(&Batch) -> &BTreeMap<String, ArrayD<f32>>,
) -> Result<BTreeMap<String, ArrayD<f32>>> {
    let mut out = BTreeMap::new();
    for name in select(&batches[0]).keys() {
        let views = batches
            .iter()
            .map(|b| {
                select(b).get(name).map(|a| a.view()).ok_or_else(|| {
                    Error::Validation(format!("batch missing key '{}' while stacking", name))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let merged = ndarray::concatenate(Axis(0), &views)
            .map_err(|e| Error::Validation(format!("stacking '{}': {}", name, e)))?;
        out.insert(name.clone(), merged);
    }
    Ok(out)
}

/// Concatenate batches along the sample axis into one batch.
///
/// All batches must carry the same keys.
pub fn stack_batches(batches: &[Batch]) -> Result<Batch> {
    if batches.is_empty() {
        return Err(Error::Validation("cannot stack an empty batch list".to_string()));
    }
    Ok(Batch {
        inputs: stack_maps(batches, |b| &b.inputs)?,
        outputs: stack_maps(batches, |b| &b.outputs)?,
        weights: stack_maps(batches, |b| &b.weights)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn batch_with(n: usize, value: f32) -> Batch {
        let mut batch = Batch::default();
        batch
            .inputs
            .insert("dna".to_string(), Array2::from_elem((n, 4), value).into_dyn());
        batch
            .outputs
            .insert("cpg/a".to_string(), ArrayD::from_elem(ndarray::IxDyn(&[n]), value));
        batch
            .weights
            .insert("cpg/a".to_string(), ArrayD::from_elem(ndarray::IxDyn(&[n]), 1.0));
        batch
    }

    #[test]
    fn test_batch_len_and_validate() {
        let batch = batch_with(3, 0.5);
        assert_eq!(batch.len(), 3);
        batch.validate().unwrap();
    }

    #[test]
    fn test_batch_validate_mismatch() {
        let mut batch = batch_with(3, 0.5);
        batch
            .outputs
            .insert("cpg/b".to_string(), ArrayD::from_elem(ndarray::IxDyn(&[2]), 0.0));
        assert!(batch.validate().is_err());
    }

    #[test]
    fn test_batch_truncate() {
        let mut batch = batch_with(5, 1.0);
        batch.truncate(2);
        assert_eq!(batch.len(), 2);
        batch.validate().unwrap();
    }

    #[test]
    fn test_stack_batches() {
        let stacked = stack_batches(&[batch_with(2, 0.0), batch_with(3, 1.0)]).unwrap();
        assert_eq!(stacked.len(), 5);
        let labels = &stacked.outputs["cpg/a"];
        assert_eq!(labels.shape(), &[5]);
        assert_eq!(labels[[0]], 0.0);
        assert_eq!(labels[[4]], 1.0);
    }
}
