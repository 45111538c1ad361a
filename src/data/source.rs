//! Seam over the raw per-site storage.
//!
//! The on-disk format is owned by an external reader; this module only
//! fixes the contract the data reader needs: named fields addressed by
//! sample ranges. Field naming follows the storage convention
//! `inputs/dna`, `inputs/cpg/<replicate>/state`,
//! `inputs/cpg/<replicate>/dist`, `outputs/<channel>`.

use std::collections::BTreeMap;

use ndarray::{ArrayD, Axis, Slice};

use crate::data::Chunk;
use crate::error::{Error, Result};

/// A raw storage source the data reader can iterate.
///
/// Implementations must be shareable across threads so an iteration can be
/// driven from a background producer thread.
pub trait RecordSource: Send + Sync {
    /// Total number of records in this source.
    fn nb_sample(&self) -> usize;

    /// Read `len` records starting at `start` for the named fields.
    ///
    /// Fails with [`Error::NotFound`] if a requested field does not exist.
    fn read_batch(&self, names: &[String], start: usize, len: usize) -> Result<Chunk>;
}

/// In-memory source backed by pre-loaded field arrays.
///
/// Used by tests and tooling; production sources sit behind the same trait.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    fields: BTreeMap<String, ArrayD<f32>>,
    nb_sample: usize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field array; the leading axis is the sample axis.
    ///
    /// All fields of one source must agree on the sample count.
    pub fn with_field(mut self, name: &str, array: ArrayD<f32>) -> Result<Self> {
        let n = array.shape()[0];
        if self.fields.is_empty() {
            self.nb_sample = n;
        } else if n != self.nb_sample {
            return Err(Error::Configuration(format!(
                "field '{}' has {} samples but source holds {}",
                name, n, self.nb_sample
            )));
        }
        self.fields.insert(name.to_string(), array);
        Ok(self)
    }
}

impl RecordSource for MemorySource {
    fn nb_sample(&self) -> usize {
        self.nb_sample
    }

    fn read_batch(&self, names: &[String], start: usize, len: usize) -> Result<Chunk> {
        let end = (start + len).min(self.nb_sample);
        let mut chunk = Chunk::new();
        for name in names {
            let array = self.fields.get(name).ok_or_else(|| {
                Error::NotFound(format!("field '{}' not present in storage source", name))
            })?;
            chunk.insert(
                name.clone(),
                array.slice_axis(Axis(0), Slice::from(start..end)).to_owned(),
            );
        }
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_memory_source_read_batch() {
        let labels = ndarray::Array1::from_vec(vec![0.0, 1.0, 0.0, 1.0, 1.0]).into_dyn();
        let source = MemorySource::new()
            .with_field("outputs/cpg/a", labels)
            .unwrap();
        assert_eq!(source.nb_sample(), 5);

        let chunk = source
            .read_batch(&["outputs/cpg/a".to_string()], 1, 2)
            .unwrap();
        let got = &chunk["outputs/cpg/a"];
        assert_eq!(got.shape(), &[2]);
        assert_eq!(got[[0]], 1.0);
    }

    #[test]
    fn test_memory_source_clamps_tail() {
        let labels = ndarray::Array1::from_vec(vec![0.0, 1.0, 0.0]).into_dyn();
        let source = MemorySource::new()
            .with_field("outputs/cpg/a", labels)
            .unwrap();
        let chunk = source
            .read_batch(&["outputs/cpg/a".to_string()], 2, 10)
            .unwrap();
        assert_eq!(chunk["outputs/cpg/a"].shape(), &[1]);
    }

    #[test]
    fn test_memory_source_missing_field() {
        let source = MemorySource::new()
            .with_field("inputs/dna", Array2::<f32>::zeros((3, 11)).into_dyn())
            .unwrap();
        let err = source
            .read_batch(&["outputs/cpg/a".to_string()], 0, 3)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_memory_source_sample_count_mismatch() {
        let result = MemorySource::new()
            .with_field("inputs/dna", Array2::<f32>::zeros((3, 11)).into_dyn())
            .unwrap()
            .with_field("outputs/cpg/a", ndarray::Array1::<f32>::zeros(4).into_dyn());
        assert!(result.is_err());
    }
}
