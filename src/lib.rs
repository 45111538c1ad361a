//! # cpgnet: CpG methylation prediction models
//!
//! cpgnet builds and feeds neural-network architectures that predict DNA
//! methylation state from DNA sequence windows and neighboring CpG
//! observations across sequenced cells (replicates).
//!
//! ## Features
//!
//! - Declarative assembly of DNA, CpG, and joint architectures from
//!   hyperparameter records
//! - Windowing, normalization, and imputation of raw per-site records into
//!   fixed-shape batches
//! - Architecture/weight persistence and name-based weight transplant
//!   between differently-scoped models
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use cpgnet::data::reader::{DataReader, ReadOptions};
//! use cpgnet::data::source::{MemorySource, RecordSource};
//! use cpgnet::model::builders::build_dna_model;
//! use cpgnet::model::{BranchParams, TargetParams};
//! use cpgnet::DefaultBackend;
//!
//! let device = Default::default();
//! let params = BranchParams::new();
//! let mut model = build_dna_model::<DefaultBackend>(&params, 1001, &device).unwrap();
//! model
//!     .add_output_layers(&["cpg/mESC".to_string()], &TargetParams::new(), &device)
//!     .unwrap();
//!
//! let reader = DataReader::new()
//!     .with_dna(Some(1001))
//!     .with_outputs(&["cpg/mESC".to_string()]);
//! let source: Arc<dyn RecordSource> = Arc::new(MemorySource::new());
//! let batches = reader
//!     .iterate(vec![source], None, ReadOptions::default())
//!     .unwrap();
//! let (predictions, _data) = model.predict_batches(batches, None, &device).unwrap();
//! ```

pub mod cli;
pub mod data;
pub mod error;
pub mod model;

use burn_ndarray::NdArray;

/// Default backend type
pub type DefaultBackend = NdArray<f32>;

/// Re-export commonly used types
pub use data::reader::{DataReader, ReadOptions};
pub use data::{Batch, ClassWeights, CPG_NAN};
pub use error::{Error, Result};
pub use model::graph::Model;
pub use model::persist::{copy_weights, load_model, save_model, search_model_files};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get library information
pub fn info() -> String {
    format!(
        "{} v{} - CpG methylation prediction model toolkit",
        NAME, VERSION
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_info() {
        let info_str = info();
        assert!(info_str.contains("cpgnet"));
        assert!(info_str.contains(VERSION));
    }
}
