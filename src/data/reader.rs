//! Streaming reader turning raw storage records into model-ready batches.
//!
//! Field order is fixed: the DNA window, then per-replicate CpG state and
//! distance arrays, then the requested output channels. Each call to
//! [`DataReader::iterate`] produces an iterator owning its own cursor and
//! random generator, so separate passes can run concurrently with one
//! another (single-producer/single-consumer handoff included).

use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::{Array1, Array2, Ix1, Ix2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::data::preprocess::{crop_dna, int_to_onehot, prepro_cpg};
use crate::data::source::RecordSource;
use crate::data::{stack_batches, Batch, Chunk, ClassWeights, CPG_NAN, NAN_WEIGHT};
use crate::error::{Error, Result};
use crate::model::graph::BranchInput;
use crate::model::persist::ModelSpec;
use crate::model::NB_CAT_VAR;

/// The categorical-variance channel, expanded to one-hot labels.
pub const CAT_VAR_OUTPUT: &str = "stats/cat_var";

/// Join replicate names into the composite key suffix of legacy models.
pub fn encode_replicate_names(names: &[String]) -> String {
    names.join("--")
}

/// Split a composite replicate-name key back into individual names.
pub fn decode_replicate_names(encoded: &str) -> Vec<String> {
    encoded.split("--").map(|s| s.to_string()).collect()
}

/// Per-sample training weights for a label vector.
///
/// Defaults to 1.0; sentinel labels get a near-zero weight so they stay in
/// the batch without contributing to the loss. Class-weight overrides
/// replace the weight of matching label values.
pub fn get_sample_weights(
    y: &Array1<f32>,
    class_weights: Option<&BTreeMap<i64, f32>>,
) -> Array1<f32> {
    let mut weights = Array1::from_elem(y.len(), 1.0f32);
    for (w, &label) in weights.iter_mut().zip(y.iter()) {
        if label == CPG_NAN {
            *w = NAN_WEIGHT;
        }
    }
    if let Some(class_weights) = class_weights {
        for (&class, &weight) in class_weights {
            for (w, &label) in weights.iter_mut().zip(y.iter()) {
                if label == class as f32 {
                    *w = weight;
                }
            }
        }
    }
    weights
}

/// Expand integer labels to width-3 one-hot rows; sentinel labels become
/// all-zero rows.
fn cat_var_onehot(y: &Array1<f32>) -> Array2<f32> {
    let mut onehot = Array2::<f32>::zeros((y.len(), NB_CAT_VAR));
    for (i, &label) in y.iter().enumerate() {
        let class = label as i64;
        if label != CPG_NAN && (0..NB_CAT_VAR as i64).contains(&class) {
            onehot[[i, class as usize]] = 1.0;
        }
    }
    onehot
}

/// Options of one reading pass.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Number of samples per yielded batch
    pub batch_size: usize,
    /// Stop after this many samples, truncating the final batch
    pub nb_sample: Option<usize>,
    /// Seed of the imputation generator; unseeded when absent
    pub seed: Option<u64>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            batch_size: 128,
            nb_sample: None,
            seed: None,
        }
    }
}

/// Configured reader over raw storage sources.
#[derive(Debug, Clone, Default)]
pub struct DataReader {
    output_names: Vec<String>,
    use_dna: bool,
    dna_wlen: Option<usize>,
    replicate_names: Vec<String>,
    cpg_wlen: Option<usize>,
    cpg_max_dist: f32,
    encode_replicates: bool,
}

impl DataReader {
    pub fn new() -> Self {
        Self {
            cpg_max_dist: 25000.0,
            ..Self::default()
        }
    }

    /// Enable the DNA input, optionally cropping to a centered window.
    pub fn with_dna(mut self, wlen: Option<usize>) -> Self {
        self.use_dna = true;
        self.dna_wlen = wlen;
        self
    }

    /// Enable CpG inputs for the given replicates.
    pub fn with_replicates(mut self, names: &[String], wlen: Option<usize>) -> Self {
        self.replicate_names = names.to_vec();
        self.cpg_wlen = wlen;
        self
    }

    /// Cap and normalizer of CpG neighbor distances.
    pub fn with_cpg_max_dist(mut self, max_dist: f32) -> Self {
        self.cpg_max_dist = max_dist;
        self
    }

    /// Fold replicate names into the CpG input keys (legacy models).
    pub fn with_encoded_replicates(mut self, encode: bool) -> Self {
        self.encode_replicates = encode;
        self
    }

    /// Output channels to read labels and weights for.
    pub fn with_outputs(mut self, names: &[String]) -> Self {
        self.output_names = names.to_vec();
        self
    }

    /// Derive a reader from a model's input signature.
    ///
    /// Legacy CpG inputs carry their replicate names in the input key;
    /// otherwise `replicate_names` must be supplied and match the count
    /// the model was trained with.
    pub fn from_model(
        spec: &ModelSpec,
        outputs: bool,
        replicate_names: Option<&[String]>,
    ) -> Result<Self> {
        let mut reader = DataReader::new();
        for branch in &spec.branches {
            match &branch.input {
                BranchInput::Dna { wlen } => {
                    reader.use_dna = true;
                    reader.dna_wlen = Some(*wlen);
                }
                BranchInput::Cpg {
                    replicates,
                    wlen,
                    encoded_names: Some(encoded),
                } => {
                    let names = decode_replicate_names(encoded);
                    if names.len() != *replicates {
                        return Err(Error::Configuration(format!(
                            "model encodes {} replicate names but declares {} replicates",
                            names.len(),
                            replicates
                        )));
                    }
                    reader.replicate_names = names;
                    reader.cpg_wlen = Some(*wlen);
                    reader.encode_replicates = true;
                }
                BranchInput::Cpg {
                    replicates,
                    wlen,
                    encoded_names: None,
                } => {
                    let names = replicate_names.ok_or_else(|| {
                        Error::Configuration(
                            "replicate names required to feed a CpG model; \
                             use --replicate-names to supply them"
                                .to_string(),
                        )
                    })?;
                    if names.len() != *replicates {
                        return Err(Error::Configuration(format!(
                            "{found} replicates found but the CpG model was trained with \
                             {expected} replicates; use --nb-replicate {expected} or \
                             --replicate-names to select {expected} replicates",
                            found = names.len(),
                            expected = replicates
                        )));
                    }
                    reader.replicate_names = names.to_vec();
                    reader.cpg_wlen = Some(*wlen);
                }
            }
        }
        if outputs {
            reader.output_names = spec.heads.iter().map(|h| h.name.clone()).collect();
        }
        Ok(reader)
    }

    /// Storage field names this reader fetches, in fixed order.
    pub fn field_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if self.use_dna {
            names.push("inputs/dna".to_string());
        }
        for replicate in &self.replicate_names {
            names.push(format!("inputs/cpg/{}/state", replicate));
            names.push(format!("inputs/cpg/{}/dist", replicate));
        }
        for output in &self.output_names {
            names.push(format!("outputs/{}", output));
        }
        names
    }

    fn cpg_key_suffix(&self) -> String {
        if self.encode_replicates {
            format!("/{}", encode_replicate_names(&self.replicate_names))
        } else {
            String::new()
        }
    }

    fn take_2d(chunk: &mut Chunk, name: &str) -> Result<Array2<f32>> {
        let array = chunk
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("field '{}' missing from chunk", name)))?;
        array
            .into_dimensionality::<Ix2>()
            .map_err(|e| Error::Validation(format!("field '{}' is not 2-dimensional: {}", name, e)))
    }

    fn take_1d(chunk: &mut Chunk, name: &str) -> Result<Array1<f32>> {
        let array = chunk
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("field '{}' missing from chunk", name)))?;
        array
            .into_dimensionality::<Ix1>()
            .map_err(|e| Error::Validation(format!("field '{}' is not 1-dimensional: {}", name, e)))
    }

    /// Preprocess one raw chunk into a batch record.
    pub fn prepare<R: Rng + ?Sized>(
        &self,
        mut chunk: Chunk,
        class_weights: Option<&ClassWeights>,
        rng: &mut R,
    ) -> Result<Batch> {
        let mut batch = Batch::default();

        if self.use_dna {
            let mut dna = Self::take_2d(&mut chunk, "inputs/dna")?;
            if let Some(wlen) = self.dna_wlen {
                dna = crop_dna(&dna, wlen)?;
            }
            batch
                .inputs
                .insert("dna".to_string(), int_to_onehot(&dna).into_dyn());
        }

        if !self.replicate_names.is_empty() {
            let mut states = Vec::with_capacity(self.replicate_names.len());
            let mut dists = Vec::with_capacity(self.replicate_names.len());
            for replicate in &self.replicate_names {
                states.push(Self::take_2d(&mut chunk, &format!("inputs/cpg/{}/state", replicate))?);
                dists.push(Self::take_2d(&mut chunk, &format!("inputs/cpg/{}/dist", replicate))?);
            }
            let cpg = prepro_cpg(states, dists, self.cpg_wlen, self.cpg_max_dist, rng)?;
            let suffix = self.cpg_key_suffix();
            batch
                .inputs
                .insert(format!("cpg/state{}", suffix), cpg.states.into_dyn());
            batch
                .inputs
                .insert(format!("cpg/dist{}", suffix), cpg.dists.into_dyn());
        }

        for output in &self.output_names {
            let y = Self::take_1d(&mut chunk, &format!("outputs/{}", output))?;
            let cweights = class_weights.and_then(|cw| cw.get(output));
            batch
                .weights
                .insert(output.clone(), get_sample_weights(&y, cweights).into_dyn());
            let labels = if output == CAT_VAR_OUTPUT {
                cat_var_onehot(&y).into_dyn()
            } else {
                y.into_dyn()
            };
            batch.outputs.insert(output.clone(), labels);
        }

        batch.validate()?;
        Ok(batch)
    }

    /// Start a fresh reading pass over one or more storage sources.
    ///
    /// The returned iterator owns its cursor and random generator; calling
    /// `iterate` again starts an independent pass.
    pub fn iterate(
        &self,
        sources: Vec<Arc<dyn RecordSource>>,
        class_weights: Option<ClassWeights>,
        options: ReadOptions,
    ) -> Result<BatchIter> {
        if sources.is_empty() {
            return Err(Error::Configuration("no storage sources given".to_string()));
        }
        if options.batch_size == 0 {
            return Err(Error::Configuration("batch_size must be positive".to_string()));
        }
        let names = self.field_names();
        debug!(fields = names.len(), sources = sources.len(), "starting reading pass");
        let rng = match options.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Ok(BatchIter {
            reader: self.clone(),
            sources,
            names,
            class_weights,
            batch_size: options.batch_size,
            remaining: options.nb_sample,
            rng,
            source_idx: 0,
            offset: 0,
            failed: false,
        })
    }
}

/// One reading pass; yields preprocessed batches until the sources or the
/// sample cap are exhausted.
pub struct BatchIter {
    reader: DataReader,
    sources: Vec<Arc<dyn RecordSource>>,
    names: Vec<String>,
    class_weights: Option<ClassWeights>,
    batch_size: usize,
    remaining: Option<usize>,
    rng: ChaCha8Rng,
    source_idx: usize,
    offset: usize,
    failed: bool,
}

impl Iterator for BatchIter {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining == Some(0) {
            return None;
        }
        while self.source_idx < self.sources.len()
            && self.offset >= self.sources[self.source_idx].nb_sample()
        {
            self.source_idx += 1;
            self.offset = 0;
        }
        if self.source_idx >= self.sources.len() {
            return None;
        }

        let source = &self.sources[self.source_idx];
        let mut n = self.batch_size.min(source.nb_sample() - self.offset);
        if let Some(remaining) = self.remaining {
            n = n.min(remaining);
        }

        let chunk = match source.read_batch(&self.names, self.offset, n) {
            Ok(chunk) => chunk,
            Err(err) => {
                self.failed = true;
                return Some(Err(err));
            }
        };
        self.offset += n;
        if let Some(remaining) = &mut self.remaining {
            *remaining -= n;
        }

        match self.reader.prepare(chunk, self.class_weights.as_ref(), &mut self.rng) {
            Ok(batch) => Some(Ok(batch)),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Drain a batch iterator into one stacked batch, honoring a sample cap.
pub fn read_from<I>(batches: I, nb_sample: Option<usize>) -> Result<Batch>
where
    I: IntoIterator<Item = Result<Batch>>,
{
    let mut collected = Vec::new();
    let mut seen = 0usize;
    for batch in batches {
        let batch = batch?;
        seen += batch.len();
        collected.push(batch);
        if nb_sample.is_some_and(|cap| seen >= cap) {
            break;
        }
    }
    let mut stacked = stack_batches(&collected)?;
    if let Some(cap) = nb_sample {
        stacked.truncate(cap);
    }
    Ok(stacked)
}
