//! Windowing and imputation of raw sequence and CpG neighbor arrays.
//!
//! Converts variable-provenance storage arrays into the fixed-shape,
//! NaN-free tensors the model graph consumes. Imputation is stochastic;
//! callers pass the random generator explicitly.

use ndarray::{s, Array2, Array3, Axis};
use rand::Rng;

use crate::data::{CPG_NAN, DNA_ALPHABET_SIZE};
use crate::error::{Error, Result};

/// Centered crop of integer-coded DNA windows to `wlen` around the middle
/// position.
///
/// The crop range is `[center - wlen/2, center + wlen/2 + 1)` with
/// `center = L0 / 2`, so an even `wlen` yields `wlen + 1` positions. This
/// asymmetry is the defined contract; callers wanting an exact width pass
/// an odd `wlen`.
pub fn crop_dna(dna: &Array2<f32>, wlen: usize) -> Result<Array2<f32>> {
    let cur_wlen = dna.ncols();
    let center = cur_wlen / 2;
    let delta = wlen / 2;
    if delta > center || center + delta + 1 > cur_wlen {
        return Err(Error::Configuration(format!(
            "dna window of {} does not fit source width {}",
            wlen, cur_wlen
        )));
    }
    Ok(dna.slice(s![.., center - delta..center + delta + 1]).to_owned())
}

/// Expand integer-coded DNA to a one-hot tensor over the 4-symbol alphabet.
///
/// Codes outside `0..4` (the N symbol) produce an all-zero row.
pub fn int_to_onehot(dna: &Array2<f32>) -> Array3<f32> {
    let (n, len) = dna.dim();
    let mut onehot = Array3::<f32>::zeros((n, len, DNA_ALPHABET_SIZE));
    for ((i, j), &code) in dna.indexed_iter() {
        let code = code as i64;
        if (0..DNA_ALPHABET_SIZE as i64).contains(&code) {
            onehot[[i, j, code as usize]] = 1.0;
        }
    }
    onehot
}

/// Preprocessed CpG neighbor tensors, shape `[batch, replicate, position]`.
#[derive(Debug, Clone)]
pub struct CpgTensors {
    pub states: Array3<f32>,
    pub dists: Array3<f32>,
}

/// Impute, normalize, and stack per-replicate CpG neighbor observations.
///
/// Per replicate: sentinel states are imputed by Bernoulli draws whose
/// success probability is the fraction of 1-states in that replicate's
/// array, and the paired distances are set to `max_dist`. All distances
/// are then clipped to `max_dist` and scaled to `[0, 1]`. Replicates are
/// stacked along a new axis 1, and the position axis is optionally cropped
/// to a centered window of `wlen` (range `[center - wlen/2,
/// center + wlen/2)`).
pub fn prepro_cpg<R: Rng + ?Sized>(
    states: Vec<Array2<f32>>,
    dists: Vec<Array2<f32>>,
    wlen: Option<usize>,
    max_dist: f32,
    rng: &mut R,
) -> Result<CpgTensors> {
    if states.is_empty() || states.len() != dists.len() {
        return Err(Error::Configuration(format!(
            "{} state arrays but {} distance arrays",
            states.len(),
            dists.len()
        )));
    }
    if max_dist <= 0.0 {
        return Err(Error::Configuration(format!(
            "cpg_max_dist must be positive, got {}",
            max_dist
        )));
    }

    let mut prepro_states = Vec::with_capacity(states.len());
    let mut prepro_dists = Vec::with_capacity(dists.len());
    for (mut state, mut dist) in states.into_iter().zip(dists) {
        if state.dim() != dist.dim() {
            return Err(Error::Configuration(format!(
                "state shape {:?} does not match distance shape {:?}",
                state.dim(),
                dist.dim()
            )));
        }
        let has_nan = state.iter().any(|&v| v == CPG_NAN);
        if has_nan {
            let p_one = state.iter().filter(|&&v| v == 1.0).count() as f64 / state.len() as f64;
            for (s, d) in state.iter_mut().zip(dist.iter_mut()) {
                if *s == CPG_NAN {
                    *s = if rng.gen_bool(p_one) { 1.0 } else { 0.0 };
                    *d = max_dist;
                }
            }
        }
        dist.mapv_inplace(|d| d.min(max_dist) / max_dist);
        prepro_states.push(state);
        prepro_dists.push(dist);
    }

    let state_views: Vec<_> = prepro_states.iter().map(|a| a.view()).collect();
    let dist_views: Vec<_> = prepro_dists.iter().map(|a| a.view()).collect();
    let mut states = ndarray::stack(Axis(1), &state_views)
        .map_err(|e| Error::Validation(format!("stacking replicate states: {}", e)))?;
    let mut dists = ndarray::stack(Axis(1), &dist_views)
        .map_err(|e| Error::Validation(format!("stacking replicate distances: {}", e)))?;

    if let Some(wlen) = wlen {
        let center = states.len_of(Axis(2)) / 2;
        let delta = wlen / 2;
        if delta > center {
            return Err(Error::Configuration(format!(
                "cpg window of {} does not fit source width {}",
                wlen,
                states.len_of(Axis(2))
            )));
        }
        states = states.slice(s![.., .., center - delta..center + delta]).to_owned();
        dists = dists.slice(s![.., .., center - delta..center + delta]).to_owned();
    }

    Ok(CpgTensors { states, dists })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(0)
    }

    #[test]
    fn test_crop_dna_even_window_is_one_wider() {
        let dna = Array2::from_shape_fn((1, 101), |(_, j)| j as f32);
        let cropped = crop_dna(&dna, 10).unwrap();
        assert_eq!(cropped.dim(), (1, 11));
        // center 50, delta 5: positions 45..=55
        assert_eq!(cropped[[0, 0]], 45.0);
        assert_eq!(cropped[[0, 10]], 55.0);
    }

    #[test]
    fn test_crop_dna_odd_window_exact() {
        let dna = Array2::from_shape_fn((2, 25), |(_, j)| j as f32);
        let cropped = crop_dna(&dna, 11).unwrap();
        assert_eq!(cropped.dim(), (2, 11));
        assert_eq!(cropped[[0, 0]], 7.0);
        assert_eq!(cropped[[0, 10]], 17.0);
    }

    #[test]
    fn test_crop_dna_too_wide() {
        let dna = Array2::<f32>::zeros((1, 11));
        assert!(crop_dna(&dna, 100).is_err());
    }

    #[test]
    fn test_int_to_onehot() {
        let dna = Array2::from_shape_vec((1, 5), vec![0.0, 1.0, 2.0, 3.0, 4.0]).unwrap();
        let onehot = int_to_onehot(&dna);
        assert_eq!(onehot.dim(), (1, 5, 4));
        assert_eq!(onehot.slice(s![0, 0, ..]).to_vec(), vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(onehot.slice(s![0, 3, ..]).to_vec(), vec![0.0, 0.0, 0.0, 1.0]);
        // N stays all-zero
        assert_eq!(onehot.slice(s![0, 4, ..]).to_vec(), vec![0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_prepro_cpg_imputes_all_sentinels() {
        let states = vec![Array2::from_elem((4, 6), CPG_NAN)];
        let dists = vec![Array2::from_elem((4, 6), 100.0)];
        let out = prepro_cpg(states, dists, None, 25000.0, &mut rng()).unwrap();

        assert_eq!(out.states.dim(), (4, 1, 6));
        assert!(out.states.iter().all(|&v| v == 0.0 || v == 1.0));
        // imputed distances are exactly the cap, i.e. 1.0 after scaling
        assert!(out.dists.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_prepro_cpg_scales_observed_distances() {
        let states = vec![Array2::from_elem((2, 3), 1.0)];
        let dists = vec![Array2::from_shape_vec((2, 3), vec![0.0, 12500.0, 25000.0, 50000.0, 5000.0, 25000.0]).unwrap()];
        let out = prepro_cpg(states, dists, None, 25000.0, &mut rng()).unwrap();

        let d = out.dists.index_axis(Axis(1), 0).to_owned();
        assert_eq!(d[[0, 0]], 0.0);
        assert_eq!(d[[0, 1]], 0.5);
        assert_eq!(d[[0, 2]], 1.0);
        // clipped before scaling
        assert_eq!(d[[1, 0]], 1.0);
        assert!(out.dists.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_prepro_cpg_imputation_probability() {
        // 3 of 4 observed states are 1, sentinel draws should lean to 1
        let states = vec![Array2::from_shape_vec(
            (1, 8),
            vec![1.0, 1.0, 1.0, 0.0, CPG_NAN, CPG_NAN, CPG_NAN, CPG_NAN],
        )
        .unwrap()];
        let dists = vec![Array2::from_elem((1, 8), 10.0)];
        let out = prepro_cpg(states, dists, None, 25000.0, &mut rng()).unwrap();
        assert!(out.states.iter().all(|&v| v == 0.0 || v == 1.0));
    }

    #[test]
    fn test_prepro_cpg_seeded_determinism() {
        let build = || {
            (
                vec![Array2::from_elem((3, 5), CPG_NAN)],
                vec![Array2::from_elem((3, 5), 1.0)],
            )
        };
        let (s1, d1) = build();
        let (s2, d2) = build();
        let a = prepro_cpg(s1, d1, None, 100.0, &mut rng()).unwrap();
        let b = prepro_cpg(s2, d2, None, 100.0, &mut rng()).unwrap();
        assert_eq!(a.states, b.states);
    }

    #[test]
    fn test_prepro_cpg_centered_crop() {
        let states = vec![Array2::from_shape_fn((1, 10), |(_, j)| (j % 2) as f32)];
        let dists = vec![Array2::from_shape_fn((1, 10), |(_, j)| j as f32)];
        let out = prepro_cpg(states, dists, Some(4), 100.0, &mut rng()).unwrap();

        // center 5, delta 2: positions 3..7, exactly wlen wide (no +1 here)
        assert_eq!(out.states.dim(), (1, 1, 4));
        assert_eq!(out.dists[[0, 0, 0]], 3.0 / 100.0);
        assert_eq!(out.dists[[0, 0, 3]], 6.0 / 100.0);
    }

    #[test]
    fn test_prepro_cpg_replicate_count_mismatch() {
        let states = vec![Array2::<f32>::zeros((1, 4))];
        let dists = vec![];
        assert!(prepro_cpg(states, dists, None, 100.0, &mut rng()).is_err());
    }
}
