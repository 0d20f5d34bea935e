//! Synthetic dataset of hierarchical features
//!
//! Every parent feature is a random unit vector with two children, each the
//! parent plus a fixed random perturbation of norm `perturbation_size`. A
//! sample activates exactly `k` distinct parents and sums one randomly chosen
//! child of each.

use anyhow::Result;
use ndarray::{s, Array2, Array3, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Children per parent feature
pub const N_CHILDREN_PER_PARENT: usize = 2;

/// Which features fire in a batch and which child each one uses
#[derive(Debug, Clone)]
pub struct ToySample {
    /// `[batch, n_features]`
    pub activations: Array2<bool>,
    /// `[batch, n_features]`, values in `0..N_CHILDREN_PER_PARENT`
    pub perturbation_choices: Array2<usize>,
}

pub struct ToyDataset {
    /// Unit-norm parent features `[n_features, model_dim]`
    pub features: Array2<f32>,
    /// `[n_features, N_CHILDREN_PER_PARENT, model_dim]`
    pub perturbations: Array3<f32>,
    k: usize,
    rng: StdRng,
}

impl ToyDataset {
    pub fn new(
        num_features: usize,
        perturbation_size: f32,
        model_dim: usize,
        k: usize,
        seed: u64,
    ) -> Result<Self> {
        anyhow::ensure!(num_features > 0 && model_dim > 0, "Empty toy dataset");
        anyhow::ensure!(
            k <= num_features,
            "Cannot activate {k} of {num_features} features"
        );
        let mut rng = StdRng::seed_from_u64(seed);

        let mut features = Array2::from_shape_fn((num_features, model_dim), |_| {
            rng.sample::<f32, _>(StandardNormal)
        });
        for mut row in features.rows_mut() {
            let norm = row.dot(&row).sqrt();
            row.mapv_inplace(|v| v / norm);
        }

        let mut perturbations = Array3::from_shape_fn(
            (num_features, N_CHILDREN_PER_PARENT, model_dim),
            |_| rng.sample::<f32, _>(StandardNormal),
        );
        for mut lane in perturbations.lanes_mut(Axis(2)) {
            let norm = lane.dot(&lane).sqrt();
            lane.mapv_inplace(|v| perturbation_size * v / norm);
        }

        Ok(Self {
            features,
            perturbations,
            k,
            rng,
        })
    }

    pub fn n_features(&self) -> usize {
        self.features.nrows()
    }

    pub fn model_dim(&self) -> usize {
        self.features.ncols()
    }

    /// Draw which features fire and which children they use.
    pub fn sample(&mut self, batch_size: usize) -> ToySample {
        let n = self.n_features();
        let mut activations = Array2::from_elem((batch_size, n), false);
        for mut row in activations.rows_mut() {
            for j in rand::seq::index::sample(&mut self.rng, n, self.k) {
                row[j] = true;
            }
        }
        let perturbation_choices = Array2::from_shape_fn((batch_size, n), |_| {
            self.rng.gen_range(0..N_CHILDREN_PER_PARENT)
        });
        ToySample {
            activations,
            perturbation_choices,
        }
    }

    /// Generate `batch_size` samples `[batch, model_dim]` and the number of active features.
    pub fn generate(&mut self, batch_size: usize) -> Result<(Array2<f32>, usize)> {
        let sample = self.sample(batch_size);
        let n_active = sample.activations.iter().filter(|&&a| a).count();
        let result = compute_result_vectorized(&sample, &self.features, &self.perturbations)?;
        Ok((result, n_active))
    }
}

fn check_shapes(sample: &ToySample, features: &Array2<f32>, perturbations: &Array3<f32>) -> Result<()> {
    let (n, d) = features.dim();
    anyhow::ensure!(
        sample.activations.ncols() == n && sample.perturbation_choices.dim() == sample.activations.dim(),
        "Sample shape doesn't match {n} features"
    );
    anyhow::ensure!(
        perturbations.dim() == (n, N_CHILDREN_PER_PARENT, d),
        "Perturbations must be [{n}, {N_CHILDREN_PER_PARENT}, {d}]"
    );
    anyhow::ensure!(
        sample.perturbation_choices.iter().all(|&c| c < N_CHILDREN_PER_PARENT),
        "Perturbation choice out of range"
    );
    Ok(())
}

/// Sum of perturbed active features, one feature at a time.
pub fn compute_result(
    sample: &ToySample,
    features: &Array2<f32>,
    perturbations: &Array3<f32>,
) -> Result<Array2<f32>> {
    check_shapes(sample, features, perturbations)?;
    let (batch, n) = sample.activations.dim();
    let mut result = Array2::zeros((batch, features.ncols()));
    for i in 0..batch {
        for j in 0..n {
            if sample.activations[[i, j]] {
                let child = sample.perturbation_choices[[i, j]];
                let perturbed = &features.row(j) + &perturbations.slice(s![j, child, ..]);
                let mut out = result.row_mut(i);
                out += &perturbed;
            }
        }
    }
    Ok(result)
}

/// Same as [`compute_result`], as one matrix product.
pub fn compute_result_vectorized(
    sample: &ToySample,
    features: &Array2<f32>,
    perturbations: &Array3<f32>,
) -> Result<Array2<f32>> {
    check_shapes(sample, features, perturbations)?;
    let (batch, n) = sample.activations.dim();
    let d = features.ncols();
    let weights = sample.activations.mapv(|a| if a { 1.0f32 } else { 0.0 });

    // Parents contribute independently of the chosen child
    let mut result = weights.dot(features);

    // Child perturbations: one [batch, n] weight matrix per child
    for child in 0..N_CHILDREN_PER_PARENT {
        let chosen = Array2::from_shape_fn((batch, n), |(i, j)| {
            if sample.perturbation_choices[[i, j]] == child {
                weights[[i, j]]
            } else {
                0.0
            }
        });
        let child_dirs = perturbations.slice(s![.., child, ..]);
        result += &chosen.dot(&child_dirs);
    }
    debug_assert_eq!(result.dim(), (batch, d));
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_features_are_unit_norm_and_perturbations_sized() {
        let ds = ToyDataset::new(6, 0.3, 8, 2, 0).unwrap();
        for row in ds.features.rows() {
            assert!((row.dot(&row).sqrt() - 1.0).abs() < 1e-5);
        }
        for lane in ds.perturbations.lanes(Axis(2)) {
            assert!((lane.dot(&lane).sqrt() - 0.3).abs() < 1e-5);
        }
    }

    #[test]
    fn test_features_are_seeded_normal_draws() {
        let ds = ToyDataset::new(3, 0.2, 5, 1, 9).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let first: Vec<f32> = (0..5).map(|_| rng.sample(StandardNormal)).collect();
        let norm = first.iter().map(|v| v * v).sum::<f32>().sqrt();
        for (got, raw) in ds.features.row(0).iter().zip(&first) {
            assert!((got - raw / norm).abs() < 1e-6);
        }

        let same = ToyDataset::new(3, 0.2, 5, 1, 9).unwrap();
        assert_eq!(ds.features, same.features);
        assert_eq!(ds.perturbations, same.perturbations);
        let other = ToyDataset::new(3, 0.2, 5, 1, 10).unwrap();
        assert_ne!(ds.features, other.features);
    }

    #[test]
    fn test_sample_activates_exactly_k() {
        let mut ds = ToyDataset::new(10, 0.1, 4, 3, 1).unwrap();
        let sample = ds.sample(20);
        for row in sample.activations.rows() {
            assert_eq!(row.iter().filter(|&&a| a).count(), 3);
        }
        assert!(sample.perturbation_choices.iter().all(|&c| c < N_CHILDREN_PER_PARENT));

        let (result, n_active) = ds.generate(5).unwrap();
        assert_eq!(result.dim(), (5, 4));
        assert_eq!(n_active, 15);
    }

    #[test]
    fn test_loop_and_vectorized_agree() {
        let mut ds = ToyDataset::new(12, 0.5, 7, 4, 42).unwrap();
        let sample = ds.sample(9);
        let a = compute_result(&sample, &ds.features, &ds.perturbations).unwrap();
        let b = compute_result_vectorized(&sample, &ds.features, &ds.perturbations).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-4, "{x} != {y}");
        }
    }

    #[test]
    fn test_seed_is_reproducible() {
        let mut a = ToyDataset::new(5, 0.2, 3, 2, 9).unwrap();
        let mut b = ToyDataset::new(5, 0.2, 3, 2, 9).unwrap();
        assert_eq!(a.features, b.features);
        assert_eq!(a.generate(4).unwrap().0, b.generate(4).unwrap().0);
    }

    #[test]
    fn test_rejects_too_many_active() {
        assert!(ToyDataset::new(3, 0.1, 2, 4, 0).is_err());
    }
}
