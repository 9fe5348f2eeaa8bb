use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VfmError};

/// Posterior means and variances of one feature
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeaturePosterior {
    pub bias_mean: f32,
    pub bias_var: f32,
    /// empty for a linear model
    pub latent_mean: Vec<f32>,
    pub latent_var: Vec<f32>,
}

/// Frozen host copy of the whole parameter table
///
/// Latent vectors are row-major `num_features x rank`.
#[derive(Clone, Debug, PartialEq)]
pub struct Posterior {
    pub num_features: usize,
    pub rank: usize,
    pub offset_mean: f32,
    pub offset_var: f32,
    pub bias_mean: Vec<f32>,
    pub bias_var: Vec<f32>,
    pub latent_mean: Vec<f32>,
    pub latent_var: Vec<f32>,
}

impl Posterior {
    pub fn feature(&self, f: usize) -> Option<FeaturePosterior> {
        if f >= self.num_features {
            return None;
        }
        Some(FeaturePosterior {
            bias_mean: self.bias_mean[f],
            bias_var: self.bias_var[f],
            latent_mean: self.latent_mean_of(f).to_vec(),
            latent_var: self.latent_var_of(f).to_vec(),
        })
    }

    fn latent_mean_of(&self, f: usize) -> &[f32] {
        let k = self.rank;
        self.latent_mean.get(f * k..(f + 1) * k).unwrap_or(&[])
    }

    fn latent_var_of(&self, f: usize) -> &[f32] {
        let k = self.rank;
        self.latent_var.get(f * k..(f + 1) * k).unwrap_or(&[])
    }
}

/// Predictive variance of the pair (i, j) under the factorized
/// posterior
///
/// σ²_c + σ²_βi + σ²_βj + Σ_k ( σ²_ik σ²_jk + σ²_ik μ²_jk + σ²_jk μ²_ik )
///
/// The latent sum is the variance of a product of independent
/// Gaussians; it is empty for a linear model. Every sum pairs the
/// i and j terms first, so swapping them gives the same bits.
pub fn pair_variance(offset_var: f32, fi: &FeaturePosterior, fj: &FeaturePosterior) -> f32 {
    let latent: f32 = fi
        .latent_mean
        .iter()
        .zip(fi.latent_var.iter())
        .zip(fj.latent_mean.iter().zip(fj.latent_var.iter()))
        .map(|((&mi, &vi), (&mj, &vj))| vi * vj + (vi * mj * mj + vj * mi * mi))
        .sum();
    offset_var + (fi.bias_var + fj.bias_var) + latent
}

/// Scores (user, item) pairs by predictive variance for active
/// learning
pub struct UncertaintyScorer<'a> {
    posterior: &'a Posterior,
}

impl<'a> UncertaintyScorer<'a> {
    pub fn new(posterior: &'a Posterior) -> Self {
        Self { posterior }
    }

    fn feature(&self, f: usize) -> Result<FeaturePosterior> {
        self.posterior.feature(f).ok_or_else(|| {
            VfmError::shape(format!(
                "feature {} out of range for {} features",
                f, self.posterior.num_features
            ))
        })
    }

    /// Var[ŷ] for the row with features `i` and `j` active
    pub fn variance(&self, i: usize, j: usize) -> Result<f32> {
        let fi = self.feature(i)?;
        let fj = self.feature(j)?;
        Ok(pair_variance(self.posterior.offset_var, &fi, &fj))
    }

    /// Candidates sorted by descending variance of (`user`,
    /// candidate); equal scores go by ascending feature id
    ///
    /// * `user` - feature id of the user
    /// * `candidates` - feature ids of the items
    pub fn rank_candidates(&self, user: usize, candidates: &[usize]) -> Result<Vec<(usize, f32)>> {
        let fu = self.feature(user)?;
        let offset_var = self.posterior.offset_var;

        let mut scored = candidates
            .par_iter()
            .map(|&item| -> Result<(usize, f32)> {
                let fi = self.feature(item)?;
                Ok((item, pair_variance(offset_var, &fu, &fi)))
            })
            .collect::<Result<Vec<_>>>()?;

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// feature 0 is the user, 1..=4 are items
    fn injected() -> Posterior {
        Posterior {
            num_features: 5,
            rank: 2,
            offset_mean: 0.0,
            offset_var: 0.1,
            bias_mean: vec![0.0; 5],
            bias_var: vec![0.2, 0.5, 0.1, 0.3, 0.3],
            latent_mean: vec![
                1.0, 2.0, //
                0.0, 0.0, //
                1.0, 1.0, //
                0.5, 0.0, //
                0.5, 0.0, //
            ],
            latent_var: vec![
                0.5, 0.25, //
                0.1, 0.1, //
                0.2, 0.4, //
                0.1, 0.1, //
                0.1, 0.1, //
            ],
        }
    }

    #[test]
    fn variance_is_symmetric() -> Result<()> {
        let post = injected();
        let scorer = UncertaintyScorer::new(&post);
        for i in 0..5 {
            for j in 0..5 {
                assert_eq!(scorer.variance(i, j)?, scorer.variance(j, i)?);
            }
        }
        Ok(())
    }

    #[test]
    fn three_candidates_by_hand() -> Result<()> {
        let post = injected();
        let scorer = UncertaintyScorer::new(&post);

        // user (μ = [1, 2], σ² = [.5, .25], σ²_β = .2), σ²_c = .1
        // item 1: .1 + .2 + .5 + (.05 + 0 + .1) + (.025 + 0 + .4) = 1.375
        // item 2: .1 + .2 + .1 + (.1 + .5 + .2) + (.1 + .25 + 1.6) = 3.15
        // item 3: .1 + .2 + .3 + (.05 + .125 + .1) + (.025 + 0 + .4) = 1.3
        assert_abs_diff_eq!(scorer.variance(0, 1)?, 1.375, epsilon = 1e-5);
        assert_abs_diff_eq!(scorer.variance(0, 2)?, 3.15, epsilon = 1e-5);
        assert_abs_diff_eq!(scorer.variance(0, 3)?, 1.3, epsilon = 1e-5);

        let ranked = scorer.rank_candidates(0, &[1, 2, 3])?;
        let order: Vec<usize> = ranked.iter().map(|&(i, _)| i).collect();
        assert_eq!(order, vec![2, 1, 3]);
        Ok(())
    }

    #[test]
    fn ties_keep_ascending_candidate_order() -> Result<()> {
        let post = injected();
        let scorer = UncertaintyScorer::new(&post);
        // items 3 and 4 carry identical posteriors
        let ranked = scorer.rank_candidates(0, &[3, 4])?;
        assert_eq!(ranked[0].1, ranked[1].1);
        assert_eq!(ranked[0].0, 3);
        assert_eq!(ranked[1].0, 4);
        Ok(())
    }

    #[test]
    fn ties_ignore_the_order_of_candidates() -> Result<()> {
        let post = Posterior {
            num_features: 5,
            rank: 1,
            offset_mean: 0.0,
            offset_var: 0.01,
            bias_mean: vec![0.0; 5],
            bias_var: vec![0.1; 5],
            latent_mean: vec![0.0; 5],
            latent_var: vec![0.1; 5],
        };
        let scorer = UncertaintyScorer::new(&post);
        let ranked = scorer.rank_candidates(0, &[4, 3, 2])?;
        let order: Vec<usize> = ranked.iter().map(|&(i, _)| i).collect();
        assert_eq!(order, vec![2, 3, 4]);
        assert!(ranked.iter().all(|&(_, v)| v == ranked[0].1));
        Ok(())
    }

    #[test]
    fn unknown_feature_is_rejected() {
        let post = injected();
        let scorer = UncertaintyScorer::new(&post);
        assert!(matches!(
            scorer.rank_candidates(0, &[1, 9]),
            Err(VfmError::ShapeMismatch(_))
        ));
    }
}
