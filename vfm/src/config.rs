use serde::{Deserialize, Serialize};

use crate::error::{Result, VfmError};

/// Whether features share a prior with their own group or with
/// every other feature
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum Grouping {
    Enabled,
    Disabled,
}

/// Which feature parameters enter the KL penalty of a batch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum KlScope {
    /// Every feature, every batch
    All,
    /// Only the distinct features active in the batch
    Active,
}

/// Model and training knobs
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VfmConfig {
    /// Latent dimension k; zero means linear regression
    pub rank: usize,
    pub interactions: bool,
    /// Weight on the offset and group hyperprior KL terms
    pub lambda0: f32,
    /// Weight on the feature bias KL terms
    pub lambda1: f32,
    /// Weight on the feature latent-vector KL terms
    pub lambda2: f32,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub epochs: usize,
    pub grouping: Grouping,
    pub kl_scope: KlScope,
    /// Starting log standard deviation of every feature parameter
    pub init_ln_std: f32,
    pub init_offset_mean: f32,
    pub seed: u64,
    pub show_progress: bool,
    pub verbose: bool,
}

impl Default for VfmConfig {
    fn default() -> Self {
        Self {
            rank: 8,
            interactions: true,
            lambda0: 5e-3,
            lambda1: 5e-3,
            lambda2: 5e-3,
            batch_size: 256,
            learning_rate: 1e-2,
            epochs: 10,
            grouping: Grouping::Enabled,
            kl_scope: KlScope::All,
            init_ln_std: -2.0,
            init_offset_mean: 0.0,
            seed: 42,
            show_progress: false,
            verbose: false,
        }
    }
}

impl VfmConfig {
    /// Reject invalid knob combinations before anything is built
    pub fn validate(&self) -> Result<()> {
        for (name, lambda) in [
            ("lambda0", self.lambda0),
            ("lambda1", self.lambda1),
            ("lambda2", self.lambda2),
        ] {
            if !lambda.is_finite() || lambda < 0.0 {
                return Err(VfmError::config(format!(
                    "{} must be finite and non-negative, got {}",
                    name, lambda
                )));
            }
        }
        if self.batch_size == 0 {
            return Err(VfmError::config("batch_size must be positive"));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(VfmError::config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.epochs == 0 {
            return Err(VfmError::config("epochs must be positive"));
        }
        if !self.init_ln_std.is_finite() || !self.init_offset_mean.is_finite() {
            return Err(VfmError::config("initial values must be finite"));
        }
        if self.rank > 0 && !self.interactions && self.lambda2 > 0.0 {
            return Err(VfmError::config(format!(
                "rank {} with interactions disabled leaves latent vectors unused, \
                 but lambda2 = {} penalizes them",
                self.rank, self.lambda2
            )));
        }
        Ok(())
    }

    /// Whether the pairwise term is part of the model
    pub fn use_interactions(&self) -> bool {
        self.rank > 0 && self.interactions
    }

    /// Rank of the latent vectors actually carried by the model
    pub fn effective_rank(&self) -> usize {
        if self.use_interactions() {
            self.rank
        } else {
            0
        }
    }
}
