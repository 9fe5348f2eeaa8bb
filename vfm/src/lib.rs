//! Variational factorization machines
//!
//! A factorization machine whose biases and latent vectors carry
//! Gaussian posteriors under a two-level hierarchical prior, fitted by
//! stochastic variational inference with candle. The fitted posterior
//! gives a closed-form predictive variance, used to rank unlabelled
//! (user, item) pairs for active learning.

pub mod cli;
pub mod config;
pub mod elbo;
pub mod error;
pub mod hierarchical_prior;
pub mod interaction;
pub mod model;
pub mod parameter_table;
pub mod trainer;
pub mod uncertainty;
pub mod variational_gaussian;

pub use config::{Grouping, KlScope, VfmConfig};
pub use elbo::{ElboObjective, ElboTerms};
pub use error::{Result, VfmError};
pub use hierarchical_prior::GroupPrior;
pub use interaction::{fm_predict, BatchTensors, Draw, InteractionEngine};
pub use model::TrainedModel;
pub use parameter_table::ParameterTable;
pub use trainer::{train, EpochReport, StepReport, Trainer, TrainerState};
pub use uncertainty::{pair_variance, FeaturePosterior, Posterior, UncertaintyScorer};
pub use variational_gaussian::GaussianParam;
