pub mod fit;
pub mod rank;

use candle_core::Device;
use clap::{Parser, Subcommand};

pub use fit::FitArgs;
pub use rank::RankArgs;

#[derive(Parser)]
#[command(name = "vfm")]
#[command(
    version,
    about = "Variational factorization machines",
    long_about = "Fit a factorization machine with hierarchical Gaussian priors\n\
		  by stochastic variational inference on (user, item, rating)\n\
		  triplets, and rank unlabelled pairs by predictive variance."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fit a model on rating triplets
    Fit(FitArgs),
    /// Rank items for a user by predictive variance
    Rank(RankArgs),
}

/// CUDA or Metal device 0 when asked for and compiled in, CPU
/// otherwise
pub fn select_device(gpu: bool) -> Device {
    if !gpu {
        return Device::Cpu;
    }
    if cfg!(feature = "metal") {
        Device::new_metal(0).unwrap_or(Device::Cpu)
    } else {
        Device::new_cuda(0).unwrap_or(Device::Cpu)
    }
}
