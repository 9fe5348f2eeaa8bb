use anyhow::Result;
use clap::Args;
use log::{info, warn};
use rayon::ThreadPoolBuilder;
use vfm_data::RatingTriplets;

use crate::cli::select_device;
use crate::config::{Grouping, KlScope, VfmConfig};
use crate::trainer::Trainer;

#[derive(Args, Debug)]
pub struct FitArgs {
    #[arg(
        short,
        long,
        help = "Training ratings: `user item rating` per line (tab, comma or space; .gz ok)"
    )]
    pub ratings: String,

    #[arg(short, long, help = "Held-out ratings in the same format")]
    pub test: Option<String>,

    #[arg(short = 'k', long, default_value_t = 8, help = "Latent rank (0 = linear)")]
    pub rank: usize,

    #[arg(long, default_value_t = 5e-3, help = "Weight on offset and group hyperprior KL")]
    pub lambda0: f32,

    #[arg(long, default_value_t = 5e-3, help = "Weight on feature bias KL")]
    pub lambda1: f32,

    #[arg(long, default_value_t = 5e-3, help = "Weight on feature latent-vector KL")]
    pub lambda2: f32,

    #[arg(short, long, default_value_t = 256)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 1e-2)]
    pub lr: f64,

    #[arg(short, long, default_value_t = 10)]
    pub epochs: usize,

    #[arg(long, help = "Drop the pairwise term (plain regularized regression)")]
    pub no_interactions: bool,

    #[arg(long, help = "One shared prior for users and items")]
    pub no_grouping: bool,

    #[arg(long, value_enum, default_value = "all", help = "Features entering the KL penalty of each batch")]
    pub kl_scope: KlScope,

    #[arg(long, default_value_t = -2.0, allow_hyphen_values = true, help = "Initial log standard deviation")]
    pub init_ln_std: f32,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(
        short,
        long,
        help = "Output prefix (creates {out}.safetensors, {out}.json, {out}.posterior.tsv.gz)"
    )]
    pub out: String,

    #[arg(
        long,
        default_value_t = 16,
        help = "Maximum number of threads",
        long_help = "Maximum number of threads for parsing and scoring. \n\
		     Choose the right number in HPC environments."
    )]
    pub max_threads: usize,

    #[arg(long)]
    pub gpu: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

impl FitArgs {
    fn config(&self, offset: f32) -> VfmConfig {
        VfmConfig {
            rank: self.rank,
            interactions: !self.no_interactions,
            lambda0: self.lambda0,
            lambda1: self.lambda1,
            lambda2: self.lambda2,
            batch_size: self.batch_size,
            learning_rate: self.lr,
            epochs: self.epochs,
            grouping: if self.no_grouping {
                Grouping::Disabled
            } else {
                Grouping::Enabled
            },
            kl_scope: self.kl_scope,
            init_ln_std: self.init_ln_std,
            init_offset_mean: offset,
            seed: self.seed,
            show_progress: true,
            verbose: self.verbose,
        }
    }
}

pub fn run(args: &FitArgs) -> Result<()> {
    let max_threads = num_cpus::get().min(args.max_threads).max(1);
    ThreadPoolBuilder::new()
        .num_threads(max_threads)
        .build_global()?;
    info!("will use {} threads", rayon::current_num_threads());

    let device = select_device(args.gpu);
    info!("Using device: {:?}", device);

    let train = RatingTriplets::read(&args.ratings)?;
    if train.is_empty() {
        anyhow::bail!("no ratings in {}", args.ratings);
    }

    let test = match args.test.as_ref() {
        Some(file) => {
            let test = RatingTriplets::read_with_vocab(file, &train.users, &train.items)?;
            if test.is_empty() {
                warn!("no held-out ratings of known users/items in {}", file);
                None
            } else {
                Some(test)
            }
        }
        None => None,
    };

    let config = args.config(train.mean_rating());
    info!(
        "rank {}, interactions {}, lambda = ({}, {}, {}), grouping {:?}, kl over {:?}",
        config.effective_rank(),
        config.use_interactions(),
        config.lambda0,
        config.lambda1,
        config.lambda2,
        config.grouping,
        config.kl_scope
    );

    let mut train_data = train.to_data()?;
    let test_data = test.as_ref().map(|t| t.to_data()).transpose()?;

    let mut trainer = Trainer::new(config, device)?;
    trainer.initialize(&train.schema())?;

    let trace = trainer.fit_with(&mut train_data, |trainer, report| {
        match test_data.as_ref() {
            Some(test_data) => {
                let test_rmse = trainer.rmse(test_data)?;
                info!(
                    "[{}] train rmse: {:.4}, test rmse: {:.4}, loss: {:.4}",
                    report.epoch + 1,
                    report.rmse,
                    test_rmse,
                    report.loss
                )
            }
            None => info!(
                "[{}] train rmse: {:.4}, loss: {:.4}",
                report.epoch + 1,
                report.rmse,
                report.loss
            ),
        }
        Ok(())
    })?;
    info!("Trained {} epochs", trace.len());

    let model = trainer
        .into_model()?
        .with_vocabulary(train.users.clone(), train.items.clone())?;

    info!("train rmse at the posterior mean: {:.4}", model.rmse(&train_data)?);
    if let Some(test_data) = test_data.as_ref() {
        info!("test rmse at the posterior mean: {:.4}", model.rmse(test_data)?);
    }

    model.save(&args.out)?;
    model.write_posterior(&format!("{}.posterior.tsv.gz", args.out))?;

    info!("Done");
    Ok(())
}
