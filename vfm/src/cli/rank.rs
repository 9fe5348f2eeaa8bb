use anyhow::Result;
use clap::Args;
use log::info;
use vfm_data::common_io::write_types;

use crate::cli::select_device;
use crate::model::TrainedModel;

#[derive(Args, Debug)]
pub struct RankArgs {
    #[arg(short, long, help = "Model prefix written by `vfm fit`")]
    pub model: String,

    #[arg(short, long, help = "User name")]
    pub user: String,

    #[arg(
        short,
        long,
        value_delimiter = ',',
        help = "Candidate item names (default: every item)"
    )]
    pub items: Vec<String>,

    #[arg(short, long, help = "Report only the top N items")]
    pub top: Option<usize>,

    #[arg(short, long, default_value = "stdout", help = "Output file")]
    pub output: String,

    #[arg(long)]
    pub gpu: bool,
}

pub fn run(args: &RankArgs) -> Result<()> {
    let device = select_device(args.gpu);
    let model = TrainedModel::load(&args.model, &device)?;

    let (Some(layout), Some(users), Some(items)) = (model.layout(), model.users(), model.items())
    else {
        anyhow::bail!("{} carries no user/item names", args.model);
    };

    let user = users
        .get(&args.user)
        .ok_or_else(|| anyhow::anyhow!("unknown user {}", args.user))?;

    let candidates: Vec<usize> = if args.items.is_empty() {
        (0..items.len()).collect()
    } else {
        args.items
            .iter()
            .map(|name| {
                items
                    .get(name)
                    .ok_or_else(|| anyhow::anyhow!("unknown item {}", name))
            })
            .collect::<Result<_>>()?
    };
    info!("Scoring {} items for user {}", candidates.len(), args.user);

    let features = candidates
        .iter()
        .map(|&i| layout.item_feature(i))
        .collect::<Result<Vec<_>>>()?;

    let mut ranked = model.variance_rank(layout.user_feature(user)?, &features)?;
    if let Some(top) = args.top {
        ranked.truncate(top);
    }

    let lines: Vec<String> = ranked
        .into_iter()
        .map(|(f, variance)| {
            let name = items.name(f - layout.num_users).unwrap_or_default();
            format!("{}\t{}\t{}", args.user, name, variance)
        })
        .collect();

    write_types(&lines, &args.output)?;
    Ok(())
}
