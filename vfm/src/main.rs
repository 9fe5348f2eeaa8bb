use anyhow::Result;
use clap::Parser;
use vfm::cli::{fit, rank, Cli, Commands};

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Fit(args) => {
            fit::run(args)?;
        }
        Commands::Rank(args) => {
            rank::run(args)?;
        }
    }

    Ok(())
}
