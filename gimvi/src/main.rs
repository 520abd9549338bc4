mod run_simulate;

use run_simulate::*;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    version,
    about = "gimVI",
    long_about = "Joint variational autoencoder of single-cell datasets\n\
		  measured on different gene panels. Every dataset gets its own\n\
		  encoder branch and decoder tail around a shared latent space,\n\
		  so genes missing from one panel can be imputed from another.\n"
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Fit the joint model on simulated unpaired datasets",
        long_about = "Simulate and fit in the three stages: \n\
		      (1) Draw a full-panel and a gene-subset dataset from one latent model\n\
		      (2) Estimate the joint encoder-decoder architecture via SGD\n\
		      (3) Report latent states and impute the held-out genes.\n"
    )]
    Simulate(SimulateArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Simulate(args) => {
            run_simulate(args)?;
        }
    }

    Ok(())
}
