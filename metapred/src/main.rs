use clap::{Parser, Subcommand};
use log::info;
use metapred::cli::*;
use metapred::driver;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "MetaPred",
    long_about = "Meta-learning clinical risk prediction from electronic health records.\n\
		  A classifier (mlp, cnn, rnn) is meta-trained with MAML on source tasks\n\
		  and a simulated target task, then tested on the true target task\n\
		  fold by fold, optionally after fine-tuning."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Meta-train, fine-tune and test over cross-validation folds",
        long_about = "Run the MetaPred pipeline for every fold: \n\
		      (1) Meta-train on source support / simulated target query episodes\n\
		      (2) Optionally fine-tune on the true target\n\
		      (3) Test on the true target's held-out fold.\n\
		      The mean and std of AUROC, AP and F1 across folds are written\n\
		      to {results_dir}/res_{exp}.\n"
    )]
    Run(RunArgs),

    /// write synthetic cohorts in the input format
    Simulate(SimulateArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let verbose = match &cli.commands {
        Commands::Run(args) => args.verbose,
        Commands::Simulate(args) => args.verbose,
    };
    if verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    match &cli.commands {
        Commands::Run(args) => {
            let config = args.to_config()?;
            let outcome = driver::run(&config)?;
            if let Some(file) = outcome.results_file {
                info!("wrote {}", file.display());
            }
        }
        Commands::Simulate(args) => {
            ehr_data::simulate::generate_ehr_data(args.tasks(), &args.sim_args(), args.out())?;
        }
    }

    info!("Done");
    Ok(())
}
