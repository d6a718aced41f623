use clap::Parser;
use slotfill_trainer::cli::Cli;
use slotfill_trainer::{init_logging, run};

fn main() {
    let cli = Cli::parse();
    init_logging();

    if let Err(e) = run(cli) {
        eprintln!("Training failed: {e:#}");
        std::process::exit(1);
    }
}
