mod cli;
mod commands;
mod prompt;

use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let global = cli.global;
    match cli.command {
        Commands::Run(args) => commands::run::execute(args, &global).await,
        Commands::Relay(args) => commands::relay::execute(args, &global).await,
        Commands::Settings(args) => commands::settings::execute(args, &global).await,
    }
}
