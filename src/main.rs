mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => commands::version::run(),
        Commands::Check { config } => commands::check::run(config.as_deref()).await?,
        Commands::Run {
            config,
            port,
            lease_name,
        } => {
            commands::run::run(commands::run::RunArgs {
                config,
                port,
                lease_name,
            })
            .await?;
        }
    }

    Ok(())
}
