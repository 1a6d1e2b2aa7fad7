mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, CrdAction};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { metrics_addr, requeue_interval_secs } => {
            commands::run::run(metrics_addr, requeue_interval_secs).await?
        }
        Commands::Check => commands::check::run().await?,
        Commands::List { resource } => commands::list::run(resource).await?,
        Commands::Crd { action } => match action {
            CrdAction::Generate => commands::crd::generate()?,
            CrdAction::Install => commands::crd::install().await?,
        },
    }

    Ok(())
}
