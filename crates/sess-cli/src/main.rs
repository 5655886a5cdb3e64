use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sess_cli::commands::{check_config, run};
use sess_cli::{Cli, Commands, Config};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with verbose flag support
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Logs go to stderr; stdout carries session records
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let load_config = || -> Result<Config> {
        let config = Config::load_from(cli.config.as_deref())
            .context("failed to load configuration")?;
        tracing::debug!(?config, "loaded configuration");
        Ok(config)
    };

    match &cli.command {
        Some(Commands::Run(args)) => {
            run::run(args, load_config()?)?;
        }
        Some(Commands::CheckConfig) => {
            check_config::run(&mut std::io::stdout().lock(), &load_config()?)?;
        }
        None => {
            // No subcommand, show help
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}
