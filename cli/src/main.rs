use std::process::ExitCode;

use clap::Parser;

mod cli;
mod commands;
mod config;
mod error;
mod session;

use cli::{Cli, Commands};
use config::{load_config, merge_config};
use error::{CliResult, to_exit_code};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing based on verbosity
    let filter = if cli.verbose {
        "forkrpc=debug,forkrpc_cli=debug"
    } else {
        "forkrpc=warn,forkrpc_cli=info"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let result = smol::block_on(async_main(cli));
    to_exit_code(result)
}

async fn async_main(cli: Cli) -> CliResult<()> {
    let file_config = load_config(cli.config.as_deref())?;
    let mut config = merge_config(file_config, &cli.session)?;
    if cli.verbose {
        config
            .env
            .entry("FORKRPC_ECHO_VERBOSE".to_string())
            .or_insert_with(|| "1".to_string());
    }

    match cli.command {
        Commands::Echo(args) => commands::echo::execute(args, config).await,
        Commands::Count(args) => commands::count::execute(args, config).await,
        Commands::Run(args) => commands::run::execute(args, config).await,
        Commands::Env(args) => commands::env::execute(args, config).await,
        Commands::Crash(args) => commands::crash::execute(args, config).await,
    }
}
