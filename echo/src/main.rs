//! Demo forkrpc server
//!
//! Spawned by a forkrpc client, never run by hand:
//!   forkrpc-echo [--verbose] [--echo-prefix P] --forkrpc <version> <request-fd> <response-fd>

use std::process::ExitCode;

use clap::Parser;
use forkrpc::{Server, ServerArgs};
use forkrpc_echo::EchoServer;

/// Demo server answering forkrpc_echo::Request
#[derive(Parser)]
#[command(name = "forkrpc-echo")]
struct Cli {
    /// Enable debug logging on stderr
    #[arg(short, long, env = "FORKRPC_ECHO_VERBOSE")]
    verbose: bool,

    /// Text prepended to every echoed string
    #[arg(long, default_value = "")]
    echo_prefix: String,
}

fn main() -> ExitCode {
    let args = match ServerArgs::from_env() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("forkrpc-echo is started by a forkrpc client");
            return ExitCode::FAILURE;
        }
    };
    let cli = Cli::parse_from(args.app_command_line());

    // stdout may be captured by requests, so logs go to stderr
    let filter = if cli.verbose {
        "forkrpc=debug,forkrpc_echo=debug"
    } else {
        "forkrpc=warn,forkrpc_echo=info"
    };
    // The client reports this stream as plain diagnostic text.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let result = smol::block_on(async {
        let server = Server::start(args).await?;
        server.serve(EchoServer::new(cli.echo_prefix)).await
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server stopped");
            ExitCode::FAILURE
        }
    }
}
