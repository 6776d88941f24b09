use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "forkrpc")]
#[command(version)]
#[command(about = "Talk to a forkrpc demo server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send text and print the echo
    Echo(EchoArgs),

    /// Count down from N to zero, one response per number
    Count(CountArgs),

    /// Run ticking work on the server and stream its output
    Run(RunArgs),

    /// Read or change an environment variable in the server
    Env(EnvArgs),

    /// Count down, then make the server exit mid-stream
    Crash(CrashArgs),
}

#[derive(Args)]
pub struct EchoArgs {
    /// Text to send (each argument is a separate request)
    #[arg(required = true)]
    pub text: Vec<String>,
}

#[derive(Args)]
pub struct CountArgs {
    pub from: u32,
}

#[derive(Args)]
pub struct RunArgs {
    /// Number of ticks to run
    #[arg(long, default_value_t = 10)]
    pub ticks: u32,

    /// Milliseconds between ticks
    #[arg(long, default_value_t = 100)]
    pub tick_ms: u64,

    /// Interrupt the work after this many lines of output
    #[arg(long)]
    pub interrupt_after: Option<u32>,
}

#[derive(Args)]
pub struct EnvArgs {
    /// Variable name
    pub key: String,

    /// Set the variable to this value before reading it back
    #[arg(long, conflicts_with = "unset")]
    pub set: Option<String>,

    /// Remove the variable before reading it back
    #[arg(long)]
    pub unset: bool,
}

#[derive(Args)]
pub struct CrashArgs {
    /// Number to count down from
    #[arg(long, default_value_t = 5)]
    pub from: u32,

    /// Responses to send before exiting
    #[arg(long, default_value_t = 2)]
    pub after: u32,
}

/// How to start the server and run the session
#[derive(Args, Default)]
pub struct SessionArgs {
    /// Server program (defaults to forkrpc-echo next to this binary)
    #[arg(long, global = true, env = "FORKRPC_SERVER")]
    pub server: Option<PathBuf>,

    /// Argument passed to the server program (can be repeated)
    #[arg(long = "server-arg", global = true, allow_hyphen_values = true)]
    pub server_args: Vec<String>,

    /// Environment variable for the server (KEY=VALUE, can be repeated)
    #[arg(long = "env", short = 'e', global = true)]
    pub envs: Vec<String>,

    /// Milliseconds to wait for the server to exit on shutdown
    #[arg(long, global = true)]
    pub shutdown_timeout_ms: Option<u64>,

    /// Milliseconds to wait for an exit status after the channel breaks
    #[arg(long, global = true)]
    pub exit_grace_ms: Option<u64>,

    /// Copy the server's stderr to ours as it arrives
    #[arg(long, global = true)]
    pub forward_stderr: bool,
}
