use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use forkrpc::{Command, SessionConfig, StdioConfig};

use crate::cli::SessionArgs;

/// Program used when neither the command line nor the config file names one
const DEFAULT_SERVER: &str = "forkrpc-echo";

/// TOML config file structure
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// How to start the server
    pub server: ServerSection,

    /// Session timeouts and limits
    pub session: SessionSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub program: Option<PathBuf>,
    pub args: Option<Vec<String>>,
    pub env: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSection {
    pub shutdown_timeout_ms: Option<u64>,
    pub exit_grace_ms: Option<u64>,
    pub stderr_capacity: Option<usize>,
    pub max_frame_len: Option<u32>,
    pub forward_stderr: Option<bool>,
}

/// Merged configuration from file + CLI
#[derive(Debug)]
pub struct MergedConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub session: SessionConfig,
}

impl MergedConfig {
    /// A command that starts the configured server
    pub fn command(&self) -> Command {
        Command::new(self.program.to_string_lossy())
            .args(&self.args)
            .envs(&self.env)
            .stdout(StdioConfig::Null)
            .config(self.session.clone())
    }
}

/// Load config from file
pub fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            let config: FileConfig = toml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?;
            Ok(config)
        }
        None => Ok(FileConfig::default()),
    }
}

/// Merge file config with CLI args (CLI takes precedence)
pub fn merge_config(file: FileConfig, cli: &SessionArgs) -> Result<MergedConfig> {
    // Program: CLI > file > sibling binary > PATH
    let program = cli
        .server
        .clone()
        .or(file.server.program)
        .unwrap_or_else(default_server);

    // Arguments: file first, then CLI
    let mut args = file.server.args.unwrap_or_default();
    args.extend(cli.server_args.iter().cloned());

    // Environment: CLI overrides file per key
    let mut env = file.server.env.unwrap_or_default();
    for env_str in &cli.envs {
        if let Some((key, value)) = env_str.split_once('=') {
            env.insert(key.to_string(), value.to_string());
        } else {
            anyhow::bail!("invalid env format (expected KEY=VALUE): {}", env_str);
        }
    }

    let session = build_session_config(&file.session, cli)?;

    Ok(MergedConfig {
        program,
        args,
        env,
        session,
    })
}

fn build_session_config(file: &SessionSection, cli: &SessionArgs) -> Result<SessionConfig> {
    let mut builder = SessionConfig::builder();

    if let Some(ms) = cli.shutdown_timeout_ms.or(file.shutdown_timeout_ms) {
        builder = builder.shutdown_timeout(Duration::from_millis(ms));
    }

    if let Some(ms) = cli.exit_grace_ms.or(file.exit_grace_ms) {
        builder = builder.exit_grace(Duration::from_millis(ms));
    }

    if let Some(bytes) = file.stderr_capacity {
        builder = builder.stderr_capacity(bytes);
    }

    if let Some(bytes) = file.max_frame_len {
        if bytes == 0 {
            anyhow::bail!("max_frame_len must be positive");
        }
        builder = builder.max_frame_len(bytes);
    }

    let forward_stderr = cli.forward_stderr || file.forward_stderr.unwrap_or(false);
    builder = builder.forward_stderr(forward_stderr);

    Ok(builder.build())
}

fn default_server() -> PathBuf {
    std::env::current_exe()
        .ok()
        .map(|exe| exe.with_file_name(DEFAULT_SERVER))
        .filter(|sibling| sibling.is_file())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVER))
}
