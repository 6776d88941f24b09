use anyhow::{Context, Result};

use forkrpc::Session;

use crate::config::MergedConfig;

/// Spawn the configured server and wait for it to become ready
pub async fn open_session(config: &MergedConfig) -> Result<Session> {
    let session = config
        .command()
        .spawn()
        .await
        .with_context(|| format!("failed to start server {}", config.program.display()))?;
    tracing::debug!(pid = session.pid(), "session open");
    Ok(session)
}

/// Shut the server down, keeping the first error if the command already failed
pub async fn close_session<T>(session: Session, result: Result<T>) -> Result<T> {
    let closed = session.shutdown().await.context("failed to shut down server");
    let value = result?;
    closed?;
    Ok(value)
}
