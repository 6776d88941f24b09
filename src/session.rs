//! Client side of a control channel

use std::future::Future;
use std::process::{ChildStdin, ChildStdout};
use std::sync::Arc;

use crate::channel::{Endpoint, Frame, WIRE_VERSION};
use crate::config::SessionConfig;
use crate::conversation::{Conversation, Link, Role};
use crate::error::{Error, Result};
use crate::process::{Supervisor, Termination};

/// A running server process and the control channel to it
///
/// Created by [`Command::spawn`](crate::Command::spawn). Dropping a session
/// that was not shut down kills the server.
pub struct Session {
    link: Arc<Link>,
    supervisor: Arc<Supervisor>,
    config: SessionConfig,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
}

impl Session {
    pub(crate) fn new(endpoint: Endpoint, supervisor: Arc<Supervisor>, config: SessionConfig) -> Self {
        let link = Arc::new(Link::new(
            Role::Client,
            endpoint,
            Some(Arc::clone(&supervisor)),
            config.exit_grace(),
        ));

        Self {
            link,
            supervisor,
            config,
            stdin: None,
            stdout: None,
        }
    }

    pub(crate) fn set_stdio(&mut self, stdin: Option<ChildStdin>, stdout: Option<ChildStdout>) {
        self.stdin = stdin;
        self.stdout = stdout;
    }

    /// Wait for the server's first frame, check its wire version, and answer
    /// with our own frame limit
    pub(crate) async fn handshake(&self) -> Result<()> {
        let peer_max = match self.link.recv_frame().await? {
            Frame::Ready {
                version: WIRE_VERSION,
                max_frame_len,
            } => max_frame_len,
            Frame::Ready { version, .. } => {
                return Err(Error::Protocol(format!(
                    "server speaks wire version {version}, expected {WIRE_VERSION}"
                )));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "expected ready frame, got {other:?}"
                )));
            }
        };

        self.link.limit_frame_len(peer_max).await;
        self.link
            .send_frame(&Frame::Ready {
                version: WIRE_VERSION,
                max_frame_len: self.config.max_frame_len(),
            })
            .await?;

        tracing::debug!(pid = self.pid(), max_frame_len = peer_max, "server ready");
        Ok(())
    }

    /// Run `f` inside a fresh conversation scope
    ///
    /// Scopes on one session run one at a time. The [`Conversation`] handle is
    /// only valid until `f`'s future completes.
    ///
    /// ```rust,ignore
    /// let answer: String = session
    ///     .converse(|conv| async move { conv.call(&Request::Echo("hi".into())).await })
    ///     .await?;
    /// ```
    pub async fn converse<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Conversation) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.link.converse(f).await
    }

    /// Ask the server to exit, killing it if it does not within the shutdown timeout
    ///
    /// Afterwards every operation fails with [`Error::ManualShutdown`]. Calling
    /// this again is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.link.begin_shutdown() {
            return Ok(());
        }

        let pid = self.pid();
        if let Err(e) = self.link.send_shutdown().await {
            tracing::debug!(pid, error = %e, "failed to send shutdown request");
        }

        let timeout = self.config.shutdown_timeout();
        let termination = match self.supervisor.wait(Some(timeout)).await {
            Some(termination) => Some(termination),
            None => {
                tracing::warn!(
                    pid,
                    timeout_ms = timeout.as_millis() as u64,
                    "server did not exit in time, killing it"
                );
                self.supervisor.kill();
                self.supervisor.wait(None).await
            }
        };

        self.link.finish_shutdown();
        tracing::debug!(pid, ?termination, "server shut down");
        Ok(())
    }

    pub fn pid(&self) -> u32 {
        self.supervisor.pid()
    }

    /// How the server ended, if it has
    pub fn termination(&self) -> Option<Termination> {
        self.supervisor.termination()
    }

    /// The most recent stderr output of the server
    pub fn stderr_tail(&self) -> String {
        self.supervisor.stderr_tail()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Take ownership of the server's stdin, when it was configured as piped
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Take ownership of the server's stdout, when it was configured as piped
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.link.is_shut_down() {
            self.supervisor.kill();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("pid", &self.pid())
            .field("termination", &self.termination())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::Command;
    use crate::error::ErrorKind;

    /// A ready frame for wire version `v` and a 64 MiB limit, as printf escapes
    fn ready_frame(v: u8) -> String {
        format!(
            r"\000\000\000\022R\004\000\000\000\000\000\000\000\000\000\000\000\{v:03o}\004\000\000\000"
        )
    }

    /// A shell "server" that says ready and then ignores the channel
    fn silent_server(version: u8) -> Command {
        // With `sh -c`, the suffix lands in $0..$3; $3 is the response descriptor.
        let script = format!("printf '{}' >&$3; exec sleep 30", ready_frame(version));
        Command::new("/bin/sh").args(["-c", script.as_str()]).config(
            SessionConfig::builder()
                .shutdown_timeout(Duration::from_millis(100))
                .build(),
        )
    }

    #[tokio::test]
    async fn test_shutdown_kills_unresponsive_server() {
        let session = silent_server(1).spawn().await.unwrap();
        assert_eq!(session.termination(), None);

        session.shutdown().await.unwrap();
        assert_eq!(
            session.termination(),
            Some(Termination::Signaled(libc::SIGKILL))
        );

        for _ in 0..2 {
            let err = session
                .converse(|conv| async move { conv.put(&1u8).await })
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ManualShutdown);
        }

        // Second shutdown does nothing.
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_version_mismatch_is_protocol_error() {
        let err = silent_server(2).spawn().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_drop_kills_server() {
        let session = silent_server(1).spawn().await.unwrap();
        let supervisor = Arc::clone(&session.supervisor);

        drop(session);
        assert_eq!(
            supervisor.wait(Some(Duration::from_secs(5))).await,
            Some(Termination::Signaled(libc::SIGKILL))
        );
    }
}
