use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use crate::channel::{Direction, Endpoint, WIRE_VERSION};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::process::{StdioConfig, Supervisor};
use crate::server::invocation_suffix;
use crate::session::Session;

/// A builder for server processes, similar to `std::process::Command`
///
/// Arguments given here are passed through untouched; the control channel
/// descriptors are appended after them when the process is spawned.
#[derive(Debug, Clone)]
pub struct Command {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, Option<String>)>,
    env_clear: bool,
    current_dir: Option<PathBuf>,
    stdin: StdioConfig,
    stdout: StdioConfig,
    config: SessionConfig,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            env_clear: false,
            current_dir: None,
            stdin: StdioConfig::Inherit,
            stdout: StdioConfig::Inherit,
            config: SessionConfig::default(),
        }
    }

    /// Add a single argument
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Add multiple arguments
    pub fn args(mut self, args: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    /// Set an environment variable
    pub fn env(mut self, key: impl AsRef<str>, val: impl AsRef<str>) -> Self {
        self.envs
            .push((key.as_ref().to_string(), Some(val.as_ref().to_string())));
        self
    }

    /// Set multiple environment variables
    pub fn envs(
        mut self,
        envs: impl IntoIterator<Item = (impl AsRef<str>, impl AsRef<str>)>,
    ) -> Self {
        self.envs.extend(
            envs.into_iter()
                .map(|(k, v)| (k.as_ref().to_string(), Some(v.as_ref().to_string()))),
        );
        self
    }

    /// Remove a variable from the inherited environment
    pub fn env_remove(mut self, key: impl AsRef<str>) -> Self {
        self.envs.push((key.as_ref().to_string(), None));
        self
    }

    /// Start from an empty environment
    pub fn env_clear(mut self) -> Self {
        self.env_clear = true;
        self.envs.clear();
        self
    }

    /// Set the working directory
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Configure the server's stdin
    pub fn stdin(mut self, cfg: StdioConfig) -> Self {
        self.stdin = cfg;
        self
    }

    /// Configure the server's stdout
    pub fn stdout(mut self, cfg: StdioConfig) -> Self {
        self.stdout = cfg;
        self
    }

    /// Settings for the session this command produces
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn the server and wait for it to report ready
    ///
    /// If the server dies before the handshake completes the error is
    /// classified the same way as a failure during a conversation.
    pub async fn spawn(self) -> Result<Session> {
        let (request_read, request_write) = cloexec_pipe()?;
        let (response_read, response_write) = cloexec_pipe()?;

        let mut command = std::process::Command::new(&self.program);
        command
            .args(&self.args)
            .args(invocation_suffix(
                WIRE_VERSION,
                request_read.as_raw_fd(),
                response_write.as_raw_fd(),
            ))
            .stdin(Stdio::from(self.stdin))
            .stdout(Stdio::from(self.stdout))
            .stderr(Stdio::piped());

        if self.env_clear {
            command.env_clear();
        }
        for (key, value) in &self.envs {
            match value {
                Some(value) => command.env(key, value),
                None => command.env_remove(key),
            };
        }
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let inherited = [request_read.as_raw_fd(), response_write.as_raw_fd()];
        // SAFETY: the hook only calls fcntl, which is async-signal-safe.
        unsafe {
            command.pre_exec(move || {
                for fd in inherited {
                    clear_cloexec(fd)?;
                }
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|source| Error::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let pid = child.id();
        tracing::debug!(program = %self.program, pid, "spawned server process");

        // The child holds its own copies now.
        drop(request_read);
        drop(response_write);

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let supervisor = Arc::new(Supervisor::watch(child, &self.config)?);

        let endpoint = match Endpoint::new(
            response_read,
            request_write,
            Direction::Request,
            self.config.max_frame_len(),
        ) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                supervisor.kill();
                return Err(e.into());
            }
        };

        let mut session = Session::new(endpoint, supervisor, self.config);
        session.set_stdio(stdin, stdout);
        session.handshake().await?;
        Ok(session)
    }
}

/// Create a pipe whose ends are not inherited by other children
fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        use nix::fcntl::OFlag;
        Ok(nix::unistd::pipe2(OFlag::O_CLOEXEC)?)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        let (read, write) = nix::unistd::pipe()?;
        super::set_cloexec(read.as_raw_fd())?;
        super::set_cloexec(write.as_raw_fd())?;
        Ok((read, write))
    }
}

fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: plain fcntl on a descriptor we own; no allocation.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, 0) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, FaultOrigin};

    fn sh(script: &str) -> Command {
        Command::new("/bin/sh").args(["-c", script])
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let err = Command::new("/nonexistent/forkrpc-server")
            .spawn()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Spawn);
    }

    #[tokio::test]
    async fn test_early_exit_carries_stderr() {
        let err = sh("echo boom >&2; exit 3").spawn().await.unwrap_err();

        let failure = err.as_external().expect("external failure");
        assert_eq!(failure.origin(), FaultOrigin::Exit { code: 3 });
        assert_eq!(failure.message(), "boom\n");
    }

    #[tokio::test]
    async fn test_self_kill_is_server_killed() {
        let err = sh("kill -9 $$").spawn().await.unwrap_err();
        assert!(matches!(err, Error::ServerKilled { signal } if signal == libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_descriptors_are_passed_in_suffix() {
        // With `sh -c`, the first trailing argument becomes $0.
        let err = sh(r#"echo "$0 $1" >&2; exit 9"#).spawn().await.unwrap_err();

        let failure = err.as_external().expect("external failure");
        assert_eq!(failure.exit_code(), Some(9));
        assert_eq!(failure.message(), format!("--forkrpc {WIRE_VERSION}\n"));
    }

    #[tokio::test]
    async fn test_env_is_applied() {
        let err = sh(r#"echo "${FORKRPC_SET-unset} ${FORKRPC_GONE-unset}" >&2; exit 1"#)
            .env("FORKRPC_SET", "hello")
            .env("FORKRPC_GONE", "x")
            .env_remove("FORKRPC_GONE")
            .spawn()
            .await
            .unwrap_err();

        assert_eq!(err.as_external().unwrap().message(), "hello unset\n");
    }
}
