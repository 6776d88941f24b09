//! Spawning and supervising server processes

mod command;
mod supervisor;

use std::io;
use std::os::fd::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};

use nix::fcntl::{FcntlArg, FdFlag, fcntl};

pub use command::Command;
pub(crate) use supervisor::Supervisor;

/// Mark a descriptor close-on-exec, failing if it is not open
pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    fcntl(fd, FcntlArg::F_SETFD(flags | FdFlag::FD_CLOEXEC))?;
    Ok(())
}

/// Standard I/O configuration for the server's stdin and stdout
#[derive(Debug, Clone, Copy)]
pub enum StdioConfig {
    /// Inherit from parent process
    Inherit,
    /// Create a new pipe
    Piped,
    /// Redirect to null
    Null,
}

impl From<StdioConfig> for Stdio {
    fn from(config: StdioConfig) -> Self {
        match config {
            StdioConfig::Inherit => Stdio::inherit(),
            StdioConfig::Piped => Stdio::piped(),
            StdioConfig::Null => Stdio::null(),
        }
    }
}

/// How a server process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Termination {
    /// The process exited with this code.
    Exited(i32),
    /// The process was killed by this signal.
    Signaled(i32),
}

impl Termination {
    pub(crate) fn from_status(status: ExitStatus) -> Option<Self> {
        match (status.code(), status.signal()) {
            (Some(code), _) => Some(Self::Exited(code)),
            (None, Some(signal)) => Some(Self::Signaled(signal)),
            (None, None) => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_from_status() {
        // Raw wait statuses: exit code in the high byte, signal number in the low bits.
        let exited = ExitStatus::from_raw(3 << 8);
        let killed = ExitStatus::from_raw(libc::SIGKILL);

        assert_eq!(Termination::from_status(exited), Some(Termination::Exited(3)));
        assert_eq!(
            Termination::from_status(killed),
            Some(Termination::Signaled(libc::SIGKILL))
        );
        assert!(Termination::Exited(0).success());
        assert!(!Termination::Signaled(libc::SIGTERM).success());
    }
}
