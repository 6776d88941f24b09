//! Scoped redirection of standard streams
//!
//! A [`Redirect`] points a descriptor (usually stdout or stdin) somewhere else
//! and puts the original back when dropped, including during unwinding.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};

use async_io::Async;
use nix::fcntl::{FcntlArg, fcntl};
use nix::unistd::dup2;

use crate::error::Result;

/// Guard that keeps a descriptor redirected while it lives
#[derive(Debug)]
pub struct Redirect {
    target: RawFd,
    saved: OwnedFd,
}

impl Redirect {
    /// Point `target` at the same file as `to`
    ///
    /// The caller must own `target` for as long as the guard lives.
    pub fn descriptor(target: RawFd, to: impl AsFd) -> Result<Self> {
        let saved = fcntl(target, FcntlArg::F_DUPFD_CLOEXEC(0)).map_err(io::Error::from)?;
        // SAFETY: F_DUPFD_CLOEXEC returned a fresh descriptor that nothing else owns.
        let saved = unsafe { OwnedFd::from_raw_fd(saved) };

        dup2(to.as_fd().as_raw_fd(), target).map_err(io::Error::from)?;
        tracing::trace!(target_fd = target, "redirected descriptor");

        Ok(Self { target, saved })
    }

    /// Send everything written to stdout to `to` instead
    pub fn stdout(to: impl AsFd) -> Result<Self> {
        io::stdout().flush()?;
        Self::descriptor(libc::STDOUT_FILENO, to)
    }

    /// Read stdin from `from` instead
    pub fn stdin(from: impl AsFd) -> Result<Self> {
        Self::descriptor(libc::STDIN_FILENO, from)
    }
}

impl Drop for Redirect {
    fn drop(&mut self) {
        if self.target == libc::STDOUT_FILENO {
            let _ = io::stdout().flush();
        }

        if let Err(e) = dup2(self.saved.as_raw_fd(), self.target) {
            tracing::warn!(target_fd = self.target, error = %e, "failed to restore descriptor");
        }
    }
}

/// Redirect stdout into a pipe and return its read end
///
/// The reader sees end of file once the guard is dropped and every other copy
/// of the write end is closed.
pub fn capture_stdout() -> Result<(Redirect, Async<File>)> {
    let (read, write) = nix::unistd::pipe().map_err(io::Error::from)?;
    crate::process::set_cloexec(read.as_raw_fd())?;
    crate::process::set_cloexec(write.as_raw_fd())?;

    let guard = Redirect::stdout(&write)?;
    drop(write);

    Ok((guard, Async::new(File::from(read))?))
}
