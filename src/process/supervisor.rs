//! Background watcher for one server process
//!
//! The watcher thread owns the `std::process::Child`. It drains the child's
//! stderr into a bounded tail buffer, then reaps the child and publishes how it
//! ended. Waiters are woken by closing a channel, which every receiver observes.
//!
//! The child is reaped under the same lock [`Supervisor::kill`] takes, after it
//! has already exited, so a pid is never signalled once it could be reused.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::process::{Child, ChildStderr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_io::Timer;
use futures_lite::FutureExt;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use smol::channel::{Receiver, Sender};

use crate::config::SessionConfig;
use crate::process::Termination;

/// Keeps the last `capacity` bytes written to it
#[derive(Debug)]
struct TailBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl TailBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity.min(8192)),
            capacity,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let chunk = &chunk[chunk.len().saturating_sub(self.capacity)..];
        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.capacity);
        self.bytes.drain(..overflow);
        self.bytes.extend(chunk);
    }

    fn text(&self) -> String {
        let (front, back) = self.bytes.as_slices();
        let mut bytes = Vec::with_capacity(self.bytes.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[derive(Debug)]
struct Shared {
    termination: Mutex<Option<Termination>>,
    stderr: Mutex<TailBuffer>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owner of a running server process
pub(crate) struct Supervisor {
    pid: Pid,
    shared: Arc<Shared>,
    exited: Receiver<()>,
}

impl Supervisor {
    /// Start watching a freshly spawned child
    pub fn watch(mut child: Child, config: &SessionConfig) -> io::Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);
        let stderr = child.stderr.take();
        let forward = config.forward_stderr();
        let shared = Arc::new(Shared {
            termination: Mutex::new(None),
            stderr: Mutex::new(TailBuffer::new(config.stderr_capacity())),
        });
        let (exited_tx, exited) = smol::channel::bounded(1);

        let thread_shared = Arc::clone(&shared);
        let spawned = std::thread::Builder::new()
            .name(format!("forkrpc-watch-{pid}"))
            .spawn(move || run_watcher(child, stderr, thread_shared, forward, exited_tx));

        if let Err(e) = spawned {
            // The child went down with the closure; make sure it does not outlive us.
            let _ = signal::kill(pid, Signal::SIGKILL);
            return Err(e);
        }

        Ok(Self {
            pid,
            shared,
            exited,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// How the process ended, once the watcher has reaped it
    pub fn termination(&self) -> Option<Termination> {
        *lock(&self.shared.termination)
    }

    /// Captured stderr text, lossily decoded
    pub fn stderr_tail(&self) -> String {
        lock(&self.shared.stderr).text()
    }

    /// Wait for the watcher to reap the process
    ///
    /// Returns `None` when the timeout elapses first, or when the exit status
    /// could not be collected.
    pub async fn wait(&self, timeout: Option<Duration>) -> Option<Termination> {
        let exited = self.exited.clone();
        let reaped = async move {
            // Nothing is ever sent: the watcher closes the channel once it is done.
            let _ = exited.recv().await;
            true
        };

        let reaped = match timeout {
            Some(timeout) => {
                reaped
                    .or(async {
                        Timer::after(timeout).await;
                        false
                    })
                    .await
            }
            None => reaped.await,
        };

        if reaped { self.termination() } else { None }
    }

    /// Send SIGKILL unless the process is already known to be gone
    pub fn kill(&self) {
        let termination = lock(&self.shared.termination);
        if termination.is_some() || self.exited.is_closed() {
            return;
        }

        match signal::kill(self.pid, Signal::SIGKILL) {
            Ok(()) => tracing::debug!(pid = self.pid.as_raw(), "killed server process"),
            Err(e) => tracing::debug!(pid = self.pid.as_raw(), error = %e, "failed to kill server process"),
        }
    }
}

fn run_watcher(
    mut child: Child,
    stderr: Option<ChildStderr>,
    shared: Arc<Shared>,
    forward: bool,
    exited: Sender<()>,
) {
    let pid = child.id();

    if let Some(stderr) = stderr {
        pump_stderr(pid, stderr, &shared, forward);
    }

    let reserved = match wait_exited(pid) {
        Ok(()) => Some(lock(&shared.termination)),
        Err(e) => {
            tracing::debug!(pid, error = %e, "failed to wait for server exit");
            None
        }
    };

    let status = child.wait();
    let mut termination = reserved.unwrap_or_else(|| lock(&shared.termination));
    match status {
        Ok(status) => {
            *termination = Termination::from_status(status);
            tracing::debug!(pid, termination = ?*termination, "server process exited");
        }
        Err(e) => tracing::warn!(pid, error = %e, "failed to wait for server process"),
    }

    drop(termination);
    drop(exited);
}

/// Block until the child has exited, leaving it unreaped so its pid stays taken
fn wait_exited(pid: u32) -> io::Result<()> {
    loop {
        // SAFETY: siginfo_t is plain data for waitid to fill in.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn pump_stderr(pid: u32, mut stderr: ChildStderr, shared: &Shared, forward: bool) {
    let mut chunk = [0u8; 4096];
    let mut line = Vec::new();

    loop {
        let n = match stderr.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(pid, error = %e, "failed to read server stderr");
                break;
            }
        };
        let bytes = &chunk[..n];

        lock(&shared.stderr).push(bytes);

        if forward {
            let _ = io::stderr().write_all(bytes);
        }

        for &byte in bytes {
            if byte == b'\n' {
                tracing::debug!(target: "forkrpc::server", pid, "{}", String::from_utf8_lossy(&line));
                line.clear();
            } else {
                line.push(byte);
            }
        }
    }

    if !line.is_empty() {
        tracing::debug!(target: "forkrpc::server", pid, "{}", String::from_utf8_lossy(&line));
    }
}
