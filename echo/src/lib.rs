//! Demo vocabulary and handler for the `forkrpc-echo` server
//!
//! The requests exercise every shape of exchange the engine supports: single
//! responses, streams of responses, remote faults, crashes, environment
//! changes, and interruptible work that streams its stdout.

use std::time::Duration;

use futures_lite::io::{AsyncBufReadExt, BufReader};
use futures_lite::{StreamExt, future};
use serde::{Deserialize, Serialize};

use forkrpc::{CancelToken, Conversation, Error, Handler, InterruptSlot, Result, capture_stdout};

/// Requests understood by the echo server
///
/// Each request is answered within its own conversation:
///
/// | request | responses |
/// |---|---|
/// | `Echo(s)` | one `String`, the prefix followed by `s` |
/// | `Count(n)` | `n, n-1, ..., 0` as `u32` |
/// | `CountThenCrash` | `crash_after` counts, then the process exits with code 2 |
/// | `Fail(msg)` | an application fault carrying `msg` |
/// | `Panic(msg)` | an application fault from a handler panic |
/// | `SetEnv(vars)` | the previous values, as `Vec<Option<String>>` |
/// | `GetEnv(key)` | the current value, as `Option<String>` |
/// | `Run` | a stream of [`RunEvent`]s; accepts [`RunControl`] messages |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Echo(String),
    Count(u32),
    CountThenCrash { from: u32, crash_after: u32 },
    Fail(String),
    Panic(String),
    /// Set (`Some`) or remove (`None`) environment variables in the server.
    SetEnv(Vec<(String, Option<String>)>),
    GetEnv(String),
    /// Print a line to stdout every `tick_ms` milliseconds, `ticks` times.
    Run { ticks: u32, tick_ms: u64 },
}

/// Messages a client sends while a `Run` request is in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunControl {
    /// Stop the work early.
    Interrupt,
    /// Acknowledge `Done`; ends the request.
    Finish,
}

/// Responses to a `Run` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunEvent {
    /// One line the work printed to stdout.
    Output(String),
    /// The work stopped after `ticks` ticks.
    Done { ticks: u32, interrupted: bool },
}

/// Exit code used by `CountThenCrash`
pub const CRASH_EXIT_CODE: i32 = 2;

/// Answers [`Request`]s
#[derive(Debug, Default)]
pub struct EchoServer {
    prefix: String,
}

impl EchoServer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    async fn count_then_crash(&self, from: u32, crash_after: u32, conv: &Conversation) -> Result<()> {
        for n in (0..=from).rev().take(crash_after as usize) {
            conv.put(&n).await?;
        }

        eprintln!("crashing on purpose after {crash_after} responses");
        std::process::exit(CRASH_EXIT_CODE);
    }

    fn set_env(&self, vars: Vec<(String, Option<String>)>) -> Vec<Option<String>> {
        vars.into_iter()
            .map(|(key, value)| {
                let previous = std::env::var(&key).ok();
                // SAFETY: the server is driven by a single task and no other
                // thread reads the environment while a request is handled.
                unsafe {
                    match value {
                        Some(value) => std::env::set_var(&key, value),
                        None => std::env::remove_var(&key),
                    }
                }
                previous
            })
            .collect()
    }

    /// Run the ticking work with stdout captured, while listening for control messages
    async fn run(&self, ticks: u32, tick_ms: u64, conv: &Conversation) -> Result<()> {
        let slot = InterruptSlot::new();
        let token = CancelToken::new();
        let (redirect, output) = capture_stdout()?;

        let produce = async {
            slot.arm(token.clone());
            let work = {
                let token = token.clone();
                async move {
                    let done = blocking::unblock(move || tick(ticks, tick_ms, &token)).await;
                    // Restoring stdout closes the pipe, which ends the pump.
                    drop(redirect);
                    done
                }
            };

            let pump = async {
                let mut lines = BufReader::new(output).lines();
                while let Some(line) = lines.next().await {
                    conv.put(&RunEvent::Output(line?)).await?;
                }
                Ok::<_, Error>(())
            };

            let (done, pumped) = future::zip(work, pump).await;
            pumped?;

            let interrupted = slot.disarm();
            tracing::debug!(ticks = done, interrupted, "run finished");
            conv.put(&RunEvent::Done {
                ticks: done,
                interrupted,
            })
            .await
        };

        let control = async {
            loop {
                match conv.get::<RunControl>().await? {
                    RunControl::Interrupt => {
                        let outcome = slot.interrupt();
                        tracing::debug!(?outcome, "interrupt requested");
                    }
                    RunControl::Finish => return Ok::<_, Error>(()),
                }
            }
        };

        let result = future::try_zip(produce, control).await.map(|_| ());
        // Stop the worker thread if we bailed out early.
        slot.interrupt();
        result
    }
}

fn tick(ticks: u32, tick_ms: u64, token: &CancelToken) -> u32 {
    let mut done = 0;
    for i in 0..ticks {
        if token.is_cancelled() {
            break;
        }
        println!("tick {i}");
        done += 1;
        std::thread::sleep(Duration::from_millis(tick_ms));
    }
    done
}

impl Handler for EchoServer {
    type Request = Request;

    async fn handle(&mut self, request: Request, conv: &Conversation) -> Result<()> {
        tracing::debug!(?request, "handling request");

        match request {
            Request::Echo(text) => conv.put(&format!("{}{text}", self.prefix)).await,
            Request::Count(from) => {
                for n in (0..=from).rev() {
                    conv.put(&n).await?;
                }
                Ok(())
            }
            Request::CountThenCrash { from, crash_after } => {
                self.count_then_crash(from, crash_after, conv).await
            }
            Request::Fail(message) => Err(Error::application(message)),
            Request::Panic(message) => panic!("{message}"),
            Request::SetEnv(vars) => conv.put(&self.set_env(vars)).await,
            Request::GetEnv(key) => conv.put(&std::env::var(key).ok()).await,
            Request::Run { ticks, tick_ms } => self.run(ticks, tick_ms, conv).await,
        }
    }
}
