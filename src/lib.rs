//! forkrpc - typed request/response conversations with a child process
//!
//! A client spawns a server program with [`Command`], which hands the child a
//! private pair of pipes as its control channel. Both sides then exchange
//! serde values inside scoped conversations: `put` sends one value, `get`
//! receives the next one decoded as the type asked for. A request may be
//! answered by any number of responses.
//!
//! Failures are classified instead of surfacing as raw I/O errors: the server
//! rejecting a request, the server exiting or being killed, and the session
//! being shut down each have their own [`ErrorKind`]. Once the server process is
//! gone every open and future conversation reports the same fault.
//!
//! # Example
//!
//! ```rust,ignore
//! use forkrpc::Command;
//!
//! async fn ask() -> forkrpc::Result<()> {
//!     let session = Command::new("my-server").arg("--quiet").spawn().await?;
//!
//!     let answer: String = session
//!         .converse(|conv| async move { conv.call("ping").await })
//!         .await?;
//!     println!("{answer}");
//!
//!     session.shutdown().await
//! }
//! ```
//!
//! # Servers
//!
//! The server program parses its command line with [`ServerArgs`], starts the
//! channel with [`Server::start`] and answers requests, usually through
//! [`Server::serve`] and a [`Handler`]:
//!
//! ```rust,ignore
//! use forkrpc::{Conversation, Handler, Server};
//!
//! struct Greeter;
//!
//! impl Handler for Greeter {
//!     type Request = String;
//!
//!     async fn handle(&mut self, name: String, conv: &Conversation) -> forkrpc::Result<()> {
//!         conv.put(&format!("hello, {name}")).await
//!     }
//! }
//!
//! fn main() -> forkrpc::Result<()> {
//!     smol::block_on(async {
//!         let server = Server::from_env().await?;
//!         server.serve(Greeter).await
//!     })
//! }
//! ```

#[cfg(not(unix))]
compile_error!("forkrpc passes pipe descriptors to child processes and only supports unix");

mod channel;
mod config;
mod conversation;
mod error;
mod interrupt;
mod process;
mod server;
mod session;

pub use channel::{DEFAULT_MAX_FRAME_LEN, WIRE_VERSION};
pub use config::{SessionConfig, SessionConfigBuilder};
pub use conversation::Conversation;
pub use error::{Error, ErrorKind, ExternalFailure, FaultOrigin, Result};
pub use interrupt::{ArmOutcome, CancelToken, Interrupt, InterruptOutcome, InterruptSlot};
pub use process::{Command, StdioConfig, Termination};
pub use server::{ARGS_DELIMITER, Handler, Redirect, Server, ServerArgs, capture_stdout};
pub use session::Session;
