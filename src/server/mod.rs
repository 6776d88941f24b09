//! Server side of a control channel
//!
//! A server process parses its invocation with [`ServerArgs`], claims the
//! channel with [`Server::start`], and then either drives conversations itself
//! or hands requests to a [`Handler`] through [`Server::serve`].

mod args;
mod redirect;

use std::any::Any;
use std::future::Future;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_lite::FutureExt;
use serde::de::DeserializeOwned;

use crate::channel::{DEFAULT_MAX_FRAME_LEN, Direction, Endpoint, Frame, RemoteFault, WIRE_VERSION};
use crate::conversation::{Conversation, Link, Role};
use crate::error::{Error, Result};
use crate::process::set_cloexec;

pub use args::{ARGS_DELIMITER, ServerArgs};
pub(crate) use args::invocation_suffix;
pub use redirect::{Redirect, capture_stdout};

/// Set once the inherited channel descriptors have been taken over
static CLAIMED: AtomicBool = AtomicBool::new(false);

/// Answers requests arriving on a server's control channel
///
/// `handle` gets the decoded request and the conversation it arrived on. It
/// may answer with any number of `put`s and read follow-up messages with `get`.
/// An `Err` (or a panic) is reported to the client as an application fault;
/// responses already sent stay valid.
pub trait Handler {
    type Request: DeserializeOwned;

    fn handle(
        &mut self,
        request: Self::Request,
        conversation: &Conversation,
    ) -> impl Future<Output = Result<()>>;
}

/// The server end of a control channel
pub struct Server {
    link: Arc<Link>,
    args: ServerArgs,
}

impl Server {
    /// Claim the channel named in `args` and tell the client we are ready
    ///
    /// The descriptors can only be claimed once per process.
    pub async fn start(args: ServerArgs) -> Result<Self> {
        if args.version() != WIRE_VERSION {
            return Err(Error::InvalidArgs(format!(
                "client speaks wire version {}, expected {WIRE_VERSION}",
                args.version()
            )));
        }

        check_fd(args.request_fd())?;
        check_fd(args.response_fd())?;
        if CLAIMED.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidArgs(
                "control channel already claimed".to_string(),
            ));
        }

        // SAFETY: both descriptors are open, and CLAIMED guarantees nothing else
        // in this process took ownership of them through us.
        let (request, response) = unsafe {
            (
                OwnedFd::from_raw_fd(args.request_fd()),
                OwnedFd::from_raw_fd(args.response_fd()),
            )
        };
        let endpoint = Endpoint::new(request, response, Direction::Response, DEFAULT_MAX_FRAME_LEN)?;

        let server = Self::with_link(
            Arc::new(Link::new(Role::Server, endpoint, None, Duration::ZERO)),
            args,
        );
        server
            .link
            .send_frame(&Frame::Ready {
                version: WIRE_VERSION,
                max_frame_len: DEFAULT_MAX_FRAME_LEN,
            })
            .await?;

        match server.link.recv_frame().await? {
            Frame::Ready {
                version: WIRE_VERSION,
                max_frame_len,
            } => server.link.limit_frame_len(max_frame_len).await,
            other => {
                return Err(Error::Protocol(format!(
                    "expected ready frame from the client, got {other:?}"
                )));
            }
        }

        tracing::debug!(pid = std::process::id(), "server ready");
        Ok(server)
    }

    /// Parse the process arguments and start
    pub async fn from_env() -> Result<Self> {
        Self::start(ServerArgs::from_env()?).await
    }

    fn with_link(link: Arc<Link>, args: ServerArgs) -> Self {
        Self { link, args }
    }

    pub fn args(&self) -> &ServerArgs {
        &self.args
    }

    /// Run `f` inside a fresh conversation scope
    pub async fn converse<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Conversation) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.link.converse(f).await
    }

    /// Serve requests until the client asks us to shut down
    ///
    /// Each request gets its own conversation. Decode and handler faults are
    /// sent back to the client and serving continues. Returns `Ok` on a
    /// shutdown request and `Err` when the channel itself fails.
    pub async fn serve<H: Handler>(&self, mut handler: H) -> Result<()> {
        loop {
            let handler = &mut handler;
            let outcome = self
                .link
                .converse(|conv| async move {
                    let request = conv.get::<H::Request>().await?;
                    AssertUnwindSafe(handler.handle(request, &conv))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| Err(Error::Application(panic_message(&*panic))))
                })
                .await;

            let Err(error) = outcome else {
                continue;
            };

            let fault = match &error {
                Error::ManualShutdown => {
                    tracing::debug!("shutdown requested, leaving serve loop");
                    return Ok(());
                }
                Error::ChannelClosed
                | Error::Protocol(_)
                | Error::Io(_)
                | Error::Spawn { .. }
                | Error::InvalidArgs(_) => return Err(error),
                Error::Decode { .. } => RemoteFault::Decode,
                _ => RemoteFault::Application,
            };

            tracing::warn!(error = %error, "request failed");
            match self.link.send_failure(fault, error.to_string()).await {
                Ok(()) => {}
                Err(Error::ManualShutdown) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Check that an inherited descriptor is open and keep it out of our own children
fn check_fd(fd: RawFd) -> Result<()> {
    set_cloexec(fd).map_err(|e| Error::InvalidArgs(format!("descriptor {fd} is not usable: {e}")))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::conversation::tests::link_pair;
    use crate::error::{ErrorKind, FaultOrigin};

    #[derive(Debug, Serialize, Deserialize)]
    enum Op {
        Double(u32),
        Spell(u32),
        Fail,
        Panic,
    }

    struct Calculator;

    impl Handler for Calculator {
        type Request = Op;

        async fn handle(&mut self, request: Op, conv: &Conversation) -> Result<()> {
            match request {
                Op::Double(n) => conv.put(&(n * 2)).await,
                Op::Spell(n) => {
                    for i in 0..n {
                        conv.put(&i).await?;
                    }
                    conv.put("done").await
                }
                Op::Fail => Err(Error::application("refused")),
                Op::Panic => panic!("lost my marbles"),
            }
        }
    }

    fn test_args() -> ServerArgs {
        ServerArgs::parse(["server", "--forkrpc", "1", "3", "4"]).unwrap()
    }

    #[tokio::test]
    async fn test_serve_answers_and_reports_faults() {
        let (client, server_link) = link_pair();
        let server = Server::with_link(server_link, test_args());

        let talking = async {
            client
                .converse(|conv| async move {
                    assert_eq!(conv.call::<_, u32>(&Op::Double(21)).await?, 42);

                    conv.put(&Op::Spell(2)).await?;
                    assert_eq!(conv.get::<u32>().await?, 0);
                    assert_eq!(conv.get::<u32>().await?, 1);
                    assert_eq!(conv.get::<String>().await?, "done");

                    let err = conv.call::<_, u32>(&Op::Fail).await.unwrap_err();
                    assert_eq!(err.kind(), ErrorKind::RemoteApplication);
                    assert_eq!(err.as_external().unwrap().message(), "refused");

                    let err = conv.call::<_, u32>(&Op::Panic).await.unwrap_err();
                    assert_eq!(err.kind(), ErrorKind::RemoteApplication);
                    assert!(err.as_external().unwrap().message().contains("lost my marbles"));

                    // Not an `Op` at all.
                    let err = conv.call::<_, u32>("gibberish").await.unwrap_err();
                    assert_eq!(
                        err.as_external().map(|f| f.origin()),
                        Some(FaultOrigin::Decode)
                    );

                    assert_eq!(conv.call::<_, u32>(&Op::Double(1)).await?, 2);
                    Ok(())
                })
                .await
                .unwrap();

            assert!(client.begin_shutdown());
            client.send_shutdown().await.unwrap();
        };

        let (served, ()) = tokio::join!(server.serve(Calculator), talking);
        served.unwrap();
    }

    #[tokio::test]
    async fn test_serve_fails_when_client_vanishes() {
        let (client, server_link) = link_pair();
        let server = Server::with_link(server_link, test_args());
        drop(client);

        let err = server.serve(Calculator).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChannelClosed);
    }

    #[tokio::test]
    async fn test_start_rejects_wrong_version() {
        let args = ServerArgs::parse(["server", "--forkrpc", "99", "3", "4"]).unwrap();
        let err = Server::start(args).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArgs);
    }

    #[tokio::test]
    async fn test_unusable_descriptors_leave_channel_unclaimed() {
        let args = ServerArgs::parse(["server", "--forkrpc", "1", "9000", "9001"]).unwrap();

        for _ in 0..2 {
            let err = Server::start(args.clone()).await.err().unwrap();
            assert_eq!(err.kind(), ErrorKind::InvalidArgs);
            assert!(err.to_string().contains("descriptor 9000 is not usable"));
        }
        assert!(!CLAIMED.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(&"boom"), "handler panicked: boom");
        assert_eq!(panic_message(&String::from("bang")), "handler panicked: bang");
        assert_eq!(panic_message(&7u8), "handler panicked");
    }
}
