//! Scoped conversations over a control channel
//!
//! A [`Link`] is one end of a live control channel together with its state
//! (open, shutting down, shut down, failed) and a generation counter. Each
//! conversation scope takes a fresh generation and bumps it again on exit, so a
//! [`Conversation`] handle that outlives its scope notices on its next
//! operation without touching the channel. A `get` still waiting when its scope
//! ends gives up with [`Error::IllscopedConversation`] and leaves the next frame
//! to the following conversation.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_lite::FutureExt;
use serde::{Serialize, de::DeserializeOwned};
use smol::channel::{Receiver, Sender};

use crate::channel::{ChannelError, Endpoint, Frame, RemoteFault};
use crate::error::{Error, ExternalFailure, FaultOrigin, Result};
use crate::process::{Supervisor, Termination};

/// Which end of the channel a link sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

/// A fault that ends the link for good
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Fault {
    Killed { signal: i32 },
    Exited(ExternalFailure),
    ChannelClosed,
    Protocol(String),
}

impl Fault {
    fn to_error(&self) -> Error {
        match self {
            Self::Killed { signal } => Error::ServerKilled { signal: *signal },
            Self::Exited(failure) => Error::External(failure.clone()),
            Self::ChannelClosed => Error::ChannelClosed,
            Self::Protocol(message) => Error::Protocol(message.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkState {
    Open,
    ShuttingDown,
    ShutDown,
    Failed(Fault),
}

pub(crate) struct Link {
    role: Role,
    endpoint: Endpoint,
    generation: AtomicU64,
    scope: smol::lock::Mutex<()>,
    state: Mutex<LinkState>,
    /// A frame read on behalf of a scope that ended before it could be returned
    stash: Mutex<Option<Frame>>,
    supervisor: Option<Arc<Supervisor>>,
    exit_grace: Duration,
}

impl Link {
    pub fn new(
        role: Role,
        endpoint: Endpoint,
        supervisor: Option<Arc<Supervisor>>,
        exit_grace: Duration,
    ) -> Self {
        Self {
            role,
            endpoint,
            generation: AtomicU64::new(0),
            scope: smol::lock::Mutex::new(()),
            state: Mutex::new(LinkState::Open),
            stash: Mutex::new(None),
            supervisor,
            exit_grace,
        }
    }

    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stash(&self) -> MutexGuard<'_, Option<Frame>> {
        self.stash.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with a conversation bound to a fresh generation
    ///
    /// Conversations on one link are serialized. The generation is invalidated
    /// when the scope ends, however it ends.
    pub async fn converse<F, Fut, T>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(Conversation) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _scope = self.scope.lock().await;
        self.check_writable()?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (open, ended) = smol::channel::bounded(1);
        let _guard = ScopeGuard {
            link: self,
            generation,
            _open: open,
        };
        tracing::trace!(generation, "conversation opened");

        f(Conversation {
            link: Arc::clone(self),
            generation,
            ended,
        })
        .await
    }

    fn check_scope(&self, generation: u64) -> Result<()> {
        if self.generation.load(Ordering::SeqCst) == generation {
            Ok(())
        } else {
            Err(Error::IllscopedConversation)
        }
    }

    /// Reads stay possible while shutting down so in-flight responses drain.
    fn check_readable(&self) -> Result<()> {
        match &*self.state() {
            LinkState::Open | LinkState::ShuttingDown => Ok(()),
            LinkState::ShutDown => Err(Error::ManualShutdown),
            LinkState::Failed(fault) => Err(fault.to_error()),
        }
    }

    fn check_writable(&self) -> Result<()> {
        match &*self.state() {
            LinkState::Open => Ok(()),
            LinkState::ShuttingDown | LinkState::ShutDown => Err(Error::ManualShutdown),
            LinkState::Failed(fault) => Err(fault.to_error()),
        }
    }

    /// Record a fault unless the link already ended; returns the error every caller sees
    fn fail(&self, fault: Fault) -> Error {
        let mut state = self.state();
        match &*state {
            LinkState::Open => {
                tracing::debug!(?fault, "control channel failed");
                let error = fault.to_error();
                *state = LinkState::Failed(fault);
                error
            }
            LinkState::ShuttingDown | LinkState::ShutDown => Error::ManualShutdown,
            LinkState::Failed(existing) => existing.to_error(),
        }
    }

    async fn channel_failed(&self, error: ChannelError) -> Error {
        match error {
            ChannelError::Disconnected(cause) => self.disconnected(cause).await,
            ChannelError::Broken => self.fail(Fault::ChannelClosed),
            ChannelError::Protocol(Error::Protocol(message)) => self.fail(Fault::Protocol(message)),
            ChannelError::Protocol(other) => self.fail(Fault::Protocol(other.to_string())),
            ChannelError::Rejected(error) => error,
        }
    }

    /// Work out why the peer went away
    async fn disconnected(&self, cause: io::Error) -> Error {
        if matches!(
            *self.state(),
            LinkState::ShuttingDown | LinkState::ShutDown
        ) {
            return Error::ManualShutdown;
        }

        tracing::debug!(error = %cause, "control channel disconnected");

        let fault = match &self.supervisor {
            Some(supervisor) => match supervisor.wait(Some(self.exit_grace)).await {
                Some(Termination::Signaled(signal)) => Fault::Killed { signal },
                Some(Termination::Exited(code)) => Fault::Exited(ExternalFailure::new(
                    FaultOrigin::Exit { code },
                    supervisor.stderr_tail(),
                )),
                None => Fault::ChannelClosed,
            },
            None => Fault::ChannelClosed,
        };

        self.fail(fault)
    }

    /// Read the next raw frame, classifying any channel failure
    pub async fn recv_frame(&self) -> Result<Frame> {
        self.check_readable()?;
        let mut reader = self.endpoint.reader.lock().await;
        self.check_readable()?;

        match reader.next().await {
            Ok(frame) => Ok(frame),
            Err(e) => Err(self.channel_failed(e).await),
        }
    }

    /// Read the next data payload, turning control frames into errors
    ///
    /// Gives up as soon as the scope behind `ended` closes.
    async fn recv_payload(&self, generation: u64, ended: &Receiver<()>) -> Result<Vec<u8>> {
        let scope_ended = async {
            // Nothing is ever sent; recv fails once the scope drops its sender.
            let _ = ended.recv().await;
            Err(Error::IllscopedConversation)
        };
        let frame = self.recv_scoped(generation).or(scope_ended).await?;

        match (self.role, frame) {
            (_, Frame::Data(payload)) => Ok(payload),
            (Role::Client, Frame::Failure { fault, message }) => {
                Err(Error::External(ExternalFailure::new(fault.into(), message)))
            }
            (Role::Server, Frame::Shutdown) => {
                *self.state() = LinkState::ShutDown;
                tracing::debug!("client requested shutdown");
                Err(Error::ManualShutdown)
            }
            (role, frame) => Err(self.fail(Fault::Protocol(format!(
                "unexpected {} frame on the {role:?} side",
                frame_name(&frame)
            )))),
        }
    }

    async fn recv_scoped(&self, generation: u64) -> Result<Frame> {
        self.check_readable()?;
        let mut reader = self.endpoint.reader.lock().await;
        self.check_scope(generation)?;
        self.check_readable()?;

        let stashed = self.stash().take();
        if let Some(frame) = stashed {
            return Ok(frame);
        }

        let frame = match reader.next().await {
            Ok(frame) => frame,
            Err(e) => return Err(self.channel_failed(e).await),
        };

        if self.check_scope(generation).is_err() {
            tracing::trace!(generation, "frame arrived after its scope ended");
            *self.stash() = Some(frame);
            return Err(Error::IllscopedConversation);
        }
        Ok(frame)
    }

    /// Cap outgoing frames at the largest frame the peer reads
    pub async fn limit_frame_len(&self, peer_max: u32) {
        self.endpoint.writer.lock().await.limit_frame_len(peer_max);
    }

    /// Write one frame if the link is open
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.check_writable()?;
        let mut writer = self.endpoint.writer.lock().await;
        self.check_writable()?;

        match writer.send(frame).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.channel_failed(e).await),
        }
    }

    async fn send_scoped(&self, frame: &Frame, generation: u64) -> Result<()> {
        self.check_writable()?;
        let mut writer = self.endpoint.writer.lock().await;
        self.check_scope(generation)?;
        self.check_writable()?;

        match writer.send(frame).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.channel_failed(e).await),
        }
    }

    /// Report a fault to the client as a failure frame
    pub async fn send_failure(&self, fault: RemoteFault, message: String) -> Result<()> {
        self.send_frame(&Frame::Failure { fault, message }).await
    }

    /// Move to `ShuttingDown`; returns false when the link was already shut down
    pub fn begin_shutdown(&self) -> bool {
        let mut state = self.state();
        match &*state {
            LinkState::ShutDown => false,
            _ => {
                *state = LinkState::ShuttingDown;
                true
            }
        }
    }

    /// Send the shutdown frame, bypassing the state checks that now refuse writes
    pub async fn send_shutdown(&self) -> Result<()> {
        let mut writer = self.endpoint.writer.lock().await;
        writer.send(&Frame::Shutdown).await.map(|_| ()).map_err(|e| match e {
            ChannelError::Disconnected(cause) => Error::Io(cause),
            ChannelError::Broken => Error::ChannelClosed,
            ChannelError::Protocol(error) | ChannelError::Rejected(error) => error,
        })
    }

    pub fn finish_shutdown(&self) {
        *self.state() = LinkState::ShutDown;
    }

    pub fn is_shut_down(&self) -> bool {
        matches!(*self.state(), LinkState::ShutDown)
    }
}

fn frame_name(frame: &Frame) -> &'static str {
    match frame {
        Frame::Data(_) => "data",
        Frame::Failure { .. } => "failure",
        Frame::Shutdown => "shutdown",
        Frame::Ready { .. } => "ready",
    }
}

/// Invalidates a conversation's generation when its scope ends
///
/// Dropping `_open` afterwards wakes every `get` still waiting in the scope.
struct ScopeGuard<'a> {
    link: &'a Link,
    generation: u64,
    _open: Sender<()>,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.link.generation.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(generation = self.generation, "conversation closed");
    }
}

/// A handle for exchanging typed messages within one conversation scope
///
/// Handles are cheap to clone and may be shared between tasks for the life of
/// the scope: reads and writes are locked independently, so one task can wait in
/// [`get`](Self::get) while another calls [`put`](Self::put). Once the scope has
/// ended every operation fails with [`Error::IllscopedConversation`].
#[derive(Clone)]
pub struct Conversation {
    link: Arc<Link>,
    generation: u64,
    ended: Receiver<()>,
}

impl Conversation {
    /// Send one value to the peer
    pub async fn put<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        self.link.check_scope(self.generation)?;
        let frame = Frame::data(value)?;
        self.link.send_scoped(&frame, self.generation).await
    }

    /// Receive the next value from the peer, decoded as `T`
    ///
    /// A payload that does not decode as `T` is consumed and reported as
    /// [`Error::Decode`]; the channel stays usable.
    pub async fn get<T: DeserializeOwned>(&self) -> Result<T> {
        self.link.check_scope(self.generation)?;
        let payload = self.link.recv_payload(self.generation, &self.ended).await?;
        Frame::decode_payload(&payload)
    }

    /// Send a request and wait for a single response
    pub async fn call<Req, Resp>(&self, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.put(request).await?;
        self.get().await
    }

    /// The generation this handle is bound to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the scope that created this handle is still running
    pub fn is_in_scope(&self) -> bool {
        self.link.check_scope(self.generation).is_ok()
    }
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("role", &self.link.role)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channel::{DEFAULT_MAX_FRAME_LEN, Direction};
    use crate::error::ErrorKind;

    /// Two links joined by a pair of pipes, without any process behind them
    pub(crate) fn link_pair() -> (Arc<Link>, Arc<Link>) {
        let (client_read, server_write) = nix::unistd::pipe().unwrap();
        let (server_read, client_write) = nix::unistd::pipe().unwrap();

        let client = Endpoint::new(
            client_read,
            client_write,
            Direction::Request,
            DEFAULT_MAX_FRAME_LEN,
        )
        .unwrap();
        let server = Endpoint::new(
            server_read,
            server_write,
            Direction::Response,
            DEFAULT_MAX_FRAME_LEN,
        )
        .unwrap();

        let grace = Duration::from_millis(100);
        (
            Arc::new(Link::new(Role::Client, client, None, grace)),
            Arc::new(Link::new(Role::Server, server, None, grace)),
        )
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (client, server) = link_pair();

        client
            .converse(|conv| async move { conv.put(&vec!["a".to_string(), "b".to_string()]).await })
            .await
            .unwrap();
        let received: Vec<String> = server
            .converse(|conv| async move { conv.get().await })
            .await
            .unwrap();

        assert_eq!(received, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_escaped_handle_is_illscoped_forever() {
        let (client, _server) = link_pair();

        let escaped = client.converse(|conv| async move { Ok(conv) }).await.unwrap();
        assert!(!escaped.is_in_scope());

        for _ in 0..3 {
            let err = escaped.put(&1u32).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::IllscopedConversation);
            let err = escaped.get::<u32>().await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::IllscopedConversation);
        }

        // A later scope does not revive the old handle.
        client
            .converse(|conv| async move {
                assert!(conv.is_in_scope());
                assert!(escaped.put(&1u32).await.is_err());
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pending_get_gives_up_when_scope_ends() {
        let (client, server) = link_pair();

        let waiting = client
            .converse(|conv| async move {
                let waiting = tokio::spawn(async move { conv.get::<u32>().await });
                // Let the get start waiting on the reader.
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(waiting)
            })
            .await
            .unwrap();

        let stale = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .expect("stale get still blocked")
            .unwrap();
        assert_eq!(stale.unwrap_err().kind(), ErrorKind::IllscopedConversation);

        server.send_frame(&Frame::data(&42u32).unwrap()).await.unwrap();
        let next = tokio::time::timeout(
            Duration::from_secs(5),
            client.converse(|conv| async move { conv.get::<u32>().await }),
        )
        .await
        .expect("next conversation never got its frame")
        .unwrap();
        assert_eq!(next, 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_frame_read_for_ended_scope_goes_to_next_get() {
        let (client, server) = link_pair();

        // A read that is already waiting when the generation moves on, with the
        // scope-end signal not yet delivered.
        let generation = client.generation.load(Ordering::SeqCst);
        let (_open, ended) = smol::channel::bounded::<()>(1);
        let reading = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.recv_payload(generation, &ended).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.generation.fetch_add(1, Ordering::SeqCst);
        server.send_frame(&Frame::data(&7u32).unwrap()).await.unwrap();

        let err = reading.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllscopedConversation);

        let value = client
            .converse(|conv| async move { conv.get::<u32>().await })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_scope_ends_on_error() {
        let (client, _server) = link_pair();
        let mut kept = None;

        let result: Result<()> = client
            .converse(|conv| {
                kept = Some(conv.clone());
                async move { Err(Error::application("gave up")) }
            })
            .await;
        assert!(result.is_err());

        let kept = kept.unwrap();
        assert_eq!(
            kept.put(&0u8).await.unwrap_err().kind(),
            ErrorKind::IllscopedConversation
        );
    }

    #[tokio::test]
    async fn test_decode_mismatch_keeps_channel_usable() {
        let (client, server) = link_pair();

        client
            .converse(|conv| async move {
                conv.put("three").await?;
                conv.put(&3u32).await
            })
            .await
            .unwrap();

        server
            .converse(|conv| async move {
                let err = conv.get::<u32>().await.unwrap_err();
                assert_eq!(err.kind(), ErrorKind::LocalDecode);
                assert_eq!(conv.get::<u32>().await?, 3);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failure_frame_is_external() {
        let (client, server) = link_pair();

        server.send_frame(&Frame::data(&1u8).unwrap()).await.unwrap();
        server
            .send_failure(RemoteFault::Application, "no such module".to_string())
            .await
            .unwrap();

        client
            .converse(|conv| async move {
                assert_eq!(conv.get::<u8>().await?, 1);
                let err = conv.get::<u8>().await.unwrap_err();
                assert_eq!(err.kind(), ErrorKind::RemoteApplication);
                assert_eq!(err.as_external().unwrap().message(), "no such module");
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_frame_stops_server_side() {
        let (client, server) = link_pair();

        assert!(client.begin_shutdown());
        client.send_shutdown().await.unwrap();

        let err = server
            .converse(|conv| async move { conv.get::<u8>().await })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ManualShutdown);
        assert!(server.is_shut_down());

        let err = client
            .converse(|conv| async move { conv.put(&1u8).await })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ManualShutdown);
    }

    #[tokio::test]
    async fn test_peer_gone_is_sticky_channel_closed() {
        let (client, server) = link_pair();
        drop(server);

        for _ in 0..2 {
            let err = client
                .converse(|conv| async move { conv.get::<u8>().await })
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ChannelClosed);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_get_and_put() {
        let (client, server) = link_pair();

        let echo = tokio::spawn({
            let server = Arc::clone(&server);
            async move {
                for _ in 0..50 {
                    server
                        .converse(|conv| async move {
                            let n: u32 = conv.get().await?;
                            conv.put(&(n * 2)).await
                        })
                        .await?;
                }
                Ok::<_, Error>(())
            }
        });

        let doubled = client
            .converse(|conv| async move {
                let reader = tokio::spawn({
                    let conv = conv.clone();
                    async move {
                        let mut out = Vec::new();
                        for _ in 0..50 {
                            out.push(conv.get::<u32>().await?);
                        }
                        Ok::<_, Error>(out)
                    }
                });
                for n in 0..50u32 {
                    conv.put(&n).await?;
                }
                reader.await.expect("reader task panicked")
            })
            .await
            .unwrap();

        echo.await.unwrap().unwrap();
        assert_eq!(doubled, (0..50).map(|n| n * 2).collect::<Vec<_>>());
    }
}
