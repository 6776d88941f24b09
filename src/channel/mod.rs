//! Framed control channel
//!
//! A control channel is a pair of pipes: one carries frames from the client to
//! the server, the other carries frames back. Each direction is owned by one
//! [`FrameReader`] or [`FrameWriter`], and the two are locked independently so a
//! task can block reading responses while another one writes.

mod protocol;

use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;

use async_io::Async;
use futures_lite::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use smol::lock::Mutex;

use crate::error::Error;

pub use protocol::{DEFAULT_MAX_FRAME_LEN, WIRE_VERSION};
pub(crate) use protocol::{Direction, Frame, RemoteFault};

use protocol::{HEADER_LEN, LEN_PREFIX, frame_len};

/// Frames larger than this give their buffer back once consumed
const RETAINED_BUFFER: usize = 1024 * 1024;

/// Why a channel operation could not complete
#[derive(Debug)]
pub(crate) enum ChannelError {
    /// The peer closed its end or the pipe broke.
    Disconnected(io::Error),
    /// An earlier write stopped part way through a frame.
    Broken,
    /// The peer sent bytes that are not a valid frame.
    Protocol(Error),
    /// A frame was refused before any of it was written.
    Rejected(Error),
}

/// Reads frames from one direction of the channel
///
/// Partial progress lives in the reader itself, so a `next` future that is
/// dropped before completing does not lose bytes.
pub(crate) struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    filled: usize,
    direction: Direction,
    next_seq: u64,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, direction: Direction, max_frame_len: u32) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            filled: 0,
            direction,
            next_seq: 0,
            max_frame_len: max_frame_len as usize,
        }
    }

    /// Wait for the next complete frame
    pub async fn next(&mut self) -> Result<Frame, ChannelError> {
        self.fill(LEN_PREFIX).await?;

        let len = frame_len(&self.buf);
        if len < HEADER_LEN || len > self.max_frame_len {
            return Err(ChannelError::Protocol(Error::Protocol(format!(
                "invalid frame length {len}"
            ))));
        }

        self.fill(LEN_PREFIX + len).await?;

        let frame = Frame::from_bytes(&self.buf[LEN_PREFIX..], self.direction, self.next_seq);
        self.reset();
        let frame = frame.map_err(ChannelError::Protocol)?;

        tracing::trace!(seq = self.next_seq, len, "received frame");
        self.next_seq += 1;
        Ok(frame)
    }

    async fn fill(&mut self, target: usize) -> Result<(), ChannelError> {
        if self.buf.len() < target {
            self.buf.resize(target, 0);
        }

        while self.filled < target {
            match self.inner.read(&mut self.buf[self.filled..target]).await {
                Ok(0) => {
                    return Err(ChannelError::Disconnected(
                        io::ErrorKind::UnexpectedEof.into(),
                    ));
                }
                Ok(n) => self.filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ChannelError::Disconnected(e)),
            }
        }

        Ok(())
    }

    fn reset(&mut self) {
        self.filled = 0;
        if self.buf.capacity() > RETAINED_BUFFER {
            self.buf = Vec::new();
        } else {
            self.buf.clear();
        }
    }
}

/// Writes frames into one direction of the channel
pub(crate) struct FrameWriter<W> {
    inner: W,
    direction: Direction,
    next_seq: u64,
    max_frame_len: u32,
    dirty: bool,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, direction: Direction, max_frame_len: u32) -> Self {
        Self {
            inner,
            direction,
            next_seq: 0,
            max_frame_len,
            dirty: false,
        }
    }

    /// Never send frames longer than the peer is willing to read
    pub fn limit_frame_len(&mut self, peer_max: u32) {
        self.max_frame_len = self.max_frame_len.min(peer_max);
    }

    #[cfg(test)]
    pub fn max_frame_len(&self) -> u32 {
        self.max_frame_len
    }

    /// Write one whole frame and flush it
    ///
    /// If the write fails or the future is dropped part way, the writer stays
    /// broken: the peer may hold half a frame and nothing after it can be trusted.
    pub async fn send(&mut self, frame: &Frame) -> Result<u64, ChannelError> {
        if self.dirty {
            return Err(ChannelError::Broken);
        }

        let seq = self.next_seq;
        let bytes = frame
            .to_bytes(self.direction, seq, self.max_frame_len)
            .map_err(ChannelError::Rejected)?;

        self.dirty = true;
        self.inner
            .write_all(&bytes)
            .await
            .map_err(ChannelError::Disconnected)?;
        self.inner
            .flush()
            .await
            .map_err(ChannelError::Disconnected)?;
        self.dirty = false;

        tracing::trace!(seq, len = bytes.len(), "sent frame");
        self.next_seq += 1;
        Ok(seq)
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Both halves of a control channel backed by pipes
pub(crate) struct Endpoint {
    pub reader: Mutex<FrameReader<Async<File>>>,
    pub writer: Mutex<FrameWriter<Async<File>>>,
}

impl Endpoint {
    /// Wrap the read end of the incoming pipe and the write end of the outgoing pipe
    ///
    /// `outgoing` is the direction of the frames this endpoint writes.
    pub fn new(
        read: OwnedFd,
        write: OwnedFd,
        outgoing: Direction,
        max_frame_len: u32,
    ) -> io::Result<Self> {
        let incoming = match outgoing {
            Direction::Request => Direction::Response,
            Direction::Response => Direction::Request,
        };
        let reader = Async::new(File::from(read))?;
        let writer = Async::new(File::from(write))?;

        Ok(Self {
            reader: Mutex::new(FrameReader::new(reader, incoming, max_frame_len)),
            writer: Mutex::new(FrameWriter::new(writer, outgoing, max_frame_len)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    async fn encode_all(frames: &[Frame], direction: Direction) -> Vec<u8> {
        let mut writer = FrameWriter::new(Vec::new(), direction, DEFAULT_MAX_FRAME_LEN);
        for frame in frames {
            writer.send(frame).await.unwrap();
        }
        writer.into_inner()
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let frames: Vec<Frame> = (0u32..4)
            .rev()
            .map(|n| Frame::data(&n).unwrap())
            .collect();
        let bytes = encode_all(&frames, Direction::Response).await;

        let mut reader = FrameReader::new(bytes.as_slice(), Direction::Response, 1024);
        let mut values = Vec::new();
        for _ in 0..4 {
            let Frame::Data(payload) = reader.next().await.unwrap() else {
                panic!("expected data frame");
            };
            values.push(Frame::decode_payload::<u32>(&payload).unwrap());
        }
        assert_eq!(values, vec![3, 2, 1, 0]);

        assert!(matches!(
            reader.next().await,
            Err(ChannelError::Disconnected(e)) if e.kind() == io::ErrorKind::UnexpectedEof
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_disconnect() {
        let bytes = encode_all(&[Frame::data("hello").unwrap()], Direction::Request).await;
        let truncated = &bytes[..bytes.len() - 2];

        let mut reader = FrameReader::new(truncated, Direction::Request, 1024);
        assert!(matches!(
            reader.next().await,
            Err(ChannelError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let bytes = encode_all(&[Frame::data(&vec![7u8; 4096]).unwrap()], Direction::Request).await;

        let mut reader = FrameReader::new(bytes.as_slice(), Direction::Request, 1024);
        match reader.next().await {
            Err(ChannelError::Protocol(e)) => assert_eq!(e.kind(), ErrorKind::Protocol),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_writer_refuses_frames_over_peer_limit() {
        let mut writer = FrameWriter::new(Vec::new(), Direction::Request, 1024);
        writer.limit_frame_len(64);
        writer.limit_frame_len(4096);
        assert_eq!(writer.max_frame_len(), 64);

        match writer.send(&Frame::data(&vec![1u8; 100]).unwrap()).await {
            Err(ChannelError::Rejected(e)) => assert_eq!(e.kind(), ErrorKind::FrameTooLarge),
            other => panic!("expected rejected frame, got {other:?}"),
        }

        // Nothing was written, and the writer is still usable.
        assert_eq!(writer.send(&Frame::data(&1u8).unwrap()).await.unwrap(), 0);
        let bytes = writer.into_inner();
        let mut reader = FrameReader::new(bytes.as_slice(), Direction::Request, 64);
        assert_eq!(reader.next().await.unwrap(), Frame::data(&1u8).unwrap());
    }

    #[tokio::test]
    async fn test_replayed_frame_rejected() {
        let frame = Frame::data(&1u8).unwrap();
        let mut bytes = frame.to_bytes(Direction::Request, 0, 1024).unwrap();
        bytes.extend(frame.to_bytes(Direction::Request, 0, 1024).unwrap());

        let mut reader = FrameReader::new(bytes.as_slice(), Direction::Request, 1024);
        assert!(reader.next().await.is_ok());
        assert!(matches!(reader.next().await, Err(ChannelError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_pipe_endpoints_talk() {
        let (client_read, server_write) = nix::unistd::pipe().unwrap();
        let (server_read, client_write) = nix::unistd::pipe().unwrap();

        let client = Endpoint::new(client_read, client_write, Direction::Request, 1024).unwrap();
        let server = Endpoint::new(server_read, server_write, Direction::Response, 1024).unwrap();

        client
            .writer
            .lock()
            .await
            .send(&Frame::data("ping").unwrap())
            .await
            .unwrap();
        let request = server.reader.lock().await.next().await.unwrap();
        assert_eq!(request, Frame::data("ping").unwrap());

        server
            .writer
            .lock()
            .await
            .send(&Frame::Shutdown)
            .await
            .unwrap();
        assert_eq!(client.reader.lock().await.next().await.unwrap(), Frame::Shutdown);
    }
}
