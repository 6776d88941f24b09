//! Wire protocol types for the control channel
//!
//! Wire format:
//! ```text
//! Frame:
//!   [4 bytes: length of the remainder (u32 BE)]
//!   [1 byte: direction ('Q' request, 'R' response)]
//!   [1 byte: frame kind (1 data, 2 failure, 3 shutdown, 4 ready)]
//!   [8 bytes: sequence number (u64 BE), counted per direction]
//!   [payload bytes]
//!
//! Payloads:
//!   data:     MessagePack value
//!   failure:  [1 byte: origin (1 decode, 2 application)][UTF-8 diagnostic text]
//!   shutdown: empty
//!   ready:    [4 bytes: wire version (u32 BE)][4 bytes: largest frame the sender accepts (u32 BE)]
//! ```

use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Error, FaultOrigin, Result};

/// Version of the framing above, exchanged in the `Ready` frame and on the command line
pub const WIRE_VERSION: u32 = 1;

/// Default upper bound on the size of a single frame
pub const DEFAULT_MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

pub(crate) const LEN_PREFIX: usize = 4;
pub(crate) const HEADER_LEN: usize = 10;

const KIND_DATA: u8 = 1;
const KIND_FAILURE: u8 = 2;
const KIND_SHUTDOWN: u8 = 3;
const KIND_READY: u8 = 4;

const ORIGIN_DECODE: u8 = 1;
const ORIGIN_APPLICATION: u8 = 2;

/// Which way a frame travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    /// Client to server
    Request,
    /// Server to client
    Response,
}

impl Direction {
    fn to_byte(self) -> u8 {
        match self {
            Self::Request => b'Q',
            Self::Response => b'R',
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'Q' => Some(Self::Request),
            b'R' => Some(Self::Response),
            _ => None,
        }
    }
}

/// Faults a server can report in a failure frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoteFault {
    Decode,
    Application,
}

impl From<RemoteFault> for FaultOrigin {
    fn from(fault: RemoteFault) -> Self {
        match fault {
            RemoteFault::Decode => FaultOrigin::Decode,
            RemoteFault::Application => FaultOrigin::Application,
        }
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    /// Raw MessagePack payload, decoded at the `get` call site
    Data(Vec<u8>),
    Failure { fault: RemoteFault, message: String },
    Shutdown,
    Ready { version: u32, max_frame_len: u32 },
}

impl Frame {
    /// Encode a value into a data frame
    pub fn data<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        rmp_serde::to_vec_named(value)
            .map(Self::Data)
            .map_err(Error::encode::<T>)
    }

    /// Decode a data payload as the given type
    pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
        rmp_serde::from_slice(payload).map_err(Error::decode::<T>)
    }

    fn kind(&self) -> u8 {
        match self {
            Self::Data(_) => KIND_DATA,
            Self::Failure { .. } => KIND_FAILURE,
            Self::Shutdown => KIND_SHUTDOWN,
            Self::Ready { .. } => KIND_READY,
        }
    }

    /// Length of the frame on the wire, not counting the length prefix
    fn encoded_len(&self) -> usize {
        let payload_len = match self {
            Self::Data(payload) => payload.len(),
            Self::Failure { message, .. } => 1 + message.len(),
            Self::Shutdown => 0,
            Self::Ready { .. } => 8,
        };
        HEADER_LEN + payload_len
    }

    /// Serialize to wire format, length prefix included
    ///
    /// Fails when the frame is longer than `max_len` or than the length prefix
    /// can express.
    pub fn to_bytes(&self, direction: Direction, seq: u64, max_len: u32) -> Result<Vec<u8>> {
        let total_len = self.encoded_len();
        let prefix = match u32::try_from(total_len) {
            Ok(len) if len <= max_len => len,
            _ => {
                return Err(Error::FrameTooLarge {
                    len: total_len,
                    max: max_len,
                });
            }
        };
        let mut buf = Vec::with_capacity(LEN_PREFIX + total_len);

        buf.extend_from_slice(&prefix.to_be_bytes());
        buf.push(direction.to_byte());
        buf.push(self.kind());
        buf.extend_from_slice(&seq.to_be_bytes());

        match self {
            Self::Data(payload) => buf.extend_from_slice(payload),
            Self::Failure { fault, message } => {
                buf.push(match fault {
                    RemoteFault::Decode => ORIGIN_DECODE,
                    RemoteFault::Application => ORIGIN_APPLICATION,
                });
                buf.extend_from_slice(message.as_bytes());
            }
            Self::Shutdown => {}
            Self::Ready {
                version,
                max_frame_len,
            } => {
                buf.extend_from_slice(&version.to_be_bytes());
                buf.extend_from_slice(&max_frame_len.to_be_bytes());
            }
        }

        Ok(buf)
    }

    /// Parse a frame from the bytes following the length prefix
    ///
    /// Checks the direction and sequence number against what the reader expects.
    pub fn from_bytes(data: &[u8], direction: Direction, expected_seq: u64) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Protocol(format!(
                "frame of {} bytes is shorter than its header",
                data.len()
            )));
        }

        match Direction::from_byte(data[0]) {
            Some(found) if found == direction => {}
            Some(found) => {
                return Err(Error::Protocol(format!(
                    "expected a {direction:?} frame, got a {found:?} frame"
                )));
            }
            None => {
                return Err(Error::Protocol(format!(
                    "invalid direction byte {:#04x}",
                    data[0]
                )));
            }
        }

        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&data[2..HEADER_LEN]);
        let seq = u64::from_be_bytes(seq_bytes);
        if seq != expected_seq {
            return Err(Error::Protocol(format!(
                "out of sequence frame: expected {expected_seq}, got {seq}"
            )));
        }

        let payload = &data[HEADER_LEN..];
        match data[1] {
            KIND_DATA => Ok(Self::Data(payload.to_vec())),
            KIND_FAILURE => {
                let (origin, text) = payload
                    .split_first()
                    .ok_or_else(|| Error::Protocol("empty failure frame".to_string()))?;
                let fault = match *origin {
                    ORIGIN_DECODE => RemoteFault::Decode,
                    ORIGIN_APPLICATION => RemoteFault::Application,
                    other => {
                        return Err(Error::Protocol(format!("invalid failure origin {other}")));
                    }
                };
                Ok(Self::Failure {
                    fault,
                    message: String::from_utf8_lossy(text).into_owned(),
                })
            }
            KIND_SHUTDOWN if payload.is_empty() => Ok(Self::Shutdown),
            KIND_READY if payload.len() == 8 => {
                let mut version = [0u8; 4];
                let mut max_frame_len = [0u8; 4];
                version.copy_from_slice(&payload[..4]);
                max_frame_len.copy_from_slice(&payload[4..]);
                Ok(Self::Ready {
                    version: u32::from_be_bytes(version),
                    max_frame_len: u32::from_be_bytes(max_frame_len),
                })
            }
            kind => Err(Error::Protocol(format!(
                "invalid frame kind {kind} with {} payload bytes",
                payload.len()
            ))),
        }
    }
}

/// Read the length prefix of a frame
pub(crate) fn frame_len(prefix: &[u8]) -> usize {
    let mut len = [0u8; LEN_PREFIX];
    len.copy_from_slice(&prefix[..LEN_PREFIX]);
    u32::from_be_bytes(len) as usize
}
