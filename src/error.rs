use std::fmt;
use std::io;

use thiserror::Error;

/// Result type for forkrpc operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to a server process
#[derive(Error, Debug)]
pub enum Error {
    /// The bytes the peer sent do not decode as the type requested at this call site.
    #[error("failed to decode {expected}: {source}")]
    Decode {
        expected: &'static str,
        #[source]
        source: rmp_serde::decode::Error,
    },

    /// A value could not be encoded; nothing was written to the channel.
    #[error("failed to encode {type_name}: {source}")]
    Encode {
        type_name: &'static str,
        #[source]
        source: rmp_serde::encode::Error,
    },

    /// A frame was larger than the peer accepts; nothing was written to the channel.
    #[error("frame of {len} bytes exceeds the limit of {max} bytes")]
    FrameTooLarge { len: usize, max: u32 },

    /// A fault that happened inside the server process.
    #[error(transparent)]
    External(#[from] ExternalFailure),

    #[error("server killed by signal {signal}")]
    ServerKilled { signal: i32 },

    #[error("server was manually shut down")]
    ManualShutdown,

    #[error("conversation used outside of its scope")]
    IllscopedConversation,

    #[error("control channel closed")]
    ChannelClosed,

    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Raised by request handlers; reaches the client as an application fault.
    #[error("{0}")]
    Application(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid server arguments: {0}")]
    InvalidArgs(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Create an application error from a message
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application(message.into())
    }

    /// The class of this error, comparable across observations
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Decode { .. } => ErrorKind::LocalDecode,
            Self::Encode { .. } => ErrorKind::LocalEncode,
            Self::FrameTooLarge { .. } => ErrorKind::FrameTooLarge,
            Self::External(failure) => match failure.origin() {
                FaultOrigin::Decode => ErrorKind::RemoteDecode,
                FaultOrigin::Application => ErrorKind::RemoteApplication,
                FaultOrigin::Exit { .. } => ErrorKind::ServerExited,
            },
            Self::ServerKilled { .. } => ErrorKind::ServerKilled,
            Self::ManualShutdown => ErrorKind::ManualShutdown,
            Self::IllscopedConversation => ErrorKind::IllscopedConversation,
            Self::ChannelClosed => ErrorKind::ChannelClosed,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Application(_) => ErrorKind::Application,
            Self::Spawn { .. } => ErrorKind::Spawn,
            Self::InvalidArgs(_) => ErrorKind::InvalidArgs,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// The external failure carried by this error, if any
    pub fn as_external(&self) -> Option<&ExternalFailure> {
        match self {
            Self::External(failure) => Some(failure),
            _ => None,
        }
    }

    pub(crate) fn decode<T>(source: rmp_serde::decode::Error) -> Self {
        Self::Decode {
            expected: std::any::type_name::<T>(),
            source,
        }
    }

    pub(crate) fn encode<T: ?Sized>(source: rmp_serde::encode::Error) -> Self {
        Self::Encode {
            type_name: std::any::type_name::<T>(),
            source,
        }
    }
}

/// Classification of [`Error`] values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    LocalDecode,
    LocalEncode,
    FrameTooLarge,
    RemoteDecode,
    RemoteApplication,
    ServerExited,
    ServerKilled,
    ManualShutdown,
    IllscopedConversation,
    ChannelClosed,
    Protocol,
    Application,
    Spawn,
    InvalidArgs,
    Io,
}

/// Where an external failure originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOrigin {
    /// The server could not decode what the client sent.
    Decode,
    /// The server raised an error while producing a response.
    Application,
    /// The server process exited without being asked to.
    Exit { code: i32 },
}

/// A fault that occurred in the remote process, with its diagnostic text
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExternalFailure {
    origin: FaultOrigin,
    message: String,
}

impl ExternalFailure {
    pub fn new(origin: FaultOrigin, message: impl Into<String>) -> Self {
        Self {
            origin,
            message: message.into(),
        }
    }

    pub fn origin(&self) -> FaultOrigin {
        self.origin
    }

    /// Diagnostic text captured verbatim from the server
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Exit code, when the failure is an unrequested exit
    pub fn exit_code(&self) -> Option<i32> {
        match self.origin {
            FaultOrigin::Exit { code } => Some(code),
            _ => None,
        }
    }
}

impl fmt::Display for ExternalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            FaultOrigin::Decode => write!(f, "server could not decode request")?,
            FaultOrigin::Application => write!(f, "server raised an error")?,
            FaultOrigin::Exit { code } => write!(f, "server exited with code {code}")?,
        }
        let message = self.message.trim_end();
        if !message.is_empty() {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ExternalFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_kinds() {
        let decode = Error::from(ExternalFailure::new(FaultOrigin::Decode, "bad tag"));
        let app = Error::from(ExternalFailure::new(FaultOrigin::Application, "boom"));
        let exit = Error::from(ExternalFailure::new(FaultOrigin::Exit { code: 3 }, ""));

        assert_eq!(decode.kind(), ErrorKind::RemoteDecode);
        assert_eq!(app.kind(), ErrorKind::RemoteApplication);
        assert_eq!(exit.kind(), ErrorKind::ServerExited);
        assert_eq!(exit.as_external().and_then(|e| e.exit_code()), Some(3));
    }

    #[test]
    fn test_external_display() {
        let failure = ExternalFailure::new(FaultOrigin::Exit { code: 2 }, "panicked at main.rs\n");
        assert_eq!(failure.to_string(), "server exited with code 2: panicked at main.rs");

        let silent = ExternalFailure::new(FaultOrigin::Exit { code: 1 }, "");
        assert_eq!(silent.to_string(), "server exited with code 1");
    }
}
