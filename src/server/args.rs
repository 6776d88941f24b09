//! Parsing the invocation suffix a server is started with
//!
//! A server is invoked as
//! `<program> [app args...] --forkrpc <wire-version> <request-fd> <response-fd>`.
//! Everything before the last delimiter belongs to the application.

use std::ffi::OsString;
use std::os::fd::RawFd;

use crate::error::{Error, Result};

/// Marks the start of the suffix appended by [`Command::spawn`](crate::Command::spawn)
pub const ARGS_DELIMITER: &str = "--forkrpc";

/// The arguments appended after the application's own
pub(crate) fn invocation_suffix(version: u32, request_fd: RawFd, response_fd: RawFd) -> [String; 4] {
    [
        ARGS_DELIMITER.to_string(),
        version.to_string(),
        request_fd.to_string(),
        response_fd.to_string(),
    ]
}

/// Command line of a server process, split into application and channel parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerArgs {
    program: OsString,
    app_args: Vec<OsString>,
    version: u32,
    request_fd: RawFd,
    response_fd: RawFd,
}

impl ServerArgs {
    /// Parse the current process's arguments
    pub fn from_env() -> Result<Self> {
        Self::parse(std::env::args_os())
    }

    /// Parse a full argument list, program name first
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        if args.is_empty() {
            return Err(Error::InvalidArgs("empty argument list".to_string()));
        }
        let program = args.remove(0);

        let delimiter = args
            .iter()
            .rposition(|arg| arg == ARGS_DELIMITER)
            .ok_or_else(|| Error::InvalidArgs(format!("missing {ARGS_DELIMITER}")))?;

        let suffix = args.split_off(delimiter);
        let [_, version, request_fd, response_fd] = suffix.as_slice() else {
            return Err(Error::InvalidArgs(format!(
                "expected 3 values after {ARGS_DELIMITER}, got {}",
                suffix.len() - 1
            )));
        };

        let version = parse_number(version, "wire version")?;
        let request_fd = parse_number(request_fd, "request descriptor")?;
        let response_fd = parse_number(response_fd, "response descriptor")?;

        if request_fd < 0 || response_fd < 0 || request_fd == response_fd {
            return Err(Error::InvalidArgs(format!(
                "invalid descriptors {request_fd} and {response_fd}"
            )));
        }

        Ok(Self {
            program,
            app_args: args,
            version,
            request_fd,
            response_fd,
        })
    }

    pub fn program(&self) -> &OsString {
        &self.program
    }

    /// Arguments meant for the application, in order
    pub fn app_args(&self) -> &[OsString] {
        &self.app_args
    }

    /// Program name followed by the application arguments, ready for an argument parser
    pub fn app_command_line(&self) -> Vec<OsString> {
        std::iter::once(self.program.clone())
            .chain(self.app_args.iter().cloned())
            .collect()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub(crate) fn request_fd(&self) -> RawFd {
        self.request_fd
    }

    pub(crate) fn response_fd(&self) -> RawFd {
        self.response_fd
    }
}

fn parse_number<T: std::str::FromStr>(value: &OsString, what: &str) -> Result<T> {
    value
        .to_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::InvalidArgs(format!("invalid {what}: {}", value.to_string_lossy())))
}
