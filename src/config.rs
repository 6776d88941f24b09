use std::time::Duration;

use crate::channel::DEFAULT_MAX_FRAME_LEN;

/// Settings that govern one spawned server and its control channel
#[derive(Debug, Clone)]
pub struct SessionConfig {
    shutdown_timeout: Duration,
    exit_grace: Duration,
    stderr_capacity: usize,
    max_frame_len: u32,
    forward_stderr: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(5),
            exit_grace: Duration::from_secs(2),
            stderr_capacity: 64 * 1024,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            forward_stderr: false,
        }
    }
}

impl SessionConfig {
    /// Create a new builder for SessionConfig
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// How long `shutdown` waits for the server to exit before killing it
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// How long a broken channel waits for the exit status before reporting `ChannelClosed`
    pub fn exit_grace(&self) -> Duration {
        self.exit_grace
    }

    /// Number of trailing stderr bytes kept for diagnostics
    pub fn stderr_capacity(&self) -> usize {
        self.stderr_capacity
    }

    pub fn max_frame_len(&self) -> u32 {
        self.max_frame_len
    }

    /// Whether the server's stderr is copied to ours as it is captured
    pub fn forward_stderr(&self) -> bool {
        self.forward_stderr
    }
}

/// Builder for SessionConfig
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    inner: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.inner.shutdown_timeout = timeout;
        self
    }

    pub fn exit_grace(mut self, grace: Duration) -> Self {
        self.inner.exit_grace = grace;
        self
    }

    pub fn stderr_capacity(mut self, bytes: usize) -> Self {
        self.inner.stderr_capacity = bytes;
        self
    }

    pub fn max_frame_len(mut self, bytes: u32) -> Self {
        self.inner.max_frame_len = bytes;
        self
    }

    pub fn forward_stderr(mut self, enabled: bool) -> Self {
        self.inner.forward_stderr = enabled;
        self
    }

    pub fn build(self) -> SessionConfig {
        self.inner
    }
}
