use std::time::Duration;

use crate::codec::DEFAULT_MAX_FRAME_SIZE;

pub const DEFAULT_MAX_CONNECTIONS: usize = 128;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Server configuration. Immutable once handed to [`crate::server::Server::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Live connections above this count are refused at accept time.
    pub max_connections: usize,
    /// Per-operation deadline handed to handlers.
    pub timeout: Duration,
    /// How long `shutdown` waits for accept loops to exit. Has no default.
    pub shutdown_timeout: Option<Duration>,
    /// Pause between accept attempts after a transient timeout.
    pub retry_delay: Duration,
    /// Largest frame a connection buffers before giving up on the peer.
    pub max_frame_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            timeout: DEFAULT_TIMEOUT,
            shutdown_timeout: None,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl Config {
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = Some(shutdown_timeout);
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Replaces zero values with their defaults and returns the grace period, or an error message
    /// when the caller never chose one.
    pub(crate) fn normalize(mut self) -> Result<(Self, Duration), String> {
        let shutdown_timeout = match self.shutdown_timeout {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => return Err("shutdown timeout must be set to a non-zero duration".to_string()),
        };

        if self.max_connections == 0 {
            self.max_connections = DEFAULT_MAX_CONNECTIONS;
        }
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        if self.retry_delay.is_zero() {
            self.retry_delay = DEFAULT_RETRY_DELAY;
        }
        if self.max_frame_size == 0 {
            self.max_frame_size = DEFAULT_MAX_FRAME_SIZE;
        }

        Ok((self, shutdown_timeout))
    }
}
