/// Client configuration and protocol defaults
///
/// Connection settings for a debug-stub session. Everything here is plain
/// data; the values are read once when a client connects.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Host used when none is given.
pub const DEFAULT_HOST: &str = "localhost";

/// Port the DOSBox-X debug stub listens on by default.
pub const DEFAULT_PORT: u16 = 2159;

/// How long to wait for an acknowledgment or an immediate reply.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest number of bytes requested by a single `m`/`M` packet.
pub const DEFAULT_MAX_MEMORY_CHUNK: usize = 4096;

/// Settings for one debug-stub session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Milliseconds to wait for acks and non-execution replies.
    pub response_timeout_ms: u64,
    /// Milliseconds allowed for the TCP connect.
    pub connect_timeout_ms: u64,
    pub max_memory_chunk: usize,
    /// Negotiate `QStartNoAckMode` right after connecting.
    pub no_ack_mode: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT.as_millis() as u64,
            connect_timeout_ms: DEFAULT_RESPONSE_TIMEOUT.as_millis() as u64,
            max_memory_chunk: DEFAULT_MAX_MEMORY_CHUNK,
            no_ack_mode: false,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_memory_chunk(mut self, bytes: usize) -> Self {
        self.max_memory_chunk = bytes.max(1);
        self
    }

    pub fn with_no_ack_mode(mut self, enabled: bool) -> Self {
        self.no_ack_mode = enabled;
        self
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `host:port` form used in log lines and error messages
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
