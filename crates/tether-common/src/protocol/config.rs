//! Listener configuration.
//!
//! Every accepted connection inherits its initial framing, timeout and
//! backpressure limits from the [`ListenerConfig`] of the listener that
//! accepted it. Scripts describe the same settings with a plain options
//! object, deserialized into [`ListenOptions`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::error::{Result, TetherError};
use crate::transport::framing::{Framing, DEFAULT_CHUNK_SIZE, MAX_FRAME_SIZE};

/// Default number of outbound buffers a session may hold before the peer is
/// considered too slow and dropped.
pub const DEFAULT_MAX_PENDING: usize = 10;

/// When the script learns about a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectPolicy {
    /// `Connected` is delivered right before the first received payload.
    /// Connections that never send anything never reach the script.
    #[default]
    Deferred,
    /// `Connected` is delivered on accept, and the first read waits until the
    /// script has handled it.
    Eager,
}

/// Per-listener connection settings.
///
/// # Fields
///
/// - `framing` - Initial framing of accepted sessions (default: raw chunks)
/// - `io_timeout` - Per-read/per-write deadline, `Duration::ZERO` disables it
/// - `max_pending` - Outbound queue capacity (default: 10)
/// - `chunk_size` - Read buffer size in raw-chunk mode (default: 4096)
/// - `max_frame_size` - Largest accepted length-prefixed payload (default: 100 MB)
/// - `connect` - When `Connected` is delivered
///
/// # Example
///
/// ```
/// use tether_common::{Framing, ListenerConfig};
/// use std::time::Duration;
///
/// let config = ListenerConfig::new()
///     .with_framing(Framing::LengthPrefixed)
///     .with_io_timeout(Duration::from_secs(5));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub framing: Framing,
    pub io_timeout: Duration,
    pub max_pending: usize,
    pub chunk_size: usize,
    pub max_frame_size: usize,
    pub connect: ConnectPolicy,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            framing: Framing::RawChunk,
            io_timeout: Duration::ZERO,
            max_pending: DEFAULT_MAX_PENDING,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_frame_size: MAX_FRAME_SIZE,
            connect: ConnectPolicy::Deferred,
        }
    }
}

impl ListenerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Sets the per-operation deadline. `Duration::ZERO` means no deadline.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_connect_policy(mut self, connect: ConnectPolicy) -> Self {
        self.connect = connect;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `TetherError::InvalidConfig` if:
    /// - `max_pending` or `chunk_size` is zero
    /// - `max_frame_size` is zero or does not fit the 4-byte length header
    pub fn validate(&self) -> Result<()> {
        if self.max_pending == 0 {
            return Err(TetherError::InvalidConfig(
                "max pending must be greater than zero".to_string(),
            ));
        }

        if self.chunk_size == 0 {
            return Err(TetherError::InvalidConfig(
                "chunk size must be greater than zero".to_string(),
            ));
        }

        if self.max_frame_size == 0 || self.max_frame_size > u32::MAX as usize {
            return Err(TetherError::InvalidConfig(format!(
                "max frame size must be between 1 and {} (got {})",
                u32::MAX,
                self.max_frame_size
            )));
        }

        Ok(())
    }
}

/// Listen options as written by scripts.
///
/// ```text
/// net.listen("0.0.0.0:1234", onEvent, { lengthPrefixed: true, timeout: 30 })
/// ```
///
/// Unset fields keep the value of the base configuration. `timeout` is in
/// seconds and may be fractional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListenOptions {
    pub length_prefixed: Option<bool>,
    pub timeout: Option<f64>,
    pub eager: Option<bool>,
    pub max_pending: Option<usize>,
    pub max_frame_size: Option<usize>,
}

impl ListenOptions {
    /// Parses options from the JSON form of a script object.
    ///
    /// `null` (no options object) yields the defaults.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Applies these options on top of `base` and validates the result.
    pub fn apply(self, base: ListenerConfig) -> Result<ListenerConfig> {
        let mut config = base;

        if let Some(length_prefixed) = self.length_prefixed {
            config.framing = Framing::from_length_prefixed(length_prefixed);
        }
        if let Some(secs) = self.timeout {
            config.io_timeout = seconds_to_duration(secs)?;
        }
        if let Some(eager) = self.eager {
            config.connect = if eager {
                ConnectPolicy::Eager
            } else {
                ConnectPolicy::Deferred
            };
        }
        if let Some(max_pending) = self.max_pending {
            config.max_pending = max_pending;
        }
        if let Some(max_frame_size) = self.max_frame_size {
            config.max_frame_size = max_frame_size;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Converts a script-supplied number of seconds into a `Duration`.
///
/// # Errors
///
/// Returns `TetherError::InvalidConfig` for negative, NaN or infinite values.
pub fn seconds_to_duration(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| TetherError::InvalidConfig(format!("invalid duration {}s: {}", secs, e)))
}
