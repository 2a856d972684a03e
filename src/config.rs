//! Connection configuration.
//!
//! The configuration object is supplied already formed; [`ConnectionConfig::from_json`]
//! exists for embedding it in a larger JSON document, and every field has a
//! default so partial documents are accepted.
//!
//! # Example
//!
//! ```
//! use callwire::ConnectionConfig;
//!
//! let config = ConnectionConfig::from_json(r#"{ "default_call_timeout_ms": 3000 }"#).unwrap();
//! assert_eq!(config.default_call_timeout().as_millis(), 3000);
//! assert_eq!(config.max_concurrent_calls, 256);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CallwireError, Result};
use crate::protocol::{DEFAULT_MAX_FRAME_LENGTH, LENGTH_COVERED_HEADER};
use crate::writer::WriterConfig;

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Largest accepted frame length (length field value). Clamped to the
    /// 24-bit field maximum.
    pub max_frame_length: u32,
    /// Timeout for calls that do not specify one.
    pub default_call_timeout_ms: u64,
    /// How long a streaming call may wait for `STREAM_OPEN`.
    pub stream_open_timeout_ms: u64,
    /// Timer wheel tick.
    pub timer_tick_ms: u64,
    /// Timer wheel slot count.
    pub timer_wheel_size: usize,
    /// Maximum concurrently executing server-side calls.
    pub max_concurrent_calls: usize,
    /// Socket read buffer size.
    pub read_buffer_size: usize,
    /// Queued frames before writer backpressure applies.
    pub writer_max_pending_frames: usize,
    /// Writer channel capacity.
    pub writer_channel_capacity: usize,
    /// How long a send waits for writer backpressure to clear.
    pub writer_backpressure_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            default_call_timeout_ms: 60_000,
            stream_open_timeout_ms: 30_000,
            timer_tick_ms: 10,
            timer_wheel_size: 512,
            max_concurrent_calls: 256,
            read_buffer_size: 64 * 1024,
            writer_max_pending_frames: 1024,
            writer_channel_capacity: 1024,
            writer_backpressure_timeout_ms: 5_000,
        }
    }
}

impl ConnectionConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if (self.max_frame_length as usize) <= LENGTH_COVERED_HEADER {
            return Err(CallwireError::InvalidConfig(format!(
                "max_frame_length must exceed {}",
                LENGTH_COVERED_HEADER
            )));
        }
        if self.timer_tick_ms == 0 {
            return Err(CallwireError::InvalidConfig(
                "timer_tick_ms must be positive".to_string(),
            ));
        }
        if self.timer_wheel_size == 0 {
            return Err(CallwireError::InvalidConfig(
                "timer_wheel_size must be positive".to_string(),
            ));
        }
        if self.max_concurrent_calls == 0 {
            return Err(CallwireError::InvalidConfig(
                "max_concurrent_calls must be positive".to_string(),
            ));
        }
        if self.read_buffer_size == 0 || self.writer_channel_capacity == 0 {
            return Err(CallwireError::InvalidConfig(
                "buffer sizes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Default call timeout.
    pub fn default_call_timeout(&self) -> Duration {
        Duration::from_millis(self.default_call_timeout_ms)
    }

    /// Stream open timeout.
    pub fn stream_open_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_open_timeout_ms)
    }

    /// Timer wheel tick.
    pub fn timer_tick(&self) -> Duration {
        Duration::from_millis(self.timer_tick_ms)
    }

    pub(crate) fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_pending_frames: self.writer_max_pending_frames,
            channel_capacity: self.writer_channel_capacity,
            backpressure_timeout: Duration::from_millis(self.writer_backpressure_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.max_frame_length, 16 * 1024 * 1024);
        assert_eq!(config.default_call_timeout(), Duration::from_secs(60));
        assert_eq!(config.stream_open_timeout(), Duration::from_secs(30));
        assert_eq!(config.timer_tick(), Duration::from_millis(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            ConnectionConfig::from_json(r#"{"max_concurrent_calls": 8, "timer_tick_ms": 5}"#)
                .unwrap();
        assert_eq!(config.max_concurrent_calls, 8);
        assert_eq!(config.timer_tick_ms, 5);
        assert_eq!(config.timer_wheel_size, 512);
    }

    #[test]
    fn test_invalid_json_is_reported() {
        let result = ConnectionConfig::from_json("{ not json");
        assert!(matches!(result, Err(CallwireError::Json(_))));
    }

    #[test]
    fn test_validation_rejects_zero_tick() {
        let result = ConnectionConfig::from_json(r#"{"timer_tick_ms": 0}"#);
        assert!(matches!(result, Err(CallwireError::InvalidConfig(_))));
    }

    #[test]
    fn test_validation_rejects_tiny_frames() {
        let config = ConnectionConfig {
            max_frame_length: 21,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_writer_config_mapping() {
        let config = ConnectionConfig {
            writer_max_pending_frames: 10,
            writer_channel_capacity: 20,
            writer_backpressure_timeout_ms: 30,
            ..Default::default()
        };
        let writer = config.writer_config();
        assert_eq!(writer.max_pending_frames, 10);
        assert_eq!(writer.channel_capacity, 20);
        assert_eq!(writer.backpressure_timeout, Duration::from_millis(30));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = ConnectionConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(ConnectionConfig::from_json(&json).unwrap(), config);
    }
}
