//! Error types for the polling engine.
//!
//! Planning errors (bad channel layout, oversize queries, unknown register
//! types) surface as `Result` at the public entry points and are fatal for
//! the affected channel at startup. Runtime failures never unwind past the
//! device driver: they are captured into a query status and converted to
//! per-channel error bits.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors reported by the polling engine core.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// A planned query violates protocol or device limits, or mixes
    /// incompatible memory blocks.
    #[error("invalid query configuration: {0}")]
    InvalidQueryConfiguration(String),

    /// Two channels claim intersecting bits of the same memory block.
    #[error("overlapping channels: {0}")]
    Overlap(String),

    /// A channel references a register type missing from the protocol table.
    #[error("unknown register type {type_index} for protocol '{protocol}'")]
    UnknownRegisterType {
        protocol: &'static str,
        type_index: u32,
    },

    /// A channel's bit range does not fit into a 64-bit value.
    #[error("channel '{channel}' is {width} bits wide, must be 64 or less")]
    ChannelTooWide { channel: String, width: u32 },

    /// A text value could not be parsed for the channel's format.
    #[error("invalid value '{value}' for format {format}")]
    InvalidValue { value: String, format: String },

    /// Write attempted on a read-only channel.
    #[error("channel '{0}' is read-only")]
    ReadOnlyChannel(String),

    /// A driver handed back a payload of the wrong size.
    #[error("unexpected payload size: expected {expected} bytes, got {actual}")]
    PayloadSize { expected: usize, actual: usize },

    /// Invalid configuration outside the more specific categories.
    #[error("configuration error: {0}")]
    Config(String),

    /// The owning device was dropped while the channel was still in use.
    #[error("device no longer exists")]
    DeviceGone,
}

impl EngineError {
    /// Create an invalid-query-configuration error.
    pub fn invalid_query<S: Into<String>>(message: S) -> Self {
        Self::InvalidQueryConfiguration(message.into())
    }

    /// Create an overlap error.
    pub fn overlap<S: Into<String>>(message: S) -> Self {
        Self::Overlap(message.into())
    }

    /// Create a configuration error.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create an invalid-value error.
    pub fn invalid_value(value: impl Into<String>, format: impl Into<String>) -> Self {
        Self::InvalidValue {
            value: value.into(),
            format: format.into(),
        }
    }

    /// Check whether the error is fatal at planning time.
    ///
    /// Planning errors disable the affected channel; everything else is a
    /// runtime condition the poll loop recovers from.
    pub fn is_planning_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidQueryConfiguration(_)
                | Self::Overlap(_)
                | Self::UnknownRegisterType { .. }
                | Self::ChannelTooWide { .. }
                | Self::Config(_)
        )
    }
}
