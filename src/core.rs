//! Core building blocks of the polling engine.
//!
//! Errors, the configuration surface, value formats and the injected event
//! log. Everything here is protocol-agnostic.

pub mod config;
pub mod error;
pub mod format;
pub mod logging;

pub use config::{ChannelSettings, DeviceSettings, QueryPolicy, WordOrder};
pub use error::{EngineError, Result};
pub use format::{RegisterFormat, ValueFormatter};
pub use logging::{EngineEvent, EventSink, LogHandle, NoopSink, TracingSink};
