//! Engine event logging.
//!
//! Debug output is routed through an injected [`LogHandle`] instead of a
//! process-wide flag: hosts that want diagnostics install an [`EventSink`],
//! everyone else pays nothing. The engine itself holds no static state.
//!
//! # Example
//!
//! ```rust
//! use serpoll::core::logging::{LogHandle, TracingSink};
//! use std::sync::Arc;
//!
//! let log = LogHandle::new(Arc::new(TracingSink));
//! ```

use std::sync::Arc;

/// An event emitted by the engine core.
///
/// Fields are plain values so sinks never reach back into engine state.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A channel finished initialization.
    ChannelCreated {
        /// Channel description (`device:name`).
        channel: String,
        /// Number of memory blocks backing it.
        blocks: usize,
    },

    /// A channel was enabled or disabled at runtime.
    ChannelEnabled {
        /// Channel description.
        channel: String,
        /// New state.
        enabled: bool,
    },

    /// A memory block received its cache buffer.
    CacheAssigned {
        /// Block description (`type index:address`).
        block: String,
        /// Cache size in bytes.
        size: usize,
    },

    /// A channel's value changed on read.
    ValueChanged {
        /// Channel description.
        channel: String,
        /// New raw value.
        raw: u64,
    },

    /// A channel's error state changed.
    ErrorChanged {
        /// Channel description.
        channel: String,
        /// Rendered error state.
        state: String,
    },

    /// A query finished with a non-OK status.
    QueryFailed {
        /// Device name.
        device: String,
        /// First block address of the query.
        start: u32,
        /// Register span of the query.
        count: u32,
        /// Rendered status.
        status: String,
    },

    /// A poll cycle ended.
    CycleEnd {
        /// Device name.
        device: String,
        /// Whether every query of the cycle succeeded.
        ok: bool,
        /// Consecutive failed cycles so far.
        fail_cycles: u32,
    },

    /// Device connectivity changed.
    ConnectionChanged {
        /// Device name.
        device: String,
        /// True when the device is now considered disconnected.
        disconnected: bool,
    },
}

/// Receives engine events.
pub trait EventSink: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &EngineEvent);
}

/// Sink that discards everything.
pub struct NoopSink;

impl EventSink for NoopSink {
    fn on_event(&self, _event: &EngineEvent) {}
}

/// Sink that forwards events to the `tracing` macros.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_event(&self, event: &EngineEvent) {
        use tracing::{debug, info, trace, warn};

        match event {
            EngineEvent::ChannelCreated { channel, blocks } => {
                debug!(channel = %channel, blocks = blocks, "channel created");
            }
            EngineEvent::ChannelEnabled { channel, enabled } => {
                info!(channel = %channel, enabled = enabled, "channel enabled state changed");
            }
            EngineEvent::CacheAssigned { block, size } => {
                debug!(block = %block, size = size, "cache assigned");
            }
            EngineEvent::ValueChanged { channel, raw } => {
                trace!(channel = %channel, raw = raw, "value changed");
            }
            EngineEvent::ErrorChanged { channel, state } => {
                warn!(channel = %channel, state = %state, "error state changed");
            }
            EngineEvent::QueryFailed {
                device,
                start,
                count,
                status,
            } => {
                warn!(device = %device, start = start, count = count, status = %status, "query failed");
            }
            EngineEvent::CycleEnd {
                device,
                ok,
                fail_cycles,
            } => {
                trace!(device = %device, ok = ok, fail_cycles = fail_cycles, "poll cycle end");
            }
            EngineEvent::ConnectionChanged {
                device,
                disconnected,
            } => {
                if *disconnected {
                    warn!(device = %device, "device disconnected");
                } else {
                    info!(device = %device, "device reconnected");
                }
            }
        }
    }
}

/// Cloneable handle the engine threads event emission through.
///
/// A disabled handle skips event construction entirely: [`LogHandle::emit`]
/// takes a closure that only runs when a sink is installed.
#[derive(Clone, Default)]
pub struct LogHandle {
    sink: Option<Arc<dyn EventSink>>,
}

impl LogHandle {
    /// Handle with an installed sink.
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Handle that drops all events.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// Check whether a sink is installed.
    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Emit an event, building it lazily.
    pub fn emit(&self, build: impl FnOnce() -> EngineEvent) {
        if let Some(sink) = &self.sink {
            sink.on_event(&build());
        }
    }
}

impl std::fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogHandle")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
