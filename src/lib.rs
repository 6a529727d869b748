//! # serpoll
//!
//! Polling engine core for industrial serial-bus devices (Modbus and
//! family). A configuration describes ports, devices and channels; the
//! engine turns that declarative view into minimal, correct wire traffic:
//! bulk reads merged within per-protocol limits, writes split so they never
//! corrupt unaddressed bits, partial-write caching, publish debouncing and
//! per-device disconnect recovery.
//!
//! The crate performs no I/O itself. It produces [`Query`] objects; a
//! [`DeviceDriver`] owned by the host executes them inline on the port's
//! worker thread. Protocol framing, serial/TCP plumbing, configuration
//! parsing and the publish front-end all live outside.
//!
//! ## Layers
//!
//! ```text
//! ChannelSettings ──► VirtualRegister   user-visible values: format,
//!        │                  │           scaling, publish/error state
//!        │                  ▼
//!        │            MemoryBlock       protocol-addressable units,
//!        │                  │           shared through the device arena
//!        ▼                  ▼
//!   QueryFactory ───────► Query         bulk transfers the driver executes
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use serpoll::prelude::*;
//! use serpoll::protocols::modbus::{self, ModbusProtocolInfo};
//! use std::sync::Arc;
//!
//! # struct MyDriver;
//! # impl serpoll::DeviceDriver for MyDriver {
//! #     fn execute(&mut self, _query: &serpoll::Query) {}
//! # }
//! let device = Device::new(
//!     "meter",
//!     DeviceSettings { max_reg_hole: 2, ..DeviceSettings::default() },
//!     Arc::new(ModbusProtocolInfo),
//!     Box::new(MyDriver),
//! );
//!
//! let voltage = device.add_channel(
//!     &ChannelSettings::new("voltage", modbus::reg::HOLDING, 100),
//! )?;
//! device.allocate_caches();
//!
//! let sets = QueryFactory::plan_query_sets(&device.channels(), Operation::Read)?;
//! for set in &sets {
//!     device.run_poll_cycle(set);
//! }
//! println!("{}", voltage.get_text_value());
//! # Ok::<(), serpoll::EngineError>(())
//! ```

pub mod channel;
pub mod codec;
pub mod core;
pub mod device;
pub mod memory;
pub mod protocols;
pub mod query;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::channel::{ErrorState, FlushSignal, PublishKind, VirtualRegister};
    pub use crate::core::config::{ChannelSettings, DeviceSettings, QueryPolicy, WordOrder};
    pub use crate::core::error::{EngineError, Result};
    pub use crate::core::format::RegisterFormat;
    pub use crate::device::{Device, DeviceDriver};
    pub use crate::memory::block::{BindInfo, MemoryBlock, MemoryBlockType};
    pub use crate::query::factory::QueryFactory;
    pub use crate::query::{Operation, Query, QuerySet, QueryStatus};
}

// Re-export the main types at the crate root for convenience
pub use crate::channel::{ErrorState, FlushSignal, PublishKind, VirtualRegister};
pub use crate::core::config::{ChannelSettings, DeviceSettings, QueryPolicy, WordOrder};
pub use crate::core::error::{EngineError, Result};
pub use crate::core::format::RegisterFormat;
pub use crate::core::logging::{EngineEvent, EventSink, LogHandle, NoopSink, TracingSink};
pub use crate::device::{Device, DeviceDriver};
pub use crate::memory::block::{BindInfo, MemoryBlock, MemoryBlockType, MAX_MEMORY_BLOCK_SIZE};
pub use crate::protocols::ProtocolInfo;
pub use crate::query::factory::QueryFactory;
pub use crate::query::{Operation, Query, QuerySet, QueryStatus};

/// Widest value a channel may span, in bits.
pub const MAX_CHANNEL_WIDTH: u16 = 64;

/// Default poll interval applied when a channel does not name one.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
