//! Devices: block arenas, drivers and the poll-cycle runner.
//!
//! A device owns the arena of memory blocks keyed by `(type index, address)`
//! (so channels landing on the same address share one block), the pooled
//! cache region, its channels, and the driver that moves query bytes over
//! the wire. Disconnect accounting lives here too: consecutive failed
//! cycles eventually mark the device disconnected, a successful cycle
//! clears it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::channel::VirtualRegister;
use crate::core::config::{ChannelSettings, DeviceSettings};
use crate::core::error::{EngineError, Result};
use crate::core::logging::{EngineEvent, LogHandle};
use crate::memory::block::{CacheHandle, CachePool, MemoryBlock};
use crate::protocols::ProtocolInfo;
use crate::query::{Operation, Query, QuerySet, QueryStatus};

/// Executes queries against a concrete transport.
///
/// A driver reads (or writes) exactly the bytes a query describes and
/// records the outcome: call [`Query::finalize_read`] /
/// [`Query::finalize_write`] on success, [`Query::set_status`] on failure.
/// Timeouts and framing are the driver's business; the core only sees the
/// final status.
pub trait DeviceDriver: Send {
    /// Execute one query, blocking as needed.
    fn execute(&mut self, query: &Query);
}

/// One polled device on a port.
pub struct Device {
    name: String,
    settings: DeviceSettings,
    protocol: Arc<dyn ProtocolInfo>,
    driver: Mutex<Box<dyn DeviceDriver>>,
    log: LogHandle,
    self_weak: Weak<Device>,

    blocks: RwLock<BTreeMap<(u32, u32), Arc<MemoryBlock>>>,
    channels: RwLock<Vec<Arc<VirtualRegister>>>,
    cache_pool: RwLock<Option<Arc<CachePool>>>,

    fail_cycles: AtomicU32,
    disconnected: AtomicBool,
}

impl Device {
    /// Create a device with logging disabled.
    pub fn new(
        name: impl Into<String>,
        settings: DeviceSettings,
        protocol: Arc<dyn ProtocolInfo>,
        driver: Box<dyn DeviceDriver>,
    ) -> Arc<Self> {
        Self::with_log(name, settings, protocol, driver, LogHandle::disabled())
    }

    /// Create a device with an injected event log.
    pub fn with_log(
        name: impl Into<String>,
        settings: DeviceSettings,
        protocol: Arc<dyn ProtocolInfo>,
        driver: Box<dyn DeviceDriver>,
        log: LogHandle,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|self_weak| Self {
            name,
            settings,
            protocol,
            driver: Mutex::new(driver),
            log,
            self_weak: self_weak.clone(),
            blocks: RwLock::new(BTreeMap::new()),
            channels: RwLock::new(Vec::new()),
            cache_pool: RwLock::new(None),
            fail_cycles: AtomicU32::new(0),
            disconnected: AtomicBool::new(false),
        })
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Planner and runner tuning.
    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    /// Protocol descriptor.
    pub fn protocol(&self) -> &Arc<dyn ProtocolInfo> {
        &self.protocol
    }

    /// The injected event log.
    pub fn log(&self) -> &LogHandle {
        &self.log
    }

    // ========== block arena ==========

    /// Fetch or create the block of `type_index` at `address`.
    ///
    /// The arena deduplicates by `(type index, address)`; a block created for
    /// one channel is reused by every later channel at the same address.
    pub fn ensure_block(
        &self,
        type_index: u32,
        address: u32,
        size: Option<u16>,
    ) -> Result<Arc<MemoryBlock>> {
        let key = (type_index, address);

        if let Some(existing) = self.blocks.read().expect("block arena poisoned").get(&key) {
            if let Some(size) = size {
                if existing.size() != size {
                    return Err(EngineError::config(format!(
                        "{} already exists with size {}, requested {}",
                        existing.describe(),
                        existing.size(),
                        size
                    )));
                }
            }
            return Ok(existing.clone());
        }

        let block_type = self.protocol.block_type(type_index).copied().ok_or(
            EngineError::UnknownRegisterType {
                protocol: self.protocol.name(),
                type_index,
            },
        )?;
        let block = Arc::new(MemoryBlock::new(
            address,
            block_type,
            size,
            self.self_weak.clone(),
        )?);

        let mut blocks = self.blocks.write().expect("block arena poisoned");
        Ok(blocks.entry(key).or_insert(block).clone())
    }

    /// Create (or reuse) a block bound to the device without any channel.
    ///
    /// Protocol-introspection memory, e.g. an energy meter's value array
    /// that the driver reads as a whole and slices itself.
    pub fn introspection_block(
        &self,
        type_index: u32,
        address: u32,
        size: Option<u16>,
    ) -> Result<Arc<MemoryBlock>> {
        let block = self.ensure_block(type_index, address, size)?;
        block.bind_device();
        Ok(block)
    }

    /// Snapshot of the arena in `(type index, address)` order.
    pub fn blocks(&self) -> Vec<Arc<MemoryBlock>> {
        self.blocks
            .read()
            .expect("block arena poisoned")
            .values()
            .cloned()
            .collect()
    }

    // ========== channels ==========

    /// Build and register a channel from its settings.
    pub fn add_channel(&self, settings: &ChannelSettings) -> Result<Arc<VirtualRegister>> {
        let this = self.self_weak.upgrade().ok_or(EngineError::DeviceGone)?;
        let channel = VirtualRegister::create(settings, &this)?;
        self.channels
            .write()
            .expect("channel list poisoned")
            .push(channel.clone());
        Ok(channel)
    }

    /// All channels of this device, in registration order.
    pub fn channels(&self) -> Vec<Arc<VirtualRegister>> {
        self.channels.read().expect("channel list poisoned").clone()
    }

    // ========== caching ==========

    /// Allocate the pooled cache region and hand each block its window.
    ///
    /// Call once, after all channels are added and queries are planned;
    /// blocks acquiring cache needs later (unusual) are covered by a
    /// follow-up call.
    pub fn allocate_caches(&self) {
        let needing: Vec<Arc<MemoryBlock>> = self
            .blocks
            .read()
            .expect("block arena poisoned")
            .values()
            .filter(|b| b.needs_caching() && b.cache_handle().is_none())
            .cloned()
            .collect();

        let total: usize = needing.iter().map(|b| usize::from(b.size())).sum();
        if total == 0 {
            return;
        }

        let pool = CachePool::with_size(total);
        let mut offset = 0;
        for block in needing {
            let size = usize::from(block.size());
            block.assign_cache(CacheHandle::new(pool.clone(), offset, size));
            offset += size;
            self.log.emit(|| EngineEvent::CacheAssigned {
                block: block.describe(),
                size,
            });
        }

        *self.cache_pool.write().expect("cache pool poisoned") = Some(pool);
    }

    /// The pooled cache region, present once [`allocate_caches`](Self::allocate_caches)
    /// found something to cache.
    pub fn cache_pool(&self) -> Option<Arc<CachePool>> {
        self.cache_pool.read().expect("cache pool poisoned").clone()
    }

    // ========== execution ==========

    /// Hand one query to the driver.
    pub fn execute(&self, query: &Query) {
        self.driver
            .lock()
            .expect("driver poisoned")
            .execute(query);

        let status = query.status();
        if status != QueryStatus::Ok {
            self.log.emit(|| EngineEvent::QueryFailed {
                device: self.name.clone(),
                start: query.start(),
                count: query.count(),
                status: status.to_string(),
            });
        }
    }

    /// Run one poll cycle over a query set.
    ///
    /// Executes the queries in order; a `DeviceDisconnected` status
    /// short-circuits the remainder of the cycle. Query-level failures
    /// become read errors on the affected channels. Returns whether the
    /// whole cycle succeeded (also fed into the disconnect accounting).
    pub fn run_poll_cycle(&self, set: &QuerySet) -> bool {
        set.prepare();

        let mut ok = true;
        for query in set.queries() {
            self.execute(query);

            let status = query.status();
            if status == QueryStatus::Ok {
                continue;
            }

            ok = false;
            if set.operation() == Operation::Read {
                for channel in query.channels() {
                    channel.note_read_failure();
                }
            }
            if status == QueryStatus::DeviceDisconnected {
                break;
            }
        }

        self.on_cycle_end(ok);
        ok
    }

    /// Feed the outcome of one cycle into the disconnect accounting.
    pub fn on_cycle_end(&self, ok: bool) {
        if ok {
            self.fail_cycles.store(0, Ordering::Release);
            if self.disconnected.swap(false, Ordering::AcqRel) {
                self.log.emit(|| EngineEvent::ConnectionChanged {
                    device: self.name.clone(),
                    disconnected: false,
                });
            }
        } else {
            let fails = self.fail_cycles.fetch_add(1, Ordering::AcqRel) + 1;
            if fails >= self.settings.device_max_fail_cycles
                && !self.disconnected.swap(true, Ordering::AcqRel)
            {
                self.log.emit(|| EngineEvent::ConnectionChanged {
                    device: self.name.clone(),
                    disconnected: true,
                });
                for channel in self.channels() {
                    channel.note_read_failure();
                }
            }
        }

        let fail_cycles = self.fail_cycles.load(Ordering::Acquire);
        self.log.emit(|| EngineEvent::CycleEnd {
            device: self.name.clone(),
            ok,
            fail_cycles,
        });
    }

    /// Consecutive failed cycles so far.
    pub fn fail_cycles(&self) -> u32 {
        self.fail_cycles.load(Ordering::Acquire)
    }

    /// Whether the device is currently considered disconnected.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("protocol", &self.protocol.name())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::format::RegisterFormat;
    use crate::protocols::modbus::{self, ModbusProtocolInfo};

    struct NullDriver;

    impl DeviceDriver for NullDriver {
        fn execute(&mut self, _query: &Query) {}
    }

    fn test_device() -> Arc<Device> {
        Device::new(
            "meter",
            DeviceSettings::default(),
            Arc::new(ModbusProtocolInfo),
            Box::new(NullDriver),
        )
    }

    #[test]
    fn test_arena_deduplicates_blocks() {
        let device = test_device();

        let a = device.ensure_block(modbus::reg::HOLDING, 100, None).unwrap();
        let b = device.ensure_block(modbus::reg::HOLDING, 100, None).unwrap();
        let c = device.ensure_block(modbus::reg::HOLDING, 101, None).unwrap();
        let d = device.ensure_block(modbus::reg::COIL, 100, None).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(!Arc::ptr_eq(&a, &d));
        assert_eq!(device.blocks().len(), 3);
    }

    #[test]
    fn test_arena_orders_by_type_then_address() {
        let device = test_device();
        device.ensure_block(modbus::reg::HOLDING, 5, None).unwrap();
        device.ensure_block(modbus::reg::COIL, 100, None).unwrap();
        device.ensure_block(modbus::reg::HOLDING, 1, None).unwrap();

        let keys: Vec<(u32, u32)> = device.blocks().iter().map(|b| b.key()).collect();
        assert_eq!(
            keys,
            vec![
                (modbus::reg::COIL, 100),
                (modbus::reg::HOLDING, 1),
                (modbus::reg::HOLDING, 5)
            ]
        );
    }

    #[test]
    fn test_introspection_block_is_device_only() {
        let device = test_device();
        let block = device
            .introspection_block(modbus::reg::HOLDING, 0x1000, None)
            .unwrap();

        assert!(block.is_ready());
        assert!(block.channels().is_empty());
        assert!(!block.needs_caching());
    }

    #[test]
    fn test_cache_allocation_covers_partial_writable_blocks() {
        let device = test_device();

        // two writable half-register channels on one block: cache required
        device
            .add_channel(
                &ChannelSettings::new("low", modbus::reg::HOLDING, 10)
                    .with_format(RegisterFormat::U8)
                    .with_bits(8, 8),
            )
            .unwrap();
        device
            .add_channel(
                &ChannelSettings::new("high", modbus::reg::HOLDING, 10)
                    .with_format(RegisterFormat::U8)
                    .with_bits(0, 8),
            )
            .unwrap();
        // full-coverage writable channel: no cache
        device
            .add_channel(&ChannelSettings::new("full", modbus::reg::HOLDING, 11))
            .unwrap();
        // partial but read-only channel: no cache
        device
            .add_channel(
                &ChannelSettings::new("ro", modbus::reg::HOLDING, 12)
                    .with_format(RegisterFormat::U8)
                    .with_bits(0, 8)
                    .read_only(),
            )
            .unwrap();

        let partial = device.ensure_block(modbus::reg::HOLDING, 10, None).unwrap();
        let full = device.ensure_block(modbus::reg::HOLDING, 11, None).unwrap();
        let ro = device.ensure_block(modbus::reg::HOLDING, 12, None).unwrap();

        assert!(partial.needs_caching());
        assert!(!full.needs_caching());
        assert!(!ro.needs_caching());

        device.allocate_caches();
        assert!(partial.cache_handle().is_some());
        assert!(full.cache_handle().is_none());
        assert!(ro.cache_handle().is_none());

        // one pooled region sized to the cached blocks
        let pool = device.cache_pool().unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_cycle_end_accounting() {
        let device = test_device();
        assert!(!device.is_disconnected());

        device.on_cycle_end(false);
        assert_eq!(device.fail_cycles(), 1);
        assert!(!device.is_disconnected());

        device.on_cycle_end(false);
        assert_eq!(device.fail_cycles(), 2);
        assert!(device.is_disconnected());

        device.on_cycle_end(true);
        assert_eq!(device.fail_cycles(), 0);
        assert!(!device.is_disconnected());
    }

    #[test]
    fn test_disconnect_marks_channels() {
        let device = test_device();
        let channel = device
            .add_channel(&ChannelSettings::new("temp", modbus::reg::HOLDING, 1))
            .unwrap();

        device.on_cycle_end(false);
        device.on_cycle_end(false);

        assert!(device.is_disconnected());
        assert!(channel.error_state().has_read_error());
    }
}
