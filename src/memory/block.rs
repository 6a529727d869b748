//! Memory blocks: the smallest protocol-addressable units.
//!
//! A block is one coil, one holding register, one parameter word — whatever
//! the protocol's atomic read/write granularity is. Blocks live in their
//! device's arena keyed by `(type index, address)` so that channels landing
//! on the same address share one instance. Blocks reference their channels
//! weakly; channels own their blocks.

use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::channel::VirtualRegister;
use crate::core::error::{EngineError, Result};
use crate::device::Device;

/// Upper bound on a single memory block's byte size.
pub const MAX_MEMORY_BLOCK_SIZE: u16 = 128;

/// Protocol-local description of a register class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBlockType {
    /// Protocol-local index; channels reference types by this number.
    pub index: u32,
    /// Human-readable name ("coil", "holding", ...).
    pub name: &'static str,
    /// Writes to blocks of this type are rejected by the device.
    pub read_only: bool,
    /// Fixed byte size of one block; 0 for variadic types.
    pub size: u16,
    /// Size is chosen per block instance instead of per type.
    pub variadic: bool,
}

impl MemoryBlockType {
    /// Fixed-size writable type.
    pub const fn fixed(index: u32, name: &'static str, size: u16) -> Self {
        Self {
            index,
            name,
            read_only: false,
            size,
            variadic: false,
        }
    }

    /// Fixed-size read-only type.
    pub const fn fixed_read_only(index: u32, name: &'static str, size: u16) -> Self {
        Self {
            index,
            name,
            read_only: true,
            size,
            variadic: false,
        }
    }

    /// Type whose blocks pick their size at creation.
    pub const fn variadic(index: u32, name: &'static str) -> Self {
        Self {
            index,
            name,
            read_only: false,
            size: 0,
            variadic: true,
        }
    }
}

/// The bit range a channel occupies inside one memory block, MSB-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindInfo {
    /// First occupied bit.
    pub bit_start: u16,
    /// One past the last occupied bit.
    pub bit_end: u16,
}

impl BindInfo {
    /// Create a bind range; `bit_start < bit_end` is a program invariant.
    pub fn new(bit_start: u16, bit_end: u16) -> Self {
        assert!(bit_start < bit_end, "empty bind range");
        Self { bit_start, bit_end }
    }

    /// Number of bits in the range.
    pub fn bit_count(&self) -> u16 {
        self.bit_end - self.bit_start
    }

    /// Whether the range covers a whole block of `block_size` bytes.
    pub fn is_full_coverage(&self, block_size: u16) -> bool {
        self.bit_start == 0 && self.bit_end == block_size * 8
    }

    /// Whether two ranges intersect.
    pub fn overlaps(&self, other: &BindInfo) -> bool {
        self.bit_start < other.bit_end && other.bit_start < self.bit_end
    }
}

/// What a block is attached to.
///
/// Starts unbound; becomes ready once a device or a channel set is attached.
/// The channel-set shape carries each channel's bind range so overlap is
/// detected right at association time.
enum Linkage {
    Unbound,
    DeviceOnly,
    Channels(Vec<(Weak<VirtualRegister>, BindInfo)>),
}

/// One pooled byte region holding the caches of all blocks of a device.
pub struct CachePool {
    bytes: Mutex<Vec<u8>>,
}

impl CachePool {
    /// Allocate a zeroed pool.
    pub fn with_size(size: usize) -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(vec![0; size]),
        })
    }

    /// Total pool size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.lock().expect("cache pool poisoned").len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A block's window into its device's cache pool.
#[derive(Clone)]
pub struct CacheHandle {
    pool: Arc<CachePool>,
    offset: usize,
    len: usize,
}

impl CacheHandle {
    /// Create a handle over `pool[offset..offset + len]`.
    pub fn new(pool: Arc<CachePool>, offset: usize, len: usize) -> Self {
        assert!(offset + len <= pool.len(), "cache handle out of pool bounds");
        Self { pool, offset, len }
    }

    /// Window size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy the cached bytes out.
    pub fn read(&self) -> Vec<u8> {
        let bytes = self.pool.bytes.lock().expect("cache pool poisoned");
        bytes[self.offset..self.offset + self.len].to_vec()
    }

    /// Overwrite the cached bytes.
    pub fn write(&self, data: &[u8]) {
        assert_eq!(data.len(), self.len, "cache write size mismatch");
        let mut bytes = self.pool.bytes.lock().expect("cache pool poisoned");
        bytes[self.offset..self.offset + self.len].copy_from_slice(data);
    }
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// An addressable unit of device memory.
pub struct MemoryBlock {
    address: u32,
    block_type: MemoryBlockType,
    size: u16,
    device: Weak<Device>,
    linkage: RwLock<Linkage>,
    cache: RwLock<Option<CacheHandle>>,
}

impl MemoryBlock {
    /// Create a block of the given type at `address`.
    ///
    /// `size` must be provided for variadic types and is ignored otherwise.
    pub(crate) fn new(
        address: u32,
        block_type: MemoryBlockType,
        size: Option<u16>,
        device: Weak<Device>,
    ) -> Result<Self> {
        let size = if block_type.variadic {
            size.ok_or_else(|| {
                EngineError::config(format!(
                    "variadic type '{}' requires an explicit block size",
                    block_type.name
                ))
            })?
        } else {
            block_type.size
        };

        if size == 0 || size >= MAX_MEMORY_BLOCK_SIZE {
            return Err(EngineError::config(format!(
                "block size {} out of range for type '{}'",
                size, block_type.name
            )));
        }

        Ok(Self {
            address,
            block_type,
            size,
            device,
            linkage: RwLock::new(Linkage::Unbound),
            cache: RwLock::new(None),
        })
    }

    /// Block address.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Register-class description.
    pub fn block_type(&self) -> &MemoryBlockType {
        &self.block_type
    }

    /// Byte size of this block instance.
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Bit size of this block instance.
    pub fn bits(&self) -> u16 {
        self.size * 8
    }

    /// Arena key: `(type index, address)`.
    pub fn key(&self) -> (u32, u32) {
        (self.block_type.index, self.address)
    }

    /// Owning device.
    pub fn device(&self) -> Result<Arc<Device>> {
        self.device.upgrade().ok_or(EngineError::DeviceGone)
    }

    /// Whether any linkage has been attached yet.
    pub fn is_ready(&self) -> bool {
        !matches!(*self.linkage.read().expect("linkage poisoned"), Linkage::Unbound)
    }

    /// Attach device-only linkage (protocol introspection blocks).
    ///
    /// No-op if the block already carries a linkage of either kind.
    pub fn bind_device(&self) {
        let mut linkage = self.linkage.write().expect("linkage poisoned");
        if matches!(*linkage, Linkage::Unbound) {
            *linkage = Linkage::DeviceOnly;
        }
    }

    /// Associate a channel occupying `bind` with this block.
    ///
    /// Fails with [`EngineError::Overlap`] if another channel already claims
    /// an intersecting bit range. Associating a channel of a different type
    /// index or another device is a programming error.
    pub fn associate(&self, channel: &Arc<VirtualRegister>, bind: BindInfo) -> Result<()> {
        assert!(
            bind.bit_end <= self.bits(),
            "bind range exceeds block size"
        );
        assert_eq!(
            channel.type_index(),
            self.block_type.index,
            "channel type does not match block type"
        );
        assert!(
            Weak::ptr_eq(channel.device_weak(), &self.device),
            "channel belongs to another device"
        );

        let mut linkage = self.linkage.write().expect("linkage poisoned");

        // channel linkage supersedes a device-only one
        if !matches!(*linkage, Linkage::Channels(_)) {
            *linkage = Linkage::Channels(Vec::with_capacity(1));
        }
        let Linkage::Channels(entries) = &mut *linkage else {
            unreachable!()
        };

        for (existing, existing_bind) in entries.iter() {
            if let Some(existing) = existing.upgrade() {
                if Arc::ptr_eq(&existing, channel) {
                    return Ok(());
                }
                if existing_bind.overlaps(&bind) {
                    return Err(EngineError::overlap(format!(
                        "'{}' and '{}' both claim bits of {}",
                        existing.name(),
                        channel.name(),
                        self.describe()
                    )));
                }
            }
        }

        entries.push((Arc::downgrade(channel), bind));
        Ok(())
    }

    /// Whether the channel is associated with this block.
    pub fn is_associated(&self, channel: &Arc<VirtualRegister>) -> bool {
        match &*self.linkage.read().expect("linkage poisoned") {
            Linkage::Channels(entries) => entries.iter().any(|(weak, _)| {
                weak.upgrade()
                    .map(|c| Arc::ptr_eq(&c, channel))
                    .unwrap_or(false)
            }),
            _ => false,
        }
    }

    /// All live channels bound to this block.
    pub fn channels(&self) -> Vec<Arc<VirtualRegister>> {
        match &*self.linkage.read().expect("linkage poisoned") {
            Linkage::Channels(entries) => {
                entries.iter().filter_map(|(weak, _)| weak.upgrade()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// The bind range a channel occupies in this block, if associated.
    pub fn bind_of(&self, channel: &Arc<VirtualRegister>) -> Option<BindInfo> {
        match &*self.linkage.read().expect("linkage poisoned") {
            Linkage::Channels(entries) => entries.iter().find_map(|(weak, bind)| {
                weak.upgrade().and_then(|c| {
                    if Arc::ptr_eq(&c, channel) {
                        Some(*bind)
                    } else {
                        None
                    }
                })
            }),
            _ => None,
        }
    }

    /// Whether this block must keep a cache of its last known bytes.
    ///
    /// True iff a writable channel covers the block only partially: such a
    /// write would otherwise clobber the unaddressed bits. Recomputed from
    /// the current bindings on every call; bindings are frozen once planning
    /// is done.
    pub fn needs_caching(&self) -> bool {
        if self.block_type.read_only {
            return false;
        }
        match &*self.linkage.read().expect("linkage poisoned") {
            Linkage::Channels(entries) => entries.iter().any(|(weak, bind)| {
                weak.upgrade()
                    .map(|c| !c.is_read_only() && !bind.is_full_coverage(self.size))
                    .unwrap_or(false)
            }),
            _ => false,
        }
    }

    /// Hand the block its cache window. Called exactly once, after planning.
    pub fn assign_cache(&self, handle: CacheHandle) {
        assert!(self.needs_caching(), "cache assigned to a block that needs none");
        assert_eq!(handle.len(), self.size as usize, "cache window size mismatch");
        let mut cache = self.cache.write().expect("cache poisoned");
        assert!(cache.is_none(), "cache assigned twice");
        *cache = Some(handle);
    }

    /// The block's cache window, if one was assigned.
    pub fn cache_handle(&self) -> Option<CacheHandle> {
        self.cache.read().expect("cache poisoned").clone()
    }

    /// Last known bytes of the block: the cache contents, or zeros when the
    /// block carries no cache.
    pub fn cached_bytes(&self) -> Vec<u8> {
        match self.cache_handle() {
            Some(handle) => handle.read(),
            None => vec![0; self.size as usize],
        }
    }

    /// Store freshly transported bytes into the cache, if one is assigned.
    pub fn update_cache(&self, bytes: &[u8]) {
        if let Some(handle) = self.cache_handle() {
            handle.write(bytes);
        }
    }

    /// Short description for diagnostics.
    pub fn describe(&self) -> String {
        format!("{} block {}", self.block_type.name, self.address)
    }
}

impl std::fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("type", &self.block_type.name)
            .field("address", &self.address)
            .field("size", &self.size)
            .finish()
    }
}

// Blocks are ordered and compared by (type index, address); instances of
// different devices never meet in one collection.
impl PartialEq for MemoryBlock {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for MemoryBlock {}

impl PartialOrd for MemoryBlock {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemoryBlock {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}
