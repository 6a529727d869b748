//! Virtual registers: the user-visible channels.
//!
//! A channel binds a contiguous bit range spanning one or more memory blocks
//! to a formatted, scaled, publishable value. It tracks the read/dirty/
//! changed lifecycle the publish front-end consumes and the per-direction
//! error state.
//!
//! Threading: the port worker owns everything except `set_text_value`, which
//! an external caller may invoke at any time. The caller only touches the
//! write buffer and the atomic dirty flag, then taps the flush signal.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock, Weak};
use std::time::Duration;

use crate::core::config::{ChannelSettings, QueryPolicy, WordOrder};
use crate::core::error::{EngineError, Result};
use crate::core::format::ValueFormatter;
use crate::core::logging::EngineEvent;
use crate::device::Device;
use crate::memory::block::{BindInfo, MemoryBlock};
use crate::memory::factory::MemoryBlockFactory;
use crate::query::factory::QueryFactory;
use crate::query::{Operation, Query, QueryStatus};

/// Publish edge kinds a channel can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishKind {
    /// The published value changed (or was read for the first time).
    Value,
    /// The error state changed.
    Error,
}

impl PublishKind {
    fn bit(self) -> u8 {
        match self {
            Self::Value => 0b01,
            Self::Error => 0b10,
        }
    }
}

const READ_ERROR_BIT: u8 = 0b01;
const WRITE_ERROR_BIT: u8 = 0b10;
const ERROR_UNKNOWN: u8 = 0xFF;

/// Per-direction error state of a channel.
///
/// Starts `Unknown` until the first read or write settles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorState {
    /// No read or write finished yet.
    Unknown,
    /// Both directions healthy.
    Ok,
    /// Last read failed or hit the error value.
    ReadError,
    /// Last write failed.
    WriteError,
    /// Both directions failing.
    ReadWriteError,
}

impl ErrorState {
    fn from_bits(bits: u8) -> Self {
        match bits {
            ERROR_UNKNOWN => Self::Unknown,
            0 => Self::Ok,
            READ_ERROR_BIT => Self::ReadError,
            WRITE_ERROR_BIT => Self::WriteError,
            _ => Self::ReadWriteError,
        }
    }

    /// Whether the read direction is failing.
    pub fn has_read_error(&self) -> bool {
        matches!(self, Self::ReadError | Self::ReadWriteError)
    }

    /// Whether the write direction is failing.
    pub fn has_write_error(&self) -> bool {
        matches!(self, Self::WriteError | Self::ReadWriteError)
    }
}

impl std::fmt::Display for ErrorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Ok => "ok",
            Self::ReadError => "read error",
            Self::WriteError => "write error",
            Self::ReadWriteError => "read+write error",
        };
        write!(f, "{}", s)
    }
}

/// Level-triggered binary semaphore between the caller thread and the port
/// worker: one signaller, one waiter.
pub struct FlushSignal {
    state: Mutex<bool>,
    signal: Condvar,
}

impl FlushSignal {
    /// Create an unsignalled instance.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    /// Raise the signal; idempotent while pending.
    pub fn signal(&self) {
        let mut state = self.state.lock().expect("flush signal poisoned");
        *state = true;
        self.signal.notify_one();
    }

    /// Block until signalled, then clear.
    pub fn wait(&self) {
        let mut state = self.state.lock().expect("flush signal poisoned");
        while !*state {
            state = self.signal.wait(state).expect("flush signal poisoned");
        }
        *state = false;
    }

    /// Wait with a timeout; returns whether the signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock().expect("flush signal poisoned");
        let deadline = std::time::Instant::now() + timeout;
        while !*state {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .signal
                .wait_timeout(state, deadline - now)
                .expect("flush signal poisoned");
            state = guard;
        }
        *state = false;
        true
    }

    /// Clear and report the signal without blocking.
    pub fn try_take(&self) -> bool {
        let mut state = self.state.lock().expect("flush signal poisoned");
        std::mem::replace(&mut *state, false)
    }
}

impl Default for FlushSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// A user-visible logical value backed by a bit range of device memory.
pub struct VirtualRegister {
    name: String,
    type_index: u32,
    address: u32,
    bit_offset: u16,
    width: u16,
    word_order: WordOrder,
    read_only: bool,
    poll_interval: Duration,
    error_value: Option<u64>,
    formatter: ValueFormatter,
    device: Weak<Device>,

    bindings: OnceLock<Vec<(Arc<MemoryBlock>, BindInfo)>>,
    write_query: OnceLock<Arc<Query>>,

    current_value: Mutex<u64>,
    value_to_write: Mutex<u64>,
    dirty: AtomicBool,
    enabled: AtomicBool,
    value_is_read: AtomicBool,
    value_was_accepted: AtomicBool,
    error_state: AtomicU8,
    changed: AtomicU8,
    flush_signal: RwLock<Option<Arc<FlushSignal>>>,
}

impl VirtualRegister {
    /// Construct and initialize a channel on `device`.
    ///
    /// Initialization happens exactly once, here: memory blocks are
    /// synthesized (reusing arena blocks at the same address), associated,
    /// and a write query is prepared unless the channel is read-only. After
    /// this returns the channel is immutable except for its runtime state.
    pub fn create(settings: &ChannelSettings, device: &Arc<Device>) -> Result<Arc<Self>> {
        let width = settings.width();
        if width > crate::MAX_CHANNEL_WIDTH {
            return Err(EngineError::ChannelTooWide {
                channel: settings.name.clone(),
                width: u32::from(width),
            });
        }

        let channel = Arc::new(Self {
            name: settings.name.clone(),
            type_index: settings.reg_type,
            address: settings.address,
            bit_offset: settings.bit_offset,
            width,
            word_order: settings.word_order,
            read_only: settings.channel_readonly,
            poll_interval: settings.poll_interval(),
            error_value: settings.error_value,
            formatter: ValueFormatter::new(
                settings.format,
                settings.scale,
                settings.offset,
                settings.round_to,
                settings.on_value,
            ),
            device: Arc::downgrade(device),
            bindings: OnceLock::new(),
            write_query: OnceLock::new(),
            current_value: Mutex::new(0),
            value_to_write: Mutex::new(0),
            dirty: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            value_is_read: AtomicBool::new(false),
            value_was_accepted: AtomicBool::new(false),
            error_state: AtomicU8::new(ERROR_UNKNOWN),
            changed: AtomicU8::new(0),
            flush_signal: RwLock::new(None),
        });

        let pairs = MemoryBlockFactory::generate(
            device,
            settings.reg_type,
            settings.address,
            settings.bit_offset,
            width,
        )?;

        debug_assert_eq!(
            pairs.iter().map(|(_, b)| u32::from(b.bit_count())).sum::<u32>(),
            u32::from(width),
            "bind ranges must tile the channel width"
        );

        for (block, bind) in &pairs {
            block.associate(&channel, *bind)?;
        }
        let block_count = pairs.len();
        let _ = channel.bindings.set(pairs);

        if !channel.read_only {
            let queries =
                QueryFactory::plan_queries(&[channel.clone()], Operation::Write, QueryPolicy::Minify)?;
            assert_eq!(queries.len(), 1, "single channel must plan one write query");
            let _ = channel.write_query.set(queries.into_iter().next().expect("checked"));
        }

        device.log().emit(|| EngineEvent::ChannelCreated {
            channel: channel.describe(),
            blocks: block_count,
        });

        Ok(channel)
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Protocol-local register type index.
    pub fn type_index(&self) -> u32 {
        self.type_index
    }

    /// Address of the channel's first memory block.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Bit offset relative to the first block.
    pub fn bit_offset(&self) -> u16 {
        self.bit_offset
    }

    /// Total bit width.
    pub fn width(&self) -> u16 {
        self.width
    }

    /// Word order of the channel value.
    pub fn word_order(&self) -> WordOrder {
        self.word_order
    }

    /// Whether writes are rejected.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Desired period between reads.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Owning device.
    pub fn device(&self) -> Result<Arc<Device>> {
        self.device.upgrade().ok_or(EngineError::DeviceGone)
    }

    pub(crate) fn device_weak(&self) -> &Weak<Device> {
        &self.device
    }

    /// The `(block, bind)` pairs backing this channel, address-ascending.
    pub fn bindings(&self) -> &[(Arc<MemoryBlock>, BindInfo)] {
        self.bindings.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// The memory blocks backing this channel.
    pub fn memory_blocks(&self) -> Vec<Arc<MemoryBlock>> {
        self.bindings().iter().map(|(b, _)| b.clone()).collect()
    }

    /// The bit range this channel occupies in `block`.
    pub fn bind_info(&self, block: &Arc<MemoryBlock>) -> Option<BindInfo> {
        self.bindings()
            .iter()
            .find(|(b, _)| Arc::ptr_eq(b, block))
            .map(|(_, bind)| *bind)
    }

    /// The prepared write query, absent on read-only channels.
    pub fn write_query(&self) -> Option<&Arc<Query>> {
        self.write_query.get()
    }

    // ========== poll path ==========

    /// Whether the channel wants to be read this cycle.
    pub fn needs_poll(&self) -> bool {
        self.enabled.load(Ordering::Acquire) && !self.dirty.load(Ordering::Acquire)
    }

    /// Accept a freshly read raw value.
    ///
    /// Called at most once per poll cycle (re-armed by
    /// [`invalidate_read_values`](Self::invalidate_read_values)). Updates the
    /// current value before the error state, so a subscriber draining edges
    /// sees the Value edge no later than the Error edge of the same cycle.
    pub fn accept_device_value(&self, raw: u64) {
        if !self.needs_poll() {
            return;
        }

        assert!(
            !self.value_is_read.swap(true, Ordering::AcqRel),
            "value accepted twice within one poll cycle"
        );

        let first_poll = !self.value_was_accepted.swap(true, Ordering::AcqRel);

        if self.error_value == Some(raw) {
            self.update_read_error(true);
            return;
        }

        {
            let mut current = self.current_value.lock().expect("current value poisoned");
            if *current != raw {
                *current = raw;
                self.mark_changed(PublishKind::Value);
                if let Ok(device) = self.device() {
                    device.log().emit(|| EngineEvent::ValueChanged {
                        channel: self.describe(),
                        raw,
                    });
                }
            } else if first_poll {
                self.mark_changed(PublishKind::Value);
            }
        }

        self.update_read_error(false);
    }

    /// Whether this cycle's value has already been accepted.
    pub fn value_is_read(&self) -> bool {
        self.value_is_read.load(Ordering::Acquire)
    }

    /// Re-arm [`accept_device_value`](Self::accept_device_value) for the
    /// next cycle.
    pub fn invalidate_read_values(&self) {
        self.value_is_read.store(false, Ordering::Release);
    }

    /// Raw current value; meaningful only after the first successful poll.
    pub fn current_raw(&self) -> u64 {
        *self.current_value.lock().expect("current value poisoned")
    }

    /// Published text form of the current value.
    pub fn get_text_value(&self) -> String {
        self.formatter.text_from_raw(self.current_raw())
    }

    // ========== write path ==========

    /// Parse and stage a value for writing, then tap the flush signal.
    ///
    /// Callable from outside the port worker; only touches the write buffer
    /// and the dirty flag.
    pub fn set_text_value(&self, text: &str) -> Result<()> {
        if self.read_only {
            return Err(EngineError::ReadOnlyChannel(self.name.clone()));
        }

        let raw = self.formatter.raw_from_text(text)?;
        *self.value_to_write.lock().expect("write value poisoned") = raw;
        self.dirty.store(true, Ordering::Release);

        if let Some(signal) = &*self.flush_signal.read().expect("flush signal poisoned") {
            signal.signal();
        }
        Ok(())
    }

    /// Whether a staged write is waiting.
    pub fn needs_flush(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Push a staged write to the device. No-op when nothing is staged.
    pub fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let query = self
            .write_query
            .get()
            .ok_or_else(|| EngineError::ReadOnlyChannel(self.name.clone()))?
            .clone();
        let raw = *self.value_to_write.lock().expect("write value poisoned");

        query.reset_status();
        query.set_value(self, raw)?;

        let device = self.device()?;
        device.execute(&query);

        let ok = query.status() == QueryStatus::Ok;
        if ok {
            *self.current_value.lock().expect("current value poisoned") = raw;
            self.value_was_accepted.store(true, Ordering::Release);
        }
        self.update_write_error(!ok);
        Ok(())
    }

    /// Install the flush signal shared with the port worker.
    pub fn set_flush_signal(&self, signal: Arc<FlushSignal>) {
        *self.flush_signal.write().expect("flush signal poisoned") = Some(signal);
    }

    // ========== publish state ==========

    /// Whether the given publish edge is pending.
    pub fn changed(&self, kind: PublishKind) -> bool {
        self.changed.load(Ordering::Acquire) & kind.bit() != 0
    }

    /// Consume a pending publish edge.
    pub fn reset_changed(&self, kind: PublishKind) {
        self.changed.fetch_and(!kind.bit(), Ordering::AcqRel);
    }

    fn mark_changed(&self, kind: PublishKind) {
        self.changed.fetch_or(kind.bit(), Ordering::AcqRel);
    }

    /// Current error state.
    pub fn error_state(&self) -> ErrorState {
        ErrorState::from_bits(self.error_state.load(Ordering::Acquire))
    }

    fn update_error_bit(&self, bit: u8, set: bool) {
        let before = self.error_state.load(Ordering::Acquire);
        let mut state = if before == ERROR_UNKNOWN { 0 } else { before };
        if set {
            state |= bit;
        } else {
            state &= !bit;
        }

        if state != before {
            self.error_state.store(state, Ordering::Release);
            self.mark_changed(PublishKind::Error);
            if let Ok(device) = self.device() {
                device.log().emit(|| EngineEvent::ErrorChanged {
                    channel: self.describe(),
                    state: ErrorState::from_bits(state).to_string(),
                });
            }
        }
    }

    fn update_read_error(&self, error: bool) {
        self.update_error_bit(READ_ERROR_BIT, error);
    }

    fn update_write_error(&self, error: bool) {
        self.update_error_bit(WRITE_ERROR_BIT, error);
    }

    /// Record a query-level read failure attributable to this channel.
    pub(crate) fn note_read_failure(&self) {
        self.update_read_error(true);
    }

    // ========== enablement ==========

    /// Whether the channel participates in polling.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enable or disable the channel at runtime.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if let Ok(device) = self.device() {
            device.log().emit(|| EngineEvent::ChannelEnabled {
                channel: self.describe(),
                enabled,
            });
        }
    }

    /// `device:name` description for diagnostics.
    pub fn describe(&self) -> String {
        match self.device.upgrade() {
            Some(device) => format!("{}:{}", device.name(), self.name),
            None => self.name.clone(),
        }
    }
}

impl std::fmt::Display for VirtualRegister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

impl std::fmt::Debug for VirtualRegister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualRegister")
            .field("name", &self.name)
            .field("type_index", &self.type_index)
            .field("address", &self.address)
            .field("width", &self.width)
            .field("read_only", &self.read_only)
            .finish()
    }
}
