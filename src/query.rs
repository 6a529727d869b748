//! Bulk read/write queries.
//!
//! A query is an immutable description of one bulk transfer: a run of
//! same-type memory blocks plus the channels bound to them. The device
//! driver moves the bytes; the query routes them — incoming bytes fan out
//! through each channel's codec, outgoing values gather into the pending
//! buffer with read-through from block caches.

pub mod factory;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::channel::VirtualRegister;
use crate::codec;
use crate::core::error::{EngineError, Result};
use crate::memory::block::{BindInfo, MemoryBlock, MemoryBlockType};

/// Direction of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Bulk read from the device.
    Read,
    /// Bulk write to the device.
    Write,
}

/// Execution status of a query, written once per execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueryStatus {
    /// Not executed since the last reset.
    NotExecuted = 0,
    /// Executed successfully.
    Ok = 1,
    /// Transport-level failure; the device is unreachable.
    DeviceDisconnected = 2,
    /// Protocol-level rejection that must not be retried this cycle.
    DevicePermanentError = 3,
    /// Anything else.
    UnknownError = 4,
}

impl QueryStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Ok,
            2 => Self::DeviceDisconnected,
            3 => Self::DevicePermanentError,
            4 => Self::UnknownError,
            _ => Self::NotExecuted,
        }
    }
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotExecuted => "not executed",
            Self::Ok => "ok",
            Self::DeviceDisconnected => "device disconnected",
            Self::DevicePermanentError => "device permanent error",
            Self::UnknownError => "unknown error",
        };
        write!(f, "{}", s)
    }
}

/// Pending bytes of a write query.
///
/// `seeded` tracks which blocks have been primed from their cache since the
/// last reset, so two channels sharing a block within one query do not
/// clobber each other's scattered bits.
struct PendingValues {
    bytes: Vec<u8>,
    seeded: Vec<bool>,
}

/// One bulk read or write spanning adjacent memory blocks of one device.
pub struct Query {
    operation: Operation,
    block_type: MemoryBlockType,
    start: u32,
    count: u32,
    blocks: Vec<Arc<MemoryBlock>>,
    channels: Vec<Arc<VirtualRegister>>,
    status: AtomicU8,
    pending: Option<Mutex<PendingValues>>,
}

impl Query {
    /// Build a query over validated, address-ascending blocks.
    pub(crate) fn new(
        operation: Operation,
        blocks: Vec<Arc<MemoryBlock>>,
        channels: Vec<Arc<VirtualRegister>>,
    ) -> Self {
        assert!(!blocks.is_empty(), "query without memory blocks");
        debug_assert!(blocks.windows(2).all(|w| w[0].address() < w[1].address()));

        let block_type = *blocks[0].block_type();
        let start = blocks[0].address();
        let count = blocks[blocks.len() - 1].address() - start + 1;
        let payload_len: usize = blocks.iter().map(|b| usize::from(b.size())).sum();

        let pending = match operation {
            Operation::Read => None,
            Operation::Write => Some(Mutex::new(PendingValues {
                bytes: vec![0; payload_len],
                seeded: vec![false; blocks.len()],
            })),
        };

        Self {
            operation,
            block_type,
            start,
            count,
            blocks,
            channels,
            status: AtomicU8::new(QueryStatus::NotExecuted as u8),
            pending,
        }
    }

    /// Query direction.
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Register-class of every block in the query.
    pub fn block_type(&self) -> &MemoryBlockType {
        &self.block_type
    }

    /// Address of the first block.
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Address span including holes, in blocks.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// The blocks actually transported, address-ascending.
    pub fn blocks(&self) -> &[Arc<MemoryBlock>] {
        &self.blocks
    }

    /// Channels whose values this query carries.
    pub fn channels(&self) -> &[Arc<VirtualRegister>] {
        &self.channels
    }

    /// Payload size: the summed byte size of the requested blocks.
    pub fn payload_len(&self) -> usize {
        self.blocks.iter().map(|b| usize::from(b.size())).sum()
    }

    /// Current execution status.
    pub fn status(&self) -> QueryStatus {
        QueryStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Record the execution outcome.
    pub fn set_status(&self, status: QueryStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Return the status to `NotExecuted` before re-use.
    pub fn reset_status(&self) {
        self.set_status(QueryStatus::NotExecuted);
        if let Some(pending) = &self.pending {
            let mut pending = pending.lock().expect("pending poisoned");
            pending.seeded.iter_mut().for_each(|s| *s = false);
        }
    }

    /// Byte offset of `block` inside the payload.
    fn block_offset(&self, block: &Arc<MemoryBlock>) -> Option<usize> {
        let mut offset = 0;
        for candidate in &self.blocks {
            if Arc::ptr_eq(candidate, block) {
                return Some(offset);
            }
            offset += usize::from(candidate.size());
        }
        None
    }

    /// Accept the bytes a driver read from the device.
    ///
    /// `bytes` holds exactly the requested blocks' bytes, concatenated in
    /// block order (holes excluded). Refreshes block caches, recomputes each
    /// bound channel's raw value and feeds it through
    /// [`VirtualRegister::accept_device_value`]. Per-channel decode problems
    /// stay channel-local; the query itself completes `Ok`.
    pub fn finalize_read(&self, bytes: &[u8]) -> Result<()> {
        assert_eq!(self.operation, Operation::Read, "finalize_read on a write query");

        let expected = self.payload_len();
        if bytes.len() != expected {
            self.set_status(QueryStatus::UnknownError);
            return Err(EngineError::PayloadSize {
                expected,
                actual: bytes.len(),
            });
        }

        // refresh caches first so partial writes later in the cycle see
        // up-to-date read-through bytes
        let mut offset = 0;
        for block in &self.blocks {
            let size = usize::from(block.size());
            block.update_cache(&bytes[offset..offset + size]);
            offset += size;
        }

        for channel in &self.channels {
            let bindings = channel.bindings();
            let mut views: Vec<&[u8]> = Vec::with_capacity(bindings.len());
            let mut binds: Vec<BindInfo> = Vec::with_capacity(bindings.len());
            let mut complete = true;

            for (block, bind) in bindings.iter() {
                match self.block_offset(block) {
                    Some(at) => {
                        views.push(&bytes[at..at + usize::from(block.size())]);
                        binds.push(*bind);
                    }
                    None => {
                        complete = false;
                        break;
                    }
                }
            }

            if !complete {
                debug_assert!(false, "channel block missing from its query");
                channel.note_read_failure();
                continue;
            }

            let raw = codec::gather(&views, &binds, channel.word_order());
            channel.accept_device_value(raw);
        }

        self.set_status(QueryStatus::Ok);
        Ok(())
    }

    /// Extract the requested blocks' bytes out of a full-range payload.
    ///
    /// Convenience for drivers that transport the whole
    /// `[start, start + count)` span, holes included: `range` must be
    /// `count * block_size` bytes.
    pub fn compact_range_bytes(&self, range: &[u8]) -> Result<Vec<u8>> {
        let block_size = usize::from(self.blocks[0].size());
        let expected = self.count as usize * block_size;
        if range.len() != expected {
            return Err(EngineError::PayloadSize {
                expected,
                actual: range.len(),
            });
        }

        let mut bytes = Vec::with_capacity(self.payload_len());
        for block in &self.blocks {
            let at = (block.address() - self.start) as usize * block_size;
            bytes.extend_from_slice(&range[at..at + block_size]);
        }
        Ok(bytes)
    }

    /// Scatter a channel's raw value into the pending buffer.
    ///
    /// Blocks not fully covered by the channel read through their cache, so
    /// unaddressed bits keep their last known value.
    pub fn set_value(&self, channel: &VirtualRegister, raw: u64) -> Result<()> {
        let pending = self
            .pending
            .as_ref()
            .expect("set_value on a read query");
        let mut pending = pending.lock().expect("pending poisoned");

        let bindings = channel.bindings();
        let mut regions: Vec<(usize, usize)> = Vec::with_capacity(bindings.len());
        let mut binds: Vec<BindInfo> = Vec::with_capacity(bindings.len());

        for (block, bind) in bindings.iter() {
            let at = self.block_offset(block).ok_or_else(|| {
                EngineError::invalid_query(format!(
                    "{} is not part of the write query",
                    block.describe()
                ))
            })?;
            let size = usize::from(block.size());

            // prime the block region from its cache once per execution
            let index = self
                .blocks
                .iter()
                .position(|b| Arc::ptr_eq(b, block))
                .expect("offset resolved for unknown block");
            if !pending.seeded[index] {
                pending.bytes[at..at + size].copy_from_slice(&block.cached_bytes());
                pending.seeded[index] = true;
            }

            regions.push((at, size));
            binds.push(*bind);
        }

        let mut scratch: Vec<Vec<u8>> = regions
            .iter()
            .map(|&(at, size)| pending.bytes[at..at + size].to_vec())
            .collect();
        {
            let mut bufs: Vec<&mut [u8]> = scratch.iter_mut().map(|v| v.as_mut_slice()).collect();
            codec::scatter(&mut bufs, &binds, channel.word_order(), raw);
        }
        for (&(at, size), buf) in regions.iter().zip(&scratch) {
            pending.bytes[at..at + size].copy_from_slice(&buf[..size]);
        }

        Ok(())
    }

    /// Snapshot of the pending bytes for the driver to put on the wire.
    pub fn pending_bytes(&self) -> Vec<u8> {
        match &self.pending {
            Some(pending) => pending.lock().expect("pending poisoned").bytes.clone(),
            None => Vec::new(),
        }
    }

    /// Commit a completed write: pending bytes become the blocks' cached
    /// bytes and the query finishes `Ok`.
    pub fn finalize_write(&self) {
        let pending = self
            .pending
            .as_ref()
            .expect("finalize_write on a read query");
        let pending = pending.lock().expect("pending poisoned");

        let mut offset = 0;
        for block in &self.blocks {
            let size = usize::from(block.size());
            block.update_cache(&pending.bytes[offset..offset + size]);
            offset += size;
        }

        self.set_status(QueryStatus::Ok);
    }

    /// Short description for diagnostics.
    pub fn describe(&self) -> String {
        format!(
            "{} {}..{} ({} blocks)",
            self.block_type.name,
            self.start,
            self.start + self.count - 1,
            self.blocks.len()
        )
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("operation", &self.operation)
            .field("type", &self.block_type.name)
            .field("start", &self.start)
            .field("count", &self.count)
            .field("status", &self.status())
            .finish()
    }
}

/// All queries of one poll-interval class of one device.
pub struct QuerySet {
    operation: Operation,
    poll_interval: Duration,
    queries: Vec<Arc<Query>>,
}

impl QuerySet {
    /// Build a set; a query set is never empty.
    pub(crate) fn new(
        operation: Operation,
        poll_interval: Duration,
        queries: Vec<Arc<Query>>,
    ) -> Self {
        assert!(!queries.is_empty(), "empty query set");
        Self {
            operation,
            poll_interval,
            queries,
        }
    }

    /// Direction shared by all queries of the set.
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Poll interval class of the set.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// The queries, in planning order.
    pub fn queries(&self) -> &[Arc<Query>] {
        &self.queries
    }

    /// Arm the set for a new cycle: statuses return to `NotExecuted` and
    /// read channels may accept a value again.
    pub fn prepare(&self) {
        for query in &self.queries {
            query.reset_status();
            if self.operation == Operation::Read {
                for channel in query.channels() {
                    channel.invalidate_read_values();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::block::MemoryBlockType;
    use std::sync::Weak;

    fn holding_block(address: u32) -> Arc<MemoryBlock> {
        let t = MemoryBlockType::fixed(2, "holding", 2);
        Arc::new(MemoryBlock::new(address, t, None, Weak::new()).unwrap())
    }

    fn read_query(addresses: &[u32]) -> Query {
        let blocks = addresses.iter().map(|&a| holding_block(a)).collect();
        Query::new(Operation::Read, blocks, Vec::new())
    }

    #[test]
    fn test_query_geometry() {
        let query = read_query(&[100, 101, 104]);
        assert_eq!(query.start(), 100);
        assert_eq!(query.count(), 5);
        assert_eq!(query.payload_len(), 6);
        assert_eq!(query.blocks().len(), 3);
    }

    #[test]
    fn test_status_lifecycle() {
        let query = read_query(&[7]);
        assert_eq!(query.status(), QueryStatus::NotExecuted);

        query.set_status(QueryStatus::DeviceDisconnected);
        assert_eq!(query.status(), QueryStatus::DeviceDisconnected);

        query.reset_status();
        assert_eq!(query.status(), QueryStatus::NotExecuted);
    }

    #[test]
    fn test_finalize_read_length_check() {
        let query = read_query(&[100, 101]);
        let err = query.finalize_read(&[0u8; 3]).unwrap_err();
        assert!(matches!(
            err,
            EngineError::PayloadSize {
                expected: 4,
                actual: 3
            }
        ));
        assert_eq!(query.status(), QueryStatus::UnknownError);

        query.reset_status();
        query.finalize_read(&[0u8; 4]).unwrap();
        assert_eq!(query.status(), QueryStatus::Ok);
    }

    #[test]
    fn test_compact_range_bytes_skips_holes() {
        // blocks at 100, 101, 104: range transports 5 registers
        let query = read_query(&[100, 101, 104]);
        let range: Vec<u8> = (0u8..10).collect();

        let bytes = query.compact_range_bytes(&range).unwrap();
        assert_eq!(bytes, vec![0, 1, 2, 3, 8, 9]);

        assert!(query.compact_range_bytes(&range[..8]).is_err());
    }

    #[test]
    fn test_pending_bytes_of_write_query() {
        let blocks = vec![holding_block(10), holding_block(11)];
        let query = Query::new(Operation::Write, blocks, Vec::new());

        assert_eq!(query.pending_bytes(), vec![0; 4]);
        query.finalize_write();
        assert_eq!(query.status(), QueryStatus::Ok);
    }
}
