//! Protocol plug-ins.
//!
//! A protocol contributes a stable name, a table of register types and the
//! request limits the query planner honors. Concrete drivers implementing
//! [`DeviceDriver`](crate::device::DeviceDriver) live with their transport,
//! outside this crate's scope; the engine only consumes the descriptor.

pub mod modbus;

use crate::memory::block::MemoryBlockType;

/// Per-protocol constants and type classification consumed by the planner.
pub trait ProtocolInfo: Send + Sync {
    /// Stable protocol name.
    fn name(&self) -> &'static str;

    /// The protocol's register-type table.
    fn block_types(&self) -> &[MemoryBlockType];

    /// Look up a register type by its protocol-local index.
    fn block_type(&self, index: u32) -> Option<&MemoryBlockType> {
        self.block_types().iter().find(|t| t.index == index)
    }

    /// Whether blocks of this type transport a single bit each.
    ///
    /// Single-bit types use the bit-flavored hole and span limits.
    fn is_single_bit_type(&self, block_type: &MemoryBlockType) -> bool;

    /// Most register blocks one read request may span.
    fn max_read_registers(&self) -> u32;

    /// Most single-bit blocks one read request may span.
    fn max_read_bits(&self) -> u32;

    /// Most register blocks one write request may span.
    fn max_write_registers(&self) -> u32;

    /// Most single-bit blocks one write request may span.
    fn max_write_bits(&self) -> u32;
}
