//! Modbus protocol descriptor.
//!
//! Register classes follow the four standard Modbus tables. Coils and
//! discrete inputs occupy one byte per block on the engine side; drivers
//! conventionally deliver `0x00`/`0x01` per block, so bit-level channels on
//! them use the `u8` format covering the whole byte.

use crate::memory::block::MemoryBlockType;
use crate::protocols::ProtocolInfo;

/// Register type indices of the Modbus tables.
pub mod reg {
    /// Coils (read/write, single bit).
    pub const COIL: u32 = 0;
    /// Discrete inputs (read-only, single bit).
    pub const DISCRETE: u32 = 1;
    /// Holding registers (read/write, 16 bit).
    pub const HOLDING: u32 = 2;
    /// Input registers (read-only, 16 bit).
    pub const INPUT: u32 = 3;
}

static TYPES: &[MemoryBlockType] = &[
    MemoryBlockType::fixed(reg::COIL, "coil", 1),
    MemoryBlockType::fixed_read_only(reg::DISCRETE, "discrete", 1),
    MemoryBlockType::fixed(reg::HOLDING, "holding", 2),
    MemoryBlockType::fixed_read_only(reg::INPUT, "input", 2),
];

/// Maximum holding/input registers per read request (FC03/FC04).
pub const MAX_READ_REGISTERS: u32 = 125;

/// Maximum coils per read request (FC01/FC02).
pub const MAX_READ_BITS: u32 = 2000;

/// Maximum registers per write request (FC16).
pub const MAX_WRITE_REGISTERS: u32 = 123;

/// Maximum coils per write request (FC15).
pub const MAX_WRITE_BITS: u32 = 1968;

/// Modbus RTU/TCP descriptor.
pub struct ModbusProtocolInfo;

impl ProtocolInfo for ModbusProtocolInfo {
    fn name(&self) -> &'static str {
        "modbus"
    }

    fn block_types(&self) -> &[MemoryBlockType] {
        TYPES
    }

    fn is_single_bit_type(&self, block_type: &MemoryBlockType) -> bool {
        matches!(block_type.index, reg::COIL | reg::DISCRETE)
    }

    fn max_read_registers(&self) -> u32 {
        MAX_READ_REGISTERS
    }

    fn max_read_bits(&self) -> u32 {
        MAX_READ_BITS
    }

    fn max_write_registers(&self) -> u32 {
        MAX_WRITE_REGISTERS
    }

    fn max_write_bits(&self) -> u32 {
        MAX_WRITE_BITS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_table() {
        let protocol = ModbusProtocolInfo;

        let holding = protocol.block_type(reg::HOLDING).unwrap();
        assert_eq!(holding.name, "holding");
        assert_eq!(holding.size, 2);
        assert!(!holding.read_only);

        let input = protocol.block_type(reg::INPUT).unwrap();
        assert!(input.read_only);

        assert!(protocol.block_type(42).is_none());
    }

    #[test]
    fn test_single_bit_classification() {
        let protocol = ModbusProtocolInfo;

        let coil = protocol.block_type(reg::COIL).unwrap();
        let holding = protocol.block_type(reg::HOLDING).unwrap();

        assert!(protocol.is_single_bit_type(coil));
        assert!(!protocol.is_single_bit_type(holding));
    }

    #[test]
    fn test_request_limits() {
        let protocol = ModbusProtocolInfo;
        assert_eq!(protocol.max_read_registers(), 125);
        assert_eq!(protocol.max_read_bits(), 2000);
        assert_eq!(protocol.max_write_registers(), 123);
        assert_eq!(protocol.max_write_bits(), 1968);
    }
}
