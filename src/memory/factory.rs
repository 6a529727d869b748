//! Memory block synthesis.
//!
//! Given a channel's declarative shape (type index, starting address, bit
//! offset, bit width) the factory walks block boundaries and emits one
//! `(block, bind)` pair per intersected block, reusing any block the device
//! already has at the same address. Word order never affects block layout;
//! blocks are always emitted in ascending address order.

use std::sync::Arc;

use crate::core::error::{EngineError, Result};
use crate::device::Device;
use crate::memory::block::{BindInfo, MemoryBlock};

/// Synthesizes the memory blocks covering a channel's bit range.
pub struct MemoryBlockFactory;

impl MemoryBlockFactory {
    /// Produce the ordered `(block, bind)` sequence for a channel.
    ///
    /// The bit range `[bit_offset, bit_offset + width)` is relative to the
    /// block at `address`; a range reaching past one block continues into
    /// the block at the next address.
    pub fn generate(
        device: &Arc<Device>,
        type_index: u32,
        address: u32,
        bit_offset: u16,
        width: u16,
    ) -> Result<Vec<(Arc<MemoryBlock>, BindInfo)>> {
        let protocol = device.protocol();
        let block_type = protocol
            .block_type(type_index)
            .ok_or(EngineError::UnknownRegisterType {
                protocol: protocol.name(),
                type_index,
            })?;

        if block_type.variadic {
            return Err(EngineError::config(format!(
                "variadic register type '{}' cannot back a channel",
                block_type.name
            )));
        }
        if width == 0 {
            return Err(EngineError::config("channel width must be non-zero"));
        }

        let block_bits = u32::from(block_type.size) * 8;
        let start_bit = u32::from(bit_offset);
        let end_bit = start_bit + u32::from(width);

        let first = start_bit / block_bits;
        let last = (end_bit - 1) / block_bits;

        let mut result = Vec::with_capacity((last - first + 1) as usize);
        for k in first..=last {
            let base = k * block_bits;
            let bind = BindInfo::new(
                (start_bit.max(base) - base) as u16,
                (end_bit.min(base + block_bits) - base) as u16,
            );
            let block = device.ensure_block(type_index, address + k, None)?;
            result.push((block, bind));
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::DeviceSettings;
    use crate::device::{Device, DeviceDriver};
    use crate::protocols::modbus::{self, ModbusProtocolInfo};
    use crate::query::Query;

    struct NullDriver;

    impl DeviceDriver for NullDriver {
        fn execute(&mut self, _query: &Query) {}
    }

    fn test_device() -> Arc<Device> {
        Device::new(
            "dev",
            DeviceSettings::default(),
            Arc::new(ModbusProtocolInfo),
            Box::new(NullDriver),
        )
    }

    #[test]
    fn test_single_block_full_coverage() {
        let device = test_device();
        let pairs =
            MemoryBlockFactory::generate(&device, modbus::reg::HOLDING, 100, 0, 16).unwrap();

        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0.address(), 100);
        assert_eq!(pairs[0].1, BindInfo::new(0, 16));
    }

    #[test]
    fn test_multi_block_span() {
        let device = test_device();
        let pairs =
            MemoryBlockFactory::generate(&device, modbus::reg::HOLDING, 200, 0, 32).unwrap();

        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0.address(), 200);
        assert_eq!(pairs[1].0.address(), 201);
        assert_eq!(pairs[0].1, BindInfo::new(0, 16));
        assert_eq!(pairs[1].1, BindInfo::new(0, 16));
    }

    #[test]
    fn test_offset_inside_block() {
        let device = test_device();
        let pairs = MemoryBlockFactory::generate(&device, modbus::reg::HOLDING, 50, 8, 8).unwrap();

        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].1, BindInfo::new(8, 16));
    }

    #[test]
    fn test_offset_crossing_block_boundary() {
        // 12 bits starting at bit 12 of a 16-bit block: 4 bits in the first
        // block, 8 in the next
        let device = test_device();
        let pairs = MemoryBlockFactory::generate(&device, modbus::reg::HOLDING, 10, 12, 12).unwrap();

        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0.address(), 10);
        assert_eq!(pairs[0].1, BindInfo::new(12, 16));
        assert_eq!(pairs[1].0.address(), 11);
        assert_eq!(pairs[1].1, BindInfo::new(0, 8));
    }

    #[test]
    fn test_offset_skipping_first_block() {
        // offset past the first block lands the channel at the next address
        let device = test_device();
        let pairs = MemoryBlockFactory::generate(&device, modbus::reg::HOLDING, 10, 16, 16).unwrap();

        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0.address(), 11);
        assert_eq!(pairs[0].1, BindInfo::new(0, 16));
    }

    #[test]
    fn test_blocks_deduplicated_in_arena() {
        let device = test_device();
        let first =
            MemoryBlockFactory::generate(&device, modbus::reg::HOLDING, 100, 0, 8).unwrap();
        let second =
            MemoryBlockFactory::generate(&device, modbus::reg::HOLDING, 100, 8, 8).unwrap();

        assert!(Arc::ptr_eq(&first[0].0, &second[0].0));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let device = test_device();
        let err =
            MemoryBlockFactory::generate(&device, 99, 0, 0, 16).unwrap_err();
        assert!(matches!(err, EngineError::UnknownRegisterType { type_index: 99, .. }));
    }
}
