//! The address-space dispatcher (spec.md §4.5 "Address-space dispatcher"): fans reads and writes
//! to a region out to whichever handler is registered for that region's space id.
//!
//! The teacher crate's module list reserves `pub mod opregion` for exactly this; its body wasn't
//! retrieved into the pack, so this is built fresh, grounded on
//! `original_source/drivers/acpi/interpreter/amfield.c`'s space-id fan-out and on spec.md §6's
//! `Handler` contract (port/memory/PCI-config IO primitives).

use crate::AmlError;
use alloc::{collections::BTreeMap, sync::Arc};
use spin::Mutex;

/// An ACPI address-space id, as encoded in `DefOpRegion` (ACPI §19.6.102).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum RegionSpace {
    SystemMemory,
    SystemIo,
    PciConfig,
    EmbeddedControl,
    SmBus,
    SystemCmos,
    PciBarTarget,
    Ipmi,
    GeneralPurposeIo,
    GenericSerialBus,
    Oem(u8),
}

impl RegionSpace {
    pub fn from_byte(byte: u8) -> RegionSpace {
        match byte {
            0x00 => RegionSpace::SystemMemory,
            0x01 => RegionSpace::SystemIo,
            0x02 => RegionSpace::PciConfig,
            0x03 => RegionSpace::EmbeddedControl,
            0x04 => RegionSpace::SmBus,
            0x05 => RegionSpace::SystemCmos,
            0x06 => RegionSpace::PciBarTarget,
            0x07 => RegionSpace::Ipmi,
            0x08 => RegionSpace::GeneralPurposeIo,
            0x09 => RegionSpace::GenericSerialBus,
            other => RegionSpace::Oem(other),
        }
    }
}

/// A region/field read or write, in terms the address-space dispatcher understands: a byte
/// offset from the region's base, a bit width, and (for writes) the value.
pub trait AddressSpaceHandler: Send + Sync {
    /// Runs once, the first time a region in this space is accessed (spec.md §4.5 "Setup
    /// callbacks run once per region").
    fn setup(&self, _space: RegionSpace) -> Result<(), AmlError> {
        Ok(())
    }

    fn read(&self, offset: u64, bit_width: u8) -> Result<u64, AmlError>;
    fn write(&self, offset: u64, bit_width: u8, value: u64) -> Result<(), AmlError>;
}

/// Per-space registration table. One instance lives on the `AmlContext`; regions look themselves
/// up by `RegionSpace` when a field access needs to go out to hardware.
pub struct AddressSpaceDispatcher {
    handlers: Mutex<BTreeMap<RegionSpace, Arc<dyn AddressSpaceHandler>>>,
    initialized_spaces: Mutex<alloc::collections::BTreeSet<RegionSpace>>,
}

impl AddressSpaceDispatcher {
    pub fn new() -> AddressSpaceDispatcher {
        AddressSpaceDispatcher {
            handlers: Mutex::new(BTreeMap::new()),
            initialized_spaces: Mutex::new(alloc::collections::BTreeSet::new()),
        }
    }

    pub fn register(&self, space: RegionSpace, handler: Arc<dyn AddressSpaceHandler>) {
        self.handlers.lock().insert(space, handler);
    }

    pub fn read(&self, space: RegionSpace, offset: u64, bit_width: u8) -> Result<u64, AmlError> {
        self.run_setup_if_needed(space)?;
        let handlers = self.handlers.lock();
        let handler = handlers.get(&space).ok_or(AmlError::FieldInvalidAddress)?;
        handler.read(offset, bit_width)
    }

    pub fn write(&self, space: RegionSpace, offset: u64, bit_width: u8, value: u64) -> Result<(), AmlError> {
        self.run_setup_if_needed(space)?;
        let handlers = self.handlers.lock();
        let handler = handlers.get(&space).ok_or(AmlError::FieldInvalidAddress)?;
        handler.write(offset, bit_width, value)
    }

    fn run_setup_if_needed(&self, space: RegionSpace) -> Result<(), AmlError> {
        let mut initialized = self.initialized_spaces.lock();
        if initialized.contains(&space) {
            return Ok(());
        }
        if let Some(handler) = self.handlers.lock().get(&space) {
            handler.setup(space)?;
        }
        initialized.insert(space);
        Ok(())
    }
}

impl Default for AddressSpaceDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct FakeMemory(Mutex<Vec<u8>>);

    impl AddressSpaceHandler for FakeMemory {
        fn read(&self, offset: u64, bit_width: u8) -> Result<u64, AmlError> {
            let bytes = self.0.lock();
            let bytes_len = (bit_width / 8) as usize;
            let mut value = 0u64;
            for i in 0..bytes_len {
                value |= (bytes[offset as usize + i] as u64) << (i * 8);
            }
            Ok(value)
        }

        fn write(&self, offset: u64, bit_width: u8, value: u64) -> Result<(), AmlError> {
            let mut bytes = self.0.lock();
            let bytes_len = (bit_width / 8) as usize;
            for i in 0..bytes_len {
                bytes[offset as usize + i] = ((value >> (i * 8)) & 0xff) as u8;
            }
            Ok(())
        }
    }

    #[test]
    fn s4_field_read_dispatches_to_handler() {
        // spec.md S4: a SystemMemory region, field at offset 4 / bit-width 32, handler returns
        // 0xDEADBEEF.
        let mut backing = alloc::vec![0u8; 0x10];
        backing[4..8].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        let dispatcher = AddressSpaceDispatcher::new();
        dispatcher.register(RegionSpace::SystemMemory, Arc::new(FakeMemory(Mutex::new(backing))));

        let value = dispatcher.read(RegionSpace::SystemMemory, 4, 32).unwrap();
        assert_eq!(value, 0xDEADBEEF);
    }
}
