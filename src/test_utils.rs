//! A `Handler` implementation backed by plain in-memory buffers, used only by `#[cfg(test)]` code
//! across the crate. Grounded on the teacher crate's own test-only `Handler` stub (each teacher
//! unit test constructed a tiny fake handler inline); this centralizes that into one reusable type
//! since SPEC_FULL.md's handler surface is now much larger (semaphores, interrupts, memory maps).

use crate::handler::{Handler, InterruptHandle, SemaphoreHandle, WaitResult};
use crate::AmlError;
use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};
use core::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use spin::Mutex;

pub struct TestHandler {
    memory: Mutex<BTreeMap<usize, u8>>,
    semaphores: Mutex<BTreeMap<u64, u32>>,
    next_semaphore: AtomicU64,
}

impl TestHandler {
    pub fn new() -> TestHandler {
        TestHandler {
            memory: Mutex::new(BTreeMap::new()),
            semaphores: Mutex::new(BTreeMap::new()),
            next_semaphore: AtomicU64::new(1),
        }
    }

    fn read_bytes(&self, address: usize, len: usize) -> u64 {
        let memory = self.memory.lock();
        let mut value = 0u64;
        for i in 0..len {
            value |= (*memory.get(&(address + i)).unwrap_or(&0) as u64) << (i * 8);
        }
        value
    }

    fn write_bytes(&self, address: usize, len: usize, value: u64) {
        let mut memory = self.memory.lock();
        for i in 0..len {
            memory.insert(address + i, ((value >> (i * 8)) & 0xff) as u8);
        }
    }
}

impl Default for TestHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for TestHandler {
    fn read_u8(&self, address: usize) -> u8 {
        self.read_bytes(address, 1) as u8
    }
    fn read_u16(&self, address: usize) -> u16 {
        self.read_bytes(address, 2) as u16
    }
    fn read_u32(&self, address: usize) -> u32 {
        self.read_bytes(address, 4) as u32
    }
    fn read_u64(&self, address: usize) -> u64 {
        self.read_bytes(address, 8)
    }

    fn write_u8(&self, address: usize, value: u8) {
        self.write_bytes(address, 1, value as u64)
    }
    fn write_u16(&self, address: usize, value: u16) {
        self.write_bytes(address, 2, value as u64)
    }
    fn write_u32(&self, address: usize, value: u32) {
        self.write_bytes(address, 4, value as u64)
    }
    fn write_u64(&self, address: usize, value: u64) {
        self.write_bytes(address, 8, value)
    }

    fn read_io_u8(&self, _port: u16) -> u8 {
        0
    }
    fn read_io_u16(&self, _port: u16) -> u16 {
        0
    }
    fn read_io_u32(&self, _port: u16) -> u32 {
        0
    }

    fn write_io_u8(&self, _port: u16, _value: u8) {}
    fn write_io_u16(&self, _port: u16, _value: u16) {}
    fn write_io_u32(&self, _port: u16, _value: u32) {}

    fn read_pci_u8(&self, _segment: u16, _bus: u8, _device: u8, _function: u8, _offset: u16) -> u8 {
        0
    }
    fn read_pci_u16(&self, _segment: u16, _bus: u8, _device: u8, _function: u8, _offset: u16) -> u16 {
        0
    }
    fn read_pci_u32(&self, _segment: u16, _bus: u8, _device: u8, _function: u8, _offset: u16) -> u32 {
        0
    }

    fn write_pci_u8(&self, _segment: u16, _bus: u8, _device: u8, _function: u8, _offset: u16, _value: u8) {}
    fn write_pci_u16(&self, _segment: u16, _bus: u8, _device: u8, _function: u8, _offset: u16, _value: u16) {}
    fn write_pci_u32(&self, _segment: u16, _bus: u8, _device: u8, _function: u8, _offset: u16, _value: u32) {}

    fn stall(&self, _microseconds: u64) {}
    fn sleep(&self, _duration: Duration) {}

    fn map_memory(&self, phys: usize, _len: usize) -> Result<usize, AmlError> {
        Ok(phys)
    }
    fn unmap_memory(&self, _virt: usize, _len: usize) {}

    fn create_semaphore(&self, _max_units: u32, initial_units: u32) -> Result<SemaphoreHandle, AmlError> {
        let id = self.next_semaphore.fetch_add(1, Ordering::Relaxed);
        self.semaphores.lock().insert(id, initial_units);
        Ok(SemaphoreHandle(id))
    }

    fn wait_semaphore(&self, handle: SemaphoreHandle, _timeout: Option<Duration>) -> Result<WaitResult, AmlError> {
        let mut semaphores = self.semaphores.lock();
        let units = semaphores.get_mut(&handle.0).ok_or(AmlError::Unimplemented)?;
        if *units == 0 {
            return Ok(WaitResult::TimedOut);
        }
        *units -= 1;
        Ok(WaitResult::Signalled)
    }

    fn signal_semaphore(&self, handle: SemaphoreHandle, units: u32) -> Result<(), AmlError> {
        let mut semaphores = self.semaphores.lock();
        if let Some(current) = semaphores.get_mut(&handle.0) {
            *current += units;
        }
        Ok(())
    }

    fn delete_semaphore(&self, handle: SemaphoreHandle) -> Result<(), AmlError> {
        self.semaphores.lock().remove(&handle.0);
        Ok(())
    }

    fn install_interrupt_handler(
        &self,
        _irq: u32,
        _callback: Box<dyn Fn() + Send + Sync>,
    ) -> Result<InterruptHandle, AmlError> {
        Ok(InterruptHandle(0))
    }

    fn remove_interrupt_handler(&self, _handle: InterruptHandle) -> Result<(), AmlError> {
        Ok(())
    }
}

pub(crate) fn test_handler() -> TestHandler {
    TestHandler::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_round_trips() {
        let mut handler = TestHandler::new();
        handler.write_u32(0x10, 0xDEADBEEF);
        assert_eq!(handler.read_u32(0x10), 0xDEADBEEF);
    }

    #[test]
    fn semaphore_blocks_when_exhausted() {
        let handler = TestHandler::new();
        let sem = handler.create_semaphore(1, 1).unwrap();
        assert_eq!(handler.wait_semaphore(sem, None).unwrap(), WaitResult::Signalled);
        assert_eq!(handler.wait_semaphore(sem, None).unwrap(), WaitResult::TimedOut);
        handler.signal_semaphore(sem, 1).unwrap();
        assert_eq!(handler.wait_semaphore(sem, None).unwrap(), WaitResult::Signalled);
    }
}
