//! The OS adapter: every primitive the core needs from its host, kept as a single trait object so
//! `AmlContext` doesn't need a lifetime/type parameter for it (exactly the rationale the teacher
//! crate gives for boxing its `Handler`). Extended from the teacher's original port/MMIO/PCI IO
//! trait with the semaphore and interrupt-registration contracts spec.md §6 lists as "Consumed
//! from the OS adapter" - the teacher crate never needed these because it has no concurrency
//! model; ACPICA-style method concurrency and mutex/event objects (SPEC_FULL.md §4) do.

use crate::AmlError;
use alloc::boxed::Box;
use core::time::Duration;

/// Outcome of [`Handler::wait_semaphore`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WaitResult {
    Signalled,
    TimedOut,
}

/// An opaque handle to an OS semaphore, created by [`Handler::create_semaphore`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SemaphoreHandle(pub u64);

/// An opaque handle to a registered interrupt.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InterruptHandle(pub u32);

pub trait Handler: Send + Sync {
    fn read_u8(&self, address: usize) -> u8;
    fn read_u16(&self, address: usize) -> u16;
    fn read_u32(&self, address: usize) -> u32;
    fn read_u64(&self, address: usize) -> u64;

    fn write_u8(&self, address: usize, value: u8);
    fn write_u16(&self, address: usize, value: u16);
    fn write_u32(&self, address: usize, value: u32);
    fn write_u64(&self, address: usize, value: u64);

    fn read_io_u8(&self, port: u16) -> u8;
    fn read_io_u16(&self, port: u16) -> u16;
    fn read_io_u32(&self, port: u16) -> u32;

    fn write_io_u8(&self, port: u16, value: u8);
    fn write_io_u16(&self, port: u16, value: u16);
    fn write_io_u32(&self, port: u16, value: u32);

    fn read_pci_u8(&self, segment: u16, bus: u8, device: u8, function: u8, offset: u16) -> u8;
    fn read_pci_u16(&self, segment: u16, bus: u8, device: u8, function: u8, offset: u16) -> u16;
    fn read_pci_u32(&self, segment: u16, bus: u8, device: u8, function: u8, offset: u16) -> u32;

    fn write_pci_u8(&self, segment: u16, bus: u8, device: u8, function: u8, offset: u16, value: u8);
    fn write_pci_u16(&self, segment: u16, bus: u8, device: u8, function: u8, offset: u16, value: u16);
    fn write_pci_u32(&self, segment: u16, bus: u8, device: u8, function: u8, offset: u16, value: u32);

    /// Stall for at least the given number of **microseconds**, without relinquishing the
    /// processor. Firmware should not ask for stalls over 100us.
    fn stall(&self, microseconds: u64);

    /// Sleep for at least the given duration, relinquishing the processor.
    fn sleep(&self, duration: Duration);

    /// Maps `len` bytes of physical memory at `phys` into the virtual address space, returning the
    /// virtual base.
    fn map_memory(&self, phys: usize, len: usize) -> Result<usize, AmlError>;
    fn unmap_memory(&self, virt: usize, len: usize);

    /// Creates a counting semaphore with `max_units` capacity and `initial_units` already
    /// available (spec.md §6: `os_create_semaphore(max, initial)`).
    fn create_semaphore(&self, max_units: u32, initial_units: u32) -> Result<SemaphoreHandle, AmlError>;
    /// Blocks until a unit is available or `timeout` elapses (`None` = wait forever).
    fn wait_semaphore(&self, handle: SemaphoreHandle, timeout: Option<Duration>) -> Result<WaitResult, AmlError>;
    fn signal_semaphore(&self, handle: SemaphoreHandle, units: u32) -> Result<(), AmlError>;
    fn delete_semaphore(&self, handle: SemaphoreHandle) -> Result<(), AmlError>;

    /// Registers `callback` to run when `irq` fires (spec.md §6 SCI/GPE dispatch).
    fn install_interrupt_handler(
        &self,
        irq: u32,
        callback: Box<dyn Fn() + Send + Sync>,
    ) -> Result<InterruptHandle, AmlError>;
    fn remove_interrupt_handler(&self, handle: InterruptHandle) -> Result<(), AmlError>;

    fn handle_fatal_error(&self, fatal_type: u8, fatal_code: u32, fatal_arg: u64) {
        panic!(
            "Fatal error while executing AML (DefFatal). fatal_type = {:?}, fatal_code = {:?}, fatal_arg = {:?}",
            fatal_type, fatal_code, fatal_arg
        );
    }
}
