//! Register interface.
//!
//! Typed accessors over the memory-mapped register window: one global
//! bank (version/caps/control/status/scratch/irq/fence) plus a
//! strided per-queue bank for command-ring base/size/head/tail.

use core::sync::atomic::{compiler_fence, fence, Ordering};

use crate::error::{Error, Result};

/// Per-queue register bank stride, in bytes.
pub const QUEUE_BANK_STRIDE: usize = 0x10;
/// Doorbell region stride, in bytes.
pub const DOORBELL_STRIDE: usize = 4;

pub mod offset {
    pub const VERSION: usize = 0x0000;
    pub const CAPS: usize = 0x0004;
    pub const CONTROL: usize = 0x0008;
    pub const STATUS: usize = 0x000C;
    pub const SCRATCH: usize = 0x0010;
    pub const IRQ_STATUS: usize = 0x0020;
    pub const IRQ_ENABLE: usize = 0x0024;
    pub const IRQ_ACK: usize = 0x0028;
    pub const CMD_BANK_BASE: usize = 0x0040;
    pub const FENCE_ADDR: usize = 0x0060;
    pub const FENCE_VALUE: usize = 0x0064;
    pub const DOORBELL_BASE: usize = 0x2000;
}

pub mod control_bit {
    pub const ENABLE: u32 = 1 << 0;
    pub const RESET: u32 = 1 << 1;
    pub const PAUSE: u32 = 1 << 2;
    pub const FLUSH_CACHE: u32 = 1 << 4;
    pub const PERF_COUNTER: u32 = 1 << 5;
}

pub mod status_bit {
    pub const IDLE: u32 = 1 << 0;
    pub const BUSY: u32 = 1 << 1;
    pub const ERROR: u32 = 1 << 2;
    pub const HALTED: u32 = 1 << 3;
    pub const FENCE_DONE: u32 = 1 << 4;
    pub const CMD_EMPTY: u32 = 1 << 5;
    pub const CMD_FULL: u32 = 1 << 6;
}

pub mod irq_bit {
    pub const CMD_COMPLETE: u32 = 0x01;
    pub const ERROR: u32 = 0x02;
    pub const FENCE: u32 = 0x04;
    pub const QUEUE_EMPTY: u32 = 0x08;
    pub const SHADER_HALT: u32 = 0x10;
    pub const PERF_COUNTER: u32 = 0x20;
}

/// Per-queue register bank (`CMD_BASE`, `CMD_SIZE`, `CMD_HEAD`, `CMD_TAIL`).
#[derive(Debug, Clone, Copy)]
pub struct QueueBank {
    pub base: usize,
}

impl QueueBank {
    pub fn for_queue(queue_id: u8) -> Self {
        Self {
            base: offset::CMD_BANK_BASE + QUEUE_BANK_STRIDE * queue_id as usize,
        }
    }

    pub fn cmd_base(&self) -> usize {
        self.base
    }
    pub fn cmd_size(&self) -> usize {
        self.base + 0x4
    }
    pub fn cmd_head(&self) -> usize {
        self.base + 0x8
    }
    pub fn cmd_tail(&self) -> usize {
        self.base + 0xC
    }
}

/// Typed accessor over a memory-mapped register window.
///
/// `base` is the virtual base address of the window; all offsets are
/// relative to it. Every access goes through `read_volatile`/
/// `write_volatile` — the device is free to change register contents
/// asynchronously (e.g. `CMD_HEAD`) and the compiler must never cache
/// a stale value across calls.
pub struct Registers {
    base: *mut u8,
}

unsafe impl Send for Registers {}
unsafe impl Sync for Registers {}

impl Registers {
    /// # Safety
    ///
    /// `base` must point to a valid, live MMIO window at least large
    /// enough for every offset this crate touches.
    pub unsafe fn new(base: *mut u8) -> Self {
        Self { base }
    }

    fn check_aligned(offset: usize) -> Result<()> {
        if offset % 4 != 0 {
            Err(Error::InvalidArgument)
        } else {
            Ok(())
        }
    }

    pub fn read32(&self, offset: usize) -> Result<u32> {
        Self::check_aligned(offset)?;
        let val = unsafe { (self.base.add(offset) as *const u32).read_volatile() };
        Ok(val)
    }

    pub fn write32(&self, offset: usize, value: u32) -> Result<()> {
        Self::check_aligned(offset)?;
        unsafe { (self.base.add(offset) as *mut u32).write_volatile(value) };
        Ok(())
    }

    /// Issue the write barrier required between the `CMD_TAIL` write
    /// and the subsequent doorbell write.
    pub fn write_barrier(&self) {
        compiler_fence(Ordering::Release);
        fence(Ordering::Release);
    }

    /// Issue the read barrier required after observing a status bit
    /// and before consuming memory the device wrote.
    pub fn read_barrier(&self) {
        fence(Ordering::Acquire);
        compiler_fence(Ordering::Acquire);
    }

    pub fn version(&self) -> Result<u32> {
        self.read32(offset::VERSION)
    }

    pub fn caps(&self) -> Result<u32> {
        self.read32(offset::CAPS)
    }

    pub fn control(&self) -> Result<u32> {
        self.read32(offset::CONTROL)
    }

    pub fn set_control(&self, value: u32) -> Result<()> {
        self.write32(offset::CONTROL, value)
    }

    pub fn status(&self) -> Result<u32> {
        self.read32(offset::STATUS)
    }

    pub fn scratch(&self) -> Result<u32> {
        self.read32(offset::SCRATCH)
    }

    pub fn set_scratch(&self, value: u32) -> Result<()> {
        self.write32(offset::SCRATCH, value)
    }

    pub fn irq_status(&self) -> Result<u32> {
        self.read32(offset::IRQ_STATUS)
    }

    pub fn irq_enable(&self) -> Result<u32> {
        self.read32(offset::IRQ_ENABLE)
    }

    pub fn set_irq_enable(&self, mask: u32) -> Result<()> {
        self.write32(offset::IRQ_ENABLE, mask)
    }

    pub fn irq_ack(&self, mask: u32) -> Result<()> {
        self.write32(offset::IRQ_ACK, mask)
    }

    pub fn fence_addr(&self) -> Result<u32> {
        self.read32(offset::FENCE_ADDR)
    }

    pub fn set_fence_addr(&self, value: u32) -> Result<()> {
        self.write32(offset::FENCE_ADDR, value)
    }

    pub fn fence_value(&self) -> Result<u32> {
        self.read32(offset::FENCE_VALUE)
    }

    pub fn cmd_head(&self, queue_id: u8) -> Result<u32> {
        self.read32(QueueBank::for_queue(queue_id).cmd_head())
    }

    pub fn set_cmd_tail(&self, queue_id: u8, value: u32) -> Result<()> {
        self.write32(QueueBank::for_queue(queue_id).cmd_tail(), value)
    }

    pub fn set_cmd_base(&self, queue_id: u8, value: u32) -> Result<()> {
        self.write32(QueueBank::for_queue(queue_id).cmd_base(), value)
    }

    pub fn set_cmd_size(&self, queue_id: u8, value: u32) -> Result<()> {
        self.write32(QueueBank::for_queue(queue_id).cmd_size(), value)
    }

    /// Ring the per-queue doorbell; any write is sufficient.
    pub fn ring_doorbell(&self, queue_id: u8) -> Result<()> {
        self.write32(
            offset::DOORBELL_BASE + DOORBELL_STRIDE * queue_id as usize,
            1,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use std::vec;

    fn fake_regs() -> (std::vec::Vec<u8>, Registers) {
        let mut backing = vec![0u8; 0x3000];
        let ptr = backing.as_mut_ptr();
        let regs = unsafe { Registers::new(ptr) };
        (backing, regs)
    }

    #[test]
    fn rejects_misaligned_offset() {
        let (_backing, regs) = fake_regs();
        assert_eq!(regs.read32(1), Err(Error::InvalidArgument));
        assert_eq!(regs.write32(2, 0), Err(Error::InvalidArgument));
    }

    #[test]
    fn queue_bank_stride_matches_spec() {
        let bank0 = QueueBank::for_queue(0);
        let bank1 = QueueBank::for_queue(1);
        assert_eq!(bank0.cmd_base(), offset::CMD_BANK_BASE);
        assert_eq!(bank1.cmd_base() - bank0.cmd_base(), QUEUE_BANK_STRIDE);
    }

    #[test]
    fn round_trips_control_register() {
        let (_backing, regs) = fake_regs();
        regs.set_control(control_bit::ENABLE | control_bit::PAUSE).unwrap();
        assert_eq!(regs.control().unwrap(), control_bit::ENABLE | control_bit::PAUSE);
    }
}
