//! Interrupt core: top half / bottom half split over a shared
//! status/enable/ack register triple whose bits fan out to
//! independently-owned subsystems. There is no real interrupt
//! controller to register against in a `no_std` library, so the
//! embedding kernel is expected to call [`IrqCore::top_half`] from its
//! actual ISR and [`IrqCore::bottom_half`] from whatever deferred work
//! context it schedules.

use core::sync::atomic::{AtomicU32, Ordering};

use log::{debug, warn};

use crate::error::Result;
use crate::regs::{irq_bit, Registers};

/// Callbacks the embedding device wires up to react to each IRQ cause.
/// Kept as a trait seam (not a direct dependency on `scheduler`/`fence`)
/// so this module stays testable in isolation.
pub trait IrqHandlers {
    fn on_cmd_complete(&self);
    fn on_error(&self);
    fn on_fence(&self);
    fn on_queue_empty(&self);
    fn on_shader_halt(&self);
    fn on_perf_counter(&self) {}
}

/// Mask of IRQ causes the core will ever ack or dispatch.
const KNOWN_MASK: u32 = irq_bit::CMD_COMPLETE
    | irq_bit::ERROR
    | irq_bit::FENCE
    | irq_bit::QUEUE_EMPTY
    | irq_bit::SHADER_HALT
    | irq_bit::PERF_COUNTER;

/// Accumulates pending IRQ causes between the hard-IRQ top half and
/// whatever context later runs the bottom half.
pub struct IrqCore {
    pending: AtomicU32,
}

impl IrqCore {
    pub fn new() -> Self {
        Self {
            pending: AtomicU32::new(0),
        }
    }

    /// Enable the given cause bits at the device.
    pub fn enable(&self, regs: &Registers, mask: u32) -> Result<()> {
        let current = regs.irq_enable()?;
        regs.set_irq_enable(current | (mask & KNOWN_MASK))
    }

    pub fn disable(&self, regs: &Registers, mask: u32) -> Result<()> {
        let current = regs.irq_enable()?;
        regs.set_irq_enable(current & !mask)
    }

    /// Hard-IRQ-safe top half: read `IRQ_STATUS`, ack every bit seen
    /// (write-1-to-clear), and OR the causes into the pending
    /// accumulator. Must do no allocation and take no lock that a
    /// bottom half might be holding — this is the one path in the
    /// crate explicitly allowed to run with interrupts masked on the
    /// local core.
    ///
    /// Returns `true` if any known cause fired (so the caller can
    /// decide whether to schedule the bottom half at all).
    pub fn top_half(&self, regs: &Registers) -> Result<bool> {
        let status = regs.irq_status()?;
        let causes = status & KNOWN_MASK;
        if causes == 0 {
            return Ok(false);
        }
        regs.irq_ack(causes)?;
        self.pending.fetch_or(causes, Ordering::AcqRel);
        Ok(true)
    }

    /// Deferred-work-context bottom half: atomically take and clear
    /// the pending mask, then dispatch each set bit to `handlers` in a
    /// fixed order (errors before completions, so a caller inspecting
    /// job state after a mixed batch sees the error first).
    pub fn bottom_half<H: IrqHandlers>(&self, regs: &Registers, handlers: &H) {
        let causes = self.pending.swap(0, Ordering::AcqRel);
        if causes == 0 {
            return;
        }
        if causes & irq_bit::ERROR != 0 {
            warn!("gpucmd: ERROR irq cause observed");
            handlers.on_error();
        }
        if causes & irq_bit::SHADER_HALT != 0 {
            warn!("gpucmd: SHADER_HALT irq cause observed");
            handlers.on_shader_halt();
        }
        if causes & irq_bit::FENCE != 0 {
            debug!("gpucmd: FENCE irq cause observed");
            handlers.on_fence();
        }
        if causes & irq_bit::CMD_COMPLETE != 0 {
            debug!("gpucmd: CMD_COMPLETE irq cause observed");
            handlers.on_cmd_complete();
        }
        if causes & irq_bit::QUEUE_EMPTY != 0 {
            handlers.on_queue_empty();
        }
        if causes & irq_bit::PERF_COUNTER != 0 {
            handlers.on_perf_counter();
        }
        let _ = regs;
    }

    pub fn pending_mask(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }
}

impl Default for IrqCore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use std::sync::atomic::AtomicUsize;
    use std::vec;

    fn fake_regs() -> (std::vec::Vec<u8>, Registers) {
        let mut backing = vec![0u8; 0x3000];
        let ptr = backing.as_mut_ptr();
        (backing, unsafe { Registers::new(ptr) })
    }

    #[derive(Default)]
    struct CountingHandlers {
        cmd_complete: AtomicUsize,
        error: AtomicUsize,
        fence: AtomicUsize,
        queue_empty: AtomicUsize,
        shader_halt: AtomicUsize,
    }

    impl IrqHandlers for CountingHandlers {
        fn on_cmd_complete(&self) {
            self.cmd_complete.fetch_add(1, Ordering::Relaxed);
        }
        fn on_error(&self) {
            self.error.fetch_add(1, Ordering::Relaxed);
        }
        fn on_fence(&self) {
            self.fence.fetch_add(1, Ordering::Relaxed);
        }
        fn on_queue_empty(&self) {
            self.queue_empty.fetch_add(1, Ordering::Relaxed);
        }
        fn on_shader_halt(&self) {
            self.shader_halt.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn top_half_returns_false_when_nothing_pending() {
        let (_backing, regs) = fake_regs();
        let core = IrqCore::new();
        assert_eq!(core.top_half(&regs).unwrap(), false);
    }

    #[test]
    fn top_half_acks_and_accumulates_causes() {
        let (_backing, regs) = fake_regs();
        regs.write32(crate::regs::offset::IRQ_STATUS, irq_bit::FENCE | irq_bit::CMD_COMPLETE)
            .unwrap();
        let core = IrqCore::new();
        assert!(core.top_half(&regs).unwrap());
        assert_eq!(core.pending_mask(), irq_bit::FENCE | irq_bit::CMD_COMPLETE);
    }

    #[test]
    fn bottom_half_dispatches_error_before_cmd_complete() {
        let (_backing, regs) = fake_regs();
        let core = IrqCore::new();
        core.pending.store(irq_bit::ERROR | irq_bit::CMD_COMPLETE, Ordering::Relaxed);
        let handlers = CountingHandlers::default();
        core.bottom_half(&regs, &handlers);
        assert_eq!(handlers.error.load(Ordering::Relaxed), 1);
        assert_eq!(handlers.cmd_complete.load(Ordering::Relaxed), 1);
        assert_eq!(core.pending_mask(), 0);
    }

    #[test]
    fn bottom_half_is_a_noop_when_nothing_pending() {
        let (_backing, regs) = fake_regs();
        let core = IrqCore::new();
        let handlers = CountingHandlers::default();
        core.bottom_half(&regs, &handlers);
        assert_eq!(handlers.cmd_complete.load(Ordering::Relaxed), 0);
    }
}
