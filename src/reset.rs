//! Reset & health monitoring: the staged reset sequence (quiesce,
//! save registers, assert/deassert reset, poll idle, re-probe,
//! restore, resume), plus a scratch-register heartbeat and a
//! head/fence-stall hang detector that run independently of it.

extern crate alloc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use log::{error, warn};

use crate::clock::{Clock, Deadline};
use crate::error::{Error, Result};
use crate::memory::Allocator;
use crate::regs::{control_bit, status_bit, Registers};
use crate::ring::CommandRing;

pub const DEFAULT_HEARTBEAT_MISS_THRESHOLD: u32 = 3;
pub const DEFAULT_HANG_TIMEOUT_MS: u64 = 5_000;
const RESET_ASSERT_MS: u64 = 10;
const RESET_POLL_MS: u64 = 1_000;
const RING_SUSPEND_MS: u64 = 1_000;
const REINIT_PROBE_PATTERN: u32 = 0xA5A5_A5A5;

struct ResetState {
    in_reset: AtomicBool,
    reset_count: AtomicU64,
    last_reset_ms: AtomicU64,
    heartbeat_counter: AtomicU32,
    heartbeat_misses: AtomicU32,
    hang_initialized: AtomicBool,
    last_cmd_head: AtomicU32,
    last_fence_value: AtomicU32,
    last_sample_ms: AtomicU64,
}

/// Heartbeat, hang detection, and the staged reset sequence. Owns no
/// hardware resources itself — every method takes the registers,
/// rings, and clock it needs to operate on explicitly, so it composes
/// with whatever the embedding [`crate::device`] context already owns
/// rather than duplicating ownership of them.
pub struct ResetController {
    state: ResetState,
    heartbeat_miss_threshold: u32,
    hang_timeout_ms: u64,
}

impl ResetController {
    pub fn new() -> Self {
        Self::with_thresholds(DEFAULT_HEARTBEAT_MISS_THRESHOLD, DEFAULT_HANG_TIMEOUT_MS)
    }

    pub fn with_thresholds(heartbeat_miss_threshold: u32, hang_timeout_ms: u64) -> Self {
        Self {
            state: ResetState {
                in_reset: AtomicBool::new(false),
                reset_count: AtomicU64::new(0),
                last_reset_ms: AtomicU64::new(0),
                heartbeat_counter: AtomicU32::new(0),
                heartbeat_misses: AtomicU32::new(0),
                hang_initialized: AtomicBool::new(false),
                last_cmd_head: AtomicU32::new(0),
                last_fence_value: AtomicU32::new(0),
                last_sample_ms: AtomicU64::new(0),
            },
            heartbeat_miss_threshold,
            hang_timeout_ms,
        }
    }

    pub fn is_in_reset(&self) -> bool {
        self.state.in_reset.load(Ordering::Acquire)
    }

    pub fn reset_count(&self) -> u64 {
        self.state.reset_count.load(Ordering::Relaxed)
    }

    fn record_heartbeat_sample(&self, written: u32, read_back: u32) -> bool {
        if written == read_back {
            self.state.heartbeat_misses.store(0, Ordering::Relaxed);
            false
        } else {
            let misses = self.state.heartbeat_misses.fetch_add(1, Ordering::Relaxed) + 1;
            misses >= self.heartbeat_miss_threshold
        }
    }

    /// Write a monotonic counter to `SCRATCH` and read it back.
    /// Returns `true` once consecutive mismatches cross the
    /// configured threshold, meaning a reset should be scheduled.
    pub fn heartbeat_tick(&self, regs: &Registers) -> Result<bool> {
        let counter = self.state.heartbeat_counter.fetch_add(1, Ordering::Relaxed) + 1;
        regs.set_scratch(counter)?;
        let read_back = regs.scratch()?;
        let trip = self.record_heartbeat_sample(counter, read_back);
        if trip {
            warn!("gpucmd: heartbeat missed {} times consecutively", self.heartbeat_miss_threshold);
        }
        Ok(trip)
    }

    /// Compare `CMD_HEAD` (for `queue_id`) and the fence value against
    /// the last sample; declares a hang if both are unchanged for
    /// longer than `hang_timeout_ms` while `STATUS_BUSY` is set.
    pub fn hang_check(&self, regs: &Registers, queue_id: u8, clock: &dyn Clock) -> Result<bool> {
        let head = regs.cmd_head(queue_id)?;
        let fence_value = regs.fence_value()?;
        let status = regs.status()?;
        let now = clock.now_ms();

        if !self.state.hang_initialized.swap(true, Ordering::AcqRel) {
            self.state.last_cmd_head.store(head, Ordering::Relaxed);
            self.state.last_fence_value.store(fence_value, Ordering::Relaxed);
            self.state.last_sample_ms.store(now, Ordering::Relaxed);
            return Ok(false);
        }

        let last_head = self.state.last_cmd_head.load(Ordering::Relaxed);
        let last_fence = self.state.last_fence_value.load(Ordering::Relaxed);
        if head != last_head || fence_value != last_fence {
            self.state.last_cmd_head.store(head, Ordering::Relaxed);
            self.state.last_fence_value.store(fence_value, Ordering::Relaxed);
            self.state.last_sample_ms.store(now, Ordering::Relaxed);
            return Ok(false);
        }

        let last_sample = self.state.last_sample_ms.load(Ordering::Relaxed);
        let stalled_for = now.saturating_sub(last_sample);
        let hung = (status & status_bit::BUSY != 0) && stalled_for > self.hang_timeout_ms;
        if hung {
            error!("gpucmd: hang detected on queue {queue_id}: stalled {stalled_for}ms");
        }
        Ok(hung)
    }

    /// Run the full staged reset sequence. A no-op if a reset is
    /// already in progress.
    pub fn reset_sequence<A: Allocator>(
        &self,
        regs: &Registers,
        rings: &[CommandRing<A>],
        clock: &dyn Clock,
    ) -> Result<()> {
        if self.state.in_reset.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let outcome = self.run_reset_steps(regs, rings, clock);
        self.state.in_reset.store(false, Ordering::Release);
        if outcome.is_ok() {
            self.state.reset_count.fetch_add(1, Ordering::Relaxed);
            self.state.last_reset_ms.store(clock.now_ms(), Ordering::Relaxed);
        }
        outcome
    }

    fn run_reset_steps<A: Allocator>(
        &self,
        regs: &Registers,
        rings: &[CommandRing<A>],
        clock: &dyn Clock,
    ) -> Result<()> {
        // Step 2: suspend each ring (disable + wait for head to meet tail).
        for ring in rings {
            ring.suspend(RING_SUSPEND_MS, regs, clock)?;
        }

        // Step 3: save host-controlled registers and per-ring tails.
        let saved_control = regs.control()?;
        let saved_irq_enable = regs.irq_enable()?;
        let saved_fence_addr = regs.fence_addr()?;
        let saved_tails: Vec<usize> = rings.iter().map(|r| r.tail()).collect();

        // Step 4: disable interrupts.
        regs.set_irq_enable(0)?;

        // Step 5: assert/deassert reset, poll STATUS_IDLE.
        regs.set_control(saved_control | control_bit::RESET)?;
        busy_wait(clock, RESET_ASSERT_MS);
        regs.set_control(saved_control & !control_bit::RESET)?;
        let deadline = Deadline::from_timeout(clock, RESET_POLL_MS);
        loop {
            if regs.status()? & status_bit::IDLE != 0 {
                break;
            }
            if deadline.expired(clock) {
                error!("gpucmd: device did not report STATUS_IDLE after reset");
                return Err(Error::HardwareError);
            }
            clock.spin_hint();
        }

        // Step 6: re-initialize, responsiveness probe.
        let _ = regs.version()?;
        let _ = regs.caps()?;
        regs.set_scratch(REINIT_PROBE_PATTERN)?;
        if regs.scratch()? != REINIT_PROBE_PATTERN {
            error!("gpucmd: device unresponsive after reset re-init probe");
            return Err(Error::HardwareError);
        }

        // Step 7: restore saved registers, reverse of save order, control last.
        regs.set_fence_addr(saved_fence_addr)?;
        regs.set_control(saved_control)?;

        // Step 8: re-enable interrupts.
        regs.set_irq_enable(saved_irq_enable)?;

        // Step 9: resume rings.
        for (ring, tail) in rings.iter().zip(saved_tails) {
            ring.resume(tail, regs)?;
        }

        Ok(())
    }
}

impl Default for ResetController {
    fn default() -> Self {
        Self::new()
    }
}

fn busy_wait(clock: &dyn Clock, ms: u64) {
    let deadline = Deadline::from_timeout(clock, ms);
    while !deadline.expired(clock) {
        clock.spin_hint();
    }
}
