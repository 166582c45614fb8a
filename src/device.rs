//! Root device context: one struct gathering every subsystem
//! (registers, interrupts, fence engine, rings, scheduler, reset/
//! health) behind a single handle an embedding kernel holds.
//! `lifecycle` owns the init/suspend/resume/shutdown sequencing on top
//! of it.

extern crate alloc;
use alloc::vec::Vec;

use log::warn;
use spin::Mutex;

use crate::clock::{Clock, Deadline};
use crate::error::{Error, Result};
use crate::fence::FenceEngine;
use crate::irq::{IrqCore, IrqHandlers};
use crate::job::{JobId, JobResult, JobType, Priority};
use crate::memory::Allocator;
use crate::regs::{irq_bit, Registers};
use crate::reset::ResetController;
use crate::ring::CommandRing;
use crate::scheduler::Scheduler;
use crate::validator::{self, ValidationContext};

const DEFAULT_RING_SIZE: usize = crate::ring::MIN_RING_SIZE;
const SUSPEND_DRAIN_MS: u64 = 1_000;
const ALL_IRQ_CAUSES: u32 = irq_bit::CMD_COMPLETE
    | irq_bit::ERROR
    | irq_bit::FENCE
    | irq_bit::QUEUE_EMPTY
    | irq_bit::SHADER_HALT
    | irq_bit::PERF_COUNTER;

struct SuspendSnapshot {
    control: u32,
    irq_enable: u32,
    tails: Vec<usize>,
}

/// One pass of the scheduler worker / timeout sweep / health monitor
/// deferred-work contexts, reported back to the caller that drives
/// the tick loop.
#[derive(Debug, Default)]
pub struct TickSummary {
    pub submitted: bool,
    pub timed_out: Vec<JobId>,
    pub hang_detected: bool,
}

/// The live, running state of one FPGA GPU device: registers, fence
/// engine, scheduler (and through it, the per-queue rings), and the
/// reset/health monitor. Owns no allocator itself — every allocation
/// happened during [`DeviceContext::init`] through the `A` the caller
/// supplied.
pub struct DeviceContext<A: Allocator> {
    regs: Registers,
    irq: IrqCore,
    fence: FenceEngine<A>,
    scheduler: Scheduler<A>,
    reset: ResetController,
    suspend_snapshot: Mutex<Option<SuspendSnapshot>>,
}

unsafe impl<A: Allocator> Send for DeviceContext<A> {}
unsafe impl<A: Allocator> Sync for DeviceContext<A> {}

impl<A: Allocator> DeviceContext<A> {
    /// Bring up the device: register window, fence engine, one ring
    /// per queue (queue 0 always exists), scheduler, reset/health
    /// monitor, then unmask interrupts. `base` must point at a live
    /// MMIO window.
    ///
    /// # Safety
    ///
    /// `base` must be a valid, mapped MMIO base address for the
    /// device's register window, live for the lifetime of the
    /// returned context.
    pub unsafe fn init(
        base: *mut u8,
        allocator: &A,
        queue_count: u8,
        queue_depth: u32,
    ) -> Result<Self> {
        Self::init_with_ring_size(base, allocator, queue_count, queue_depth, DEFAULT_RING_SIZE)
    }

    pub unsafe fn init_with_ring_size(
        base: *mut u8,
        allocator: &A,
        queue_count: u8,
        queue_depth: u32,
        ring_size: usize,
    ) -> Result<Self> {
        if queue_count == 0 || queue_count > 16 {
            return Err(Error::InvalidArgument);
        }
        let regs = unsafe { Registers::new(base) };
        let irq = IrqCore::new();

        let fence = FenceEngine::init(allocator, &regs)?;

        let mut rings = Vec::with_capacity(queue_count as usize);
        for q in 0..queue_count {
            rings.push(CommandRing::create(q, ring_size, allocator, &regs)?);
        }
        let scheduler = Scheduler::new(rings, queue_depth);
        let reset = ResetController::new();

        irq.enable(&regs, ALL_IRQ_CAUSES)?;

        Ok(Self {
            regs,
            irq,
            fence,
            scheduler,
            reset,
            suspend_snapshot: Mutex::new(None),
        })
    }

    /// Validate a raw command payload and admit it to the scheduler.
    /// When `request_fence` is set, a fence record is appended after
    /// the validated payload and the returned job's fence cell can be
    /// awaited with [`DeviceContext::wait_job`] or
    /// [`FenceEngine::wait`] directly.
    #[allow(clippy::too_many_arguments)]
    pub fn submit(
        &self,
        job_type: JobType,
        priority: Priority,
        raw_payload: &[u32],
        validation: &ValidationContext,
        queue_id: Option<u8>,
        request_fence: bool,
        timeout_ms: Option<u64>,
        deps: &[JobId],
        clock: &dyn Clock,
    ) -> Result<JobId> {
        let validated = validator::validate(raw_payload, validation)?;
        let (fence_addr, fence_value) = if request_fence {
            (Some(self.fence.page_phys_addr()), self.fence.next())
        } else {
            (None, 0)
        };
        self.scheduler.submit(
            job_type,
            priority,
            validated,
            queue_id,
            fence_addr,
            fence_value,
            timeout_ms,
            deps,
            clock,
        )
    }

    pub fn cancel(&self, job_id: JobId, clock: &dyn Clock) -> Result<()> {
        self.scheduler.cancel(job_id, clock)
    }

    pub fn job_state(&self, job_id: JobId) -> Option<crate::job::JobState> {
        self.scheduler.job_state(job_id)
    }

    /// Block the calling context until `job_id` reaches a terminal
    /// state or `timeout_ms` elapses.
    pub fn wait_job(&self, job_id: JobId, timeout_ms: u64, clock: &dyn Clock) -> Result<JobResult> {
        let deadline = Deadline::from_timeout(clock, timeout_ms);
        loop {
            match self.scheduler.job_state(job_id) {
                Some(state) if state.is_terminal() => {
                    return Ok(self.scheduler.job_result(job_id).unwrap_or(JobResult::Pending));
                }
                Some(_) => {}
                None => return Err(Error::NotFound),
            }
            if deadline.expired(clock) {
                return Err(Error::Timeout);
            }
            clock.spin_hint();
        }
    }

    /// Run the hard-IRQ top half, and if any known cause fired, the
    /// bottom half immediately after. A caller with a real deferred
    /// work mechanism may instead call the interrupt core's two halves
    /// separately from different contexts; this is the convenience
    /// path for callers without one.
    pub fn service_interrupt(&self, clock: &dyn Clock) -> Result<bool> {
        let fired = self.irq.top_half(&self.regs)?;
        if fired {
            let handlers = DeviceIrqHandlers { device: self, clock };
            self.irq.bottom_half(&self.regs, &handlers);
        }
        Ok(fired)
    }

    /// One pass of the scheduler worker: attempt a submission, sweep
    /// for timed-out jobs, and run the heartbeat/hang checks when no
    /// reset is already in flight.
    pub fn tick(&self, clock: &dyn Clock) -> Result<TickSummary> {
        let submitted = self.scheduler.tick(&self.regs, clock, Some(&self.fence))?;
        let timed_out = self.scheduler.timeout_sweep(clock);
        self.scheduler.reap_stale_slots();

        let mut hang_detected = !timed_out.is_empty();
        if !self.reset.is_in_reset() {
            if self.reset.heartbeat_tick(&self.regs)? {
                warn!("gpucmd: heartbeat threshold exceeded, reset recommended");
                hang_detected = true;
            }
            if self.reset.hang_check(&self.regs, 0, clock)? {
                hang_detected = true;
            }
        }

        Ok(TickSummary { submitted, timed_out, hang_detected })
    }

    /// Run the full staged reset sequence. Any job still `Running` on
    /// any queue is aborted first: the reset is about to stall the
    /// ring it was on, so no device completion for it will ever
    /// arrive, and its slot must be freed before new work can be
    /// admitted afterward.
    pub fn reset_now(&self, clock: &dyn Clock) -> Result<()> {
        self.scheduler.abort_all_running(clock);
        self.reset.reset_sequence(&self.regs, self.scheduler.rings(), clock)?;
        self.scheduler.reap_stale_slots();
        Ok(())
    }

    pub fn reset_count(&self) -> u64 {
        self.reset.reset_count()
    }

    /// Quiesce submission, drain rings, save registers, and disable
    /// interrupts.
    pub fn quiesce_for_suspend(&self, clock: &dyn Clock) -> Result<()> {
        for ring in self.scheduler.rings() {
            ring.suspend(SUSPEND_DRAIN_MS, &self.regs, clock)?;
        }
        let control = self.regs.control()?;
        let irq_enable = self.regs.irq_enable()?;
        let tails = self.scheduler.rings().iter().map(|r| r.tail()).collect();
        self.regs.set_irq_enable(0)?;
        *self.suspend_snapshot.lock() = Some(SuspendSnapshot { control, irq_enable, tails });
        Ok(())
    }

    /// Restore registers, re-enable interrupts, and resume rings.
    /// Health timers re-arm implicitly: heartbeat and hang-check state
    /// is plain atomics that keep ticking once `tick` is called again.
    pub fn resume_from_suspend(&self, clock: &dyn Clock) -> Result<()> {
        let snapshot = self
            .suspend_snapshot
            .lock()
            .take()
            .ok_or(Error::InvalidArgument)?;
        self.regs.set_control(snapshot.control)?;
        for (ring, tail) in self.scheduler.rings().iter().zip(snapshot.tails) {
            ring.resume(tail, &self.regs)?;
        }
        self.regs.set_irq_enable(snapshot.irq_enable)?;
        let _ = clock;
        Ok(())
    }

    pub fn queue_count(&self) -> u8 {
        self.scheduler.queue_count()
    }

    pub fn fence(&self) -> &FenceEngine<A> {
        &self.fence
    }

    pub fn registers(&self) -> &Registers {
        &self.regs
    }
}

struct DeviceIrqHandlers<'a, A: Allocator> {
    device: &'a DeviceContext<A>,
    clock: &'a dyn Clock,
}

impl<'a, A: Allocator> IrqHandlers for DeviceIrqHandlers<'a, A> {
    fn on_cmd_complete(&self) {
        if let Err(e) = self.device.scheduler.poll_completions(&self.device.regs, self.clock) {
            warn!("gpucmd: poll_completions failed during CMD_COMPLETE dispatch: {e}");
        }
    }

    fn on_error(&self) {
        if let Err(e) = self.device.scheduler.poll_completions(&self.device.regs, self.clock) {
            warn!("gpucmd: poll_completions failed during ERROR dispatch: {e}");
        }
    }

    fn on_fence(&self) {
        self.device.fence.process(&self.device.regs);
    }

    fn on_queue_empty(&self) {}

    fn on_shader_halt(&self) {
        warn!("gpucmd: SHADER_HALT observed; caller should consider a reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::HeapAllocator;
    use crate::wire;
    extern crate std;
    use std::vec;

    struct FakeClock {
        now: core::sync::atomic::AtomicU64,
    }
    impl Clock for FakeClock {
        fn now_ms(&self) -> u64 {
            self.now.load(core::sync::atomic::Ordering::Relaxed)
        }
        fn spin_hint(&self) {
            self.now.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        }
    }
    impl FakeClock {
        fn new() -> Self {
            Self { now: core::sync::atomic::AtomicU64::new(0) }
        }
    }

    fn backing_window() -> std::vec::Vec<u8> {
        vec![0u8; 0x3000]
    }

    #[test]
    fn init_rejects_zero_queues() {
        let alloc = HeapAllocator;
        let mut backing = backing_window();
        let ptr = backing.as_mut_ptr();
        let err = unsafe { DeviceContext::init(ptr, &alloc, 0, 16) }.unwrap_err();
        assert_eq!(err, Error::InvalidArgument);
    }

    #[test]
    fn submit_and_wait_round_trip_a_nop() {
        let alloc = HeapAllocator;
        let mut backing = backing_window();
        let ptr = backing.as_mut_ptr();
        let device = unsafe { DeviceContext::init(ptr, &alloc, 2, 4) }.unwrap();
        let clock = FakeClock::new();
        let validation = ValidationContext { privileged: false };

        let job = device
            .submit(JobType::Draw, Priority::Normal, &wire::nop(), &validation, Some(0), false, None, &[], &clock)
            .unwrap();

        let tick = device.tick(&clock).unwrap();
        assert!(tick.submitted);

        let regs = device.registers();
        let tail = device.scheduler.ring(0).unwrap().tail();
        regs.write32(crate::regs::QueueBank::for_queue(0).cmd_head(), tail as u32).unwrap();

        assert!(device.service_interrupt(&clock).is_ok());
        device.scheduler.poll_completions(regs, &clock).unwrap();

        let result = device.wait_job(job, 0, &clock).unwrap();
        assert_eq!(result, JobResult::Ok);
    }

    #[test]
    fn suspend_then_resume_preserves_ring_tail() {
        let alloc = HeapAllocator;
        let mut backing = backing_window();
        let ptr = backing.as_mut_ptr();
        let device = unsafe { DeviceContext::init(ptr, &alloc, 1, 4) }.unwrap();
        let clock = FakeClock::new();
        let validation = ValidationContext { privileged: false };

        let _job = device
            .submit(JobType::Draw, Priority::Normal, &wire::nop(), &validation, Some(0), false, None, &[], &clock)
            .unwrap();
        device.tick(&clock).unwrap();
        let tail_before = device.scheduler.ring(0).unwrap().tail();

        let regs = device.registers();
        regs.write32(crate::regs::QueueBank::for_queue(0).cmd_head(), tail_before as u32).unwrap();

        device.quiesce_for_suspend(&clock).unwrap();
        device.resume_from_suspend(&clock).unwrap();

        assert_eq!(device.scheduler.ring(0).unwrap().tail(), tail_before);
    }

    #[test]
    fn reset_now_frees_the_running_slot_so_the_next_submit_runs() {
        let alloc = HeapAllocator;
        let mut backing = backing_window();
        let ptr = backing.as_mut_ptr();
        let device = unsafe { DeviceContext::init(ptr, &alloc, 1, 4) }.unwrap();
        let clock = FakeClock::new();
        let validation = ValidationContext { privileged: false };

        let stuck = device
            .submit(JobType::Draw, Priority::Normal, &wire::nop(), &validation, Some(0), false, None, &[], &clock)
            .unwrap();
        let tick = device.tick(&clock).unwrap();
        assert!(tick.submitted);
        assert_eq!(device.scheduler.job_state(stuck), Some(crate::job::JobState::Running));

        // Device reports idle and has drained the ring, but the job it
        // was running never got a completion record: a stuck shader, not
        // a stuck ring, which is exactly what a staged reset must still
        // recover from.
        let regs = device.registers();
        regs.write32(crate::regs::offset::STATUS, crate::regs::status_bit::IDLE).unwrap();
        let tail = device.scheduler.ring(0).unwrap().tail();
        regs.write32(crate::regs::QueueBank::for_queue(0).cmd_head(), tail as u32).unwrap();

        device.reset_now(&clock).unwrap();
        assert_eq!(device.scheduler.job_state(stuck), Some(crate::job::JobState::Aborted));

        let after = device
            .submit(JobType::Draw, Priority::Normal, &wire::nop(), &validation, Some(0), false, None, &[], &clock)
            .unwrap();
        let tick = device.tick(&clock).unwrap();
        assert!(tick.submitted);
        assert_eq!(device.scheduler.job_state(after), Some(crate::job::JobState::Running));
    }
}
