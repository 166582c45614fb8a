//! Lifecycle sequencing: an explicit state machine around
//! [`DeviceContext`] so a kernel caller can suspend and resume a
//! device independently of a full teardown, rather than only ever
//! running `init` once and tearing down on drop.

use crate::clock::Clock;
use crate::device::DeviceContext;
use crate::error::{Error, Result};
use crate::memory::Allocator;
use crate::ring::MIN_RING_SIZE;

/// Where a [`LifecycleController`] currently sits. `Running` and
/// `Suspended` both imply a live [`DeviceContext`]; `Uninitialized`
/// and `ShutDown` do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Uninitialized,
    Running,
    Suspended,
    ShutDown,
}

/// Owns the single [`DeviceContext`] for one device and enforces the
/// init/suspend/resume/shutdown ordering. The embedding kernel is
/// expected to hold exactly one of these per physical device.
pub struct LifecycleController<A: Allocator> {
    device: Option<DeviceContext<A>>,
    phase: LifecyclePhase,
}

impl<A: Allocator> LifecycleController<A> {
    pub fn new() -> Self {
        Self { device: None, phase: LifecyclePhase::Uninitialized }
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub fn device(&self) -> Option<&DeviceContext<A>> {
        self.device.as_ref()
    }

    /// Bring the device up: register interface, interrupt core
    /// (initially masked), fence engine, one ring per queue, scheduler,
    /// reset/health monitor, then unmask interrupts, carried out by
    /// [`DeviceContext::init`].
    ///
    /// # Safety
    ///
    /// `base` must be a valid, mapped MMIO base address for the
    /// device's register window, live for as long as the controller
    /// remains initialized.
    pub unsafe fn init(
        &mut self,
        base: *mut u8,
        allocator: &A,
        queue_count: u8,
        queue_depth: u32,
    ) -> Result<()> {
        if self.phase != LifecyclePhase::Uninitialized {
            return Err(Error::AlreadyInProgress);
        }
        let device = unsafe {
            DeviceContext::init_with_ring_size(base, allocator, queue_count, queue_depth, MIN_RING_SIZE)
        }?;
        self.device = Some(device);
        self.phase = LifecyclePhase::Running;
        Ok(())
    }

    /// Quiesce submission, drain every ring up to one second, save
    /// registers, and disable interrupts.
    pub fn suspend(&mut self, clock: &dyn Clock) -> Result<()> {
        if self.phase != LifecyclePhase::Running {
            return Err(Error::AlreadyInProgress);
        }
        let device = self.device.as_ref().ok_or(Error::InvalidArgument)?;
        device.quiesce_for_suspend(clock)?;
        self.phase = LifecyclePhase::Suspended;
        Ok(())
    }

    /// Restore registers, re-enable interrupts, and resume rings.
    /// Health timers re-arm implicitly on the next `tick`.
    pub fn resume(&mut self, clock: &dyn Clock) -> Result<()> {
        if self.phase != LifecyclePhase::Suspended {
            return Err(Error::AlreadyInProgress);
        }
        let device = self.device.as_ref().ok_or(Error::InvalidArgument)?;
        device.resume_from_suspend(clock)?;
        self.phase = LifecyclePhase::Running;
        Ok(())
    }

    /// Tear the device down: best-effort quiesce (errors are logged by
    /// the device context itself and otherwise ignored — shutdown must
    /// not get stuck waiting on a wedged device), then drop every
    /// component in the reverse of init order.
    pub fn shutdown(&mut self, clock: &dyn Clock) -> Result<()> {
        if let Some(device) = self.device.as_ref() {
            let _ = device.quiesce_for_suspend(clock);
        }
        self.device = None;
        self.phase = LifecyclePhase::ShutDown;
        Ok(())
    }
}

impl<A: Allocator> Default for LifecycleController<A> {
    fn default() -> Self {
        Self::new()
    }
}
