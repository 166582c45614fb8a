//! Command ring: a single-producer, lock-guarded ring buffer holding
//! variable-length dword records, using the classic reserved-slot
//! full/empty convention (capacity - 1 usable slots).
//!
//! The head is device-owned: it lives in a hardware register and is
//! re-read on every call rather than cached locally, since the device
//! advances it asynchronously. The tail is host-private and only
//! published to the device on `kick`.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

use crate::clock::{Clock, Deadline};
use crate::error::{Error, Result};
use crate::memory::{Allocator, Dma};
use crate::regs::{status_bit, Registers};

/// Ring size bounds, in bytes.
pub const MIN_RING_SIZE: usize = 4096;
pub const MAX_RING_SIZE: usize = 262_144;

fn round_up_pow2(size: usize) -> usize {
    if size <= MIN_RING_SIZE {
        return MIN_RING_SIZE;
    }
    size.next_power_of_two()
}

struct RingInner {
    /// Host-private write position, in dwords, modulo `capacity_dw`.
    tail: usize,
}

/// A power-of-two, DMA-coherent command ring for one hardware queue.
pub struct CommandRing<A: Allocator> {
    queue_id: u8,
    size_bytes: usize,
    capacity_dw: usize,
    buffer: Dma<u32>,
    inner: Mutex<RingInner>,
    submitted_cmds: AtomicU64,
    completed_cmds: AtomicU64,
    enabled: AtomicBool,
    _allocator: core::marker::PhantomData<A>,
}

unsafe impl<A: Allocator> Send for CommandRing<A> {}
unsafe impl<A: Allocator> Sync for CommandRing<A> {}

impl<A: Allocator> CommandRing<A> {
    /// Create a ring for `queue_id`. `size` is rounded up to the next
    /// power of two within `[MIN_RING_SIZE, MAX_RING_SIZE]`. Programs
    /// the device's base/size registers for this queue and resets the
    /// host-private tail to zero.
    pub fn create(
        queue_id: u8,
        size: usize,
        allocator: &A,
        regs: &Registers,
    ) -> Result<Self> {
        if size == 0 || size > MAX_RING_SIZE {
            return Err(Error::InvalidArgument);
        }
        let size_bytes = round_up_pow2(size);
        if size_bytes > MAX_RING_SIZE {
            return Err(Error::InvalidArgument);
        }
        let capacity_dw = size_bytes / 4;
        let buffer = Dma::<u32>::allocate(allocator, capacity_dw)?;

        regs.set_cmd_base(queue_id, buffer.phys_addr as u32)?;
        regs.set_cmd_size(queue_id, size_bytes as u32)?;
        regs.set_cmd_tail(queue_id, 0)?;

        Ok(Self {
            queue_id,
            size_bytes,
            capacity_dw,
            buffer,
            inner: Mutex::new(RingInner { tail: 0 }),
            submitted_cmds: AtomicU64::new(0),
            completed_cmds: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
            _allocator: core::marker::PhantomData,
        })
    }

    pub fn queue_id(&self) -> u8 {
        self.queue_id
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn capacity_dw(&self) -> usize {
        self.capacity_dw
    }

    pub fn submitted_cmds(&self) -> u64 {
        self.submitted_cmds.load(Ordering::Relaxed)
    }

    pub fn completed_cmds(&self) -> u64 {
        self.completed_cmds.load(Ordering::Relaxed)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Available dwords using the reserved-slot convention. `head` is
    /// re-read from the device on every call — never cached.
    pub fn space_dw(&self, regs: &Registers) -> Result<usize> {
        let head = regs.cmd_head(self.queue_id)? as usize % self.capacity_dw;
        let tail = self.inner.lock().tail;
        let used = (tail + self.capacity_dw - head) % self.capacity_dw;
        Ok(self.capacity_dw - 1 - used)
    }

    /// True when `head == tail`.
    pub fn is_empty(&self, regs: &Registers) -> Result<bool> {
        let head = regs.cmd_head(self.queue_id)? as usize % self.capacity_dw;
        Ok(head == self.inner.lock().tail)
    }

    /// Poll `space_dw` at short intervals until at least `needed`
    /// dwords are free, or `timeout_ms` elapses. A `STATUS_ERROR`
    /// observed mid-poll aborts immediately with `HardwareError` —
    /// the caller is expected to schedule a reset.
    pub fn wait_space(
        &self,
        needed: usize,
        timeout_ms: u64,
        regs: &Registers,
        clock: &dyn Clock,
    ) -> Result<()> {
        if needed >= self.capacity_dw {
            return Err(Error::InvalidArgument);
        }
        let deadline = Deadline::from_timeout(clock, timeout_ms);
        loop {
            if self.space_dw(regs)? >= needed {
                return Ok(());
            }
            let status = regs.status()?;
            if status & status_bit::ERROR != 0 {
                return Err(Error::HardwareError);
            }
            if deadline.expired(clock) {
                return Err(Error::Timeout);
            }
            clock.spin_hint();
        }
    }

    /// Copy `dwords` into the ring at `tail`, wrapping at the
    /// boundary, and advance the host-private tail. Issues a write
    /// barrier before returning so the writes happen-before the
    /// subsequent `kick`.
    ///
    /// The caller must hold whatever external serialization applies
    /// to this queue (the device context's command lock) for the
    /// duration between `write` and `kick`.
    pub fn write(&self, dwords: &[u32], regs: &Registers) -> Result<()> {
        if dwords.len() >= self.capacity_dw {
            return Err(Error::InvalidArgument);
        }
        let mut inner = self.inner.lock();
        let mut pos = inner.tail;
        for &dw in dwords {
            unsafe {
                self.buffer.addr.add(pos).write_volatile(dw);
            }
            pos = (pos + 1) % self.capacity_dw;
        }
        inner.tail = pos;
        regs.write_barrier();
        Ok(())
    }

    /// Read back `count` dwords starting at `from` (dword units),
    /// used by round-trip tests to confirm the ring holds exactly
    /// what was written before the doorbell fires.
    pub fn peek(&self, from: usize, count: usize) -> alloc::vec::Vec<u32> {
        let mut out = alloc::vec::Vec::with_capacity(count);
        let mut pos = from % self.capacity_dw;
        for _ in 0..count {
            out.push(unsafe { self.buffer.addr.add(pos).read_volatile() });
            pos = (pos + 1) % self.capacity_dw;
        }
        out
    }

    pub fn tail(&self) -> usize {
        self.inner.lock().tail
    }

    /// Publish the host-private tail to the device and ring the
    /// doorbell. Ownership of the written region transfers to the
    /// device until `head` advances past it.
    pub fn kick(&self, regs: &Registers) -> Result<()> {
        let tail = self.inner.lock().tail;
        regs.set_cmd_tail(self.queue_id, tail as u32)?;
        regs.ring_doorbell(self.queue_id)?;
        self.submitted_cmds.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Record that the device has consumed some submitted work, for
    /// the completion hook driven by the IRQ bottom half.
    pub fn note_completion(&self) {
        self.completed_cmds.fetch_add(1, Ordering::Relaxed);
    }

    /// Disable new submissions and wait up to `timeout_ms` for the
    /// device to catch `head` up to `tail`, as required by the second
    /// step of the reset sequence.
    pub fn suspend(&self, timeout_ms: u64, regs: &Registers, clock: &dyn Clock) -> Result<()> {
        self.set_enabled(false);
        let deadline = Deadline::from_timeout(clock, timeout_ms);
        loop {
            if self.is_empty(regs)? {
                return Ok(());
            }
            if deadline.expired(clock) {
                return Err(Error::Timeout);
            }
            clock.spin_hint();
        }
    }

    /// Re-program base/size and restore head/tail after a reset,
    /// re-enabling submissions.
    pub fn resume(&self, saved_tail: usize, regs: &Registers) -> Result<()> {
        regs.set_cmd_base(self.queue_id, self.buffer.phys_addr as u32)?;
        regs.set_cmd_size(self.queue_id, self.size_bytes as u32)?;
        let tail = saved_tail % self.capacity_dw;
        self.inner.lock().tail = tail;
        regs.set_cmd_tail(self.queue_id, tail as u32)?;
        self.set_enabled(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::memory::test_support::HeapAllocator;
    extern crate std;
    use std::vec;

    struct FakeClock {
        now: core::sync::atomic::AtomicU64,
    }
    impl Clock for FakeClock {
        fn now_ms(&self) -> u64 {
            self.now.load(Ordering::Relaxed)
        }
        fn spin_hint(&self) {
            self.now.fetch_add(1, Ordering::Relaxed);
        }
    }
    impl FakeClock {
        fn new() -> Self {
            Self { now: core::sync::atomic::AtomicU64::new(0) }
        }
        fn advance(&self, ms: u64) {
            self.now.fetch_add(ms, Ordering::Relaxed);
        }
    }

    fn fake_regs() -> (std::vec::Vec<u8>, Registers) {
        let mut backing = vec![0u8; 0x3000];
        let ptr = backing.as_mut_ptr();
        let regs = unsafe { Registers::new(ptr) };
        (backing, regs)
    }

    #[test]
    fn create_rounds_size_up_to_power_of_two() {
        let alloc = HeapAllocator;
        let (_backing, regs) = fake_regs();
        let ring = CommandRing::create(0, 5000, &alloc, &regs).unwrap();
        assert_eq!(ring.size_bytes(), 8192);
    }

    #[test]
    fn rejects_size_above_max() {
        let alloc = HeapAllocator;
        let (_backing, regs) = fake_regs();
        let err = CommandRing::create(0, MAX_RING_SIZE + 1, &alloc, &regs).unwrap_err();
        assert_eq!(err, Error::InvalidArgument);
    }

    #[test]
    fn fill_and_drain_boundary_scenario() {
        // 4096-byte ring == 1024 dwords, one slot reserved.
        let alloc = HeapAllocator;
        let (_backing, regs) = fake_regs();
        let ring = CommandRing::create(1, MIN_RING_SIZE, &alloc, &regs).unwrap();
        assert_eq!(ring.capacity_dw(), 1024);

        for _ in 0..1023 {
            ring.write(&crate::wire::nop(), &regs).unwrap();
        }
        assert_eq!(ring.space_dw(&regs).unwrap(), 0);

        let clock = FakeClock::new();
        let err = ring.wait_space(1, 5, &regs, &clock).unwrap_err();
        assert_eq!(err, Error::Timeout);

        // Device drains everything.
        regs.write32(crate::regs::QueueBank::for_queue(1).cmd_head(), 1023).unwrap();
        assert_eq!(ring.space_dw(&regs).unwrap(), 1023);
    }

    #[test]
    fn write_then_kick_round_trips_payload() {
        let alloc = HeapAllocator;
        let (_backing, regs) = fake_regs();
        let ring = CommandRing::create(0, MIN_RING_SIZE, &alloc, &regs).unwrap();
        let payload = crate::wire::fence(0x1000, 7);
        ring.write(&payload, &regs).unwrap();
        let read_back = ring.peek(0, payload.len());
        assert_eq!(read_back.as_slice(), &payload[..]);
        ring.kick(&regs).unwrap();
        assert_eq!(ring.submitted_cmds(), 1);
    }

    #[test]
    fn wait_space_aborts_on_hardware_error() {
        let alloc = HeapAllocator;
        let (_backing, regs) = fake_regs();
        let ring = CommandRing::create(2, MIN_RING_SIZE, &alloc, &regs).unwrap();
        for _ in 0..1023 {
            ring.write(&crate::wire::nop(), &regs).unwrap();
        }
        regs.write32(crate::regs::offset::STATUS, status_bit::ERROR).unwrap();
        let clock = FakeClock::new();
        let err = ring.wait_space(1, 1000, &regs, &clock).unwrap_err();
        assert_eq!(err, Error::HardwareError);
    }
}
