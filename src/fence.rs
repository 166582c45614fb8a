//! Fence / completion engine: a single DMA-coherent page of monotonic
//! sequence cells the device advances as work completes, and the
//! waiter bookkeeping needed to block a caller until a given cell
//! reaches an expected value.

extern crate alloc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use crate::clock::{Clock, Deadline};
use crate::error::{Error, Result};
use crate::memory::{Allocator, Dma};
use crate::regs::Registers;
use crate::wire;

struct Waiter {
    addr: u64,
    expected: u32,
    satisfied: AtomicBool,
}

/// Allocates and owns the single coherent fence page shared with the
/// device, hands out monotonic sequence numbers, and blocks waiters
/// until the device advances the cell they are watching.
pub struct FenceEngine<A: Allocator> {
    page: Dma<u8>,
    next_seq: AtomicU32,
    waiters: Mutex<Vec<alloc::sync::Arc<Waiter>>>,
    _allocator: core::marker::PhantomData<A>,
}

unsafe impl<A: Allocator> Send for FenceEngine<A> {}
unsafe impl<A: Allocator> Sync for FenceEngine<A> {}

impl<A: Allocator> FenceEngine<A> {
    /// Allocate and zero the fence page, program `FENCE_ADDR`, and
    /// initialize the sequence counter at one (zero is reserved for
    /// "no fence").
    pub fn init(allocator: &A, regs: &Registers) -> Result<Self> {
        let page = Dma::<u8>::allocate(allocator, 4096)?;
        regs.set_fence_addr(page.phys_addr as u32)?;
        Ok(Self {
            page,
            next_seq: AtomicU32::new(1),
            waiters: Mutex::new(Vec::new()),
            _allocator: core::marker::PhantomData,
        })
    }

    pub fn page_phys_addr(&self) -> u64 {
        self.page.phys_addr as u64
    }

    fn page_len(&self) -> u64 {
        self.page.len() as u64
    }

    /// The next monotonically increasing sequence number; never zero.
    pub fn next(&self) -> u32 {
        loop {
            let v = self.next_seq.fetch_add(1, Ordering::Relaxed);
            if v != 0 {
                return v;
            }
            // Wrapped past u32::MAX back to zero; skip it and retry.
        }
    }

    /// Validate `addr` lies within the fence page and build the wire
    /// `FENCE` record. The caller owns inserting it into a ring.
    pub fn emit(&self, addr: u64, value: u32) -> Result<[u32; 3]> {
        if addr % 4 != 0 {
            return Err(Error::InvalidArgument);
        }
        let base = self.page_phys_addr();
        if addr < base || addr >= base + self.page_len() {
            return Err(Error::InvalidArgument);
        }
        Ok(wire::fence(addr as u32, value))
    }

    fn cell_ptr(&self, addr: u64) -> Option<*const u32> {
        let base = self.page_phys_addr();
        if addr < base || addr + 4 > base + self.page_len() || addr % 4 != 0 {
            return None;
        }
        let offset = (addr - base) as usize;
        Some(unsafe { self.page.addr.add(offset) as *const u32 })
    }

    /// Read the 32-bit word at `addr` with volatile semantics and
    /// return whether `current >= expected`. Addresses outside the
    /// fence page are treated as signaled — the defensive default of
    /// never blocking on an unknown address.
    pub fn signaled(&self, addr: u64, expected: u32, regs: &Registers) -> bool {
        match self.cell_ptr(addr) {
            Some(ptr) => {
                regs.read_barrier();
                let current = unsafe { ptr.read_volatile() };
                current >= expected
            }
            None => true,
        }
    }

    /// Fast path returns immediately if already signaled; otherwise
    /// enrolls in the wait list and polls until the IRQ-driven
    /// `process()` marks the entry satisfied, `timeout_ms` elapses
    /// (0 means indefinite — the only operation in this crate where
    /// that's true), or `cancel` is observed set.
    pub fn wait(
        &self,
        addr: u64,
        expected: u32,
        timeout_ms: u64,
        regs: &Registers,
        clock: &dyn Clock,
        cancel: Option<&AtomicBool>,
    ) -> Result<()> {
        if self.signaled(addr, expected, regs) {
            return Ok(());
        }

        let waiter = alloc::sync::Arc::new(Waiter {
            addr,
            expected,
            satisfied: AtomicBool::new(false),
        });
        self.waiters.lock().push(waiter.clone());

        let deadline = if timeout_ms == 0 {
            Deadline::indefinite()
        } else {
            Deadline::from_timeout(clock, timeout_ms)
        };

        let result = loop {
            if waiter.satisfied.load(Ordering::Acquire) || self.signaled(addr, expected, regs) {
                break Ok(());
            }
            if let Some(c) = cancel {
                if c.load(Ordering::Acquire) {
                    break Err(Error::Cancelled);
                }
            }
            if deadline.expired(clock) {
                break Err(Error::Timeout);
            }
            clock.spin_hint();
        };

        self.waiters.lock().retain(|w| !alloc::sync::Arc::ptr_eq(w, &waiter));
        result
    }

    /// Called from the fence-IRQ deferred handler: scans the wait
    /// list and marks satisfied every entry whose expected value has
    /// now been reached.
    pub fn process(&self, regs: &Registers) {
        let waiters = self.waiters.lock();
        for w in waiters.iter() {
            if self.signaled(w.addr, w.expected, regs) {
                w.satisfied.store(true, Ordering::Release);
            }
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}
