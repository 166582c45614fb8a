use core::ops::{Deref, DerefMut};
use core::slice::{from_raw_parts, from_raw_parts_mut};

use crate::error::{Error, Result};

/// Allocates physically contiguous, DMA-coherent memory mapped into
/// virtual address space.
///
/// Every ring, the fence page, and register-snapshot scratch buffers
/// all go through this single seam.
pub trait Allocator {
    /// Allocates a `size`-byte region, rounded up by the caller to a
    /// page multiple. Returns `(phys_addr, virt_addr)` of the
    /// region's start, or `None` on exhaustion.
    ///
    /// # Safety
    ///
    /// Returns uninitialized memory; the implementation must guarantee
    /// physical contiguity and a valid, cache-coherent virtual mapping.
    unsafe fn allocate(&self, size: usize) -> Option<(usize, usize)>;
}

/// A DMA-coherent allocation of `count` values of `T`.
pub struct Dma<T> {
    count: usize,
    pub addr: *mut T,
    pub phys_addr: usize,
}

impl<T> Dma<T> {
    /// Allocate and zero `count` elements of `T`.
    pub fn allocate<A: Allocator>(allocator: &A, count: usize) -> Result<Dma<T>> {
        let bytes = core::mem::size_of::<T>() * count;
        let rounded = bytes.div_ceil(4096) * 4096;
        let (phys, virt) = unsafe { allocator.allocate(rounded) }.ok_or(Error::OutOfMemory)?;
        unsafe {
            core::ptr::write_bytes(virt as *mut u8, 0, rounded);
        }
        Ok(Self {
            count,
            phys_addr: phys,
            addr: virt as *mut T,
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl<T> Deref for Dma<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.addr }
    }
}

impl<T> DerefMut for Dma<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.addr }
    }
}

impl AsRef<[u8]> for Dma<u8> {
    fn as_ref(&self) -> &[u8] {
        unsafe { from_raw_parts(self.addr, self.count) }
    }
}

impl AsMut<[u8]> for Dma<u8> {
    fn as_mut(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.addr, self.count) }
    }
}

unsafe impl<T> Send for Dma<T> {}
unsafe impl<T> Sync for Dma<T> {}
