//! Subwindowed packet buffer storage for one ring.
//!
//! Slot bodies live in fixed-size windows rather than one large DMA region.
//! A ring slot index maps to `(index >> window_bits, index & window_mask)`,
//! and from there to `window_base + slot * slot_size`.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use libc::{_SC_PAGESIZE, sysconf};

use crate::errors::{Error, Result};
use crate::hint::align_up;
use crate::hw::DmaMapper;

/// Bounds-checked address of one slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    window: u16,
    slot: u16,
}

impl SlotHandle {
    pub fn window(&self) -> usize {
        self.window as usize
    }

    pub fn slot(&self) -> usize {
        self.slot as usize
    }
}

struct Window {
    ptr: NonNull<u8>,
    dma: u64,
}

pub struct SlotPool {
    windows: Box<[Window]>,
    layout: Layout,
    window_bits: u32,
    slot_size: usize,
    capacity: usize,
    mapper: Arc<dyn DmaMapper>,
}

// SAFETY: the windows are plain heap memory owned by the pool. Shared access
// goes through `&self` only for addresses; slot contents are reached through
// `&mut self`, which the owning ring serializes with its lock.
unsafe impl Send for SlotPool {}
unsafe impl Sync for SlotPool {}

pub fn page_size() -> usize {
    let size = unsafe { sysconf(_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

impl SlotPool {
    /// Allocates and maps every window for `capacity` slots.
    pub fn new(
        capacity: usize,
        window_bits: u32,
        slot_size: usize,
        mapper: Arc<dyn DmaMapper>,
    ) -> Result<Self> {
        if capacity == 0 || slot_size == 0 {
            return Err(Error::InvalidConfig("empty slot pool"));
        }
        let per_window = 1usize << window_bits;
        let window_count = (capacity - 1) / per_window + 1;
        let page = page_size();
        let window_size = align_up(per_window * slot_size, page);
        let layout = Layout::from_size_align(window_size, page)
            .map_err(|_| Error::InvalidConfig("window layout"))?;

        let mut windows = Vec::with_capacity(window_count);
        for _ in 0..window_count {
            // SAFETY: layout has non-zero size.
            let raw = unsafe { alloc::alloc_zeroed(layout) };
            let Some(ptr) = NonNull::new(raw) else {
                tracing::warn!(window_size, "slot window allocation failed");
                release(&windows, layout, mapper.as_ref());
                return Err(Error::NoMemory);
            };
            let dma = match mapper.map(ptr, window_size) {
                Ok(dma) => dma,
                Err(e) => {
                    // SAFETY: allocated above with the same layout.
                    unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
                    release(&windows, layout, mapper.as_ref());
                    return Err(e);
                }
            };
            windows.push(Window { ptr, dma });
        }

        Ok(Self {
            windows: windows.into_boxed_slice(),
            layout,
            window_bits,
            slot_size,
            capacity,
            mapper,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    pub fn window_size(&self) -> usize {
        self.layout.size()
    }

    /// Handle for ring slot `index`, or `None` past the end of the ring.
    #[inline]
    pub fn handle(&self, index: usize) -> Option<SlotHandle> {
        if index >= self.capacity {
            return None;
        }
        let mask = (1usize << self.window_bits) - 1;
        Some(SlotHandle {
            window: (index >> self.window_bits) as u16,
            slot: (index & mask) as u16,
        })
    }

    #[inline]
    pub fn slot_address(&self, h: SlotHandle) -> NonNull<u8> {
        let base = self.windows[h.window()].ptr;
        // SAFETY: handles only come from `handle`, so the offset stays within
        // the window.
        unsafe { base.add(h.slot() * self.slot_size) }
    }

    #[inline]
    pub fn slot_dma_address(&self, h: SlotHandle) -> u64 {
        self.windows[h.window()].dma + (h.slot() * self.slot_size) as u64
    }

    #[inline]
    pub fn slot(&self, h: SlotHandle) -> &[u8] {
        // SAFETY: in bounds as above; the bytes are initialized (zeroed at
        // allocation).
        unsafe { std::slice::from_raw_parts(self.slot_address(h).as_ptr(), self.slot_size) }
    }

    #[inline]
    pub fn slot_mut(&mut self, h: SlotHandle) -> &mut [u8] {
        // SAFETY: as in `slot`; `&mut self` excludes every other CPU-side view.
        unsafe { std::slice::from_raw_parts_mut(self.slot_address(h).as_ptr(), self.slot_size) }
    }
}

fn release(windows: &[Window], layout: Layout, mapper: &dyn DmaMapper) {
    for w in windows {
        mapper.unmap(w.dma, layout.size());
        // SAFETY: every window was allocated with `layout`.
        unsafe { alloc::dealloc(w.ptr.as_ptr(), layout) };
    }
}

impl Drop for SlotPool {
    fn drop(&mut self) {
        release(&self.windows, self.layout, self.mapper.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::softnic::IdentityMapper;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn pool(capacity: usize, bits: u32) -> SlotPool {
        SlotPool::new(capacity, bits, 2048, Arc::new(IdentityMapper::default())).unwrap()
    }

    #[test]
    fn window_count_rounds_up() {
        assert_eq!(pool(64, 4).window_count(), 4);
        assert_eq!(pool(65, 4).window_count(), 5);
        assert_eq!(pool(4096, 10).window_count(), 4);
        assert_eq!(pool(1, 10).window_count(), 1);
    }

    #[test]
    fn handle_is_bounds_checked() {
        let p = pool(64, 4);
        assert!(p.handle(63).is_some());
        assert!(p.handle(64).is_none());
        let h = p.handle(37).unwrap();
        assert_eq!((h.window(), h.slot()), (2, 5));
    }

    #[test]
    fn windows_are_mapped_and_released() {
        let mapper = Arc::new(IdentityMapper::default());
        let p = SlotPool::new(64, 4, 2048, mapper.clone()).unwrap();
        assert_eq!(mapper.mapped(), 4);
        drop(p);
        assert_eq!(mapper.mapped(), 0);
    }

    proptest! {
        #[test]
        fn addresses_never_alias(capacity in 1usize..300, bits in 1u32..6) {
            let p = pool(capacity, bits);
            let mut seen = HashSet::new();
            for i in 0..capacity {
                let h = p.handle(i).unwrap();
                let addr = p.slot_address(h).as_ptr() as usize;
                let expect = p.windows[i >> bits].ptr.as_ptr() as usize
                    + (i & ((1 << bits) - 1)) * 2048;
                prop_assert_eq!(addr, expect);
                prop_assert_eq!(p.slot_dma_address(h), addr as u64);
                prop_assert!(seen.insert(addr));
            }
        }
    }
}
