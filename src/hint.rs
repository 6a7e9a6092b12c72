//! Compiler hint utilities and the packet copy loop.

use crate::config::PACKET_ALIGN;

/// Marks a code path as cold (unlikely to be taken).
#[inline]
#[cold]
fn cold() {}

/// Hints to the compiler that the condition is likely true.
#[inline]
pub fn likely(b: bool) -> bool {
    if !b {
        cold()
    }
    b
}

/// Hints to the compiler that the condition is unlikely true.
#[inline]
pub fn unlikely(b: bool) -> bool {
    if b {
        cold()
    }
    b
}

/// Pulls the cache line at `p` towards L1. `p` does not need to be valid.
#[inline(always)]
#[allow(unused_unsafe)]
pub fn prefetch<T>(p: *const T) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use core::arch::x86_64::{_MM_HINT_T0, _mm_prefetch};
        _mm_prefetch::<_MM_HINT_T0>(p as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = p;
}

#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Copies `src` into `dst` one cache line at a time, prefetching two lines
/// ahead on both sides.
#[inline]
pub fn copy_prefetch(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    let len = dst.len().min(src.len());
    let (dst, src) = (&mut dst[..len], &src[..len]);

    let mut d = dst.chunks_exact_mut(PACKET_ALIGN);
    let mut s = src.chunks_exact(PACKET_ALIGN);
    for (dl, sl) in (&mut d).zip(&mut s) {
        prefetch(sl.as_ptr().wrapping_add(2 * PACKET_ALIGN));
        prefetch(dl.as_ptr().wrapping_add(2 * PACKET_ALIGN));
        dl.copy_from_slice(sl);
    }
    d.into_remainder().copy_from_slice(s.remainder());
}
