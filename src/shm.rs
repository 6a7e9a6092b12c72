//! Shared payload regions.
//!
//! Every packet offset exchanged with a context is relative to one of these
//! regions. A region is an anonymous shared mapping, locked in memory when the
//! memlock limit allows, and lives until its reference count drops to zero.

use std::num::NonZeroUsize;
use std::ptr::NonNull;

use arrayvec::ArrayVec;
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};

use crate::config::MAX_BUFS;
use crate::errors::{Error, Result};
use crate::gate::ContextId;
use crate::hint::{align_up, unlikely};
use crate::pool::page_size;

pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
    locked: bool,
}

// SAFETY: the mapping is owned by the region; access goes through `&self` /
// `&mut self`.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Maps `len` bytes rounded up to the page size.
    pub fn new(len: usize) -> Result<Self> {
        let len = align_up(len, page_size());
        let size = NonZeroUsize::new(len).ok_or(Error::InvalidConfig("empty shared region"))?;
        let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
        let flags = MapFlags::MAP_SHARED | MapFlags::MAP_POPULATE;

        // SAFETY: a fresh anonymous mapping aliases nothing.
        let (ptr, locked) = match unsafe { mmap_anonymous(None, size, prot, flags | MapFlags::MAP_LOCKED) } {
            Ok(ptr) => (ptr, true),
            Err(e) => {
                tracing::warn!(len, "cannot lock shared region ({e}), mapping unlocked");
                (unsafe { mmap_anonymous(None, size, prot, flags) }?, false)
            }
        };
        Ok(Self {
            ptr: ptr.cast(),
            len,
            locked,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is readable, initialized (zero-filled) and
        // `len` bytes long.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` makes the view unique.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe exactly the mapping created in `new`.
        if let Err(e) = unsafe { munmap(self.ptr.cast(), self.len) } {
            tracing::warn!(len = self.len, "munmap failed: {e}");
        }
    }
}

/// Names a region registered with one context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    owner: ContextId,
    id: u32,
}

struct Entry {
    id: u32,
    refs: usize,
    region: SharedRegion,
}

/// Regions registered with a context, at most [`MAX_BUFS`].
pub struct BufferTable {
    owner: ContextId,
    next_id: u32,
    entries: ArrayVec<Entry, MAX_BUFS>,
}

impl BufferTable {
    pub fn new(owner: ContextId) -> Self {
        Self {
            owner,
            next_id: 0,
            entries: ArrayVec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn register(&mut self, len: usize) -> Result<BufferHandle> {
        if self.entries.is_full() {
            return Err(Error::BufferTableFull);
        }
        let region = SharedRegion::new(len)?;
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        tracing::debug!(id, len = region.len(), locked = region.is_locked(), "shared region registered");
        self.entries.push(Entry {
            id,
            refs: 1,
            region,
        });
        Ok(BufferHandle {
            owner: self.owner,
            id,
        })
    }

    fn position(&self, h: BufferHandle) -> Result<usize> {
        if unlikely(h.owner != self.owner) {
            return Err(Error::UnknownBuffer);
        }
        self.entries
            .iter()
            .position(|e| e.id == h.id)
            .ok_or(Error::UnknownBuffer)
    }

    /// Adds a reference. Returns the new count.
    pub fn retain(&mut self, h: BufferHandle) -> Result<usize> {
        let i = self.position(h)?;
        self.entries[i].refs += 1;
        Ok(self.entries[i].refs)
    }

    /// Drops a reference and unmaps the region once none remain. Returns the
    /// remaining count.
    pub fn release(&mut self, h: BufferHandle) -> Result<usize> {
        let i = self.position(h)?;
        let entry = &mut self.entries[i];
        entry.refs -= 1;
        let refs = entry.refs;
        if refs == 0 {
            self.entries.remove(i);
            tracing::debug!(id = h.id, "shared region released");
        }
        Ok(refs)
    }

    pub fn get(&self, h: BufferHandle) -> Result<&SharedRegion> {
        let i = self.position(h)?;
        Ok(&self.entries[i].region)
    }

    pub fn get_mut(&mut self, h: BufferHandle) -> Result<&mut SharedRegion> {
        let i = self.position(h)?;
        Ok(&mut self.entries[i].region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_is_page_rounded() {
        let mut r = SharedRegion::new(100).unwrap();
        assert_eq!(r.len(), page_size());
        r.as_mut_slice()[99] = 7;
        assert_eq!(r.as_slice()[99], 7);
    }

    #[test]
    fn freed_only_at_zero() {
        let mut t = BufferTable::new(ContextId(1));
        let h = t.register(4096).unwrap();
        assert_eq!(t.retain(h).unwrap(), 2);
        assert_eq!(t.release(h).unwrap(), 1);
        assert!(t.get(h).is_ok());
        assert_eq!(t.release(h).unwrap(), 0);
        assert!(matches!(t.get(h), Err(Error::UnknownBuffer)));
        assert!(t.is_empty());
    }

    #[test]
    fn table_is_bounded() {
        let mut t = BufferTable::new(ContextId(1));
        for _ in 0..MAX_BUFS {
            t.register(1).unwrap();
        }
        assert!(matches!(t.register(1), Err(Error::BufferTableFull)));
        assert_eq!(t.len(), MAX_BUFS);
    }

    #[test]
    fn foreign_handles_are_rejected() {
        let mut a = BufferTable::new(ContextId(1));
        let b = BufferTable::new(ContextId(2));
        let h = a.register(1).unwrap();
        assert!(matches!(b.get(h), Err(Error::UnknownBuffer)));
    }
}
