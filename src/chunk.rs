//! Batch request/response types.

use crate::config::{ENTRY_CNT, PACKET_ALIGN};
use crate::errors::{Error, Result};
use crate::hw::desc::ChecksumVerdict;
use crate::shm::BufferHandle;

/// Location of one packet inside a shared region.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketInfo {
    pub offset: u32,
    pub len: u16,
    pub checksum: ChecksumVerdict,
}

/// A (device, queue) pair.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct QueueRef {
    pub device: u16,
    pub queue: u16,
}

impl QueueRef {
    pub const fn new(device: u16, queue: u16) -> Self {
        Self { device, queue }
    }
}

/// One batch exchanged with a context.
///
/// On receive `count` is the most packets wanted and `queue` is overwritten
/// with the ring they came from. On send the first `count` entries of `info`
/// go out on `queue`.
#[derive(Clone, Debug)]
pub struct Chunk {
    pub count: usize,
    pub blocking: bool,
    pub queue: QueueRef,
    pub info: Vec<PacketInfo>,
    pub buffer: BufferHandle,
}

impl Chunk {
    pub fn new(buffer: BufferHandle, count: usize) -> Self {
        Self {
            count,
            blocking: false,
            queue: QueueRef::default(),
            info: vec![PacketInfo::default(); count],
            buffer,
        }
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn on(mut self, queue: QueueRef) -> Self {
        self.queue = queue;
        self
    }
}

/// Staging ring of outgoing packets over one shared region.
///
/// Each entry owns a fixed stride of the region, so entry `i` always lives at
/// `i * stride` and a pending entry is never overwritten by a later one.
pub struct ChunkBuf {
    pub queue: QueueRef,
    pub buffer: BufferHandle,
    info: Box<[PacketInfo]>,
    stride: usize,
    cnt: usize,
    next_to_use: usize,
    next_to_send: usize,
}

impl ChunkBuf {
    pub fn new(queue: QueueRef, buffer: BufferHandle, region_len: usize) -> Result<Self> {
        Self::with_entries(queue, buffer, region_len, ENTRY_CNT)
    }

    pub fn with_entries(
        queue: QueueRef,
        buffer: BufferHandle,
        region_len: usize,
        entries: usize,
    ) -> Result<Self> {
        if entries == 0 {
            return Err(Error::InvalidChunkSize(0));
        }
        let stride = (region_len / entries) & !(PACKET_ALIGN - 1);
        if stride < PACKET_ALIGN {
            return Err(Error::BufferTooSmall {
                len: region_len,
                need: entries * PACKET_ALIGN,
            });
        }
        Ok(Self {
            queue,
            buffer,
            info: vec![PacketInfo::default(); entries].into_boxed_slice(),
            stride,
            cnt: 0,
            next_to_use: 0,
            next_to_send: 0,
        })
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Packets assigned but not yet accepted by the ring.
    pub fn pending(&self) -> usize {
        self.cnt
    }

    /// Reserves the next entry for a `len`-byte packet and returns its offset
    /// in the region, or `None` if every entry is pending or `len` does not
    /// fit the stride.
    pub fn assign(&mut self, len: usize) -> Option<usize> {
        if self.cnt == self.info.len() || len == 0 || len > self.stride || len > u16::MAX as usize {
            return None;
        }
        let offset = self.next_to_use * self.stride;
        self.info[self.next_to_use] = PacketInfo {
            offset: offset as u32,
            len: len as u16,
            checksum: ChecksumVerdict::Unknown,
        };
        self.next_to_use = (self.next_to_use + 1) % self.info.len();
        self.cnt += 1;
        Some(offset)
    }

    /// Longest run of pending entries that does not wrap, capped at `max`.
    pub(crate) fn sendable(&self, max: usize) -> &[PacketInfo] {
        let run = self.cnt.min(self.info.len() - self.next_to_send).min(max);
        &self.info[self.next_to_send..self.next_to_send + run]
    }

    pub(crate) fn complete(&mut self, sent: usize) {
        debug_assert!(sent <= self.cnt);
        self.next_to_send = (self.next_to_send + sent) % self.info.len();
        self.cnt -= sent;
    }
}
