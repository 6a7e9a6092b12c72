//! Batched TX submission and completion reclaim.

use std::time::{Duration, Instant};

use crate::hint::{copy_prefetch, unlikely};
use crate::ring::{RingState, TxRing};

impl TxRing {
    /// Queues as many of `frames` as there is room for and returns how many
    /// were accepted. The caller retries the rest.
    ///
    /// Frames must be non-empty. One longer than a slot is dropped, counted in
    /// [`RingStats::oversized`](crate::ring::RingStats) and still reported as
    /// accepted, so the caller does not retry it.
    pub fn submit<'a, I>(&self, frames: I) -> usize
    where
        I: IntoIterator<Item = &'a [u8]>,
        I::IntoIter: ExactSizeIterator,
    {
        let mut st = self.lock();
        self.submit_locked(&mut st, frames)
    }

    pub(crate) fn submit_locked<'a, I>(&self, st: &mut RingState, frames: I) -> usize
    where
        I: IntoIterator<Item = &'a [u8]>,
        I::IntoIter: ExactSizeIterator,
    {
        let frames = frames.into_iter();
        let wanted = frames.len();
        let mut free = st.free_slots();
        if free < wanted {
            self.reclaim_locked(st);
            free = st.free_slots();
        }
        let cnt = wanted.min(free);
        if cnt == 0 {
            return 0;
        }

        let count = self.count();
        let slot_size = st.pool.slot_size();
        let interval = self.config.doorbell_interval;
        let now = Instant::now();
        let mut idx = st.next_to_use;
        let mut accepted = 0;
        let mut written = 0;

        for frame in frames.take(cnt) {
            debug_assert!(!frame.is_empty());
            let len = frame.len();
            if unlikely(len > slot_size) {
                st.stats.oversized += 1;
                tracing::debug!(device = self.device(), queue = self.index(), len, "oversized frame dropped");
                accepted += 1;
                continue;
            }
            let Some(h) = st.pool.handle(idx) else { break };
            copy_prefetch(&mut st.pool.slot_mut(h)[..len], frame);
            self.table
                .get(idx)
                .write(st.pool.slot_dma_address(h), len as u16);
            st.stamps[idx] = Some(now);
            st.stats.packets += 1;
            st.stats.bytes += len as u64;

            idx = (idx + 1) % count;
            accepted += 1;
            written += 1;
            if unlikely(written % interval == 0) {
                self.doorbell(st, idx);
            }
        }

        if written > 0 {
            st.next_to_use = idx;
            self.doorbell(st, idx);
        }
        accepted
    }

    /// Frees every slot the NIC has finished with.
    pub fn reclaim(&self) -> usize {
        let mut st = self.lock();
        self.reclaim_locked(&mut st)
    }

    pub(crate) fn reclaim_locked(&self, st: &mut RingState) -> usize {
        let count = self.count();
        let head = self.nic.read_head(self.queue_id()) as usize;
        if unlikely(head >= count) {
            tracing::warn!(device = self.device(), queue = self.index(), head, "tx head out of range");
            return 0;
        }
        let ntc = st.next_to_clean;
        let cleaned = if head >= ntc { head - ntc } else { count - ntc + head };
        let mut i = ntc;
        while i != head {
            st.stamps[i] = None;
            i = (i + 1) % count;
        }
        st.next_to_clean = head;
        st.stats.reclaimed += cleaned as u64;
        cleaned
    }

    /// How long the oldest unreclaimed slot has been waiting for the NIC.
    pub fn stalled_for(&self) -> Option<Duration> {
        let st = self.lock();
        if st.next_to_clean == st.next_to_use {
            return None;
        }
        st.stamps[st.next_to_clean].map(|t| t.elapsed())
    }
}
