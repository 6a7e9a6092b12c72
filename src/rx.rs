//! Batched RX collection.

use crate::chunk::PacketInfo;
use crate::config::{MAX_PACKET_SIZE, PACKET_ALIGN};
use crate::hint::{align_up, copy_prefetch, likely, prefetch, unlikely};
use crate::ring::{RingState, RxRing};

impl RxRing {
    /// Copies up to `out.len()` completed packets into `dst`, packed at
    /// 64-byte aligned offsets from its start, and describes them in `out`.
    /// Returns how many entries of `out` were filled.
    pub fn collect(&self, dst: &mut [u8], out: &mut [PacketInfo]) -> usize {
        let mut st = self.lock();
        self.collect_locked(&mut st, dst, out)
    }

    pub(crate) fn collect_locked(
        &self,
        st: &mut RingState,
        dst: &mut [u8],
        out: &mut [PacketInfo],
    ) -> usize {
        let count = self.count();
        let slot_size = st.pool.slot_size();
        let mut idx = st.next_to_clean;
        let mut offset = 0usize;
        let mut cnt = 0usize;
        let mut scanned = 0usize;

        while cnt < out.len() {
            let desc = self.table.get(idx);
            let wb = desc.writeback();
            if !wb.done() {
                break;
            }
            let Some(h) = st.pool.handle(idx) else { break };
            let len = wb.len();

            if unlikely(st.discarding || !wb.eop()) {
                if !st.discarding {
                    st.stats.non_eop += 1;
                    tracing::debug!(device = self.device(), queue = self.index(), idx, "multi-descriptor packet dropped");
                }
                st.discarding = !wb.eop();
            } else if unlikely(wb.frame_error()) {
                st.stats.frame_errors += 1;
                tracing::debug!(device = self.device(), queue = self.index(), status = wb.status_error(), "frame error");
            } else if unlikely(len > slot_size || len > MAX_PACKET_SIZE) {
                st.stats.oversized += 1;
                tracing::debug!(device = self.device(), queue = self.index(), len, "oversized packet dropped");
            } else {
                if unlikely(offset + len > dst.len()) {
                    // Leave the packet on the ring for the next call.
                    break;
                }
                let next = (idx + 1) % count;
                prefetch(self.table.get(next));
                copy_prefetch(&mut dst[offset..offset + len], &st.pool.slot(h)[..len]);
                out[cnt] = PacketInfo {
                    offset: offset as u32,
                    len: len as u16,
                    checksum: wb.checksum(),
                };
                cnt += 1;
                offset = align_up(offset + len, PACKET_ALIGN);
                st.stats.packets += 1;
                st.stats.bytes += len as u64;
            }

            desc.post(st.pool.slot_dma_address(h));
            idx = (idx + 1) % count;
            scanned += 1;
        }

        if likely(scanned > 0) {
            st.next_to_clean = idx;
            st.next_to_use = if idx == 0 { count - 1 } else { idx - 1 };
            let tail = st.next_to_use;
            self.doorbell(st, tail);
        }
        cnt
    }

    /// Whether the descriptor at `next_to_clean` has completed.
    pub fn peek_done(&self) -> bool {
        let st = self.lock();
        self.peek_done_locked(&st)
    }

    pub(crate) fn peek_done_locked(&self, st: &RingState) -> bool {
        self.table.get(st.next_to_clean).writeback().done()
    }

    /// Hands up to `budget` frames to the conventional path one at a time.
    pub(crate) fn service_kernel(&self, st: &mut RingState, budget: usize) -> usize {
        let mut frame = [0u8; MAX_PACKET_SIZE];
        let mut info = [PacketInfo::default()];
        let mut delivered = 0;
        while delivered < budget {
            if self.collect_locked(st, &mut frame, &mut info) == 0 {
                break;
            }
            let len = info[0].len as usize;
            self.kernel.deliver(self.device(), &frame[..len], info[0].checksum);
            delivered += 1;
        }
        delivered
    }
}
