//! Descriptor ring core.
//!
//! A ring pairs a descriptor table shared with the NIC with the slot pool that
//! backs it. Every cursor, the slot pool and the ownership state live behind
//! one lock; the RX collector, the TX submitter and attach/detach all run with
//! it held.

use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use crate::config::RingConfig;
use crate::errors::Result;
use crate::gate::{Owner, WaitQueue};
use crate::hw::desc::{Descriptor, RxDesc, TxDesc};
use crate::hw::{DescTable, KernelPath, Nic, QueueId};
use crate::pool::SlotPool;

/// Who services the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServicingMode {
    /// Unowned; interrupts drive the conventional path.
    Polled,
    /// Owned by a context, which drains the ring itself.
    EventDriven,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingStats {
    pub packets: u64,
    pub bytes: u64,
    /// Packets dropped because they spanned several descriptors.
    pub non_eop: u64,
    /// Packets dropped because the reported length exceeded a slot.
    pub oversized: u64,
    /// Packets dropped because hardware flagged a frame error.
    pub frame_errors: u64,
    pub reclaimed: u64,
    pub doorbells: u64,
}

/// Number of slots that can still be handed to hardware. One slot is always
/// held back so that a full ring is distinguishable from an empty one.
#[inline]
pub fn unused(next_to_use: usize, next_to_clean: usize, count: usize) -> usize {
    if next_to_clean <= next_to_use {
        count - next_to_use + next_to_clean - 1
    } else {
        next_to_clean - next_to_use - 1
    }
}

pub struct RingState {
    pub(crate) pool: SlotPool,
    pub(crate) next_to_use: usize,
    pub(crate) next_to_clean: usize,
    pub(crate) owner: Option<Owner>,
    pub(crate) mode: ServicingMode,
    pub(crate) watchers: Vec<Arc<WaitQueue>>,
    /// Set while skipping the remaining descriptors of a multi-descriptor packet.
    pub(crate) discarding: bool,
    /// Submission time of each in-flight TX slot.
    pub(crate) stamps: Box<[Option<Instant>]>,
    pub(crate) stats: RingStats,
}

impl RingState {
    #[inline]
    pub fn free_slots(&self) -> usize {
        unused(self.next_to_use, self.next_to_clean, self.pool.capacity())
    }
}

pub struct Ring<D: Descriptor> {
    device: usize,
    queue: QueueId,
    count: usize,
    pub(crate) table: Arc<DescTable<D>>,
    pub(crate) nic: Arc<dyn Nic>,
    pub(crate) kernel: Arc<dyn KernelPath>,
    pub(crate) config: RingConfig,
    state: Mutex<RingState>,
}

pub type RxRing = Ring<RxDesc>;
pub type TxRing = Ring<TxDesc>;

impl<D: Descriptor> Ring<D> {
    fn build(
        device: usize,
        queue: QueueId,
        count: usize,
        config: &RingConfig,
        nic: Arc<dyn Nic>,
        kernel: Arc<dyn KernelPath>,
    ) -> Result<Self> {
        let mapper = nic.dma();
        let pool = SlotPool::new(count, config.window_bits, config.slot_size, mapper.clone())?;
        let table = Arc::new(DescTable::<D>::new(count, mapper)?);
        tracing::debug!(
            device,
            queue = queue.index,
            dir = D::NAME,
            count,
            windows = pool.window_count(),
            "ring allocated"
        );
        Ok(Self {
            device,
            queue,
            count,
            table,
            nic,
            kernel,
            config: config.clone(),
            state: Mutex::new(RingState {
                pool,
                next_to_use: 0,
                next_to_clean: 0,
                owner: None,
                mode: ServicingMode::Polled,
                watchers: Vec::new(),
                discarding: false,
                stamps: vec![None; count].into_boxed_slice(),
                stats: RingStats::default(),
            }),
        })
    }

    pub fn device(&self) -> usize {
        self.device
    }

    pub fn queue_id(&self) -> QueueId {
        self.queue
    }

    pub fn index(&self) -> usize {
        self.queue.index as usize
    }

    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock()
    }

    pub fn stats(&self) -> RingStats {
        self.lock().stats
    }

    pub fn mode(&self) -> ServicingMode {
        self.lock().mode
    }

    /// `(next_to_use, next_to_clean)`.
    pub fn cursors(&self) -> (usize, usize) {
        let st = self.lock();
        (st.next_to_use, st.next_to_clean)
    }

    pub fn free_slots(&self) -> usize {
        self.lock().free_slots()
    }

    /// Publishes `value` as the new tail once all descriptor writes are visible.
    #[inline]
    pub(crate) fn doorbell(&self, st: &mut RingState, value: usize) {
        fence(Ordering::Release);
        self.nic.write_tail(self.queue, value as u32);
        st.stats.doorbells += 1;
    }
}

impl RxRing {
    /// Allocates the ring, posts every slot and hands it to the NIC with its
    /// interrupt enabled.
    pub fn new(
        device: usize,
        index: u16,
        config: &RingConfig,
        nic: Arc<dyn Nic>,
        kernel: Arc<dyn KernelPath>,
    ) -> Result<Self> {
        let count = config.rx_descriptors as usize;
        let ring = Self::build(device, QueueId::rx(index), count, config, nic, kernel)?;
        {
            let mut st = ring.lock();
            for i in 0..count {
                if let Some(h) = st.pool.handle(i) {
                    ring.table.get(i).post(st.pool.slot_dma_address(h));
                }
            }
            ring.nic
                .bind_rx(index, ring.table.clone(), ring.config.slot_size);
            st.next_to_use = count - 1;
            let tail = st.next_to_use;
            ring.doorbell(&mut st, tail);
        }
        ring.nic.irq_enable(ring.queue);
        Ok(ring)
    }
}

impl TxRing {
    pub fn new(
        device: usize,
        index: u16,
        config: &RingConfig,
        nic: Arc<dyn Nic>,
        kernel: Arc<dyn KernelPath>,
    ) -> Result<Self> {
        let count = config.tx_descriptors as usize;
        let ring = Self::build(device, QueueId::tx(index), count, config, nic, kernel)?;
        ring.nic.bind_tx(index, ring.table.clone());
        ring.nic.irq_enable(ring.queue);
        Ok(ring)
    }
}

impl<D: Descriptor> Drop for Ring<D> {
    fn drop(&mut self) {
        self.nic.irq_disable(self.queue);
        self.nic.unbind(self.queue);
        tracing::debug!(device = self.device, queue = self.queue.index, dir = D::NAME, "ring released");
    }
}
