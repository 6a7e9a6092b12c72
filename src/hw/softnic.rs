//! A software NIC.
//!
//! Doorbell writes only record the new tail. [`SoftNic::process`] plays the
//! part of the DMA engine: it consumes posted TX descriptors, puts the frames
//! on the wire (loopback onto the same queue index, or a connected peer) and
//! fills posted RX descriptors on the receiving side. Tests drive it by hand;
//! the `psio` tool runs it on a worker thread with [`SoftNic::spawn_worker`].

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use etherparse::{EtherType, Ethernet2Header, Ipv4HeaderSlice};
use parking_lot::{Condvar, Mutex};

use super::desc::{
    RXD_STAT_DD, RXD_STAT_EOP, RXD_STAT_IPCS, RXDADV_ERR_IPE, RxDesc, RxWriteback, TxDesc,
};
use super::{DescTable, Direction, DmaMapper, InterruptSink, Nic, QueueId};
use crate::errors::{Error, Result};

/// DMA addresses equal CPU addresses, restricted to mapped ranges.
#[derive(Default)]
pub struct IdentityMapper {
    regions: Mutex<BTreeMap<u64, usize>>,
}

impl IdentityMapper {
    /// Runs `f` over `len` device-visible bytes at `dma`. The mapping lock is
    /// held for the duration so the range cannot be unmapped underneath.
    fn with_range<R>(&self, dma: u64, len: usize, f: impl FnOnce(NonNull<u8>) -> R) -> Result<R> {
        let regions = self.regions.lock();
        let (&start, &size) = regions
            .range(..=dma)
            .next_back()
            .ok_or(Error::DmaFault(dma))?;
        let end = dma.checked_add(len as u64).ok_or(Error::DmaFault(dma))?;
        if end > start + size as u64 {
            return Err(Error::DmaFault(dma));
        }
        let ptr = NonNull::new(dma as usize as *mut u8).ok_or(Error::DmaFault(dma))?;
        Ok(f(ptr))
    }

    fn read(&self, dma: u64, len: usize) -> Result<Vec<u8>> {
        self.with_range(dma, len, |p| {
            // SAFETY: the range lies inside a live mapping and the device owns
            // the slot while its descriptor is posted.
            unsafe { std::slice::from_raw_parts(p.as_ptr(), len) }.to_vec()
        })
    }

    fn write(&self, dma: u64, data: &[u8]) -> Result<()> {
        self.with_range(dma, data.len(), |p| {
            // SAFETY: as in `read`.
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), p.as_ptr(), data.len()) }
        })
    }

    pub fn mapped(&self) -> usize {
        self.regions.lock().len()
    }
}

impl DmaMapper for IdentityMapper {
    fn map(&self, ptr: NonNull<u8>, len: usize) -> Result<u64> {
        let dma = ptr.as_ptr() as usize as u64;
        self.regions.lock().insert(dma, len);
        Ok(dma)
    }

    fn unmap(&self, dma: u64, _len: usize) {
        self.regions.lock().remove(&dma);
    }
}

/// Forced status for an injected frame, applied to its last descriptor.
#[derive(Clone, Copy, Debug, Default)]
pub struct RxOverride {
    pub set: u32,
    pub clear: u32,
    /// Length to report instead of the number of bytes written.
    pub len: Option<u16>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SoftNicStats {
    pub tx_frames: u64,
    pub rx_frames: u64,
    pub rx_missed: u64,
}

struct RxQueue {
    table: Arc<DescTable<RxDesc>>,
    buf_len: usize,
    head: u32,
    tail: u32,
    irq: bool,
}

struct TxQueue {
    table: Arc<DescTable<TxDesc>>,
    head: u32,
    tail: u32,
    irq: bool,
}

struct Queues {
    rx: Vec<Option<RxQueue>>,
    tx: Vec<Option<TxQueue>>,
}

pub struct SoftNic {
    name: String,
    mapper: Arc<IdentityMapper>,
    queues: Mutex<Queues>,
    sink: Mutex<Option<Weak<dyn InterruptSink>>>,
    peer: Mutex<Option<Weak<SoftNic>>>,
    kick: Mutex<bool>,
    kicked: Condvar,
    tx_frames: AtomicU64,
    rx_frames: AtomicU64,
    rx_missed: AtomicU64,
}

impl SoftNic {
    pub fn new(name: &str, rx_queues: usize, tx_queues: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            mapper: Arc::new(IdentityMapper::default()),
            queues: Mutex::new(Queues {
                rx: (0..rx_queues).map(|_| None).collect(),
                tx: (0..tx_queues).map(|_| None).collect(),
            }),
            sink: Mutex::new(None),
            peer: Mutex::new(None),
            kick: Mutex::new(false),
            kicked: Condvar::new(),
            tx_frames: AtomicU64::new(0),
            rx_frames: AtomicU64::new(0),
            rx_missed: AtomicU64::new(0),
        })
    }

    /// Wires the TX side of each NIC to the RX side of the other.
    pub fn connect_peers(a: &Arc<SoftNic>, b: &Arc<SoftNic>) {
        *a.peer.lock() = Some(Arc::downgrade(b));
        *b.peer.lock() = Some(Arc::downgrade(a));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mapper(&self) -> &IdentityMapper {
        &self.mapper
    }

    pub fn stats(&self) -> SoftNicStats {
        SoftNicStats {
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            rx_missed: self.rx_missed.load(Ordering::Relaxed),
        }
    }

    /// Places a frame arriving from the wire on RX queue `queue`.
    pub fn inject(&self, queue: u16, frame: &[u8]) -> bool {
        self.inject_with(queue, frame, RxOverride::default())
    }

    pub fn inject_with(&self, queue: u16, frame: &[u8], ovr: RxOverride) -> bool {
        let raise = {
            let mut queues = self.queues.lock();
            let Some(q) = queues.rx.get_mut(queue as usize).and_then(Option::as_mut) else {
                self.rx_missed.fetch_add(1, Ordering::Relaxed);
                return false;
            };
            if !self.fill_rx(q, frame, ovr) {
                self.rx_missed.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            self.rx_frames.fetch_add(1, Ordering::Relaxed);
            std::mem::take(&mut q.irq)
        };
        if raise {
            self.raise(QueueId::rx(queue));
        }
        true
    }

    fn fill_rx(&self, q: &mut RxQueue, frame: &[u8], ovr: RxOverride) -> bool {
        if frame.is_empty() {
            return false;
        }
        let count = q.table.len() as u32;
        let avail = (q.tail + count - q.head) % count;
        let need = frame.len().div_ceil(q.buf_len).max(1);
        if (avail as usize) < need {
            return false;
        }
        let csum = checksum_status(frame);
        let mut parts = frame.chunks(q.buf_len).peekable();
        while let Some(part) = parts.next() {
            let desc = q.table.get(q.head as usize);
            if let Err(e) = self.mapper.write(desc.pkt_addr(), part) {
                tracing::warn!(nic = %self.name, "rx dma: {e}");
                return false;
            }
            let mut status = RXD_STAT_DD;
            let mut len = part.len() as u16;
            if parts.peek().is_none() {
                status |= RXD_STAT_EOP | csum | ovr.set;
                status &= !ovr.clear;
                len = ovr.len.unwrap_or(len);
            }
            desc.complete(RxWriteback::new(status, len));
            q.head = (q.head + 1) % count;
        }
        true
    }

    /// Runs the DMA engine once over every bound TX queue. Returns the number
    /// of frames put on the wire.
    pub fn process(&self) -> usize {
        let mut wire = Vec::new();
        let mut irqs = Vec::new();
        {
            let mut queues = self.queues.lock();
            for (index, slot) in queues.tx.iter_mut().enumerate() {
                let Some(q) = slot else { continue };
                let count = q.table.len() as u32;
                let mut sent = false;
                while q.head != q.tail {
                    let desc = q.table.get(q.head as usize);
                    let read = desc.read();
                    match self.mapper.read(read.buffer_addr, read.len()) {
                        Ok(frame) => wire.push((index as u16, frame)),
                        Err(e) => tracing::warn!(nic = %self.name, "tx dma: {e}"),
                    }
                    desc.complete();
                    q.head = (q.head + 1) % count;
                    sent = true;
                }
                if sent && std::mem::take(&mut q.irq) {
                    irqs.push(QueueId::tx(index as u16));
                }
            }
        }

        let sent = wire.len();
        self.tx_frames.fetch_add(sent as u64, Ordering::Relaxed);
        let peer = self.peer.lock().as_ref().and_then(Weak::upgrade);
        for (queue, frame) in wire {
            let dst = peer.as_deref().unwrap_or(self);
            let rx_queues = dst.queues.lock().rx.len().max(1);
            dst.inject(queue % rx_queues as u16, &frame);
        }
        for q in irqs {
            self.raise(q);
        }
        sent
    }

    /// Calls [`SoftNic::process`] whenever a doorbell rings, and at least
    /// every millisecond, until `stop` is set.
    pub fn spawn_worker(self: &Arc<Self>, stop: Arc<AtomicBool>) -> JoinHandle<()> {
        let nic = self.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                {
                    let mut kick = nic.kick.lock();
                    if !*kick {
                        nic.kicked.wait_for(&mut kick, Duration::from_millis(1));
                    }
                    *kick = false;
                }
                nic.process();
            }
        })
    }

    fn raise(&self, queue: QueueId) {
        let sink = self.sink.lock().as_ref().and_then(Weak::upgrade);
        if let Some(sink) = sink {
            sink.interrupt(queue);
        }
    }
}

/// IPCS, plus IPE when the IPv4 header checksum does not verify.
fn checksum_status(frame: &[u8]) -> u32 {
    let Ok((eth, rest)) = Ethernet2Header::from_slice(frame) else {
        return 0;
    };
    if eth.ether_type != EtherType::IPV4 {
        return 0;
    }
    let Ok(ip) = Ipv4HeaderSlice::from_slice(rest) else {
        return 0;
    };
    let sum = ip
        .slice()
        .chunks(2)
        .map(|w| u16::from_be_bytes([w[0], *w.get(1).unwrap_or(&0)]) as u32)
        .sum::<u32>();
    let folded = (sum & 0xffff) + (sum >> 16);
    let folded = (folded & 0xffff) + (folded >> 16);
    if folded == 0xffff {
        RXD_STAT_IPCS
    } else {
        RXD_STAT_IPCS | RXDADV_ERR_IPE
    }
}

impl Nic for SoftNic {
    fn dma(&self) -> Arc<dyn DmaMapper> {
        self.mapper.clone()
    }

    fn bind_rx(&self, queue: u16, table: Arc<DescTable<RxDesc>>, buf_len: usize) {
        if let Some(slot) = self.queues.lock().rx.get_mut(queue as usize) {
            *slot = Some(RxQueue {
                table,
                buf_len,
                head: 0,
                tail: 0,
                irq: false,
            });
        }
    }

    fn bind_tx(&self, queue: u16, table: Arc<DescTable<TxDesc>>) {
        if let Some(slot) = self.queues.lock().tx.get_mut(queue as usize) {
            *slot = Some(TxQueue {
                table,
                head: 0,
                tail: 0,
                irq: false,
            });
        }
    }

    fn unbind(&self, queue: QueueId) {
        let mut queues = self.queues.lock();
        match queue.dir {
            Direction::Rx => {
                if let Some(slot) = queues.rx.get_mut(queue.index as usize) {
                    *slot = None;
                }
            }
            Direction::Tx => {
                if let Some(slot) = queues.tx.get_mut(queue.index as usize) {
                    *slot = None;
                }
            }
        }
    }

    fn write_tail(&self, queue: QueueId, value: u32) {
        {
            let mut queues = self.queues.lock();
            let i = queue.index as usize;
            match queue.dir {
                Direction::Rx => {
                    if let Some(Some(q)) = queues.rx.get_mut(i) {
                        q.tail = value;
                    }
                }
                Direction::Tx => {
                    if let Some(Some(q)) = queues.tx.get_mut(i) {
                        q.tail = value;
                    }
                }
            }
        }
        if queue.dir == Direction::Tx {
            *self.kick.lock() = true;
            self.kicked.notify_one();
        }
    }

    fn read_head(&self, queue: QueueId) -> u32 {
        let queues = self.queues.lock();
        let i = queue.index as usize;
        match queue.dir {
            Direction::Rx => queues.rx.get(i).and_then(Option::as_ref).map_or(0, |q| q.head),
            Direction::Tx => queues.tx.get(i).and_then(Option::as_ref).map_or(0, |q| q.head),
        }
    }

    fn irq_enable(&self, queue: QueueId) {
        self.set_irq(queue, true);
    }

    fn irq_disable(&self, queue: QueueId) {
        self.set_irq(queue, false);
    }

    fn connect(&self, sink: Weak<dyn InterruptSink>) {
        *self.sink.lock() = Some(sink);
    }
}

impl SoftNic {
    fn set_irq(&self, queue: QueueId, on: bool) {
        let mut queues = self.queues.lock();
        let i = queue.index as usize;
        match queue.dir {
            Direction::Rx => {
                if let Some(Some(q)) = queues.rx.get_mut(i) {
                    q.irq = on;
                }
            }
            Direction::Tx => {
                if let Some(Some(q)) = queues.tx.get_mut(i) {
                    q.irq = on;
                }
            }
        }
    }

    /// Whether the interrupt of `queue` is currently unmasked.
    pub fn irq_enabled(&self, queue: QueueId) -> bool {
        let queues = self.queues.lock();
        let i = queue.index as usize;
        match queue.dir {
            Direction::Rx => queues.rx.get(i).and_then(Option::as_ref).is_some_and(|q| q.irq),
            Direction::Tx => queues.tx.get(i).and_then(Option::as_ref).is_some_and(|q| q.irq),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapper_rejects_unmapped_ranges() {
        let m = IdentityMapper::default();
        let mut buf = vec![0u8; 128];
        let ptr = NonNull::new(buf.as_mut_ptr()).unwrap();
        let dma = m.map(ptr, buf.len()).unwrap();
        m.write(dma + 8, &[1, 2, 3]).unwrap();
        assert_eq!(m.read(dma + 8, 3).unwrap(), vec![1, 2, 3]);
        assert!(m.read(dma + 120, 16).is_err());
        m.unmap(dma, buf.len());
        assert!(m.read(dma, 1).is_err());
        assert_eq!(buf[9], 2);
    }

    #[test]
    fn ipv4_checksum_status() {
        let builder = etherparse::PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(1000, 2000);
        let mut frame = Vec::new();
        builder.write(&mut frame, &[0u8; 18]).unwrap();
        assert_eq!(checksum_status(&frame), RXD_STAT_IPCS);
        frame[14 + 10] ^= 0xff;
        assert_eq!(checksum_status(&frame), RXD_STAT_IPCS | RXDADV_ERR_IPE);
        assert_eq!(checksum_status(&[0u8; 60]), 0);
    }
}
