//! Per-handle state and the chunk API.
//!
//! A [`Context`] is what one packet-processing thread holds: the RX rings it
//! owns, the shared regions it registered and a round-robin cursor over the
//! rings. Dropping it detaches every ring and unmaps every region.

use std::sync::Arc as StdArc;
use std::sync::atomic::{AtomicU64, Ordering};

use arrayvec::ArrayVec;
use triomphe::Arc;

use crate::chunk::{Chunk, ChunkBuf, PacketInfo, QueueRef};
use crate::config::{MAX_CHUNK_SIZE, MAX_DEVICES, MAX_RINGS};
use crate::device::{DeviceInfo, Registry};
use crate::errors::{Error, Result};
use crate::gate::{ContextId, Owner, WaitQueue, Wake};
use crate::hint::unlikely;
use crate::ring::RxRing;
use crate::shm::{BufferHandle, BufferTable};

static CONTEXT_IDS: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceCounters {
    pub rx_chunks: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_chunks: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

/// Traffic seen through one context, per device.
#[derive(Clone, Debug, Default)]
pub struct HandleStats {
    pub devices: [DeviceCounters; MAX_DEVICES],
}

/// Aborts a blocking `recv_chunk` or `select` from another thread.
#[derive(Clone)]
pub struct Canceller(StdArc<WaitQueue>);

impl Canceller {
    pub fn cancel(&self) {
        self.0.cancel();
    }
}

pub(crate) struct Attached {
    pub(crate) queue: QueueRef,
    pub(crate) ring: Arc<RxRing>,
}

pub struct Context {
    id: ContextId,
    pub(crate) registry: Arc<Registry>,
    pub(crate) waiter: StdArc<WaitQueue>,
    pub(crate) rings: ArrayVec<Attached, MAX_RINGS>,
    next_ring: usize,
    buffers: BufferTable,
    stats: HandleStats,
}

impl Context {
    pub fn new(registry: Arc<Registry>) -> Self {
        let id = ContextId(CONTEXT_IDS.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(id = id.0, "context opened");
        Self {
            id,
            registry,
            waiter: StdArc::new(WaitQueue::default()),
            rings: ArrayVec::new(),
            next_ring: 0,
            buffers: BufferTable::new(id),
            stats: HandleStats::default(),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn canceller(&self) -> Canceller {
        Canceller(self.waiter.clone())
    }

    pub fn stats(&self) -> &HandleStats {
        &self.stats
    }

    /// Rings owned by this context, in round-robin order.
    pub fn attached(&self) -> impl Iterator<Item = QueueRef> + '_ {
        self.rings.iter().map(|a| a.queue)
    }

    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        self.registry.list()
    }

    pub fn attach_rx(&mut self, q: QueueRef) -> Result<()> {
        if self.rings.is_full() {
            return Err(Error::RingTableFull);
        }
        let ring = self
            .registry
            .device(q.device as usize)?
            .rx_ring(q.queue as usize)?
            .clone();
        ring.attach(Owner::new(self.id, self.waiter.clone()))?;
        self.rings.push(Attached { queue: q, ring });
        tracing::info!(id = self.id.0, device = q.device, queue = q.queue, "rx attached");
        Ok(())
    }

    pub fn detach_rx(&mut self, q: QueueRef) -> Result<()> {
        self.registry
            .device(q.device as usize)?
            .rx_ring(q.queue as usize)?
            .detach(self.id)?;
        if let Some(i) = self.rings.iter().position(|a| a.queue == q) {
            self.rings.remove(i);
            if self.next_ring > i {
                self.next_ring -= 1;
            }
            if self.next_ring >= self.rings.len() {
                self.next_ring = 0;
            }
        }
        tracing::info!(id = self.id.0, device = q.device, queue = q.queue, "rx detached");
        Ok(())
    }

    /// Receives up to `chunk.count` packets from the owned rings, starting at
    /// the round-robin cursor. Returns 0 when nothing is ready and the chunk
    /// is non-blocking.
    pub fn recv_chunk(&mut self, chunk: &mut Chunk) -> Result<usize> {
        self.recv(chunk, None)
    }

    /// Like [`Context::recv_chunk`], restricted to the owned rings of one
    /// device.
    pub fn recv_chunk_from(&mut self, device: usize, chunk: &mut Chunk) -> Result<usize> {
        self.registry.device(device)?;
        if !self.rings.iter().any(|a| a.queue.device as usize == device) {
            return Err(Error::NotAttached);
        }
        self.recv(chunk, Some(device))
    }

    fn recv(&mut self, chunk: &mut Chunk, only: Option<usize>) -> Result<usize> {
        let count = chunk.count;
        if count == 0 || count > MAX_CHUNK_SIZE {
            return Err(Error::InvalidChunkSize(count));
        }
        if self.rings.is_empty() {
            return Err(Error::NotAttached);
        }
        let need = count * self.registry.config().ring.slot_size;
        let Self {
            rings,
            next_ring,
            buffers,
            waiter,
            stats,
            ..
        } = self;
        let dst = buffers.get_mut(chunk.buffer)?.as_mut_slice();
        if dst.len() < need {
            return Err(Error::BufferTooSmall {
                len: dst.len(),
                need,
            });
        }
        if chunk.info.len() < count {
            chunk.info.resize(count, PacketInfo::default());
        }
        let out = &mut chunk.info[..count];
        let rings: &[Attached] = rings;

        loop {
            let ticket = waiter.ticket();
            let mut found = poll(rings, next_ring, only, dst, out);
            if found.is_none() {
                if !chunk.blocking {
                    return Ok(0);
                }
                for a in targets(rings, only) {
                    a.ring.arm(waiter);
                }
                // Anything that completed before the interrupts were armed.
                found = poll(rings, next_ring, only, dst, out);
                let wake = match found {
                    Some(_) => Wake::Woken,
                    None => waiter.wait(ticket, None),
                };
                for a in targets(rings, only) {
                    a.ring.disarm(waiter);
                }
                if unlikely(wake == Wake::Cancelled) {
                    return Err(Error::Interrupted);
                }
            }
            if let Some((n, q)) = found {
                chunk.queue = q;
                let c = &mut stats.devices[q.device as usize];
                c.rx_chunks += 1;
                c.rx_packets += n as u64;
                c.rx_bytes += out[..n].iter().map(|p| p.len as u64).sum::<u64>();
                return Ok(n);
            }
        }
    }

    /// Queues the first `chunk.count` packets of `chunk` on its TX ring.
    /// Every entry is validated before anything is queued. Returns how many
    /// the ring accepted.
    pub fn send_chunk(&mut self, chunk: &Chunk) -> Result<usize> {
        let count = chunk.count;
        if count == 0 || count > MAX_CHUNK_SIZE || chunk.info.len() < count {
            return Err(Error::InvalidChunkSize(count));
        }
        let sent = self.send_entries(chunk.queue, chunk.buffer, &chunk.info[..count])?;
        Ok(sent)
    }

    /// Sends the next run of staged packets, at most `send_min` of them.
    pub fn send_chunk_buf(&mut self, cb: &mut ChunkBuf) -> Result<usize> {
        let max = self.registry.config().send_min;
        let entries = cb.sendable(max);
        if entries.is_empty() {
            return Ok(0);
        }
        let sent = self.send_entries(cb.queue, cb.buffer, entries)?;
        cb.complete(sent);
        Ok(sent)
    }

    fn send_entries(&mut self, q: QueueRef, buffer: BufferHandle, entries: &[PacketInfo]) -> Result<usize> {
        let ring = self
            .registry
            .device(q.device as usize)?
            .tx_ring(q.queue as usize)?;
        let data = self.buffers.get(buffer)?.as_slice();
        let slot_size = ring.config.slot_size;
        for (index, p) in entries.iter().enumerate() {
            let (offset, len) = (p.offset as usize, p.len as usize);
            if unlikely(len == 0 || len > slot_size || offset + len > data.len()) {
                return Err(Error::InvalidPacket { index, offset, len });
            }
        }
        let sent = ring.submit(
            entries
                .iter()
                .map(|p| &data[p.offset as usize..p.offset as usize + p.len as usize]),
        );
        let bytes = entries[..sent].iter().map(|p| p.len as u64).sum::<u64>();
        let c = &mut self.stats.devices[q.device as usize];
        c.tx_chunks += 1;
        c.tx_packets += sent as u64;
        c.tx_bytes += bytes;
        Ok(sent)
    }

    /// Hands `frame` to the conventional receive path of `device`.
    pub fn inject_raw(&self, device: usize, frame: &[u8]) -> Result<()> {
        self.registry.device(device)?.inject_raw(frame)
    }

    pub fn get_tx_room(&self, q: QueueRef) -> Result<usize> {
        Ok(self
            .registry
            .device(q.device as usize)?
            .tx_ring(q.queue as usize)?
            .free_slots())
    }

    /// Maps a shared region of at least `len` bytes.
    pub fn register_buffer(&mut self, len: usize) -> Result<BufferHandle> {
        self.buffers.register(len)
    }

    /// Takes another reference on a region, returning the new count.
    pub fn dup_buffer(&mut self, h: BufferHandle) -> Result<usize> {
        self.buffers.retain(h)
    }

    /// Drops one reference; the region is unmapped when none remain.
    pub fn release_buffer(&mut self, h: BufferHandle) -> Result<usize> {
        self.buffers.release(h)
    }

    pub fn buffer(&self, h: BufferHandle) -> Result<&[u8]> {
        Ok(self.buffers.get(h)?.as_slice())
    }

    pub fn buffer_mut(&mut self, h: BufferHandle) -> Result<&mut [u8]> {
        Ok(self.buffers.get_mut(h)?.as_mut_slice())
    }
}

fn targets(rings: &[Attached], only: Option<usize>) -> impl Iterator<Item = &Attached> {
    rings
        .iter()
        .filter(move |a| only.is_none_or(|d| a.queue.device as usize == d))
}

/// One round-robin pass. With `only`, the cursor is left alone and only
/// that device's rings are polled.
fn poll(
    rings: &[Attached],
    next_ring: &mut usize,
    only: Option<usize>,
    dst: &mut [u8],
    out: &mut [PacketInfo],
) -> Option<(usize, QueueRef)> {
    if let Some(device) = only {
        return targets(rings, Some(device)).find_map(|a| match a.ring.collect(dst, out) {
                0 => None,
                n => Some((n, a.queue)),
            });
    }
    let n = rings.len();
    for _ in 0..n {
        let i = *next_ring % n;
        *next_ring = (i + 1) % n;
        let a = &rings[i];
        let got = a.ring.collect(dst, out);
        if got > 0 {
            return Some((got, a.queue));
        }
    }
    None
}

impl Drop for Context {
    fn drop(&mut self) {
        for a in self.rings.drain(..) {
            if let Err(e) = a.ring.detach(self.id) {
                tracing::warn!(id = self.id.0, "detach on release: {e}");
            }
        }
        tracing::debug!(id = self.id.0, "context released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, MAX_PACKET_SIZE, RingConfig};
    use crate::device::SoftBed;
    use crate::hw::QueueId;
    use crate::ring::ServicingMode;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn bed(devices: usize, queues: u16) -> SoftBed {
        let cfg = EngineConfig {
            ring: RingConfig {
                rx_descriptors: 64,
                tx_descriptors: 64,
                window_bits: 4,
                ..RingConfig::default()
            },
            send_min: 16,
            ..EngineConfig::default()
        };
        SoftBed::new(cfg, devices, queues, true).unwrap()
    }

    fn frame(tag: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| tag.wrapping_mul(31) ^ i as u8).collect()
    }

    fn region(ctx: &mut Context, packets: usize) -> BufferHandle {
        ctx.register_buffer(packets * MAX_PACKET_SIZE).unwrap()
    }

    #[test]
    fn empty_nonblocking_recv_returns_nothing() {
        let bed = bed(1, 1);
        let mut ctx = Context::new(bed.registry.clone());
        ctx.attach_rx(QueueRef::new(0, 0)).unwrap();
        let buf = region(&mut ctx, 64);
        let mut chunk = Chunk::new(buf, 64);
        assert_eq!(ctx.recv_chunk(&mut chunk).unwrap(), 0);
    }

    #[test]
    fn recv_requires_attachment_and_valid_size() {
        let bed = bed(1, 1);
        let mut ctx = Context::new(bed.registry.clone());
        let buf = region(&mut ctx, 64);
        let mut chunk = Chunk::new(buf, 64);
        assert!(matches!(ctx.recv_chunk(&mut chunk), Err(Error::NotAttached)));
        ctx.attach_rx(QueueRef::new(0, 0)).unwrap();
        chunk.count = 0;
        assert!(matches!(ctx.recv_chunk(&mut chunk), Err(Error::InvalidChunkSize(0))));
        chunk.count = MAX_CHUNK_SIZE + 1;
        assert!(ctx.recv_chunk(&mut chunk).is_err());
        chunk.count = 65;
        assert!(matches!(ctx.recv_chunk(&mut chunk), Err(Error::BufferTooSmall { .. })));
    }

    #[test]
    fn ten_packets_one_chunk() {
        let bed = bed(1, 1);
        let mut ctx = Context::new(bed.registry.clone());
        ctx.attach_rx(QueueRef::new(0, 0)).unwrap();
        for i in 0..10 {
            bed.nics[0].inject(0, &frame(i, 64 + i as usize));
        }
        let buf = region(&mut ctx, 64);
        let mut chunk = Chunk::new(buf, 64);
        assert_eq!(ctx.recv_chunk(&mut chunk).unwrap(), 10);
        assert_eq!(chunk.queue, QueueRef::new(0, 0));
        let data = ctx.buffer(buf).unwrap();
        for (i, p) in chunk.info[..10].iter().enumerate() {
            let off = p.offset as usize;
            assert_eq!(off % 64, 0);
            assert_eq!(&data[off..off + p.len as usize], &frame(i as u8, 64 + i)[..]);
        }
        assert_eq!(ctx.stats().devices[0].rx_packets, 10);
        let ring = bed.registry.device(0).unwrap().rx_ring(0).unwrap();
        assert_eq!(ring.cursors(), (9, 10));
    }

    #[test]
    fn round_robin_over_owned_rings() {
        let bed = bed(1, 2);
        let mut ctx = Context::new(bed.registry.clone());
        ctx.attach_rx(QueueRef::new(0, 0)).unwrap();
        ctx.attach_rx(QueueRef::new(0, 1)).unwrap();
        for i in 0..3 {
            bed.nics[0].inject(0, &frame(i, 60));
            bed.nics[0].inject(1, &frame(i, 60));
        }
        let buf = region(&mut ctx, 1);
        let mut chunk = Chunk::new(buf, 1);
        let mut order = Vec::new();
        for _ in 0..6 {
            assert_eq!(ctx.recv_chunk(&mut chunk).unwrap(), 1);
            order.push(chunk.queue.queue);
        }
        assert_eq!(order, vec![0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn racing_attach_has_one_winner() {
        let bed = bed(1, 1);
        let barrier = Barrier::new(2);
        let results: Vec<Result<()>> = thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let reg = bed.registry.clone();
                    let barrier = &barrier;
                    s.spawn(move || {
                        let mut ctx = Context::new(reg);
                        barrier.wait();
                        let r = ctx.attach_rx(QueueRef::new(0, 0));
                        // Keep ownership until both attempts are done.
                        barrier.wait();
                        r
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(r, Err(Error::Busy { .. }))));
        // Both contexts are gone, so the ring is back to the kernel.
        let ring = bed.registry.device(0).unwrap().rx_ring(0).unwrap();
        assert_eq!(ring.owner_id(), None);
        assert_eq!(ring.mode(), ServicingMode::Polled);
        assert!(bed.nics[0].irq_enabled(QueueId::rx(0)));
    }

    #[test]
    fn detach_keeps_cursor_in_range() {
        let bed = bed(1, 3);
        let mut ctx = Context::new(bed.registry.clone());
        for q in 0..3 {
            ctx.attach_rx(QueueRef::new(0, q)).unwrap();
        }
        bed.nics[0].inject(1, &frame(1, 60));
        let buf = region(&mut ctx, 4);
        let mut chunk = Chunk::new(buf, 4);
        assert_eq!(ctx.recv_chunk(&mut chunk).unwrap(), 1);
        ctx.detach_rx(QueueRef::new(0, 2)).unwrap();
        ctx.detach_rx(QueueRef::new(0, 0)).unwrap();
        assert_eq!(ctx.attached().collect::<Vec<_>>(), vec![QueueRef::new(0, 1)]);
        bed.nics[0].inject(1, &frame(2, 60));
        assert_eq!(ctx.recv_chunk(&mut chunk).unwrap(), 1);
        assert!(matches!(ctx.detach_rx(QueueRef::new(0, 0)), Err(Error::NotOwner { .. })));
    }

    #[test]
    fn blocking_recv_wakes_on_traffic() {
        let bed = bed(1, 1);
        let nic = bed.nics[0].clone();
        let mut ctx = Context::new(bed.registry.clone());
        ctx.attach_rx(QueueRef::new(0, 0)).unwrap();
        let buf = region(&mut ctx, 8);
        let t = thread::spawn(move || {
            let mut chunk = Chunk::new(buf, 8).blocking(true);
            let n = ctx.recv_chunk(&mut chunk).unwrap();
            (n, chunk.info[0].len)
        });
        thread::sleep(Duration::from_millis(50));
        assert!(nic.inject(0, &frame(5, 99)));
        assert_eq!(t.join().unwrap(), (1, 99));
        // The owner is gone; its ring went back to the kernel path.
        assert!(nic.irq_enabled(QueueId::rx(0)));
    }

    #[test]
    fn cancellation_aborts_blocking_recv() {
        let bed = bed(1, 1);
        let mut ctx = Context::new(bed.registry.clone());
        ctx.attach_rx(QueueRef::new(0, 0)).unwrap();
        let cancel = ctx.canceller();
        let buf = region(&mut ctx, 8);
        let t = thread::spawn(move || {
            let mut chunk = Chunk::new(buf, 8).blocking(true);
            ctx.recv_chunk(&mut chunk)
        });
        thread::sleep(Duration::from_millis(50));
        cancel.cancel();
        assert!(matches!(t.join().unwrap(), Err(Error::Interrupted)));
    }

    #[test]
    fn send_then_receive_on_peer() {
        let bed = bed(2, 1);
        let mut tx = Context::new(bed.registry.clone());
        let mut rx = Context::new(bed.registry.clone());
        rx.attach_rx(QueueRef::new(1, 0)).unwrap();

        let out = region(&mut tx, 4);
        let payloads = [frame(1, 60), frame(2, 1514), frame(3, 200)];
        let mut chunk = Chunk::new(out, 3).on(QueueRef::new(0, 0));
        {
            let data = tx.buffer_mut(out).unwrap();
            for (i, p) in payloads.iter().enumerate() {
                let off = i * MAX_PACKET_SIZE;
                data[off..off + p.len()].copy_from_slice(p);
                chunk.info[i] = PacketInfo {
                    offset: off as u32,
                    len: p.len() as u16,
                    ..Default::default()
                };
            }
        }
        let room = tx.get_tx_room(QueueRef::new(0, 0)).unwrap();
        assert_eq!(tx.send_chunk(&chunk).unwrap(), 3);
        assert_eq!(tx.get_tx_room(QueueRef::new(0, 0)).unwrap(), room - 3);
        bed.nics[0].process();

        let inb = region(&mut rx, 8);
        let mut got = Chunk::new(inb, 8);
        assert_eq!(rx.recv_chunk_from(1, &mut got).unwrap(), 3);
        let data = rx.buffer(inb).unwrap();
        for (p, want) in got.info.iter().zip(&payloads) {
            let off = p.offset as usize;
            assert_eq!(&data[off..off + p.len as usize], &want[..]);
        }
        assert_eq!(tx.stats().devices[0].tx_bytes, 60 + 1514 + 200);
        assert!(matches!(rx.recv_chunk_from(0, &mut got), Err(Error::NotAttached)));
    }

    #[test]
    fn bad_entry_rejects_whole_chunk() {
        let bed = bed(1, 1);
        let mut ctx = Context::new(bed.registry.clone());
        let buf = region(&mut ctx, 2);
        let mut chunk = Chunk::new(buf, 2).on(QueueRef::new(0, 0));
        chunk.info[0] = PacketInfo { offset: 0, len: 60, ..Default::default() };
        let end = ctx.buffer(buf).unwrap().len() as u32;
        chunk.info[1] = PacketInfo { offset: end - 100, len: 200, ..Default::default() };
        let room = ctx.get_tx_room(QueueRef::new(0, 0)).unwrap();
        assert!(matches!(ctx.send_chunk(&chunk), Err(Error::InvalidPacket { index: 1, .. })));
        assert_eq!(ctx.get_tx_room(QueueRef::new(0, 0)).unwrap(), room);
        chunk.queue = QueueRef::new(3, 0);
        assert!(matches!(ctx.send_chunk(&chunk), Err(Error::InvalidDevice(3))));
    }

    #[test]
    fn staged_sends_drain_in_order() {
        let bed = bed(1, 1);
        let mut ctx = Context::new(bed.registry.clone());
        let buf = region(&mut ctx, 32);
        let len = ctx.buffer(buf).unwrap().len();
        let mut cb = ChunkBuf::with_entries(QueueRef::new(0, 0), buf, len, 32).unwrap();
        for i in 0..20u8 {
            let off = cb.assign(60).unwrap();
            ctx.buffer_mut(buf).unwrap()[off..off + 60].copy_from_slice(&frame(i, 60));
        }
        // send_min is 16 in this configuration.
        assert_eq!(ctx.send_chunk_buf(&mut cb).unwrap(), 16);
        assert_eq!(ctx.send_chunk_buf(&mut cb).unwrap(), 4);
        assert_eq!(ctx.send_chunk_buf(&mut cb).unwrap(), 0);
        assert_eq!(cb.pending(), 0);
        assert_eq!(bed.nics[0].process(), 20);
    }

    #[test]
    fn inject_raw_validates_device() {
        let bed = bed(1, 1);
        let ctx = Context::new(bed.registry.clone());
        assert!(matches!(ctx.inject_raw(4, &[0u8; 60]), Err(Error::InvalidDevice(4))));
        ctx.inject_raw(0, &[0u8; 60]).unwrap();
        assert_eq!(bed.kernel.len(), 1);
    }

    #[test]
    fn list_devices_and_buffers() {
        let bed = bed(2, 1);
        let mut ctx = Context::new(bed.registry.clone());
        assert_eq!(ctx.list_devices().len(), 2);
        let h = ctx.register_buffer(100).unwrap();
        assert_eq!(ctx.dup_buffer(h).unwrap(), 2);
        assert_eq!(ctx.release_buffer(h).unwrap(), 1);
        assert_eq!(ctx.release_buffer(h).unwrap(), 0);
        assert!(matches!(ctx.buffer(h), Err(Error::UnknownBuffer)));
    }
}
