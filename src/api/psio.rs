//! `IoBackend` over the chunk API.

use triomphe::Arc;

use crate::api::{Flags, IoBackend};
use crate::chunk::{Chunk, ChunkBuf, QueueRef};
use crate::config::{ENTRY_CNT, MAX_DEVICES, MAX_PACKET_SIZE};
use crate::context::Context;
use crate::device::Registry;
use crate::errors::{Error, Result};
use crate::select::{DeviceMask, Event, Readiness, Timeout};

#[derive(Clone, Debug)]
pub struct PsioFlags {
    /// Queue index claimed on every device.
    pub queue: u16,
    /// Devices to link; empty means all of them.
    pub devices: Vec<usize>,
    pub chunk_size: usize,
    /// Entries of each per-device staging buffer.
    pub staging_entries: usize,
    pub select_timeout: Timeout,
}

impl Default for PsioFlags {
    fn default() -> Self {
        Self {
            queue: 0,
            devices: Vec::new(),
            chunk_size: 64,
            staging_entries: ENTRY_CNT,
            select_timeout: Timeout::from_micros(100),
        }
    }
}

impl Flags for PsioFlags {}

pub struct PsioBackend {
    ctx: Context,
    flags: PsioFlags,
    devices: Vec<usize>,
    chunk: Chunk,
    /// Device the current `chunk` contents came from, and how many.
    last: Option<(usize, usize)>,
    staging: Vec<Option<ChunkBuf>>,
    event: Event,
    rx_avail: DeviceMask,
}

impl PsioBackend {
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    fn staging_mut(&mut self, device: usize) -> Option<&mut ChunkBuf> {
        self.staging.get_mut(device).and_then(Option::as_mut)
    }
}

impl IoBackend for PsioBackend {
    type Port = Arc<Registry>;
    type Flags = PsioFlags;

    fn init_handle(registry: Arc<Registry>, flags: PsioFlags) -> Result<Self> {
        let devices: Vec<usize> = if flags.devices.is_empty() {
            (0..registry.len()).collect()
        } else {
            flags.devices.clone()
        };
        let queue = flags.queue as usize;
        let mut ctx = Context::new(registry);

        let rx_buf = ctx.register_buffer(flags.chunk_size * MAX_PACKET_SIZE)?;
        let chunk = Chunk::new(rx_buf, flags.chunk_size);

        let mut staging: Vec<Option<ChunkBuf>> = (0..MAX_DEVICES).map(|_| None).collect();
        for &d in &devices {
            if ctx.registry().device(d)?.tx_queues() <= queue {
                continue;
            }
            let len = flags.staging_entries * MAX_PACKET_SIZE;
            let buf = ctx.register_buffer(len)?;
            let region = ctx.buffer(buf)?.len();
            staging[d] = Some(ChunkBuf::with_entries(
                QueueRef::new(d as u16, flags.queue),
                buf,
                region,
                flags.staging_entries,
            )?);
        }

        let event = Event {
            timeout: flags.select_timeout,
            queue: flags.queue,
            rx: DeviceMask::EMPTY,
            tx: DeviceMask::EMPTY,
        };
        tracing::debug!(queue, devices = ?devices, "psio handle ready");
        Ok(Self {
            ctx,
            flags,
            devices,
            chunk,
            last: None,
            staging,
            event,
            rx_avail: DeviceMask::EMPTY,
        })
    }

    fn link_devices(&mut self) -> Result<bool> {
        let queue = self.flags.queue;
        let mut working = false;
        for &d in &self.devices {
            if self.ctx.registry().device(d)?.rx_queues() <= queue as usize {
                continue;
            }
            self.ctx.attach_rx(QueueRef::new(d as u16, queue))?;
            working = true;
        }
        Ok(working)
    }

    fn recv_pkts(&mut self, device: usize) -> Result<usize> {
        self.last = None;
        self.chunk.count = self.flags.chunk_size;
        let n = match self.ctx.recv_chunk_from(device, &mut self.chunk) {
            Ok(n) => n,
            Err(Error::NotAttached) => return Ok(0),
            Err(e) => return Err(e),
        };
        if n == 0 {
            self.event.rx = self.event.rx.with(device);
        } else {
            self.rx_avail = self.rx_avail.with(device);
            self.last = Some((device, n));
        }
        Ok(n)
    }

    fn get_rptr(&self, device: usize, index: usize) -> Option<&[u8]> {
        let (from, n) = self.last?;
        if from != device || index >= n {
            return None;
        }
        let p = self.chunk.info[index];
        let data = self.ctx.buffer(self.chunk.buffer).ok()?;
        data.get(p.offset as usize..p.offset as usize + p.len as usize)
    }

    fn get_wptr(&mut self, device: usize, len: usize) -> Option<&mut [u8]> {
        let cb = self.staging_mut(device)?;
        let buf = cb.buffer;
        let offset = cb.assign(len)?;
        let data = self.ctx.buffer_mut(buf).ok()?;
        data.get_mut(offset..offset + len)
    }

    fn send_pkts(&mut self, device: usize) -> Result<usize> {
        let Some(cb) = self.staging.get_mut(device).and_then(Option::as_mut) else {
            return Ok(0);
        };
        let mut total = 0;
        while cb.pending() > 0 {
            let before = cb.pending();
            let sent = self.ctx.send_chunk_buf(cb)?;
            total += sent;
            if sent == 0 || sent < before {
                // Ring full; wait for room in the next select.
                self.event.tx = self.event.tx.with(device);
                break;
            }
        }
        Ok(total)
    }

    fn release_pkt(&mut self, device: usize, frame: &[u8]) -> Result<()> {
        self.ctx.inject_raw(device, frame)
    }

    fn select(&mut self) -> Result<()> {
        if self.rx_avail.is_empty() || !self.event.tx.is_empty() {
            for (d, cb) in self.staging.iter().enumerate() {
                if cb.as_ref().is_some_and(|cb| cb.pending() > 0) {
                    self.event.tx = self.event.tx.with(d);
                }
            }
            match self.ctx.select(&self.event) {
                Ok(Readiness::Ready { rx, tx }) => {
                    tracing::trace!(rx = rx.0, tx = tx.0, "select ready");
                }
                Ok(_) => {}
                Err(Error::Interrupted) => tracing::debug!("select interrupted"),
                Err(e) => return Err(e),
            }
        }
        self.event.timeout = self.flags.select_timeout;
        self.event.rx = DeviceMask::EMPTY;
        self.event.tx = DeviceMask::EMPTY;
        self.rx_avail = DeviceMask::EMPTY;
        Ok(())
    }

    fn destroy_handle(self) {
        tracing::debug!(id = ?self.ctx.id(), "psio handle destroyed");
    }
}
