//! Collaborator interfaces between the engine and the device it drives.
//!
//! Register-level bring-up, link handling and interrupt vector policy live
//! behind [`Nic`]; the engine only needs ring binding, the head/tail
//! doorbells and per-queue interrupt masking. [`softnic`] provides a software
//! implementation used by the tests and the `psio` tool.

pub mod desc;
pub mod kernel;
pub mod softnic;

use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use crate::errors::{Error, Result};
use desc::{ChecksumVerdict, Descriptor, RxDesc, TxDesc};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Rx,
    Tx,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueId {
    pub dir: Direction,
    pub index: u16,
}

impl QueueId {
    pub const fn rx(index: u16) -> Self {
        Self {
            dir: Direction::Rx,
            index,
        }
    }

    pub const fn tx(index: u16) -> Self {
        Self {
            dir: Direction::Tx,
            index,
        }
    }
}

/// Translates CPU addresses into addresses the device can DMA to.
pub trait DmaMapper: Send + Sync {
    fn map(&self, ptr: NonNull<u8>, len: usize) -> Result<u64>;
    fn unmap(&self, dma: u64, len: usize);
}

/// Receives queue interrupts raised by the device.
pub trait InterruptSink: Send + Sync {
    fn interrupt(&self, queue: QueueId);
}

/// The conventional, non-bypassed receive path of the host.
pub trait KernelPath: Send + Sync {
    fn deliver(&self, device: usize, frame: &[u8], checksum: ChecksumVerdict);
}

/// Control registers of one NIC.
///
/// Raising an interrupt masks the queue; only [`Nic::irq_enable`] unmasks it.
pub trait Nic: Send + Sync {
    fn dma(&self) -> Arc<dyn DmaMapper>;
    /// Programs ring base and length for an RX queue.
    fn bind_rx(&self, queue: u16, table: Arc<DescTable<RxDesc>>, buf_len: usize);
    /// Programs ring base and length for a TX queue.
    fn bind_tx(&self, queue: u16, table: Arc<DescTable<TxDesc>>);
    fn unbind(&self, queue: QueueId);
    fn write_tail(&self, queue: QueueId, value: u32);
    fn read_head(&self, queue: QueueId) -> u32;
    fn irq_enable(&self, queue: QueueId);
    fn irq_disable(&self, queue: QueueId);
    fn connect(&self, sink: Weak<dyn InterruptSink>);
}

/// A DMA-mapped descriptor array.
pub struct DescTable<D: Descriptor> {
    descs: Box<[D]>,
    dma: u64,
    mapper: Arc<dyn DmaMapper>,
}

impl<D: Descriptor> DescTable<D> {
    pub fn new(count: usize, mapper: Arc<dyn DmaMapper>) -> Result<Self> {
        let descs: Box<[D]> = (0..count).map(|_| D::default()).collect();
        let ptr = NonNull::new(descs.as_ptr() as *mut u8).ok_or(Error::NoMemory)?;
        let dma = mapper.map(ptr, count * size_of::<D>())?;
        Ok(Self { descs, dma, mapper })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.descs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    /// Descriptor at `index`, which the caller keeps below `len()`.
    #[inline]
    pub fn get(&self, index: usize) -> &D {
        &self.descs[index]
    }

    pub fn dma(&self) -> u64 {
        self.dma
    }
}

impl<D: Descriptor> Drop for DescTable<D> {
    fn drop(&mut self) {
        self.mapper
            .unmap(self.dma, self.descs.len() * size_of::<D>());
    }
}
