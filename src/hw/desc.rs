//! Advanced RX/TX descriptor layouts shared with the NIC.
//!
//! Each descriptor is two little-endian quadwords. The second quadword is the
//! one hardware writes last on completion, so it is stored with release and
//! loaded with acquire ordering; everything else is relaxed.

use std::sync::atomic::{AtomicU64, Ordering};

pub const RXD_STAT_DD: u32 = 0x01;
pub const RXD_STAT_EOP: u32 = 0x02;
pub const RXD_STAT_L4CS: u32 = 0x20;
pub const RXD_STAT_IPCS: u32 = 0x40;

pub const RXDADV_ERR_CE: u32 = 0x0100_0000;
pub const RXDADV_ERR_LE: u32 = 0x0200_0000;
pub const RXDADV_ERR_PE: u32 = 0x0800_0000;
pub const RXDADV_ERR_OSE: u32 = 0x1000_0000;
pub const RXDADV_ERR_USE: u32 = 0x2000_0000;
pub const RXDADV_ERR_TCPE: u32 = 0x4000_0000;
pub const RXDADV_ERR_IPE: u32 = 0x8000_0000;
pub const RXDADV_ERR_FRAME_ERR_MASK: u32 =
    RXDADV_ERR_CE | RXDADV_ERR_LE | RXDADV_ERR_PE | RXDADV_ERR_OSE | RXDADV_ERR_USE;

pub const TXD_CMD_EOP: u32 = 0x0100_0000;
pub const TXD_CMD_IFCS: u32 = 0x0200_0000;
pub const TXD_CMD_RS: u32 = 0x0800_0000;
pub const TXD_CMD_DEXT: u32 = 0x2000_0000;
pub const ADVTXD_DTYP_DATA: u32 = 0x0030_0000;
pub const ADVTXD_PAYLEN_SHIFT: u32 = 14;
pub const TXD_STAT_DD: u32 = 0x01;

const TX_CMD: u32 = ADVTXD_DTYP_DATA | TXD_CMD_DEXT | TXD_CMD_IFCS | TXD_CMD_EOP;

/// Checksum offload result reported per packet.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChecksumVerdict {
    #[default]
    Unknown = 0,
    Good = 1,
    Bad = 2,
}

impl From<ChecksumVerdict> for u8 {
    fn from(v: ChecksumVerdict) -> u8 {
        v as u8
    }
}

/// Second quadword of an RX descriptor in writeback format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxWriteback(u64);

impl RxWriteback {
    pub fn new(status_error: u32, len: u16) -> Self {
        Self(status_error as u64 | (len as u64) << 32)
    }

    #[inline]
    pub fn status_error(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn len(self) -> usize {
        (self.0 >> 32) as u16 as usize
    }

    #[inline]
    pub fn vlan(self) -> u16 {
        (self.0 >> 48) as u16
    }

    #[inline]
    pub fn done(self) -> bool {
        self.status_error() & RXD_STAT_DD != 0
    }

    #[inline]
    pub fn eop(self) -> bool {
        self.status_error() & RXD_STAT_EOP != 0
    }

    #[inline]
    pub fn frame_error(self) -> bool {
        self.status_error() & RXDADV_ERR_FRAME_ERR_MASK != 0
    }

    /// IP checksum decides; a checked L4 checksum can only downgrade it.
    pub fn checksum(self) -> ChecksumVerdict {
        let s = self.status_error();
        if s & RXD_STAT_IPCS == 0 {
            return ChecksumVerdict::Unknown;
        }
        if s & RXDADV_ERR_IPE != 0 {
            return ChecksumVerdict::Bad;
        }
        if s & RXD_STAT_L4CS != 0 && s & RXDADV_ERR_TCPE != 0 {
            return ChecksumVerdict::Bad;
        }
        ChecksumVerdict::Good
    }
}

#[repr(C, align(16))]
#[derive(Default)]
pub struct RxDesc {
    qw0: AtomicU64,
    qw1: AtomicU64,
}

impl RxDesc {
    /// Hands the slot at `dma` to hardware. Slots are 64-byte aligned, so
    /// writing the address over the status word clears DD.
    #[inline]
    pub fn post(&self, dma: u64) {
        self.qw0.store(dma, Ordering::Relaxed);
        self.qw1.store(dma, Ordering::Relaxed);
    }

    #[inline]
    pub fn writeback(&self) -> RxWriteback {
        RxWriteback(self.qw1.load(Ordering::Acquire))
    }

    /// Buffer address as posted. Only meaningful before completion.
    #[inline]
    pub fn pkt_addr(&self) -> u64 {
        self.qw0.load(Ordering::Relaxed)
    }

    /// Device side of completion.
    pub fn complete(&self, wb: RxWriteback) {
        self.qw0.store(0, Ordering::Relaxed);
        self.qw1.store(wb.0, Ordering::Release);
    }
}

/// Decoded TX data descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxRead {
    pub buffer_addr: u64,
    pub cmd_type_len: u32,
    pub olinfo_status: u32,
}

impl TxRead {
    #[inline]
    pub fn len(&self) -> usize {
        (self.cmd_type_len & 0xffff) as usize
    }

    #[inline]
    pub fn eop(&self) -> bool {
        self.cmd_type_len & TXD_CMD_EOP != 0
    }

    #[inline]
    pub fn done(&self) -> bool {
        self.olinfo_status & TXD_STAT_DD != 0
    }
}

#[repr(C, align(16))]
#[derive(Default)]
pub struct TxDesc {
    qw0: AtomicU64,
    qw1: AtomicU64,
}

impl TxDesc {
    /// Builds a single-descriptor data packet of `len` bytes at `dma`.
    #[inline]
    pub fn write(&self, dma: u64, len: u16) {
        let cmd_type_len = TX_CMD | len as u32;
        let olinfo_status = (len as u32) << ADVTXD_PAYLEN_SHIFT;
        self.qw0.store(dma, Ordering::Relaxed);
        self.qw1.store(
            cmd_type_len as u64 | (olinfo_status as u64) << 32,
            Ordering::Relaxed,
        );
    }

    #[inline]
    pub fn read(&self) -> TxRead {
        let qw1 = self.qw1.load(Ordering::Acquire);
        TxRead {
            buffer_addr: self.qw0.load(Ordering::Relaxed),
            cmd_type_len: qw1 as u32,
            olinfo_status: (qw1 >> 32) as u32,
        }
    }

    /// Device side of completion.
    pub fn complete(&self) {
        self.qw1
            .fetch_or((TXD_STAT_DD as u64) << 32, Ordering::Release);
    }
}

/// Descriptor types a ring can hold.
pub trait Descriptor: Default + Send + Sync + 'static {
    const NAME: &'static str;
}

impl Descriptor for RxDesc {
    const NAME: &'static str = "rx";
}

impl Descriptor for TxDesc {
    const NAME: &'static str = "tx";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_sixteen_bytes() {
        assert_eq!(std::mem::size_of::<RxDesc>(), 16);
        assert_eq!(std::mem::size_of::<TxDesc>(), 16);
        assert_eq!(std::mem::align_of::<TxDesc>(), 16);
    }

    #[test]
    fn repost_clears_done() {
        let d = RxDesc::default();
        d.complete(RxWriteback::new(RXD_STAT_DD | RXD_STAT_EOP, 60));
        assert!(d.writeback().done());
        d.post(0x1234_5800);
        assert!(!d.writeback().done());
        assert_eq!(d.pkt_addr(), 0x1234_5800);
    }

    #[test]
    fn checksum_bits() {
        let base = RXD_STAT_DD | RXD_STAT_EOP;
        assert_eq!(RxWriteback::new(base, 1).checksum(), ChecksumVerdict::Unknown);
        assert_eq!(
            RxWriteback::new(base | RXD_STAT_IPCS, 1).checksum(),
            ChecksumVerdict::Good
        );
        assert_eq!(
            RxWriteback::new(base | RXD_STAT_IPCS | RXDADV_ERR_IPE, 1).checksum(),
            ChecksumVerdict::Bad
        );
        assert_eq!(
            RxWriteback::new(base | RXD_STAT_IPCS | RXD_STAT_L4CS | RXDADV_ERR_TCPE, 1)
                .checksum(),
            ChecksumVerdict::Bad
        );
        // TCPE without L4CS means the L4 checksum was not evaluated.
        assert_eq!(
            RxWriteback::new(base | RXD_STAT_IPCS | RXDADV_ERR_TCPE, 1).checksum(),
            ChecksumVerdict::Good
        );
    }

    #[test]
    fn tx_descriptor_fields() {
        let d = TxDesc::default();
        d.write(0x8000, 60);
        let r = d.read();
        assert_eq!(r.buffer_addr, 0x8000);
        assert_eq!(r.len(), 60);
        assert!(r.eop());
        assert_eq!(r.cmd_type_len & ADVTXD_DTYP_DATA, ADVTXD_DTYP_DATA);
        assert_eq!(r.olinfo_status, 60 << ADVTXD_PAYLEN_SHIFT);
        assert!(!r.done());
        d.complete();
        assert!(d.read().done());
    }
}
