//! Devices and the registry that owns them.

use std::net::Ipv4Addr;
use std::sync::{Arc as StdArc, Weak};

use arrayvec::ArrayVec;
use etherparse::Ethernet2Header;
use eui48::MacAddress;
use triomphe::Arc;

use crate::config::{EngineConfig, MAX_DEVICES};
use crate::errors::{Error, Result};
use crate::hw::desc::ChecksumVerdict;
use crate::hw::kernel::KernelQueue;
use crate::hw::softnic::SoftNic;
use crate::hw::{Direction, InterruptSink, KernelPath, Nic, QueueId};
use crate::ring::{RxRing, TxRing};

pub const ETH_HLEN: usize = 14;
pub const ETH_FRAME_LEN: usize = 1514;

/// What bring-up needs to know about a port.
#[derive(Clone, Debug)]
pub struct DeviceSpec {
    pub name: String,
    pub mac: MacAddress,
    pub ip: Ipv4Addr,
    pub rx_queues: u16,
    pub tx_queues: u16,
}

/// Snapshot returned by `list_devices`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub mac: MacAddress,
    pub ip: Ipv4Addr,
    pub rx_queues: usize,
    pub tx_queues: usize,
}

/// Routes queue interrupts to rings.
struct IrqRouter {
    rx: Vec<Arc<RxRing>>,
    tx: Vec<Arc<TxRing>>,
}

impl InterruptSink for IrqRouter {
    fn interrupt(&self, queue: QueueId) {
        let i = queue.index as usize;
        match queue.dir {
            Direction::Rx => {
                if let Some(r) = self.rx.get(i) {
                    r.handle_interrupt();
                }
            }
            Direction::Tx => {
                if let Some(r) = self.tx.get(i) {
                    r.handle_interrupt();
                }
            }
        }
    }
}

pub struct Device {
    index: usize,
    spec: DeviceSpec,
    router: StdArc<IrqRouter>,
    kernel: StdArc<dyn KernelPath>,
}

impl Device {
    /// Allocates every ring of the port and connects its interrupts.
    pub fn bring_up(
        index: usize,
        spec: DeviceSpec,
        config: &EngineConfig,
        nic: StdArc<dyn Nic>,
        kernel: StdArc<dyn KernelPath>,
    ) -> Result<Self> {
        if spec.rx_queues == 0 || spec.tx_queues == 0 {
            return Err(Error::InvalidConfig("device needs at least one queue per direction"));
        }
        let mut rx = Vec::with_capacity(spec.rx_queues as usize);
        for q in 0..spec.rx_queues {
            rx.push(Arc::new(RxRing::new(index, q, &config.ring, nic.clone(), kernel.clone())?));
        }
        let mut tx = Vec::with_capacity(spec.tx_queues as usize);
        for q in 0..spec.tx_queues {
            tx.push(Arc::new(TxRing::new(index, q, &config.ring, nic.clone(), kernel.clone())?));
        }
        let router = StdArc::new(IrqRouter { rx, tx });
        let sink: StdArc<dyn InterruptSink> = router.clone();
        nic.connect(StdArc::downgrade(&sink) as Weak<dyn InterruptSink>);

        tracing::info!(
            index,
            name = %spec.name,
            mac = %spec.mac.to_hex_string(),
            rx_queues = spec.rx_queues,
            tx_queues = spec.tx_queues,
            "device up"
        );
        Ok(Self {
            index,
            spec,
            router,
            kernel,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            index: self.index,
            name: self.spec.name.clone(),
            mac: self.spec.mac,
            ip: self.spec.ip,
            rx_queues: self.router.rx.len(),
            tx_queues: self.router.tx.len(),
        }
    }

    pub fn rx_queues(&self) -> usize {
        self.router.rx.len()
    }

    pub fn tx_queues(&self) -> usize {
        self.router.tx.len()
    }

    pub fn rx_ring(&self, queue: usize) -> Result<&Arc<RxRing>> {
        self.router.rx.get(queue).ok_or(Error::InvalidQueue {
            device: self.index,
            queue,
        })
    }

    pub fn tx_ring(&self, queue: usize) -> Result<&Arc<TxRing>> {
        self.router.tx.get(queue).ok_or(Error::InvalidQueue {
            device: self.index,
            queue,
        })
    }

    /// Hands a frame to the conventional receive path of this port.
    pub fn inject_raw(&self, frame: &[u8]) -> Result<()> {
        if !(ETH_HLEN..=ETH_FRAME_LEN).contains(&frame.len()) {
            return Err(Error::InvalidFrame(frame.len()));
        }
        Ethernet2Header::from_slice(frame).map_err(|_| Error::InvalidFrame(frame.len()))?;
        self.kernel.deliver(self.index, frame, ChecksumVerdict::Unknown);
        Ok(())
    }

    /// Transmits one frame on behalf of the conventional path. Returns
    /// whether the ring had room for it.
    pub fn transmit_frame(&self, queue: usize, frame: &[u8]) -> Result<bool> {
        let ring = self.tx_ring(queue)?;
        if frame.is_empty() || frame.len() > ring.config.slot_size {
            return Err(Error::InvalidFrame(frame.len()));
        }
        Ok(ring.submit(std::iter::once(frame)) == 1)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::info!(index = self.index, name = %self.spec.name, "device down");
    }
}

/// Every device brought up by this process.
pub struct Registry {
    config: EngineConfig,
    devices: ArrayVec<Device, MAX_DEVICES>,
}

impl Registry {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            devices: ArrayVec::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Brings up a device and returns its index.
    pub fn add_device(
        &mut self,
        spec: DeviceSpec,
        nic: StdArc<dyn Nic>,
        kernel: StdArc<dyn KernelPath>,
    ) -> Result<usize> {
        if self.devices.is_full() {
            return Err(Error::DeviceTableFull);
        }
        let index = self.devices.len();
        let dev = Device::bring_up(index, spec, &self.config, nic, kernel)?;
        self.devices.push(dev);
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn device(&self, index: usize) -> Result<&Device> {
        self.devices.get(index).ok_or(Error::InvalidDevice(index))
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn list(&self) -> Vec<DeviceInfo> {
        self.devices.iter().map(Device::info).collect()
    }
}

/// A registry of software NICs sharing one kernel queue.
pub struct SoftBed {
    pub registry: Arc<Registry>,
    pub nics: Vec<StdArc<SoftNic>>,
    pub kernel: StdArc<KernelQueue>,
}

impl SoftBed {
    /// Brings up `devices` soft NICs named `soft0..`. With `peered`, devices
    /// are cabled in pairs (0-1, 2-3, ...); otherwise, and for an odd last
    /// device, TX loops back to RX.
    pub fn new(config: EngineConfig, devices: usize, queues: u16, peered: bool) -> Result<Self> {
        let mut registry = Registry::new(config)?;
        let kernel = StdArc::new(KernelQueue::new(1024));
        let mut nics = Vec::with_capacity(devices);
        for i in 0..devices {
            let nic = SoftNic::new(&format!("soft{i}"), queues as usize, queues as usize);
            let spec = DeviceSpec {
                name: nic.name().to_owned(),
                mac: MacAddress::new([0x02, 0, 0, 0, 0, i as u8]),
                ip: Ipv4Addr::new(10, 0, i as u8, 1),
                rx_queues: queues,
                tx_queues: queues,
            };
            registry.add_device(spec, nic.clone(), kernel.clone())?;
            nics.push(nic);
        }
        if peered {
            for pair in nics.chunks_exact(2) {
                SoftNic::connect_peers(&pair[0], &pair[1]);
            }
        }
        Ok(Self {
            registry: Arc::new(registry),
            nics,
            kernel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RingConfig;

    fn small() -> EngineConfig {
        EngineConfig {
            ring: RingConfig {
                rx_descriptors: 64,
                tx_descriptors: 64,
                window_bits: 4,
                ..RingConfig::default()
            },
            send_min: 16,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn list_reports_queues() {
        let bed = SoftBed::new(small(), 2, 2, true).unwrap();
        let list = bed.registry.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].name, "soft1");
        assert_eq!(list[1].rx_queues, 2);
        assert_eq!(list[1].mac, MacAddress::new([2, 0, 0, 0, 0, 1]));
        assert!(matches!(bed.registry.device(2), Err(Error::InvalidDevice(2))));
        assert!(bed.registry.device(0).unwrap().rx_ring(2).is_err());
    }

    #[test]
    fn inject_raw_checks_length() {
        let bed = SoftBed::new(small(), 1, 1, false).unwrap();
        let dev = bed.registry.device(0).unwrap();
        assert!(matches!(dev.inject_raw(&[0u8; 13]), Err(Error::InvalidFrame(13))));
        assert!(dev.inject_raw(&[0u8; 1515]).is_err());
        let mut frame = vec![0u8; 60];
        frame[12..14].copy_from_slice(&[0x86, 0xdd]);
        dev.inject_raw(&frame).unwrap();
        let got = bed.kernel.pop().unwrap();
        assert_eq!(got.ether_type, 0x86dd);
        assert_eq!(got.device, 0);
    }

    #[test]
    fn unowned_traffic_reaches_kernel_path() {
        let bed = SoftBed::new(small(), 2, 1, true).unwrap();
        let dev0 = bed.registry.device(0).unwrap();
        assert!(dev0.transmit_frame(0, &[0x11; 100]).unwrap());
        bed.nics[0].process();
        // Peer RX is unowned, so the interrupt drained it into the kernel path.
        let f = bed.kernel.pop().unwrap();
        assert_eq!(f.device, 1);
        assert_eq!(f.data, vec![0x11; 100]);
        // TX completion interrupt reclaimed the slot.
        assert_eq!(dev0.tx_ring(0).unwrap().free_slots(), 63);
    }
}
