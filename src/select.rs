//! Readiness wait across devices.

use std::time::{Duration, Instant};

use crate::config::MAX_DEVICES;
use crate::context::Context;
use crate::device::Registry;
use crate::errors::{Error, Result};
use crate::gate::Wake;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    NonBlocking,
    After(Duration),
    Infinite,
}

impl Timeout {
    /// Negative blocks forever, zero never blocks.
    pub fn from_micros(us: i64) -> Self {
        match us {
            0 => Timeout::NonBlocking,
            us if us < 0 => Timeout::Infinite,
            us => Timeout::After(Duration::from_micros(us as u64)),
        }
    }
}

/// Set of device indices.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DeviceMask(pub u16);

impl DeviceMask {
    pub const EMPTY: Self = Self(0);

    pub fn single(device: usize) -> Self {
        Self::EMPTY.with(device)
    }

    pub fn with(self, device: usize) -> Self {
        debug_assert!(device < MAX_DEVICES);
        Self(self.0 | 1 << device)
    }

    pub fn contains(self, device: usize) -> bool {
        device < MAX_DEVICES && self.0 & (1 << device) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..MAX_DEVICES).filter(move |&d| self.contains(d))
    }
}

/// What to wait for: RX data on `rx` devices, TX room on `tx` devices, both
/// on queue `queue` of every device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    pub timeout: Timeout,
    pub queue: u16,
    pub rx: DeviceMask,
    pub tx: DeviceMask,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready { rx: DeviceMask, tx: DeviceMask },
    WouldBlock,
    TimedOut,
}

fn validate(registry: &Registry, ev: &Event) -> Result<()> {
    let queue = ev.queue as usize;
    for d in ev.rx.iter() {
        registry.device(d)?.rx_ring(queue)?;
    }
    for d in ev.tx.iter() {
        registry.device(d)?.tx_ring(queue)?;
    }
    Ok(())
}

/// Peeks every requested ring. RX is ready when the next descriptor has
/// completed, TX when at least `send_min` slots are free. With `reclaim`, a TX
/// ring below `send_min` first frees what the NIC has finished with.
fn probe(
    registry: &Registry,
    ev: &Event,
    reclaim: bool,
) -> Result<Option<(DeviceMask, DeviceMask)>> {
    let queue = ev.queue as usize;
    let send_min = registry.config().send_min;
    let mut rx = DeviceMask::EMPTY;
    let mut tx = DeviceMask::EMPTY;
    for d in ev.rx.iter() {
        if registry.device(d)?.rx_ring(queue)?.peek_done() {
            rx = rx.with(d);
        }
    }
    for d in ev.tx.iter() {
        let ring = registry.device(d)?.tx_ring(queue)?;
        let mut free = ring.free_slots();
        if reclaim && free < send_min {
            ring.reclaim();
            free = ring.free_slots();
        }
        if free >= send_min {
            tx = tx.with(d);
        }
    }
    Ok((!rx.is_empty() || !tx.is_empty()).then_some((rx, tx)))
}

impl Context {
    /// Waits until one of the rings named by `ev` is ready.
    ///
    /// Only queue `ev.queue` is probed, on every device; each device is
    /// checked against its own queue counts.
    pub fn select(&mut self, ev: &Event) -> Result<Readiness> {
        let registry = &*self.registry;
        validate(registry, ev)?;
        if ev.rx.is_empty() && ev.tx.is_empty() {
            return Ok(Readiness::Ready {
                rx: DeviceMask::EMPTY,
                tx: DeviceMask::EMPTY,
            });
        }
        let blocking = ev.timeout != Timeout::NonBlocking;
        if let Some((rx, tx)) = probe(registry, ev, blocking)? {
            return Ok(Readiness::Ready { rx, tx });
        }
        let deadline = match ev.timeout {
            Timeout::NonBlocking => return Ok(Readiness::WouldBlock),
            Timeout::After(d) => Some(Instant::now() + d),
            Timeout::Infinite => None,
        };

        let queue = ev.queue as usize;
        let waiter = &self.waiter;
        loop {
            let ticket = waiter.ticket();
            for d in ev.rx.iter() {
                registry.device(d)?.rx_ring(queue)?.arm(waiter);
            }
            for d in ev.tx.iter() {
                registry.device(d)?.tx_ring(queue)?.arm(waiter);
            }
            let found = probe(registry, ev, true);
            let wake = match (&found, deadline) {
                (Ok(Some(_)) | Err(_), _) => Wake::Woken,
                (Ok(None), None) => waiter.wait(ticket, None),
                (Ok(None), Some(deadline)) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let slack = registry.config().slack_for(remaining);
                    waiter.wait(ticket, Some(deadline + slack))
                }
            };
            for d in ev.rx.iter() {
                registry.device(d)?.rx_ring(queue)?.disarm(waiter);
            }
            for d in ev.tx.iter() {
                registry.device(d)?.tx_ring(queue)?.disarm(waiter);
            }

            if let Some((rx, tx)) = found? {
                return Ok(Readiness::Ready { rx, tx });
            }
            match wake {
                Wake::Cancelled => return Err(Error::Interrupted),
                Wake::TimedOut => {
                    return Ok(match probe(registry, ev, true)? {
                        Some((rx, tx)) => Readiness::Ready { rx, tx },
                        None => Readiness::TimedOut,
                    });
                }
                Wake::Woken => {}
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(Readiness::TimedOut);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Chunk, PacketInfo, QueueRef};
    use crate::config::{EngineConfig, RingConfig};
    use crate::device::SoftBed;
    use std::thread;

    fn bed(devices: usize) -> SoftBed {
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
        SoftBed::new(cfg, devices, 1, true).unwrap()
    }

    fn rx_event(timeout: Timeout, mask: DeviceMask) -> Event {
        Event {
            timeout,
            queue: 0,
            rx: mask,
            tx: DeviceMask::EMPTY,
        }
    }

    #[test]
    fn timeout_from_micros() {
        assert_eq!(Timeout::from_micros(0), Timeout::NonBlocking);
        assert_eq!(Timeout::from_micros(-1), Timeout::Infinite);
        assert_eq!(Timeout::from_micros(250), Timeout::After(Duration::from_micros(250)));
    }

    #[test]
    fn mask_iterates_set_bits() {
        let m = DeviceMask::single(0).with(3).with(15);
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![0, 3, 15]);
        assert!(!m.contains(1));
        assert!(!m.contains(16));
    }

    #[test]
    fn nothing_ready_would_block() {
        let bed = bed(2);
        let mut ctx = Context::new(bed.registry.clone());
        for d in 0..2 {
            ctx.attach_rx(QueueRef::new(d, 0)).unwrap();
        }
        let ev = rx_event(Timeout::NonBlocking, DeviceMask::single(0).with(1));
        let start = Instant::now();
        assert_eq!(ctx.select(&ev).unwrap(), Readiness::WouldBlock);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn select_peeks_without_consuming() {
        let bed = bed(2);
        let mut ctx = Context::new(bed.registry.clone());
        ctx.attach_rx(QueueRef::new(1, 0)).unwrap();
        bed.nics[1].inject(0, &[0x42; 60]);
        let ev = rx_event(Timeout::NonBlocking, DeviceMask::single(0).with(1));
        let want = Readiness::Ready {
            rx: DeviceMask::single(1),
            tx: DeviceMask::EMPTY,
        };
        assert_eq!(ctx.select(&ev).unwrap(), want);
        assert_eq!(ctx.select(&ev).unwrap(), want);

        let buf = ctx.register_buffer(4 * 2048).unwrap();
        let mut chunk = Chunk::new(buf, 4);
        assert_eq!(ctx.recv_chunk(&mut chunk).unwrap(), 1);
        assert_eq!(ctx.select(&ev).unwrap(), Readiness::WouldBlock);
    }

    #[test]
    fn tx_ready_against_threshold() {
        let bed = bed(2);
        let mut ctx = Context::new(bed.registry.clone());
        let ev = Event {
            timeout: Timeout::NonBlocking,
            queue: 0,
            rx: DeviceMask::EMPTY,
            tx: DeviceMask::single(0),
        };
        assert_eq!(
            ctx.select(&ev).unwrap(),
            Readiness::Ready {
                rx: DeviceMask::EMPTY,
                tx: DeviceMask::single(0)
            }
        );

        // Leave fewer than 16 free slots out of 63.
        let buf = ctx.register_buffer(64 * 64).unwrap();
        let mut chunk = Chunk::new(buf, 50).on(QueueRef::new(0, 0));
        for (i, p) in chunk.info.iter_mut().enumerate() {
            *p = PacketInfo {
                offset: (i * 64) as u32,
                len: 60,
                ..Default::default()
            };
        }
        assert_eq!(ctx.send_chunk(&chunk).unwrap(), 50);
        assert_eq!(ctx.select(&ev).unwrap(), Readiness::WouldBlock);

        // A non-blocking select only peeks, so completed slots stay unreclaimed.
        bed.nics[0].process();
        let ring = bed.registry.device(0).unwrap().tx_ring(0).unwrap().clone();
        let cursors = ring.cursors();
        assert_eq!(ctx.select(&ev).unwrap(), Readiness::WouldBlock);
        assert_eq!(ring.cursors(), cursors);

        let ev = Event {
            timeout: Timeout::After(Duration::from_millis(50)),
            ..ev
        };
        assert!(matches!(ctx.select(&ev).unwrap(), Readiness::Ready { .. }));
        assert_ne!(ring.cursors(), cursors);
    }

    #[test]
    fn empty_event_returns_at_once() {
        let bed = bed(1);
        let mut ctx = Context::new(bed.registry.clone());
        let empty = Readiness::Ready {
            rx: DeviceMask::EMPTY,
            tx: DeviceMask::EMPTY,
        };
        let start = Instant::now();
        for timeout in [Timeout::After(Duration::from_millis(300)), Timeout::Infinite] {
            assert_eq!(ctx.select(&rx_event(timeout, DeviceMask::EMPTY)).unwrap(), empty);
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn bounded_wait_times_out() {
        let bed = bed(1);
        let mut ctx = Context::new(bed.registry.clone());
        ctx.attach_rx(QueueRef::new(0, 0)).unwrap();
        let ev = rx_event(Timeout::After(Duration::from_millis(20)), DeviceMask::single(0));
        let start = Instant::now();
        assert_eq!(ctx.select(&ev).unwrap(), Readiness::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn infinite_wait_wakes_on_traffic() {
        let bed = bed(1);
        let nic = bed.nics[0].clone();
        let mut ctx = Context::new(bed.registry.clone());
        ctx.attach_rx(QueueRef::new(0, 0)).unwrap();
        let t = thread::spawn(move || {
            let ev = rx_event(Timeout::Infinite, DeviceMask::single(0));
            ctx.select(&ev)
        });
        thread::sleep(Duration::from_millis(30));
        nic.inject(0, &[1; 64]);
        assert_eq!(
            t.join().unwrap().unwrap(),
            Readiness::Ready {
                rx: DeviceMask::single(0),
                tx: DeviceMask::EMPTY
            }
        );
    }

    #[test]
    fn cancel_aborts_select() {
        let bed = bed(1);
        let mut ctx = Context::new(bed.registry.clone());
        ctx.attach_rx(QueueRef::new(0, 0)).unwrap();
        let cancel = ctx.canceller();
        let t = thread::spawn(move || {
            let ev = rx_event(Timeout::Infinite, DeviceMask::single(0));
            ctx.select(&ev)
        });
        thread::sleep(Duration::from_millis(30));
        cancel.cancel();
        assert!(matches!(t.join().unwrap(), Err(Error::Interrupted)));
    }

    #[test]
    fn unknown_device_or_queue_is_rejected() {
        let bed = bed(2);
        let mut ctx = Context::new(bed.registry.clone());
        let ev = rx_event(Timeout::NonBlocking, DeviceMask::single(5));
        assert!(matches!(ctx.select(&ev), Err(Error::InvalidDevice(5))));
        let ev = Event {
            queue: 1,
            ..rx_event(Timeout::NonBlocking, DeviceMask::single(0))
        };
        assert!(matches!(
            ctx.select(&ev),
            Err(Error::InvalidQueue { device: 0, queue: 1 })
        ));
    }
}
