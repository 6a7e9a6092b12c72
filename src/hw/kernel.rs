//! Bounded capture of frames handed to the conventional stack.

use std::sync::atomic::{AtomicU64, Ordering};

use etherparse::Ethernet2Header;
use parking_lot::Mutex;
use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Observer, Producer};

use super::KernelPath;
use super::desc::ChecksumVerdict;

#[derive(Debug, Clone)]
pub struct KernelFrame {
    pub device: usize,
    pub ether_type: u16,
    pub checksum: ChecksumVerdict,
    pub data: Vec<u8>,
}

/// A [`KernelPath`] that queues frames for inspection instead of running a
/// protocol stack. Frames arriving while the queue is full are dropped.
pub struct KernelQueue {
    frames: Mutex<HeapRb<KernelFrame>>,
    dropped: AtomicU64,
}

impl KernelQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(HeapRb::new(capacity)),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn pop(&self) -> Option<KernelFrame> {
        self.frames.lock().try_pop()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl KernelPath for KernelQueue {
    fn deliver(&self, device: usize, frame: &[u8], checksum: ChecksumVerdict) {
        let ether_type = match Ethernet2Header::from_slice(frame) {
            Ok((eth, _)) => eth.ether_type.0,
            Err(_) => 0,
        };
        let item = KernelFrame {
            device,
            ether_type,
            checksum,
            data: frame.to_vec(),
        };
        if self.frames.lock().try_push(item).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(device, "kernel queue full, frame dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_drops_when_full() {
        let q = KernelQueue::new(2);
        let mut frame = vec![0u8; 60];
        frame[12] = 0x08;
        for _ in 0..3 {
            q.deliver(1, &frame, ChecksumVerdict::Unknown);
        }
        assert_eq!(q.len(), 2);
        assert_eq!(q.dropped(), 1);
        let f = q.pop().unwrap();
        assert_eq!(f.device, 1);
        assert_eq!(f.ether_type, 0x0800);
    }
}
