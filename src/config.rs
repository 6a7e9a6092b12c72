//! Engine limits and tunables.

use std::time::Duration;

use crate::errors::{Error, Result};

/// Maximum number of devices a registry can hold.
pub const MAX_DEVICES: usize = 16;
/// Maximum number of RX rings a single context may own.
pub const MAX_RINGS: usize = 64;
/// Maximum number of shared regions a single context may register.
pub const MAX_BUFS: usize = 12 * 4;
/// Size of one ring slot, and the largest frame the engine moves.
pub const MAX_PACKET_SIZE: usize = 2048;
/// Largest batch a single chunk request may carry.
pub const MAX_CHUNK_SIZE: usize = 4096;
/// Entries in a staging send buffer.
pub const ENTRY_CNT: usize = 4096;
/// Free TX slots needed before select reports a device writable.
pub const SEND_MIN: usize = 256;
/// Payload offsets inside a shared region are aligned to this.
pub const PACKET_ALIGN: usize = 64;

pub const DEFAULT_RXD: u32 = 4096;
pub const DEFAULT_TXD: u32 = 4096;
pub const WINDOW_BITS: u32 = 10;

const MIN_DESCRIPTORS: u32 = 8;
const MAX_DESCRIPTORS: u32 = 4096;

/// Per-queue ring geometry.
#[derive(Clone, Debug)]
pub struct RingConfig {
    /// Descriptors per RX ring.
    pub rx_descriptors: u32,
    /// Descriptors per TX ring.
    pub tx_descriptors: u32,
    /// log2 of slots per buffer window.
    pub window_bits: u32,
    /// Bytes per slot.
    pub slot_size: usize,
    /// Descriptors submitted between two doorbell writes.
    pub doorbell_interval: usize,
    /// Frames handed to the kernel path per interrupt on an unowned ring.
    pub kernel_budget: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            rx_descriptors: DEFAULT_RXD,
            tx_descriptors: DEFAULT_TXD,
            window_bits: WINDOW_BITS,
            slot_size: MAX_PACKET_SIZE,
            doorbell_interval: 256,
            kernel_budget: 64,
        }
    }
}

impl RingConfig {
    pub fn validate(&self) -> Result<()> {
        for count in [self.rx_descriptors, self.tx_descriptors] {
            if !(MIN_DESCRIPTORS..=MAX_DESCRIPTORS).contains(&count) || count % 8 != 0 {
                return Err(Error::InvalidConfig(
                    "descriptor count must be a multiple of 8 in 8..=4096",
                ));
            }
        }
        if !(1..=16).contains(&self.window_bits) {
            return Err(Error::InvalidConfig("window bits must be in 1..=16"));
        }
        if self.slot_size < PACKET_ALIGN
            || self.slot_size > MAX_PACKET_SIZE
            || self.slot_size % PACKET_ALIGN != 0
        {
            return Err(Error::InvalidConfig(
                "slot size must be a multiple of 64 no larger than 2048",
            ));
        }
        if self.doorbell_interval == 0 {
            return Err(Error::InvalidConfig("doorbell interval must be non-zero"));
        }
        if self.kernel_budget == 0 {
            return Err(Error::InvalidConfig("kernel budget must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub ring: RingConfig,
    /// TX readiness threshold used by select.
    pub send_min: usize,
    /// Lower bound of the select timer slack.
    pub min_slack: Duration,
    /// Upper bound of the select timer slack.
    pub max_slack: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ring: RingConfig::default(),
            send_min: SEND_MIN,
            min_slack: Duration::from_micros(50),
            max_slack: Duration::from_millis(1),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.ring.validate()?;
        let smallest = self.ring.tx_descriptors.min(self.ring.rx_descriptors) as usize;
        if self.send_min == 0 || self.send_min >= smallest {
            return Err(Error::InvalidConfig(
                "send threshold must be non-zero and below the ring size",
            ));
        }
        if self.min_slack > self.max_slack {
            return Err(Error::InvalidConfig("minimum slack exceeds maximum slack"));
        }
        Ok(())
    }

    /// Timer slack for a wait of `remaining`: 0.1% of it, clamped.
    pub fn slack_for(&self, remaining: Duration) -> Duration {
        (remaining / 1000).clamp(self.min_slack, self.max_slack)
    }
}
