pub mod api;
pub mod chunk;
pub mod config;
pub mod context;
pub mod device;
pub mod errors;
pub mod gate;
pub mod hint;
pub mod hw;
pub mod pool;
pub mod ring;
mod rx;
pub mod select;
pub mod shm;
mod tx;

pub use chunk::{Chunk, ChunkBuf, PacketInfo, QueueRef};
pub use config::{EngineConfig, RingConfig};
pub use context::{Canceller, Context, HandleStats};
pub use device::{DeviceInfo, DeviceSpec, Registry, SoftBed};
pub use errors::{Error, Result};
pub use hw::desc::ChecksumVerdict;
pub use select::{DeviceMask, Event, Readiness, Timeout};
pub use shm::BufferHandle;
