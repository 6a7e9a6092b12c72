//! Backend-agnostic packet I/O contract.
//!
//! A stack drives one backend instance per worker thread: it links the
//! devices, pulls batches with `recv_pkts`/`get_rptr`, stages frames with
//! `get_wptr` and flushes them with `send_pkts`, and parks in `select` when
//! there is nothing to do.

use std::fmt::Debug;

use crate::errors::Result;

pub mod psio;

pub use psio::{PsioBackend, PsioFlags};

/// Trait for backend-specific configuration flags.
pub trait Flags: Clone + Debug {}

pub trait IoBackend: Send + Sized {
    /// What the backend is opened on.
    type Port;
    type Flags: Flags;

    fn init_handle(port: Self::Port, flags: Self::Flags) -> Result<Self>;

    /// Claims this worker's queue on every configured device. Returns whether
    /// at least one device has such a queue.
    fn link_devices(&mut self) -> Result<bool>;

    /// Receives one batch from `device`. Returns its size.
    fn recv_pkts(&mut self, device: usize) -> Result<usize>;

    /// Packet `index` of the last batch received from `device`.
    fn get_rptr(&self, device: usize, index: usize) -> Option<&[u8]>;

    /// Reserves room for a `len`-byte frame to be sent on `device`.
    fn get_wptr(&mut self, device: usize, len: usize) -> Option<&mut [u8]>;

    /// Flushes the frames staged for `device`. Returns how many went out.
    fn send_pkts(&mut self, device: usize) -> Result<usize>;

    /// Hands a frame the stack does not want to the conventional path.
    fn release_pkt(&mut self, device: usize, frame: &[u8]) -> Result<()>;

    /// Sleeps until a device the previous round left idle becomes ready.
    fn select(&mut self) -> Result<()>;

    fn destroy_handle(self) {}
}
