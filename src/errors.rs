use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Can't allocate memory")]
    NoMemory,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("Unknown device index: {0}")]
    InvalidDevice(usize),
    #[error("Unknown queue {queue} on device {device}")]
    InvalidQueue { device: usize, queue: usize },
    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(usize),
    #[error("Invalid packet entry {index}: offset {offset}, length {len}")]
    InvalidPacket { index: usize, offset: usize, len: usize },
    #[error("Invalid frame length: {0}")]
    InvalidFrame(usize),
    #[error("Buffer table full")]
    BufferTableFull,
    #[error("Ring table full")]
    RingTableFull,
    #[error("Device table full")]
    DeviceTableFull,
    #[error("Unknown buffer handle")]
    UnknownBuffer,
    #[error("Buffer too small: {len} bytes, {need} needed")]
    BufferTooSmall { len: usize, need: usize },
    #[error("Ring {device}/{queue} is already attached")]
    Busy { device: usize, queue: usize },
    #[error("Ring {device}/{queue} is not owned by this context")]
    NotOwner { device: usize, queue: usize },
    #[error("No ring attached")]
    NotAttached,
    #[error("Interrupted")]
    Interrupted,
    #[error("Bad DMA address: {0:#x}")]
    DmaFault(u64),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Sys(#[from] nix::errno::Errno),
}

pub type Result<T> = std::result::Result<T, Error>;
