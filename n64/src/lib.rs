//! The Nintendo 64 around its CPU: the physical memory map, main memory, the MIPS interface
//! and the loop that interleaves guest code with device events.

pub mod device;
pub mod memory;
pub mod mi;
pub mod rdram;

pub use device::{Device, SystemBus};

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("{len:#x} bytes at {address:#010x} run past the end of memory")]
    ImageTooLarge { address: u32, len: usize },
    #[error("address {0:#010x} is not word aligned")]
    Misaligned(u32),
}
