//! A user-space NVMe block driver.
//!
//! The driver binds an NVMe controller through an IOMMU-backed
//! pass-through facility and drives its queues directly: DMA buffers,
//! per-queue submission/completion rings, and polled completions, with no
//! kernel block layer in the path.

mod admin;
mod clock;
mod cmd;
mod device;
mod error;
mod iod;
mod ioqueue;
mod memory;
mod ns;
mod passthru;
mod queues;
mod regs;

pub use device::{open, open_with};
pub use error::{Error, Result, StatusCode, StatusCodeType};
pub use iod::Iod;
pub use memory::DmaBuf;
pub use ns::{Namespace, NsInfo, Polled};
pub use passthru::{DeviceId, Passthru, PciAddr};
