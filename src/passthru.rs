//! Contract with the IOMMU-backed pass-through facility.
//!
//! The driver never talks to VFIO or any other kernel interface itself.
//! Everything it needs from the outside world is the small operation set
//! below: claim a PCI function, expose a BAR for register access, and map
//! host memory so the device can reach it by bus address. Tests satisfy
//! the same contract with an in-memory controller model.

use std::fmt::{self, Display};
use std::str::FromStr;

use crate::error::{Error, Result};

/// A PCI function in `bb:dd.f` notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PciAddr {
    pub bus: u8,
    pub dev: u8,
    pub func: u8,
}

impl PciAddr {
    /// Packed `(bus << 16) | (dev << 8) | func` form used as registry key.
    pub fn key(&self) -> u32 {
        ((self.bus as u32) << 16) | ((self.dev as u32) << 8) | self.func as u32
    }
}

impl Display for PciAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.dev, self.func)
    }
}

/// A device name as accepted by `open`: PCI function plus namespace id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId {
    pub pci: PciAddr,
    pub nsid: u32,
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pci, self.nsid)
    }
}

impl FromStr for DeviceId {
    type Err = Error;

    /// Parse `bb:dd.f[/nsid]`, lower-case hex without `0x` prefix for the
    /// PCI triple. The namespace id is hexadecimal as well (an optional
    /// `0x` prefix is tolerated) and defaults to 1.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::InvalidDeviceName(s.to_string());

        let (triple, nsid) = match s.split_once('/') {
            Some((triple, rest)) => {
                let rest = rest.strip_prefix("0x").unwrap_or(rest);
                let nsid = u32::from_str_radix(rest, 16).map_err(|_| bad())?;
                (triple, nsid)
            }
            None => (s, 1),
        };
        if nsid == 0 {
            return Err(bad());
        }

        let (bus, rest) = triple.split_once(':').ok_or_else(bad)?;
        let (dev, func) = rest.split_once('.').ok_or_else(bad)?;
        if [bus, dev, func].iter().any(|part| {
            part.is_empty() || part.chars().any(|c| c.is_ascii_uppercase())
        }) {
            return Err(bad());
        }

        Ok(Self {
            pci: PciAddr {
                bus: u8::from_str_radix(bus, 16).map_err(|_| bad())?,
                dev: u8::from_str_radix(dev, 16).map_err(|_| bad())?,
                func: u8::from_str_radix(func, 16).map_err(|_| bad())?,
            },
            nsid,
        })
    }
}

/// Operations the pass-through facility must provide.
///
/// Implementations bind the IOMMU container for one PCI function and keep
/// it bound for the lifetime of the value. All mappings are page-aligned
/// in both address spaces; a returned IOVA stays valid until `unmap`.
pub trait Passthru: Send + Sync {
    /// Claim the device and bind its IOMMU container.
    fn open(pci: PciAddr) -> Result<Self>
    where
        Self: Sized;

    /// Map the given BAR and return its base in this address space.
    fn mmio_map(&self, bar: u32) -> Result<*mut u8>;

    /// Allow the device to master the bus (issue DMA).
    fn enable_bus_master(&self) -> Result<()>;

    /// Map `len` bytes at `vaddr` for device access, returning the IOVA.
    fn map(&self, vaddr: usize, len: usize) -> Result<u64>;

    /// Drop the mapping previously established at `vaddr`.
    fn unmap(&self, vaddr: usize) -> Result<()>;
}
