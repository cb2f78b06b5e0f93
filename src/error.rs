use std::fmt::{self, Display};

/// NVMe status code type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCodeType {
    /// Generic command status
    Generic,
    /// Command specific status
    CommandSpecific,
    /// Media and data integrity errors
    MediaError,
    /// Path related errors
    PathError,
    /// Vendor specific
    VendorSpecific,
}

/// NVMe command status as reported in a completion entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode {
    /// Status code type
    pub sct: StatusCodeType,
    /// Status code value
    pub sc: u8,
}

impl StatusCode {
    /// Create a new status code.
    pub fn new(sct: StatusCodeType, sc: u8) -> Self {
        Self { sct, sc }
    }

    /// Parse from the raw 16-bit CQE status field (phase bit included).
    pub fn from_raw(status: u16) -> Self {
        let sc = ((status >> 1) & 0xFF) as u8;
        let sct_val = ((status >> 9) & 0x7) as u8;

        let sct = match sct_val {
            0 => StatusCodeType::Generic,
            1 => StatusCodeType::CommandSpecific,
            2 => StatusCodeType::MediaError,
            3 => StatusCodeType::PathError,
            7 => StatusCodeType::VendorSpecific,
            _ => StatusCodeType::Generic,
        };

        Self { sct, sc }
    }

    /// True if the command completed successfully.
    pub fn is_ok(&self) -> bool {
        self.sct == StatusCodeType::Generic && self.sc == 0
    }

    /// Get human-readable description.
    pub fn description(&self) -> &'static str {
        match (self.sct, self.sc) {
            // Generic command status
            (StatusCodeType::Generic, 0x00) => "Success",
            (StatusCodeType::Generic, 0x01) => "Invalid Command Opcode",
            (StatusCodeType::Generic, 0x02) => "Invalid Field in Command",
            (StatusCodeType::Generic, 0x03) => "Command ID Conflict",
            (StatusCodeType::Generic, 0x04) => "Data Transfer Error",
            (StatusCodeType::Generic, 0x06) => "Internal Error",
            (StatusCodeType::Generic, 0x07) => "Command Abort Requested",
            (StatusCodeType::Generic, 0x08) => "Command Aborted due to SQ Deletion",
            (StatusCodeType::Generic, 0x0B) => "Invalid Namespace or Format",
            (StatusCodeType::Generic, 0x0C) => "Command Sequence Error",
            (StatusCodeType::Generic, 0x13) => "PRP Offset Invalid",
            (StatusCodeType::Generic, 0x80) => "LBA Out of Range",
            (StatusCodeType::Generic, 0x81) => "Capacity Exceeded",
            (StatusCodeType::Generic, 0x82) => "Namespace Not Ready",

            // Command specific errors
            (StatusCodeType::CommandSpecific, 0x00) => "Completion Queue Invalid",
            (StatusCodeType::CommandSpecific, 0x01) => "Invalid Queue Identifier",
            (StatusCodeType::CommandSpecific, 0x02) => "Invalid Queue Size",
            (StatusCodeType::CommandSpecific, 0x0C) => "Invalid Queue Deletion",
            (StatusCodeType::CommandSpecific, 0x0D) => "Feature Identifier Not Saveable",
            (StatusCodeType::CommandSpecific, 0x0E) => "Feature Not Changeable",

            // Media and data integrity errors
            (StatusCodeType::MediaError, 0x80) => "Write Fault",
            (StatusCodeType::MediaError, 0x81) => "Unrecovered Read Error",
            (StatusCodeType::MediaError, 0x86) => "Access Denied",
            (StatusCodeType::MediaError, 0x87) => "Deallocated or Unwritten Logical Block",

            _ => "Unknown Error",
        }
    }
}

/// Contains all possible errors that can occur in the driver.
#[derive(Debug)]
pub enum Error {
    /// Malformed argument; the message names the offending one.
    BadArg(&'static str),
    /// PCI device name does not parse as `bb:dd.f[/nsid]`.
    InvalidDeviceName(String),
    /// DMA mapping or pool allocation failed.
    OutOfMemory,
    /// No free descriptor slot or submission ring entry on the queue.
    QueueFull,
    /// Buffer address is not a base recorded in the session pool.
    NotOwned,
    /// The device reported a non-zero completion status.
    Device(StatusCode),
    /// Poll budget exhausted; the command remains outstanding.
    Timeout,
    /// Controller does not advertise the requested capability.
    Unsupported(&'static str),
    /// Pass-through device binding failed.
    Bind,
    /// Insufficient privilege to claim the pass-through device.
    Perm,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadArg(what) => {
                write!(f, "invalid argument: {}", what)
            }
            Error::InvalidDeviceName(name) => {
                write!(f, "invalid PCI device name {:?} (expect bb:dd.f[/nsid])", name)
            }
            Error::OutOfMemory => {
                write!(f, "DMA memory allocation or mapping failed")
            }
            Error::QueueFull => {
                write!(f, "no free command slot on the queue")
            }
            Error::NotOwned => {
                write!(f, "buffer is not owned by the session memory pool")
            }
            Error::Device(code) => {
                write!(f, "device error: {}", code.description())
            }
            Error::Timeout => {
                write!(f, "command timed out")
            }
            Error::Unsupported(what) => {
                write!(f, "controller does not support {}", what)
            }
            Error::Bind => {
                write!(f, "failed to bind the pass-through device")
            }
            Error::Perm => {
                write!(f, "insufficient privilege for the pass-through device")
            }
        }
    }
}

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, Error>;
