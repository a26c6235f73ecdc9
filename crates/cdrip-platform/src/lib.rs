//! # cdrip Platform
//!
//! Platform-specific SCSI pass-through for optical drives.
//!
//! This crate is the only place that issues raw commands to hardware. It sends
//! MMC command descriptor blocks (CDBs) to a drive and hands back whatever the
//! drive transferred. Building and parsing those commands is the job of
//! `cdrip-core`; this crate only knows how to deliver them on each OS.
//!
//! ## Supported platforms
//!
//! - Linux: `SG_IO` on `/dev/sr*`
//! - Windows: `IOCTL_SCSI_PASS_THROUGH_DIRECT` on `\\.\D:`
//! - macOS: `DKIOCCD*` ioctls on `/dev/rdiskN`, translated from the MMC
//!   commands the ripper issues (MODE SENSE is not available)
//! - Elsewhere: every call returns [`PlatformError::NotSupported`]

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default timeout for a single MMC command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// SCSI status byte reported with a CHECK CONDITION
pub const STATUS_CHECK_CONDITION: u8 = 0x02;

/// Platform-specific errors
#[derive(Error, Debug)]
pub enum PlatformError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Device access denied (need elevated privileges or group membership)
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Device is busy or locked by another process
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Device not found, or it disappeared while open
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// No medium present or the drive is still spinning up
    #[error("Device not ready: {0}")]
    NotReady(String),

    /// The drive rejected or failed a command
    #[error("Command 0x{opcode:02x} failed with status 0x{status:02x}{}", sense_suffix(.sense))]
    CommandFailed {
        /// Operation code of the failed command
        opcode: u8,
        /// SCSI status byte
        status: u8,
        /// Decoded sense data, when the drive returned any
        sense: Option<SenseData>,
    },

    /// The host adapter or driver reported a transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation not supported on this platform
    #[error("Not supported: {0}")]
    NotSupported(String),
}

fn sense_suffix(sense: &Option<SenseData>) -> String {
    match sense {
        Some(s) => format!(" ({s})"),
        None => String::new(),
    }
}

impl PlatformError {
    /// Whether this error means the drive or its medium is gone, as opposed
    /// to a single command failing
    pub fn is_device_loss(&self) -> bool {
        match self {
            PlatformError::DeviceNotFound(_) | PlatformError::NotReady(_) => true,
            PlatformError::CommandFailed {
                sense: Some(sense), ..
            } => sense.is_not_ready(),
            _ => false,
        }
    }
}

/// Result type for platform operations
pub type Result<T> = std::result::Result<T, PlatformError>;

/// Sense key values from SPC
pub mod sense_key {
    /// No sense
    pub const NO_SENSE: u8 = 0x0;
    /// Recovered error
    pub const RECOVERED_ERROR: u8 = 0x1;
    /// Not ready
    pub const NOT_READY: u8 = 0x2;
    /// Medium error
    pub const MEDIUM_ERROR: u8 = 0x3;
    /// Hardware error
    pub const HARDWARE_ERROR: u8 = 0x4;
    /// Illegal request
    pub const ILLEGAL_REQUEST: u8 = 0x5;
    /// Unit attention
    pub const UNIT_ATTENTION: u8 = 0x6;
}

/// Decoded SCSI sense data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    /// Sense key
    pub key: u8,
    /// Additional sense code
    pub asc: u8,
    /// Additional sense code qualifier
    pub ascq: u8,
}

impl SenseData {
    /// Parse fixed-format (0x70/0x71) or descriptor-format (0x72/0x73) sense data
    pub fn parse(buffer: &[u8]) -> Option<Self> {
        let response_code = buffer.first()? & 0x7F;
        match response_code {
            0x70 | 0x71 if buffer.len() >= 14 => Some(Self {
                key: buffer[2] & 0x0F,
                asc: buffer[12],
                ascq: buffer[13],
            }),
            0x72 | 0x73 if buffer.len() >= 4 => Some(Self {
                key: buffer[1] & 0x0F,
                asc: buffer[2],
                ascq: buffer[3],
            }),
            _ => None,
        }
    }

    /// Drive not ready, including "medium not present" (ASC 0x3A)
    pub fn is_not_ready(&self) -> bool {
        self.key == sense_key::NOT_READY
    }

    /// Medium or hardware error while reading
    pub fn is_medium_error(&self) -> bool {
        self.key == sense_key::MEDIUM_ERROR || self.key == sense_key::HARDWARE_ERROR
    }

    /// Medium not present
    pub fn is_no_medium(&self) -> bool {
        self.key == sense_key::NOT_READY && self.asc == 0x3A
    }
}

impl fmt::Display for SenseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sense key 0x{:x}, asc 0x{:02x}, ascq 0x{:02x}",
            self.key, self.asc, self.ascq
        )
    }
}

/// Direction of the data phase of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    /// No data phase
    None,
    /// Drive to host
    FromDevice,
    /// Host to drive
    ToDevice,
}

/// Trait for SCSI pass-through on an open optical drive
pub trait ScsiTransport: Send {
    /// Path the transport was opened with
    fn path(&self) -> &str;

    /// Execute one command
    ///
    /// Returns the number of bytes actually transferred into (or out of)
    /// `buffer`, which may be less than its length.
    fn execute(
        &mut self,
        cdb: &[u8],
        direction: DataDirection,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;
}

/// An optical drive found on the system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpticalDrive {
    /// Path to pass to [`open_transport`]
    pub path: String,
    /// Vendor string reported by the drive
    pub vendor: Option<String>,
    /// Model string reported by the drive
    pub model: Option<String>,
}

impl OpticalDrive {
    /// Human readable name (vendor and model when available)
    pub fn display_name(&self) -> String {
        match (&self.vendor, &self.model) {
            (Some(v), Some(m)) => format!("{v} {m}"),
            (None, Some(m)) => m.clone(),
            (Some(v), None) => v.clone(),
            (None, None) => self.path.clone(),
        }
    }
}

/// Platform operations interface
pub trait PlatformOps {
    /// Open a drive for SCSI pass-through
    fn open_transport(path: &str) -> Result<Box<dyn ScsiTransport>>;

    /// Enumerate optical drives
    fn list_optical_drives() -> Result<Vec<OpticalDrive>>;
}

// Platform-specific implementations
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux;
        pub use linux::{list_optical_drives_in, LinuxPlatform as Platform, LinuxTransport};
    } else if #[cfg(target_os = "windows")] {
        mod windows;
        pub use windows::{WindowsPlatform as Platform, WindowsTransport};
    } else if #[cfg(target_os = "macos")] {
        mod macos;
        pub use macos::{MacOSPlatform as Platform, MacOSTransport};
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "windows", target_os = "macos"))] {
        /// Open a drive for SCSI pass-through
        pub fn open_transport(path: &str) -> Result<Box<dyn ScsiTransport>> {
            Platform::open_transport(path)
        }

        /// Enumerate optical drives
        pub fn list_optical_drives() -> Result<Vec<OpticalDrive>> {
            Platform::list_optical_drives()
        }
    } else {
        /// Open a drive (unsupported platform)
        pub fn open_transport(_path: &str) -> Result<Box<dyn ScsiTransport>> {
            Err(PlatformError::NotSupported("SCSI pass-through not available".to_string()))
        }

        /// Enumerate optical drives (unsupported platform)
        pub fn list_optical_drives() -> Result<Vec<OpticalDrive>> {
            Err(PlatformError::NotSupported("Drive enumeration not available".to_string()))
        }
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================
