//! Error types for the cdrip core library

use cdrip_platform::PlatformError;
use thiserror::Error;

/// Main error type for cdrip operations
#[derive(Error, Debug)]
pub enum Error {
    /// Drive absent, not ready, or no disc present
    #[error("Device error: {0}")]
    Device(String),

    /// A read command failed at the transport layer
    #[error("Read error at sector {sector}: {message}")]
    Read {
        /// First sector of the failed command
        sector: u64,
        /// Transport description of the failure
        message: String,
    },

    /// Any other pass-through failure
    #[error("Transport error: {0}")]
    Transport(PlatformError),

    /// IO error on a rip file or manifest
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Drive returned a response that could not be decoded
    #[error("Malformed {command} response: {message}")]
    MalformedResponse {
        /// Command whose response was rejected
        command: &'static str,
        /// What was wrong with it
        message: String,
    },

    /// Requested sectors lie outside the disc or the rip
    #[error("Invalid sector range: {0}")]
    InvalidRange(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Rip manifest could not be serialized or parsed
    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    /// Rip manifest parsed but is inconsistent
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// Jitter-correction backend failure
    #[error("Paranoia error: {0}")]
    Paranoia(String),

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the device itself is gone, as opposed to one read failing
    pub fn is_device_error(&self) -> bool {
        matches!(self, Error::Device(_))
    }

    /// Classify a pass-through failure of a read starting at `sector`
    pub fn from_read(sector: u64, err: PlatformError) -> Self {
        if err.is_device_loss() {
            Error::Device(err.to_string())
        } else {
            Error::Read {
                sector,
                message: err.to_string(),
            }
        }
    }
}

impl From<PlatformError> for Error {
    fn from(err: PlatformError) -> Self {
        if err.is_device_loss() {
            Error::Device(err.to_string())
        } else {
            Error::Transport(err)
        }
    }
}

/// Result type alias using the cdrip error type
pub type Result<T> = std::result::Result<T, Error>;
