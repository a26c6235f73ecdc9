//! # cdrip Core
//!
//! Core library for bit-exact audio extraction from optical discs.
//!
//! ## Modules
//!
//! - `sector`: Sector ranges and CDDA layout constants
//! - `bit_array`: Packed per-sector error flags
//! - `toc`: Sessions, tracks and lead-outs
//! - `mmc`: MMC command builders and response parsers
//! - `drive`: The `AudioDrive` trait and the MMC drive `CdDrive`
//! - `rip`: File-backed capture of a sector range with error flags and digests
//! - `manifest`: JSON sidecar describing a finished rip
//! - `comparison`: Consensus ripping over repeated passes
//! - `paranoia`: Jitter-corrected ripping
//! - `session`: Strategies, targets, output files and reports
//! - `progress`: Shared progress counters and stop flag
//! - `error`: Error types and result aliases
//! - `config`: Runtime configuration
//! - `settings`: Persistent user settings from configuration file
//!
//! ## Example
//!
//! ```ignore
//! use cdrip_core::{Config, RipTarget, Settings};
//!
//! let config = Settings::load().config();
//! let mut drive = config.open_drive("/dev/sr0")?;
//!
//! let session = config.session(RipTarget::audio_tracks(drive.toc()));
//! let report = session.run(&mut drive)?;
//! for range in report.ranges.iter().filter(|r| r.rip.is_some()) {
//!     println!("{}: {} ({} flagged)", range.range, range.status, range.flagged_sectors);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bit_array;
pub mod comparison;
pub mod config;
pub mod drive;
pub mod error;
pub mod manifest;
pub mod mmc;
pub mod paranoia;
pub mod progress;
pub mod rip;
pub mod sector;
pub mod session;
pub mod settings;
pub mod toc;

pub use bit_array::BitArray;
pub use comparison::{
    ComparisonConfig, ComparisonRipper, DEFAULT_FATAL_ERROR_THRESHOLD, DEFAULT_MAXIMUM_RETRIES,
    DEFAULT_REQUIRED_MATCHES, DEFAULT_SECTORS_PER_READ,
};
pub use config::Config;
pub use drive::{AudioDrive, CdDrive, DriveOptions, DEFAULT_CACHE_SIZE, MAX_SECTORS_PER_COMMAND};
pub use error::{Error, Result};
pub use manifest::{RipManifest, MANIFEST_VERSION};
pub use mmc::{DriveCapabilities, QSubchannel, ReadFormat};
pub use paranoia::{
    JitterCorrector, OverlapVerifier, ParanoiaBackend, ParanoiaConfig, ParanoiaRipper,
    SectorVerdict, DEFAULT_MAX_JITTER,
};
#[cfg(feature = "libcdio")]
pub use paranoia::LibcdioParanoia;
pub use progress::{format_duration, ProgressCallback, ProgressSnapshot, RipProgress};
pub use rip::{sector_digest, Rip, SectorDigest};
pub use sector::{
    SectorRange, BYTES_PER_SAMPLE, CDDA_SECTOR_SIZE, ERROR_FLAGS_SIZE, Q_SUBCHANNEL_SIZE,
    SAMPLES_PER_SECTOR,
};
pub use session::{
    OutputConfig, RangeOutcome, RangeReport, RipSession, RipStatus, RipTarget, RippingStrategy,
    SessionReport,
};
pub use settings::{
    ComparisonSettings, DriveSettings, OutputSettings, ParanoiaSettings, Settings, SettingsError,
    StrategyKind,
};
pub use toc::{SessionDescriptor, Toc, TrackDescriptor};

pub use cdrip_platform::{list_optical_drives, OpticalDrive};
