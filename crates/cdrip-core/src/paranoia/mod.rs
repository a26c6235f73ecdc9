//! Jitter-corrected ripping
//!
//! [`ParanoiaRipper`] asks a [`JitterCorrector`] for one sector at a time.
//! The corrector decides whether the audio it returns is trustworthy; the
//! ripper retries untrusted sectors and, when the retry budget runs out,
//! commits the copy it saw most often with the error flag set.
//!
//! Two correctors exist: [`OverlapVerifier`], built on any [`AudioDrive`],
//! and `LibcdioParanoia` behind the `libcdio` feature.
//!
//! [`AudioDrive`]: crate::drive::AudioDrive

mod overlap;

#[cfg(feature = "libcdio")]
mod libcdio;

pub use overlap::OverlapVerifier;

#[cfg(feature = "libcdio")]
pub use libcdio::LibcdioParanoia;

use crate::comparison::{DEFAULT_FATAL_ERROR_THRESHOLD, DEFAULT_MAXIMUM_RETRIES};
use crate::error::{Error, Result};
use crate::progress::RipProgress;
use crate::rip::Rip;
use crate::sector::{SectorRange, CDDA_SECTOR_SIZE, SAMPLES_PER_SECTOR};
use crate::session::{RangeOutcome, RipStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Default jitter search window, in samples (one sector)
pub const DEFAULT_MAX_JITTER: u32 = SAMPLES_PER_SECTOR as u32;

/// Which corrector the paranoia strategy uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParanoiaBackend {
    /// Built-in overlap verification on the open drive
    #[default]
    Overlap,
    /// libcdio-paranoia (requires the `libcdio` feature)
    ///
    /// libcdio opens the device a second time by path. The drive handle the
    /// session was given stays open but idle until the range finishes; both
    /// opens are non-exclusive on every supported platform.
    Libcdio,
}

/// Configuration for paranoia ripping
#[derive(Debug, Clone, PartialEq)]
pub struct ParanoiaConfig {
    /// Extra reads of an unverified sector before committing it flagged
    pub maximum_retries: u32,

    /// Largest drift searched when aligning overlapping reads, in samples
    pub max_jitter: u32,

    /// Consecutive failed reads that make the range fatal
    pub fatal_error_threshold: u32,

    /// Corrector implementation
    pub backend: ParanoiaBackend,
}

impl Default for ParanoiaConfig {
    fn default() -> Self {
        Self {
            maximum_retries: DEFAULT_MAXIMUM_RETRIES,
            max_jitter: DEFAULT_MAX_JITTER,
            fatal_error_threshold: DEFAULT_FATAL_ERROR_THRESHOLD,
            backend: ParanoiaBackend::default(),
        }
    }
}

impl ParanoiaConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum retries
    pub fn maximum_retries(mut self, retries: u32) -> Self {
        self.maximum_retries = retries;
        self
    }

    /// Set the jitter window (clamped to one sector)
    pub fn max_jitter(mut self, samples: u32) -> Self {
        self.max_jitter = samples.min(SAMPLES_PER_SECTOR as u32);
        self
    }

    /// Set fatal error threshold (at least 1)
    pub fn fatal_error_threshold(mut self, threshold: u32) -> Self {
        self.fatal_error_threshold = threshold.max(1);
        self
    }

    /// Set the corrector backend
    pub fn backend(mut self, backend: ParanoiaBackend) -> Self {
        self.backend = backend;
        self
    }
}

/// Outcome of one corrected read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectorVerdict {
    /// Audio matched across reads without adjustment
    Verified(Vec<u8>),
    /// Audio matched after the corrector repaired or realigned it
    Corrected(Vec<u8>),
    /// The corrector could not confirm the audio
    Unverified(Vec<u8>),
}

impl SectorVerdict {
    /// Whether the audio can be committed without a flag
    pub fn is_trusted(&self) -> bool {
        !matches!(self, Self::Unverified(_))
    }

    /// The audio carried by the verdict
    pub fn data(&self) -> &[u8] {
        match self {
            Self::Verified(data) | Self::Corrected(data) | Self::Unverified(data) => data,
        }
    }

    /// Take the audio out of the verdict
    pub fn into_data(self) -> Vec<u8> {
        match self {
            Self::Verified(data) | Self::Corrected(data) | Self::Unverified(data) => data,
        }
    }
}

/// Sector-at-a-time reader that compensates for drive jitter
#[cfg_attr(test, mockall::automock)]
pub trait JitterCorrector {
    /// Position the corrector so the next read returns `sector`
    fn seek(&mut self, sector: u64) -> Result<()>;

    /// Read the sector at the current position and advance by one
    fn read_sector(&mut self) -> Result<SectorVerdict>;
}

/// Distinct copies of one sector and how often each was seen
#[derive(Debug, Default)]
struct CopyTally {
    copies: Vec<(Vec<u8>, u32)>,
}

impl CopyTally {
    fn add(&mut self, data: Vec<u8>) {
        match self.copies.iter_mut().find(|(copy, _)| *copy == data) {
            Some((_, seen)) => *seen += 1,
            None => self.copies.push((data, 1)),
        }
    }

    /// Most frequent copy; the earliest wins a tie
    fn most_frequent(&self) -> Option<&[u8]> {
        let mut best: Option<&(Vec<u8>, u32)> = None;
        for entry in &self.copies {
            if best.map_or(true, |b| entry.1 > b.1) {
                best = Some(entry);
            }
        }
        best.map(|(copy, _)| copy.as_slice())
    }
}

/// Paranoia ripper over a borrowed corrector
pub struct ParanoiaRipper<'a> {
    corrector: &'a mut dyn JitterCorrector,
    config: ParanoiaConfig,
    progress: RipProgress,
}

impl<'a> ParanoiaRipper<'a> {
    /// Create a ripper
    pub fn new(corrector: &'a mut dyn JitterCorrector, config: ParanoiaConfig, progress: RipProgress) -> Self {
        Self {
            corrector,
            config,
            progress,
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &ParanoiaConfig {
        &self.config
    }

    /// Rip `range` into `output`, one sector at a time
    ///
    /// Status and error handling match
    /// [`ComparisonRipper::rip_range`](crate::comparison::ComparisonRipper::rip_range).
    pub fn rip_range(&mut self, range: &SectorRange, output: &mut Rip) -> Result<RangeOutcome> {
        if !output.contains_sector_range(range) {
            return Err(Error::InvalidRange(format!(
                "{range} outside output rip {}",
                output.range()
            )));
        }

        info!(
            range = %range,
            maximum_retries = self.config.maximum_retries,
            "Starting paranoia rip"
        );

        let mut outcome = RangeOutcome {
            status: RipStatus::Completed,
            flagged_sectors: 0,
            retried_sectors: 0,
            unfinished_sectors: 0,
            passes: 1,
        };
        let mut consecutive_failures = 0u32;

        for sector in range.iter() {
            match self.rip_sector(sector, output, &mut consecutive_failures)? {
                SectorResult::Committed { flagged, attempts } => {
                    outcome.flagged_sectors += u64::from(flagged);
                    outcome.retried_sectors += u64::from(attempts > 1);
                }
                SectorResult::Ended(status) => {
                    let remaining = SectorRange::new(sector, range.last());
                    for pending in remaining.iter() {
                        output.set_error_flag(true, pending);
                    }
                    outcome.unfinished_sectors = remaining.length();
                    outcome.status = status;
                    break;
                }
            }
        }

        info!(
            range = %range,
            status = %outcome.status,
            flagged = outcome.flagged_sectors,
            retried = outcome.retried_sectors,
            "Paranoia rip finished"
        );
        Ok(outcome)
    }

    fn rip_sector(
        &mut self,
        sector: u64,
        output: &mut Rip,
        consecutive_failures: &mut u32,
    ) -> Result<SectorResult> {
        let mut tally = CopyTally::default();
        let mut attempts = 0u32;

        loop {
            if self.progress.is_stopped() {
                return Ok(SectorResult::Ended(RipStatus::Stopped));
            }

            let read = self
                .corrector
                .seek(sector)
                .and_then(|()| self.corrector.read_sector());
            attempts += 1;
            self.progress.record_sectors(1);

            match read {
                Ok(verdict) if verdict.is_trusted() => {
                    *consecutive_failures = 0;
                    output.set_bytes(verdict.data(), sector)?;
                    output.set_error_flag(false, sector);
                    return Ok(SectorResult::Committed {
                        flagged: false,
                        attempts,
                    });
                }
                Ok(verdict) => {
                    *consecutive_failures = 0;
                    debug!(sector, attempts, "Sector unverified");
                    tally.add(verdict.into_data());
                }
                Err(e) if e.is_device_error() => {
                    error!(sector, error = %e, "Drive lost during rip");
                    return Ok(SectorResult::Ended(RipStatus::Fatal(e.to_string())));
                }
                Err(e) => {
                    debug!(sector, error = %e, "Read failed");
                    *consecutive_failures += 1;
                    if *consecutive_failures >= self.config.fatal_error_threshold {
                        let reason = format!(
                            "{consecutive_failures} consecutive read failures ending at sector {sector}"
                        );
                        error!(%reason, "Abandoning range");
                        return Ok(SectorResult::Ended(RipStatus::Fatal(reason)));
                    }
                }
            }

            if attempts > self.config.maximum_retries {
                warn!(
                    sector,
                    attempts,
                    copies = tally.copies.len(),
                    "Sector never verified, committing most frequent copy with error flag"
                );
                match tally.most_frequent() {
                    Some(data) => output.set_bytes(data, sector)?,
                    None => output.set_bytes(&[0u8; CDDA_SECTOR_SIZE], sector)?,
                }
                output.set_error_flag(true, sector);
                return Ok(SectorResult::Committed {
                    flagged: true,
                    attempts,
                });
            }
        }
    }
}

enum SectorResult {
    Committed { flagged: bool, attempts: u32 },
    Ended(RipStatus),
}
