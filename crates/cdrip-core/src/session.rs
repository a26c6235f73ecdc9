//! Rip sessions
//!
//! A [`RipSession`] rips a list of targets from one drive with one
//! [`RippingStrategy`]. Each target gets its own PCM file (and JSON manifest)
//! in the output directory; targets are ripped in order and a failed target
//! does not stop the ones after it. Once the session is stopped, the
//! remaining targets are reported as stopped without creating any files.
//!
//! # Example
//!
//! ```ignore
//! use cdrip_core::{CdDrive, OutputConfig, RipSession, RipTarget, RippingStrategy};
//!
//! let mut drive = CdDrive::open("/dev/sr0")?;
//! let targets = RipTarget::audio_tracks(drive.toc());
//! let session = RipSession::new(RippingStrategy::default(), OutputConfig::new("rips"))
//!     .with_targets(targets);
//!
//! let stopper = session.progress();
//! let report = session.run(&mut drive)?;
//! println!("{}: {} flagged sectors", report.status(), report.flagged_sectors());
//! ```

use crate::comparison::{ComparisonConfig, ComparisonRipper};
use crate::drive::AudioDrive;
use crate::error::{Error, Result};
use crate::paranoia::{OverlapVerifier, ParanoiaBackend, ParanoiaConfig, ParanoiaRipper};
use crate::progress::RipProgress;
use crate::rip::Rip;
use crate::sector::SectorRange;
use crate::toc::Toc;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Extension of ripped PCM files
pub const PCM_EXTENSION: &str = "pcm";

/// How sectors are extracted
#[derive(Debug, Clone, PartialEq)]
pub enum RippingStrategy {
    /// Repeated passes with consensus
    Comparison(ComparisonConfig),
    /// Jitter-corrected single pass
    Paranoia(ParanoiaConfig),
}

impl Default for RippingStrategy {
    fn default() -> Self {
        Self::Comparison(ComparisonConfig::default())
    }
}

impl RippingStrategy {
    /// Short name for logs and reports
    pub fn name(&self) -> &'static str {
        match self {
            Self::Comparison(_) => "comparison",
            Self::Paranoia(_) => "paranoia",
        }
    }

    /// Drive reads each sector is expected to need
    fn reads_per_sector(&self) -> u64 {
        match self {
            Self::Comparison(config) => u64::from(config.required_matches),
            Self::Paranoia(_) => 1,
        }
    }

    /// Whether output rips record per-sector digests
    fn hashes_output(&self) -> bool {
        match self {
            Self::Comparison(config) => config.use_hashes,
            Self::Paranoia(_) => false,
        }
    }
}

/// How a range ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RipStatus {
    /// Every sector was committed
    Completed,
    /// A stop was requested
    Stopped,
    /// The drive was lost or kept failing
    Fatal(String),
}

impl RipStatus {
    /// Whether every sector was committed
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for RipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Stopped => write!(f, "stopped"),
            Self::Fatal(reason) => write!(f, "fatal: {reason}"),
        }
    }
}

/// What a ripper reports for one range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeOutcome {
    /// Terminal state
    pub status: RipStatus,
    /// Sectors committed with the error flag set
    pub flagged_sectors: u64,
    /// Sectors that needed more reads than the minimum
    pub retried_sectors: u64,
    /// Sectors never committed because the range ended early (also flagged)
    pub unfinished_sectors: u64,
    /// Passes over the range
    pub passes: u32,
}

/// One range to rip and the file it goes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RipTarget {
    /// Sectors to rip
    pub range: SectorRange,
    /// File name inside the output directory
    pub file_name: String,
    /// Track the range covers, if it is a whole track
    pub track: Option<u8>,
}

impl RipTarget {
    /// Arbitrary range, named after its sectors
    pub fn new(range: SectorRange) -> Self {
        Self {
            range,
            file_name: format!("sectors-{}-{}.{PCM_EXTENSION}", range.first(), range.last()),
            track: None,
        }
    }

    /// Whole track `number`
    pub fn track(toc: &Toc, number: u8) -> Option<Self> {
        Some(Self {
            range: toc.track_range(number)?,
            file_name: format!("track{number:02}.{PCM_EXTENSION}"),
            track: Some(number),
        })
    }

    /// Every audio track on the disc
    pub fn audio_tracks(toc: &Toc) -> Vec<Self> {
        toc.audio_tracks()
            .filter_map(|track| Self::track(toc, track.number))
            .collect()
    }

    /// Override the output file name
    pub fn file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = name.into();
        self
    }
}

/// Where and how rip files are written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    /// Directory for PCM files and manifests
    pub directory: PathBuf,
    /// Write a JSON manifest next to each PCM file
    pub write_manifest: bool,
    /// Replace existing files
    pub overwrite: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            write_manifest: true,
            overwrite: false,
        }
    }
}

impl OutputConfig {
    /// Output into `directory`
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    /// Set manifest writing
    pub fn write_manifest(mut self, write: bool) -> Self {
        self.write_manifest = write;
        self
    }

    /// Set overwriting of existing files
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    fn path_for(&self, target: &RipTarget) -> PathBuf {
        self.directory.join(&target.file_name)
    }
}

/// Result of one target
#[derive(Debug, Clone, PartialEq)]
pub struct RangeReport {
    /// Sectors ripped
    pub range: SectorRange,
    /// Terminal state
    pub status: RipStatus,
    /// PCM file, `None` when the session stopped before the range began
    pub rip: Option<PathBuf>,
    /// Manifest file, if one was written
    pub manifest: Option<PathBuf>,
    /// Track number when the target was a whole track
    pub track: Option<u8>,
    /// ISRC reported by the drive for the track
    pub isrc: Option<String>,
    /// Sectors committed with the error flag set
    pub flagged_sectors: u64,
    /// Sectors that needed more reads than the minimum
    pub retried_sectors: u64,
    /// Sectors left unripped when the range ended early
    pub unfinished_sectors: u64,
    /// Passes over the range
    pub passes: u32,
    /// Time spent on the range
    pub elapsed: Duration,
}

impl RangeReport {
    /// Report for a target never started because the session was stopped
    fn skipped(target: &RipTarget) -> Self {
        Self {
            range: target.range,
            status: RipStatus::Stopped,
            rip: None,
            manifest: None,
            track: target.track,
            isrc: None,
            flagged_sectors: 0,
            retried_sectors: 0,
            unfinished_sectors: target.range.length(),
            passes: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Result of a whole session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    /// Drive the session read from
    pub device_path: String,
    /// Strategy name
    pub strategy: &'static str,
    /// Media catalog number, if the disc has one
    pub mcn: Option<String>,
    /// One report per target, in order
    pub ranges: Vec<RangeReport>,
    /// Time spent on the session
    pub elapsed: Duration,
}

impl SessionReport {
    /// Fatal if any range is fatal, else stopped if any range stopped
    pub fn status(&self) -> RipStatus {
        let mut status = RipStatus::Completed;
        for range in &self.ranges {
            match &range.status {
                RipStatus::Fatal(_) => return range.status.clone(),
                RipStatus::Stopped => status = RipStatus::Stopped,
                RipStatus::Completed => {}
            }
        }
        status
    }

    /// Flagged sectors across all ranges
    pub fn flagged_sectors(&self) -> u64 {
        self.ranges.iter().map(|r| r.flagged_sectors).sum()
    }

    /// Whether every range completed without a flagged sector
    pub fn is_accurate(&self) -> bool {
        self.status().is_completed() && self.flagged_sectors() == 0
    }
}

/// A configured rip of one or more targets
#[derive(Debug)]
pub struct RipSession {
    strategy: RippingStrategy,
    output: OutputConfig,
    targets: Vec<RipTarget>,
    progress: RipProgress,
}

impl RipSession {
    /// Create a session with no targets
    pub fn new(strategy: RippingStrategy, output: OutputConfig) -> Self {
        Self {
            strategy,
            output,
            targets: Vec::new(),
            progress: RipProgress::new(),
        }
    }

    /// Add targets
    pub fn with_targets(mut self, targets: impl IntoIterator<Item = RipTarget>) -> Self {
        self.targets.extend(targets);
        self
    }

    /// Add one target
    pub fn add_target(&mut self, target: RipTarget) {
        self.targets.push(target);
    }

    /// Use `progress` instead of a fresh handle (e.g. one with a callback)
    pub fn with_progress(mut self, progress: RipProgress) -> Self {
        self.progress = progress;
        self
    }

    /// Handle for watching or stopping the session
    pub fn progress(&self) -> RipProgress {
        self.progress.clone()
    }

    /// Strategy in use
    pub fn strategy(&self) -> &RippingStrategy {
        &self.strategy
    }

    /// Targets in ripping order
    pub fn targets(&self) -> &[RipTarget] {
        &self.targets
    }

    /// Rip every target on a worker thread
    pub fn spawn<D>(self, mut drive: D) -> JoinHandle<Result<SessionReport>>
    where
        D: AudioDrive + Send + 'static,
    {
        std::thread::spawn(move || self.run(&mut drive))
    }

    /// Rip every target
    ///
    /// Returns an error only when the session cannot start or an output file
    /// cannot be written; drive trouble is reported per range.
    pub fn run(&self, drive: &mut dyn AudioDrive) -> Result<SessionReport> {
        self.validate(drive.toc())?;
        fs::create_dir_all(&self.output.directory)?;

        let started = Instant::now();
        let total: u64 = self.targets.iter().map(|t| t.range.length()).sum();
        self.progress
            .begin(total.saturating_mul(self.strategy.reads_per_sector()));

        info!(
            device = drive.device_path(),
            strategy = self.strategy.name(),
            targets = self.targets.len(),
            sectors = total,
            "Starting rip session"
        );

        let mcn = drive.read_mcn().unwrap_or_else(|e| {
            warn!(error = %e, "Could not read media catalog number");
            None
        });
        let isrcs: Vec<Option<String>> = self
            .targets
            .iter()
            .map(|target| {
                let track = target.track?;
                drive.read_isrc(track).unwrap_or_else(|e| {
                    warn!(track, error = %e, "Could not read ISRC");
                    None
                })
            })
            .collect();
        let device_path = drive.device_path().to_string();

        let mut ranges = match &self.strategy {
            RippingStrategy::Comparison(config) => {
                let mut ripper = ComparisonRipper::new(drive, config.clone(), self.progress());
                self.rip_targets(|range, rip| ripper.rip_range(range, rip))?
            }
            RippingStrategy::Paranoia(config) => self.rip_paranoia(drive, config)?,
        };
        for (report, isrc) in ranges.iter_mut().zip(isrcs) {
            report.isrc = isrc;
        }

        let report = SessionReport {
            device_path,
            strategy: self.strategy.name(),
            mcn,
            ranges,
            elapsed: started.elapsed(),
        };
        info!(
            status = %report.status(),
            flagged = report.flagged_sectors(),
            elapsed_secs = report.elapsed.as_secs(),
            "Rip session finished"
        );
        Ok(report)
    }

    fn rip_paranoia(
        &self,
        drive: &mut dyn AudioDrive,
        config: &ParanoiaConfig,
    ) -> Result<Vec<RangeReport>> {
        match config.backend {
            ParanoiaBackend::Overlap => {
                let mut verifier = OverlapVerifier::new(drive, config.max_jitter);
                let mut ripper = ParanoiaRipper::new(&mut verifier, config.clone(), self.progress());
                self.rip_targets(|range, rip| ripper.rip_range(range, rip))
            }
            #[cfg(feature = "libcdio")]
            ParanoiaBackend::Libcdio => {
                // Second handle on the same device; `drive` is not read
                // again until this corrector is dropped
                let mut corrector =
                    crate::paranoia::LibcdioParanoia::open(drive.device_path(), config.maximum_retries)?;
                let mut ripper = ParanoiaRipper::new(&mut corrector, config.clone(), self.progress());
                self.rip_targets(|range, rip| ripper.rip_range(range, rip))
            }
            #[cfg(not(feature = "libcdio"))]
            ParanoiaBackend::Libcdio => Err(Error::InvalidConfig(
                "libcdio paranoia backend not compiled in (enable the `libcdio` feature)".to_string(),
            )),
        }
    }

    fn validate(&self, toc: &Toc) -> Result<()> {
        if self.targets.is_empty() {
            return Err(Error::InvalidConfig("no ranges to rip".to_string()));
        }
        let disc = toc.disc_range();
        for target in &self.targets {
            if !disc.contains_sector_range(&target.range) {
                return Err(Error::InvalidRange(format!(
                    "{} is outside the disc ({disc})",
                    target.range
                )));
            }
        }
        Ok(())
    }

    fn rip_targets<F>(&self, mut rip_range: F) -> Result<Vec<RangeReport>>
    where
        F: FnMut(&SectorRange, &mut Rip) -> Result<RangeOutcome>,
    {
        let mut reports = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            if self.progress.is_stopped() {
                info!(range = %target.range, "Session stopped, skipping range");
                reports.push(RangeReport::skipped(target));
                continue;
            }

            let started = Instant::now();
            let path = self.output.path_for(target);
            let mut rip = self.create_rip(&path, &target.range)?;

            let outcome = rip_range(&target.range, &mut rip)?;
            rip.sync()?;

            let manifest = if self.output.write_manifest {
                Some(rip.manifest().save()?)
            } else {
                None
            };

            if !outcome.status.is_completed() {
                warn!(range = %target.range, status = %outcome.status, "Range did not complete");
            }
            reports.push(RangeReport {
                range: target.range,
                status: outcome.status,
                rip: Some(path),
                manifest,
                track: target.track,
                isrc: None,
                flagged_sectors: outcome.flagged_sectors,
                retried_sectors: outcome.retried_sectors,
                unfinished_sectors: outcome.unfinished_sectors,
                passes: outcome.passes,
                elapsed: started.elapsed(),
            });
        }
        Ok(reports)
    }

    fn create_rip(&self, path: &Path, range: &SectorRange) -> Result<Rip> {
        let file = if self.output.overwrite {
            fs::File::create(path)?
        } else {
            fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)?
        };
        file.set_len(range.byte_size())?;
        drop(file);
        Rip::open(path, *range, self.strategy.hashes_output())
    }
}
