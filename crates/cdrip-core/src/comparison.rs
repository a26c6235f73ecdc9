//! Consensus ripping by repeated comparison
//!
//! Each pass reads every sector still pending into a scratch rip. A sector is
//! committed to the output once `required_matches` clean copies agree. A
//! sector that keeps disagreeing is committed after `maximum_retries` extra
//! reads using its most common copy, with its error flag set.
//!
//! The drive cache is flushed before every pass after the first, so no pass
//! can be served from data buffered by the previous one.

use crate::drive::{readable_area, AudioDrive, MAX_SECTORS_PER_COMMAND};
use crate::error::{Error, Result};
use crate::mmc::ReadFormat;
use crate::progress::RipProgress;
use crate::rip::{sector_digest, Rip};
use crate::sector::{SectorRange, BYTES_PER_SAMPLE, CDDA_SECTOR_SIZE};
use crate::session::{RangeOutcome, RipStatus};
use std::cmp::Reverse;
use std::ops::Range;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

/// Default number of agreeing clean copies needed to commit a sector
pub const DEFAULT_REQUIRED_MATCHES: u32 = 2;

/// Default number of reads allowed beyond `required_matches`
pub const DEFAULT_MAXIMUM_RETRIES: u32 = 20;

/// Default number of sectors requested per drive read
pub const DEFAULT_SECTORS_PER_READ: u32 = 24;

/// Default number of consecutive failed reads that abandons a range
pub const DEFAULT_FATAL_ERROR_THRESHOLD: u32 = 64;

/// Configuration for comparison ripping
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonConfig {
    /// Agreeing clean copies needed to commit a sector
    pub required_matches: u32,

    /// Reads allowed beyond `required_matches` before giving up on a sector
    pub maximum_retries: u32,

    /// Compare copies by SHA-256 digest instead of byte for byte
    pub use_hashes: bool,

    /// Read C2 error pointers and discount copies they mark
    pub use_c2: bool,

    /// Read offset of the drive, in samples
    pub drive_offset: i32,

    /// Sectors requested per drive read
    pub sectors_per_read: u32,

    /// Consecutive failed reads that make the range fatal
    pub fatal_error_threshold: u32,

    /// Directory for per-pass scratch files (system temp dir if unset)
    pub work_dir: Option<PathBuf>,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            required_matches: DEFAULT_REQUIRED_MATCHES,
            maximum_retries: DEFAULT_MAXIMUM_RETRIES,
            use_hashes: true,
            use_c2: false,
            drive_offset: 0,
            sectors_per_read: DEFAULT_SECTORS_PER_READ,
            fatal_error_threshold: DEFAULT_FATAL_ERROR_THRESHOLD,
            work_dir: None,
        }
    }
}

impl ComparisonConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set required matches (at least 1)
    pub fn required_matches(mut self, matches: u32) -> Self {
        self.required_matches = matches.max(1);
        self
    }

    /// Set maximum retries
    pub fn maximum_retries(mut self, retries: u32) -> Self {
        self.maximum_retries = retries;
        self
    }

    /// Set digest comparison
    pub fn use_hashes(mut self, use_hashes: bool) -> Self {
        self.use_hashes = use_hashes;
        self
    }

    /// Set C2 error pointer use
    pub fn use_c2(mut self, use_c2: bool) -> Self {
        self.use_c2 = use_c2;
        self
    }

    /// Set drive read offset in samples
    pub fn drive_offset(mut self, samples: i32) -> Self {
        self.drive_offset = samples;
        self
    }

    /// Set sectors per read (clamped to valid range)
    pub fn sectors_per_read(mut self, sectors: u32) -> Self {
        self.sectors_per_read = sectors.clamp(1, MAX_SECTORS_PER_COMMAND);
        self
    }

    /// Set fatal error threshold (at least 1)
    pub fn fatal_error_threshold(mut self, threshold: u32) -> Self {
        self.fatal_error_threshold = threshold.max(1);
        self
    }

    /// Set the scratch directory
    pub fn work_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.work_dir = dir;
        self
    }

    /// Reads after which an undecided sector is committed flagged
    pub fn attempt_limit(&self) -> u32 {
        self.required_matches.saturating_add(self.maximum_retries)
    }
}

/// A distinct copy of one sector seen in some pass
#[derive(Debug)]
struct Candidate {
    /// Pass whose scratch rip holds the copy
    pass: usize,
    clean: u32,
    flagged: u32,
}

#[derive(Debug, Default)]
struct SectorState {
    candidates: Vec<Candidate>,
    attempts: u32,
    committed: bool,
}

struct PassFile {
    rip: Rip,
    _file: NamedTempFile,
}

/// Bookkeeping for one range
struct RangeRun {
    range: SectorRange,
    states: Vec<SectorState>,
    passes: Vec<PassFile>,
    flagged: u64,
    consecutive_failures: u32,
}

impl RangeRun {
    fn new(range: SectorRange) -> Self {
        Self {
            range,
            states: (0..range.length()).map(|_| SectorState::default()).collect(),
            passes: Vec::new(),
            flagged: 0,
            consecutive_failures: 0,
        }
    }

    /// Contiguous spans of sectors not yet committed
    fn pending_spans(&self) -> Vec<SectorRange> {
        let mut spans = Vec::new();
        let mut start: Option<u64> = None;
        for (i, state) in self.states.iter().enumerate() {
            let sector = self.range.sector_for_index(i as u64);
            match (state.committed, start) {
                (false, None) => start = Some(sector),
                (true, Some(first)) => {
                    spans.push(SectorRange::new(first, sector - 1));
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(first) = start {
            spans.push(SectorRange::new(first, self.range.last()));
        }
        spans
    }

    /// Account for one read attempt of `sector`
    ///
    /// `copy` is the audio read and whether C2 pointers marked it, or `None`
    /// if the read failed.
    fn record_copy(
        &mut self,
        sector: u64,
        copy: Option<(&[u8], bool)>,
        output: &mut Rip,
        config: &ComparisonConfig,
    ) -> Result<()> {
        let index = self.range.index_for_sector(sector) as usize;
        let pass = self.passes.len() - 1;
        let Self {
            states,
            passes,
            flagged: flagged_total,
            ..
        } = self;
        let state = &mut states[index];
        if state.committed {
            return Ok(());
        }
        state.attempts += 1;

        if let Some((data, flagged)) = copy {
            let digest = config.use_hashes.then(|| sector_digest(data));
            let mut matched = None;
            for (i, candidate) in state.candidates.iter().enumerate() {
                let stored = &passes[candidate.pass].rip;
                let same = match &digest {
                    Some(digest) => stored.sector_has_hash(sector, digest),
                    None => stored.sector_matches(sector, data)?,
                };
                if same {
                    matched = Some(i);
                    break;
                }
            }

            let candidate = match matched {
                Some(i) => &mut state.candidates[i],
                None => {
                    passes[pass].rip.set_bytes(data, sector)?;
                    state.candidates.push(Candidate {
                        pass,
                        clean: 0,
                        flagged: 0,
                    });
                    let last = state.candidates.len() - 1;
                    &mut state.candidates[last]
                }
            };
            if flagged {
                candidate.flagged += 1;
            } else {
                candidate.clean += 1;
            }

            if candidate.clean >= config.required_matches {
                output.set_bytes(data, sector)?;
                output.set_error_flag(false, sector);
                state.committed = true;
                state.candidates.clear();
                return Ok(());
            }
        }

        if state.attempts >= config.attempt_limit() {
            let best = state
                .candidates
                .iter()
                .max_by_key(|c| (c.clean + c.flagged, c.clean, Reverse(c.pass)));
            let data = match best {
                Some(c) => passes[c.pass].rip.data_for_sector(sector)?,
                None => vec![0u8; CDDA_SECTOR_SIZE],
            };
            warn!(
                sector,
                attempts = state.attempts,
                copies = state.candidates.len(),
                "No consensus, committing most frequent copy with error flag"
            );
            output.set_bytes(&data, sector)?;
            output.set_error_flag(true, sector);
            state.committed = true;
            state.candidates.clear();
            *flagged_total += 1;
        }
        Ok(())
    }

    /// Flag whatever was never committed and summarize
    fn finish(self, output: &mut Rip, status: RipStatus, config: &ComparisonConfig) -> RangeOutcome {
        let mut unfinished = 0;
        for (i, state) in self.states.iter().enumerate() {
            if !state.committed {
                output.set_error_flag(true, self.range.sector_for_index(i as u64));
                unfinished += 1;
            }
        }
        RangeOutcome {
            status,
            flagged_sectors: self.flagged,
            retried_sectors: self
                .states
                .iter()
                .filter(|s| s.attempts > config.required_matches)
                .count() as u64,
            unfinished_sectors: unfinished,
            passes: self.passes.len() as u32,
        }
    }
}

/// Whether any C2 bit covering `bytes` of a sector is set
///
/// Bits are MSB first: bit 7 of byte 0 covers audio byte 0.
fn c2_marks(block: &[u8], bytes: Range<usize>) -> bool {
    bytes.into_iter().any(|b| block[b / 8] & (0x80 >> (b % 8)) != 0)
}

/// Comparison ripper over a borrowed drive
pub struct ComparisonRipper<'a> {
    drive: &'a mut dyn AudioDrive,
    config: ComparisonConfig,
    progress: RipProgress,
    device: Vec<u8>,
    audio: Vec<u8>,
    flags: Vec<bool>,
}

impl<'a> ComparisonRipper<'a> {
    /// Create a ripper
    pub fn new(drive: &'a mut dyn AudioDrive, config: ComparisonConfig, progress: RipProgress) -> Self {
        Self {
            drive,
            config,
            progress,
            device: Vec::new(),
            audio: Vec::new(),
            flags: Vec::new(),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &ComparisonConfig {
        &self.config
    }

    /// Rip `range` into `output`
    ///
    /// Device loss, too many consecutive read failures and cancellation end
    /// the range with a non-completed status; sectors already committed stay
    /// in `output` and everything else is flagged. Only I/O failures on rip
    /// files are returned as errors.
    pub fn rip_range(&mut self, range: &SectorRange, output: &mut Rip) -> Result<RangeOutcome> {
        if !output.contains_sector_range(range) {
            return Err(Error::InvalidRange(format!(
                "{range} outside output rip {}",
                output.range()
            )));
        }

        info!(
            range = %range,
            required_matches = self.config.required_matches,
            use_hashes = self.config.use_hashes,
            use_c2 = self.config.use_c2,
            drive_offset = self.config.drive_offset,
            "Starting comparison rip"
        );

        let readable = readable_area(self.drive.toc(), range);
        let mut run = RangeRun::new(*range);
        let status = self.run_passes(&mut run, output, &readable)?;
        let outcome = run.finish(output, status, &self.config);

        info!(
            range = %range,
            status = %outcome.status,
            passes = outcome.passes,
            flagged = outcome.flagged_sectors,
            retried = outcome.retried_sectors,
            "Comparison rip finished"
        );
        Ok(outcome)
    }

    fn run_passes(
        &mut self,
        run: &mut RangeRun,
        output: &mut Rip,
        readable: &SectorRange,
    ) -> Result<RipStatus> {
        loop {
            let pending = run.pending_spans();
            if pending.is_empty() {
                return Ok(RipStatus::Completed);
            }
            if self.progress.is_stopped() {
                return Ok(RipStatus::Stopped);
            }

            if !run.passes.is_empty() {
                match self.drive.clear_cache(&run.range, &self.progress) {
                    Ok(()) => {}
                    Err(Error::Cancelled) => return Ok(RipStatus::Stopped),
                    Err(e) if e.is_device_error() => {
                        error!(error = %e, "Drive lost while clearing cache");
                        return Ok(RipStatus::Fatal(e.to_string()));
                    }
                    Err(e) => warn!(error = %e, "Cache clear failed, re-reading anyway"),
                }
            }

            run.passes.push(self.create_pass_file(&run.range)?);
            debug!(
                pass = run.passes.len(),
                pending = pending.iter().map(SectorRange::length).sum::<u64>(),
                "Starting pass"
            );

            let batch_len = u64::from(self.config.sectors_per_read);
            for span in pending {
                for batch in span.chunks(batch_len) {
                    if let Some(status) = self.read_batch(run, output, readable, &batch)? {
                        return Ok(status);
                    }
                }
            }
        }
    }

    fn create_pass_file(&self, range: &SectorRange) -> Result<PassFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("cdrip-pass-").suffix(".pcm");
        let file = match &self.config.work_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.as_file().set_len(range.byte_size())?;
        let rip = Rip::open(file.path(), *range, self.config.use_hashes)?;
        Ok(PassFile { rip, _file: file })
    }

    /// Read one batch, feeding each copy to the range bookkeeping
    ///
    /// Returns a status when the range must end early.
    fn read_batch(
        &mut self,
        run: &mut RangeRun,
        output: &mut Rip,
        readable: &SectorRange,
        batch: &SectorRange,
    ) -> Result<Option<RipStatus>> {
        let mut next = batch.first();
        while next <= batch.last() {
            if self.progress.is_stopped() {
                return Ok(Some(RipStatus::Stopped));
            }

            let count = (batch.last() - next + 1) as u32;
            let failed = match self.read_logical(readable, next, count) {
                Ok(read) => {
                    run.consecutive_failures = 0;
                    for i in 0..read as usize {
                        if i > 0 && self.progress.is_stopped() {
                            self.progress.record_sectors(i as u64);
                            return Ok(Some(RipStatus::Stopped));
                        }
                        let audio = &self.audio[i * CDDA_SECTOR_SIZE..(i + 1) * CDDA_SECTOR_SIZE];
                        let copy = Some((audio, self.flags[i]));
                        run.record_copy(next + i as u64, copy, output, &self.config)?;
                    }
                    self.progress.record_sectors(u64::from(read));
                    next += u64::from(read);
                    // A short read means the following sector failed
                    (read < count).then_some(next)
                }
                Err(e) if e.is_device_error() => {
                    error!(sector = next, error = %e, "Drive lost during rip");
                    return Ok(Some(RipStatus::Fatal(e.to_string())));
                }
                Err(e) => {
                    debug!(sector = next, error = %e, "Read failed");
                    Some(next)
                }
            };

            if let Some(sector) = failed {
                run.record_copy(sector, None, output, &self.config)?;
                self.progress.record_sectors(1);
                run.consecutive_failures += 1;
                if run.consecutive_failures >= self.config.fatal_error_threshold {
                    let reason = format!(
                        "{} consecutive read failures ending at sector {sector}",
                        run.consecutive_failures
                    );
                    error!(%reason, "Abandoning range");
                    return Ok(Some(RipStatus::Fatal(reason)));
                }
                next = sector + 1;
            }
        }
        Ok(None)
    }

    /// Read `count` logical sectors starting at `first`, applying the drive offset
    ///
    /// Fills `self.audio` with the logical audio and `self.flags` with the
    /// C2 verdict per sector, and returns how many logical sectors are
    /// complete. Device sectors outside `readable` read as silence.
    fn read_logical(&mut self, readable: &SectorRange, first: u64, count: u32) -> Result<u32> {
        let format = if self.config.use_c2 {
            ReadFormat::AUDIO_AND_ERROR_FLAGS
        } else {
            ReadFormat::AUDIO
        };
        let stride = format.bytes_per_sector();
        let sector_size = CDDA_SECTOR_SIZE as i64;

        let offset_bytes = i64::from(self.config.drive_offset) * BYTES_PER_SAMPLE as i64;
        let shift = offset_bytes.div_euclid(sector_size);
        let skew = offset_bytes.rem_euclid(sector_size) as usize;
        let extra = u32::from(skew > 0);

        let device_first = first as i64 + shift;
        let device_count = count + extra;
        self.device.clear();
        self.device.resize(device_count as usize * stride, 0);

        let lo = device_first.max(readable.first() as i64);
        let hi = (device_first + i64::from(device_count) - 1).min(readable.last() as i64);
        let covered = if lo > hi {
            device_count
        } else {
            let skip = (lo - device_first) as usize;
            let wanted = (hi - lo + 1) as u32;
            let buffer = &mut self.device[skip * stride..(skip + wanted as usize) * stride];
            match self.drive.read_sectors(buffer, lo as u64, wanted, format) {
                Ok(n) if n >= wanted => device_count,
                Ok(n) => skip as u32 + n,
                Err(e) if e.is_device_error() || skip as u32 <= extra => return Err(e),
                Err(e) => {
                    debug!(sector = lo, error = %e, "Read failed after leading silence");
                    skip as u32
                }
            }
        };

        let complete = covered.saturating_sub(extra).min(count);
        if complete == 0 {
            return Err(Error::Read {
                sector: first,
                message: "no complete sector after offset correction".to_string(),
            });
        }

        let head = CDDA_SECTOR_SIZE - skew;
        let c2_offset = format.error_flags_offset();
        self.audio.resize(complete as usize * CDDA_SECTOR_SIZE, 0);
        self.flags.clear();

        for i in 0..complete as usize {
            let dst = &mut self.audio[i * CDDA_SECTOR_SIZE..(i + 1) * CDDA_SECTOR_SIZE];
            let this = i * stride;
            dst[..head].copy_from_slice(&self.device[this + skew..this + CDDA_SECTOR_SIZE]);
            if skew > 0 {
                let following = (i + 1) * stride;
                dst[head..].copy_from_slice(&self.device[following..following + skew]);
            }

            let flagged = format.error_flags && {
                let block = |j: usize| j * stride + c2_offset..(j + 1) * stride;
                c2_marks(&self.device[block(i)], skew..CDDA_SECTOR_SIZE)
                    || (skew > 0 && c2_marks(&self.device[block(i + 1)], 0..skew))
            };
            self.flags.push(flagged);
        }

        Ok(complete)
    }
}
