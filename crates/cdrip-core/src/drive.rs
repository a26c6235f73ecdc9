//! Audio drive access
//!
//! [`AudioDrive`] is the only way the rippers reach hardware. [`CdDrive`]
//! implements it with MMC commands over a platform [`ScsiTransport`]; tests
//! substitute simulated drives.
//!
//! Reads never retry internally. A read that fails after at least one command
//! succeeded returns the number of sectors transferred so far; a failure of
//! the first command is an error.

use crate::error::{Error, Result};
use crate::mmc::{self, ReadFormat, MAXIMUM_SPEED};
use crate::progress::RipProgress;
use crate::sector::{SectorRange, CDDA_SECTOR_SIZE};
use crate::toc::Toc;
use cdrip_platform::{DataDirection, ScsiTransport, DEFAULT_COMMAND_TIMEOUT};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cache size assumed when the drive does not report one (16 MiB)
pub const DEFAULT_CACHE_SIZE: usize = 16 * 1024 * 1024;

/// Default number of sectors per READ CD command
pub const DEFAULT_SECTORS_PER_COMMAND: u32 = 24;

/// Largest number of sectors per READ CD command
pub const MAX_SECTORS_PER_COMMAND: u32 = 64;

/// Sectors read per command while flushing the cache
const CACHE_FLUSH_CHUNK: u32 = DEFAULT_SECTORS_PER_COMMAND;

/// Allocation length for TOC and mode page responses
const RESPONSE_BUFFER_SIZE: u16 = 4096;

/// Allocation length for READ SUB-CHANNEL responses
const SUBCHANNEL_BUFFER_SIZE: u16 = 24;

/// Sectors that must be read to push `cache_size` bytes out of the drive
///
/// Reads 25% more than the cache holds.
pub fn flush_sector_count(cache_size: usize) -> u64 {
    let bytes = cache_size.saturating_add(cache_size / 4);
    (bytes.div_ceil(CDDA_SECTOR_SIZE) as u64).max(1)
}

/// Sectors to read so that a later read of `range` cannot hit the cache
///
/// Prefers `flush` sectors right after `range`, then right before it. When
/// neither side of `readable` is long enough, everything available on both
/// sides is used.
pub fn plan_cache_flush(readable: &SectorRange, range: &SectorRange, flush: u64) -> Vec<SectorRange> {
    let after = (range.last() < readable.last())
        .then(|| SectorRange::new(range.last() + 1, readable.last()));
    let before = (range.first() > readable.first())
        .then(|| SectorRange::new(readable.first(), range.first() - 1));

    if let Some(after) = after.filter(|a| a.length() >= flush) {
        return vec![SectorRange::with_length(after.first(), flush)];
    }
    if let Some(before) = before.filter(|b| b.length() >= flush) {
        return vec![SectorRange::new(range.first() - flush, range.first() - 1)];
    }

    let plan: Vec<_> = after.into_iter().chain(before).collect();
    let available: u64 = plan.iter().map(SectorRange::length).sum();
    if available < flush {
        warn!(
            range = %range,
            available,
            needed = flush,
            "Disc too short to fully flush the drive cache"
        );
    }
    plan
}

/// Sectors the drive can return around `range`
///
/// The program area of the session holding `range`, or of the whole disc if
/// no session holds it.
pub fn readable_area(toc: &Toc, range: &SectorRange) -> SectorRange {
    toc.session_containing_sector(range.first())
        .and_then(|session| toc.session_range(session))
        .unwrap_or_else(|| toc.disc_range())
}

/// Sector-level access to an audio CD
///
/// Buffers must hold `count * format.bytes_per_sector()` bytes. Payloads are
/// laid out sector by sector in the order audio, error flags, Q sub-channel.
pub trait AudioDrive {
    /// Path of the underlying device
    fn device_path(&self) -> &str;

    /// TOC read when the drive was opened
    fn toc(&self) -> &Toc;

    /// Drive cache size in bytes
    fn cache_size(&self) -> usize;

    /// Override the cache size used for cache defeat
    fn set_cache_size(&mut self, bytes: usize);

    /// Current read speed in KB/s
    fn speed(&self) -> u16;

    /// Request a read speed in KB/s ([`MAXIMUM_SPEED`] for the fastest)
    fn set_speed(&mut self, speed: u16) -> Result<()>;

    /// Read `count` sectors starting at `start`
    ///
    /// Returns the number of sectors actually read.
    fn read_sectors(
        &mut self,
        buffer: &mut [u8],
        start: u64,
        count: u32,
        format: ReadFormat,
    ) -> Result<u32>;

    /// Media catalog number, if the disc has one
    fn read_mcn(&mut self) -> Result<Option<String>> {
        Ok(None)
    }

    /// ISRC of `track`, if it has one
    fn read_isrc(&mut self, _track: u8) -> Result<Option<String>> {
        Ok(None)
    }

    /// Raw CDDA
    fn read_audio(&mut self, buffer: &mut [u8], start: u64, count: u32) -> Result<u32> {
        self.read_sectors(buffer, start, count, ReadFormat::AUDIO)
    }

    /// Raw CDDA for a whole range
    fn read_audio_range(&mut self, buffer: &mut [u8], range: &SectorRange) -> Result<u32> {
        let count = u32::try_from(range.length())
            .map_err(|_| Error::InvalidRange(format!("{range} is too long for one read")))?;
        self.read_audio(buffer, range.first(), count)
    }

    /// Formatted Q sub-channel only
    fn read_q_subchannel(&mut self, buffer: &mut [u8], start: u64, count: u32) -> Result<u32> {
        self.read_sectors(buffer, start, count, ReadFormat::Q_SUBCHANNEL)
    }

    /// C2 error pointers only
    fn read_error_flags(&mut self, buffer: &mut [u8], start: u64, count: u32) -> Result<u32> {
        self.read_sectors(buffer, start, count, ReadFormat::ERROR_FLAGS)
    }

    /// Audio followed by Q sub-channel
    fn read_audio_and_q_subchannel(
        &mut self,
        buffer: &mut [u8],
        start: u64,
        count: u32,
    ) -> Result<u32> {
        self.read_sectors(buffer, start, count, ReadFormat::AUDIO_AND_Q)
    }

    /// Audio followed by C2 error pointers
    fn read_audio_and_error_flags(
        &mut self,
        buffer: &mut [u8],
        start: u64,
        count: u32,
    ) -> Result<u32> {
        self.read_sectors(buffer, start, count, ReadFormat::AUDIO_AND_ERROR_FLAGS)
    }

    /// Audio, C2 error pointers, then Q sub-channel
    fn read_audio_and_error_flags_with_q_subchannel(
        &mut self,
        buffer: &mut [u8],
        start: u64,
        count: u32,
    ) -> Result<u32> {
        self.read_sectors(buffer, start, count, ReadFormat::ALL)
    }

    /// Push `range` out of the drive's read cache
    ///
    /// Reads sectors outside `range` within its session, more than the cache
    /// holds. Failed flush reads are skipped; only device loss is an error.
    /// Returns [`Error::Cancelled`] as soon as `progress` is stopped.
    fn clear_cache(&mut self, range: &SectorRange, progress: &RipProgress) -> Result<()> {
        let flush = flush_sector_count(self.cache_size());
        let readable = readable_area(self.toc(), range);
        let plan = plan_cache_flush(&readable, range, flush);

        debug!(range = %range, flush, "Clearing drive cache");

        let mut buffer = vec![0u8; CACHE_FLUSH_CHUNK as usize * CDDA_SECTOR_SIZE];
        for chunk in plan
            .iter()
            .flat_map(|span| span.chunks(u64::from(CACHE_FLUSH_CHUNK)))
        {
            if progress.is_stopped() {
                debug!(range = %range, "Cache flush stopped");
                return Err(Error::Cancelled);
            }
            match self.read_audio(&mut buffer, chunk.first(), chunk.length() as u32) {
                Ok(_) => {}
                Err(e) if e.is_device_error() => return Err(e),
                Err(e) => debug!(chunk = %chunk, error = %e, "Ignoring failed cache flush read"),
            }
        }
        Ok(())
    }
}

/// Options applied when opening a [`CdDrive`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveOptions {
    /// Largest number of sectors per READ CD command
    pub sectors_per_command: u32,

    /// Timeout for each command
    pub command_timeout: Duration,

    /// Read speed to request after opening, in KB/s
    pub read_speed: Option<u16>,

    /// Cache size to assume instead of the reported one, in bytes
    pub cache_size: Option<usize>,
}

impl Default for DriveOptions {
    fn default() -> Self {
        Self {
            sectors_per_command: DEFAULT_SECTORS_PER_COMMAND,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            read_speed: None,
            cache_size: None,
        }
    }
}

impl DriveOptions {
    /// Create options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set sectors per command (clamped to valid range)
    pub fn sectors_per_command(mut self, sectors: u32) -> Self {
        self.sectors_per_command = sectors.clamp(1, MAX_SECTORS_PER_COMMAND);
        self
    }

    /// Set the command timeout
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the read speed requested on open
    pub fn read_speed(mut self, speed: Option<u16>) -> Self {
        self.read_speed = speed;
        self
    }

    /// Set the assumed cache size
    pub fn cache_size(mut self, bytes: Option<usize>) -> Self {
        self.cache_size = bytes;
        self
    }
}

/// An optical drive driven with MMC commands
pub struct CdDrive {
    transport: Box<dyn ScsiTransport>,
    options: DriveOptions,
    toc: Toc,
    cache_size: usize,
    speed: u16,
}

impl std::fmt::Debug for CdDrive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdDrive")
            .field("toc", &self.toc)
            .field("cache_size", &self.cache_size)
            .field("speed", &self.speed)
            .finish_non_exhaustive()
    }
}

impl CdDrive {
    /// Open the drive at `path` with default options
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with_options(path, DriveOptions::default())
    }

    /// Open the drive at `path`
    pub fn open_with_options(path: &str, options: DriveOptions) -> Result<Self> {
        info!(path, "Opening drive");
        let transport = cdrip_platform::open_transport(path)
            .map_err(|e| Error::Device(format!("{path}: {e}")))?;
        Self::with_transport(transport, options)
    }

    /// Set up a drive over an already open transport
    ///
    /// Checks the unit is ready, reads the full TOC and queries the cache
    /// size. A drive that is not ready is a [`Error::Device`].
    pub fn with_transport(
        mut transport: Box<dyn ScsiTransport>,
        options: DriveOptions,
    ) -> Result<Self> {
        let timeout = options.command_timeout;

        transport
            .execute(&mmc::test_unit_ready(), DataDirection::None, &mut [], timeout)
            .map_err(|e| Error::Device(format!("drive not ready: {e}")))?;

        let mut response = vec![0u8; usize::from(RESPONSE_BUFFER_SIZE)];
        let n = transport.execute(
            &mmc::read_full_toc(RESPONSE_BUFFER_SIZE),
            DataDirection::FromDevice,
            &mut response,
            timeout,
        )?;
        let toc = mmc::parse_full_toc(&response[..n])?;

        let mut drive = Self {
            transport,
            options,
            toc,
            cache_size: DEFAULT_CACHE_SIZE,
            speed: MAXIMUM_SPEED,
        };

        drive.cache_size = match drive.options.cache_size {
            Some(bytes) => bytes,
            None => drive.query_cache_size(),
        };

        if let Some(speed) = drive.options.read_speed {
            if let Err(e) = drive.set_speed(speed) {
                warn!(speed, error = %e, "Drive rejected read speed");
            }
        }

        info!(
            tracks = drive.toc.tracks().len(),
            sessions = drive.toc.sessions().len(),
            cache_size = drive.cache_size,
            "Drive ready"
        );
        Ok(drive)
    }

    /// Options the drive was opened with
    pub fn options(&self) -> &DriveOptions {
        &self.options
    }

    fn query_cache_size(&mut self) -> usize {
        let mut response = vec![0u8; usize::from(RESPONSE_BUFFER_SIZE)];
        let reported = self
            .command(
                &mmc::mode_sense_capabilities(RESPONSE_BUFFER_SIZE),
                DataDirection::FromDevice,
                &mut response,
            )
            .and_then(|n| mmc::parse_capabilities(&response[..n]));

        match reported {
            Ok(caps) => match caps.buffer_size {
                Some(size) => size,
                None => {
                    warn!("Drive reports no buffer size, assuming 16 MiB");
                    DEFAULT_CACHE_SIZE
                }
            },
            Err(e) => {
                warn!(error = %e, "Capabilities page unavailable, assuming 16 MiB cache");
                DEFAULT_CACHE_SIZE
            }
        }
    }

    fn command(&mut self, cdb: &[u8], direction: DataDirection, buffer: &mut [u8]) -> Result<usize> {
        let timeout = self.options.command_timeout;
        Ok(self.transport.execute(cdb, direction, buffer, timeout)?)
    }

    fn read_subchannel(&mut self, cdb: &[u8]) -> Result<Vec<u8>> {
        let mut response = vec![0u8; usize::from(SUBCHANNEL_BUFFER_SIZE)];
        let n = self.command(cdb, DataDirection::FromDevice, &mut response)?;
        response.truncate(n);
        Ok(response)
    }
}

impl AudioDrive for CdDrive {
    fn device_path(&self) -> &str {
        self.transport.path()
    }

    fn toc(&self) -> &Toc {
        &self.toc
    }

    fn cache_size(&self) -> usize {
        self.cache_size
    }

    fn set_cache_size(&mut self, bytes: usize) {
        self.cache_size = bytes;
    }

    fn speed(&self) -> u16 {
        self.speed
    }

    fn set_speed(&mut self, speed: u16) -> Result<()> {
        self.command(&mmc::set_cd_speed(speed), DataDirection::None, &mut [])?;
        debug!(speed, "Read speed set");
        self.speed = speed;
        Ok(())
    }

    fn read_sectors(
        &mut self,
        buffer: &mut [u8],
        start: u64,
        count: u32,
        format: ReadFormat,
    ) -> Result<u32> {
        let sector_size = format.bytes_per_sector();
        let needed = count as usize * sector_size;
        if buffer.len() < needed {
            return Err(Error::InvalidRange(format!(
                "buffer holds {} bytes, {needed} needed for {count} sectors",
                buffer.len()
            )));
        }
        if count == 0 {
            return Ok(0);
        }

        let mut done = 0u32;
        while done < count {
            let batch = (count - done).min(self.options.sectors_per_command);
            let sector = start + u64::from(done);
            let lba = u32::try_from(sector)
                .map_err(|_| Error::InvalidRange(format!("sector {sector} is not addressable")))?;

            let offset = done as usize * sector_size;
            let chunk = &mut buffer[offset..offset + batch as usize * sector_size];
            let cdb = mmc::read_cd(lba, batch, format);
            let timeout = self.options.command_timeout;

            match self
                .transport
                .execute(&cdb, DataDirection::FromDevice, chunk, timeout)
            {
                Ok(bytes) => {
                    let sectors = (bytes / sector_size) as u32;
                    done += sectors.min(batch);
                    if sectors < batch {
                        debug!(sector, requested = batch, read = sectors, "Short read");
                        break;
                    }
                }
                Err(e) => {
                    let err = Error::from_read(sector, e);
                    if done == 0 || err.is_device_error() {
                        return Err(err);
                    }
                    debug!(sector, error = %err, read = done, "Read stopped early");
                    break;
                }
            }
        }

        if done == 0 {
            return Err(Error::Read {
                sector: start,
                message: "drive transferred no data".to_string(),
            });
        }
        Ok(done)
    }

    fn read_mcn(&mut self) -> Result<Option<String>> {
        let response = self.read_subchannel(&mmc::read_mcn(SUBCHANNEL_BUFFER_SIZE))?;
        Ok(mmc::parse_mcn(&response))
    }

    fn read_isrc(&mut self, track: u8) -> Result<Option<String>> {
        let response = self.read_subchannel(&mmc::read_isrc(track, SUBCHANNEL_BUFFER_SIZE))?;
        Ok(mmc::parse_isrc(&response))
    }
}
