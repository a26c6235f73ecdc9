//! Built-in jitter correction by overlapping reads
//!
//! Every read of sector `s` also covers the sectors around it. The copy of
//! `s - 1` inside the window is located against the audio already verified
//! for `s - 1`, searching up to `max_jitter` samples either way, and the
//! bytes that follow it are taken as `s`. Two independent reads must
//! produce the same bytes before the sector is trusted.

use super::{JitterCorrector, SectorVerdict};
use crate::drive::AudioDrive;
use crate::error::{Error, Result};
use crate::sector::{SectorRange, BYTES_PER_SAMPLE, CDDA_SECTOR_SIZE};
use tracing::trace;

/// A copy of one sector taken from a window read
struct WindowCopy {
    data: Vec<u8>,
    /// Byte drift found against the verified tail, `None` if the tail was not found
    shift: Option<i64>,
}

/// Overlap-verifying corrector over a borrowed drive
pub struct OverlapVerifier<'a> {
    drive: &'a mut dyn AudioDrive,
    max_shift: i64,
    readable: SectorRange,
    position: u64,
    /// Last trusted sector and its audio
    tail: Option<(u64, Vec<u8>)>,
    window: Vec<u8>,
}

impl<'a> OverlapVerifier<'a> {
    /// Create a verifier searching up to `max_jitter` samples of drift
    pub fn new(drive: &'a mut dyn AudioDrive, max_jitter: u32) -> Self {
        let readable = drive.toc().disc_range();
        Self {
            drive,
            max_shift: i64::from(max_jitter) * BYTES_PER_SAMPLE as i64,
            readable,
            position: readable.first(),
            tail: None,
            window: Vec::new(),
        }
    }

    /// Sector the next read returns
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Drift candidates in bytes: 0, +4, -4, +8, -8, ...
    fn shifts(&self) -> impl Iterator<Item = i64> + use<> {
        let steps = self.max_shift / BYTES_PER_SAMPLE as i64;
        std::iter::once(0).chain((1..=steps).flat_map(|k| {
            let bytes = k * BYTES_PER_SAMPLE as i64;
            [bytes, -bytes]
        }))
    }

    /// Read a window around `sector` and extract one copy of it
    fn read_copy(&mut self, sector: u64) -> Result<WindowCopy> {
        let tail = self
            .tail
            .as_ref()
            .filter(|(tail_sector, _)| tail_sector + 1 == sector);

        let first = match tail {
            Some(_) => sector.saturating_sub(2).max(self.readable.first()),
            None => sector,
        };
        let last = match tail {
            Some(_) => (sector + 1).min(self.readable.last()),
            None => sector,
        };
        let count = (last - first + 1) as u32;
        self.window.resize(count as usize * CDDA_SECTOR_SIZE, 0);
        let read = self.drive.read_audio(&mut self.window, first, count)?;
        let window = &self.window[..read as usize * CDDA_SECTOR_SIZE];

        let sector_size = CDDA_SECTOR_SIZE as i64;
        let own = (sector - first) as i64 * sector_size;
        let copy_at = |start: i64| {
            let end = start + sector_size;
            (start >= 0 && end <= window.len() as i64).then(|| &window[start as usize..end as usize])
        };

        if let Some((_, verified)) = tail {
            let previous = own - sector_size;
            for shift in self.shifts() {
                let (Some(candidate), Some(next)) =
                    (copy_at(previous + shift), copy_at(own + shift))
                else {
                    continue;
                };
                if candidate == verified.as_slice() {
                    if shift != 0 {
                        trace!(sector, shift, "Aligned window with drift");
                    }
                    return Ok(WindowCopy {
                        data: next.to_vec(),
                        shift: Some(shift),
                    });
                }
            }
        }

        let data = copy_at(own).ok_or_else(|| Error::Read {
            sector,
            message: "short read around sector".to_string(),
        })?;
        Ok(WindowCopy {
            data: data.to_vec(),
            shift: tail.map_or(Some(0), |_| None),
        })
    }
}

impl JitterCorrector for OverlapVerifier<'_> {
    fn seek(&mut self, sector: u64) -> Result<()> {
        if !self.readable.contains_sector(sector) {
            return Err(Error::InvalidRange(format!(
                "sector {sector} outside {}",
                self.readable
            )));
        }
        if self.tail.as_ref().is_some_and(|(tail, _)| tail + 1 != sector) {
            self.tail = None;
        }
        self.position = sector;
        Ok(())
    }

    fn read_sector(&mut self) -> Result<SectorVerdict> {
        let sector = self.position;
        let first = self.read_copy(sector)?;
        let second = self.read_copy(sector)?;
        self.position += 1;

        let verdict = match (first.shift, second.shift) {
            (Some(a), Some(b)) if first.data == second.data => {
                if a == 0 && b == 0 {
                    SectorVerdict::Verified(first.data)
                } else {
                    SectorVerdict::Corrected(first.data)
                }
            }
            _ => return Ok(SectorVerdict::Unverified(first.data)),
        };

        // Unverified reads keep the old tail so retries can still align
        self.tail = Some((sector, verdict.data().to_vec()));
        Ok(verdict)
    }
}
