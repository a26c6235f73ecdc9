//! Sector addressing primitives and Red Book layout constants

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bytes of audio in one CDDA sector
pub const CDDA_SECTOR_SIZE: usize = 2352;

/// Bytes of formatted Q sub-channel returned per sector
pub const Q_SUBCHANNEL_SIZE: usize = 16;

/// Bytes of C2 error pointers returned per sector (one bit per audio byte)
pub const ERROR_FLAGS_SIZE: usize = 294;

/// Bytes in one 16-bit stereo sample
pub const BYTES_PER_SAMPLE: usize = 4;

/// Stereo samples in one CDDA sector
pub const SAMPLES_PER_SECTOR: usize = CDDA_SECTOR_SIZE / BYTES_PER_SAMPLE;

/// Sectors per second of audio
pub const SECTORS_PER_SECOND: u64 = 75;

/// Sectors in the two-second lead-in that MSF addresses include
pub const LEAD_IN_SECTORS: u64 = 150;

/// A contiguous, inclusive span of disc sectors
///
/// Ranges are never empty: `first <= last` always holds. Constructors panic
/// when given an empty span; deserializing one is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "SectorBounds")]
pub struct SectorRange {
    first: u64,
    last: u64,
}

/// Unchecked serialized form of [`SectorRange`]
#[derive(Deserialize)]
struct SectorBounds {
    first: u64,
    last: u64,
}

impl TryFrom<SectorBounds> for SectorRange {
    type Error = String;

    fn try_from(bounds: SectorBounds) -> Result<Self, Self::Error> {
        if bounds.first > bounds.last {
            return Err(format!(
                "sector range must not be empty ({} > {})",
                bounds.first, bounds.last
            ));
        }
        Ok(Self {
            first: bounds.first,
            last: bounds.last,
        })
    }
}

impl SectorRange {
    /// Range from `first` to `last`, inclusive
    ///
    /// # Panics
    ///
    /// Panics if `first > last`.
    pub fn new(first: u64, last: u64) -> Self {
        assert!(
            first <= last,
            "sector range must not be empty ({first} > {last})"
        );
        Self { first, last }
    }

    /// Range of `count` sectors starting at `first`
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    pub fn with_length(first: u64, count: u64) -> Self {
        assert!(count > 0, "sector range must not be empty");
        Self::new(first, first + count - 1)
    }

    /// Range holding a single sector
    pub fn single(sector: u64) -> Self {
        Self {
            first: sector,
            last: sector,
        }
    }

    /// First sector
    pub fn first(&self) -> u64 {
        self.first
    }

    /// Last sector (inclusive)
    pub fn last(&self) -> u64 {
        self.last
    }

    /// Number of sectors
    pub fn length(&self) -> u64 {
        self.last - self.first + 1
    }

    /// Size of the audio in bytes
    pub fn byte_size(&self) -> u64 {
        self.length() * CDDA_SECTOR_SIZE as u64
    }

    /// Zero-based position of `sector` within the range
    pub fn index_for_sector(&self, sector: u64) -> u64 {
        debug_assert!(self.contains_sector(sector), "{sector} not in {self}");
        sector - self.first
    }

    /// Absolute sector at zero-based `index`
    pub fn sector_for_index(&self, index: u64) -> u64 {
        debug_assert!(index < self.length(), "index {index} out of {self}");
        self.first + index
    }

    /// Whether `sector` lies within the range
    pub fn contains_sector(&self, sector: u64) -> bool {
        sector >= self.first && sector <= self.last
    }

    /// Whether `other` lies entirely within the range
    pub fn contains_sector_range(&self, other: &SectorRange) -> bool {
        other.first >= self.first && other.last <= self.last
    }

    /// Sectors shared with `other`, if any
    pub fn intersection(&self, other: &SectorRange) -> Option<SectorRange> {
        let first = self.first.max(other.first);
        let last = self.last.min(other.last);
        (first <= last).then_some(SectorRange { first, last })
    }

    /// Iterate over every sector
    pub fn iter(&self) -> std::ops::RangeInclusive<u64> {
        self.first..=self.last
    }

    /// Split into consecutive sub-ranges of at most `max_len` sectors
    ///
    /// # Panics
    ///
    /// Panics if `max_len` is zero.
    pub fn chunks(&self, max_len: u64) -> impl Iterator<Item = SectorRange> + use<> {
        assert!(max_len > 0, "chunk length must be positive");
        let last = self.last;
        let mut next = Some(self.first);
        std::iter::from_fn(move || {
            let first = next?;
            let end = first.saturating_add(max_len - 1).min(last);
            next = (end < last).then_some(end + 1);
            Some(SectorRange { first, last: end })
        })
    }
}

impl fmt::Display for SectorRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.first, self.last)
    }
}

impl IntoIterator for SectorRange {
    type Item = u64;
    type IntoIter = std::ops::RangeInclusive<u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Convert a minute/second/frame address to a logical block address
pub fn msf_to_lba(minutes: u8, seconds: u8, frames: u8) -> i64 {
    (i64::from(minutes) * 60 + i64::from(seconds)) * SECTORS_PER_SECOND as i64 + i64::from(frames)
        - LEAD_IN_SECTORS as i64
}

/// Decode a packed BCD byte
pub fn bcd_to_binary(value: u8) -> u8 {
    (value >> 4) * 10 + (value & 0x0F)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(SAMPLES_PER_SECTOR, 588);
        assert_eq!(SAMPLES_PER_SECTOR * BYTES_PER_SAMPLE, CDDA_SECTOR_SIZE);
        assert_eq!(ERROR_FLAGS_SIZE * 8, CDDA_SECTOR_SIZE);
    }

    #[test]
    fn test_length_and_byte_size() {
        for (first, last) in [(0, 0), (0, 9), (150, 300), (1000, 1000), (u64::MAX - 5, u64::MAX - 1)] {
            let range = SectorRange::new(first, last);
            assert_eq!(range.length(), last - first + 1);
            assert_eq!(range.byte_size(), range.length() * 2352);
        }
    }

    #[test]
    fn test_constructors() {
        let a = SectorRange::new(10, 19);
        let b = SectorRange::with_length(10, 10);
        assert_eq!(a, b);

        let single = SectorRange::single(42);
        assert_eq!(single.first(), 42);
        assert_eq!(single.last(), 42);
        assert_eq!(single.length(), 1);
    }

    #[test]
    #[should_panic(expected = "must not be empty")]
    fn test_new_rejects_inverted_range() {
        let _ = SectorRange::new(10, 9);
    }

    #[test]
    #[should_panic(expected = "must not be empty")]
    fn test_with_length_rejects_zero() {
        let _ = SectorRange::with_length(10, 0);
    }

    #[test]
    fn test_index_mapping() {
        let range = SectorRange::new(100, 199);
        assert_eq!(range.index_for_sector(100), 0);
        assert_eq!(range.index_for_sector(199), 99);
        assert_eq!(range.sector_for_index(0), 100);
        assert_eq!(range.sector_for_index(57), 157);

        for sector in range {
            assert_eq!(range.sector_for_index(range.index_for_sector(sector)), sector);
        }
    }

    #[test]
    fn test_containment() {
        let range = SectorRange::new(100, 199);
        assert!(range.contains_sector(100));
        assert!(range.contains_sector(199));
        assert!(!range.contains_sector(99));
        assert!(!range.contains_sector(200));

        assert!(range.contains_sector_range(&SectorRange::new(100, 199)));
        assert!(range.contains_sector_range(&SectorRange::new(150, 160)));
        assert!(!range.contains_sector_range(&SectorRange::new(90, 150)));
        assert!(!range.contains_sector_range(&SectorRange::new(150, 250)));
    }

    #[test]
    fn test_intersection() {
        let a = SectorRange::new(0, 99);
        assert_eq!(
            a.intersection(&SectorRange::new(50, 150)),
            Some(SectorRange::new(50, 99))
        );
        assert_eq!(a.intersection(&SectorRange::new(100, 150)), None);
        assert_eq!(
            a.intersection(&SectorRange::single(99)),
            Some(SectorRange::single(99))
        );
    }

    #[test]
    fn test_chunks() {
        let range = SectorRange::new(0, 99);
        let chunks: Vec<_> = range.chunks(30).collect();
        assert_eq!(
            chunks,
            vec![
                SectorRange::new(0, 29),
                SectorRange::new(30, 59),
                SectorRange::new(60, 89),
                SectorRange::new(90, 99),
            ]
        );

        let exact: Vec<_> = SectorRange::new(10, 19).chunks(10).collect();
        assert_eq!(exact, vec![SectorRange::new(10, 19)]);

        let total: u64 = SectorRange::new(5, 1000).chunks(7).map(|c| c.length()).sum();
        assert_eq!(total, 996);
    }

    #[test]
    fn test_deserialize_rejects_empty_range() {
        let range: SectorRange = serde_json::from_str(r#"{"first":2,"last":10}"#).unwrap();
        assert_eq!(range, SectorRange::new(2, 10));

        let err = serde_json::from_str::<SectorRange>(r#"{"first":10,"last":2}"#).unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn test_display() {
        assert_eq!(SectorRange::new(150, 300).to_string(), "150-300");
    }

    #[test]
    fn test_msf_and_bcd() {
        assert_eq!(msf_to_lba(0, 2, 0), 0);
        assert_eq!(msf_to_lba(1, 0, 0), 4350);
        assert_eq!(bcd_to_binary(0x42), 42);
        assert_eq!(bcd_to_binary(0x09), 9);
    }
}
