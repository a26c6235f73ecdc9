//! On-disk capture of one attempt at a sector range
//!
//! A [`Rip`] stores audio for a [`SectorRange`] in a file, one 2352-byte
//! block per sector, alongside a per-sector error flag and, optionally, a
//! SHA-256 digest of each sector as written. The file itself belongs to
//! whoever created it; a rip only opens it.

use crate::bit_array::BitArray;
use crate::error::{Error, Result};
use crate::manifest::{bytes_to_hex, RipManifest, MANIFEST_VERSION};
use crate::sector::{SectorRange, CDDA_SECTOR_SIZE, ERROR_FLAGS_SIZE};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// SHA-256 digest of one sector
pub type SectorDigest = [u8; 32];

/// Digest of one sector's audio
pub fn sector_digest(data: &[u8]) -> SectorDigest {
    Sha256::digest(data).into()
}

/// One captured attempt at a sector range
#[derive(Debug)]
pub struct Rip {
    path: PathBuf,
    range: SectorRange,
    file: File,
    errors: BitArray,
    hashes: Option<Vec<Option<SectorDigest>>>,
}

impl Rip {
    /// Open an existing file as the backing store for `range`
    ///
    /// The file must already exist; it is not created, truncated or resized.
    pub fn open(path: impl AsRef<Path>, range: SectorRange, calculate_hashes: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let sectors = usize::try_from(range.length())
            .map_err(|_| Error::InvalidRange(format!("{range} is too long for a rip")))?;
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        Ok(Self {
            path,
            range,
            file,
            errors: BitArray::new(sectors),
            hashes: calculate_hashes.then(|| vec![None; sectors]),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sectors held by the rip
    pub fn range(&self) -> SectorRange {
        self.range
    }

    /// First sector
    pub fn first_sector(&self) -> u64 {
        self.range.first()
    }

    /// Last sector
    pub fn last_sector(&self) -> u64 {
        self.range.last()
    }

    /// Number of sectors
    pub fn length(&self) -> u64 {
        self.range.length()
    }

    /// Whether `sector` lies within the rip
    pub fn contains_sector(&self, sector: u64) -> bool {
        self.range.contains_sector(sector)
    }

    /// Whether `range` lies entirely within the rip
    pub fn contains_sector_range(&self, range: &SectorRange) -> bool {
        self.range.contains_sector_range(range)
    }

    /// Whether per-sector digests are kept
    pub fn calculates_hashes(&self) -> bool {
        self.hashes.is_some()
    }

    // ------------------------------------------------------------------------
    // Audio
    // ------------------------------------------------------------------------

    /// Copy one sector into the start of `buffer`
    pub fn get_bytes(&self, buffer: &mut [u8], sector: u64) -> Result<()> {
        self.get_bytes_for_range(buffer, &SectorRange::single(sector))
    }

    /// Copy `range` into the start of `buffer`
    pub fn get_bytes_for_range(&self, buffer: &mut [u8], range: &SectorRange) -> Result<()> {
        let len = self.check_io(range, buffer.len())?;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(self.byte_offset(range.first())))?;
        file.read_exact(&mut buffer[..len])?;
        Ok(())
    }

    /// Write one sector from the start of `data`
    pub fn set_bytes(&mut self, data: &[u8], sector: u64) -> Result<()> {
        self.set_bytes_for_range(data, &SectorRange::single(sector))
    }

    /// Write `range` from the start of `data`
    ///
    /// Updates the digest of each written sector when hashing is enabled.
    pub fn set_bytes_for_range(&mut self, data: &[u8], range: &SectorRange) -> Result<()> {
        let len = self.check_io(range, data.len())?;
        let offset = self.byte_offset(range.first());
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&data[..len])?;

        let first_index = self.index(range.first());
        if let Some(hashes) = self.hashes.as_mut() {
            for (i, sector) in data[..len].chunks_exact(CDDA_SECTOR_SIZE).enumerate() {
                hashes[first_index + i] = Some(sector_digest(sector));
            }
        }
        Ok(())
    }

    /// Owned copy of one sector
    pub fn data_for_sector(&self, sector: u64) -> Result<Vec<u8>> {
        self.data_for_sector_range(&SectorRange::single(sector))
    }

    /// Owned copy of `range`
    pub fn data_for_sector_range(&self, range: &SectorRange) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; range.byte_size() as usize];
        self.get_bytes_for_range(&mut buffer, range)?;
        Ok(buffer)
    }

    /// Whether the stored sector equals `data` byte for byte
    pub fn sector_matches(&self, sector: u64, data: &[u8]) -> Result<bool> {
        if data.len() < CDDA_SECTOR_SIZE {
            return Ok(false);
        }
        let mut stored = [0u8; CDDA_SECTOR_SIZE];
        self.get_bytes(&mut stored, sector)?;
        Ok(stored[..] == data[..CDDA_SECTOR_SIZE])
    }

    /// Flush written audio to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Error flags
    // ------------------------------------------------------------------------

    /// Whether `sector` is flagged
    ///
    /// # Panics
    ///
    /// Panics if `sector` is outside the rip.
    pub fn sector_has_error(&self, sector: u64) -> bool {
        self.errors.value_at_index(self.index(sector))
    }

    /// Set or clear the flag of `sector`
    ///
    /// # Panics
    ///
    /// Panics if `sector` is outside the rip.
    pub fn set_error_flag(&mut self, flag: bool, sector: u64) {
        let index = self.index(sector);
        self.errors.set_value(flag, index);
    }

    /// Flag each sector of `range` whose C2 pointers mark any byte
    ///
    /// `c2` holds 294 bytes per sector, one bit per audio byte.
    pub fn set_error_flags(&mut self, c2: &[u8], range: &SectorRange) -> Result<()> {
        if !self.contains_sector_range(range) {
            return Err(self.outside(range));
        }
        let needed = range.length() as usize * ERROR_FLAGS_SIZE;
        if c2.len() < needed {
            return Err(Error::InvalidRange(format!(
                "{} bytes of C2 pointers, {needed} needed for {range}",
                c2.len()
            )));
        }
        for (sector, block) in range.iter().zip(c2.chunks_exact(ERROR_FLAGS_SIZE)) {
            let flagged = block.iter().any(|&b| b != 0);
            self.set_error_flag(flagged, sector);
        }
        Ok(())
    }

    /// Per-sector flags, indexed from the first sector
    pub fn errors(&self) -> &BitArray {
        &self.errors
    }

    /// Number of flagged sectors
    pub fn error_count(&self) -> usize {
        self.errors.count_of_ones()
    }

    /// Flagged sectors, ascending
    pub fn error_sectors(&self) -> Vec<u64> {
        self.errors
            .iter_ones()
            .map(|i| self.range.sector_for_index(i as u64))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Digests
    // ------------------------------------------------------------------------

    /// Digest of `sector` as last written, if hashing is on and it was written
    pub fn hash_for_sector(&self, sector: u64) -> Option<SectorDigest> {
        if !self.contains_sector(sector) {
            return None;
        }
        self.hashes.as_ref()?[self.index(sector)]
    }

    /// Whether the digest of `sector` equals `hash`
    pub fn sector_has_hash(&self, sector: u64, hash: &SectorDigest) -> bool {
        self.hash_for_sector(sector).as_ref() == Some(hash)
    }

    /// Manifest describing the rip as it stands
    pub fn manifest(&self) -> RipManifest {
        RipManifest {
            version: MANIFEST_VERSION,
            range: self.range,
            data_file: self.path.clone(),
            errors: self.errors.clone(),
            hashes: self.hashes.as_ref().map(|hashes| {
                hashes
                    .iter()
                    .map(|h| h.as_ref().map(|d| bytes_to_hex(d)))
                    .collect()
            }),
        }
    }

    fn index(&self, sector: u64) -> usize {
        assert!(
            self.contains_sector(sector),
            "sector {sector} outside rip {}",
            self.range
        );
        self.range.index_for_sector(sector) as usize
    }

    fn byte_offset(&self, sector: u64) -> u64 {
        self.range.index_for_sector(sector) * CDDA_SECTOR_SIZE as u64
    }

    fn outside(&self, range: &SectorRange) -> Error {
        Error::InvalidRange(format!("{range} outside rip {}", self.range))
    }

    /// Validate an I/O request and return its length in bytes
    fn check_io(&self, range: &SectorRange, buffer_len: usize) -> Result<usize> {
        if !self.contains_sector_range(range) {
            return Err(self.outside(range));
        }
        let len = range.byte_size() as usize;
        if buffer_len < len {
            return Err(Error::InvalidRange(format!(
                "buffer holds {buffer_len} bytes, {len} needed for {range}"
            )));
        }
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sector_of(value: u8) -> Vec<u8> {
        vec![value; CDDA_SECTOR_SIZE]
    }

    fn rip_file(range: &SectorRange) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(range.byte_size()).unwrap();
        file
    }

    #[test]
    fn test_open_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.pcm");
        let result = Rip::open(&missing, SectorRange::new(0, 9), false);
        assert!(matches!(result, Err(Error::Io(_))));
        assert!(!missing.exists());
    }

    #[test]
    fn test_bytes_roundtrip() {
        let range = SectorRange::new(100, 109);
        let file = rip_file(&range);
        let mut rip = Rip::open(file.path(), range, false).unwrap();

        rip.set_bytes(&sector_of(7), 103).unwrap();
        assert_eq!(rip.data_for_sector(103).unwrap(), sector_of(7));
        assert_eq!(rip.data_for_sector(104).unwrap(), sector_of(0));

        let mut data = sector_of(1);
        data.extend(sector_of(2));
        rip.set_bytes_for_range(&data, &SectorRange::new(108, 109)).unwrap();
        assert_eq!(
            rip.data_for_sector_range(&SectorRange::new(108, 109)).unwrap(),
            data
        );

        assert!(rip.sector_matches(108, &sector_of(1)).unwrap());
        assert!(!rip.sector_matches(108, &sector_of(2)).unwrap());
        assert_eq!(rip.first_sector(), 100);
        assert_eq!(rip.last_sector(), 109);
        assert_eq!(rip.length(), 10);
    }

    #[test]
    fn test_out_of_range_io_is_error() {
        let range = SectorRange::new(100, 109);
        let file = rip_file(&range);
        let mut rip = Rip::open(file.path(), range, false).unwrap();

        assert!(matches!(
            rip.set_bytes(&sector_of(1), 110),
            Err(Error::InvalidRange(_))
        ));
        assert!(matches!(
            rip.data_for_sector(99),
            Err(Error::InvalidRange(_))
        ));
        let mut small = [0u8; 100];
        assert!(matches!(
            rip.get_bytes(&mut small, 100),
            Err(Error::InvalidRange(_))
        ));
    }

    #[test]
    fn test_error_flags() {
        let range = SectorRange::new(0, 3);
        let file = rip_file(&range);
        let mut rip = Rip::open(file.path(), range, false).unwrap();
        assert_eq!(rip.error_count(), 0);

        rip.set_error_flag(true, 2);
        assert!(rip.sector_has_error(2));
        assert_eq!(rip.error_sectors(), vec![2]);

        let mut c2 = vec![0u8; 4 * ERROR_FLAGS_SIZE];
        c2[ERROR_FLAGS_SIZE + 100] = 0x01;
        rip.set_error_flags(&c2, &range).unwrap();
        assert_eq!(rip.error_sectors(), vec![1]);
        assert_eq!(rip.error_count(), 1);

        assert!(rip.set_error_flags(&c2[..10], &range).is_err());
    }

    #[test]
    #[should_panic(expected = "outside rip")]
    fn test_error_flag_out_of_range_panics() {
        let range = SectorRange::new(0, 3);
        let file = rip_file(&range);
        let rip = Rip::open(file.path(), range, false).unwrap();
        rip.sector_has_error(4);
    }

    #[test]
    fn test_hashes() {
        let range = SectorRange::new(10, 12);
        let file = rip_file(&range);
        let mut rip = Rip::open(file.path(), range, true).unwrap();
        assert!(rip.calculates_hashes());
        assert_eq!(rip.hash_for_sector(10), None);

        rip.set_bytes(&sector_of(5), 10).unwrap();
        let expected = sector_digest(&sector_of(5));
        assert_eq!(rip.hash_for_sector(10), Some(expected));
        assert!(rip.sector_has_hash(10, &expected));
        assert!(!rip.sector_has_hash(11, &expected));
        assert_eq!(rip.hash_for_sector(99), None);

        rip.set_bytes(&sector_of(6), 10).unwrap();
        assert!(!rip.sector_has_hash(10, &expected));
    }

    #[test]
    fn test_hashes_disabled() {
        let range = SectorRange::new(10, 12);
        let file = rip_file(&range);
        let mut rip = Rip::open(file.path(), range, false).unwrap();
        rip.set_bytes(&sector_of(5), 10).unwrap();
        assert_eq!(rip.hash_for_sector(10), None);
        assert!(!rip.sector_has_hash(10, &sector_digest(&sector_of(5))));
        assert!(rip.manifest().hashes.is_none());
    }

    #[test]
    fn test_manifest_from_rip() {
        let range = SectorRange::new(10, 12);
        let file = rip_file(&range);
        let mut rip = Rip::open(file.path(), range, true).unwrap();
        rip.set_bytes(&sector_of(5), 11).unwrap();
        rip.set_error_flag(true, 12);

        let manifest = rip.manifest();
        assert_eq!(manifest.range, range);
        assert_eq!(manifest.data_file, file.path());
        assert_eq!(manifest.error_sectors(), vec![12]);
        let hashes = manifest.hashes.as_ref().unwrap();
        assert_eq!(hashes.len(), 3);
        assert!(hashes[0].is_none());
        assert_eq!(hashes[1].as_ref().unwrap().len(), 64);
    }
}
