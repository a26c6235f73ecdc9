//! JSON sidecar describing a finished rip
//!
//! The manifest lets the encoder pipeline pick up a rip without the ripper:
//! it names the PCM file, the sectors it covers, which of them are flagged
//! and, when hashing was on, the digest of every sector.
//!
//! # Example
//!
//! ```ignore
//! use cdrip_core::manifest::RipManifest;
//!
//! let manifest = rip.manifest();
//! let path = manifest.save()?;
//!
//! // Later, in another process:
//! let manifest = RipManifest::load_from_path(&path)?;
//! for sector in manifest.error_sectors() {
//!     println!("sector {sector} may be damaged");
//! }
//! ```

use crate::bit_array::BitArray;
use crate::error::{Error, Result};
use crate::rip::SectorDigest;
use crate::sector::SectorRange;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// Current version of the manifest format
pub const MANIFEST_VERSION: u32 = 1;

/// Extension appended to the data file name
pub const MANIFEST_EXTENSION: &str = "json";

/// Description of one rip file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RipManifest {
    /// Manifest format version
    pub version: u32,

    /// Sectors held by the data file
    pub range: SectorRange,

    /// Raw PCM file, 2352 bytes per sector
    pub data_file: PathBuf,

    /// One flag per sector, set where the audio could not be verified
    pub errors: BitArray,

    /// Lowercase hex SHA-256 per sector, absent for unwritten sectors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashes: Option<Vec<Option<String>>>,
}

impl RipManifest {
    /// Sidecar path for a data file (`<file>.json`)
    pub fn path_for(data_file: &Path) -> PathBuf {
        let mut name = data_file.as_os_str().to_owned();
        name.push(".");
        name.push(MANIFEST_EXTENSION);
        PathBuf::from(name)
    }

    /// Write next to the data file and return the path written
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::path_for(&self.data_file);
        self.save_to_path(&path)?;
        Ok(path)
    }

    /// Write to `path`, replacing it atomically
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let file = fs::File::create(&temp_path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;

        fs::rename(&temp_path, path)?;

        tracing::debug!("Saved rip manifest to {:?}", path);
        Ok(())
    }

    /// Read and validate a manifest
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);
        let manifest: Self = serde_json::from_reader(reader)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check internal consistency of a deserialized manifest
    pub fn validate(&self) -> Result<()> {
        if self.version > MANIFEST_VERSION {
            return Err(Error::InvalidManifest(format!(
                "version {} is newer than supported version {}",
                self.version, MANIFEST_VERSION
            )));
        }

        let sectors = self.range.length();
        if !self.errors.is_well_formed() || self.errors.bit_count() as u64 != sectors {
            return Err(Error::InvalidManifest(format!(
                "error map does not cover {} sectors",
                sectors
            )));
        }

        if let Some(hashes) = &self.hashes {
            if hashes.len() as u64 != sectors {
                return Err(Error::InvalidManifest(format!(
                    "{} digests for {} sectors",
                    hashes.len(),
                    sectors
                )));
            }
            for hex in hashes.iter().flatten() {
                hex_to_digest(hex)?;
            }
        }
        Ok(())
    }

    /// Number of flagged sectors
    pub fn error_count(&self) -> usize {
        self.errors.count_of_ones()
    }

    /// Flagged sectors, ascending
    pub fn error_sectors(&self) -> Vec<u64> {
        self.errors
            .iter_ones()
            .map(|i| self.range.first() + i as u64)
            .collect()
    }

    /// Digest recorded for `sector`
    pub fn digest_for_sector(&self, sector: u64) -> Option<SectorDigest> {
        if !self.range.contains_sector(sector) {
            return None;
        }
        let index = (sector - self.range.first()) as usize;
        let hex = self.hashes.as_ref()?.get(index)?.as_ref()?;
        hex_to_digest(hex).ok()
    }
}

/// Convert bytes to a lowercase hex string
pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Parse a 64-character hex digest
fn hex_to_digest(hex: &str) -> Result<SectorDigest> {
    let mut digest = [0u8; 32];
    if hex.len() != digest.len() * 2 || !hex.is_ascii() {
        return Err(Error::InvalidManifest(format!(
            "digest must be 64 hex characters, got {:?}",
            hex
        )));
    }
    for (i, byte) in digest.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| {
            Error::InvalidManifest(format!("invalid hex character at position {}", i * 2))
        })?;
    }
    Ok(digest)
}

// ============================================================================
// UNIT TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rip::sector_digest;
    use tempfile::TempDir;

    fn sample(dir: &Path) -> RipManifest {
        let mut errors = BitArray::new(4);
        errors.set_value(true, 2);
        RipManifest {
            version: MANIFEST_VERSION,
            range: SectorRange::new(1000, 1003),
            data_file: dir.join("track01.pcm"),
            errors,
            hashes: Some(vec![
                Some(bytes_to_hex(&sector_digest(&[1u8; 2352]))),
                None,
                Some(bytes_to_hex(&sector_digest(&[2u8; 2352]))),
                None,
            ]),
        }
    }

    #[test]
    fn test_path_for() {
        assert_eq!(
            RipManifest::path_for(Path::new("/tmp/track01.pcm")),
            PathBuf::from("/tmp/track01.pcm.json")
        );
        assert_eq!(
            RipManifest::path_for(Path::new("noext")),
            PathBuf::from("noext.json")
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let manifest = sample(dir.path());

        let path = manifest.save().unwrap();
        assert_eq!(path, dir.path().join("track01.pcm.json"));
        assert!(!dir.path().join("track01.pcm.tmp").exists());

        let loaded = RipManifest::load_from_path(&path).unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.error_count(), 1);
        assert_eq!(loaded.error_sectors(), vec![1002]);
        assert_eq!(
            loaded.digest_for_sector(1000),
            Some(sector_digest(&[1u8; 2352]))
        );
        assert_eq!(loaded.digest_for_sector(1001), None);
        assert_eq!(loaded.digest_for_sector(2000), None);
    }

    #[test]
    fn test_load_rejects_inconsistent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");

        let mut manifest = sample(dir.path());
        manifest.errors = BitArray::new(3);
        manifest.save_to_path(&path).unwrap();
        assert!(matches!(
            RipManifest::load_from_path(&path),
            Err(Error::InvalidManifest(_))
        ));

        let mut manifest = sample(dir.path());
        manifest.hashes = Some(vec![None; 2]);
        manifest.save_to_path(&path).unwrap();
        assert!(RipManifest::load_from_path(&path).is_err());

        let mut manifest = sample(dir.path());
        manifest.hashes = Some(vec![Some("zz".repeat(32)), None, None, None]);
        manifest.save_to_path(&path).unwrap();
        assert!(RipManifest::load_from_path(&path).is_err());

        let mut manifest = sample(dir.path());
        manifest.version = MANIFEST_VERSION + 1;
        manifest.save_to_path(&path).unwrap();
        assert!(RipManifest::load_from_path(&path).is_err());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("garbage.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            RipManifest::load_from_path(&path),
            Err(Error::Manifest(_))
        ));
    }

    #[test]
    fn test_load_rejects_empty_range() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reversed.json");

        let mut json = serde_json::to_value(sample(dir.path())).unwrap();
        json["range"] = serde_json::json!({ "first": 10, "last": 2 });
        fs::write(&path, json.to_string()).unwrap();

        assert!(matches!(
            RipManifest::load_from_path(&path),
            Err(Error::Manifest(_))
        ));
    }

    #[test]
    fn test_hashes_omitted_when_absent() {
        let dir = TempDir::new().unwrap();
        let mut manifest = sample(dir.path());
        manifest.hashes = None;
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(!json.contains("hashes"));
    }

    #[test]
    fn test_hex_roundtrip() {
        let digest = sector_digest(b"audio");
        let hex = bytes_to_hex(&digest);
        assert_eq!(hex.len(), 64);
        assert_eq!(hex_to_digest(&hex).unwrap(), digest);
        assert!(hex_to_digest("abc").is_err());
    }
}
