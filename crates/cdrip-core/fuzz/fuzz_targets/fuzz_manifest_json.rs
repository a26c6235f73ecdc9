//! Fuzz test for rip manifest JSON parsing
//!
//! Manifests that deserialize but describe an inconsistent rip must be
//! rejected by validation, never trusted.

#![no_main]

use cdrip_core::RipManifest;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    let Ok(manifest) = serde_json::from_str::<RipManifest>(data) else {
        return;
    };
    if manifest.validate().is_ok() {
        assert_eq!(manifest.errors.bit_count() as u64, manifest.range.length());
        for sector in manifest.error_sectors() {
            assert!(manifest.range.contains_sector(sector));
            let _ = manifest.digest_for_sector(sector);
        }
        let _ = serde_json::to_string_pretty(&manifest);
    }
});
