//! Fuzz test for READ TOC (full TOC) response parsing
//!
//! Drives return whatever they like; parsing must reject bad data with an
//! error and never panic.

#![no_main]

use cdrip_core::mmc::parse_full_toc;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(toc) = parse_full_toc(data) {
        // Anything accepted must be internally consistent
        let disc = toc.disc_range();
        assert!(disc.first() <= disc.last());
        assert!(toc.first_track() <= toc.last_track());

        for session in toc.sessions() {
            let _ = toc.session_range(session.number);
        }
        for track in toc.tracks() {
            if let Some(range) = toc.track_range(track.number) {
                assert!(range.first() >= track.first_sector);
                let _ = toc.session_containing_range(&range);
            }
        }
        let _ = toc.audio_tracks().count();
        let _ = serde_json::to_string(&toc);
    }
});
