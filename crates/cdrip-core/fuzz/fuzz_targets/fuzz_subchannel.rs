//! Fuzz test for subchannel and mode page parsing

#![no_main]

use cdrip_core::mmc::{parse_capabilities, parse_isrc, parse_mcn};
use cdrip_core::QSubchannel;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(q) = QSubchannel::parse(data) {
        let _ = q.absolute_lba();
    }

    if let Some(mcn) = parse_mcn(data) {
        assert!(mcn.len() <= 13);
        assert!(mcn.bytes().all(|b| b.is_ascii_alphanumeric()));
    }

    if let Some(isrc) = parse_isrc(data) {
        assert!(isrc.len() <= 12);
        assert!(isrc.is_ascii());
    }

    let _ = parse_capabilities(data);
});
