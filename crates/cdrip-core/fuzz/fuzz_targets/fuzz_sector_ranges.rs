//! Fuzz test for sector range arithmetic

#![no_main]

use arbitrary::Arbitrary;
use cdrip_core::SectorRange;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    first: u32,
    length: u16,
    other_first: u32,
    other_length: u16,
    chunk: u8,
}

fuzz_target!(|input: Input| {
    if input.length == 0 || input.other_length == 0 {
        return;
    }
    let range = SectorRange::with_length(u64::from(input.first), u64::from(input.length));
    let other = SectorRange::with_length(u64::from(input.other_first), u64::from(input.other_length));

    if let Some(common) = range.intersection(&other) {
        assert!(range.contains_sector_range(&common));
        assert!(other.contains_sector_range(&common));
    }

    let chunk = u64::from(input.chunk.max(1));
    let mut next = range.first();
    for piece in range.chunks(chunk) {
        assert_eq!(piece.first(), next);
        assert!(piece.length() <= chunk);
        next = piece.last() + 1;
    }
    assert_eq!(next, range.last() + 1);
    assert_eq!(range.byte_size(), range.length() * 2352);
});
