//! Packed bitmap holding one flag per sector

use serde::{Deserialize, Serialize};

const WORD_BITS: usize = u64::BITS as usize;

/// Fixed-size packed array of bits
///
/// Bits past `bit_count` in the final word are always zero, so word-level
/// scans never need masking on read.
///
/// Indexing outside `0..bit_count` is a contract violation and panics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitArray {
    bit_count: usize,
    words: Vec<u64>,
}

impl BitArray {
    /// Array of `bit_count` zero bits
    pub fn new(bit_count: usize) -> Self {
        Self {
            bit_count,
            words: vec![0; bit_count.div_ceil(WORD_BITS)],
        }
    }

    /// Number of bits held
    pub fn bit_count(&self) -> usize {
        self.bit_count
    }

    /// Resize to `bit_count` bits
    ///
    /// Bits below the smaller of the old and new counts keep their value;
    /// bits added by growing are zero; bits removed by shrinking are gone and
    /// come back as zero if the array grows again.
    pub fn set_bit_count(&mut self, bit_count: usize) {
        self.words.resize(bit_count.div_ceil(WORD_BITS), 0);
        self.bit_count = bit_count;
        self.clear_unused_bits();
    }

    /// Value of the bit at `index`
    ///
    /// # Panics
    ///
    /// Panics if `index >= bit_count`.
    pub fn value_at_index(&self, index: usize) -> bool {
        self.check_index(index);
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Set the bit at `index`
    ///
    /// # Panics
    ///
    /// Panics if `index >= bit_count`.
    pub fn set_value(&mut self, value: bool, index: usize) {
        self.check_index(index);
        let mask = 1u64 << (index % WORD_BITS);
        let word = &mut self.words[index / WORD_BITS];
        if value {
            *word |= mask;
        } else {
            *word &= !mask;
        }
    }

    /// True if every bit is zero
    pub fn all_zeroes(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// True if every bit is one
    pub fn all_ones(&self) -> bool {
        let full_words = self.bit_count / WORD_BITS;
        if !self.words[..full_words].iter().all(|&w| w == u64::MAX) {
            return false;
        }
        match self.bit_count % WORD_BITS {
            0 => true,
            tail => self.words[full_words] == (1u64 << tail) - 1,
        }
    }

    /// Number of one bits
    pub fn count_of_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Number of zero bits
    pub fn count_of_zeroes(&self) -> usize {
        self.bit_count - self.count_of_ones()
    }

    /// Clear every bit
    pub fn set_all_zeroes(&mut self) {
        self.words.fill(0);
    }

    /// Set every bit
    pub fn set_all_ones(&mut self) {
        self.words.fill(u64::MAX);
        self.clear_unused_bits();
    }

    /// Indices of the one bits, ascending
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut remaining = word;
            std::iter::from_fn(move || {
                if remaining == 0 {
                    return None;
                }
                let bit = remaining.trailing_zeros() as usize;
                remaining &= remaining - 1;
                Some(i * WORD_BITS + bit)
            })
        })
    }

    /// Storage matches `bit_count` and unused bits are clear
    ///
    /// Only a deserialized array can fail this.
    pub(crate) fn is_well_formed(&self) -> bool {
        if self.words.len() != self.bit_count.div_ceil(WORD_BITS) {
            return false;
        }
        let tail = self.bit_count % WORD_BITS;
        tail == 0 || self.words.last().is_some_and(|&w| w >> tail == 0)
    }

    fn check_index(&self, index: usize) {
        assert!(
            index < self.bit_count,
            "bit index {index} out of range for {} bits",
            self.bit_count
        );
    }

    fn clear_unused_bits(&mut self) {
        let tail = self.bit_count % WORD_BITS;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_zeroed() {
        for count in [0, 1, 63, 64, 65, 1000] {
            let bits = BitArray::new(count);
            assert_eq!(bits.bit_count(), count);
            assert!(bits.all_zeroes());
            assert_eq!(bits.count_of_zeroes(), count);
            assert_eq!(bits.count_of_ones(), 0);
        }
    }

    #[test]
    fn test_set_get_roundtrip() {
        let mut bits = BitArray::new(200);
        for i in 0..200 {
            let value = i % 3 == 0;
            bits.set_value(value, i);
            assert_eq!(bits.value_at_index(i), value);
        }
        for i in 0..200 {
            assert_eq!(bits.value_at_index(i), i % 3 == 0);
        }
        assert_eq!(bits.count_of_ones(), 67);

        bits.set_value(false, 0);
        assert!(!bits.value_at_index(0));
        assert_eq!(bits.count_of_ones(), 66);
    }

    #[test]
    fn test_set_all_ones_and_zeroes() {
        for count in [1, 63, 64, 65, 128, 130] {
            let mut bits = BitArray::new(count);
            bits.set_all_ones();
            assert!(bits.all_ones());
            assert!(!bits.all_zeroes());
            assert_eq!(bits.count_of_ones(), count);
            assert_eq!(bits.count_of_zeroes(), 0);

            bits.set_all_zeroes();
            assert!(bits.all_zeroes());
            assert!(!bits.all_ones());
            assert_eq!(bits.count_of_zeroes(), count);
            assert_eq!(bits.count_of_ones(), 0);
        }
    }

    #[test]
    fn test_all_ones_detects_single_zero() {
        let mut bits = BitArray::new(130);
        bits.set_all_ones();
        bits.set_value(false, 129);
        assert!(!bits.all_ones());
        bits.set_value(true, 129);
        bits.set_value(false, 5);
        assert!(!bits.all_ones());
    }

    #[test]
    fn test_empty_array() {
        let mut bits = BitArray::new(0);
        assert!(bits.all_zeroes());
        assert!(bits.all_ones());
        bits.set_all_ones();
        assert_eq!(bits.count_of_ones(), 0);
    }

    #[test]
    fn test_grow_preserves_and_zero_extends() {
        let mut bits = BitArray::new(10);
        bits.set_all_ones();
        bits.set_bit_count(100);
        assert_eq!(bits.bit_count(), 100);
        assert_eq!(bits.count_of_ones(), 10);
        for i in 0..10 {
            assert!(bits.value_at_index(i));
        }
        for i in 10..100 {
            assert!(!bits.value_at_index(i));
        }
    }

    #[test]
    fn test_shrink_truncates() {
        let mut bits = BitArray::new(100);
        bits.set_all_ones();
        bits.set_bit_count(70);
        assert_eq!(bits.count_of_ones(), 70);
        assert!(bits.all_ones());

        // Bits dropped by shrinking do not reappear
        bits.set_bit_count(100);
        assert_eq!(bits.count_of_ones(), 70);
        assert!(!bits.value_at_index(70));
    }

    #[test]
    fn test_iter_ones() {
        let mut bits = BitArray::new(150);
        for i in [0, 7, 63, 64, 100, 149] {
            bits.set_value(true, i);
        }
        let ones: Vec<_> = bits.iter_ones().collect();
        assert_eq!(ones, vec![0, 7, 63, 64, 100, 149]);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_get_out_of_range_panics() {
        let bits = BitArray::new(64);
        let _ = bits.value_at_index(64);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_set_out_of_range_panics() {
        let mut bits = BitArray::new(65);
        bits.set_value(true, 65);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut bits = BitArray::new(70);
        bits.set_value(true, 3);
        bits.set_value(true, 69);
        let json = serde_json::to_string(&bits).unwrap();
        let back: BitArray = serde_json::from_str(&json).unwrap();
        assert_eq!(bits, back);
        assert!(back.is_well_formed());

        let bogus: BitArray = serde_json::from_str(r#"{"bit_count":70,"words":[0]}"#).unwrap();
        assert!(!bogus.is_well_formed());
        let dirty: BitArray =
            serde_json::from_str(r#"{"bit_count":65,"words":[0,6]}"#).unwrap();
        assert!(!dirty.is_well_formed());
    }
}
