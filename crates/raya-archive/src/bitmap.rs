//! Fixed-size bitset backing the reference and pointer maps
//!
//! One bit describes one slot of an archived region. Bits live in `u64`
//! words, least significant bit first, so a map can be written into an
//! archive file and read back verbatim.

use std::fmt;
use std::ops::Range;

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Fixed-size bitset
#[derive(Clone, PartialEq, Eq)]
pub struct BitMap {
    words: Vec<u64>,
    size: usize,
}

impl BitMap {
    /// Create a bitset of `size` bits, all clear
    pub fn new(size: usize) -> Self {
        Self {
            words: vec![0; size.div_ceil(BITS_PER_WORD)],
            size,
        }
    }

    /// Rebuild a bitset from its backing words
    ///
    /// Returns `None` if the word count does not match `size` or if any bit
    /// beyond `size` is set.
    pub fn from_words(words: Vec<u64>, size: usize) -> Option<Self> {
        if words.len() != size.div_ceil(BITS_PER_WORD) {
            return None;
        }
        let tail = size % BITS_PER_WORD;
        if tail != 0 {
            let last = *words.last()?;
            if last >> tail != 0 {
                return None;
            }
        }
        Some(Self { words, size })
    }

    /// Number of bits
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Check if the bitset has no bits at all
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Backing words, least significant bit first
    #[inline]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Set bit `index`
    #[inline]
    pub fn set(&mut self, index: usize) {
        assert!(index < self.size, "bit {} out of range {}", index, self.size);
        self.words[index / BITS_PER_WORD] |= 1u64 << (index % BITS_PER_WORD);
    }

    /// Clear bit `index`
    #[inline]
    pub fn clear(&mut self, index: usize) {
        assert!(index < self.size, "bit {} out of range {}", index, self.size);
        self.words[index / BITS_PER_WORD] &= !(1u64 << (index % BITS_PER_WORD));
    }

    /// Test bit `index`
    #[inline]
    pub fn at(&self, index: usize) -> bool {
        assert!(index < self.size, "bit {} out of range {}", index, self.size);
        self.words[index / BITS_PER_WORD] & (1u64 << (index % BITS_PER_WORD)) != 0
    }

    /// Number of set bits
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// First set bit at or after `from`
    pub fn find_first_set_bit(&self, from: usize) -> Option<usize> {
        self.find_first_set_bit_in(from, self.size)
    }

    /// First set bit in `[from, end)`
    pub fn find_first_set_bit_in(&self, from: usize, end: usize) -> Option<usize> {
        let end = end.min(self.size);
        if from >= end {
            return None;
        }

        let mut word_idx = from / BITS_PER_WORD;
        let mut word = self.words[word_idx] & (!0u64 << (from % BITS_PER_WORD));
        loop {
            if word != 0 {
                let idx = word_idx * BITS_PER_WORD + word.trailing_zeros() as usize;
                return (idx < end).then_some(idx);
            }
            word_idx += 1;
            if word_idx * BITS_PER_WORD >= end {
                return None;
            }
            word = self.words[word_idx];
        }
    }

    /// Call `f` for every set bit in `range`, in ascending order
    ///
    /// Iteration stops early when `f` returns `false`; the return value tells
    /// whether the whole range was visited.
    pub fn iterate<F>(&self, range: Range<usize>, mut f: F) -> bool
    where
        F: FnMut(usize) -> bool,
    {
        let mut cursor = range.start;
        while let Some(idx) = self.find_first_set_bit_in(cursor, range.end) {
            if !f(idx) {
                return false;
            }
            cursor = idx + 1;
        }
        true
    }

    /// Iterator over set bits in `range`
    pub fn iter_ones(&self, range: Range<usize>) -> SetBits<'_> {
        SetBits {
            map: self,
            next: range.start,
            end: range.end,
        }
    }
}

impl fmt::Debug for BitMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitMap")
            .field("size", &self.size)
            .field("set", &self.count_ones())
            .finish()
    }
}

/// Iterator returned by [`BitMap::iter_ones`]
pub struct SetBits<'a> {
    map: &'a BitMap,
    next: usize,
    end: usize,
}

impl Iterator for SetBits<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let idx = self.map.find_first_set_bit_in(self.next, self.end)?;
        self.next = idx + 1;
        Some(idx)
    }
}
