use rand::Rng;
use serde::{Deserialize, Serialize};

const WORD_BITS: usize = u64::BITS as usize;

/// A key as a packed bitset. Bit `i` of the key lives at bit `i % 64` of word
/// `i / 64`; bits past `len` are kept zero.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    words: Vec<u64>,
    len: usize,
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key[{};", self.len)?;
        for word in self.words.iter().rev() {
            write!(f, " {word:016x}")?
        }
        write!(f, "]")
    }
}

impl Key {
    pub fn zeros(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
        }
    }

    pub fn ones(len: usize) -> Self {
        let mut key = Self {
            words: vec![!0; len.div_ceil(WORD_BITS)],
            len,
        };
        key.mask_tail();
        key
    }

    pub fn random(rng: &mut impl Rng, len: usize) -> Self {
        let mut key = Self {
            words: (0..len.div_ceil(WORD_BITS)).map(|_| rng.gen()).collect(),
            len,
        };
        key.mask_tail();
        key
    }

    /// A copy with the given bit positions flipped.
    pub fn flipped_at(&self, positions: &[usize]) -> Self {
        let mut key = self.clone();
        for &position in positions {
            key.flip(position)
        }
        key
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.len);
        self.words[index / WORD_BITS] >> (index % WORD_BITS) & 1 == 1
    }

    pub fn flip(&mut self, index: usize) {
        assert!(index < self.len);
        self.words[index / WORD_BITS] ^= 1 << (index % WORD_BITS)
    }

    /// XOR of bits `[begin, end)`, word at a time.
    pub fn range_parity(&self, begin: usize, end: usize) -> bool {
        assert!(begin <= end && end <= self.len);
        let mut acc = 0;
        for word in begin / WORD_BITS..end.div_ceil(WORD_BITS) {
            let mut mask = !0u64;
            if word == begin / WORD_BITS {
                mask &= !0 << (begin % WORD_BITS)
            }
            // only reachable when `end` is not word aligned, the shift is safe
            if word == end / WORD_BITS {
                mask &= (1 << (end % WORD_BITS)) - 1
            }
            acc ^= self.words[word] & mask
        }
        // parity of an XOR accumulator is the parity of all masked bits
        acc.count_ones() % 2 == 1
    }

    /// XOR over an arbitrary set of bit positions (permuted blocks).
    pub fn parity_over(&self, positions: &[usize]) -> bool {
        positions
            .iter()
            .fold(false, |parity, &position| parity ^ self.get(position))
    }

    /// Number of differing bit positions.
    pub fn hamming(&self, other: &Self) -> usize {
        assert_eq!(self.len, other.len);
        self.words
            .iter()
            .zip(&other.words)
            .map(|(a, b)| (a ^ b).count_ones() as usize)
            .sum()
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    fn mask_tail(&mut self) {
        if self.len % WORD_BITS != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1 << (self.len % WORD_BITS)) - 1
            }
        }
    }
}
