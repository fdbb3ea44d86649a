//! Bit strings much longer than a single machine word.
//!
//! Bit `i` lives in word `i / 64` at position `i % 64`, counting from the least
//! significant bit. Scans for set bits use the hardware trailing-zero count.

/// Selects the even-indexed bit of every pair in a word.
const EVEN_BITS: u64 = 0x5555_5555_5555_5555;

const WORD_BITS: usize = u64::BITS as usize;

/// A fixed-length bit set.
pub struct Bitmap {
    num_bits: usize,
    map: Box<[u64]>,
    /// Number of set bits.
    ones: usize,
    /// Every word below this index is zero.
    lowest: usize,
}

impl Bitmap {
    /// Constructs a bitmap of `num_bits` cleared bits.
    pub fn new(num_bits: usize) -> Bitmap {
        let num_words = Self::num_words(num_bits);

        Bitmap {
            num_bits,
            map: vec![0; num_words].into_boxed_slice(),
            ones: 0,
            lowest: num_words,
        }
    }

    /// Returns the number of `u64` words needed to hold `num_bits` bits.
    #[inline]
    pub const fn num_words(num_bits: usize) -> usize {
        (num_bits + WORD_BITS - 1) / WORD_BITS
    }

    /// Returns a tuple of the index of the word containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u64) {
        (bit / WORD_BITS, 1 << (bit % WORD_BITS))
    }

    /// Returns the number of bits in the bitmap.
    #[inline]
    pub fn len(&self) -> usize {
        self.num_bits
    }

    /// Returns the number of set bits.
    #[inline]
    pub fn count_ones(&self) -> usize {
        self.ones
    }

    /// Gets the value of the indexed bit.
    #[cfg(test)]
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.num_bits, "bit {index} out of range");

        let (word, mask) = Self::index_and_mask(index);
        self.map[word] & mask != 0
    }

    /// Sets the value of the indexed bit, returning its previous value.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) -> bool {
        assert!(index < self.num_bits, "bit {index} out of range");

        let (word, mask) = Self::index_and_mask(index);
        let old = self.map[word] & mask != 0;

        match (old, value) {
            (false, true) => {
                self.map[word] |= mask;
                self.ones += 1;
                self.lowest = self.lowest.min(word);
            }
            (true, false) => {
                self.map[word] &= !mask;
                self.ones -= 1;
            }
            _ => (),
        }

        old
    }

    /// Sets every bit to `value`.
    pub fn fill(&mut self, value: bool) {
        if !value {
            self.map.fill(0);
            self.ones = 0;
            self.lowest = self.map.len();
            return;
        }

        self.map.fill(u64::MAX);
        let tail = self.num_bits % WORD_BITS;
        if tail != 0 {
            if let Some(last) = self.map.last_mut() {
                *last = (1 << tail) - 1;
            }
        }
        self.ones = self.num_bits;
        self.lowest = 0;
    }

    /// Returns the index of the lowest set bit, or `None` if no bit is set.
    pub fn first_set(&self) -> Option<usize> {
        if self.ones == 0 {
            return None;
        }

        self.map[self.lowest..]
            .iter()
            .position(|&w| w != 0)
            .map(|i| {
                let word = self.lowest + i;
                word * WORD_BITS + self.map[word].trailing_zeros() as usize
            })
    }

    /// Clears the lowest set bit and returns its index.
    pub fn pop_first(&mut self) -> Option<usize> {
        let bit = self.first_set()?;
        // Every word below the one holding `bit` is zero.
        self.lowest = bit / WORD_BITS;
        self.set(bit, false);
        Some(bit)
    }

    /// Returns an iterator over the indices of all set bits, in increasing
    /// order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.map
            .iter()
            .enumerate()
            .skip(self.lowest)
            .flat_map(|(wi, &word)| {
                let mut w = word;
                core::iter::from_fn(move || {
                    if w == 0 {
                        return None;
                    }
                    let bit = w.trailing_zeros() as usize;
                    w &= w - 1;
                    Some(wi * WORD_BITS + bit)
                })
            })
    }

    /// Finds every aligned pair of set bits `(2k, 2k + 1)`, clears both bits,
    /// and calls `f(k)` for each.
    ///
    /// Returns the number of pairs found.
    pub fn take_pairs(&mut self, mut f: impl FnMut(usize)) -> usize {
        let mut found = 0;

        for wi in self.lowest..self.map.len() {
            let word = self.map[wi];
            let mut pairs = word & (word >> 1) & EVEN_BITS;
            if pairs == 0 {
                continue;
            }

            self.map[wi] = word & !(pairs | (pairs << 1));

            while pairs != 0 {
                let bit = pairs.trailing_zeros() as usize;
                pairs &= pairs - 1;
                f((wi * WORD_BITS + bit) / 2);
                found += 1;
            }
        }

        self.ones -= 2 * found;
        found
    }
}

impl core::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bitmap")
            .field("num_bits", &self.num_bits)
            .field("ones", &self.ones)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_many() {
        for num_bits in 0..=256 {
            let b = Bitmap::new(num_bits);
            assert_eq!(b.len(), num_bits);
            assert_eq!(b.first_set(), None);
        }
    }

    #[test]
    fn set_get_clear() {
        let mut b = Bitmap::new(600);

        assert!(!b.set(1, true));
        assert!(!b.set(2, true));
        assert!(!b.set(3, true));
        assert!(b.set(3, true));
        assert_eq!(b.count_ones(), 3);
        assert!(b.get(2));
        assert!(!b.get(4));

        b.fill(false);
        assert_eq!(b.count_ones(), 0);
        assert_eq!(b.first_set(), None);

        b.set(513, true);
        assert_eq!(b.first_set(), Some(513));

        b.set(513, false);
        assert_eq!(b.first_set(), None);
    }

    #[test]
    fn fill_respects_length() {
        let mut b = Bitmap::new(70);
        b.fill(true);
        assert_eq!(b.count_ones(), 70);
        assert_eq!(b.iter_ones().count(), 70);
        assert_eq!(b.iter_ones().last(), Some(69));
    }

    #[test]
    fn pop_first_ascends() {
        let mut b = Bitmap::new(300);
        for i in [299, 5, 64, 128, 6] {
            b.set(i, true);
        }

        let popped: Vec<_> = core::iter::from_fn(|| b.pop_first()).collect();
        assert_eq!(popped, vec![5, 6, 64, 128, 299]);
        assert_eq!(b.count_ones(), 0);

        // Setting a bit below the scan hint must still be found.
        b.set(1, true);
        assert_eq!(b.pop_first(), Some(1));
    }

    #[test]
    fn take_pairs_only_takes_aligned_pairs() {
        let mut b = Bitmap::new(200);
        // (0, 1) is a pair, (3, 4) is not, (62, 63) and (64, 65) straddle no
        // word boundary, (127, 128) is unaligned.
        for i in [0, 1, 3, 4, 62, 63, 64, 65, 127, 128] {
            b.set(i, true);
        }

        let mut parents = Vec::new();
        let n = b.take_pairs(|k| parents.push(k));

        assert_eq!(n, 3);
        assert_eq!(parents, vec![0, 31, 32]);
        assert_eq!(b.iter_ones().collect::<Vec<_>>(), vec![3, 4, 127, 128]);
        assert_eq!(b.count_ones(), 4);
    }
}
