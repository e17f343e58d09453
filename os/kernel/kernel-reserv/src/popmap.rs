//! Population bitmaps.
//!
//! One bit per base page of a reservation; a set bit means the page is
//! populated (handed out to the owning object).

use alloc::boxed::Box;
use alloc::vec;

const BITS: usize = u64::BITS as usize;

pub struct PopMap {
    words: Box<[u64]>,
}

impl PopMap {
    /// An empty map able to track `bits` pages.
    #[must_use]
    pub fn new(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(BITS)].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn set(&mut self, i: usize) {
        self.words[i / BITS] |= 1 << (i % BITS);
    }

    #[inline]
    pub fn clear(&mut self, i: usize) {
        self.words[i / BITS] &= !(1 << (i % BITS));
    }

    #[inline]
    #[must_use]
    pub fn is_set(&self, i: usize) -> bool {
        self.words[i / BITS] & (1 << (i % BITS)) != 0
    }

    #[inline]
    #[must_use]
    pub fn is_clear(&self, i: usize) -> bool {
        !self.is_set(i)
    }

    /// Number of set bits.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    /// Whether all `len` bits from `start` are set. `len` is a power of two
    /// and `start` a multiple of it, so short runs never straddle a word.
    #[must_use]
    pub fn is_run_full(&self, start: usize, len: usize) -> bool {
        debug_assert!(len.is_power_of_two() && start.is_multiple_of(len));
        if len >= BITS {
            self.words[start / BITS..(start + len) / BITS]
                .iter()
                .all(|&w| w == u64::MAX)
        } else {
            let mask = ((1_u64 << len) - 1) << (start % BITS);
            self.words[start / BITS] & mask == mask
        }
    }

    /// First index `>= from` and `< len` whose bit equals `set`.
    fn find_next(&self, from: usize, len: usize, set: bool) -> Option<usize> {
        if from >= len {
            return None;
        }
        let flip = if set { 0 } else { u64::MAX };
        let mut i = from / BITS;
        let mut word = (self.words[i] ^ flip) & (u64::MAX << (from % BITS));
        loop {
            if word != 0 {
                let pos = i * BITS + word.trailing_zeros() as usize;
                return (pos < len).then_some(pos);
            }
            i += 1;
            if i * BITS >= len {
                return None;
            }
            word = self.words[i] ^ flip;
        }
    }

    /// Maximal runs of clear bits in `[0, len)`, as half-open ranges.
    pub fn free_runs(&self, len: usize) -> FreeRuns<'_> {
        FreeRuns {
            map: self,
            pos: 0,
            len,
        }
    }

    /// Lowest `s` in `[lo, hi)` such that `[s, s + npages)` is clear,
    /// `s` is a multiple of `align` and the run does not cross a multiple of
    /// `bound`. Positions at or beyond `capacity` are never returned.
    ///
    /// The scan works on run boundaries: `w ^ (w << 1 | carry)` marks every
    /// bit that differs from its predecessor, so each marked bit alternately
    /// opens and closes a run of zeros.
    #[must_use]
    pub fn find_contig(
        &self,
        capacity: usize,
        lo: usize,
        hi: usize,
        npages: usize,
        align: usize,
        bound: usize,
    ) -> Option<usize> {
        debug_assert!(align.is_power_of_two() && bound.is_power_of_two());
        debug_assert!(npages > 0 && npages <= bound && hi <= capacity);
        if lo >= hi {
            return None;
        }

        let last = hi / BITS;
        let tail_bits = hi % BITS;
        let mut i = lo / BITS;
        // bits below `lo` count as populated
        let mut changes = self.words[i] | ((1_u64 << (lo % BITS)) - 1);
        if i == last {
            changes |= u64::MAX << tail_bits;
        }
        let mut run_start: Option<usize> = None;

        loop {
            changes ^= (changes << 1) | u64::from(run_start.is_none());
            while changes != 0 {
                let bit = changes.trailing_zeros() as usize;
                changes &= changes - 1;
                let pos = i * BITS + bit;

                let Some(mut s) = run_start.take() else {
                    run_start = Some(pos);
                    continue;
                };
                // clear run [s, pos)
                s = s.next_multiple_of(align);
                if s >= capacity {
                    return None;
                }
                if s + npages > s.next_multiple_of(bound) {
                    s = s.next_multiple_of(bound);
                    if s >= capacity {
                        return None;
                    }
                }
                if s + npages <= pos {
                    return Some(s);
                }
            }

            i += 1;
            changes = match i.cmp(&last) {
                core::cmp::Ordering::Less => self.words[i],
                core::cmp::Ordering::Equal if tail_bits == 0 => u64::MAX,
                core::cmp::Ordering::Equal => self.words[i] | (u64::MAX << tail_bits),
                core::cmp::Ordering::Greater => return None,
            };
        }
    }
}

pub struct FreeRuns<'a> {
    map: &'a PopMap,
    pos: usize,
    len: usize,
}

impl Iterator for FreeRuns<'_> {
    type Item = core::ops::Range<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let lo = self.map.find_next(self.pos, self.len, false)?;
        let hi = self.map.find_next(lo, self.len, true).unwrap_or(self.len);
        self.pos = hi;
        Some(lo..hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn map_with(bits: usize, set: &[usize]) -> PopMap {
        let mut m = PopMap::new(bits);
        for &i in set {
            m.set(i);
        }
        m
    }

    #[test]
    fn set_clear_count() {
        let mut m = PopMap::new(512);
        m.set(0);
        m.set(63);
        m.set(64);
        m.set(511);
        assert_eq!(m.count(), 4);
        assert!(m.is_set(63) && m.is_set(64));
        m.clear(63);
        assert!(m.is_clear(63));
        assert_eq!(m.count(), 3);
        m.clear_all();
        assert_eq!(m.count(), 0);
    }

    #[test]
    fn run_full_within_and_across_words() {
        let m = map_with(512, &(16..32).collect::<Vec<_>>());
        assert!(m.is_run_full(16, 16));
        assert!(!m.is_run_full(0, 16));
        assert!(!m.is_run_full(0, 64));

        let m = map_with(512, &(128..256).collect::<Vec<_>>());
        assert!(m.is_run_full(128, 128));
        assert!(m.is_run_full(192, 64));
        assert!(!m.is_run_full(0, 512));
    }

    #[test]
    fn free_runs_cover_gaps() {
        let m = map_with(128, &[0, 1, 5, 64, 127]);
        let runs: Vec<_> = m.free_runs(128).collect();
        assert_eq!(runs, [2..5, 6..64, 65..127]);

        let m = PopMap::new(16);
        assert_eq!(m.free_runs(16).collect::<Vec<_>>(), [0..16]);

        let m = map_with(64, &(0..16).collect::<Vec<_>>());
        assert_eq!(m.free_runs(16).count(), 0);
    }

    #[test]
    fn contig_lowest_fit() {
        let m = map_with(512, &[0, 3, 10]);
        assert_eq!(m.find_contig(512, 0, 512, 2, 1, 512), Some(1));
        assert_eq!(m.find_contig(512, 0, 512, 3, 1, 512), Some(4));
        assert_eq!(m.find_contig(512, 0, 512, 7, 1, 512), Some(11));
    }

    #[test]
    fn contig_alignment_and_boundary() {
        let m = map_with(512, &[0]);
        assert_eq!(m.find_contig(512, 0, 512, 4, 4, 512), Some(4));
        // [6, 10) crosses 8; the first fit that does not is 8
        let m = map_with(512, &[0, 1, 2, 3, 4, 5]);
        assert_eq!(m.find_contig(512, 0, 512, 4, 2, 8), Some(8));
    }

    #[test]
    fn contig_spans_words() {
        let mut set: Vec<usize> = (0..60).collect();
        set.extend(70..512);
        let m = map_with(512, &set);
        assert_eq!(m.find_contig(512, 0, 512, 10, 1, 512), Some(60));
        assert_eq!(m.find_contig(512, 0, 512, 11, 1, 512), None);
    }

    #[test]
    fn contig_respects_window() {
        let m = PopMap::new(512);
        assert_eq!(m.find_contig(512, 100, 104, 4, 1, 512), Some(100));
        assert_eq!(m.find_contig(512, 100, 103, 4, 1, 512), None);
        assert_eq!(m.find_contig(512, 0, 512, 16, 512, 512), Some(0));
        assert_eq!(m.find_contig(512, 1, 512, 16, 512, 512), None);
    }

    #[test]
    fn contig_full_map() {
        let m = map_with(64, &(0..64).collect::<Vec<_>>());
        assert_eq!(m.find_contig(64, 0, 64, 1, 1, 64), None);
    }
}
