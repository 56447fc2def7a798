//! Bitmap-of-bitmaps over priority levels.
//!
//! Priority 0 is the most urgent. Each 32-bit word covers 32 levels and the
//! `active` word records which words are non-zero, so the most urgent set
//! level is found with two `trailing_zeros` instructions for up to 1024
//! levels.

use alloc::vec;
use alloc::vec::Vec;

pub(crate) const MAX_PRIORITY_LEVELS: u32 = 1024;

#[derive(Debug, Clone)]
pub(crate) struct PriorityMap {
    words: Vec<u32>,
    active: u32,
}

impl PriorityMap {
    /// Map covering `levels` priorities; `levels` is a multiple of 32.
    pub fn new(levels: u32) -> Self {
        assert!(
            levels > 0 && levels % 32 == 0 && levels <= MAX_PRIORITY_LEVELS,
            "priority levels {levels} out of range"
        );
        Self {
            words: vec![0; (levels / 32) as usize],
            active: 0,
        }
    }

    pub fn set(&mut self, prio: u32) {
        let (word, bit) = Self::split(prio);
        self.words[word] |= bit;
        self.active |= 1 << word;
    }

    pub fn clear(&mut self, prio: u32) {
        let (word, bit) = Self::split(prio);
        self.words[word] &= !bit;
        if self.words[word] == 0 {
            self.active &= !(1 << word);
        }
    }

    #[cfg(test)]
    pub fn contains(&self, prio: u32) -> bool {
        let (word, bit) = Self::split(prio);
        self.words[word] & bit != 0
    }

    /// Most urgent (numerically lowest) set priority.
    pub fn lowest(&self) -> Option<u32> {
        if self.active == 0 {
            return None;
        }
        let word = self.active.trailing_zeros();
        let bit = self.words[word as usize].trailing_zeros();
        Some(word * 32 + bit)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    /// Set priorities, most urgent first.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(word, &bits)| {
            let mut remaining = bits;
            core::iter::from_fn(move || {
                if remaining == 0 {
                    return None;
                }
                let bit = remaining.trailing_zeros();
                remaining &= remaining - 1;
                Some(word as u32 * 32 + bit)
            })
        })
    }

    fn split(prio: u32) -> (usize, u32) {
        ((prio / 32) as usize, 1 << (prio % 32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_tracks_most_urgent_level() {
        let mut map = PriorityMap::new(64);
        assert_eq!(map.lowest(), None);

        map.set(40);
        map.set(7);
        assert_eq!(map.lowest(), Some(7));

        map.clear(7);
        assert_eq!(map.lowest(), Some(40));
        assert!(map.contains(40));

        map.clear(40);
        assert!(map.is_empty());
    }

    #[test]
    fn spans_many_words() {
        let mut map = PriorityMap::new(MAX_PRIORITY_LEVELS);
        map.set(1023);
        map.set(512);
        map.set(33);
        assert_eq!(map.iter().collect::<Vec<_>>(), vec![33, 512, 1023]);
        assert_eq!(map.lowest(), Some(33));
    }
}
