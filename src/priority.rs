//! Per-torrent, three disjoint sets of half-open index ranges `{OFF, NORMAL, HIGH}`.
//! Hand-rolled over `Vec<Range<u32>>` with binary search rather than an
//! interval-tree crate -- no dependency in the retrieval pack reaches for one for this shape of
//! problem, and bip-rs generally prefers small owned containers (e.g. `bit_set::BitSet`) over
//! heavier crates.

use std::ops::Range;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PriorityClass {
    Off,
    Normal,
    High,
}

/// Sorted, disjoint half-open index ranges for one priority class.
#[derive(Clone, Debug, Default)]
struct ClassRanges {
    ranges: Vec<Range<u32>>,
}

impl ClassRanges {
    fn insert(&mut self, begin: u32, end: u32) {
        debug_assert!(begin < end);
        debug_assert!(
            self.ranges.last().map(|r| r.end <= begin).unwrap_or(true),
            "ranges within a class must be inserted in increasing, non-overlapping order"
        );
        self.ranges.push(begin..end);
    }

    /// Index of the range containing `index`, or `Err(insertion point)` if none does.
    fn find_index(&self, index: u32) -> Result<usize, usize> {
        self.ranges.binary_search_by(|range| {
            if index < range.start {
                std::cmp::Ordering::Greater
            } else if index >= range.end {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        })
    }

    fn has(&self, index: u32) -> bool {
        self.find_index(index).is_ok()
    }

    fn clear(&mut self) {
        self.ranges.clear();
    }
}

/// The three disjoint range sets for one torrent. Invariant: any index belongs to at most one
/// class at a time; moving an index between classes is the caller's responsibility (remove then
/// re-`insert`, since insert requires increasing, non-overlapping order per class).
#[derive(Clone, Debug, Default)]
pub struct PriorityRanges {
    off: ClassRanges,
    normal: ClassRanges,
    high: ClassRanges,
}

impl PriorityRanges {
    pub fn new() -> PriorityRanges {
        PriorityRanges::default()
    }

    fn class(&self, class: PriorityClass) -> &ClassRanges {
        match class {
            PriorityClass::Off => &self.off,
            PriorityClass::Normal => &self.normal,
            PriorityClass::High => &self.high,
        }
    }

    fn class_mut(&mut self, class: PriorityClass) -> &mut ClassRanges {
        match class {
            PriorityClass::Off => &mut self.off,
            PriorityClass::Normal => &mut self.normal,
            PriorityClass::High => &mut self.high,
        }
    }

    /// Insert a half-open range `[begin, end)` into `class`. Callers guarantee inserts for a
    /// class arrive in increasing order and do not overlap within the class.
    pub fn insert(&mut self, class: PriorityClass, begin: u32, end: u32) {
        self.class_mut(class).insert(begin, end);
    }

    /// Returns the range containing `index` within `class`, if any.
    pub fn find(&self, class: PriorityClass, index: u32) -> Option<Range<u32>> {
        self.class(class)
            .find_index(index)
            .ok()
            .map(|i| self.class(class).ranges[i].clone())
    }

    pub fn has(&self, class: PriorityClass, index: u32) -> bool {
        self.class(class).has(index)
    }

    /// Priority class for `index`, defaulting to `Off` if it is in none of the sets.
    pub fn class_of(&self, index: u32) -> PriorityClass {
        if self.high.has(index) {
            PriorityClass::High
        } else if self.normal.has(index) {
            PriorityClass::Normal
        } else {
            PriorityClass::Off
        }
    }

    pub fn clear(&mut self) {
        self.off.clear();
        self.normal.clear();
        self.high.clear();
    }

    pub fn ranges(&self, class: PriorityClass) -> impl Iterator<Item = &Range<u32>> {
        self.class(class).ranges.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_find() {
        let mut ranges = PriorityRanges::new();
        ranges.insert(PriorityClass::High, 0, 5);
        ranges.insert(PriorityClass::High, 10, 20);
        ranges.insert(PriorityClass::Normal, 5, 10);

        assert!(ranges.has(PriorityClass::High, 3));
        assert!(!ranges.has(PriorityClass::High, 7));
        assert!(ranges.has(PriorityClass::Normal, 7));
        assert_eq!(ranges.find(PriorityClass::High, 15), Some(10..20));
        assert_eq!(ranges.class_of(7), PriorityClass::Normal);
        assert_eq!(ranges.class_of(100), PriorityClass::Off);
    }

    #[test]
    fn clear_empties_all_classes() {
        let mut ranges = PriorityRanges::new();
        ranges.insert(PriorityClass::High, 0, 5);
        ranges.clear();
        assert!(!ranges.has(PriorityClass::High, 2));
    }

    #[test]
    fn at_most_one_class_per_index() {
        let mut ranges = PriorityRanges::new();
        ranges.insert(PriorityClass::High, 0, 3);
        ranges.insert(PriorityClass::Normal, 3, 6);
        for i in 0..6 {
            let classes: Vec<_> = [PriorityClass::Off, PriorityClass::Normal, PriorityClass::High]
                .iter()
                .filter(|&&c| ranges.has(c, i))
                .collect();
            assert!(classes.len() <= 1);
        }
    }
}
