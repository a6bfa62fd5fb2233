use std::ops::Range;

/// The byte ranges of one piece received so far.
///
/// Ranges are kept sorted, non-overlapping and non-adjacent, so the covered
/// byte count is exact no matter how often a range is reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coverage {
    ranges: Vec<Range<u32>>,
}

impl Coverage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `range` and returns how many bytes were not covered before.
    pub fn insert(&mut self, range: Range<u32>) -> u32 {
        if range.is_empty() {
            return 0;
        }
        let before = self.covered();
        let (mut start, mut end) = (range.start, range.end);
        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;

        for r in self.ranges.drain(..) {
            if r.end < start {
                merged.push(r);
            } else if r.start > end {
                if !placed {
                    merged.push(start..end);
                    placed = true;
                }
                merged.push(r);
            } else {
                start = start.min(r.start);
                end = end.max(r.end);
            }
        }
        if !placed {
            merged.push(start..end);
        }
        self.ranges = merged;
        self.covered() - before
    }

    /// Total number of covered bytes.
    pub fn covered(&self) -> u32 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }

    /// True if every byte of `range` is already covered.
    pub fn contains(&self, range: &Range<u32>) -> bool {
        range.is_empty()
            || self
                .ranges
                .iter()
                .any(|r| r.start <= range.start && range.end <= r.end)
    }

    /// The first uncovered range within `0..limit`.
    pub fn first_gap(&self, limit: u32) -> Option<Range<u32>> {
        let mut cursor = 0;
        for r in &self.ranges {
            if r.start >= limit {
                break;
            }
            if r.start > cursor {
                return Some(cursor..r.start);
            }
            cursor = cursor.max(r.end);
        }
        (cursor < limit).then_some(cursor..limit)
    }

    pub fn is_complete(&self, length: u32) -> bool {
        self.first_gap(length).is_none()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn ranges(&self) -> &[Range<u32>] {
        &self.ranges
    }
}
