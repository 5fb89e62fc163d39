//! Present-range bookkeeping used by sparse extent enumeration.

/// A run of bytes `[start, start + length)` that is stored somewhere in a disk's layer chain.
///
/// Ranges outside every reported extent read back as zeros, so consumers (e.g. sparse export)
/// may skip them entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamExtent {
    pub start: u64,
    pub length: u64,
}

impl StreamExtent {
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Shift the extent by `delta` bytes, e.g. when translating between an extent's local
    /// coordinates and its position in a concatenated layer.
    pub fn offset_by(&self, delta: i128) -> Option<StreamExtent> {
        let start = i128::from(self.start) + delta;
        u64::try_from(start)
            .ok()
            .map(|start| StreamExtent::new(start, self.length))
    }
}

/// A set of disjoint, sorted extents.
///
/// Invariants:
/// - Extents are stored in ascending order of `start`.
/// - No extents overlap or touch (adjacent extents are coalesced).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtentSet {
    extents: Vec<StreamExtent>,
}

impl ExtentSet {
    pub fn new() -> Self {
        Self {
            extents: Vec::new(),
        }
    }

    pub fn extents(&self) -> &[StreamExtent] {
        &self.extents
    }

    pub fn into_vec(self) -> Vec<StreamExtent> {
        self.extents
    }

    pub fn total_len(&self) -> u64 {
        self.extents.iter().map(|e| e.length).sum()
    }

    /// Insert `[start, start + length)`, coalescing with overlapping and adjacent extents.
    pub fn insert(&mut self, start: u64, length: u64) {
        if length == 0 {
            return;
        }
        let end = start.saturating_add(length);

        // First extent whose end reaches `start` (touching counts as mergeable).
        let first = self.extents.partition_point(|e| e.end() < start);
        // One past the last extent whose start is not beyond `end`.
        let last = self.extents.partition_point(|e| e.start <= end);

        if first >= last {
            self.extents.insert(first, StreamExtent::new(start, length));
            return;
        }

        let merged_start = self.extents[first].start.min(start);
        let merged_end = self.extents[last - 1].end().max(end);
        self.extents.drain(first..last);
        self.extents.insert(
            first,
            StreamExtent::new(merged_start, merged_end - merged_start),
        );
    }

    pub fn extend<I: IntoIterator<Item = StreamExtent>>(&mut self, extents: I) {
        for e in extents {
            self.insert(e.start, e.length);
        }
    }

    /// The members of the set intersected with the window `[start, start + length)`.
    pub fn clipped(&self, start: u64, length: u64) -> Vec<StreamExtent> {
        let end = start.saturating_add(length);
        self.extents
            .iter()
            .filter_map(|e| {
                let s = e.start.max(start);
                let t = e.end().min(end);
                (s < t).then(|| StreamExtent::new(s, t - s))
            })
            .collect()
    }
}

impl FromIterator<StreamExtent> for ExtentSet {
    fn from_iter<I: IntoIterator<Item = StreamExtent>>(iter: I) -> Self {
        let mut set = ExtentSet::new();
        set.extend(iter);
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_merges_overlaps_and_adjacency() {
        let mut set = ExtentSet::new();
        set.insert(10, 10);
        set.insert(0, 5);
        set.insert(5, 5); // adjacent on both sides
        set.insert(18, 7); // overlaps

        assert_eq!(set.extents(), &[StreamExtent::new(0, 25)]);
    }

    #[test]
    fn insert_keeps_disjoint_extents_sorted() {
        let mut set = ExtentSet::new();
        set.insert(100, 10);
        set.insert(0, 10);
        set.insert(50, 10);

        assert_eq!(
            set.extents(),
            &[
                StreamExtent::new(0, 10),
                StreamExtent::new(50, 10),
                StreamExtent::new(100, 10)
            ]
        );
        assert_eq!(set.total_len(), 30);
    }

    #[test]
    fn insert_swallows_several_existing_extents() {
        let mut set: ExtentSet = [
            StreamExtent::new(0, 4),
            StreamExtent::new(8, 4),
            StreamExtent::new(16, 4),
        ]
        .into_iter()
        .collect();
        set.insert(2, 15);
        assert_eq!(set.extents(), &[StreamExtent::new(0, 20)]);
    }

    #[test]
    fn clipped_intersects_with_window() {
        let set: ExtentSet = [StreamExtent::new(0, 10), StreamExtent::new(20, 10)]
            .into_iter()
            .collect();

        assert_eq!(
            set.clipped(5, 20),
            vec![StreamExtent::new(5, 5), StreamExtent::new(20, 5)]
        );
        assert!(set.clipped(10, 10).is_empty());
    }

    #[test]
    fn offset_by_rejects_negative_positions() {
        let e = StreamExtent::new(10, 5);
        assert_eq!(e.offset_by(-10), Some(StreamExtent::new(0, 5)));
        assert_eq!(e.offset_by(-11), None);
        assert_eq!(e.offset_by(6), Some(StreamExtent::new(16, 5)));
    }
}
