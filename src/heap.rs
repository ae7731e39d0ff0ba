//! k-way merge over sorted record sources. A binary min-heap keyed by
//! each source's current head; `scan_to` fast-forwards past long runs
//! below a target without restoring the heap after every record.

use crate::error::SiftError;
use crate::problem::PackedState;
use crate::stream::NodeSource;

struct Entry<P> {
    node: P,
    /// Index into the source vector this head came from. Carried
    /// explicitly so callers can recover a record's origin.
    origin: usize,
}

pub struct MergeHeap<P: PackedState, S: NodeSource<P>> {
    sources: Vec<S>,
    entries: Vec<Entry<P>>,
}

impl<P: PackedState, S: NodeSource<P>> MergeHeap<P, S> {
    /// Build a heap over the given sources, reading one record from each.
    /// Sources that are immediately exhausted simply never contribute;
    /// callers are expected to pass only inputs that actually exist.
    pub fn new(mut sources: Vec<S>) -> Result<Self, SiftError> {
        let mut entries = Vec::with_capacity(sources.len());
        for (origin, source) in sources.iter_mut().enumerate() {
            if let Some(node) = source.next_node()? {
                entries.push(Entry { node, origin });
            }
        }
        entries.sort_by(|a, b| a.node.cmp(&b.node));
        Ok(Self { sources, entries })
    }

    /// Smallest current record and the index of the source it came from.
    pub fn head(&self) -> Option<(P, usize)> {
        self.entries.first().map(|e| (e.node, e.origin))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn source_mut(&mut self, origin: usize) -> &mut S {
        &mut self.sources[origin]
    }

    pub fn into_sources(self) -> Vec<S> {
        self.sources
    }

    /// Advance the source owning the current head. Returns false once the
    /// heap is exhausted.
    pub fn next(&mut self) -> Result<bool, SiftError> {
        if self.entries.is_empty() {
            return Ok(false);
        }
        let origin = self.entries[0].origin;
        match self.sources[origin].next_node()? {
            Some(node) => self.entries[0] = Entry { node, origin },
            None => {
                let last = self.entries.pop().expect("nonempty");
                if self.entries.is_empty() {
                    return Ok(false);
                }
                self.entries[0] = last;
            }
        }
        self.sift_down();
        Ok(true)
    }

    /// Advance until `head() >= target`. Returns false if every source
    /// runs dry first. While only the head source can hold records below
    /// the target (its key is below both children), records are consumed
    /// without restoring heap order; the heap is fixed up only when the
    /// head crosses the smaller child.
    pub fn scan_to(&mut self, target: &P) -> Result<bool, SiftError> {
        loop {
            match self.entries.first() {
                None => return Ok(false),
                Some(e) if e.node >= *target => return Ok(true),
                Some(_) => {}
            }
            let bound = match self.min_child() {
                Some(child) if child < *target => child,
                _ => *target,
            };
            let origin = self.entries[0].origin;
            let head = loop {
                match self.sources[origin].next_node()? {
                    Some(node) if node < bound => continue,
                    other => break other,
                }
            };
            match head {
                Some(node) => self.entries[0] = Entry { node, origin },
                None => {
                    let last = self.entries.pop().expect("nonempty");
                    if self.entries.is_empty() {
                        return Ok(false);
                    }
                    self.entries[0] = last;
                }
            }
            self.sift_down();
        }
    }

    fn min_child(&self) -> Option<P> {
        match (self.entries.get(1), self.entries.get(2)) {
            (Some(a), Some(b)) => Some(a.node.min(b.node)),
            (Some(a), None) => Some(a.node),
            _ => None,
        }
    }

    fn sift_down(&mut self) {
        let len = self.entries.len();
        let mut parent = 0;
        loop {
            let left = parent * 2 + 1;
            if left >= len {
                return;
            }
            let mut child = left;
            if left + 1 < len && self.entries[left + 1].node < self.entries[left].node {
                child = left + 1;
            }
            if self.entries[parent].node <= self.entries[child].node {
                return;
            }
            self.entries.swap(parent, child);
            parent = child;
        }
    }
}

/// Adapts a heap into a plain merged source, for pipelines that take any
/// `NodeSource`.
pub struct HeapSource<P: PackedState, S: NodeSource<P>> {
    heap: MergeHeap<P, S>,
    started: bool,
}

impl<P: PackedState, S: NodeSource<P>> HeapSource<P, S> {
    pub fn new(heap: MergeHeap<P, S>) -> Self {
        Self { heap, started: false }
    }
}

impl<P: PackedState, S: NodeSource<P>> NodeSource<P> for HeapSource<P, S> {
    fn next_node(&mut self) -> Result<Option<P>, SiftError> {
        if self.started && !self.heap.next()? {
            return Ok(None);
        }
        self.started = true;
        Ok(self.heap.head().map(|(node, _)| node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maze::MazePacked;
    use crate::stream::VecSource;

    fn packed(x: u16) -> MazePacked {
        MazePacked { x, y: 0 }
    }

    fn source(xs: &[u16]) -> VecSource<MazePacked> {
        VecSource::new(xs.iter().map(|&x| packed(x)).collect())
    }

    fn drain(mut heap: MergeHeap<MazePacked, VecSource<MazePacked>>) -> Vec<u16> {
        let mut out = Vec::new();
        if let Some((node, _)) = heap.head() {
            out.push(node.x);
            while heap.next().unwrap() {
                out.push(heap.head().unwrap().0.x);
            }
        }
        out
    }

    #[test]
    fn merges_in_order() {
        let heap = MergeHeap::new(vec![
            source(&[1, 4, 7]),
            source(&[2, 5, 8]),
            source(&[0, 3, 6, 9]),
        ])
        .unwrap();
        assert_eq!(drain(heap), vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn empty_sources_are_skipped() {
        let heap = MergeHeap::new(vec![source(&[]), source(&[2]), source(&[])]).unwrap();
        assert_eq!(drain(heap), vec![2]);
        let heap = MergeHeap::new(vec![source(&[]), source(&[])]).unwrap();
        assert!(heap.is_empty());
    }

    #[test]
    fn head_reports_origin() {
        let mut heap = MergeHeap::new(vec![source(&[5]), source(&[1, 9])]).unwrap();
        assert_eq!(heap.head().unwrap(), (packed(1), 1));
        heap.next().unwrap();
        assert_eq!(heap.head().unwrap(), (packed(5), 0));
    }

    #[test]
    fn scan_to_skips_runs() {
        let mut heap = MergeHeap::new(vec![
            source(&[1, 2, 3, 4, 20]),
            source(&[5, 6, 7, 21]),
            source(&[8, 9, 22]),
        ])
        .unwrap();
        assert!(heap.scan_to(&packed(10)).unwrap());
        assert_eq!(heap.head().unwrap().0.x, 20);
        assert!(heap.scan_to(&packed(21)).unwrap());
        assert_eq!(heap.head().unwrap().0.x, 21);
        assert!(!heap.scan_to(&packed(30)).unwrap());
    }

    #[test]
    fn scan_to_on_present_value_stops_there() {
        let mut heap = MergeHeap::new(vec![source(&[1, 3, 5, 7])]).unwrap();
        assert!(heap.scan_to(&packed(5)).unwrap());
        assert_eq!(heap.head().unwrap().0.x, 5);
        // Already at or past the target: no movement.
        assert!(heap.scan_to(&packed(4)).unwrap());
        assert_eq!(heap.head().unwrap().0.x, 5);
    }

    #[test]
    fn heap_source_adapts_to_plain_reads() {
        let heap = MergeHeap::new(vec![source(&[2, 4]), source(&[1, 3])]).unwrap();
        let mut merged = HeapSource::new(heap);
        let mut out = Vec::new();
        while let Some(node) = merged.next_node().unwrap() {
            out.push(node.x);
        }
        assert_eq!(out, vec![1, 2, 3, 4]);
    }
}
