//! The BFS driver: closes one frame group per step. Open nodes are
//! sorted and deduplicated, subtracted against everything already
//! closed, promoted to `closed-g` by rename, and expanded into the open
//! queues of later groups along the way. Every promotion is an atomic
//! rename, so a killed process resumes from the last closed group with
//! at most one group of work to redo.

use std::sync::Mutex;

use crate::cache::NodeCache;
use crate::config::SearchConfig;
use crate::error::SiftError;
use crate::files::{self, Layout};
use crate::heap::{HeapSource, MergeHeap};
use crate::pipeline;
use crate::pool;
use crate::problem::{frame_of, group_count, Frame, FrameGroup, PackedState, Problem, MAX_PACKED_BYTES};
use crate::queues::OpenQueues;
use crate::stream::{NodeReader, NodeWriter};

/// How a run ended, mapped onto the process exit code by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Stopped,
    NotFound,
}

pub(crate) struct ExitHit<P: Problem> {
    pub state: P::State,
    pub frame: Frame,
}

pub struct Engine<P: Problem> {
    problem: P,
    cfg: SearchConfig,
    layout: Layout,
    queues: OpenQueues<P::Packed>,
    groups: FrameGroup,
}

impl<P: Problem> Engine<P> {
    pub fn new(problem: P, cfg: SearchConfig) -> Result<Self, SiftError> {
        validate_packed_contract::<P>()?;
        let layout = Layout::new(cfg.dir.clone())?;
        let groups = group_count::<P>();
        let queues = OpenQueues::new(layout.clone(), groups, P::FRAMES_PER_GROUP, &cfg);
        Ok(Self { problem, cfg, layout, queues, groups })
    }

    pub fn problem(&self) -> &P {
        &self.problem
    }

    pub fn config(&self) -> &SearchConfig {
        &self.cfg
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub(crate) fn queues(&self) -> &OpenQueues<P::Packed> {
        &self.queues
    }

    pub fn groups(&self) -> FrameGroup {
        self.groups
    }

    pub(crate) fn buffer_records(&self) -> usize {
        SearchConfig::records::<P::Packed>(self.cfg.standard_buffer_bytes)
    }

    pub(crate) fn all_buffer_records(&self) -> usize {
        SearchConfig::records::<P::Packed>(self.cfg.all_buffer_bytes)
    }

    /// Run the search up to `max_groups` (exclusive), resuming from
    /// whatever state the working directory holds.
    pub fn search(&self, max_groups: Option<FrameGroup>) -> Result<Outcome, SiftError> {
        if self.layout.solution_checkpoint().exists() {
            println!("[sift] partial trace checkpoint present, resuming exit trace");
            self.resume_trace()?;
            return Ok(Outcome::Ok);
        }

        let max_groups = max_groups.unwrap_or(self.groups).min(self.groups);
        let mut first = match self.layout.largest_closed(self.groups) {
            Some(g) => {
                println!("[sift] resuming from group {}", g + 1);
                g + 1
            }
            None => 0,
        };

        // A crash after the open file was deleted but before the closing
        // file was promoted leaves a complete closing-g with nothing to
        // rebuild it from. Finish the promotion it missed.
        if first < self.groups {
            let closing = self.layout.group_file("closing", first);
            if closing.exists()
                && !self.layout.group_file("open", first).exists()
                && !self.layout.group_file("merged", first).exists()
            {
                println!("[sift] promoting completed closing file for group {}", first);
                files::rename(&closing, &self.layout.group_file("closed", first))?;
                let allnew = self.layout.group_file("allnew", first);
                if self.cfg.use_all && allnew.exists() {
                    if let Some(old) = self.layout.latest_all(self.groups) {
                        if old != first {
                            files::delete(&self.layout.group_file("all", old))?;
                        }
                    }
                    files::rename(&allnew, &self.layout.group_file("all", first))?;
                }
                first += 1;
            }
        }

        for g in first..self.groups {
            if self.layout.group_file("open", g).exists() {
                println!("[sift] reopening queue for group {}", g);
                self.queues.reopen(g)?;
            }
        }

        if first == 0 && !self.queues.has_queue(0) {
            for state in self.problem.initial_states().into_iter().take(4) {
                let packed = self.problem.compress(&state);
                self.queues.write_open_state(packed, 0)?;
            }
        }

        for g in first..max_groups {
            if !self.queues.has_queue(g) {
                continue;
            }
            self.queues.close(g)?;

            print!("[sift] group {}/{}: ", g, max_groups);

            if self.layout.group_file("merged", g).exists() {
                print!("(reopening merged) ");
            } else {
                pipeline::sort_and_merge::<P::Packed>(&self.cfg, &self.layout, g)?;
            }

            // The RAM arena changes hands here: the sort buffer is gone,
            // a zeroed cache takes its place for the expansion phase.
            print!("Clearing... ");
            let cache = NodeCache::new(self.cfg.ram_bytes, self.cfg.cache_ways);

            print!("Processing... ");
            let exit: Mutex<Option<ExitHit<P>>> = Mutex::new(None);
            self.close_group(g, &cache, &exit)?;

            print!("Flushing... ");
            self.queues.flush_all()?;

            if let Some(hit) = exit.lock().expect("exit lock poisoned").take() {
                if hit.frame / P::FRAMES_PER_GROUP == g {
                    println!("\n[sift] exit found at frame {}, tracing path", hit.frame);
                    self.trace_exit(hit.state, hit.frame)?;
                    return Ok(Outcome::Ok);
                }
            }

            files::delete(&self.layout.group_file("open", g))?;
            files::rename(
                &self.layout.group_file("closing", g),
                &self.layout.group_file("closed", g),
            )?;
            if self.cfg.use_all {
                if g > 0 {
                    if let Some(old) = self.layout.latest_all(self.groups) {
                        files::delete(&self.layout.group_file("all", old))?;
                    }
                }
                files::rename(
                    &self.layout.group_file("allnew", g),
                    &self.layout.group_file("all", g),
                )?;
            }
            println!("Done.");

            if self.layout.take_stop_request()? {
                return Ok(Outcome::Stopped);
            }

            if self.cfg.free_space_floor > 0 {
                if let Some(free) = self.layout.free_space() {
                    if free < self.cfg.free_space_floor {
                        println!("[sift] low disk space, compacting open nodes");
                        // The live queue writers hold descriptors to the
                        // files the compaction replaces by rename; detach
                        // them so no child is appended to an unlinked
                        // inode, then reattach to the compacted files.
                        self.queues.close_all()?;
                        if self.sort_open(0, self.groups)? == Outcome::Stopped {
                            return Ok(Outcome::Stopped);
                        }
                        self.filter_open()?;
                        if self.layout.free_space().unwrap_or(u64::MAX) < self.cfg.free_space_floor {
                            return Err(SiftError::Search(
                                "open-node filter did not free enough disk space".to_string(),
                            ));
                        }
                        for g2 in g + 1..self.groups {
                            if self.layout.group_file("open", g2).exists() {
                                self.queues.reopen(g2)?;
                            }
                        }
                        println!("[sift] resuming search");
                    }
                }
            }
        }

        println!("[sift] exit not found");
        Ok(Outcome::NotFound)
    }

    /// Expand one state during the close step of `group`: finish states
    /// are recorded (minimum frame wins) and not expanded; every child
    /// goes through the cache into the open queues.
    pub(crate) fn process_state(
        &self,
        group: FrameGroup,
        packed: P::Packed,
        cache: &NodeCache<P::Packed>,
        exit: &Mutex<Option<ExitHit<P>>>,
    ) -> Result<(), SiftError> {
        let state = self.problem.decompress(&packed);
        #[cfg(debug_assertions)]
        {
            debug_assert!(
                self.problem.compress(&state) == packed,
                "compression round-trip failed while expanding"
            );
        }
        let frame = frame_of::<P>(group, &packed);
        if self.problem.is_finish(&state) {
            let mut guard = exit.lock().expect("exit lock poisoned");
            match guard.as_ref() {
                Some(hit) if hit.frame <= frame => {}
                _ => *guard = Some(ExitHit { state, frame }),
            }
            return Ok(());
        }

        let mut failure: Option<SiftError> = None;
        self.problem.expand(frame, &state, |_parent, _parent_frame, _step, child, child_frame| {
            if failure.is_some() {
                return;
            }
            let child_packed = self.problem.compress(child);
            #[cfg(debug_assertions)]
            {
                debug_assert!(
                    self.problem.decompress(&child_packed) == *child,
                    "compression round-trip failed while caching"
                );
            }
            if let Err(e) = cache.add(child_packed, child_frame, |node, f| {
                self.queues.write_open_state(node, f)
            }) {
                failure = Some(e);
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stream `merged-g` through the subtraction pass, writing
    /// `closing-g` (and in aggregate mode `allnew-g`) while feeding every
    /// surviving record to the expansion pool.
    fn close_group(
        &self,
        group: FrameGroup,
        cache: &NodeCache<P::Packed>,
        exit: &Mutex<Option<ExitHit<P>>>,
    ) -> Result<(), SiftError> {
        let handler = |packed: P::Packed| self.process_state(group, packed, cache, exit);
        pool::run_phase(self.cfg.threads, self.cfg.ring_capacity, handler, |push| {
            if self.cfg.use_all {
                self.subtract_with_all(group, push)
            } else {
                self.subtract_with_closed(group, push)
            }
        })
    }

    /// Aggregate mode off: mask is the union of every earlier closed
    /// file, plus any stray earlier open file.
    fn subtract_with_closed(
        &self,
        group: FrameGroup,
        push: &mut dyn FnMut(P::Packed) -> Result<(), SiftError>,
    ) -> Result<(), SiftError> {
        let records = self.buffer_records();
        let merged_path = self.layout.group_file("merged", group);
        let mut source = NodeReader::<P::Packed>::open(&merged_path, records)?.verify_order();

        let mut mask = Vec::new();
        for g in 0..group {
            for name in ["closed", "open"] {
                let path = self.layout.group_file(name, g);
                if path.exists() {
                    let reader = NodeReader::<P::Packed>::open(&path, records)?;
                    if reader.size() > 0 {
                        mask.push(reader.verify_order());
                    }
                }
            }
        }

        let closing_path = self.layout.group_file("closing", group);
        let mut closing = NodeWriter::create(&closing_path, records)?;
        if mask.is_empty() {
            pipeline::filter_stream::<P::Packed, _, NodeReader<P::Packed>, _>(
                &mut source,
                None,
                &mut closing,
                |node| push(node),
            )?;
        } else {
            let mut heap = MergeHeap::new(mask)?;
            pipeline::filter_stream(&mut source, Some(&mut heap), &mut closing, |node| push(node))?;
        }
        closing.flush()?;
        drop(closing);
        drop(source);
        files::delete(&merged_path)
    }

    /// Aggregate mode on: subtract against the single `all` file (plus
    /// closed groups newer than it), producing the next aggregate as a
    /// side effect.
    fn subtract_with_all(
        &self,
        group: FrameGroup,
        push: &mut dyn FnMut(P::Packed) -> Result<(), SiftError>,
    ) -> Result<(), SiftError> {
        let records = self.buffer_records();
        let merged_path = self.layout.group_file("merged", group);
        let closing_path = self.layout.group_file("closing", group);
        let allnew_path = self.layout.group_file("allnew", group);

        if group == 0 {
            // Nothing is closed yet: the merged frontier is both the
            // first closed set and the first aggregate.
            crate::disk::copy_nodes::<P::Packed>(&merged_path, &closing_path)?;
            files::rename(&merged_path, &allnew_path)?;
            let mut reader = NodeReader::<P::Packed>::open(&closing_path, records)?.verify_order();
            while let Some(node) = reader.read()? {
                push(node)?;
            }
            return Ok(());
        }

        let all_group = self.layout.latest_all(self.groups).ok_or_else(|| {
            SiftError::Search("aggregate file not found (run create-all first)".to_string())
        })?;

        let mut source = NodeReader::<P::Packed>::open(&merged_path, records)?.verify_order();
        let mut allnew = NodeWriter::create(&allnew_path, self.all_buffer_records())?;
        let mut closing = NodeWriter::create(&closing_path, records)?;

        // Closed groups the aggregate lags behind fold into the mask.
        let mut mask = Vec::new();
        for g in all_group + 1..group {
            let path = self.layout.group_file("closed", g);
            if path.exists() {
                let reader = NodeReader::<P::Packed>::open(&path, records)?;
                if reader.size() > 0 {
                    mask.push(reader.verify_order());
                }
            }
        }
        let all_reader = NodeReader::<P::Packed>::open(
            &self.layout.group_file("all", all_group),
            self.all_buffer_records(),
        )?
        .verify_order();

        if mask.is_empty() {
            let mut all = all_reader;
            pipeline::merge_two_streams(&mut source, &mut all, &mut allnew, &mut closing, |node| {
                push(node)
            })?;
        } else {
            mask.push(all_reader);
            let mut merged_mask = HeapSource::new(MergeHeap::new(mask)?);
            pipeline::merge_two_streams(&mut source, &mut merged_mask, &mut allnew, &mut closing, |node| {
                push(node)
            })?;
        }
        allnew.flush()?;
        closing.flush()?;
        drop(source);
        files::delete(&merged_path)
    }
}

/// Startup contract checks on the packed representation: byte width in
/// range, payload bits addressable, byte round-trip faithful, every
/// payload bit significant for equality, and the subframe excluded from
/// it. Violations are configuration errors caught before any disk work.
fn validate_packed_contract<P: Problem>() -> Result<(), SiftError> {
    let bytes = P::Packed::BYTES;
    if bytes < 4 || bytes > MAX_PACKED_BYTES {
        return Err(SiftError::Config(format!(
            "packed state is {} bytes, expected 4..={}",
            bytes, MAX_PACKED_BYTES
        )));
    }
    let payload_bytes = if P::FRAMES_PER_GROUP > 1 { bytes - 1 } else { bytes };
    if P::PAYLOAD_BITS as usize > payload_bytes * 8 {
        return Err(SiftError::Config(format!(
            "{} payload bits do not fit in {} bytes",
            P::PAYLOAD_BITS, payload_bytes
        )));
    }
    if P::FRAMES_PER_GROUP == 0 || P::MAX_FRAMES == 0 {
        return Err(SiftError::Config("frame constants must be positive".to_string()));
    }

    let mut zero = [0u8; MAX_PACKED_BYTES];
    let base = P::Packed::read_bytes(&zero[..bytes]);
    if base != P::Packed::default() {
        return Err(SiftError::Config(
            "zeroed bytes must decode to the default packed state".to_string(),
        ));
    }
    for bit in 0..P::PAYLOAD_BITS as usize {
        zero[bit / 8] |= 1 << (bit % 8);
        let flipped = P::Packed::read_bytes(&zero[..bytes]);
        if flipped == base {
            return Err(SiftError::Config(format!(
                "payload bit {} does not affect packed equality",
                bit
            )));
        }
        let mut round = [0u8; MAX_PACKED_BYTES];
        flipped.write_bytes(&mut round[..bytes]);
        if round[..bytes] != zero[..bytes] {
            return Err(SiftError::Config(format!(
                "packed byte round-trip altered the record at bit {}",
                bit
            )));
        }
        zero[bit / 8] &= !(1 << (bit % 8));
    }
    if P::FRAMES_PER_GROUP > 1 {
        let mut with_subframe = base;
        with_subframe.set_subframe(P::FRAMES_PER_GROUP - 1);
        if with_subframe != base {
            return Err(SiftError::Config(
                "subframe participates in packed equality".to_string(),
            ));
        }
        if with_subframe.subframe() != P::FRAMES_PER_GROUP - 1 {
            return Err(SiftError::Config("subframe does not round-trip".to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maze::Maze;
    use std::path::PathBuf;

    fn engine(dir: PathBuf) -> Engine<Maze> {
        Engine::new(Maze::sample(), SearchConfig::custom(dir)).unwrap()
    }

    #[test]
    fn packed_contract_validates_for_maze() {
        assert!(validate_packed_contract::<Maze>().is_ok());
    }

    #[test]
    fn search_finds_the_maze_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let eng = engine(tmp.path().to_path_buf());
        assert_eq!(eng.search(None).unwrap(), Outcome::Ok);
        assert!(tmp.path().join("solution.txt").exists());
        assert!(!tmp.path().join("solution.bin").exists());
        // Frame 0 was closed with both starts.
        assert!(tmp.path().join("closed-0.bin").exists());
    }

    #[test]
    fn search_with_aggregate_matches_plain_search() {
        let tmp_a = tempfile::tempdir().unwrap();
        let tmp_b = tempfile::tempdir().unwrap();
        let plain = engine(tmp_a.path().to_path_buf());
        assert_eq!(plain.search(None).unwrap(), Outcome::Ok);

        let mut cfg = SearchConfig::custom(tmp_b.path().to_path_buf());
        cfg.use_all = true;
        let agg = Engine::new(Maze::sample(), cfg).unwrap();
        assert_eq!(agg.search(None).unwrap(), Outcome::Ok);

        let a = std::fs::read(tmp_a.path().join("solution.txt")).unwrap();
        let b = std::fs::read(tmp_b.path().join("solution.txt")).unwrap();
        assert_eq!(a, b);

        // Closed files agree group by group.
        for g in 0.. {
            let pa = tmp_a.path().join(format!("closed-{}.bin", g));
            let pb = tmp_b.path().join(format!("closed-{}.bin", g));
            match (pa.exists(), pb.exists()) {
                (false, false) => break,
                (true, true) => {
                    assert_eq!(std::fs::read(&pa).unwrap(), std::fs::read(&pb).unwrap());
                }
                _ => panic!("closed sets diverge at group {}", g),
            }
        }
    }

    #[test]
    fn stop_file_interrupts_cleanly() {
        let tmp = tempfile::tempdir().unwrap();
        let eng = engine(tmp.path().to_path_buf());
        // Request a stop before starting: the first closed group ends the run.
        std::fs::write(tmp.path().join("stop.txt"), b"").unwrap();
        assert_eq!(eng.search(None).unwrap(), Outcome::Stopped);
        assert!(tmp.path().join("closed-0.bin").exists());

        // Restart completes the search and matches an uninterrupted run.
        let eng2 = engine(tmp.path().to_path_buf());
        assert_eq!(eng2.search(None).unwrap(), Outcome::Ok);
    }

    #[test]
    fn bounded_search_reports_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let eng = engine(tmp.path().to_path_buf());
        assert_eq!(eng.search(Some(3)).unwrap(), Outcome::NotFound);
    }

    #[test]
    fn multithreaded_search_matches_single_threaded() {
        let tmp_a = tempfile::tempdir().unwrap();
        let tmp_b = tempfile::tempdir().unwrap();
        let single = engine(tmp_a.path().to_path_buf());
        assert_eq!(single.search(None).unwrap(), Outcome::Ok);

        let mut cfg = SearchConfig::custom(tmp_b.path().to_path_buf());
        cfg.threads = 4;
        let multi = Engine::new(Maze::sample(), cfg).unwrap();
        assert_eq!(multi.search(None).unwrap(), Outcome::Ok);

        for g in 0.. {
            let pa = tmp_a.path().join(format!("closed-{}.bin", g));
            let pb = tmp_b.path().join(format!("closed-{}.bin", g));
            match (pa.exists(), pb.exists()) {
                (false, false) => break,
                (true, true) => {
                    assert_eq!(std::fs::read(&pa).unwrap(), std::fs::read(&pb).unwrap());
                }
                _ => panic!("closed sets diverge at group {}", g),
            }
        }
    }
}
