//! Offline tools over the engine's node files: compaction and filtering
//! of open queues, aggregate rebuilds, goal scans, and inspection
//! utilities. All operate on the same working directory as the search
//! and follow the same scratch-then-rename discipline.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cache::NodeCache;
use crate::disk::{InputStream, OutputStream};
use crate::error::SiftError;
use crate::files;
use crate::heap::MergeHeap;
use crate::pipeline;
use crate::pool;
use crate::problem::{frame_of, Frame, FrameGroup, PackedState, Problem};
use crate::search::{Engine, Outcome};
use crate::stream::{NodeReader, NodeRewriter, NodeWriter};

/// A half-open group range from the CLI: no numbers means everything,
/// one number a single group, two numbers `[first, last)`.
pub fn parse_range(args: &[FrameGroup], groups: FrameGroup) -> Result<(FrameGroup, FrameGroup), SiftError> {
    match args {
        [] => Ok((0, groups)),
        [g] => Ok((*g, g + 1)),
        [a, b] => Ok((*a, *b)),
        _ => Err(SiftError::Config("a range is at most two group numbers".to_string())),
    }
}

impl<P: Problem> Engine<P> {
    /// Sort and deduplicate each RAM-sized chunk of every open file in
    /// the range, rewriting the file once. Cheaper than a full sort:
    /// duplicates only collapse within a chunk.
    pub fn pack_open(&self, first: FrameGroup, last: FrameGroup) -> Result<(), SiftError> {
        let chunk_records = self.config().sort_chunk_records::<P::Packed>();
        for g in first..last.min(self.groups()) {
            let open_path = self.layout().group_file("open", g);
            if !open_path.exists() {
                continue;
            }
            print!("[sift] group {}: ", g);
            let packed_path = self.layout().group_file("openpacked", g);
            let mut read = 0u64;
            let mut written = 0u64;
            {
                let mut input = InputStream::<P::Packed>::open(&open_path)?;
                let mut output = OutputStream::create(&packed_path)?;
                let mut buffer = vec![P::Packed::default(); chunk_records];
                loop {
                    let records = input.read(&mut buffer)?;
                    if records == 0 {
                        break;
                    }
                    read += records as u64;
                    buffer[..records].sort_unstable();
                    let kept = pipeline::dedup_min_subframe(&mut buffer[..records]);
                    written += kept as u64;
                    output.write(&buffer[..kept])?;
                }
                output.flush()?;
            }
            if read == written {
                println!("no improvement");
            } else {
                println!("{} -> {}", read, written);
            }
            files::delete(&open_path)?;
            files::rename(&packed_path, &open_path)?;
        }
        Ok(())
    }

    /// Fully sort and deduplicate open files in the range, newest group
    /// first so the search can pick up compacted frontiers soonest.
    pub fn sort_open(&self, first: FrameGroup, last: FrameGroup) -> Result<Outcome, SiftError> {
        for g in (first..last.min(self.groups())).rev() {
            let open_path = self.layout().group_file("open", g);
            if !open_path.exists() {
                continue;
            }
            if self.layout().group_file("merged", g).exists() {
                return Err(SiftError::Search(format!(
                    "merged file already present for group {}",
                    g
                )));
            }
            let initial = InputStream::<P::Packed>::open(&open_path)?.size();
            if initial == 0 {
                continue;
            }
            print!("[sift] group {}: ", g);
            pipeline::sort_and_merge::<P::Packed>(self.config(), self.layout(), g)?;
            files::delete(&open_path)?;
            files::rename(&self.layout().group_file("merged", g), &open_path)?;
            let final_size = InputStream::<P::Packed>::open(&open_path)?.size();
            println!("Done: {} -> {}", initial, final_size);
            if self.layout().take_stop_request()? {
                return Ok(Outcome::Stopped);
            }
        }
        Ok(Outcome::Ok)
    }

    /// One pass over every open file at once, in place: drop records
    /// already closed, and collapse payloads open in several groups down
    /// to their lowest frame. Requires all open files sorted and unique.
    pub fn filter_open(&self) -> Result<(), SiftError> {
        let records = self.buffer_records();
        let mut open = Vec::new();
        let mut open_groups = Vec::new();
        for g in 0..self.groups() {
            let path = self.layout().group_file("open", g);
            if !path.exists() {
                continue;
            }
            if self.layout().group_file("closed", g).exists() {
                return Err(SiftError::Search(format!(
                    "open and closed node files both present for group {}",
                    g
                )));
            }
            open.push(NodeRewriter::<P::Packed>::open(&path, records)?);
            open_groups.push(g);
        }
        if open.is_empty() {
            return Ok(());
        }

        let mut mask = Vec::new();
        let all_group = self.layout().latest_all(self.groups());
        if let Some(a) = all_group {
            mask.push(
                NodeReader::<P::Packed>::open(
                    &self.layout().group_file("all", a),
                    self.all_buffer_records(),
                )?
                .verify_order(),
            );
        }
        for g in all_group.map(|a| a + 1).unwrap_or(0)..self.groups() {
            let path = self.layout().group_file("closed", g);
            if path.exists() {
                let reader = NodeReader::<P::Packed>::open(&path, records)?;
                if reader.size() > 0 {
                    mask.push(reader.verify_order());
                }
            }
        }

        let mut open_heap = MergeHeap::new(open)?;
        let mut closed_heap = MergeHeap::new(mask)?;

        if let Some((mut node, mut origin)) = open_heap.head() {
            let mut done = false;
            while !done {
                let current = node;
                let mut lowest_frame = Frame::MAX;
                let mut lowest_origin = origin;
                // Gather every open occurrence of this payload.
                loop {
                    let f = open_groups[origin] * P::FRAMES_PER_GROUP + node.subframe();
                    if f < lowest_frame {
                        lowest_frame = f;
                        lowest_origin = origin;
                    }
                    if !open_heap.next()? {
                        done = true;
                        break;
                    }
                    let (next, next_origin) = open_heap.head().expect("head after next");
                    if next < current {
                        return Err(SiftError::Corrupt(format!(
                            "unsorted open node file for group {}",
                            open_groups[next_origin]
                        )));
                    }
                    node = next;
                    origin = next_origin;
                    if next != current {
                        break;
                    }
                }

                if closed_heap.scan_to(&current)? {
                    if closed_heap.head().expect("scan_to hit").0 == current {
                        closed_heap.next()?;
                        continue;
                    }
                }
                let mut keep = current;
                keep.set_subframe(lowest_frame % P::FRAMES_PER_GROUP);
                open_heap.source_mut(lowest_origin).write(keep)?;
            }
        }

        for mut rewriter in open_heap.into_sources() {
            rewriter.truncate()?;
        }
        Ok(())
    }

    /// Sort, deduplicate and filter open files one group at a time,
    /// without expanding anything. Earlier groups in the range must
    /// already be sorted for the mask to be valid.
    pub fn seq_filter_open(&self, first: FrameGroup, last: FrameGroup) -> Result<Outcome, SiftError> {
        let records = self.buffer_records();
        for g in first..last.min(self.groups()) {
            let open_path = self.layout().group_file("open", g);
            if !open_path.exists() {
                continue;
            }
            print!("[sift] group {}: ", g);
            let initial = InputStream::<P::Packed>::open(&open_path)?.size();
            if self.layout().group_file("merged", g).exists() {
                print!("(reopening merged) ");
            } else {
                pipeline::sort_and_merge::<P::Packed>(self.config(), self.layout(), g)?;
            }

            print!("Filtering... ");
            let merged_path = self.layout().group_file("merged", g);
            let filtering_path = self.layout().group_file("filtering", g);
            {
                let mut source = NodeReader::<P::Packed>::open(&merged_path, records)?.verify_order();
                let mut mask = Vec::new();
                let all_group = if self.config().use_all {
                    self.layout().latest_all(g)
                } else {
                    None
                };
                if let Some(a) = all_group {
                    mask.push(
                        NodeReader::<P::Packed>::open(
                            &self.layout().group_file("all", a),
                            self.all_buffer_records(),
                        )?
                        .verify_order(),
                    );
                    // Closed groups the aggregate lags behind still mask.
                    for g2 in a + 1..g {
                        let path = self.layout().group_file("closed", g2);
                        if path.exists() {
                            let reader = NodeReader::<P::Packed>::open(&path, records)?;
                            if reader.size() > 0 {
                                mask.push(reader.verify_order());
                            }
                        }
                    }
                } else {
                    for g2 in 0..g {
                        let mut path = self.layout().group_file("open", g2);
                        if !path.exists() {
                            path = self.layout().group_file("closed", g2);
                        }
                        if path.exists() {
                            let reader = NodeReader::<P::Packed>::open(&path, records)?;
                            if reader.size() > 0 {
                                mask.push(reader.verify_order());
                            }
                        }
                    }
                }
                let mut output = NodeWriter::create(&filtering_path, records)?;
                if mask.is_empty() {
                    pipeline::filter_stream::<P::Packed, _, NodeReader<P::Packed>, _>(
                        &mut source,
                        None,
                        &mut output,
                        |_| Ok(()),
                    )?;
                } else {
                    let mut heap = MergeHeap::new(mask)?;
                    pipeline::filter_stream(&mut source, Some(&mut heap), &mut output, |_| Ok(()))?;
                }
                output.flush()?;
            }
            files::delete(&merged_path)?;
            files::delete(&open_path)?;
            files::rename(&filtering_path, &open_path)?;
            let final_size = InputStream::<P::Packed>::open(&open_path)?.size();
            println!("Done: {} -> {}", initial, final_size);
            if self.layout().take_stop_request()? {
                return Ok(Outcome::Stopped);
            }
        }
        Ok(Outcome::Ok)
    }

    /// Re-expand closed groups to rebuild lost open files. Groups that
    /// already have an open or closed file keep their queues suppressed,
    /// so only missing frontiers are regenerated.
    pub fn regenerate_open(&self, first: FrameGroup, mut last: FrameGroup) -> Result<Outcome, SiftError> {
        for g in 0..self.groups() {
            if self.layout().group_file("closed", g).exists()
                || self.layout().group_file("open", g).exists()
            {
                self.queues().set_no_queue(g, true);
            }
        }
        last = last.min(self.groups());
        while last > 0 && !self.layout().group_file("closed", last - 1).exists() {
            last -= 1;
        }

        let mut previous_total = 0u64;
        for g in first..last {
            let closed_path = self.layout().group_file("closed", g);
            if !closed_path.exists() {
                continue;
            }
            print!("[sift] group {}/{}: ", g, last);
            let cache = NodeCache::new(self.config().ram_bytes, self.config().cache_ways);
            let exit = Mutex::new(None);
            let handler = |packed: P::Packed| self.process_state(g, packed, &cache, &exit);
            pool::run_phase(
                self.config().threads,
                self.config().ring_capacity,
                handler,
                |push| {
                    let mut reader =
                        NodeReader::<P::Packed>::open(&closed_path, self.buffer_records())?
                            .verify_order();
                    while let Some(node) = reader.read()? {
                        push(node)?;
                    }
                    Ok(())
                },
            )?;
            print!("Flushing... ");
            self.queues().flush_all()?;
            let total = self.queues().total_queued();
            println!("Done ({} new)", total - previous_total);
            previous_total = total;
            if self.layout().take_stop_request()? {
                return Ok(Outcome::Stopped);
            }
        }
        Ok(Outcome::Ok)
    }

    /// Build the aggregate union of every closed file, named after the
    /// largest closed group.
    pub fn create_all(&self) -> Result<(), SiftError> {
        let records = self.buffer_records();
        let mut readers = Vec::new();
        let mut max_closed = 0;
        for g in 0..self.groups() {
            let path = self.layout().group_file("closed", g);
            if path.exists() {
                let reader = NodeReader::<P::Packed>::open(&path, records)?;
                if reader.size() > 0 {
                    readers.push(reader.verify_order());
                }
                max_closed = g;
            }
        }
        let allnew_path = self.layout().group_file("allnew", max_closed);
        {
            let mut heap = MergeHeap::new(readers)?;
            let mut out = NodeWriter::create(&allnew_path, self.all_buffer_records())?;
            pipeline::merge_into(&mut heap, &mut out)?;
            out.flush()?;
        }
        files::rename(&allnew_path, &self.layout().group_file("all", max_closed))
    }

    /// Scan closed (and open) files for goal states and trace the first
    /// hit, exactly as the search would have.
    pub fn find_exit(&self, first: FrameGroup, last: FrameGroup) -> Result<Outcome, SiftError> {
        if self.layout().solution_checkpoint().exists() {
            return Err(SiftError::Search(
                "partial trace checkpoint present; run search to resume it, or delete solution.bin"
                    .to_string(),
            ));
        }
        for g in first..last.min(self.groups()) {
            let mut path = self.layout().group_file("closed", g);
            if !path.exists() {
                path = self.layout().group_file("open", g);
            }
            if !path.exists() {
                continue;
            }
            print!("[sift] group {}/{}: ", g, last.min(self.groups()));
            let mut reader = NodeReader::<P::Packed>::open(&path, self.buffer_records())?;
            while let Some(packed) = reader.read()? {
                let state = self.problem().decompress(&packed);
                if self.problem().is_finish(&state) {
                    let frame = frame_of::<P>(g, &packed);
                    println!("exit found at frame {}, tracing path", frame);
                    self.trace_exit(state, frame)?;
                    return Ok(Outcome::Ok);
                }
            }
            println!("Done.");
        }
        println!("[sift] exit not found");
        Ok(Outcome::NotFound)
    }

    /// Print every state of a group, open or closed.
    pub fn dump(&self, group: FrameGroup) -> Result<(), SiftError> {
        let path = self.open_or_closed(group)?;
        let mut reader = NodeReader::<P::Packed>::open(&path, self.buffer_records())?;
        while let Some(packed) = reader.read()? {
            if P::FRAMES_PER_GROUP > 1 {
                println!("Frame {}:", frame_of::<P>(group, &packed));
            }
            print!("{}", self.problem().render(&self.problem().decompress(&packed)));
        }
        Ok(())
    }

    /// Display one state picked pseudo-randomly from a group file.
    pub fn sample(&self, group: FrameGroup) -> Result<(), SiftError> {
        let path = self.open_or_closed(group)?;
        let mut input = InputStream::<P::Packed>::open(&path)?;
        if input.size() == 0 {
            return Err(SiftError::Search(format!("group {} file is empty", group)));
        }
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64 ^ d.as_secs())
            .unwrap_or(0);
        input.seek(seed % input.size())?;
        let mut buf = [P::Packed::default(); 1];
        if input.read(&mut buf)? != 1 {
            return Err(SiftError::Corrupt(format!("short read sampling group {}", group)));
        }
        if P::FRAMES_PER_GROUP > 1 {
            println!("Frame {}:", frame_of::<P>(group, &buf[0]));
        }
        print!("{}", self.problem().render(&self.problem().decompress(&buf[0])));
        Ok(())
    }

    fn open_or_closed(&self, group: FrameGroup) -> Result<std::path::PathBuf, SiftError> {
        let closed = self.layout().group_file("closed", group);
        if closed.exists() {
            return Ok(closed);
        }
        let open = self.layout().group_file("open", group);
        if open.exists() {
            return Ok(open);
        }
        Err(SiftError::Search(format!(
            "neither open nor closed node file exists for group {}",
            group
        )))
    }

    /// Count shared payloads and order interweaves between two sorted
    /// unique node files. Returns (duplicates, interweaves).
    pub fn compare(
        &self,
        path_a: &std::path::Path,
        path_b: &std::path::Path,
    ) -> Result<(u64, u64), SiftError> {
        let records = self.buffer_records();
        let mut a = NodeReader::<P::Packed>::open(path_a, records)?;
        let mut b = NodeReader::<P::Packed>::open(path_b, records)?;
        println!("{}: {} states", path_a.display(), a.size());
        println!("{}: {} states", path_b.display(), b.size());
        let mut head_a = a.read()?;
        let mut head_b = b.read()?;
        let mut duplicates = 0u64;
        let mut switches = 0u64;
        let mut last: Option<i32> = None;
        while let (Some(na), Some(nb)) = (head_a, head_b) {
            let current = if na < nb {
                head_a = a.read()?;
                -1
            } else if na > nb {
                head_b = b.read()?;
                1
            } else {
                duplicates += 1;
                head_a = a.read()?;
                head_b = b.read()?;
                0
            };
            if last.is_some() && last != Some(current) {
                switches += 1;
            }
            last = Some(current);
        }
        println!("{} duplicate states", duplicates);
        println!("{} interweaves", switches);
        Ok((duplicates, switches))
    }

    /// Integrity scan of one node file: sorted, payload-unique, valid
    /// subframes. Findings are diagnostics, not errors; only a subframe
    /// out of range fails, since that means torn records.
    pub fn verify(&self, path: &std::path::Path) -> Result<(), SiftError> {
        let mut reader = NodeReader::<P::Packed>::open(path, self.buffer_records())?;
        let mut previous = match reader.read()? {
            Some(node) => node,
            None => return Ok(()),
        };
        let mut equal_reported = false;
        let mut unordered_reported = false;
        let mut position = 0u64;
        while let Some(node) = reader.read()? {
            position += 1;
            if previous == node && !equal_reported {
                println!("Equal states found: {}", position);
                equal_reported = true;
            }
            if previous > node && !unordered_reported {
                println!("Unordered states found: {}", position);
                unordered_reported = true;
            }
            if node.subframe() >= P::FRAMES_PER_GROUP {
                return Err(SiftError::Corrupt(format!(
                    "invalid subframe at record {}",
                    position
                )));
            }
            previous = node;
            if equal_reported && unordered_reported {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Merge per-frame files into per-group files, recovering each
    /// record's subframe from the file it came from.
    pub fn convert(&self, first: FrameGroup, last: FrameGroup) -> Result<(), SiftError> {
        let records = self.buffer_records();
        for g in first..last.min(self.groups()) {
            let mut inputs = Vec::new();
            let mut subframes = Vec::new();
            let mut have_open = false;
            for f in g * P::FRAMES_PER_GROUP..(g + 1) * P::FRAMES_PER_GROUP {
                let closed = self.layout().frame_file("closed", f);
                let open = self.layout().frame_file("open", f);
                let path = if closed.exists() {
                    closed
                } else if open.exists() {
                    have_open = true;
                    open
                } else {
                    continue;
                };
                inputs.push(NodeReader::<P::Packed>::open(&path, records)?);
                subframes.push(f % P::FRAMES_PER_GROUP);
            }
            if inputs.is_empty() {
                continue;
            }
            println!("[sift] converting group {}", g);
            let converting = self.layout().group_file("converting", g);
            {
                let mut heap = MergeHeap::new(inputs)?;
                let mut out = NodeWriter::create(&converting, records)?;
                let mut warned = false;
                let mut current = match heap.head() {
                    Some((node, origin)) => {
                        let mut node = node;
                        node.set_subframe(subframes[origin]);
                        node
                    }
                    None => {
                        out.flush()?;
                        drop(out);
                        files::delete(&converting)?;
                        continue;
                    }
                };
                while heap.next()? {
                    let (node, origin) = heap.head().expect("head after next");
                    let mut node = node;
                    let subframe = subframes[origin];
                    node.set_subframe(subframe);
                    if node < current {
                        if !warned {
                            println!("Unordered states found in subframe {}, skipping", subframe);
                            warned = true;
                        }
                        continue;
                    }
                    if node == current {
                        if current.subframe() > subframe {
                            current.set_subframe(subframe);
                        }
                    } else {
                        out.write_ordered(current)?;
                        current = node;
                    }
                }
                out.write_ordered(current)?;
                out.flush()?;
            }
            let target = if have_open { "open" } else { "closed" };
            files::rename(&converting, &self.layout().group_file(target, g))?;
        }
        Ok(())
    }

    /// Split per-group closed files back into per-frame files with their
    /// subframes cleared (reverses `convert`).
    pub fn unpack(&self, first: FrameGroup, last: FrameGroup) -> Result<(), SiftError> {
        let records = self.buffer_records();
        for g in first..last.min(self.groups()) {
            let closed = self.layout().group_file("closed", g);
            if !closed.exists() {
                continue;
            }
            println!("[sift] unpacking group {}", g);
            let mut input = NodeReader::<P::Packed>::open(&closed, records)?;
            let mut outputs = Vec::with_capacity(P::FRAMES_PER_GROUP as usize);
            for i in 0..P::FRAMES_PER_GROUP {
                outputs.push(NodeWriter::create(
                    &self.layout().frame_file("closed", g * P::FRAMES_PER_GROUP + i),
                    records,
                )?);
            }
            while let Some(packed) = input.read()? {
                let subframe = packed.subframe();
                if subframe >= P::FRAMES_PER_GROUP {
                    return Err(SiftError::Corrupt(format!(
                        "invalid subframe in closed group {}",
                        g
                    )));
                }
                let mut cleared = packed;
                cleared.set_subframe(0);
                outputs[subframe as usize].write(cleared)?;
            }
            for mut output in outputs {
                output.flush()?;
            }
        }
        Ok(())
    }

    /// Per-frame record counts inside closed group files.
    pub fn count(&self, first: FrameGroup, last: FrameGroup) -> Result<(), SiftError> {
        for g in first..last.min(self.groups()) {
            let closed = self.layout().group_file("closed", g);
            if !closed.exists() {
                continue;
            }
            println!("[sift] group {}:", g);
            let mut input = NodeReader::<P::Packed>::open(&closed, self.buffer_records())?;
            let mut counts = vec![0u64; P::FRAMES_PER_GROUP as usize];
            while let Some(packed) = input.read()? {
                let subframe = packed.subframe().min(P::FRAMES_PER_GROUP - 1);
                counts[subframe as usize] += 1;
            }
            for (i, &count) in counts.iter().enumerate() {
                if count > 0 {
                    println!("Frame {}: {}", g * P::FRAMES_PER_GROUP + i as Frame, count);
                }
            }
        }
        Ok(())
    }
}
