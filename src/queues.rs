//! Per-frame-group open-node queues: one lazily created append-only
//! buffered writer per active group, safe for concurrent producers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::config::SearchConfig;
use crate::error::SiftError;
use crate::files::Layout;
use crate::problem::{Frame, FrameGroup, PackedState};
use crate::stream::NodeWriter;

pub struct OpenQueues<P: PackedState> {
    layout: Layout,
    slots: Vec<Mutex<Option<NodeWriter<P>>>>,
    no_queue: Vec<AtomicBool>,
    buffer_records: usize,
    frames_per_group: Frame,
}

impl<P: PackedState> OpenQueues<P> {
    pub fn new(layout: Layout, groups: FrameGroup, frames_per_group: Frame, cfg: &SearchConfig) -> Self {
        let mut slots = Vec::with_capacity(groups as usize);
        let mut no_queue = Vec::with_capacity(groups as usize);
        for _ in 0..groups {
            slots.push(Mutex::new(None));
            no_queue.push(AtomicBool::new(false));
        }
        Self {
            layout,
            slots,
            no_queue,
            buffer_records: SearchConfig::records::<P>(cfg.queue_buffer_bytes),
            frames_per_group,
        }
    }

    pub fn groups(&self) -> FrameGroup {
        self.slots.len() as FrameGroup
    }

    /// Queue a state discovered at `frame`. The subframe bits are set on
    /// a copy; the writer for the frame's group is created on first use.
    /// States past the group bound, and groups marked `no_queue`, are
    /// dropped.
    pub fn write_open_state(&self, mut node: P, frame: Frame) -> Result<(), SiftError> {
        let group = frame / self.frames_per_group;
        let Some(slot) = self.slots.get(group as usize) else {
            return Ok(());
        };
        if self.no_queue[group as usize].load(Ordering::Relaxed) {
            return Ok(());
        }
        node.set_subframe(frame % self.frames_per_group);
        let mut guard = slot.lock().expect("queue lock poisoned");
        if guard.is_none() {
            *guard = Some(NodeWriter::create(
                &self.layout.group_file("open", group),
                self.buffer_records,
            )?);
        }
        guard.as_mut().expect("writer just created").write(node)
    }

    /// Reattach to an existing open file in append mode (resume).
    pub fn reopen(&self, group: FrameGroup) -> Result<(), SiftError> {
        let mut guard = self.slots[group as usize].lock().expect("queue lock poisoned");
        *guard = Some(NodeWriter::append(
            &self.layout.group_file("open", group),
            self.buffer_records,
        )?);
        Ok(())
    }

    pub fn has_queue(&self, group: FrameGroup) -> bool {
        self.slots[group as usize].lock().expect("queue lock poisoned").is_some()
    }

    /// Suppress all writes for `group` (regenerate-open).
    pub fn set_no_queue(&self, group: FrameGroup, suppress: bool) {
        self.no_queue[group as usize].store(suppress, Ordering::Relaxed);
    }

    /// Flush and drop the writer for `group` before its file is consumed.
    pub fn close(&self, group: FrameGroup) -> Result<(), SiftError> {
        let mut guard = self.slots[group as usize].lock().expect("queue lock poisoned");
        if let Some(mut writer) = guard.take() {
            writer.flush()?;
        }
        Ok(())
    }

    pub fn flush_all(&self) -> Result<(), SiftError> {
        for slot in &self.slots {
            let mut guard = slot.lock().expect("queue lock poisoned");
            if let Some(writer) = guard.as_mut() {
                writer.flush()?;
            }
        }
        Ok(())
    }

    /// Flush and drop every live writer. Required before the open files
    /// are replaced on disk (sort-open/filter-open rename over them, so
    /// a held descriptor would keep appending to the unlinked file);
    /// reattach with `reopen` afterwards.
    pub fn close_all(&self) -> Result<(), SiftError> {
        for slot in &self.slots {
            let mut guard = slot.lock().expect("queue lock poisoned");
            if let Some(mut writer) = guard.take() {
                writer.flush()?;
            }
        }
        Ok(())
    }

    /// Records queued across every live writer, buffered included.
    pub fn total_queued(&self) -> u64 {
        self.slots
            .iter()
            .map(|slot| {
                slot.lock()
                    .expect("queue lock poisoned")
                    .as_ref()
                    .map(|w| w.size())
                    .unwrap_or(0)
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maze::MazePacked;
    use crate::stream::NodeReader;

    fn setup(tmp: &std::path::Path) -> OpenQueues<MazePacked> {
        let cfg = SearchConfig::custom(tmp.to_path_buf());
        let layout = Layout::new(tmp.to_path_buf()).unwrap();
        OpenQueues::new(layout, 8, 1, &cfg)
    }

    #[test]
    fn writes_land_in_frame_group_files() {
        let tmp = tempfile::tempdir().unwrap();
        let queues = setup(tmp.path());
        queues.write_open_state(MazePacked { x: 1, y: 1 }, 0).unwrap();
        queues.write_open_state(MazePacked { x: 2, y: 1 }, 3).unwrap();
        queues.write_open_state(MazePacked { x: 2, y: 2 }, 3).unwrap();
        assert!(queues.has_queue(0));
        assert!(queues.has_queue(3));
        assert!(!queues.has_queue(1));
        queues.flush_all().unwrap();

        let mut reader =
            NodeReader::<MazePacked>::open(&tmp.path().join("open-3.bin"), 16).unwrap();
        let mut count = 0;
        while reader.read().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
        assert_eq!(queues.total_queued(), 3);
    }

    #[test]
    fn out_of_range_and_suppressed_writes_are_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let queues = setup(tmp.path());
        queues.write_open_state(MazePacked { x: 1, y: 1 }, 900).unwrap();
        queues.set_no_queue(2, true);
        queues.write_open_state(MazePacked { x: 1, y: 1 }, 2).unwrap();
        assert!(!queues.has_queue(2));
        assert_eq!(queues.total_queued(), 0);
    }

    #[test]
    fn close_all_survives_a_file_swap() {
        // Compaction replaces open files by rename; a writer detached
        // with close_all and reattached afterwards must append to the
        // replacement file, not the unlinked original.
        let tmp = tempfile::tempdir().unwrap();
        let queues = setup(tmp.path());
        queues.write_open_state(MazePacked { x: 1, y: 1 }, 2).unwrap();
        queues.close_all().unwrap();
        assert!(!queues.has_queue(2));

        // Replace the file with a fresh inode holding the same records,
        // as sort-open's rename of the merged file does.
        let open2 = tmp.path().join("open-2.bin");
        let swapped = tmp.path().join("openpacked-2.bin");
        std::fs::rename(&open2, &swapped).unwrap();
        std::fs::copy(&swapped, &open2).unwrap();
        std::fs::remove_file(&swapped).unwrap();

        queues.reopen(2).unwrap();
        queues.write_open_state(MazePacked { x: 3, y: 3 }, 2).unwrap();
        queues.close(2).unwrap();

        let mut reader = NodeReader::<MazePacked>::open(&open2, 16).unwrap();
        let mut nodes = Vec::new();
        while let Some(node) = reader.read().unwrap() {
            nodes.push((node.x, node.y));
        }
        assert_eq!(nodes, vec![(1, 1), (3, 3)]);
    }

    #[test]
    fn close_flushes_and_drops_writer() {
        let tmp = tempfile::tempdir().unwrap();
        let queues = setup(tmp.path());
        queues.write_open_state(MazePacked { x: 5, y: 5 }, 1).unwrap();
        queues.close(1).unwrap();
        assert!(!queues.has_queue(1));
        assert!(tmp.path().join("open-1.bin").exists());

        // Reopen appends rather than truncating.
        queues.reopen(1).unwrap();
        queues.write_open_state(MazePacked { x: 6, y: 6 }, 1).unwrap();
        queues.close(1).unwrap();
        let mut reader =
            NodeReader::<MazePacked>::open(&tmp.path().join("open-1.bin"), 16).unwrap();
        let mut count = 0;
        while reader.read().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }
}
