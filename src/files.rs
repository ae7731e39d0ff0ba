use std::fs;
use std::path::{Path, PathBuf};

use crate::error::SiftError;
use crate::problem::FrameGroup;

/// Naming scheme for everything the engine keeps on disk, rooted at one
/// working directory. Per-group files are `<name>-<g>.bin`, sort chunks
/// are `chunk-<g>-<i>.bin`.
#[derive(Debug, Clone)]
pub struct Layout {
    dir: PathBuf,
}

impl Layout {
    pub fn new(dir: PathBuf) -> Result<Self, SiftError> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn group_file(&self, name: &str, group: FrameGroup) -> PathBuf {
        self.dir.join(format!("{}-{}.bin", name, group))
    }

    pub fn chunk_file(&self, group: FrameGroup, chunk: usize) -> PathBuf {
        self.dir.join(format!("chunk-{}-{}.bin", group, chunk))
    }

    /// Per-frame (ungrouped) file, used by convert/unpack when frames
    /// are grouped. Distinct from the per-group name space.
    pub fn frame_file(&self, name: &str, frame: crate::problem::Frame) -> PathBuf {
        self.dir.join(format!("{}-f{}.bin", name, frame))
    }

    pub fn solution_checkpoint(&self) -> PathBuf {
        self.dir.join("solution.bin")
    }

    pub fn solution_text(&self) -> PathBuf {
        self.dir.join("solution.txt")
    }

    pub fn stop_file(&self) -> PathBuf {
        self.dir.join("stop.txt")
    }

    /// Largest group with a closed file, scanning down from `groups`.
    pub fn largest_closed(&self, groups: FrameGroup) -> Option<FrameGroup> {
        (0..groups).rev().find(|&g| self.group_file("closed", g).exists())
    }

    /// The single live aggregate file, if any. At most one exists; the
    /// newest (largest group) wins if older ones were left behind.
    pub fn latest_all(&self, groups: FrameGroup) -> Option<FrameGroup> {
        (0..groups).rev().find(|&g| self.group_file("all", g).exists())
    }

    /// True when a stop was requested; consumes the stop file so the next
    /// run starts cleanly.
    pub fn take_stop_request(&self) -> Result<bool, SiftError> {
        let stop = self.stop_file();
        if stop.exists() {
            fs::remove_file(&stop)?;
            println!("[sift] stop file found");
            return Ok(true);
        }
        Ok(false)
    }

    /// Free bytes on the volume holding the working directory, or None if
    /// it cannot be determined.
    pub fn free_space(&self) -> Option<u64> {
        let target = self.dir.canonicalize().ok()?;
        let disks = sysinfo::Disks::new_with_refreshed_list();
        disks
            .iter()
            .filter(|d| target.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space())
    }
}

pub fn delete(path: &Path) -> Result<(), SiftError> {
    fs::remove_file(path)
        .map_err(|e| SiftError::Io(std::io::Error::new(e.kind(), format!("deleting {}: {}", path.display(), e))))
}

/// Promote `from` over `to`. The destination is replaced atomically; a
/// crash leaves either the old or the new file, never a mix.
pub fn rename(from: &Path, to: &Path) -> Result<(), SiftError> {
    fs::rename(from, to).map_err(|e| {
        SiftError::Io(std::io::Error::new(
            e.kind(),
            format!("renaming {} -> {}: {}", from.display(), to.display(), e),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_layout() {
        let layout = Layout::new(std::env::temp_dir()).unwrap();
        assert!(layout.group_file("open", 3).ends_with("open-3.bin"));
        assert!(layout.chunk_file(3, 1).ends_with("chunk-3-1.bin"));
        assert!(layout.solution_checkpoint().ends_with("solution.bin"));
    }

    #[test]
    fn closed_scan_finds_largest() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout::new(tmp.path().to_path_buf()).unwrap();
        assert_eq!(layout.largest_closed(10), None);
        fs::write(layout.group_file("closed", 2), b"").unwrap();
        fs::write(layout.group_file("closed", 5), b"").unwrap();
        assert_eq!(layout.largest_closed(10), Some(5));
    }

    #[test]
    fn stop_request_is_consumed() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout::new(tmp.path().to_path_buf()).unwrap();
        assert!(!layout.take_stop_request().unwrap());
        fs::write(layout.stop_file(), b"").unwrap();
        assert!(layout.take_stop_request().unwrap());
        assert!(!layout.stop_file().exists());
    }
}
