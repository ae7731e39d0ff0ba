use std::path::PathBuf;
use sysinfo::System;

use crate::problem::{PackedState, Problem};

/// Engine tuning. One instance per process; every size is in bytes and is
/// converted to record counts per problem at the point of use.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Directory holding every node file produced by the engine.
    pub dir: PathBuf,
    /// RAM arena: sizes the node cache, and bounds one sort chunk.
    pub ram_bytes: usize,
    /// Per-stream record buffer.
    pub standard_buffer_bytes: usize,
    /// Buffer for the aggregate ("all") file, scanned on every step.
    pub all_buffer_bytes: usize,
    /// Buffer for each chunk reader while merging sorted runs.
    pub merge_buffer_bytes: usize,
    /// Buffer for each per-group open-node writer.
    pub queue_buffer_bytes: usize,
    /// Capacity of the expansion ring between the feeder and the workers.
    pub ring_capacity: usize,
    /// Total threads; 1 disables the worker pool entirely.
    pub threads: usize,
    /// Slots per cache bucket.
    pub cache_ways: usize,
    /// Maintain the aggregate union of closed files.
    pub use_all: bool,
    /// Run sort-open + filter-open inline when free disk drops below this
    /// many bytes; 0 disables the check.
    pub free_space_floor: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            ram_bytes: default_ram_bytes(),
            standard_buffer_bytes: 1 << 20,
            all_buffer_bytes: 4 << 20,
            merge_buffer_bytes: 1 << 20,
            queue_buffer_bytes: 256 << 10,
            ring_capacity: 1 << 20,
            threads: default_threads(),
            cache_ways: 4,
            use_all: false,
            free_space_floor: 0,
        }
    }
}

impl SearchConfig {
    /// Defaults plus `SIFT_DIR`, `SIFT_RAM_BYTES` and `SIFT_THREADS`
    /// environment overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(dir) = std::env::var("SIFT_DIR") {
            cfg.dir = PathBuf::from(dir);
        }
        if let Ok(ram) = std::env::var("SIFT_RAM_BYTES") {
            if let Ok(parsed) = ram.parse::<usize>() {
                cfg.ram_bytes = parsed;
            }
        }
        if let Ok(threads) = std::env::var("SIFT_THREADS") {
            if let Ok(parsed) = threads.parse::<usize>() {
                cfg.threads = parsed.max(1);
            }
        }
        cfg
    }

    /// Small-footprint configuration rooted at `dir`, for tests.
    pub fn custom(dir: PathBuf) -> Self {
        Self {
            dir,
            ram_bytes: 1 << 20,
            standard_buffer_bytes: 16 << 10,
            all_buffer_bytes: 16 << 10,
            merge_buffer_bytes: 16 << 10,
            queue_buffer_bytes: 4 << 10,
            ring_capacity: 1 << 10,
            threads: 1,
            cache_ways: 4,
            use_all: false,
            free_space_floor: 0,
        }
    }

    /// Records that fit in one stream buffer of `bytes` bytes.
    pub fn records<P: PackedState>(bytes: usize) -> usize {
        (bytes / P::BYTES).max(1)
    }

    /// Records that fit in the RAM arena; the chunk size of the external
    /// sort.
    pub fn sort_chunk_records<P: PackedState>(&self) -> usize {
        (self.ram_bytes / P::BYTES).max(1)
    }

    pub fn print_summary<P: Problem>(&self) {
        let cache_node = P::Packed::BYTES + std::mem::size_of::<u32>();
        println!(
            "[sift] {}: packed state {} bits ({} bytes/record)",
            P::NAME,
            P::PAYLOAD_BITS,
            P::Packed::BYTES
        );
        println!(
            "[sift] RAM arena {} MB: {} cache nodes or {} sort-buffer nodes",
            self.ram_bytes / 1_048_576,
            self.ram_bytes / cache_node,
            self.ram_bytes / P::Packed::BYTES
        );
        println!(
            "[sift] {} threads, open queues in {}",
            self.threads,
            self.dir.display()
        );
    }
}

fn default_ram_bytes() -> usize {
    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory() as usize;
    // Leave the OS and the stream buffers plenty of room.
    ((total / 4).max(64 << 20)).min(8 << 30)
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maze::MazePacked;

    #[test]
    fn custom_config_is_small() {
        let cfg = SearchConfig::custom(PathBuf::from("/tmp/x"));
        assert_eq!(cfg.threads, 1);
        assert!(cfg.ram_bytes <= 1 << 20);
    }

    #[test]
    fn record_counts_round_down() {
        assert_eq!(SearchConfig::records::<MazePacked>(10), 2);
        assert_eq!(SearchConfig::records::<MazePacked>(3), 1);
    }
}
