//! Buffered record adaptors over the raw streams: single-record read and
//! write with the per-call overhead amortised across a block, plus debug
//! ordering checks for the sorted pipelines.

use std::path::Path;

use crate::disk::{InputStream, OutputStream, RewriteStream};
use crate::error::SiftError;
use crate::problem::PackedState;

/// Anything that yields packed records one at a time, in payload order
/// when feeding the sorted pipelines. `None` is end of input.
pub trait NodeSource<P: PackedState> {
    fn next_node(&mut self) -> Result<Option<P>, SiftError>;
}

pub struct NodeReader<P: PackedState> {
    stream: InputStream<P>,
    buf: Vec<P>,
    pos: usize,
    end: usize,
    verify_order: bool,
    last: Option<P>,
}

impl<P: PackedState> NodeReader<P> {
    pub fn open(path: &Path, buffer_records: usize) -> Result<Self, SiftError> {
        let stream = InputStream::open(path)?;
        Ok(Self {
            stream,
            buf: vec![P::default(); buffer_records.max(1)],
            pos: 0,
            end: 0,
            verify_order: false,
            last: None,
        })
    }

    /// Debug builds assert that records arrive strictly increasing.
    pub fn verify_order(mut self) -> Self {
        self.verify_order = cfg!(debug_assertions);
        self
    }

    pub fn size(&self) -> u64 {
        self.stream.size()
    }

    pub fn read(&mut self) -> Result<Option<P>, SiftError> {
        if self.pos == self.end {
            self.end = self.stream.read(&mut self.buf)?;
            self.pos = 0;
            if self.end == 0 {
                return Ok(None);
            }
        }
        let node = self.buf[self.pos];
        self.pos += 1;
        if self.verify_order {
            if let Some(last) = self.last {
                debug_assert!(last < node, "input is not sorted");
            }
            self.last = Some(node);
        }
        Ok(Some(node))
    }
}

impl<P: PackedState> NodeSource<P> for NodeReader<P> {
    fn next_node(&mut self) -> Result<Option<P>, SiftError> {
        self.read()
    }
}

pub struct NodeWriter<P: PackedState> {
    stream: OutputStream<P>,
    buf: Vec<P>,
    capacity: usize,
    last: Option<P>,
}

impl<P: PackedState> NodeWriter<P> {
    pub fn create(path: &Path, buffer_records: usize) -> Result<Self, SiftError> {
        Ok(Self {
            stream: OutputStream::create(path)?,
            buf: Vec::with_capacity(buffer_records.max(1)),
            capacity: buffer_records.max(1),
            last: None,
        })
    }

    pub fn append(path: &Path, buffer_records: usize) -> Result<Self, SiftError> {
        Ok(Self {
            stream: OutputStream::append(path)?,
            buf: Vec::with_capacity(buffer_records.max(1)),
            capacity: buffer_records.max(1),
            last: None,
        })
    }

    /// Records written so far, including those still buffered.
    pub fn size(&self) -> u64 {
        self.stream.size() + self.buf.len() as u64
    }

    pub fn write(&mut self, node: P) -> Result<(), SiftError> {
        self.buf.push(node);
        if self.buf.len() >= self.capacity {
            self.flush_buffer()?;
        }
        Ok(())
    }

    /// Like `write`, asserting in debug builds that output stays strictly
    /// increasing.
    pub fn write_ordered(&mut self, node: P) -> Result<(), SiftError> {
        if cfg!(debug_assertions) {
            if let Some(last) = self.last {
                debug_assert!(last < node, "output is not sorted");
            }
            self.last = Some(node);
        }
        self.write(node)
    }

    fn flush_buffer(&mut self) -> Result<(), SiftError> {
        if !self.buf.is_empty() {
            self.stream.write(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }

    /// Drain the buffer and force records to disk.
    pub fn flush(&mut self) -> Result<(), SiftError> {
        self.flush_buffer()?;
        self.stream.flush()
    }
}

/// Buffered wrapper over `RewriteStream` for in-place filtering.
pub struct NodeRewriter<P: PackedState> {
    stream: RewriteStream<P>,
    read_buf: Vec<P>,
    read_pos: usize,
    read_end: usize,
    write_buf: Vec<P>,
    write_capacity: usize,
}

impl<P: PackedState> NodeRewriter<P> {
    pub fn open(path: &Path, buffer_records: usize) -> Result<Self, SiftError> {
        Ok(Self {
            stream: RewriteStream::open(path)?,
            read_buf: vec![P::default(); buffer_records.max(1)],
            read_pos: 0,
            read_end: 0,
            write_buf: Vec::with_capacity(buffer_records.max(1)),
            write_capacity: buffer_records.max(1),
        })
    }

    pub fn size(&self) -> u64 {
        self.stream.size()
    }

    pub fn read(&mut self) -> Result<Option<P>, SiftError> {
        if self.read_pos == self.read_end {
            self.read_end = self.stream.read(&mut self.read_buf)?;
            self.read_pos = 0;
            if self.read_end == 0 {
                return Ok(None);
            }
        }
        let node = self.read_buf[self.read_pos];
        self.read_pos += 1;
        Ok(Some(node))
    }

    pub fn write(&mut self, node: P) -> Result<(), SiftError> {
        self.write_buf.push(node);
        if self.write_buf.len() >= self.write_capacity {
            self.flush_writes()?;
        }
        Ok(())
    }

    fn flush_writes(&mut self) -> Result<(), SiftError> {
        if !self.write_buf.is_empty() {
            self.stream.write(&self.write_buf)?;
            self.write_buf.clear();
        }
        Ok(())
    }

    /// Flush pending writes and cut the file at the write cursor.
    pub fn truncate(&mut self) -> Result<(), SiftError> {
        self.flush_writes()?;
        self.stream.truncate()
    }
}

impl<P: PackedState> NodeSource<P> for NodeRewriter<P> {
    fn next_node(&mut self) -> Result<Option<P>, SiftError> {
        self.read()
    }
}

/// In-memory source, used by tests and by the seeding path.
pub struct VecSource<P> {
    nodes: std::vec::IntoIter<P>,
}

impl<P: PackedState> VecSource<P> {
    pub fn new(nodes: Vec<P>) -> Self {
        Self { nodes: nodes.into_iter() }
    }
}

impl<P: PackedState> NodeSource<P> for VecSource<P> {
    fn next_node(&mut self) -> Result<Option<P>, SiftError> {
        Ok(self.nodes.next())
    }
}
