//! Record-granular file streams. Files are raw concatenations of packed
//! records: no headers, no delimiters. Sizes, positions and seeks are all
//! expressed in records; a file whose byte length is not a multiple of the
//! record width is corrupt.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::error::SiftError;
use crate::problem::PackedState;

fn record_len<P: PackedState>(path: &Path, byte_len: u64) -> Result<u64, SiftError> {
    let width = P::BYTES as u64;
    if byte_len % width != 0 {
        return Err(SiftError::Corrupt(format!(
            "{}: {} bytes is not a whole number of {}-byte records",
            path.display(),
            byte_len,
            width
        )));
    }
    Ok(byte_len / width)
}

/// Sequential reader with record-granular seek.
pub struct InputStream<P: PackedState> {
    file: File,
    path: PathBuf,
    len: u64,
    pos: u64,
    scratch: Vec<u8>,
    _marker: PhantomData<P>,
}

impl<P: PackedState> InputStream<P> {
    pub fn open(path: &Path) -> Result<Self, SiftError> {
        let file = File::open(path).map_err(|e| {
            SiftError::Io(std::io::Error::new(
                e.kind(),
                format!("opening {}: {}", path.display(), e),
            ))
        })?;
        let len = record_len::<P>(path, file.metadata()?.len())?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
            pos: 0,
            scratch: Vec::new(),
            _marker: PhantomData,
        })
    }

    pub fn size(&self) -> u64 {
        self.len
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn seek(&mut self, pos: u64) -> Result<(), SiftError> {
        self.file.seek(SeekFrom::Start(pos * P::BYTES as u64))?;
        self.pos = pos;
        Ok(())
    }

    /// Fill a prefix of `out`, returning how many records were read. Zero
    /// means end of file; a partial trailing record is corrupt data.
    pub fn read(&mut self, out: &mut [P]) -> Result<usize, SiftError> {
        let want = (out.len() as u64).min(self.len.saturating_sub(self.pos)) as usize;
        if want == 0 {
            return Ok(0);
        }
        let bytes = want * P::BYTES;
        self.scratch.resize(bytes, 0);
        let mut filled = 0;
        while filled < bytes {
            let n = self.file.read(&mut self.scratch[filled..bytes])?;
            if n == 0 {
                if filled % P::BYTES != 0 {
                    return Err(SiftError::Corrupt(format!(
                        "{}: end of file inside a record",
                        self.path.display()
                    )));
                }
                break;
            }
            filled += n;
        }
        let records = filled / P::BYTES;
        for (i, slot) in out.iter_mut().take(records).enumerate() {
            *slot = P::read_bytes(&self.scratch[i * P::BYTES..(i + 1) * P::BYTES]);
        }
        self.pos += records as u64;
        Ok(records)
    }
}

/// Sequential writer; `resume` reopens an existing file in append mode.
pub struct OutputStream<P: PackedState> {
    file: File,
    len: u64,
    scratch: Vec<u8>,
    _marker: PhantomData<P>,
}

impl<P: PackedState> OutputStream<P> {
    pub fn create(path: &Path) -> Result<Self, SiftError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| {
                SiftError::Io(std::io::Error::new(
                    e.kind(),
                    format!("creating {}: {}", path.display(), e),
                ))
            })?;
        Ok(Self {
            file,
            len: 0,
            scratch: Vec::new(),
            _marker: PhantomData,
        })
    }

    pub fn append(path: &Path) -> Result<Self, SiftError> {
        let file = OpenOptions::new().append(true).open(path).map_err(|e| {
            SiftError::Io(std::io::Error::new(
                e.kind(),
                format!("appending to {}: {}", path.display(), e),
            ))
        })?;
        let len = record_len::<P>(path, file.metadata()?.len())?;
        Ok(Self {
            file,
            len,
            scratch: Vec::new(),
            _marker: PhantomData,
        })
    }

    pub fn size(&self) -> u64 {
        self.len
    }

    pub fn write(&mut self, records: &[P]) -> Result<(), SiftError> {
        self.scratch.resize(records.len() * P::BYTES, 0);
        for (i, r) in records.iter().enumerate() {
            r.write_bytes(&mut self.scratch[i * P::BYTES..(i + 1) * P::BYTES]);
        }
        self.file.write_all(&self.scratch)?;
        self.len += records.len() as u64;
        Ok(())
    }

    /// Force the written records to stable storage, ahead of a promoting
    /// rename.
    pub fn flush(&mut self) -> Result<(), SiftError> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Read-then-overwrite stream for in-place filtering. The write cursor
/// must never pass the read cursor; `truncate` cuts the file at the write
/// cursor once filtering is done.
pub struct RewriteStream<P: PackedState> {
    file: File,
    path: PathBuf,
    len: u64,
    read_pos: u64,
    write_pos: u64,
    scratch: Vec<u8>,
    _marker: PhantomData<P>,
}

impl<P: PackedState> RewriteStream<P> {
    pub fn open(path: &Path) -> Result<Self, SiftError> {
        let file = OpenOptions::new().read(true).write(true).open(path).map_err(|e| {
            SiftError::Io(std::io::Error::new(
                e.kind(),
                format!("opening {} for rewrite: {}", path.display(), e),
            ))
        })?;
        let len = record_len::<P>(path, file.metadata()?.len())?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
            read_pos: 0,
            write_pos: 0,
            scratch: Vec::new(),
            _marker: PhantomData,
        })
    }

    pub fn size(&self) -> u64 {
        self.len
    }

    pub fn read(&mut self, out: &mut [P]) -> Result<usize, SiftError> {
        let want = (out.len() as u64).min(self.len.saturating_sub(self.read_pos)) as usize;
        if want == 0 {
            return Ok(0);
        }
        self.file.seek(SeekFrom::Start(self.read_pos * P::BYTES as u64))?;
        let bytes = want * P::BYTES;
        self.scratch.resize(bytes, 0);
        self.file.read_exact(&mut self.scratch[..bytes]).map_err(|e| {
            SiftError::Corrupt(format!("{}: short read: {}", self.path.display(), e))
        })?;
        for (i, slot) in out.iter_mut().take(want).enumerate() {
            *slot = P::read_bytes(&self.scratch[i * P::BYTES..(i + 1) * P::BYTES]);
        }
        self.read_pos += want as u64;
        Ok(want)
    }

    pub fn write(&mut self, records: &[P]) -> Result<(), SiftError> {
        let end = self.write_pos + records.len() as u64;
        if end > self.read_pos {
            return Err(SiftError::Search(format!(
                "{}: rewrite would overwrite unread records (write {} past read {})",
                self.path.display(),
                end,
                self.read_pos
            )));
        }
        self.file.seek(SeekFrom::Start(self.write_pos * P::BYTES as u64))?;
        self.scratch.resize(records.len() * P::BYTES, 0);
        for (i, r) in records.iter().enumerate() {
            r.write_bytes(&mut self.scratch[i * P::BYTES..(i + 1) * P::BYTES]);
        }
        self.file.write_all(&self.scratch)?;
        self.write_pos = end;
        Ok(())
    }

    /// Set end of file to the write cursor.
    pub fn truncate(&mut self) -> Result<(), SiftError> {
        self.file.set_len(self.write_pos * P::BYTES as u64)?;
        self.len = self.write_pos;
        Ok(())
    }
}

/// Copy a node file record by record.
pub fn copy_nodes<P: PackedState>(from: &Path, to: &Path) -> Result<(), SiftError> {
    let mut input = InputStream::<P>::open(from)?;
    let mut output = OutputStream::<P>::create(to)?;
    let mut buffer = vec![P::default(); 64 * 1024 / P::BYTES.max(1)];
    loop {
        let records = input.read(&mut buffer)?;
        if records == 0 {
            break;
        }
        output.write(&buffer[..records])?;
    }
    output.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maze::MazePacked;

    fn packed(x: u16, y: u16) -> MazePacked {
        MazePacked { x, y }
    }

    #[test]
    fn write_then_read_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nodes.bin");
        let mut out = OutputStream::create(&path).unwrap();
        out.write(&[packed(1, 2), packed(3, 4), packed(5, 6)]).unwrap();
        out.flush().unwrap();
        assert_eq!(out.size(), 3);

        let mut input = InputStream::<MazePacked>::open(&path).unwrap();
        assert_eq!(input.size(), 3);
        let mut buf = [MazePacked::default(); 8];
        let n = input.read(&mut buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(buf[2], packed(5, 6));
        assert_eq!(input.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn append_resumes_at_end() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nodes.bin");
        OutputStream::create(&path).unwrap().write(&[packed(1, 1)]).unwrap();
        let mut out = OutputStream::<MazePacked>::append(&path).unwrap();
        assert_eq!(out.size(), 1);
        out.write(&[packed(2, 2)]).unwrap();
        let mut input = InputStream::<MazePacked>::open(&path).unwrap();
        assert_eq!(input.size(), 2);
        let mut buf = [MazePacked::default(); 2];
        input.read(&mut buf).unwrap();
        assert_eq!(buf, [packed(1, 1), packed(2, 2)]);
    }

    #[test]
    fn seek_is_record_granular() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nodes.bin");
        let mut out = OutputStream::create(&path).unwrap();
        out.write(&[packed(0, 0), packed(1, 1), packed(2, 2)]).unwrap();
        let mut input = InputStream::<MazePacked>::open(&path).unwrap();
        input.seek(2).unwrap();
        let mut buf = [MazePacked::default(); 1];
        assert_eq!(input.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], packed(2, 2));
    }

    #[test]
    fn torn_file_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("torn.bin");
        std::fs::write(&path, [0u8; 6]).unwrap();
        assert!(matches!(
            InputStream::<MazePacked>::open(&path),
            Err(SiftError::Corrupt(_))
        ));
    }

    #[test]
    fn rewrite_respects_cursor_order() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nodes.bin");
        let mut out = OutputStream::create(&path).unwrap();
        out.write(&[packed(1, 1), packed(2, 2), packed(3, 3), packed(4, 4)]).unwrap();
        drop(out);

        let mut rw = RewriteStream::<MazePacked>::open(&path).unwrap();
        // Writing before reading anything is an error.
        assert!(rw.write(&[packed(9, 9)]).is_err());

        let mut buf = [MazePacked::default(); 2];
        assert_eq!(rw.read(&mut buf).unwrap(), 2);
        rw.write(&[packed(2, 2)]).unwrap();
        assert_eq!(rw.read(&mut buf).unwrap(), 2);
        rw.write(&[packed(4, 4)]).unwrap();
        rw.truncate().unwrap();
        drop(rw);

        let mut input = InputStream::<MazePacked>::open(&path).unwrap();
        assert_eq!(input.size(), 2);
        let mut buf = [MazePacked::default(); 2];
        input.read(&mut buf).unwrap();
        assert_eq!(buf, [packed(2, 2), packed(4, 4)]);
    }
}
