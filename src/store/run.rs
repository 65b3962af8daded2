//! Sorted run files.
//!
//! A run is one immutable sorted file produced by a memtable flush or a
//! compaction. Records are laid out back to back, sorted by (key, seq):
//!
//! ```text
//! u32 key_len | key bytes | u64 seq | u32 row_len | row bytes
//! ```
//!
//! All integers big-endian. Runs are scanned sequentially; there is no
//! index block, because every read is a range scan through a k-way merge.

use bytes::Bytes;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// One entry read back from a run.
#[derive(Debug, Clone)]
pub struct RunEntry {
    pub key: Bytes,
    pub seq: u64,
    pub row: Bytes,
}

/// Metadata for a live run file.
#[derive(Debug, Clone)]
pub struct RunMeta {
    /// Sequence number in the file name; later runs have higher ids.
    pub id: u64,
    pub path: PathBuf,
    pub entries: u64,
}

/// File name for a run id under a shuffle directory.
pub fn run_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("run_{id:016}.run"))
}

/// Writer producing one sorted run file.
pub struct RunWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    entries: u64,
}

impl RunWriter {
    pub fn create(path: PathBuf) -> io::Result<Self> {
        let file = File::create(&path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            entries: 0,
        })
    }

    /// Append one entry; the caller must feed entries in (key, seq) order.
    pub fn append(&mut self, key: &[u8], seq: u64, row: &[u8]) -> io::Result<()> {
        self.writer.write_all(&(key.len() as u32).to_be_bytes())?;
        self.writer.write_all(key)?;
        self.writer.write_all(&seq.to_be_bytes())?;
        self.writer.write_all(&(row.len() as u32).to_be_bytes())?;
        self.writer.write_all(row)?;
        self.entries += 1;
        Ok(())
    }

    /// Flush and close the run, returning its metadata.
    pub fn finish(mut self, id: u64) -> io::Result<RunMeta> {
        self.writer.flush()?;
        Ok(RunMeta {
            id,
            path: self.path,
            entries: self.entries,
        })
    }
}

/// Sequential reader over one run file.
pub struct RunReader {
    reader: BufReader<File>,
    done: bool,
}

impl RunReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            done: false,
        })
    }

    /// Read the next entry, or `None` at end of file.
    pub fn next_entry(&mut self) -> io::Result<Option<RunEntry>> {
        if self.done {
            return Ok(None);
        }
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.done = true;
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        let key_len = u32::from_be_bytes(len_buf) as usize;
        let mut key = vec![0u8; key_len];
        self.reader.read_exact(&mut key)?;

        let mut seq_buf = [0u8; 8];
        self.reader.read_exact(&mut seq_buf)?;
        let seq = u64::from_be_bytes(seq_buf);

        self.reader.read_exact(&mut len_buf)?;
        let row_len = u32::from_be_bytes(len_buf) as usize;
        let mut row = vec![0u8; row_len];
        self.reader.read_exact(&mut row)?;

        Ok(Some(RunEntry {
            key: Bytes::from(key),
            seq,
            row: Bytes::from(row),
        }))
    }
}
