//! Append-Only Journal
//!
//! Every mutation a storage instance acknowledges is appended here as one
//! self-delimited frame; replay feeds the records back in write order when
//! the instance restarts. Reads are never journaled.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

/// Mutation kind carried by a journal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MutationOp {
    Put = 1,
    Del = 2,
    Incr = 3,
    Decr = 4,
}

impl MutationOp {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(MutationOp::Put),
            2 => Some(MutationOp::Del),
            3 => Some(MutationOp::Incr),
            4 => Some(MutationOp::Decr),
            _ => None,
        }
    }
}

/// One journaled mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub op: MutationOp,
    pub key: String,
    /// Payload of the mutation: the stored value for PUT, the operand for
    /// INCR/DECR, empty for DEL.
    pub value: String,
    pub timestamp_ms: u64,
}

impl JournalRecord {
    pub fn new(op: MutationOp, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            op,
            key: key.into(),
            value: value.into(),
            timestamp_ms: now_ms(),
        }
    }

    /// Encode the record body (without the outer length prefix).
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 8 + 8 + self.key.len() + self.value.len());
        buf.put_u8(self.op as u8);
        buf.put_u64_le(self.timestamp_ms);
        buf.put_u32_le(self.key.len() as u32);
        buf.put_slice(self.key.as_bytes());
        buf.put_u32_le(self.value.len() as u32);
        buf.put_slice(self.value.as_bytes());
        buf.freeze()
    }

    fn decode(mut body: Bytes) -> Option<Self> {
        if body.remaining() < 1 + 8 + 4 {
            return None;
        }
        let op = MutationOp::from_u8(body.get_u8())?;
        let timestamp_ms = body.get_u64_le();
        let key_len = body.get_u32_le() as usize;
        if body.remaining() < key_len + 4 {
            return None;
        }
        let key = String::from_utf8(body.split_to(key_len).to_vec()).ok()?;
        let value_len = body.get_u32_le() as usize;
        if body.remaining() < value_len {
            return None;
        }
        let value = String::from_utf8(body.split_to(value_len).to_vec()).ok()?;
        Some(Self {
            op,
            key,
            value,
            timestamp_ms,
        })
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Append-only journal writer. The file is exclusively owned by its
/// instance and never mutated after write.
pub struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
    record_count: usize,
}

impl Journal {
    /// Create or open the journal file for appending.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            record_count: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably extend the journal with one record. An error here means the
    /// mutation cannot be made durable and must be treated as fatal by the
    /// caller.
    pub fn append(&mut self, record: &JournalRecord) -> io::Result<()> {
        let body = record.encode();
        self.writer.write_all(&(body.len() as u32).to_le_bytes())?;
        self.writer.write_all(&body)?;
        self.writer.flush()?;
        self.record_count += 1;
        Ok(())
    }

    /// Records appended through this handle.
    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// Flush buffered writes and close the file.
    pub fn close(mut self) -> io::Result<()> {
        self.writer.flush()
    }

    /// Read records in write order, invoking `visit` on each. A torn
    /// trailing frame (crash mid-append) terminates replay with a warning
    /// rather than an error.
    pub fn replay<P, F>(path: P, mut visit: F) -> io::Result<usize>
    where
        P: AsRef<Path>,
        F: FnMut(JournalRecord),
    {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(0);
        }
        let mut reader = BufReader::new(File::open(path)?);
        let mut replayed = 0usize;
        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            if let Err(e) = reader.read_exact(&mut body) {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    warn!(path = %path.display(), "journal ends mid-record, stopping replay");
                    break;
                }
                return Err(e);
            }
            match JournalRecord::decode(Bytes::from(body)) {
                Some(record) => {
                    visit(record);
                    replayed += 1;
                }
                None => {
                    warn!(path = %path.display(), "undecodable journal record, stopping replay");
                    break;
                }
            }
        }
        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".journal");

        let mut journal = Journal::open(&path).unwrap();
        journal
            .append(&JournalRecord::new(MutationOp::Put, "key1", "value1"))
            .unwrap();
        journal
            .append(&JournalRecord::new(MutationOp::Incr, "n", "5"))
            .unwrap();
        journal
            .append(&JournalRecord::new(MutationOp::Del, "key1", ""))
            .unwrap();
        assert_eq!(journal.record_count(), 3);
        journal.close().unwrap();

        let mut seen = Vec::new();
        let replayed = Journal::replay(&path, |record| seen.push(record)).unwrap();
        assert_eq!(replayed, 3);
        assert_eq!(seen[0].op, MutationOp::Put);
        assert_eq!(seen[0].key, "key1");
        assert_eq!(seen[0].value, "value1");
        assert_eq!(seen[1].op, MutationOp::Incr);
        assert_eq!(seen[2].op, MutationOp::Del);
        assert!(seen[2].value.is_empty());
    }

    #[test]
    fn test_replay_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let replayed =
            Journal::replay(dir.path().join(".journal"), |_| panic!("no records")).unwrap();
        assert_eq!(replayed, 0);
    }

    #[test]
    fn test_replay_tolerates_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".journal");

        let mut journal = Journal::open(&path).unwrap();
        journal
            .append(&JournalRecord::new(MutationOp::Put, "k", "v"))
            .unwrap();
        journal.close().unwrap();

        // Simulate a crash mid-append: a length prefix with no body.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&64u32.to_le_bytes()).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        drop(file);

        let mut seen = Vec::new();
        let replayed = Journal::replay(&path, |record| seen.push(record)).unwrap();
        assert_eq!(replayed, 1);
        assert_eq!(seen[0].key, "k");
    }
}
