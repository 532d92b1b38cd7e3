//! Append-only record logs.
//!
//! Both the write-ahead log and the manifest journal use the same framing: a
//! write-once header followed by length-prefixed, CRC-protected records.
//!
//! ```text
//! +--------------------+
//! | magic: u32         |
//! | format: u32        |
//! +--------------------+
//! | len: u32           |
//! | payload            |
//! | crc32: u32         |
//! +--------------------+
//! | ...                |
//! +--------------------+
//! ```
//!
//! All integers are big-endian; the CRC covers the payload. The header is
//! never rewritten, so records synced to disk stay byte-stable for the life
//! of the file.
//!
//! On replay, a clean end-of-file between records terminates the stream. A
//! torn or corrupt tail record either truncates the stream (default) or
//! surfaces as a corruption error (`paranoid_checks`).

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const LOG_MAGIC: u32 = 0x454d_4252;
const LOG_FORMAT: u32 = 1;
const HEADER_SIZE: usize = 8;

/// Cap on a single record, as a sanity bound against decoding a corrupt
/// length prefix into a huge allocation.
const MAX_RECORD_SIZE: usize = 1 << 30;

pub struct LogWriter {
    file: File,
    path: PathBuf,
}

impl LogWriter {
    /// Creates a fresh log, truncating anything at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.write_u32::<BigEndian>(LOG_MAGIC)?;
        file.write_u32::<BigEndian>(LOG_FORMAT)?;
        Ok(Self { file, path })
    }

    /// Reopens an existing log for appending. The caller must have verified
    /// that the log replays cleanly; appending after a torn tail would bury
    /// it inside the record stream.
    pub fn open_append<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let magic = file.read_u32::<BigEndian>()?;
        let format = file.read_u32::<BigEndian>()?;
        if magic != LOG_MAGIC || format != LOG_FORMAT {
            return Err(Error::Corruption(format!(
                "bad log header in {}",
                path.display()
            )));
        }
        file.seek(SeekFrom::End(0))?;
        Ok(Self { file, path })
    }

    pub fn add_record(&mut self, payload: &[u8]) -> Result<()> {
        let checksum = CRC32.checksum(payload);
        self.file.write_u32::<BigEndian>(payload.len() as u32)?;
        self.file.write_all(payload)?;
        self.file.write_u32::<BigEndian>(checksum)?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter").field("path", &self.path).finish()
    }
}

pub struct LogReader {
    reader: BufReader<File>,
    path: PathBuf,
    paranoid: bool,
    /// Set once a torn tail has been observed; further reads return
    /// end-of-stream.
    exhausted: bool,
}

impl LogReader {
    pub fn open<P: AsRef<Path>>(path: P, paranoid: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; HEADER_SIZE];
        let exhausted = match reader.read_exact(&mut header) {
            Ok(()) => {
                let magic = BigEndian::read_u32(&header[..4]);
                let format = BigEndian::read_u32(&header[4..]);
                if magic != LOG_MAGIC || format != LOG_FORMAT {
                    return Err(Error::Corruption(format!(
                        "bad log header in {}",
                        path.display()
                    )));
                }
                false
            }
            // A log created but never written past its header, or torn
            // mid-header. Nothing to replay.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                if paranoid {
                    return Err(Error::Corruption(format!(
                        "truncated log header in {}",
                        path.display()
                    )));
                }
                tracing::warn!(path = %path.display(), "log shorter than header, treating as empty");
                true
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            reader,
            path,
            paranoid,
            exhausted,
        })
    }

    /// Next record payload, or `None` at end of stream.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        if self.exhausted {
            return Ok(None);
        }

        let len = match self.reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Clean EOF only when it falls exactly on a record boundary;
                // a partial length prefix is a torn tail.
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if len > MAX_RECORD_SIZE {
            return self.tail_error(format!("record length {len} exceeds sanity bound"));
        }

        let mut payload = vec![0u8; len];
        if let Err(e) = self.reader.read_exact(&mut payload) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return self.tail_error("record torn mid-payload".to_string());
            }
            return Err(e.into());
        }

        let stored_crc = match self.reader.read_u32::<BigEndian>() {
            Ok(crc) => crc,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return self.tail_error("record torn mid-checksum".to_string());
            }
            Err(e) => return Err(e.into()),
        };

        if CRC32.checksum(&payload) != stored_crc {
            return self.tail_error("record checksum mismatch".to_string());
        }

        Ok(Some(payload))
    }

    /// True when the stream ended at a torn or corrupt tail rather than a
    /// clean record boundary. A truncated log must not be appended to.
    pub fn tail_truncated(&self) -> bool {
        self.exhausted
    }

    fn tail_error(&mut self, msg: String) -> Result<Option<Vec<u8>>> {
        self.exhausted = true;
        if self.paranoid {
            return Err(Error::Corruption(format!(
                "{msg} in {}",
                self.path.display()
            )));
        }
        tracing::warn!(path = %self.path.display(), "{msg}, truncating log");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("000001.log")
    }

    #[test]
    fn write_then_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);

        let mut writer = LogWriter::create(&path).unwrap();
        writer.add_record(b"first").unwrap();
        writer.add_record(b"").unwrap();
        writer.add_record(b"third record").unwrap();
        writer.sync().unwrap();
        drop(writer);

        let mut reader = LogReader::open(&path, true).unwrap();
        assert_eq!(reader.read_record().unwrap(), Some(b"first".to_vec()));
        assert_eq!(reader.read_record().unwrap(), Some(b"".to_vec()));
        assert_eq!(reader.read_record().unwrap(), Some(b"third record".to_vec()));
        assert_eq!(reader.read_record().unwrap(), None);
    }

    #[test]
    fn corrupt_payload_truncates_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);

        let mut writer = LogWriter::create(&path).unwrap();
        writer.add_record(b"good record").unwrap();
        writer.add_record(b"bad record").unwrap();
        drop(writer);

        // Flip a byte inside the second record's payload.
        let mut bytes = std::fs::read(&path).unwrap();
        let offset = bytes.len() - 6;
        bytes[offset] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = LogReader::open(&path, false).unwrap();
        assert_eq!(reader.read_record().unwrap(), Some(b"good record".to_vec()));
        assert_eq!(reader.read_record().unwrap(), None);
        assert_eq!(reader.read_record().unwrap(), None);
    }

    #[test]
    fn corrupt_payload_errors_when_paranoid() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);

        let mut writer = LogWriter::create(&path).unwrap();
        writer.add_record(b"good record").unwrap();
        writer.add_record(b"bad record").unwrap();
        drop(writer);

        let mut bytes = std::fs::read(&path).unwrap();
        let offset = bytes.len() - 6;
        bytes[offset] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = LogReader::open(&path, true).unwrap();
        assert_eq!(reader.read_record().unwrap(), Some(b"good record".to_vec()));
        assert!(matches!(reader.read_record(), Err(Error::Corruption(_))));
    }

    #[test]
    fn torn_tail_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);

        let mut writer = LogWriter::create(&path).unwrap();
        writer.add_record(b"kept").unwrap();
        writer.add_record(b"lost in the crash").unwrap();
        drop(writer);

        // Cut the file mid-way through the second record.
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();

        let mut reader = LogReader::open(&path, false).unwrap();
        assert_eq!(reader.read_record().unwrap(), Some(b"kept".to_vec()));
        assert_eq!(reader.read_record().unwrap(), None);
    }

    #[test]
    fn append_continues_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);

        let mut writer = LogWriter::create(&path).unwrap();
        writer.add_record(b"one").unwrap();
        drop(writer);

        let mut writer = LogWriter::open_append(&path).unwrap();
        writer.add_record(b"two").unwrap();
        drop(writer);

        let mut reader = LogReader::open(&path, true).unwrap();
        assert_eq!(reader.read_record().unwrap(), Some(b"one".to_vec()));
        assert_eq!(reader.read_record().unwrap(), Some(b"two".to_vec()));
        assert_eq!(reader.read_record().unwrap(), None);
    }

    #[test]
    fn bad_magic_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        std::fs::write(&path, b"not a log file at all").unwrap();
        assert!(matches!(
            LogReader::open(&path, false),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn empty_file_is_empty_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        std::fs::write(&path, b"").unwrap();

        let mut reader = LogReader::open(&path, false).unwrap();
        assert_eq!(reader.read_record().unwrap(), None);
    }
}
