//! Version edits: the deltas the manifest journals.
//!
//! Replaying every edit from an empty catalog reproduces the current
//! version. Each edit is encoded as a sequence of tagged fields, big-endian
//! throughout; unknown tags are a corruption, not an extension point.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::key::InternalKey;

const TAG_LOG_NO: u8 = 1;
const TAG_NEXT_FILE_NO: u8 = 2;
const TAG_LAST_SEQUENCE: u8 = 3;
const TAG_COMPACTION_POINTER: u8 = 4;
const TAG_DELETED_FILE: u8 = 5;
const TAG_ADDED_FILE: u8 = 6;

/// Metadata for a run being registered.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFile {
    pub file_no: u64,
    pub size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionEdit {
    pub log_no: Option<u64>,
    pub next_file_no: Option<u64>,
    pub last_sequence: Option<u64>,
    pub compaction_pointers: Vec<(usize, InternalKey)>,
    pub deleted_files: Vec<(usize, u64)>,
    pub added_files: Vec<(usize, NewFile)>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_log_no(&mut self, log_no: u64) {
        self.log_no = Some(log_no);
    }

    pub fn add_file(&mut self, level: usize, file: NewFile) {
        self.added_files.push((level, file));
    }

    pub fn delete_file(&mut self, level: usize, file_no: u64) {
        self.deleted_files.push((level, file_no));
    }

    pub fn set_compaction_pointer(&mut self, level: usize, key: InternalKey) {
        self.compaction_pointers.push((level, key));
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        if let Some(log_no) = self.log_no {
            buf.write_u8(TAG_LOG_NO).unwrap();
            buf.write_u64::<BigEndian>(log_no).unwrap();
        }
        if let Some(next_file_no) = self.next_file_no {
            buf.write_u8(TAG_NEXT_FILE_NO).unwrap();
            buf.write_u64::<BigEndian>(next_file_no).unwrap();
        }
        if let Some(last_sequence) = self.last_sequence {
            buf.write_u8(TAG_LAST_SEQUENCE).unwrap();
            buf.write_u64::<BigEndian>(last_sequence).unwrap();
        }
        for (level, key) in &self.compaction_pointers {
            buf.write_u8(TAG_COMPACTION_POINTER).unwrap();
            buf.write_u32::<BigEndian>(*level as u32).unwrap();
            write_key(&mut buf, key);
        }
        for (level, file_no) in &self.deleted_files {
            buf.write_u8(TAG_DELETED_FILE).unwrap();
            buf.write_u32::<BigEndian>(*level as u32).unwrap();
            buf.write_u64::<BigEndian>(*file_no).unwrap();
        }
        for (level, file) in &self.added_files {
            buf.write_u8(TAG_ADDED_FILE).unwrap();
            buf.write_u32::<BigEndian>(*level as u32).unwrap();
            buf.write_u64::<BigEndian>(file.file_no).unwrap();
            buf.write_u64::<BigEndian>(file.size).unwrap();
            write_key(&mut buf, &file.smallest);
            write_key(&mut buf, &file.largest);
        }

        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let mut edit = VersionEdit::new();

        while (cursor.position() as usize) < buf.len() {
            match cursor.read_u8()? {
                TAG_LOG_NO => edit.log_no = Some(cursor.read_u64::<BigEndian>()?),
                TAG_NEXT_FILE_NO => edit.next_file_no = Some(cursor.read_u64::<BigEndian>()?),
                TAG_LAST_SEQUENCE => edit.last_sequence = Some(cursor.read_u64::<BigEndian>()?),
                TAG_COMPACTION_POINTER => {
                    let level = read_level(&mut cursor)?;
                    let key = read_key(&mut cursor)?;
                    edit.compaction_pointers.push((level, key));
                }
                TAG_DELETED_FILE => {
                    let level = read_level(&mut cursor)?;
                    let file_no = cursor.read_u64::<BigEndian>()?;
                    edit.deleted_files.push((level, file_no));
                }
                TAG_ADDED_FILE => {
                    let level = read_level(&mut cursor)?;
                    let file_no = cursor.read_u64::<BigEndian>()?;
                    let size = cursor.read_u64::<BigEndian>()?;
                    let smallest = read_key(&mut cursor)?;
                    let largest = read_key(&mut cursor)?;
                    edit.added_files.push((
                        level,
                        NewFile {
                            file_no,
                            size,
                            smallest,
                            largest,
                        },
                    ));
                }
                other => {
                    return Err(Error::Corruption(format!(
                        "unknown version edit tag {other}"
                    )))
                }
            }
        }

        Ok(edit)
    }
}

fn write_key(buf: &mut Vec<u8>, key: &InternalKey) {
    let encoded = key.encode();
    buf.write_u32::<BigEndian>(encoded.len() as u32).unwrap();
    buf.extend_from_slice(&encoded);
}

fn read_key(cursor: &mut Cursor<&[u8]>) -> Result<InternalKey> {
    let len = cursor.read_u32::<BigEndian>()? as usize;
    let mut encoded = vec![0u8; len];
    cursor.read_exact(&mut encoded)?;
    InternalKey::decode(&encoded)
}

fn read_level(cursor: &mut Cursor<&[u8]>) -> Result<usize> {
    let level = cursor.read_u32::<BigEndian>()? as usize;
    if level >= crate::config::NUM_LEVELS {
        return Err(Error::Corruption(format!("level {level} out of range")));
    }
    Ok(level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ValueKind;

    fn ikey(key: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(key.to_vec(), seq, ValueKind::Value)
    }

    fn sample_file(file_no: u64) -> NewFile {
        NewFile {
            file_no,
            size: 4096,
            smallest: ikey(b"aaa", 10),
            largest: ikey(b"zzz", 2),
        }
    }

    #[test]
    fn empty_edit_roundtrips() {
        let edit = VersionEdit::new();
        assert_eq!(VersionEdit::decode(&edit.encode()).unwrap(), edit);
    }

    #[test]
    fn full_edit_roundtrips() {
        let mut edit = VersionEdit::new();
        edit.set_log_no(12);
        edit.next_file_no = Some(99);
        edit.last_sequence = Some(100_000);
        edit.set_compaction_pointer(2, ikey(b"pivot", 55));
        edit.delete_file(1, 7);
        edit.delete_file(2, 8);
        edit.add_file(2, sample_file(41));
        edit.add_file(3, sample_file(42));

        let decoded = VersionEdit::decode(&edit.encode()).unwrap();
        assert_eq!(decoded, edit);
    }

    #[test]
    fn unknown_tag_is_corruption() {
        let buf = vec![0xee];
        assert!(matches!(
            VersionEdit::decode(&buf),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn out_of_range_level_is_corruption() {
        let mut edit = VersionEdit::new();
        edit.delete_file(1, 7);
        let mut buf = edit.encode();
        // Level field sits right after the tag byte.
        buf[4] = 0xff;
        assert!(matches!(
            VersionEdit::decode(&buf),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn truncated_edit_is_an_error() {
        let mut edit = VersionEdit::new();
        edit.add_file(0, sample_file(1));
        let buf = edit.encode();
        assert!(VersionEdit::decode(&buf[..buf.len() - 3]).is_err());
    }
}
