//! Run reader: point lookups and bidirectional cursors over one file.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Options;
use crate::error::{Error, Result};
use crate::iterator::InternalIterator;
use crate::key::InternalKey;
use crate::sstable::block::{Block, BlockIter};
use crate::sstable::{
    BlockHandle, Footer, BLOCK_TRAILER_SIZE, COMPRESSION_TAG_NONE, COMPRESSION_TAG_SNAPPY,
    FOOTER_SIZE,
};
use crate::wal::CRC32;

/// An open, immutable run.
///
/// The index block is held in memory; data blocks are read on demand with
/// positional reads, so a `Table` is shared freely across threads behind an
/// `Arc`.
pub struct Table {
    file: File,
    path: PathBuf,
    index: Arc<Block>,
    verify_checksums: bool,
}

impl Table {
    pub fn open<P: AsRef<Path>>(path: P, opts: &Options) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        if size < FOOTER_SIZE as u64 {
            return Err(Error::Corruption(format!(
                "run {} shorter than footer",
                path.display()
            )));
        }

        let mut footer_buf = [0u8; FOOTER_SIZE];
        file.read_exact_at(&mut footer_buf, size - FOOTER_SIZE as u64)?;
        let footer = Footer::decode(&footer_buf)?;

        let index = Arc::new(read_block(
            &file,
            &path,
            footer.index_handle,
            opts.paranoid_checks,
        )?);

        Ok(Self {
            file,
            path,
            index,
            verify_checksums: opts.paranoid_checks,
        })
    }

    /// First entry with internal key >= `target`, if any.
    pub fn get(&self, target: &InternalKey) -> Result<Option<(InternalKey, Vec<u8>)>> {
        let mut index_iter = self.index.iter();
        index_iter.seek(target);
        index_iter.status()?;
        if !index_iter.valid() {
            return Ok(None);
        }

        let handle = BlockHandle::decode(index_iter.value())?;
        let block = Arc::new(self.read_block(handle)?);
        let mut block_iter = block.iter();
        block_iter.seek(target);
        block_iter.status()?;
        if !block_iter.valid() {
            return Ok(None);
        }
        Ok(Some((block_iter.key().clone(), block_iter.value().to_vec())))
    }

    fn read_block(&self, handle: BlockHandle) -> Result<Block> {
        read_block(&self.file, &self.path, handle, self.verify_checksums)
    }

    pub fn iter(self: &Arc<Self>) -> TableIter {
        TableIter {
            table: Arc::clone(self),
            index_iter: self.index.iter(),
            data_iter: None,
            error: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_block(file: &File, path: &Path, handle: BlockHandle, verify: bool) -> Result<Block> {
    let total = handle.size as usize + BLOCK_TRAILER_SIZE;
    let mut buf = vec![0u8; total];
    file.read_exact_at(&mut buf, handle.offset)
        .map_err(|e| Error::Io(format!("reading block in {}: {e}", path.display())))?;

    let payload = &buf[..handle.size as usize];
    let tag = buf[handle.size as usize];
    let stored_crc = u32::from_be_bytes(
        buf[handle.size as usize + 1..].try_into().expect("trailer size"),
    );

    if verify {
        let mut digest = CRC32.digest();
        digest.update(payload);
        digest.update(&[tag]);
        if digest.finalize() != stored_crc {
            return Err(Error::Corruption(format!(
                "block checksum mismatch in {}",
                path.display()
            )));
        }
    }

    let contents = match tag {
        COMPRESSION_TAG_NONE => payload.to_vec(),
        COMPRESSION_TAG_SNAPPY => snap::raw::Decoder::new()
            .decompress_vec(payload)
            .map_err(|e| {
                Error::Corruption(format!(
                    "snappy decompression failed in {}: {e}",
                    path.display()
                ))
            })?,
        other => {
            return Err(Error::Corruption(format!(
                "unknown block compression tag {other} in {}",
                path.display()
            )))
        }
    };

    Block::new(contents)
}

/// Two-level cursor: the index block steers, one data block is open at a
/// time.
pub struct TableIter {
    table: Arc<Table>,
    index_iter: BlockIter,
    data_iter: Option<BlockIter>,
    error: Option<Error>,
}

impl TableIter {
    fn load_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.data_iter = None;
            return;
        }
        let handle = match BlockHandle::decode(self.index_iter.value()) {
            Ok(handle) => handle,
            Err(e) => {
                self.error = Some(e);
                self.data_iter = None;
                return;
            }
        };
        match self.table.read_block(handle) {
            Ok(block) => self.data_iter = Some(Arc::new(block).iter()),
            Err(e) => {
                self.error = Some(e);
                self.data_iter = None;
            }
        }
    }

    fn skip_empty_forward(&mut self) {
        while self.error.is_none() && self.data_iter.as_ref().map_or(false, |d| !d.valid()) {
            if self.data_iter.as_ref().map_or(false, |d| d.status().is_err()) {
                break;
            }
            self.index_iter.next();
            if !self.index_iter.valid() {
                self.data_iter = None;
                break;
            }
            self.load_data_block();
            if let Some(data) = &mut self.data_iter {
                data.seek_to_first();
            }
        }
    }

    fn skip_empty_backward(&mut self) {
        while self.error.is_none() && self.data_iter.as_ref().map_or(false, |d| !d.valid()) {
            if self.data_iter.as_ref().map_or(false, |d| d.status().is_err()) {
                break;
            }
            self.index_iter.prev();
            if !self.index_iter.valid() {
                self.data_iter = None;
                break;
            }
            self.load_data_block();
            if let Some(data) = &mut self.data_iter {
                data.seek_to_last();
            }
        }
    }
}

impl InternalIterator for TableIter {
    fn valid(&self) -> bool {
        self.data_iter.as_ref().map_or(false, |d| d.valid())
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.load_data_block();
        if let Some(data) = &mut self.data_iter {
            data.seek_to_first();
        }
        self.skip_empty_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.load_data_block();
        if let Some(data) = &mut self.data_iter {
            data.seek_to_last();
        }
        self.skip_empty_backward();
    }

    fn seek(&mut self, target: &InternalKey) {
        self.index_iter.seek(target);
        self.load_data_block();
        if let Some(data) = &mut self.data_iter {
            data.seek(target);
        }
        self.skip_empty_forward();
    }

    fn next(&mut self) {
        if let Some(data) = &mut self.data_iter {
            data.next();
        }
        self.skip_empty_forward();
    }

    fn prev(&mut self) {
        if let Some(data) = &mut self.data_iter {
            data.prev();
        }
        self.skip_empty_backward();
    }

    fn key(&self) -> &InternalKey {
        self.data_iter.as_ref().expect("iterator not valid").key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter.as_ref().expect("iterator not valid").value()
    }

    fn status(&self) -> Result<()> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        self.index_iter.status()?;
        if let Some(data) = &self.data_iter {
            data.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ValueKind;
    use crate::sstable::builder::TableBuilder;

    fn ikey(key: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(key.to_vec(), seq, ValueKind::Value)
    }

    fn build_table(dir: &tempfile::TempDir, opts: &Options, n: u64) -> Arc<Table> {
        let path = dir.path().join("000001.sst");
        let mut builder = TableBuilder::create(&path, opts).unwrap();
        for i in 0..n {
            let key = format!("key{i:05}");
            let value = format!("value{i}");
            builder.add(&ikey(key.as_bytes(), i + 1), value.as_bytes()).unwrap();
        }
        builder.finish().unwrap();
        Arc::new(Table::open(&path, opts).unwrap())
    }

    #[test]
    fn full_scan_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::default().block_size(128);
        let table = build_table(&dir, &opts, 500);

        let mut iter = table.iter();
        iter.seek_to_first();
        let mut forward = Vec::new();
        while iter.valid() {
            forward.push(iter.key().user_key.clone());
            iter.next();
        }
        assert_eq!(forward.len(), 500);
        assert!(forward.windows(2).all(|w| w[0] < w[1]));

        iter.seek_to_last();
        let mut backward = Vec::new();
        while iter.valid() {
            backward.push(iter.key().user_key.clone());
            iter.prev();
        }
        backward.reverse();
        assert_eq!(forward, backward);
        iter.status().unwrap();
    }

    #[test]
    fn seek_spans_block_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::default().block_size(64);
        let table = build_table(&dir, &opts, 200);

        let mut iter = table.iter();
        for i in [0u64, 1, 57, 123, 199] {
            let key = format!("key{i:05}");
            iter.seek(&InternalKey::for_lookup(key.as_bytes(), u64::MAX >> 8));
            assert!(iter.valid(), "seek to {key}");
            assert_eq!(iter.key().user_key, key.as_bytes());
        }

        iter.seek(&InternalKey::for_lookup(b"key99999", u64::MAX >> 8));
        assert!(!iter.valid());
    }

    #[test]
    fn get_respects_sequence_visibility() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000001.sst");
        let opts = Options::default();

        let mut builder = TableBuilder::create(&path, &opts).unwrap();
        builder.add(&ikey(b"k", 9), b"new").unwrap();
        builder.add(&ikey(b"k", 3), b"old").unwrap();
        builder.finish().unwrap();

        let table = Arc::new(Table::open(&path, &opts).unwrap());

        let (key, value) = table.get(&InternalKey::for_lookup(b"k", 100)).unwrap().unwrap();
        assert_eq!((key.sequence, value.as_slice()), (9, b"new".as_slice()));

        let (key, value) = table.get(&InternalKey::for_lookup(b"k", 5)).unwrap().unwrap();
        assert_eq!((key.sequence, value.as_slice()), (3, b"old".as_slice()));

        // Below every version: first entry >= lookup belongs to another key
        // or does not exist.
        assert!(table.get(&InternalKey::for_lookup(b"k", 2)).unwrap().is_none());
    }

    #[test]
    fn open_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000001.sst");
        std::fs::write(&path, b"tiny").unwrap();
        assert!(matches!(
            Table::open(&path, &Options::default()),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn checksum_mismatch_detected_when_paranoid() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::default()
            .paranoid_checks(true)
            .compression(crate::config::Compression::None);
        let path = dir.path().join("000001.sst");

        let mut builder = TableBuilder::create(&path, &opts).unwrap();
        builder.add(&ikey(b"aaaa", 1), b"pristine-value").unwrap();
        builder.finish().unwrap();

        // Corrupt a byte near the start of the first data block.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[10] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let table = Arc::new(Table::open(&path, &opts).expect("index block is intact"));
        assert!(matches!(
            table.get(&InternalKey::for_lookup(b"aaaa", 100)),
            Err(Error::Corruption(_))
        ));
    }
}
