//! Streaming run writer.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::{Compression, Options};
use crate::error::{Error, Result};
use crate::key::InternalKey;
use crate::sstable::block::BlockBuilder;
use crate::sstable::{
    BlockHandle, Footer, COMPRESSION_TAG_NONE, COMPRESSION_TAG_SNAPPY,
};
use crate::wal::CRC32;

/// Builds one run file from an ascending stream of internal keys.
///
/// Data blocks are cut at the configured block size; each finished block's
/// last key and location go into the index block, which is written together
/// with the footer by `finish`.
pub struct TableBuilder {
    file: File,
    path: PathBuf,
    block_size: usize,
    restart_interval: usize,
    compression: Compression,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    /// Handle of the last finished data block, waiting for its index entry.
    pending_handle: Option<(Vec<u8>, BlockHandle)>,
    offset: u64,
    num_entries: u64,
    smallest: Option<InternalKey>,
    largest: Option<InternalKey>,
}

impl TableBuilder {
    pub fn create<P: AsRef<Path>>(path: P, opts: &Options) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            file,
            path,
            block_size: opts.block_size,
            restart_interval: opts.block_restart_interval,
            compression: opts.compression,
            data_block: BlockBuilder::new(opts.block_restart_interval),
            // Index entries are full keys; restarts gain nothing there.
            index_block: BlockBuilder::new(1),
            pending_handle: None,
            offset: 0,
            num_entries: 0,
            smallest: None,
            largest: None,
        })
    }

    /// Appends one entry. Keys must arrive in ascending internal-key order.
    pub fn add(&mut self, key: &InternalKey, value: &[u8]) -> Result<()> {
        if let Some(largest) = &self.largest {
            if key <= largest {
                return Err(Error::InvalidArgument(format!(
                    "out-of-order key for {:?}",
                    String::from_utf8_lossy(&key.user_key)
                )));
            }
        }
        self.flush_pending_index_entry();

        let encoded = key.encode();
        self.data_block.add(&encoded, value);
        self.num_entries += 1;
        if self.smallest.is_none() {
            self.smallest = Some(key.clone());
        }
        self.largest = Some(key.clone());

        if self.data_block.size_estimate() >= self.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    fn flush_pending_index_entry(&mut self) {
        if let Some((last_key, handle)) = self.pending_handle.take() {
            self.index_block.add(&last_key, &handle.encode());
        }
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let block = std::mem::replace(
            &mut self.data_block,
            BlockBuilder::new(self.restart_interval),
        );
        let last_key = block.last_key().to_vec();
        let handle = self.write_block(block.finish())?;
        self.pending_handle = Some((last_key, handle));
        Ok(())
    }

    fn write_block(&mut self, contents: Vec<u8>) -> Result<BlockHandle> {
        let (payload, tag) = match self.compression {
            Compression::None => (contents, COMPRESSION_TAG_NONE),
            Compression::Snappy => {
                let compressed = snap::raw::Encoder::new()
                    .compress_vec(&contents)
                    .map_err(|e| Error::Io(format!("snappy compression failed: {e}")))?;
                // Incompressible blocks are stored raw.
                if compressed.len() < contents.len() {
                    (compressed, COMPRESSION_TAG_SNAPPY)
                } else {
                    (contents, COMPRESSION_TAG_NONE)
                }
            }
        };

        let handle = BlockHandle {
            offset: self.offset,
            size: payload.len() as u64,
        };

        let mut digest = CRC32.digest();
        digest.update(&payload);
        digest.update(&[tag]);
        let checksum = digest.finalize();

        self.file.write_all(&payload)?;
        self.file.write_all(&[tag])?;
        self.file.write_all(&checksum.to_be_bytes())?;
        self.offset += payload.len() as u64 + super::BLOCK_TRAILER_SIZE as u64;
        Ok(handle)
    }

    /// Writes the index block and footer, syncs, and returns the file size.
    pub fn finish(mut self) -> Result<u64> {
        self.flush_data_block()?;
        self.flush_pending_index_entry();

        let index_block = std::mem::replace(&mut self.index_block, BlockBuilder::new(1));
        let index_handle = self.write_block(index_block.finish())?;

        let footer = Footer { index_handle };
        self.file.write_all(&footer.encode())?;
        self.offset += super::FOOTER_SIZE as u64;
        self.file.sync_all()?;
        Ok(self.offset)
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written so far plus the current unflushed block, used by
    /// compaction to decide output cuts.
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.data_block.size_estimate() as u64
    }

    pub fn smallest(&self) -> Option<&InternalKey> {
        self.smallest.as_ref()
    }

    pub fn largest(&self) -> Option<&InternalKey> {
        self.largest.as_ref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ValueKind;
    use crate::sstable::reader::Table;
    use std::sync::Arc;

    fn ikey(key: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(key.to_vec(), seq, ValueKind::Value)
    }

    #[test]
    fn builds_readable_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000001.sst");
        let opts = Options::default().block_size(64);

        let mut builder = TableBuilder::create(&path, &opts).unwrap();
        for i in 0..100u64 {
            let key = format!("key{i:04}");
            let value = format!("value{i}");
            builder.add(&ikey(key.as_bytes(), i + 1), value.as_bytes()).unwrap();
        }
        assert_eq!(builder.num_entries(), 100);
        let size = builder.finish().unwrap();
        assert_eq!(size, std::fs::metadata(&path).unwrap().len());

        let table = Arc::new(Table::open(&path, &opts).unwrap());
        for i in (0..100u64).step_by(7) {
            let key = format!("key{i:04}");
            let found = table
                .get(&InternalKey::for_lookup(key.as_bytes(), u64::MAX >> 8))
                .unwrap()
                .expect("key should be present");
            assert_eq!(found.1, format!("value{i}").into_bytes());
        }
    }

    #[test]
    fn rejects_out_of_order_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000001.sst");
        let opts = Options::default();

        let mut builder = TableBuilder::create(&path, &opts).unwrap();
        builder.add(&ikey(b"b", 1), b"1").unwrap();
        assert!(builder.add(&ikey(b"a", 2), b"2").is_err());
    }

    #[test]
    fn tracks_key_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000001.sst");
        let opts = Options::default();

        let mut builder = TableBuilder::create(&path, &opts).unwrap();
        builder.add(&ikey(b"alpha", 3), b"1").unwrap();
        builder.add(&ikey(b"omega", 4), b"2").unwrap();

        assert_eq!(builder.smallest().unwrap().user_key, b"alpha");
        assert_eq!(builder.largest().unwrap().user_key, b"omega");
    }

    #[test]
    fn incompressible_blocks_fall_back_to_raw() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000001.sst");
        let opts = Options::default().compression(Compression::Snappy);

        let mut builder = TableBuilder::create(&path, &opts).unwrap();
        // Random-ish bytes defeat snappy; the table must still read back.
        let mut state = 0x12345678u32;
        let mut value = Vec::new();
        for _ in 0..512 {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            value.push((state >> 24) as u8);
        }
        builder.add(&ikey(b"noise", 1), &value).unwrap();
        builder.finish().unwrap();

        let table = Arc::new(Table::open(&path, &opts).unwrap());
        let found = table
            .get(&InternalKey::for_lookup(b"noise", 100))
            .unwrap()
            .unwrap();
        assert_eq!(found.1, value);
    }
}
