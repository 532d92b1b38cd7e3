//! Immutable sorted runs.
//!
//! A run is the on-disk unit the catalog tracks: a sequence of
//! prefix-compressed data blocks, an index block mapping each data block's
//! last key to its location, and a fixed-size footer.
//!
//! ```text
//! +-----------------+
//! | data block 0    |   entries + restart array
//! | data block 1    |   each block is followed on disk by a
//! | ...             |   1-byte compression tag and a CRC32
//! +-----------------+
//! | index block     |   key = last key of block, value = BlockHandle
//! +-----------------+
//! | footer          |   index handle + magic (24 bytes)
//! +-----------------+
//! ```
//!
//! The engine only depends on the narrow contract this module exports:
//! a streaming [`builder::TableBuilder`], point lookups and bidirectional
//! cursors on [`reader::Table`].

pub mod block;
pub mod builder;
pub mod reader;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

pub const TABLE_MAGIC: u64 = 0x656d_6265_7264_6221;

/// Size of the footer: index block handle plus magic.
pub const FOOTER_SIZE: usize = 24;

/// Per-block on-disk trailer: compression tag byte + CRC32.
pub const BLOCK_TRAILER_SIZE: usize = 5;

pub const COMPRESSION_TAG_NONE: u8 = 0;
pub const COMPRESSION_TAG_SNAPPY: u8 = 1;

/// Location of a block within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn encode(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        BigEndian::write_u64(&mut buf[..8], self.offset);
        BigEndian::write_u64(&mut buf[8..], self.size);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 16 {
            return Err(Error::Corruption("block handle too short".to_string()));
        }
        Ok(Self {
            offset: BigEndian::read_u64(&buf[..8]),
            size: BigEndian::read_u64(&buf[8..16]),
        })
    }
}

/// Footer at the end of every run file.
#[derive(Debug, Clone, Copy)]
pub struct Footer {
    pub index_handle: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[..16].copy_from_slice(&self.index_handle.encode());
        BigEndian::write_u64(&mut buf[16..], TABLE_MAGIC);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FOOTER_SIZE {
            return Err(Error::Corruption("footer too short".to_string()));
        }
        let magic = BigEndian::read_u64(&buf[16..24]);
        if magic != TABLE_MAGIC {
            return Err(Error::Corruption(format!(
                "bad table magic {magic:#x}"
            )));
        }
        Ok(Self {
            index_handle: BlockHandle::decode(&buf[..16])?,
        })
    }
}
