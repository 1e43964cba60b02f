// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Page 0 of the store: format identity, block-allocator state, log
//! shard heads and the last durable log generation.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::registry::MAX_THREADS;
use crate::store::{PageIo, PageStore, PageType};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

const MAGIC_BYTES: [u8; 4] = *b"TKDB";
const FORMAT_VERSION: u8 = 1;

/// Decoded super page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperPage {
    pub page_size: u32,
    pub pages_per_extent: u32,
    pub disk_size: u64,

    /// Block allocator watermark
    pub watermark: u64,

    /// Block allocator free list (extent indices)
    pub free_list: Vec<u64>,

    /// Log shard heads (0 = unused shard)
    pub log_heads: Vec<u64>,

    /// Last log generation handed out before the write
    pub generation: u64,
}

impl SuperPage {
    /// Writes the super page to page 0 of the store.
    pub fn write(&self, store: &PageStore) -> crate::Result<()> {
        let mut buf = self.encode_into_vec();

        let page_size = self.page_size as usize;
        if buf.len() > page_size {
            // Too many free extents to record; drop the tail (those
            // extents leak until the next full rewrite).
            log::warn!("super page overflow; truncating free list");

            let truncated = Self {
                free_list: Vec::new(),
                ..self.clone()
            };
            buf = truncated.encode_into_vec();
        }

        buf.resize(page_size, 0);
        store.write_page(0, &buf)?;
        store.sync()
    }

    /// Reads and validates the super page.
    pub fn read(store: &PageStore, page_size: u32) -> crate::Result<Self> {
        let mut buf = vec![0; page_size as usize];
        store.read_page(0, &mut buf)?;

        let decoded = Self::decode_from(&mut &buf[..])?;

        if decoded.page_size != page_size {
            return Err(crate::Error::BadParam("page size mismatch"));
        }

        Ok(decoded)
    }
}

impl Encode for SuperPage {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(u8::from(PageType::Super))?;
        writer.write_all(&MAGIC_BYTES)?;
        writer.write_u8(FORMAT_VERSION)?;

        writer.write_u32::<LittleEndian>(self.page_size)?;
        writer.write_u32::<LittleEndian>(self.pages_per_extent)?;
        writer.write_u64::<LittleEndian>(self.disk_size)?;
        writer.write_u64::<LittleEndian>(self.generation)?;
        writer.write_u64::<LittleEndian>(self.watermark)?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<LittleEndian>(self.free_list.len() as u32)?;
        for idx in &self.free_list {
            writer.write_u64::<LittleEndian>(*idx)?;
        }

        debug_assert!(self.log_heads.len() <= MAX_THREADS);

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<LittleEndian>(self.log_heads.len() as u32)?;
        for head in &self.log_heads {
            writer.write_u64::<LittleEndian>(*head)?;
        }

        Ok(())
    }
}

impl Decode for SuperPage {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let page_type = reader.read_u8()?;
        if page_type != u8::from(PageType::Super) {
            return Err(DecodeError::InvalidHeader("SuperPage"));
        }

        let mut magic = [0u8; MAGIC_BYTES.len()];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC_BYTES {
            return Err(DecodeError::InvalidHeader("SuperPage"));
        }

        let version = reader.read_u8()?;
        if version != FORMAT_VERSION {
            return Err(DecodeError::InvalidTag(("FormatVersion", version)));
        }

        let page_size = reader.read_u32::<LittleEndian>()?;
        let pages_per_extent = reader.read_u32::<LittleEndian>()?;
        let disk_size = reader.read_u64::<LittleEndian>()?;
        let generation = reader.read_u64::<LittleEndian>()?;
        let watermark = reader.read_u64::<LittleEndian>()?;

        let free_len = reader.read_u32::<LittleEndian>()? as usize;
        let mut free_list = Vec::with_capacity(free_len.min(4_096));
        for _ in 0..free_len {
            free_list.push(reader.read_u64::<LittleEndian>()?);
        }

        let heads_len = reader.read_u32::<LittleEndian>()? as usize;
        let mut log_heads = Vec::with_capacity(heads_len.min(MAX_THREADS));
        for _ in 0..heads_len {
            log_heads.push(reader.read_u64::<LittleEndian>()?);
        }

        Ok(Self {
            page_size,
            pages_per_extent,
            disk_size,
            watermark,
            free_list,
            log_heads,
            generation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DramStore;
    use test_log::test;

    #[test]
    fn super_page_round_trip() -> crate::Result<()> {
        let store = PageStore::Dram(DramStore::new(64 * 4_096));

        let page = SuperPage {
            page_size: 4_096,
            pages_per_extent: 32,
            disk_size: 64 * 4_096,
            watermark: 7,
            free_list: vec![3, 5],
            log_heads: vec![0, 131_072, 0],
            generation: 42,
        };

        page.write(&store)?;
        let decoded = SuperPage::read(&store, 4_096)?;
        assert_eq!(page, decoded);

        Ok(())
    }

    #[test]
    fn rejects_garbage() {
        let store = PageStore::Dram(DramStore::new(64 * 4_096));
        assert!(SuperPage::read(&store, 4_096).is_err());
    }
}
