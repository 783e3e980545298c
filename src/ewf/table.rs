use std::io::{self, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::section::{push_checksummed, split_checksummed, SectionError, SectionHeader, SectionType};
use super::SECTION_HEADER_SIZE;

pub const MAX_TABLE_ENTRIES: usize = 16375;
pub const COMPRESSED_FLAG: u32 = 0x8000_0000;
pub const MAX_CHUNK_OFFSET: u64 = 0x7FFF_FFFF;

const TABLE_PREFIX_SIZE: usize = 24;

/// Chunk offsets of one `sectors` section. Written twice, as `table` and
/// `table2`, with identical bodies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSection {
    pub base_offset: u64,
    entries:         Vec<u32>,
}

impl TableSection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= MAX_TABLE_ENTRIES
    }

    pub fn entries(&self) -> &[u32] {
        &self.entries
    }

    /// Record a chunk stored at segment offset `offset`.
    pub fn push(&mut self, offset: u64, compressed: bool) -> Result<(), SectionError> {
        if self.is_full() {
            return Err(SectionError::Malformed {
                what:   "table".into(),
                reason: format!("more than {MAX_TABLE_ENTRIES} entries"),
            });
        }
        let relative = offset.checked_sub(self.base_offset).unwrap_or(u64::MAX);
        if relative > MAX_CHUNK_OFFSET {
            return Err(SectionError::Malformed {
                what:   "table".into(),
                reason: format!("chunk offset {offset} does not fit in 31 bits"),
            });
        }
        let flag = if compressed { COMPRESSED_FLAG } else { 0 };
        self.entries.push(relative as u32 | flag);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Size of one table section holding `entries` entries.
    pub fn section_size(entries: usize) -> u64 {
        (SECTION_HEADER_SIZE + TABLE_PREFIX_SIZE + entries * 4 + 4) as u64
    }

    pub fn body_bytes(&self) -> io::Result<Vec<u8>> {
        let mut prefix = Vec::with_capacity(TABLE_PREFIX_SIZE - 4);
        prefix.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        prefix.write_u32::<LittleEndian>(0)?;
        prefix.write_u64::<LittleEndian>(self.base_offset)?;
        prefix.write_u32::<LittleEndian>(0)?;

        let mut entries = Vec::with_capacity(self.entries.len() * 4);
        for &entry in &self.entries {
            entries.write_u32::<LittleEndian>(entry)?;
        }

        let mut body = Vec::with_capacity(TABLE_PREFIX_SIZE + entries.len() + 4);
        push_checksummed(&mut body, &prefix)?;
        push_checksummed(&mut body, &entries)?;
        Ok(body)
    }

    /// Write `table` at `offset` followed by `table2`; returns the offset just
    /// past both.
    pub fn write_pair<W: Write>(&self, mut writer: W, offset: u64) -> io::Result<u64> {
        let body = self.body_bytes()?;
        let mut at = offset;
        for kind in [SectionType::Table, SectionType::Table2] {
            let header = SectionHeader::with_body(kind, at, body.len() as u64);
            header.write(&mut writer)?;
            writer.write_all(&body)?;
            at = header.next_offset;
        }
        Ok(at)
    }

    pub fn parse(body: &[u8]) -> Result<Self, SectionError> {
        if body.len() < TABLE_PREFIX_SIZE {
            return Err(SectionError::Malformed {
                what:   "table".into(),
                reason: format!("{} bytes is shorter than the table prefix", body.len()),
            });
        }
        let mut prefix = split_checksummed(&body[..TABLE_PREFIX_SIZE], "table prefix")?;
        let count = prefix.read_u32::<LittleEndian>()? as usize;
        let _     = prefix.read_u32::<LittleEndian>()?;
        let base_offset = prefix.read_u64::<LittleEndian>()?;

        let end = TABLE_PREFIX_SIZE + count * 4 + 4;
        if count > MAX_TABLE_ENTRIES || body.len() < end {
            return Err(SectionError::Malformed {
                what:   "table".into(),
                reason: format!("{count} entries do not fit in {} bytes", body.len()),
            });
        }
        let mut raw = split_checksummed(&body[TABLE_PREFIX_SIZE..end], "table entries")?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(raw.read_u32::<LittleEndian>()?);
        }
        Ok(Self { base_offset, entries })
    }

    /// Absolute offset and compression flag of entry `index`.
    pub fn entry(&self, index: usize) -> Option<(u64, bool)> {
        self.entries.get(index).map(|&e| {
            (self.base_offset + u64::from(e & !COMPRESSED_FLAG), e & COMPRESSED_FLAG != 0)
        })
    }
}
