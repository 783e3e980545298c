//! Section descriptor framing shared by every EWF section.
//!
//! Every section starts with a fixed 76-byte descriptor:
//!
//! | Offset | Size | Field                                        |
//! |--------|------|----------------------------------------------|
//! | 0      | 16   | type tag, ASCII, zero padded                 |
//! | 16     | 8    | absolute offset of the next section (LE)     |
//! | 24     | 8    | section size including this descriptor (LE)  |
//! | 32     | 40   | reserved, zero                               |
//! | 72     | 4    | Adler-32 over bytes 0..72 (LE)               |
//!
//! Terminal sections (`next`, `done`) point at themselves.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use super::adler32;

pub const SECTION_HEADER_SIZE: usize = 76;
pub const MAX_TAG_LEN: usize = 16;
const RESERVED_LEN: usize = 40;

#[derive(Error, Debug)]
pub enum SectionError {
    #[error("Section type tag '{0}' exceeds {MAX_TAG_LEN} bytes")]
    TagTooLong(String),
    #[error("Section type tag is not ASCII: {0:?}")]
    InvalidTag(String),
    #[error("Checksum mismatch in {what} (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { what: String, stored: u32, computed: u32 },
    #[error("Malformed {what}: {reason}")]
    Malformed { what: String, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// The section types this crate writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionType {
    Header,
    Header2,
    Volume,
    Disk,
    Data,
    Sectors,
    Table,
    Table2,
    Digest,
    Hash,
    Error2,
    Next,
    Done,
}

impl SectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            SectionType::Header  => "header",
            SectionType::Header2 => "header2",
            SectionType::Volume  => "volume",
            SectionType::Disk    => "disk",
            SectionType::Data    => "data",
            SectionType::Sectors => "sectors",
            SectionType::Table   => "table",
            SectionType::Table2  => "table2",
            SectionType::Digest  => "digest",
            SectionType::Hash    => "hash",
            SectionType::Error2  => "error2",
            SectionType::Next    => "next",
            SectionType::Done    => "done",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "header"  => SectionType::Header,
            "header2" => SectionType::Header2,
            "volume"  => SectionType::Volume,
            "disk"    => SectionType::Disk,
            "data"    => SectionType::Data,
            "sectors" => SectionType::Sectors,
            "table"   => SectionType::Table,
            "table2"  => SectionType::Table2,
            "digest"  => SectionType::Digest,
            "hash"    => SectionType::Hash,
            "error2"  => SectionType::Error2,
            "next"    => SectionType::Next,
            "done"    => SectionType::Done,
            _         => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SectionType::Next | SectionType::Done)
    }
}

/// In-memory form of a section descriptor plus the offset it lives at.
///
/// `offset` is not stored on disk; it is where the descriptor is (or will be)
/// written and is needed to derive `next_offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader {
    tag:             [u8; MAX_TAG_LEN],
    pub offset:      u64,
    pub next_offset: u64,
    pub size:        u64,
}

impl SectionHeader {
    /// Descriptor with an arbitrary tag and no body yet.
    pub fn new(tag: &str, offset: u64) -> Result<Self, SectionError> {
        if tag.len() > MAX_TAG_LEN {
            return Err(SectionError::TagTooLong(tag.to_owned()));
        }
        if !tag.is_ascii() {
            return Err(SectionError::InvalidTag(tag.to_owned()));
        }
        let mut bytes = [0u8; MAX_TAG_LEN];
        bytes[..tag.len()].copy_from_slice(tag.as_bytes());
        Ok(Self {
            tag:         bytes,
            offset,
            next_offset: offset + SECTION_HEADER_SIZE as u64,
            size:        SECTION_HEADER_SIZE as u64,
        })
    }

    /// Descriptor for one of the known section types.
    pub fn of(kind: SectionType, offset: u64) -> Self {
        let tag = kind.as_str().as_bytes();
        let mut bytes = [0u8; MAX_TAG_LEN];
        bytes[..tag.len()].copy_from_slice(tag);
        let next_offset = if kind.is_terminal() {
            offset
        } else {
            offset + SECTION_HEADER_SIZE as u64
        };
        Self { tag: bytes, offset, next_offset, size: SECTION_HEADER_SIZE as u64 }
    }

    /// Descriptor for a section whose body length is already known.
    pub fn with_body(kind: SectionType, offset: u64, body_len: u64) -> Self {
        let mut header = Self::of(kind, offset);
        header.grow(body_len);
        header
    }

    pub fn tag(&self) -> &str {
        let end = self.tag.iter().position(|&b| b == 0).unwrap_or(MAX_TAG_LEN);
        std::str::from_utf8(&self.tag[..end]).unwrap_or("")
    }

    pub fn section_type(&self) -> Option<SectionType> {
        SectionType::from_tag(self.tag())
    }

    /// Extend the body by `len` bytes.
    pub fn grow(&mut self, len: u64) {
        self.size        += len;
        self.next_offset += len;
    }

    pub fn body_len(&self) -> u64 {
        self.size.saturating_sub(SECTION_HEADER_SIZE as u64)
    }

    fn checked_bytes(&self) -> [u8; SECTION_HEADER_SIZE - 4] {
        let mut buf = [0u8; SECTION_HEADER_SIZE - 4];
        buf[..16].copy_from_slice(&self.tag);
        buf[16..24].copy_from_slice(&self.next_offset.to_le_bytes());
        buf[24..32].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    pub fn checksum(&self) -> u32 {
        adler32(&self.checked_bytes())
    }

    pub fn to_bytes(&self) -> [u8; SECTION_HEADER_SIZE] {
        let mut out = [0u8; SECTION_HEADER_SIZE];
        out[..SECTION_HEADER_SIZE - 4].copy_from_slice(&self.checked_bytes());
        out[SECTION_HEADER_SIZE - 4..].copy_from_slice(&self.checksum().to_le_bytes());
        out
    }

    /// Tag only; the rest is filled in once the section is closed.
    pub fn placeholder_bytes(&self) -> [u8; SECTION_HEADER_SIZE] {
        let mut out = [0u8; SECTION_HEADER_SIZE];
        out[..MAX_TAG_LEN].copy_from_slice(&self.tag);
        out
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.to_bytes())
    }

    /// Parse a descriptor located at `offset`, validating its checksum.
    pub fn read<R: Read>(mut reader: R, offset: u64) -> Result<Self, SectionError> {
        let mut tag = [0u8; MAX_TAG_LEN];
        reader.read_exact(&mut tag)?;
        let next_offset = reader.read_u64::<LittleEndian>()?;
        let size        = reader.read_u64::<LittleEndian>()?;
        let mut reserved = [0u8; RESERVED_LEN];
        reader.read_exact(&mut reserved)?;
        let stored = reader.read_u32::<LittleEndian>()?;

        let header = Self { tag, offset, next_offset, size };
        let computed = header.checksum();
        if stored != computed {
            return Err(SectionError::ChecksumMismatch {
                what: format!("'{}' section descriptor at {offset}", header.tag()),
                stored,
                computed,
            });
        }
        Ok(header)
    }
}

/// Write `bytes` followed by their Adler-32, the way section bodies end.
pub(crate) fn push_checksummed<W: Write>(mut out: W, bytes: &[u8]) -> io::Result<()> {
    out.write_all(bytes)?;
    out.write_u32::<LittleEndian>(adler32(bytes))
}

/// Split `bytes` into payload and trailing checksum, verifying it.
pub(crate) fn split_checksummed<'a>(bytes: &'a [u8], what: &str) -> Result<&'a [u8], SectionError> {
    if bytes.len() < 4 {
        return Err(SectionError::Malformed {
            what:   what.to_owned(),
            reason: format!("{} bytes is too short for a checksum", bytes.len()),
        });
    }
    let (payload, tail) = bytes.split_at(bytes.len() - 4);
    let stored   = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let computed = adler32(payload);
    if stored != computed {
        return Err(SectionError::ChecksumMismatch { what: what.to_owned(), stored, computed });
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn rejects_long_tags() {
        assert!(matches!(
            SectionHeader::new("a_tag_that_is_far_too_long", 0),
            Err(SectionError::TagTooLong(_))
        ));
        assert!(SectionHeader::new("sixteen_chars_ok", 0).is_ok());
    }

    #[test]
    fn descriptor_layout_and_checksum() {
        let mut h = SectionHeader::of(SectionType::Sectors, 1000);
        h.grow(24);
        let bytes = h.to_bytes();
        assert_eq!(&bytes[..7], b"sectors");
        assert!(bytes[7..16].iter().all(|&b| b == 0));
        assert_eq!(u64::from_le_bytes(bytes[16..24].try_into().unwrap()), 1100);
        assert_eq!(u64::from_le_bytes(bytes[24..32].try_into().unwrap()), 100);
        assert!(bytes[32..72].iter().all(|&b| b == 0));
        assert_eq!(
            u32::from_le_bytes(bytes[72..76].try_into().unwrap()),
            adler32(&bytes[..72])
        );
        let parsed = SectionHeader::read(Cursor::new(&bytes[..]), 1000).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(parsed.section_type(), Some(SectionType::Sectors));
    }

    #[test]
    fn terminal_sections_point_at_themselves() {
        let done = SectionHeader::of(SectionType::Done, 4242);
        assert_eq!(done.next_offset, 4242);
        assert_eq!(done.size, SECTION_HEADER_SIZE as u64);
        let next = SectionHeader::of(SectionType::Next, 10);
        assert_eq!(next.next_offset, 10);
    }

    #[test]
    fn corrupt_descriptor_is_detected() {
        let mut bytes = SectionHeader::of(SectionType::Table, 0).to_bytes();
        bytes[20] ^= 0xFF;
        assert!(matches!(
            SectionHeader::read(Cursor::new(&bytes[..]), 0),
            Err(SectionError::ChecksumMismatch { .. })
        ));
    }
}
