use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const EWF_SIGNATURE: &[u8; 8] = b"EVF\x09\x0d\x0a\xff\x00";
pub const PREAMBLE_SIZE: usize = 13;
const FIELDS_START: u8 = 0x01;

/// `.E01` through `.E99`, then `.EAA` through `.EZZ`.
pub const MAX_SEGMENTS: u32 = 99 + 26 * 26;

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("Invalid EWF signature")]
    InvalidSignature,
    #[error("Unexpected segment number: expected {expected}, found {found}")]
    UnexpectedNumber { expected: u32, found: u16 },
    #[error("Segment number {0} is outside .E01..=.EZZ")]
    OutOfRange(u32),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// The 13 bytes every segment file starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPreamble {
    pub segment_number: u16,
}

impl SegmentPreamble {
    pub fn new(segment_number: u32) -> Result<Self, SegmentError> {
        if segment_number == 0 || segment_number > MAX_SEGMENTS {
            return Err(SegmentError::OutOfRange(segment_number));
        }
        Ok(Self { segment_number: segment_number as u16 })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(EWF_SIGNATURE)?;
        writer.write_u8(FIELDS_START)?;
        writer.write_u16::<LittleEndian>(self.segment_number)?;
        writer.write_u16::<LittleEndian>(0)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self, SegmentError> {
        let mut signature = [0u8; 8];
        reader.read_exact(&mut signature)?;
        if &signature != EWF_SIGNATURE {
            return Err(SegmentError::InvalidSignature);
        }
        let _fields_start   = reader.read_u8()?;
        let segment_number  = reader.read_u16::<LittleEndian>()?;
        let _fields_end     = reader.read_u16::<LittleEndian>()?;
        Ok(Self { segment_number })
    }
}

/// File extension (without the dot) for 1-based segment `number`.
pub fn segment_extension(number: u32) -> Result<String, SegmentError> {
    match number {
        1..=99 => Ok(format!("E{number:02}")),
        n if n <= MAX_SEGMENTS => {
            let m = n - 100;
            let first  = (b'A' + (m / 26) as u8) as char;
            let second = (b'A' + (m % 26) as u8) as char;
            Ok(format!("E{first}{second}"))
        }
        n => Err(SegmentError::OutOfRange(n)),
    }
}

/// `<base>.<ext>` for segment `number`. Any extension already on `base` is
/// replaced.
pub fn segment_path(base: &Path, number: u32) -> Result<PathBuf, SegmentError> {
    Ok(base.with_extension(segment_extension(number)?))
}

/// Recover the segment number from an `.Exx` extension.
pub fn segment_number_of(path: &Path) -> Option<u32> {
    let ext = path.extension()?.to_str()?.as_bytes();
    if ext.len() != 3 || !ext[0].eq_ignore_ascii_case(&b'E') {
        return None;
    }
    let (a, b) = (ext[1], ext[2]);
    if a.is_ascii_digit() && b.is_ascii_digit() {
        let n = u32::from(a - b'0') * 10 + u32::from(b - b'0');
        return (n >= 1).then_some(n);
    }
    let (a, b) = (a.to_ascii_uppercase(), b.to_ascii_uppercase());
    if a.is_ascii_uppercase() && b.is_ascii_uppercase() {
        return Some(100 + u32::from(a - b'A') * 26 + u32::from(b - b'A'));
    }
    None
}
