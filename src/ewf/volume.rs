use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use uuid::Uuid;

use super::section::{push_checksummed, split_checksummed, SectionError, SectionHeader, SectionType};

pub const VOLUME_BODY_SIZE: usize = 1052;
pub const VOLUME_SECTION_SIZE: usize = super::SECTION_HEADER_SIZE + VOLUME_BODY_SIZE;

pub const MEDIA_TYPE_FIXED: u8 = 0x01;
/// Image file plus physical device.
pub const MEDIA_FLAGS_PHYSICAL: u32 = 0x03;
pub const BYTES_PER_SECTOR: u32 = 512;

const SIGNATURE_LEN: usize = 5;
const PADDING_LEN: usize = 963;

/// Contents of a `volume`, `disk` or `data` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRecord {
    pub media_type:        u8,
    pub chunk_count:       u32,
    pub sectors_per_chunk: u32,
    pub bytes_per_sector:  u32,
    pub sector_count:      u64,
    pub media_flags:       u32,
    pub compression_level: u32,
    pub error_granularity: u32,
    pub guid:              Uuid,
}

impl VolumeRecord {
    pub fn new(sectors_per_chunk: u32, compression_level: u32, guid: Uuid) -> Self {
        Self {
            media_type:        MEDIA_TYPE_FIXED,
            chunk_count:       0,
            sectors_per_chunk,
            bytes_per_sector:  BYTES_PER_SECTOR,
            sector_count:      0,
            media_flags:       MEDIA_FLAGS_PHYSICAL,
            compression_level,
            error_granularity: 1,
            guid,
        }
    }

    pub fn body_bytes(&self) -> io::Result<Vec<u8>> {
        let mut fields = Vec::with_capacity(VOLUME_BODY_SIZE - 4);
        fields.write_u8(self.media_type)?;
        fields.write_all(&[0u8; 3])?;
        fields.write_u32::<LittleEndian>(self.chunk_count)?;
        fields.write_u32::<LittleEndian>(self.sectors_per_chunk)?;
        fields.write_u32::<LittleEndian>(self.bytes_per_sector)?;
        fields.write_u64::<LittleEndian>(self.sector_count)?;
        // cylinders, heads, sectors
        fields.write_all(&[0u8; 12])?;
        fields.write_u32::<LittleEndian>(self.media_flags)?;
        // palm volume start, reserved, smart logs start
        fields.write_all(&[0u8; 12])?;
        fields.write_u32::<LittleEndian>(self.compression_level)?;
        fields.write_u32::<LittleEndian>(self.error_granularity)?;
        fields.write_all(&[0u8; 4])?;
        fields.write_all(&self.guid.to_bytes_le())?;
        fields.write_all(&[0u8; PADDING_LEN])?;
        fields.write_all(&[0u8; SIGNATURE_LEN])?;

        let mut body = Vec::with_capacity(VOLUME_BODY_SIZE);
        push_checksummed(&mut body, &fields)?;
        Ok(body)
    }

    pub fn parse(body: &[u8]) -> Result<Self, SectionError> {
        if body.len() < VOLUME_BODY_SIZE {
            return Err(SectionError::Malformed {
                what:   "volume record".into(),
                reason: format!("{} bytes, expected {VOLUME_BODY_SIZE}", body.len()),
            });
        }
        let fields = split_checksummed(&body[..VOLUME_BODY_SIZE], "volume record")?;
        let mut r = fields;
        let media_type = r.read_u8()?;
        let mut skip = [0u8; 12];
        r.read_exact(&mut skip[..3])?;
        let chunk_count       = r.read_u32::<LittleEndian>()?;
        let sectors_per_chunk = r.read_u32::<LittleEndian>()?;
        let bytes_per_sector  = r.read_u32::<LittleEndian>()?;
        let sector_count      = r.read_u64::<LittleEndian>()?;
        r.read_exact(&mut skip)?;
        let media_flags = r.read_u32::<LittleEndian>()?;
        r.read_exact(&mut skip)?;
        let compression_level = r.read_u32::<LittleEndian>()?;
        let error_granularity = r.read_u32::<LittleEndian>()?;
        r.read_exact(&mut skip[..4])?;
        let mut guid = [0u8; 16];
        r.read_exact(&mut guid)?;
        Ok(Self {
            media_type,
            chunk_count,
            sectors_per_chunk,
            bytes_per_sector,
            sector_count,
            media_flags,
            compression_level,
            error_granularity,
            guid: Uuid::from_bytes_le(guid),
        })
    }
}

/// A volume-like section at a fixed offset.
#[derive(Debug, Clone)]
pub struct VolumeSection {
    pub header: SectionHeader,
    pub record: VolumeRecord,
}

impl VolumeSection {
    pub fn new(kind: SectionType, offset: u64, record: VolumeRecord) -> Self {
        Self {
            header: SectionHeader::with_body(kind, offset, VOLUME_BODY_SIZE as u64),
            record,
        }
    }

    /// Reserved space for a section whose counts are only known at the end.
    pub fn placeholder() -> [u8; VOLUME_SECTION_SIZE] {
        [0u8; VOLUME_SECTION_SIZE]
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        self.header.write(&mut writer)?;
        writer.write_all(&self.record.body_bytes()?)
    }
}
