//! On-disk model of the Expert Witness Format (E01) segment files.
//!
//! A segment is a 13-byte preamble followed by a chain of sections, each
//! starting with a [`SectionHeader`]. All integers are little-endian and
//! every fixed structure is protected by an Adler-32 checksum.

pub mod digest;
pub mod error2;
pub mod header;
pub mod section;
pub mod segment;
pub mod table;
pub mod volume;

pub use digest::{DigestSection, HashSection};
pub use error2::{Error2Section, SectorRun};
pub use header::{HeaderInfo, HeaderSection};
pub use section::{SectionError, SectionHeader, SectionType, SECTION_HEADER_SIZE};
pub use segment::{segment_extension, segment_number_of, segment_path, SegmentError, SegmentPreamble, PREAMBLE_SIZE};
pub use table::{TableSection, MAX_TABLE_ENTRIES};
pub use volume::{VolumeRecord, VolumeSection, VOLUME_SECTION_SIZE};

/// Adler-32 as used for every checksum in the format.
pub fn adler32(data: &[u8]) -> u32 {
    adler2::adler32_slice(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adler32_reference_values() {
        assert_eq!(adler32(b""), 1);
        assert_eq!(adler32(b"Wikipedia"), 0x11E6_0398);
    }
}
