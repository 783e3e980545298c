use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::CompressionLevel;
use crate::ewf::segment::{segment_extension, SegmentError};
use crate::pipeline::ImagingError;
use crate::reader::SECTOR_SIZE;

pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;
pub const DEFAULT_SEGMENT_SIZE: u64 = 1_610_612_736;
/// Table entries hold 31-bit offsets.
pub const MAX_SEGMENT_SIZE: u64 = 1 << 31;
pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Free-text case details recorded in the header sections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseMetadata {
    pub description:     String,
    pub case_number:     String,
    pub evidence_number: String,
    pub examiner:        String,
    pub notes:           String,
}

#[derive(Debug, Clone)]
pub struct AcquisitionOptions {
    pub compression:         CompressionLevel,
    pub output_dir:          PathBuf,
    pub base_name:           String,
    pub case:                CaseMetadata,
    pub chunk_size:          usize,
    pub segment_size:        u64,
    pub compression_workers: usize,
    pub queue_depth:         usize,
    pub digest_wait:         Duration,
    pub poll_interval:       Duration,
    pub md5:                 bool,
    pub sha1:                bool,
    pub json_report:         bool,
}

impl Default for AcquisitionOptions {
    fn default() -> Self {
        Self {
            compression:         CompressionLevel::default(),
            output_dir:          PathBuf::from("."),
            base_name:           "image".into(),
            case:                CaseMetadata::default(),
            chunk_size:          DEFAULT_CHUNK_SIZE,
            segment_size:        DEFAULT_SEGMENT_SIZE,
            compression_workers: DEFAULT_WORKERS,
            queue_depth:         DEFAULT_QUEUE_DEPTH,
            digest_wait:         Duration::from_secs(5),
            poll_interval:       Duration::from_millis(250),
            md5:                 true,
            sha1:                true,
            json_report:         false,
        }
    }
}

impl AcquisitionOptions {
    pub fn validate(&self) -> Result<(), ImagingError> {
        let invalid = |msg: String| Err(ImagingError::InvalidOptions(msg));
        if self.chunk_size == 0 || self.chunk_size % SECTOR_SIZE != 0 {
            return invalid(format!("chunk size {} is not a positive multiple of {SECTOR_SIZE}", self.chunk_size));
        }
        if self.chunk_size as u64 > u64::from(u32::MAX) / 2 {
            return invalid(format!("chunk size {} is too large", self.chunk_size));
        }
        if self.segment_size >= MAX_SEGMENT_SIZE {
            return invalid(format!("segment size {} must stay below 2 GiB", self.segment_size));
        }
        // Room for the preamble, headers, one chunk and the closing sections.
        let floor = self.chunk_size as u64 + 16 * 1024;
        if self.segment_size < floor {
            return invalid(format!("segment size {} cannot hold one {}-byte chunk", self.segment_size, self.chunk_size));
        }
        if self.base_name.is_empty() || self.base_name.contains(['/', '\\']) {
            return invalid(format!("base name '{}' must be a plain file name", self.base_name));
        }
        if self.compression_workers == 0 || self.queue_depth == 0 {
            return invalid("worker count and queue depth must be at least 1".into());
        }
        Ok(())
    }

    pub fn sectors_per_chunk(&self) -> u32 {
        (self.chunk_size / SECTOR_SIZE) as u32
    }

    pub fn segment_path(&self, number: u32) -> Result<PathBuf, SegmentError> {
        Ok(self.output_dir.join(format!("{}.{}", self.base_name, segment_extension(number)?)))
    }

    pub fn report_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.json", self.base_name))
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let opts = AcquisitionOptions::default();
        opts.validate().unwrap();
        assert_eq!(opts.sectors_per_chunk(), 1024);
        assert_eq!(opts.compression, CompressionLevel::Fast);
    }

    #[test]
    fn rejects_bad_sizes() {
        let opts = AcquisitionOptions { chunk_size: 1000, ..Default::default() };
        assert!(matches!(opts.validate(), Err(ImagingError::InvalidOptions(_))));
        let opts = AcquisitionOptions { segment_size: MAX_SEGMENT_SIZE, ..Default::default() };
        assert!(opts.validate().is_err());
        let opts = AcquisitionOptions { segment_size: 4096, ..Default::default() };
        assert!(opts.validate().is_err());
        let opts = AcquisitionOptions { base_name: "a/b".into(), ..Default::default() };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn segment_paths() {
        let opts = AcquisitionOptions {
            output_dir: PathBuf::from("/cases/42"),
            base_name:  "disk0".into(),
            ..Default::default()
        };
        assert_eq!(opts.segment_path(1).unwrap(), PathBuf::from("/cases/42/disk0.E01"));
        assert_eq!(opts.segment_path(100).unwrap(), PathBuf::from("/cases/42/disk0.EAA"));
        assert_eq!(opts.report_path(), PathBuf::from("/cases/42/disk0.json"));
    }
}
