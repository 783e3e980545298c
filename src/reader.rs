//! Sequential device reader that survives unreadable sectors.
//!
//! Reads 256 sectors at a time. When a read fails the reader drops to
//! single-sector reads until one full read past the failure point, so only
//! the sectors that really fail are lost. Each lost sector is recorded and
//! replaced with zeros; the byte stream never has gaps or repeats.

use std::fs::File;
use std::io::{self, ErrorKind, Read, Seek, SeekFrom};
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, warn};

use crate::device::Device;

pub const SECTOR_SIZE: usize = 512;
pub const SECTORS_PER_READ: usize = 256;
pub const FULL_READ_SIZE: usize = SECTOR_SIZE * SECTORS_PER_READ;
const MAX_SECTOR_WARNINGS: usize = 100;

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("Cannot open device {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("Device IO error at byte {offset}: {source}")]
    Io { offset: u64, source: io::Error },
}

/// A buffer read from the device and the device offset it starts at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    pub offset: u64,
    pub data:   Vec<u8>,
}

/// Why a sector could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorFault {
    NotFound,
    DataError,
    Unknown,
}

impl SectorFault {
    pub fn classify(err: &io::Error) -> Self {
        match err.raw_os_error() {
            #[cfg(windows)]
            Some(27) => SectorFault::NotFound,
            #[cfg(windows)]
            Some(23) => SectorFault::DataError,
            #[cfg(unix)]
            Some(6) => SectorFault::NotFound,
            #[cfg(unix)]
            Some(5) => SectorFault::DataError,
            _ => SectorFault::Unknown,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            SectorFault::NotFound  => "sector not found",
            SectorFault::DataError => "data error",
            SectorFault::Unknown   => "unknown read error",
        }
    }
}

pub struct ResilientReader<D> {
    device:         D,
    position:       u64,
    limit:          u64,
    read_size:      usize,
    resume_full_at: u64,
    needs_seek:     bool,
    bad_sectors:    Vec<u64>,
}

impl ResilientReader<File> {
    /// Open the device read-only.
    pub fn open(device: &dyn Device) -> Result<Self, ReaderError> {
        let path = device.path().to_path_buf();
        let file = File::open(&path).map_err(|source| ReaderError::Open { path, source })?;
        Ok(Self::new(file, device.size()))
    }
}

impl<D: Read + Seek> ResilientReader<D> {
    /// Reader over `device`, which holds `size` bytes starting at offset 0.
    pub fn new(device: D, size: u64) -> Self {
        let limit = size.div_ceil(SECTOR_SIZE as u64) * SECTOR_SIZE as u64;
        Self {
            device,
            position: 0,
            limit,
            read_size: FULL_READ_SIZE,
            resume_full_at: 0,
            needs_seek: false,
            bad_sectors: Vec::new(),
        }
    }

    /// Total bytes this reader will emit.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn bytes_read(&self) -> u64 {
        self.position
    }

    pub fn read_size(&self) -> usize {
        self.read_size
    }

    pub fn bad_sectors(&self) -> &[u64] {
        &self.bad_sectors
    }

    pub fn take_bad_sectors(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.bad_sectors)
    }

    /// Next buffer, or `None` once every sector has been emitted.
    pub fn read_chunk(&mut self) -> Result<Option<RawChunk>, ReaderError> {
        loop {
            if self.read_size < FULL_READ_SIZE && self.position >= self.resume_full_at {
                debug!(offset = self.position, "returning to full read size");
                self.read_size = FULL_READ_SIZE;
            }
            if self.position >= self.limit {
                return Ok(None);
            }

            let want = (self.limit - self.position).min(self.read_size as u64) as usize;
            if self.needs_seek {
                self.device
                    .seek(SeekFrom::Start(self.position))
                    .map_err(|source| ReaderError::Io { offset: self.position, source })?;
                self.needs_seek = false;
            }

            let mut buf = vec![0u8; want];
            let (filled, fault) = fill(&mut self.device, &mut buf);

            let Some(err) = fault else {
                if filled < want {
                    debug!(
                        offset = self.position + filled as u64,
                        missing = want - filled,
                        "device ended before its declared size, zero-filling"
                    );
                    self.needs_seek = true;
                }
                return Ok(Some(self.emit(buf)));
            };

            // Hand back whatever whole sectors arrived before the fault; the
            // failing sector is retried on the next call.
            let whole = filled - filled % SECTOR_SIZE;
            if whole > 0 {
                buf.truncate(whole);
                self.needs_seek = true;
                return Ok(Some(self.emit(buf)));
            }

            self.needs_seek = true;
            if self.read_size > SECTOR_SIZE {
                self.resume_full_at = self.position + FULL_READ_SIZE as u64;
                self.read_size      = SECTOR_SIZE;
                debug!(offset = self.position, error = %err, "read failed, stepping down to single sectors");
                continue;
            }

            let sector = self.position / SECTOR_SIZE as u64;
            let fault  = SectorFault::classify(&err);
            self.record_bad_sector(sector, fault, &err);
            return Ok(Some(self.emit(vec![0u8; SECTOR_SIZE])));
        }
    }

    fn emit(&mut self, data: Vec<u8>) -> RawChunk {
        let chunk = RawChunk { offset: self.position, data };
        self.position += chunk.data.len() as u64;
        chunk
    }

    fn record_bad_sector(&mut self, sector: u64, fault: SectorFault, err: &io::Error) {
        self.bad_sectors.push(sector);
        let seen = self.bad_sectors.len();
        if seen <= MAX_SECTOR_WARNINGS {
            warn!(sector, error = %err, "bad sector ({}), zero-filled", fault.describe());
        }
        if seen == MAX_SECTOR_WARNINGS {
            warn!("further bad sector warnings suppressed");
        }
    }
}

/// Read until `buf` is full, the source ends, or an error occurs.
fn fill<R: Read>(source: &mut R, buf: &mut [u8]) -> (usize, Option<io::Error>) {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return (filled, Some(e)),
        }
    }
    (filled, None)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::io::Cursor;

    /// In-memory device whose listed sectors fail to read.
    pub struct FaultyDevice {
        inner: Cursor<Vec<u8>>,
        bad:   BTreeSet<u64>,
    }

    impl FaultyDevice {
        pub fn new(data: Vec<u8>, bad: impl IntoIterator<Item = u64>) -> Self {
            Self { inner: Cursor::new(data), bad: bad.into_iter().collect() }
        }
    }

    impl Read for FaultyDevice {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let pos = self.inner.position();
            let first = pos / SECTOR_SIZE as u64;
            let last  = (pos + buf.len().max(1) as u64 - 1) / SECTOR_SIZE as u64;
            if let Some(&bad) = self.bad.range(first..=last).next() {
                let good = (bad * SECTOR_SIZE as u64).saturating_sub(pos) as usize;
                if good == 0 {
                    return Err(io::Error::from_raw_os_error(5));
                }
                return self.inner.read(&mut buf[..good]);
            }
            self.inner.read(buf)
        }
    }

    impl Seek for FaultyDevice {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i / SECTOR_SIZE) as u8 ^ (i as u8)).collect()
    }

    fn drain<D: Read + Seek>(reader: &mut ResilientReader<D>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = reader.read_chunk().unwrap() {
            assert_eq!(chunk.offset, out.len() as u64);
            out.extend_from_slice(&chunk.data);
        }
        out
    }

    #[test]
    fn clean_device_reads_verbatim() {
        let data = pattern(FULL_READ_SIZE * 3 + 4096);
        let mut reader = ResilientReader::new(Cursor::new(data.clone()), data.len() as u64);
        assert_eq!(drain(&mut reader), data);
        assert!(reader.bad_sectors().is_empty());
    }

    #[test]
    fn bad_run_is_zero_filled_and_recorded_once() {
        let data = pattern(1024 * 1024);
        let dev = FaultyDevice::new(data.clone(), [100, 101, 102]);
        let mut reader = ResilientReader::new(dev, data.len() as u64);
        let out = drain(&mut reader);

        let mut expected = data;
        expected[100 * SECTOR_SIZE..103 * SECTOR_SIZE].fill(0);
        assert_eq!(out.len(), expected.len());
        assert!(out == expected);
        assert_eq!(reader.bad_sectors(), &[100, 101, 102]);
    }

    #[test]
    fn returns_to_full_reads_after_the_bad_area() {
        let data = pattern(FULL_READ_SIZE * 4);
        let dev = FaultyDevice::new(data.clone(), [3]);
        let mut reader = ResilientReader::new(dev, data.len() as u64);
        let first = reader.read_chunk().unwrap().unwrap();
        // sectors 0..3 come back before the fault
        assert_eq!(first.data.len(), 3 * SECTOR_SIZE);
        let bad = reader.read_chunk().unwrap().unwrap();
        assert_eq!(bad.data, vec![0u8; SECTOR_SIZE]);
        assert_eq!(reader.read_size(), SECTOR_SIZE);
        let rest = drain(&mut reader);
        assert_eq!(3 * SECTOR_SIZE + SECTOR_SIZE + rest.len(), data.len());
        assert_eq!(reader.read_size(), FULL_READ_SIZE);
        assert_eq!(reader.bad_sectors(), &[3]);
    }

    #[test]
    fn short_final_sector_is_padded() {
        let data = pattern(5000);
        let mut reader = ResilientReader::new(Cursor::new(data.clone()), 5000);
        let out = drain(&mut reader);
        assert_eq!(out.len(), 5120);
        assert_eq!(&out[..5000], &data[..]);
        assert!(out[5000..].iter().all(|&b| b == 0));
    }

    #[test]
    fn never_reads_past_declared_size() {
        let data = pattern(8192);
        let mut reader = ResilientReader::new(Cursor::new(data), 2048);
        assert_eq!(drain(&mut reader).len(), 2048);
        assert!(reader.read_chunk().unwrap().is_none());
    }

    #[test]
    fn device_shorter_than_declared_is_zero_filled() {
        let data = pattern(4096);
        let mut reader = ResilientReader::new(Cursor::new(data), 10_000);
        let out = drain(&mut reader);
        assert_eq!(out.len(), 10_240);
        assert!(out[4096..].iter().all(|&b| b == 0));
    }

    #[test]
    fn every_sector_bad() {
        let data = vec![0xEEu8; 8 * SECTOR_SIZE];
        let dev = FaultyDevice::new(data, 0..8);
        let mut reader = ResilientReader::new(dev, 8 * SECTOR_SIZE as u64);
        let out = drain(&mut reader);
        assert_eq!(out, vec![0u8; 8 * SECTOR_SIZE]);
        assert_eq!(reader.take_bad_sectors(), (0..8).collect::<Vec<_>>());
        assert!(reader.bad_sectors().is_empty());
    }
}
