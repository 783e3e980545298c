//! Walks an existing image and checks it end to end.
//!
//! Every segment is opened in suffix order and its section chain followed
//! from the preamble. All descriptor and body checksums are validated,
//! `table2` must mirror `table`, and every chunk is decoded in table order.
//! The rebuilt media stream is hashed and compared with the stored digests.
//!
//! Structural damage (bad checksums, broken chains, undecodable chunks) is
//! an error. Count or digest mismatches are reported through
//! [`VerifyReport::problems`].

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::{decompress_chunk, zlib_decompress, CodecError};
use crate::digest::DigestAlgorithm;
use crate::ewf::{
    segment_number_of, segment_path, DigestSection, Error2Section, HashSection, SectionError, SectionHeader,
    SectionType, SectorRun, SegmentError, SegmentPreamble, TableSection, VolumeRecord, PREAMBLE_SIZE,
    SECTION_HEADER_SIZE,
};
use crate::reader::SECTOR_SIZE;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("{path}: {source}")]
    Segment { path: PathBuf, source: SegmentError },
    #[error("{path}: {source}")]
    Section { path: PathBuf, source: SectionError },
    #[error("Chunk {index}: {source}")]
    Chunk { index: u64, source: CodecError },
    #[error("Missing segment {0}")]
    MissingSegment(PathBuf),
    #[error("{path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One section as found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionRecord {
    pub segment: u32,
    pub offset:  u64,
    pub tag:     String,
    pub size:    u64,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub segments:      Vec<PathBuf>,
    pub sections:      Vec<SectionRecord>,
    pub volume:        Option<VolumeRecord>,
    pub chunk_count:   u64,
    pub bytes:         u64,
    pub error_runs:    Vec<SectorRun>,
    pub stored_md5:    Option<[u8; 16]>,
    pub stored_sha1:   Option<[u8; 20]>,
    pub hash_md5:      Option<[u8; 16]>,
    pub computed_md5:  Vec<u8>,
    pub computed_sha1: Vec<u8>,
    /// A `done` section terminated the chain.
    pub complete:      bool,
}

impl VerifyReport {
    pub fn sector_count(&self) -> u64 {
        self.bytes / SECTOR_SIZE as u64
    }

    pub fn bad_sector_total(&self) -> u64 {
        self.error_runs.iter().map(|r| u64::from(r.count)).sum()
    }

    /// Everything that disagrees with what the image claims about itself.
    pub fn problems(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.complete {
            out.push("image has no done section".into());
        }
        match &self.volume {
            None => out.push("no volume section found".into()),
            Some(volume) => {
                if u64::from(volume.chunk_count) != self.chunk_count {
                    out.push(format!("volume records {} chunks, found {}", volume.chunk_count, self.chunk_count));
                }
                if volume.sector_count != self.sector_count() {
                    out.push(format!("volume records {} sectors, found {}", volume.sector_count, self.sector_count()));
                }
            }
        }
        if let Some(md5) = self.stored_md5.filter(|d| d.iter().any(|&b| b != 0)) {
            if md5[..] != self.computed_md5[..] {
                out.push(format!("MD5 mismatch: stored {}, computed {}", hex::encode(md5), hex::encode(&self.computed_md5)));
            }
        }
        if let Some(md5) = self.hash_md5 {
            if md5[..] != self.computed_md5[..] {
                out.push(format!("hash section MD5 {} does not match {}", hex::encode(md5), hex::encode(&self.computed_md5)));
            }
        }
        if let Some(sha1) = self.stored_sha1.filter(|d| d.iter().any(|&b| b != 0)) {
            if sha1[..] != self.computed_sha1[..] {
                out.push(format!("SHA1 mismatch: stored {}, computed {}", hex::encode(sha1), hex::encode(&self.computed_sha1)));
            }
        }
        out
    }

    pub fn is_consistent(&self) -> bool {
        self.problems().is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} segment(s), {} chunks, {} sectors ({:.2} MiB), {} bad sector(s), {}",
            self.segments.len(),
            self.chunk_count,
            self.sector_count(),
            self.bytes as f64 / 1024.0 / 1024.0,
            self.bad_sector_total(),
            if self.is_consistent() { "consistent" } else { "INCONSISTENT" },
        )
    }
}

/// Verify the image whose first segment is `first`.
pub fn verify_image(first: &Path) -> Result<VerifyReport, VerifyError> {
    let mut md5  = DigestAlgorithm::Md5.hasher();
    let mut sha1 = DigestAlgorithm::Sha1.hasher();
    let mut report = read_image(first, |data| {
        md5.update(data);
        sha1.update(data);
    })?;
    report.computed_md5  = md5.finalize();
    report.computed_sha1 = sha1.finalize();
    Ok(report)
}

/// Walk the image and hand every decoded chunk to `sink` in media order.
/// The computed digest fields of the returned report are left empty.
pub fn read_image(first: &Path, mut sink: impl FnMut(&[u8])) -> Result<VerifyReport, VerifyError> {
    if segment_number_of(first) != Some(1) {
        return Err(VerifyError::Corrupt {
            path:   first.to_path_buf(),
            reason: "expected the first segment (.E01)".into(),
        });
    }
    let mut walker = Walker { report: VerifyReport::default(), sink: &mut sink };
    let mut number = 1u32;
    loop {
        let path = segment_path(first, number)
            .map_err(|source| VerifyError::Segment { path: first.to_path_buf(), source })?;
        if !path.exists() {
            return Err(VerifyError::MissingSegment(path));
        }
        let finished = walker.segment(&path, number)?;
        walker.report.segments.push(path);
        if finished {
            break;
        }
        number += 1;
    }
    Ok(walker.report)
}

struct Walker<'a, F: FnMut(&[u8])> {
    report: VerifyReport,
    sink:   &'a mut F,
}

struct SegmentState {
    path:       PathBuf,
    len:        u64,
    sectors:    Option<(u64, u64)>,
    last_table: Option<Vec<u8>>,
}

impl<F: FnMut(&[u8])> Walker<'_, F> {
    /// Returns true once a `done` section has been reached.
    fn segment(&mut self, path: &Path, number: u32) -> Result<bool, VerifyError> {
        let file = File::open(path)?;
        let len  = file.metadata()?.len();
        let mut file = BufReader::new(file);
        let preamble = SegmentPreamble::read(&mut file)
            .map_err(|source| VerifyError::Segment { path: path.to_path_buf(), source })?;
        if u32::from(preamble.segment_number) != number {
            return Err(VerifyError::Segment {
                path:   path.to_path_buf(),
                source: SegmentError::UnexpectedNumber { expected: number, found: preamble.segment_number },
            });
        }

        let mut state = SegmentState { path: path.to_path_buf(), len, sectors: None, last_table: None };
        let mut pos = PREAMBLE_SIZE as u64;
        loop {
            if pos + SECTION_HEADER_SIZE as u64 > len {
                return Err(corrupt(&state, format!("section chain runs past the end at {pos}")));
            }
            file.seek(SeekFrom::Start(pos))?;
            let header = SectionHeader::read(&mut file, pos).map_err(|e| section_err(&state, e))?;
            if pos + header.size > len || header.size < SECTION_HEADER_SIZE as u64 {
                return Err(corrupt(&state, format!("'{}' section at {pos} has impossible size {}", header.tag(), header.size)));
            }
            self.report.sections.push(SectionRecord {
                segment: number,
                offset:  pos,
                tag:     header.tag().to_owned(),
                size:    header.size,
            });

            match header.section_type() {
                Some(SectionType::Next) => return Ok(false),
                Some(SectionType::Done) => {
                    self.report.complete = true;
                    return Ok(true);
                }
                Some(kind) => self.section(&mut file, &mut state, kind, &header)?,
                None => warn!(tag = header.tag(), offset = pos, "skipping unknown section"),
            }

            if header.next_offset <= pos {
                return Err(corrupt(&state, format!("'{}' section at {pos} does not advance the chain", header.tag())));
            }
            pos = header.next_offset;
        }
    }

    fn section<R: Read + Seek>(
        &mut self,
        file:   &mut R,
        state:  &mut SegmentState,
        kind:   SectionType,
        header: &SectionHeader,
    ) -> Result<(), VerifyError> {
        let body_at = header.offset + SECTION_HEADER_SIZE as u64;
        match kind {
            SectionType::Sectors => {
                state.sectors = Some((body_at, header.offset + header.size));
                Ok(())
            }
            SectionType::Header | SectionType::Header2 => {
                let body = read_body(file, header)?;
                zlib_decompress(&body)
                    .map_err(|e| corrupt(state, format!("{} text does not inflate: {e}", header.tag())))?;
                Ok(())
            }
            SectionType::Volume | SectionType::Disk | SectionType::Data => {
                let body = read_body(file, header)?;
                let record = VolumeRecord::parse(&body).map_err(|e| section_err(state, e))?;
                match self.report.volume.as_ref().map(|first| *first == record) {
                    Some(false) => {
                        return Err(corrupt(state, format!("{} section disagrees with the first volume record", header.tag())));
                    }
                    Some(true) => {}
                    None => self.report.volume = Some(record),
                }
                Ok(())
            }
            SectionType::Table => {
                let body = read_body(file, header)?;
                let table = TableSection::parse(&body).map_err(|e| section_err(state, e))?;
                self.chunks(file, state, &table)?;
                state.last_table = Some(body);
                Ok(())
            }
            SectionType::Table2 => {
                let body = read_body(file, header)?;
                if state.last_table.as_deref() != Some(&body[..]) {
                    return Err(corrupt(state, format!("table2 at {} does not mirror its table", header.offset)));
                }
                Ok(())
            }
            SectionType::Error2 => {
                let body = read_body(file, header)?;
                let section = Error2Section::parse(&body).map_err(|e| section_err(state, e))?;
                self.report.error_runs.extend(section.runs);
                Ok(())
            }
            SectionType::Digest => {
                let body = read_body(file, header)?;
                let section = DigestSection::parse(&body).map_err(|e| section_err(state, e))?;
                self.report.stored_md5  = Some(section.md5);
                self.report.stored_sha1 = Some(section.sha1);
                Ok(())
            }
            SectionType::Hash => {
                let body = read_body(file, header)?;
                let section = HashSection::parse(&body).map_err(|e| section_err(state, e))?;
                self.report.hash_md5 = Some(section.md5);
                Ok(())
            }
            SectionType::Next | SectionType::Done => Ok(()),
        }
    }

    /// Decode every chunk a table points at, in order.
    fn chunks<R: Read + Seek>(&mut self, file: &mut R, state: &SegmentState, table: &TableSection) -> Result<(), VerifyError> {
        let Some((data_start, data_end)) = state.sectors else {
            return Err(corrupt(state, "table without a preceding sectors section".into()));
        };
        let chunk_size = self
            .report
            .volume
            .as_ref()
            .map(|v| u64::from(v.sectors_per_chunk) * u64::from(v.bytes_per_sector))
            .ok_or_else(|| corrupt(state, "table before any volume section".into()))?;

        for i in 0..table.len() {
            let Some((start, compressed)) = table.entry(i) else { break };
            let end = table.entry(i + 1).map_or(data_end, |(next, _)| next);
            if start < data_start || end > data_end || end <= start || end > state.len {
                return Err(corrupt(state, format!("chunk {} spans {start}..{end} outside its sectors data", self.report.chunk_count)));
            }
            let mut payload = vec![0u8; (end - start) as usize];
            file.seek(SeekFrom::Start(start))?;
            file.read_exact(&mut payload)?;
            let data = decompress_chunk(&payload, compressed)
                .map_err(|source| VerifyError::Chunk { index: self.report.chunk_count, source })?;
            if data.len() as u64 > chunk_size {
                return Err(corrupt(state, format!("chunk {} expands to {} bytes, more than {chunk_size}", self.report.chunk_count, data.len())));
            }
            (self.sink)(&data);
            self.report.chunk_count += 1;
            self.report.bytes       += data.len() as u64;
        }
        debug!(segment = %state.path.display(), entries = table.len(), "table verified");
        Ok(())
    }
}

fn read_body<R: Read + Seek>(file: &mut R, header: &SectionHeader) -> io::Result<Vec<u8>> {
    let mut body = vec![0u8; header.body_len() as usize];
    file.seek(SeekFrom::Start(header.offset + SECTION_HEADER_SIZE as u64))?;
    file.read_exact(&mut body)?;
    Ok(body)
}

fn corrupt(state: &SegmentState, reason: String) -> VerifyError {
    VerifyError::Corrupt { path: state.path.clone(), reason }
}

fn section_err(state: &SegmentState, source: SectionError) -> VerifyError {
    VerifyError::Section { path: state.path.clone(), source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{compress_chunk, CompressionLevel};
    use crate::ewf::HeaderInfo;
    use crate::options::AcquisitionOptions;
    use crate::writer::{EwfWriter, ImageDigests};

    fn write_image(dir: &Path, data: &[u8], level: CompressionLevel) -> PathBuf {
        let opts = AcquisitionOptions {
            output_dir:   dir.to_path_buf(),
            base_name:    "v".into(),
            chunk_size:   4096,
            segment_size: 64 * 1024,
            compression:  level,
            ..Default::default()
        };
        let mut writer = EwfWriter::create(&opts, HeaderInfo::new(data.len() as u64, uuid::Uuid::new_v4())).unwrap();
        for piece in data.chunks(4096) {
            writer.write_chunk(&compress_chunk(piece, level).unwrap()).unwrap();
        }
        let mut md5 = DigestAlgorithm::Md5.hasher();
        md5.update(data);
        let md5: [u8; 16] = md5.finalize().try_into().unwrap();
        writer.finalize(&ImageDigests { md5: Some(md5), sha1: None }, &[]).unwrap();
        dir.join("v.E01")
    }

    #[test]
    fn rebuilds_the_stream_across_segments() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..200 * 1024).map(|i| ((i * 7) % 256) as u8 ^ (i / 999) as u8).collect();
        let first = write_image(dir.path(), &data, CompressionLevel::Fast);

        let mut rebuilt = Vec::new();
        let report = read_image(&first, |chunk| rebuilt.extend_from_slice(chunk)).unwrap();
        assert!(rebuilt == data);
        assert!(report.complete);
        assert_eq!(report.chunk_count, 50);

        let report = verify_image(&first).unwrap();
        assert!(report.is_consistent(), "{:?}", report.problems());
        assert_eq!(report.sector_count(), 400);
    }

    #[test]
    fn detects_flipped_chunk_byte() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![0x5Au8; 16 * 1024];
        let first = write_image(dir.path(), &data, CompressionLevel::None);
        let report = verify_image(&first).unwrap();
        let sectors = report.sections.iter().find(|s| s.tag == "sectors").unwrap();

        let mut bytes = std::fs::read(&first).unwrap();
        bytes[(sectors.offset + 76 + 10) as usize] ^= 0xFF;
        std::fs::write(&first, bytes).unwrap();
        assert!(matches!(verify_image(&first), Err(VerifyError::Chunk { index: 0, .. })));
    }

    #[test]
    fn missing_segment_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..300 * 1024u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8).collect();
        let first = write_image(dir.path(), &data, CompressionLevel::None);
        std::fs::remove_file(dir.path().join("v.E02")).unwrap();
        assert!(matches!(verify_image(&first), Err(VerifyError::MissingSegment(_))));
    }

    #[test]
    fn rejects_non_first_segment() {
        assert!(matches!(verify_image(Path::new("image.E02")), Err(VerifyError::Corrupt { .. })));
    }
}
