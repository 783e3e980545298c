//! EWF container writer.
//!
//! `Initializing → Writing → (Splitting ↔ Writing)* → Finalizing → Done`
//!
//! Volume-like sections (`disk` in the first segment, `data` in the others)
//! depend on the final chunk and sector totals, so they are written as
//! zeroed placeholders and patched in one pass at the end. Every segment file
//! stays open until then.

use std::fs::{self, File};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::codec::CompressedChunk;
use crate::compressor::PendingChunk;
use crate::digest::DigestFuture;
use crate::ewf::{
    DigestSection, Error2Section, HashSection, HeaderInfo, HeaderSection, SectionHeader, SectionType,
    SegmentPreamble, TableSection, VolumeRecord, VolumeSection, SECTION_HEADER_SIZE,
};
use crate::options::AcquisitionOptions;
use crate::pipeline::ImagingError;
use crate::processor::{Processor, WorkerCore};
use crate::reader::{RawChunk, SECTOR_SIZE};
use crate::report::{AcquisitionReport, ReportStatus};

const CHUNK_LOG_INTERVAL: u64 = 10_000;
const WRITE_BUFFER_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Initializing,
    Writing,
    Splitting,
    Finalizing,
    Done,
    Aborted,
    Failed,
}

/// Digest values recorded in the last segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageDigests {
    pub md5:  Option<[u8; 16]>,
    pub sha1: Option<[u8; 20]>,
}

struct Segment {
    path: PathBuf,
    file: BufWriter<File>,
}

/// A zeroed volume-like section waiting for the final totals.
#[derive(Debug, Clone, Copy)]
struct Placeholder {
    segment: usize,
    offset:  u64,
    kind:    SectionType,
}

pub struct EwfWriter {
    options:        AcquisitionOptions,
    header:         HeaderInfo,
    segments:       Vec<Segment>,
    placeholders:   Vec<Placeholder>,
    position:       u64,
    sectors:        Option<SectionHeader>,
    table:          TableSection,
    segment_chunks: u64,
    chunks:         u64,
    sectors_total:  u64,
    state:          WriterState,
    failure:        Option<String>,
    #[cfg(test)]
    fail_at_chunk:  Option<u64>,
}

fn other(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::Other, msg.into())
}

impl EwfWriter {
    /// Create the output directory and the first segment, and write
    /// everything that precedes the first chunk.
    pub fn create(options: &AcquisitionOptions, header: HeaderInfo) -> Result<Self, ImagingError> {
        options.validate()?;
        fs::create_dir_all(&options.output_dir).map_err(|e| {
            ImagingError::Setup(format!("cannot create output directory {}: {e}", options.output_dir.display()))
        })?;
        let mut writer = Self {
            options:        options.clone(),
            header,
            segments:       Vec::new(),
            placeholders:   Vec::new(),
            position:       0,
            sectors:        None,
            table:          TableSection::new(),
            segment_chunks: 0,
            chunks:         0,
            sectors_total:  0,
            state:          WriterState::Initializing,
            failure:        None,
            #[cfg(test)]
            fail_at_chunk:  None,
        };
        writer.open_segment()?;
        writer.write_headers()?;
        writer.reserve_volume(SectionType::Disk)?;
        writer.state = WriterState::Writing;
        Ok(writer)
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn chunks_written(&self) -> u64 {
        self.chunks
    }

    pub fn sectors_written(&self) -> u64 {
        self.sectors_total
    }

    pub fn segment_paths(&self) -> Vec<PathBuf> {
        self.segments.iter().map(|s| s.path.clone()).collect()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Append one chunk. After an IO error the writer is `Failed` and
    /// refuses further chunks.
    pub fn write_chunk(&mut self, chunk: &CompressedChunk) -> io::Result<()> {
        if self.state != WriterState::Writing {
            return Err(other(format!("cannot write a chunk while {:?}", self.state)));
        }
        let result = self.append_chunk(chunk);
        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    /// Close the last sectors section, write the trailing sections and patch
    /// every volume placeholder.
    pub fn finalize(&mut self, digests: &ImageDigests, bad_sectors: &[u64]) -> io::Result<()> {
        if self.state != WriterState::Writing {
            return Err(other(format!("cannot finalize while {:?}", self.state)));
        }
        self.state = WriterState::Finalizing;
        let result = self.write_trailer(digests, bad_sectors);
        match &result {
            Ok(())  => self.state = WriterState::Done,
            Err(e)  => self.fail(e),
        }
        result
    }

    /// Best-effort close after cancellation or a write failure: whatever
    /// chunks were written get a valid table, and the placeholders carry the
    /// partial totals. A failed writer stays `Failed`.
    pub fn close_partial(&mut self) -> io::Result<()> {
        if matches!(self.state, WriterState::Done | WriterState::Aborted) {
            return Ok(());
        }
        if self.state != WriterState::Failed {
            self.state = WriterState::Aborted;
        }
        self.close_sectors()?;
        self.patch_volumes()?;
        self.sync_all()
    }

    pub(crate) fn fail(&mut self, err: &io::Error) {
        error!(error = %err, state = ?self.state, "container write failed");
        self.state = WriterState::Failed;
        self.failure.get_or_insert_with(|| err.to_string());
    }

    // ── Segments ────────────────────────────────────────────────────────────

    fn current(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.segments.last_mut().map(|s| &mut s.file).ok_or_else(|| other("no open segment"))
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.current()?.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    fn open_segment(&mut self) -> io::Result<()> {
        let number = self.segments.len() as u32 + 1;
        let path = self
            .options
            .segment_path(number)
            .map_err(|e| other(e.to_string()))?;
        let preamble = SegmentPreamble::new(number).map_err(|e| other(e.to_string()))?;
        let file = File::create(&path)
            .map_err(|e| io::Error::new(e.kind(), format!("cannot create {}: {e}", path.display())))?;
        debug!(segment = %path.display(), "opened segment");
        self.segments.push(Segment { path, file: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file) });
        self.position = 0;
        self.segment_chunks = 0;
        let mut bytes = Vec::with_capacity(crate::ewf::PREAMBLE_SIZE);
        preamble.write(&mut bytes)?;
        self.write_bytes(&bytes)
    }

    fn write_headers(&mut self) -> io::Result<()> {
        let mut bytes = Vec::new();
        for _ in 0..2 {
            HeaderSection::header2(&self.header, self.position + bytes.len() as u64)?.write(&mut bytes)?;
        }
        HeaderSection::header(&self.header, self.position + bytes.len() as u64)?.write(&mut bytes)?;
        self.write_bytes(&bytes)
    }

    fn reserve_volume(&mut self, kind: SectionType) -> io::Result<()> {
        self.placeholders.push(Placeholder {
            segment: self.segments.len().saturating_sub(1),
            offset:  self.position,
            kind,
        });
        self.write_bytes(&VolumeSection::placeholder())
    }

    fn split(&mut self) -> io::Result<()> {
        self.state = WriterState::Splitting;
        self.close_sectors()?;
        let next = SectionHeader::of(SectionType::Next, self.position);
        self.write_bytes(&next.to_bytes())?;
        self.current()?.flush()?;
        self.open_segment()?;
        self.reserve_volume(SectionType::Data)?;
        self.state = WriterState::Writing;
        Ok(())
    }

    // ── Sectors and tables ──────────────────────────────────────────────────

    /// Whether appending `chunk_len` bytes, plus everything needed to close
    /// the segment afterwards, would overrun the segment size.
    fn needs_split(&self, chunk_len: u64) -> bool {
        if self.segment_chunks == 0 {
            return false;
        }
        let header = SECTION_HEADER_SIZE as u64;
        let mut needed = chunk_len + header;
        if self.sectors.is_none() {
            needed += header + 2 * TableSection::section_size(1);
        } else if self.table.is_full() {
            needed += 2 * TableSection::section_size(self.table.len()) + header + 2 * TableSection::section_size(1);
        } else {
            needed += 2 * TableSection::section_size(self.table.len() + 1);
        }
        self.position + needed > self.options.segment_size
    }

    fn begin_sectors(&mut self) -> io::Result<()> {
        let header = SectionHeader::of(SectionType::Sectors, self.position);
        self.write_bytes(&header.placeholder_bytes())?;
        self.sectors = Some(header);
        self.table.clear();
        Ok(())
    }

    /// Patch the open sectors descriptor and write its table pair.
    fn close_sectors(&mut self) -> io::Result<()> {
        let Some(sectors) = self.sectors.take() else {
            return Ok(());
        };
        let end = self.position;
        debug_assert_eq!(sectors.next_offset, end);
        let table = std::mem::take(&mut self.table);
        let file = self.current()?;
        file.seek(SeekFrom::Start(sectors.offset))?;
        sectors.write(&mut *file)?;
        file.seek(SeekFrom::Start(end))?;
        let after_tables = table.write_pair(&mut *file, end)?;
        self.position = after_tables;
        Ok(())
    }

    fn append_chunk(&mut self, chunk: &CompressedChunk) -> io::Result<()> {
        if chunk.is_end_of_stream() {
            return Ok(());
        }
        let len = chunk.stored_len() as u64;
        if self.needs_split(len) {
            self.split()?;
        }
        if self.table.is_full() {
            debug!(chunks = self.chunks, "table full, opening a new sectors section");
            self.close_sectors()?;
        }
        if self.sectors.is_none() {
            self.begin_sectors()?;
        }
        #[cfg(test)]
        if self.fail_at_chunk == Some(self.chunks) {
            return Err(other("no space left on device"));
        }
        // A chunk enters the table only after its bytes are written.
        let at = self.position;
        self.write_bytes(&chunk.data)?;
        if let Some(sectors) = self.sectors.as_mut() {
            sectors.grow(len);
        }
        self.table
            .push(at, chunk.compressed)
            .map_err(|e| other(e.to_string()))?;
        self.segment_chunks += 1;
        self.chunks         += 1;
        self.sectors_total  += (chunk.original_size / SECTOR_SIZE) as u64;
        if self.chunks % CHUNK_LOG_INTERVAL == 0 {
            debug!(chunks = self.chunks, sectors = self.sectors_total, "output progress");
        }
        Ok(())
    }

    // ── Finalization ────────────────────────────────────────────────────────

    fn write_trailer(&mut self, digests: &ImageDigests, bad_sectors: &[u64]) -> io::Result<()> {
        self.close_sectors()?;
        if self.segments.len() == 1 {
            self.reserve_volume(SectionType::Data)?;
        }

        let mut tail = Vec::new();
        let mut at = self.position;
        if !bad_sectors.is_empty() {
            at = Error2Section::from_sectors(bad_sectors).write(&mut tail, at)?;
        }
        if digests.md5.is_some() || digests.sha1.is_some() {
            let section = DigestSection {
                md5:  digests.md5.unwrap_or_default(),
                sha1: digests.sha1.unwrap_or_default(),
            };
            at = section.write(&mut tail, at)?;
        }
        if let Some(md5) = digests.md5 {
            at = HashSection { md5 }.write(&mut tail, at)?;
        }
        SectionHeader::of(SectionType::Done, at).write(&mut tail)?;
        self.write_bytes(&tail)?;

        self.patch_volumes()?;
        self.sync_all()?;
        info!(
            chunks   = self.chunks,
            sectors  = self.sectors_total,
            segments = self.segments.len(),
            "image finalized"
        );
        Ok(())
    }

    fn patch_volumes(&mut self) -> io::Result<()> {
        let mut record = VolumeRecord::new(
            self.options.sectors_per_chunk(),
            self.options.compression.ewf_level(),
            self.header.guid,
        );
        record.chunk_count  = u32::try_from(self.chunks).unwrap_or(u32::MAX);
        record.sector_count = self.sectors_total;

        for placeholder in &self.placeholders {
            let segment = self
                .segments
                .get_mut(placeholder.segment)
                .ok_or_else(|| other("placeholder refers to a missing segment"))?;
            let section = VolumeSection::new(placeholder.kind, placeholder.offset, record.clone());
            segment.file.seek(SeekFrom::Start(placeholder.offset))?;
            section.write(&mut segment.file)?;
        }
        let end = self.position;
        self.current()?.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    fn sync_all(&mut self) -> io::Result<()> {
        for segment in &mut self.segments {
            segment.file.flush()?;
            segment.file.get_ref().sync_all()?;
        }
        Ok(())
    }
}

// ── Processor ───────────────────────────────────────────────────────────────

/// What the writer needs from the rest of the pipeline once the data ends.
pub struct FinalizeInputs {
    pub md5:              Option<DigestFuture>,
    pub sha1:             Option<DigestFuture>,
    pub bad_sectors:      Receiver<Vec<u64>>,
    pub digest_wait:      Duration,
    pub sectors_expected: u64,
}

/// Drains the compressor's ordered output into an [`EwfWriter`] on its own
/// thread. Raw buffers are ignored; this processor only sees compressed
/// chunks.
pub struct EwfOutput {
    core:   WorkerCore,
    writer: Mutex<Option<EwfWriter>>,
    source: Receiver<PendingChunk>,
    inputs: Mutex<Option<FinalizeInputs>>,
    report: Arc<OnceLock<AcquisitionReport>>,
    poll:   Duration,
}

impl EwfOutput {
    pub fn new(writer: EwfWriter, source: Receiver<PendingChunk>, inputs: FinalizeInputs, poll: Duration) -> Self {
        Self {
            core:   WorkerCore::new("ewf-writer"),
            writer: Mutex::new(Some(writer)),
            source,
            inputs: Mutex::new(Some(inputs)),
            report: Arc::new(OnceLock::new()),
            poll,
        }
    }

    /// Available once the writer thread has exited.
    pub fn report(&self) -> Option<AcquisitionReport> {
        self.report.get().cloned()
    }
}

impl Processor for EwfOutput {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn initialize(&self) -> Result<(), ImagingError> {
        let writer = self.writer.lock().take();
        let inputs = self.inputs.lock().take();
        let (Some(writer), Some(inputs)) = (writer, inputs) else {
            return Err(ImagingError::Setup("container writer already initialized".into()));
        };
        let source  = self.source.clone();
        let running = self.core.running();
        let report  = Arc::clone(&self.report);
        let poll    = self.poll;
        self.core.spawn(move || {
            let result = drain(writer, &source, &running, inputs, poll);
            let _ = report.set(result);
        })
    }

    fn process(&self, _chunk: RawChunk) {}

    fn consumes_raw(&self) -> bool {
        false
    }

    fn finish(&self) {}

    fn wait_for_exit(&self) {
        self.core.join();
    }

    fn cancel(&self) {
        self.core.cancel();
    }
}

#[derive(Clone, Copy)]
enum Ending {
    EndOfStream,
    Cancelled,
}

/// Wait on one task handle, polling the run flag. `None` on cancellation.
fn await_chunk(
    pending: &PendingChunk,
    running: &AtomicBool,
    poll:    Duration,
) -> Option<Result<CompressedChunk, crate::codec::CodecError>> {
    loop {
        match pending.wait_timeout(poll) {
            Ok(Some(chunk)) => return Some(Ok(chunk)),
            Ok(None) if running.load(Ordering::Acquire) => continue,
            Ok(None) => return None,
            Err(e) => return Some(Err(e)),
        }
    }
}

fn drain(
    mut writer: EwfWriter,
    source:     &Receiver<PendingChunk>,
    running:    &AtomicBool,
    inputs:     FinalizeInputs,
    poll:       Duration,
) -> AcquisitionReport {
    let started = Instant::now();
    let ending = loop {
        if !running.load(Ordering::Acquire) {
            break Ending::Cancelled;
        }
        let pending = match source.recv_timeout(poll) {
            Ok(pending)                         => pending,
            Err(RecvTimeoutError::Timeout)      => continue,
            Err(RecvTimeoutError::Disconnected) => break Ending::Cancelled,
        };
        let chunk = match await_chunk(&pending, running, poll) {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                if writer.state() == WriterState::Writing {
                    writer.fail(&other(format!("chunk lost: {e}")));
                }
                continue;
            }
            None => break Ending::Cancelled,
        };
        if chunk.is_end_of_stream() {
            break Ending::EndOfStream;
        }
        // A failed writer keeps consuming so upstream never blocks.
        if writer.state() == WriterState::Writing {
            let _ = writer.write_chunk(&chunk);
        }
    };

    let (bad_sectors, digests) = match ending {
        Ending::EndOfStream => {
            let bad = inputs.bad_sectors.recv_timeout(inputs.digest_wait).unwrap_or_else(|_| {
                warn!("bad sector list was not handed over, error2 section omitted");
                Vec::new()
            });
            (bad, collect_digests(&inputs, Some(inputs.digest_wait)))
        }
        Ending::Cancelled => (inputs.bad_sectors.try_recv().unwrap_or_default(), collect_digests(&inputs, None)),
    };

    let status = match ending {
        Ending::EndOfStream => {
            let finalized = writer.state() == WriterState::Writing && writer.finalize(&digests, &bad_sectors).is_ok();
            if finalized {
                ReportStatus::Completed
            } else {
                if let Err(e) = writer.close_partial() {
                    error!(error = %e, "could not close the partial image after a write failure");
                }
                ReportStatus::Failed
            }
        }
        Ending::Cancelled => {
            if let Err(e) = writer.close_partial() {
                error!(error = %e, "could not close the partial image");
            }
            ReportStatus::Aborted
        }
    };

    let report = AcquisitionReport {
        status,
        elapsed_secs:     started.elapsed().as_secs_f64(),
        sectors_written:  writer.sectors_written(),
        sectors_expected: inputs.sectors_expected,
        chunks_written:   writer.chunks_written(),
        segments:         writer.segment_paths(),
        md5:              digests.md5.map(hex::encode),
        sha1:             digests.sha1.map(hex::encode),
        bad_sectors,
        error:            writer.failure().map(str::to_owned),
    };
    report.log();
    report
}

/// With `wait` the digests are awaited; without it only values already
/// published are used.
fn collect_digests(inputs: &FinalizeInputs, wait: Option<Duration>) -> ImageDigests {
    fn fetch(future: &Option<DigestFuture>, wait: Option<Duration>) -> Option<Vec<u8>> {
        let future = future.as_ref()?;
        match wait {
            Some(timeout) => match future.wait(timeout) {
                Ok(value) => Some(value),
                Err(e) => {
                    error!(error = %e, "digest unavailable");
                    None
                }
            },
            None => future.get().map(<[u8]>::to_vec),
        }
    }
    ImageDigests {
        md5:  fetch(&inputs.md5, wait).and_then(|v| v.try_into().ok()),
        sha1: fetch(&inputs.sha1, wait).and_then(|v| v.try_into().ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{compress_chunk, CompressionLevel};
    use crate::ewf::{SectionHeader, PREAMBLE_SIZE};
    use std::io::Cursor;

    fn options(dir: &std::path::Path, segment_size: u64, chunk_size: usize) -> AcquisitionOptions {
        AcquisitionOptions {
            output_dir:  dir.to_path_buf(),
            base_name:   "unit".into(),
            chunk_size,
            segment_size,
            compression: CompressionLevel::None,
            ..Default::default()
        }
    }

    fn walk(bytes: &[u8]) -> Vec<(String, u64, u64)> {
        let mut out = Vec::new();
        let mut pos = PREAMBLE_SIZE as u64;
        loop {
            let header = SectionHeader::read(Cursor::new(&bytes[pos as usize..]), pos).unwrap();
            out.push((header.tag().to_owned(), pos, header.size));
            if header.next_offset == pos {
                return out;
            }
            pos = header.next_offset;
        }
    }

    #[test]
    fn single_segment_layout() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path(), 1 << 20, 4096);
        let mut writer = EwfWriter::create(&opts, HeaderInfo::new(8192, uuid::Uuid::new_v4())).unwrap();
        for byte in [1u8, 2] {
            writer.write_chunk(&compress_chunk(&[byte; 4096], CompressionLevel::None).unwrap()).unwrap();
        }
        let digests = ImageDigests { md5: Some([7; 16]), sha1: Some([9; 20]) };
        writer.finalize(&digests, &[3]).unwrap();
        assert_eq!(writer.state(), WriterState::Done);
        assert_eq!(writer.sectors_written(), 16);

        let bytes = fs::read(dir.path().join("unit.E01")).unwrap();
        let tags: Vec<String> = walk(&bytes).into_iter().map(|(t, _, _)| t).collect();
        assert_eq!(
            tags,
            ["header2", "header2", "header", "disk", "sectors", "table", "table2", "data", "error2", "digest", "hash", "done"]
        );
        let sections = walk(&bytes);
        let (_, sectors_at, sectors_size) = sections[4].clone();
        assert_eq!(sectors_size, 76 + 2 * (4096 + 4));
        assert_eq!(sections[5].1, sectors_at + sectors_size);
        let (_, done_at, _) = sections.last().unwrap().clone();
        assert_eq!(done_at + 76, bytes.len() as u64);

        let disk = VolumeRecord::parse(&bytes[sections[3].1 as usize + 76..]).unwrap();
        assert_eq!(disk.chunk_count, 2);
        assert_eq!(disk.sector_count, 16);
        assert_eq!(disk.sectors_per_chunk, 8);
        assert_eq!(disk.compression_level, 0);
    }

    #[test]
    fn splits_into_segments_ending_with_next() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path(), 20 * 1024, 4096);
        let mut writer = EwfWriter::create(&opts, HeaderInfo::new(0, uuid::Uuid::nil())).unwrap();
        for i in 0..12u8 {
            writer.write_chunk(&compress_chunk(&[i; 4096], CompressionLevel::None).unwrap()).unwrap();
        }
        writer.finalize(&ImageDigests::default(), &[]).unwrap();
        let paths = writer.segment_paths();
        assert!(paths.len() > 1);
        for (i, path) in paths.iter().enumerate() {
            let bytes = fs::read(path).unwrap();
            assert!(bytes.len() as u64 <= opts.segment_size);
            let sections = walk(&bytes);
            let (last, at, _) = sections.last().unwrap().clone();
            assert_eq!(at + 76, bytes.len() as u64);
            if i + 1 == paths.len() {
                assert_eq!(last, "done");
            } else {
                assert_eq!(last, "next");
                assert_eq!(sections[0].0, if i == 0 { "header2" } else { "data" });
            }
        }
    }

    #[test]
    fn refuses_chunks_after_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path(), 1 << 20, 4096);
        let mut writer = EwfWriter::create(&opts, HeaderInfo::new(0, uuid::Uuid::nil())).unwrap();
        writer.finalize(&ImageDigests::default(), &[]).unwrap();
        let chunk = compress_chunk(&[0; 4096], CompressionLevel::None).unwrap();
        assert!(writer.write_chunk(&chunk).is_err());
        assert!(writer.finalize(&ImageDigests::default(), &[]).is_err());
    }

    #[test]
    fn partial_close_keeps_written_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path(), 1 << 20, 4096);
        let mut writer = EwfWriter::create(&opts, HeaderInfo::new(0, uuid::Uuid::nil())).unwrap();
        writer.write_chunk(&compress_chunk(&[5; 4096], CompressionLevel::None).unwrap()).unwrap();
        writer.close_partial().unwrap();
        writer.close_partial().unwrap();
        assert_eq!(writer.state(), WriterState::Aborted);
        let bytes = fs::read(dir.path().join("unit.E01")).unwrap();
        let tags: Vec<String> = walk_until_end(&bytes);
        assert_eq!(tags, ["header2", "header2", "header", "disk", "sectors", "table", "table2"]);
    }

    #[test]
    fn write_failure_leaves_a_readable_partial_image() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path(), 1 << 20, 4096);
        let mut writer = EwfWriter::create(&opts, HeaderInfo::new(0, uuid::Uuid::nil())).unwrap();
        writer.fail_at_chunk = Some(2);
        for byte in [1u8, 2] {
            writer.write_chunk(&compress_chunk(&[byte; 4096], CompressionLevel::None).unwrap()).unwrap();
        }
        let third = compress_chunk(&[3; 4096], CompressionLevel::None).unwrap();
        assert!(writer.write_chunk(&third).is_err());
        assert_eq!(writer.state(), WriterState::Failed);
        assert!(writer.failure().is_some());
        assert!(writer.write_chunk(&third).is_err());

        writer.close_partial().unwrap();
        assert_eq!(writer.state(), WriterState::Failed);
        assert_eq!(writer.chunks_written(), 2);

        let bytes = fs::read(dir.path().join("unit.E01")).unwrap();
        assert_eq!(walk_until_end(&bytes), ["header2", "header2", "header", "disk", "sectors", "table", "table2"]);
        let offsets = section_offsets(&bytes);
        let disk = VolumeRecord::parse(&bytes[offsets[3] as usize + 76..]).unwrap();
        assert_eq!(disk.chunk_count, 2);
        assert_eq!(disk.sector_count, 16);

        let table = TableSection::parse(&bytes[offsets[5] as usize + 76..]).unwrap();
        assert_eq!(table.len(), 2);
        for (index, byte) in [1u8, 2].into_iter().enumerate() {
            let (at, compressed) = table.entry(index).unwrap();
            let payload = &bytes[at as usize..at as usize + 4096 + 4];
            assert_eq!(crate::codec::decompress_chunk(payload, compressed).unwrap(), vec![byte; 4096]);
        }
    }

    #[test]
    fn failed_writer_drains_to_the_end_and_patches_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path(), 1 << 20, 4096);
        let mut writer = EwfWriter::create(&opts, HeaderInfo::new(5 * 4096, uuid::Uuid::nil())).unwrap();
        writer.fail_at_chunk = Some(2);

        let (tx, rx) = crossbeam::channel::unbounded();
        for byte in 0..5u8 {
            tx.send(PendingChunk::ready(compress_chunk(&[byte; 4096], CompressionLevel::None).unwrap())).unwrap();
        }
        tx.send(PendingChunk::ready(CompressedChunk::end_of_stream())).unwrap();
        let (bad_tx, bad_rx) = crossbeam::channel::bounded(1);
        bad_tx.send(vec![9]).unwrap();
        let inputs = FinalizeInputs {
            md5:              None,
            sha1:             None,
            bad_sectors:      bad_rx,
            digest_wait:      Duration::from_secs(1),
            sectors_expected: 40,
        };

        let output = EwfOutput::new(writer, rx.clone(), inputs, Duration::from_millis(5));
        output.initialize().unwrap();
        output.wait_for_exit();

        let report = output.report().unwrap();
        assert_eq!(report.status, ReportStatus::Failed);
        assert!(report.error.is_some());
        assert_eq!(report.chunks_written, 2);
        assert_eq!(report.bad_sectors, vec![9]);
        assert!(rx.is_empty());

        let bytes = fs::read(dir.path().join("unit.E01")).unwrap();
        let offsets = section_offsets(&bytes);
        let disk = VolumeRecord::parse(&bytes[offsets[3] as usize + 76..]).unwrap();
        assert_eq!(disk.chunk_count, 2);
    }

    fn section_offsets(bytes: &[u8]) -> Vec<u64> {
        let mut out = Vec::new();
        let mut pos = PREAMBLE_SIZE;
        while pos + 76 <= bytes.len() {
            let header = SectionHeader::read(Cursor::new(&bytes[pos..]), pos as u64).unwrap();
            out.push(pos as u64);
            pos = header.next_offset as usize;
        }
        out
    }

    /// Follows the chain until it runs off the end of the file.
    fn walk_until_end(bytes: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        let mut pos = PREAMBLE_SIZE;
        while pos + 76 <= bytes.len() {
            let header = SectionHeader::read(Cursor::new(&bytes[pos..]), pos as u64).unwrap();
            out.push(header.tag().to_owned());
            pos = header.next_offset as usize;
        }
        out
    }
}
