//! High-level [`Acquisition`] API, the primary embedding surface.
//!
//! ```no_run
//! use ewfacq::acquisition::acquire;
//! use ewfacq::device::RawDevice;
//! use ewfacq::options::AcquisitionOptions;
//!
//! let device = RawDevice::open("/dev/sdb", Some("WD-1234".into()))?;
//! let options = AcquisitionOptions {
//!     output_dir: "/evidence".into(),
//!     base_name:  "case42".into(),
//!     ..AcquisitionOptions::default()
//! };
//! let report = acquire(&device, &options)?;
//! assert!(report.is_complete());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! For a cancellable run, build an [`Acquisition`], take its
//! [`StopHandle`] and hand it to whatever watches for the operator's
//! request before calling [`Acquisition::run`].

use std::fs::File;
use std::io::{Read, Seek};
use std::sync::Arc;

use crossbeam::channel;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::compressor::ChunkedCompressor;
use crate::device::Device;
use crate::digest::{DigestAlgorithm, StreamDigest};
use crate::ewf::HeaderInfo;
use crate::options::AcquisitionOptions;
use crate::pipeline::{ImagingError, Pipeline, PipelineConfig, Progress, RunOutcome, StopHandle};
use crate::processor::Processor;
use crate::reader::{ResilientReader, SECTOR_SIZE};
use crate::report::{AcquisitionReport, ReportStatus};
use crate::writer::{EwfOutput, EwfWriter, FinalizeInputs};

const REPORT_TARGET: &str = "ewfacq::report";

// ── Acquisition ─────────────────────────────────────────────────────────────

/// One fully wired imaging run: reader, compressor, digests and container
/// writer. Every output file is created before any thread starts, so setup
/// problems surface from the constructor.
pub struct Acquisition<D> {
    pipeline: Pipeline<D>,
    output:   Arc<EwfOutput>,
    options:  AcquisitionOptions,
    expected: u64,
}

impl Acquisition<File> {
    /// Open `device` for reading and prepare the output image.
    pub fn new(device: &dyn Device, options: &AcquisitionOptions) -> Result<Self, ImagingError> {
        options.validate()?;
        let reader = ResilientReader::open(device)?;
        Self::with_reader(device, reader, options)
    }
}

impl<D: Read + Seek + Send + 'static> Acquisition<D> {
    /// Like [`Acquisition::new`] but reading from an already opened source.
    /// `device` still supplies the size and the metadata strings.
    pub fn with_reader(
        device:  &dyn Device,
        reader:  ResilientReader<D>,
        options: &AcquisitionOptions,
    ) -> Result<Self, ImagingError> {
        options.validate()?;
        log_setup(device, options);

        let writer = EwfWriter::create(options, header_info(device, options))?;

        let poll = options.poll_interval;
        let compressor = Arc::new(ChunkedCompressor::new(
            options.chunk_size,
            options.compression,
            options.compression_workers,
            options.queue_depth,
            poll,
        ));
        let md5 = options
            .md5
            .then(|| Arc::new(StreamDigest::new(DigestAlgorithm::Md5, options.queue_depth, poll)));
        let sha1 = options
            .sha1
            .then(|| Arc::new(StreamDigest::new(DigestAlgorithm::Sha1, options.queue_depth, poll)));

        let (bad_tx, bad_rx) = channel::bounded(1);
        let expected = device.size().div_ceil(SECTOR_SIZE as u64);
        let inputs = FinalizeInputs {
            md5:              md5.as_ref().map(|d| d.future()),
            sha1:             sha1.as_ref().map(|d| d.future()),
            bad_sectors:      bad_rx,
            digest_wait:      options.digest_wait,
            sectors_expected: expected,
        };
        let output = Arc::new(EwfOutput::new(writer, compressor.output(), inputs, poll));

        let mut pipeline = Pipeline::new(reader, PipelineConfig { queue_depth: options.queue_depth, poll });
        pipeline.forward_bad_sectors(bad_tx);
        pipeline.add_processor(compressor);
        for digest in [md5, sha1].into_iter().flatten() {
            pipeline.add_processor(digest);
        }
        pipeline.add_processor(Arc::clone(&output) as Arc<dyn Processor>);

        Ok(Self { pipeline, output, options: options.clone(), expected })
    }

    pub fn progress(&self) -> Arc<Progress> {
        self.pipeline.progress()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.pipeline.stop_handle()
    }

    /// Image the whole device. Blocks until every worker has exited.
    pub fn run(self) -> Result<AcquisitionReport, ImagingError> {
        let Acquisition { pipeline, output, options, expected } = self;
        let outcome = pipeline.run()?;

        let mut report = output.report().unwrap_or_else(|| {
            error!("container writer exited without a report");
            fallback_report(&outcome, expected)
        });
        if outcome.read_failed && report.status == ReportStatus::Completed {
            report.status = ReportStatus::Failed;
            report.error.get_or_insert_with(|| "device read failed before the end of the media".into());
        }
        if outcome.aborted && report.status == ReportStatus::Completed {
            report.status = ReportStatus::Aborted;
        }

        if options.json_report {
            let path = options.report_path();
            match report.write_json(&path) {
                Ok(())  => info!(path = %path.display(), "report written"),
                Err(e)  => warn!(path = %path.display(), error = %e, "could not write report"),
            }
        }
        Ok(report)
    }
}

/// Open, image and report in one call.
pub fn acquire(device: &dyn Device, options: &AcquisitionOptions) -> Result<AcquisitionReport, ImagingError> {
    Acquisition::new(device, options)?.run()
}

fn header_info(device: &dyn Device, options: &AcquisitionOptions) -> HeaderInfo {
    let case = &options.case;
    let mut info = HeaderInfo::new(device.size(), Uuid::new_v4());
    info.description = case.description.clone();
    info.case_number = case.case_number.clone();
    info.evidence_number = case.evidence_number.clone();
    info.examiner = case.examiner.clone();
    info.notes = case.notes.clone();
    info.serial_number = device.serial_number().to_owned();
    info.model = device.model().to_owned();
    info
}

fn log_setup(device: &dyn Device, options: &AcquisitionOptions) {
    let case = &options.case;
    info!(target: REPORT_TARGET, "Case number: {}", case.case_number);
    info!(target: REPORT_TARGET, "Evidence number: {}", case.evidence_number);
    info!(target: REPORT_TARGET, "Examiner: {}", case.examiner);
    info!(target: REPORT_TARGET, "Description: {}", case.description);
    if !case.notes.is_empty() {
        info!(target: REPORT_TARGET, "Notes: {}", case.notes);
    }
    info!(target: REPORT_TARGET, "Source: {}", device.details());
    info!(
        target: REPORT_TARGET,
        "Output: {} ({} compression, {} byte chunks, {} byte segments)",
        options.output_dir().join(&options.base_name).display(),
        options.compression,
        options.chunk_size,
        options.segment_size,
    );
}

fn fallback_report(outcome: &RunOutcome, expected: u64) -> AcquisitionReport {
    AcquisitionReport {
        status:           if outcome.aborted { ReportStatus::Aborted } else { ReportStatus::Failed },
        elapsed_secs:     0.0,
        sectors_written:  0,
        sectors_expected: expected,
        chunks_written:   0,
        segments:         Vec::new(),
        md5:              None,
        sha1:             None,
        bad_sectors:      outcome.bad_sectors.clone(),
        error:            Some("container writer exited without a report".into()),
    }
}
