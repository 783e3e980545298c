//! Fans the reader's output out to every registered processor.
//!
//! The reader runs on its own thread and feeds a bounded queue; the
//! orchestrating thread copies each buffer into every processor's intake.
//! Bad sectors are handed to whoever asked for them once reading ends.

use std::io::{self, Read, Seek};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, SendTimeoutError, Sender};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::ewf::{SectionError, SegmentError};
use crate::processor::Processor;
use crate::reader::{RawChunk, ReaderError, ResilientReader};

const PROGRESS_LOG_INTERVAL: u64 = 5000;

#[derive(Error, Debug)]
pub enum ImagingError {
    #[error("Setup failed: {0}")]
    Setup(String),
    #[error("Invalid options: {0}")]
    InvalidOptions(String),
    #[error("Reader error: {0}")]
    Reader(#[from] ReaderError),
    #[error("Section error: {0}")]
    Section(#[from] SectionError),
    #[error("Segment error: {0}")]
    Segment(#[from] SegmentError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Acquisition cancelled")]
    Cancelled,
}

// ── Progress ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Running,
    Completed,
    Aborted,
    Failed,
}

/// Observable byte counter plus a terminal state.
#[derive(Debug, Default)]
pub struct Progress {
    bytes: AtomicU64,
    state: AtomicU8,
}

impl Progress {
    pub fn bytes_read(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> ProgressState {
        match self.state.load(Ordering::Acquire) {
            0 => ProgressState::Running,
            1 => ProgressState::Completed,
            2 => ProgressState::Aborted,
            _ => ProgressState::Failed,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.state() == ProgressState::Failed
    }

    fn add(&self, n: u64) -> u64 {
        self.bytes.fetch_add(n, Ordering::Relaxed) + n
    }

    pub(crate) fn set_state(&self, state: ProgressState) {
        let raw = match state {
            ProgressState::Running   => 0,
            ProgressState::Completed => 1,
            ProgressState::Aborted   => 2,
            ProgressState::Failed    => 3,
        };
        self.state.store(raw, Ordering::Release);
    }
}

// ── Stop handle ─────────────────────────────────────────────────────────────

/// Cooperative cancellation that can be used from any thread, any number of
/// times.
#[derive(Clone)]
pub struct StopHandle {
    abort:      Arc<AtomicBool>,
    processors: Vec<Arc<dyn Processor>>,
}

impl StopHandle {
    pub fn stop(&self) {
        if !self.abort.swap(true, Ordering::AcqRel) {
            info!("stop requested, cancelling processors");
        }
        for processor in &self.processors {
            processor.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }
}

// ── Pipeline ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub queue_depth: usize,
    pub poll:        Duration,
}

/// How the run ended, from the orchestrator's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub bytes_read:  u64,
    pub bad_sectors: Vec<u64>,
    pub aborted:     bool,
    /// A non-sector device error ended reading early.
    pub read_failed: bool,
}

enum ReadEvent {
    Data(RawChunk),
    End { bad_sectors: Vec<u64>, failed: bool },
}

pub struct Pipeline<D> {
    reader:      ResilientReader<D>,
    processors:  Vec<Arc<dyn Processor>>,
    config:      PipelineConfig,
    progress:    Arc<Progress>,
    abort:       Arc<AtomicBool>,
    bad_sink:    Option<Sender<Vec<u64>>>,
}

impl<D: Read + Seek + Send + 'static> Pipeline<D> {
    pub fn new(reader: ResilientReader<D>, config: PipelineConfig) -> Self {
        Self {
            reader,
            processors: Vec::new(),
            config,
            progress: Arc::new(Progress::default()),
            abort: Arc::new(AtomicBool::new(false)),
            bad_sink: None,
        }
    }

    pub fn add_processor(&mut self, processor: Arc<dyn Processor>) {
        self.processors.push(processor);
    }

    /// Deliver the bad-sector list through `tx` when reading ends.
    pub fn forward_bad_sectors(&mut self, tx: Sender<Vec<u64>>) {
        self.bad_sink = Some(tx);
    }

    pub fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }

    /// Handle for cancelling the run. Take it before calling `run`.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { abort: Arc::clone(&self.abort), processors: self.processors.clone() }
    }

    pub fn run(self) -> Result<RunOutcome, ImagingError> {
        let Pipeline { mut reader, processors, config, progress, abort, bad_sink } = self;

        for (i, processor) in processors.iter().enumerate() {
            if let Err(e) = processor.initialize() {
                error!(processor = processor.name(), error = %e, "processor failed to initialize");
                for started in &processors[..i] {
                    started.cancel();
                }
                progress.set_state(ProgressState::Failed);
                return Err(e);
            }
        }

        let (tx, rx) = channel::bounded::<ReadEvent>(config.queue_depth.max(1));
        let reader_abort = Arc::clone(&abort);
        let poll = config.poll;
        let reader_thread = thread::Builder::new()
            .name("device-reader".into())
            .spawn(move || {
                let mut failed = false;
                while !reader_abort.load(Ordering::Acquire) {
                    match reader.read_chunk() {
                        Ok(Some(chunk)) => {
                            if !send_unless_aborted(&tx, ReadEvent::Data(chunk), &reader_abort, poll) {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error!(error = %e, "device read failed, ending acquisition early");
                            failed = true;
                            break;
                        }
                    }
                }
                let bad_sectors = reader.take_bad_sectors();
                if let Some(sink) = bad_sink {
                    let _ = sink.send(bad_sectors.clone());
                }
                let _ = tx.send(ReadEvent::End { bad_sectors, failed });
            });
        let reader_thread = match reader_thread {
            Ok(handle) => handle,
            Err(e) => {
                for processor in &processors {
                    processor.cancel();
                }
                progress.set_state(ProgressState::Failed);
                return Err(ImagingError::Setup(format!("cannot start reader thread: {e}")));
            }
        };

        let mut reads: u64 = 0;
        let mut outcome = RunOutcome { bytes_read: 0, bad_sectors: Vec::new(), aborted: false, read_failed: false };
        loop {
            if abort.load(Ordering::Acquire) {
                outcome.aborted = true;
                break;
            }
            match rx.recv_timeout(poll) {
                Ok(ReadEvent::Data(chunk)) => {
                    reads += 1;
                    let total = progress.add(chunk.data.len() as u64);
                    if reads % PROGRESS_LOG_INTERVAL == 0 {
                        info!(bytes = total, reads, "imaging in progress");
                    }
                    fan_out(&processors, chunk);
                }
                Ok(ReadEvent::End { bad_sectors, failed }) => {
                    outcome.bad_sectors = bad_sectors;
                    outcome.read_failed = failed;
                    break;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    error!("reader thread ended without reporting");
                    outcome.read_failed = true;
                    break;
                }
            }
        }

        // Unblocks a reader stuck on a full queue after an abort.
        drop(rx);
        if reader_thread.join().is_err() {
            error!("reader thread panicked");
            outcome.read_failed = true;
        }

        for processor in &processors {
            processor.finish();
        }
        for processor in &processors {
            processor.wait_for_exit();
            debug!(processor = processor.name(), "processor exited");
        }

        outcome.bytes_read = progress.bytes_read();
        outcome.aborted |= abort.load(Ordering::Acquire);
        progress.set_state(if outcome.aborted {
            ProgressState::Aborted
        } else if outcome.read_failed {
            ProgressState::Failed
        } else {
            ProgressState::Completed
        });
        info!(bytes = outcome.bytes_read, bad_sectors = outcome.bad_sectors.len(), aborted = outcome.aborted, "reading finished");
        Ok(outcome)
    }
}

/// Blocking send that gives up once `abort` is raised.
fn send_unless_aborted<T>(tx: &Sender<T>, mut item: T, abort: &AtomicBool, poll: Duration) -> bool {
    loop {
        if abort.load(Ordering::Acquire) {
            return false;
        }
        match tx.send_timeout(item, poll) {
            Ok(())                                 => return true,
            Err(SendTimeoutError::Timeout(back))   => item = back,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// Every raw consumer but the last gets a copy; the last takes the original.
fn fan_out(processors: &[Arc<dyn Processor>], chunk: RawChunk) {
    let mut targets = processors.iter().filter(|p| p.consumes_raw()).peekable();
    while let Some(processor) = targets.next() {
        if targets.peek().is_none() {
            processor.process(chunk);
            return;
        }
        processor.process(chunk.clone());
    }
}
