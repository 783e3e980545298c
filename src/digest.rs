//! Streaming MD5 / SHA-1 over the raw byte stream.
//!
//! Each [`StreamDigest`] folds buffers on its own thread and publishes the
//! final value once through a [`DigestFuture`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use thiserror::Error;
use tracing::{debug, error};

use crate::pipeline::ImagingError;
use crate::processor::{Intake, IntakeQueue, Processor, WorkerCore};
use crate::reader::RawChunk;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DigestError {
    #[error("Timed out after {0:?} waiting for the {1} digest")]
    TimedOut(Duration, &'static str),
    #[error("The {0} digest was abandoned before it was finalized")]
    Abandoned(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
}

impl DigestAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::Md5  => "MD5",
            DigestAlgorithm::Sha1 => "SHA1",
        }
    }

    pub fn hasher(self) -> StreamHasher {
        match self {
            DigestAlgorithm::Md5  => StreamHasher::Md5(Md5::new()),
            DigestAlgorithm::Sha1 => StreamHasher::Sha1(Sha1::new()),
        }
    }
}

/// Running hash state.
#[derive(Clone)]
pub enum StreamHasher {
    Md5(Md5),
    Sha1(Sha1),
}

impl StreamHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            StreamHasher::Md5(h)  => h.update(data),
            StreamHasher::Sha1(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            StreamHasher::Md5(h)  => h.finalize().to_vec(),
            StreamHasher::Sha1(h) => h.finalize().to_vec(),
        }
    }
}

// ── One-shot value ──────────────────────────────────────────────────────────

struct DigestSlot {
    algorithm: DigestAlgorithm,
    rx:        Receiver<Vec<u8>>,
    value:     OnceLock<Vec<u8>>,
}

/// Handle to a digest that may not be computed yet. Cheap to clone.
#[derive(Clone)]
pub struct DigestFuture {
    slot: Arc<DigestSlot>,
}

impl DigestFuture {
    fn pair(algorithm: DigestAlgorithm) -> (Sender<Vec<u8>>, Self) {
        let (tx, rx) = channel::bounded(1);
        (tx, Self { slot: Arc::new(DigestSlot { algorithm, rx, value: OnceLock::new() }) })
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.slot.algorithm
    }

    /// The value if it has already been received.
    pub fn get(&self) -> Option<&[u8]> {
        self.slot.value.get().map(Vec::as_slice)
    }

    /// Block up to `timeout` for the final value. Once received, every later
    /// call returns the same bytes immediately.
    pub fn wait(&self, timeout: Duration) -> Result<Vec<u8>, DigestError> {
        if let Some(value) = self.slot.value.get() {
            return Ok(value.clone());
        }
        let name = self.slot.algorithm.name();
        match self.slot.rx.recv_timeout(timeout) {
            Ok(value) => Ok(self.slot.value.get_or_init(|| value).clone()),
            // Another waiter may have taken the value meanwhile.
            Err(RecvTimeoutError::Timeout) => {
                self.slot.value.get().cloned().ok_or(DigestError::TimedOut(timeout, name))
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.slot.value.get().cloned().ok_or(DigestError::Abandoned(name))
            }
        }
    }
}

// ── Processor ───────────────────────────────────────────────────────────────

pub struct StreamDigest {
    core:      WorkerCore,
    algorithm: DigestAlgorithm,
    intake:    IntakeQueue,
    result_tx: Mutex<Option<Sender<Vec<u8>>>>,
    future:    DigestFuture,
    finished:  AtomicBool,
    poll:      Duration,
}

impl StreamDigest {
    pub fn new(algorithm: DigestAlgorithm, queue_depth: usize, poll: Duration) -> Self {
        let (tx, future) = DigestFuture::pair(algorithm);
        Self {
            core: WorkerCore::new(format!("digest-{}", algorithm.name().to_lowercase())),
            algorithm,
            intake: IntakeQueue::bounded(queue_depth),
            result_tx: Mutex::new(Some(tx)),
            future,
            finished: AtomicBool::new(false),
            poll,
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn future(&self) -> DigestFuture {
        self.future.clone()
    }
}

impl Processor for StreamDigest {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn initialize(&self) -> Result<(), ImagingError> {
        let tx = self
            .result_tx
            .lock()
            .take()
            .ok_or_else(|| ImagingError::Setup(format!("{} already initialized", self.core.name())))?;
        let rx        = self.intake.receiver();
        let running   = self.core.running();
        let algorithm = self.algorithm;
        let poll      = self.poll;

        self.core.spawn(move || {
            let mut hasher = algorithm.hasher();
            let mut total: u64 = 0;
            while running.load(Ordering::Acquire) {
                match rx.recv_timeout(poll) {
                    Ok(Intake::Data(chunk)) => {
                        total += chunk.data.len() as u64;
                        hasher.update(&chunk.data);
                    }
                    Ok(Intake::Finish) => {
                        let value = hasher.finalize();
                        debug!(algorithm = algorithm.name(), bytes = total, digest = %hex::encode(&value), "digest finalized");
                        if tx.send(value).is_err() {
                            error!(algorithm = algorithm.name(), "digest result dropped, nobody is waiting");
                        }
                        return;
                    }
                    Err(RecvTimeoutError::Timeout)      => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            debug!(algorithm = algorithm.name(), "digest cancelled");
        })
    }

    fn process(&self, chunk: RawChunk) {
        let running = self.core.running();
        self.intake.push(Intake::Data(chunk), &running, self.poll);
    }

    fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let running = self.core.running();
        self.intake.push(Intake::Finish, &running, self.poll);
    }

    fn wait_for_exit(&self) {
        self.core.join();
    }

    fn cancel(&self) {
        self.core.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(algorithm: DigestAlgorithm, parts: &[&[u8]]) -> StreamDigest {
        let digest = StreamDigest::new(algorithm, 4, Duration::from_millis(10));
        digest.initialize().unwrap();
        let mut offset = 0;
        for part in parts {
            digest.process(RawChunk { offset, data: part.to_vec() });
            offset += part.len() as u64;
        }
        digest.finish();
        digest.wait_for_exit();
        digest
    }

    #[test]
    fn md5_of_split_stream() {
        let digest = run(DigestAlgorithm::Md5, &[b"The quick brown fox ", b"jumps over the lazy dog"]);
        let value = digest.future().wait(Duration::from_secs(1)).unwrap();
        assert_eq!(hex::encode(value), "9e107d9d372bb6826bd81d3542a419d6");
    }

    #[test]
    fn sha1_of_split_stream() {
        let digest = run(DigestAlgorithm::Sha1, &[b"The quick brown fox jumps", b" over the lazy dog"]);
        let value = digest.future().wait(Duration::from_secs(1)).unwrap();
        assert_eq!(hex::encode(value), "2fd4e1c67a2d28fced849ee1bb76e7391b93eb12");
    }

    #[test]
    fn finalize_twice_yields_same_value() {
        let digest = run(DigestAlgorithm::Md5, &[b"abc"]);
        digest.finish();
        let future = digest.future();
        let first  = future.wait(Duration::from_secs(1)).unwrap();
        let second = future.wait(Duration::from_millis(1)).unwrap();
        assert_eq!(first, second);
        assert_eq!(future.get(), Some(first.as_slice()));
        assert_eq!(digest.future().wait(Duration::ZERO).unwrap(), first);
    }

    #[test]
    fn cancelled_digest_is_abandoned() {
        let digest = StreamDigest::new(DigestAlgorithm::Sha1, 4, Duration::from_millis(5));
        digest.initialize().unwrap();
        digest.process(RawChunk { offset: 0, data: vec![1, 2, 3] });
        digest.cancel();
        digest.cancel();
        assert_eq!(
            digest.future().wait(Duration::from_millis(50)),
            Err(DigestError::Abandoned("SHA1"))
        );
    }

    #[test]
    fn unfinished_digest_times_out() {
        let digest = StreamDigest::new(DigestAlgorithm::Md5, 4, Duration::from_millis(5));
        digest.initialize().unwrap();
        assert!(matches!(
            digest.future().wait(Duration::from_millis(20)),
            Err(DigestError::TimedOut(_, "MD5"))
        ));
        digest.cancel();
    }
}
