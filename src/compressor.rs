//! Regroups raw reads into fixed-size chunks and compresses them on a
//! thread pool while keeping their order.
//!
//! The output queue carries [`PendingChunk`] handles in dispatch order, not
//! results. A consumer that takes handles in FIFO order and waits on each one
//! sees chunks in stream order no matter which worker finishes first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error};

use crate::codec::{compress_chunk, CodecError, CompressedChunk, CompressionLevel};
use crate::pipeline::ImagingError;
use crate::processor::{send_while, Intake, IntakeQueue, Processor, WorkerCore};
use crate::reader::RawChunk;

// ── Ordered task handle ─────────────────────────────────────────────────────

/// Result slot of one compression task.
pub struct PendingChunk {
    rx: Receiver<Result<CompressedChunk, CodecError>>,
}

impl PendingChunk {
    fn slot() -> (Sender<Result<CompressedChunk, CodecError>>, Self) {
        let (tx, rx) = channel::bounded(1);
        (tx, Self { rx })
    }

    /// A handle that is already complete.
    pub fn ready(chunk: CompressedChunk) -> Self {
        let (tx, pending) = Self::slot();
        let _ = tx.send(Ok(chunk));
        pending
    }

    /// `Ok(None)` if the task is still running after `timeout`. The result
    /// can be taken only once.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<CompressedChunk>, CodecError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result)                          => result.map(Some),
            Err(RecvTimeoutError::Timeout)      => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(CodecError::TaskLost),
        }
    }

    pub fn wait(self) -> Result<CompressedChunk, CodecError> {
        self.rx.recv().map_err(|_| CodecError::TaskLost)?
    }
}

// ── Regrouping ──────────────────────────────────────────────────────────────

/// Turns arbitrarily sized buffers into `chunk_size` pieces. Every piece
/// except the one produced by `flush` is exactly `chunk_size` long.
pub struct ChunkRegrouper {
    chunk_size: usize,
    buf:        Vec<u8>,
}

impl ChunkRegrouper {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size, buf: Vec::with_capacity(chunk_size) }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn push(&mut self, mut data: &[u8], mut emit: impl FnMut(Vec<u8>)) {
        if !self.buf.is_empty() {
            let room = self.chunk_size - self.buf.len();
            if data.len() < room {
                self.buf.extend_from_slice(data);
                return;
            }
            self.buf.extend_from_slice(&data[..room]);
            data = &data[room..];
            emit(std::mem::replace(&mut self.buf, Vec::with_capacity(self.chunk_size)));
        }
        let mut pieces = data.chunks_exact(self.chunk_size);
        for piece in &mut pieces {
            emit(piece.to_vec());
        }
        self.buf.extend_from_slice(pieces.remainder());
    }

    pub fn flush(&mut self, mut emit: impl FnMut(Vec<u8>)) {
        if !self.buf.is_empty() {
            emit(std::mem::take(&mut self.buf));
        }
    }
}

// ── Processor ───────────────────────────────────────────────────────────────

/// Queue one compression task and hand its handle to the output queue.
fn dispatch(
    pool:    &ThreadPool,
    output:  &Sender<PendingChunk>,
    raw:     Vec<u8>,
    level:   CompressionLevel,
    running: &AtomicBool,
    poll:    Duration,
) -> bool {
    let (tx, pending) = PendingChunk::slot();
    pool.spawn(move || {
        let result = compress_chunk(&raw, level);
        if let Err(e) = &result {
            error!(error = %e, "chunk compression failed");
        }
        let _ = tx.send(result);
    });
    send_while(output, pending, running, poll)
}

pub struct ChunkedCompressor {
    core:       WorkerCore,
    intake:     IntakeQueue,
    output_tx:  Mutex<Option<Sender<PendingChunk>>>,
    output_rx:  Receiver<PendingChunk>,
    chunk_size: usize,
    level:      CompressionLevel,
    workers:    usize,
    finished:   AtomicBool,
    poll:       Duration,
}

impl ChunkedCompressor {
    pub fn new(
        chunk_size:  usize,
        level:       CompressionLevel,
        workers:     usize,
        queue_depth: usize,
        poll:        Duration,
    ) -> Self {
        let (tx, rx) = channel::bounded(queue_depth.max(1));
        Self {
            core: WorkerCore::new("chunk-compressor"),
            intake: IntakeQueue::bounded(queue_depth),
            output_tx: Mutex::new(Some(tx)),
            output_rx: rx,
            chunk_size,
            level,
            workers: workers.max(1),
            finished: AtomicBool::new(false),
            poll,
        }
    }

    /// Ordered queue of task handles for the container writer.
    pub fn output(&self) -> Receiver<PendingChunk> {
        self.output_rx.clone()
    }
}

impl Processor for ChunkedCompressor {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn initialize(&self) -> Result<(), ImagingError> {
        let output = self
            .output_tx
            .lock()
            .take()
            .ok_or_else(|| ImagingError::Setup("chunk compressor already initialized".into()))?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("compress-{i}"))
            .build()
            .map_err(|e| ImagingError::Setup(format!("cannot build compression pool: {e}")))?;
        let rx      = self.intake.receiver();
        let running = self.core.running();
        let level   = self.level;
        let poll    = self.poll;
        let mut regrouper = ChunkRegrouper::new(self.chunk_size);

        self.core.spawn(move || {
            let mut dispatched: u64 = 0;
            loop {
                if !running.load(Ordering::Acquire) {
                    debug!(dispatched, "compressor cancelled");
                    return;
                }
                match rx.recv_timeout(poll) {
                    Ok(Intake::Data(chunk)) => {
                        let mut ok = true;
                        regrouper.push(&chunk.data, |raw| {
                            dispatched += 1;
                            ok &= dispatch(&pool, &output, raw, level, &running, poll);
                        });
                        if !ok {
                            return;
                        }
                    }
                    Ok(Intake::Finish) => {
                        regrouper.flush(|raw| {
                            dispatched += 1;
                            dispatch(&pool, &output, raw, level, &running, poll);
                        });
                        send_while(&output, PendingChunk::ready(CompressedChunk::end_of_stream()), &running, poll);
                        debug!(dispatched, "compressor drained");
                        return;
                    }
                    Err(RecvTimeoutError::Timeout)      => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
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
    use crate::codec::decompress_chunk;
    use proptest::prelude::*;

    #[test]
    fn handles_resolve_in_dispatch_order() {
        let (slow_tx, slow) = PendingChunk::slot();
        let fast = PendingChunk::ready(CompressedChunk::end_of_stream());
        assert!(fast.wait_timeout(Duration::from_millis(1)).unwrap().is_some());
        assert!(slow.wait_timeout(Duration::from_millis(1)).unwrap().is_none());
        slow_tx.send(compress_chunk(b"late", CompressionLevel::None)).unwrap();
        assert_eq!(slow.wait().unwrap().original_size, 4);
    }

    #[test]
    fn dropped_task_is_reported() {
        let (tx, pending) = PendingChunk::slot();
        drop(tx);
        assert!(matches!(pending.wait_timeout(Duration::from_millis(1)), Err(CodecError::TaskLost)));
    }

    #[test]
    fn regroups_into_full_chunks() {
        let mut regrouper = ChunkRegrouper::new(8);
        let mut out: Vec<Vec<u8>> = Vec::new();
        regrouper.push(&[1; 3], |c| out.push(c));
        assert!(out.is_empty());
        regrouper.push(&[2; 20], |c| out.push(c));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], [1, 1, 1, 2, 2, 2, 2, 2]);
        assert_eq!(regrouper.buffered(), 7);
        regrouper.flush(|c| out.push(c));
        assert_eq!(out[2].len(), 7);
        regrouper.flush(|c| out.push(c));
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn compressor_preserves_order_across_workers() {
        let chunk_size = 4096;
        let compressor = ChunkedCompressor::new(chunk_size, CompressionLevel::Best, 4, 8, Duration::from_millis(5));
        let output = compressor.output();
        compressor.initialize().unwrap();

        let input: Vec<u8> = (0..chunk_size * 37 + 100).map(|i| (i % 251) as u8 ^ (i / 4096) as u8).collect();
        let consumer = std::thread::spawn(move || {
            let mut rebuilt = Vec::new();
            loop {
                let chunk = output.recv().unwrap().wait().unwrap();
                if chunk.is_end_of_stream() {
                    return rebuilt;
                }
                rebuilt.extend(decompress_chunk(&chunk.data, chunk.compressed).unwrap());
            }
        });
        for (i, piece) in input.chunks(3000).enumerate() {
            compressor.process(RawChunk { offset: (i * 3000) as u64, data: piece.to_vec() });
        }
        compressor.finish();
        compressor.wait_for_exit();
        assert!(consumer.join().unwrap() == input);
    }

    #[test]
    fn slowest_first_chunk_still_comes_out_first() {
        const MIB: usize = 1 << 20;
        let compressor = ChunkedCompressor::new(MIB, CompressionLevel::Best, 8, 32, Duration::from_millis(5));
        let output = compressor.output();
        compressor.initialize().unwrap();

        // Incompressible lead chunk followed by chunks that deflate almost instantly.
        let mut state = 0x9E37_79B9_7F4A_7C15u64;
        let mut input: Vec<u8> = (0..MIB)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        input.resize(21 * MIB, 0);

        let consumer = std::thread::spawn(move || {
            let mut rebuilt = Vec::new();
            let mut flags = Vec::new();
            loop {
                let chunk = output.recv().unwrap().wait().unwrap();
                if chunk.is_end_of_stream() {
                    return (rebuilt, flags);
                }
                flags.push(chunk.compressed);
                rebuilt.extend(decompress_chunk(&chunk.data, chunk.compressed).unwrap());
            }
        });
        for (i, piece) in input.chunks(128 * 1024).enumerate() {
            compressor.process(RawChunk { offset: (i * 128 * 1024) as u64, data: piece.to_vec() });
        }
        compressor.finish();
        compressor.wait_for_exit();

        let (rebuilt, flags) = consumer.join().unwrap();
        assert_eq!(flags.len(), 21);
        assert!(!flags[0]);
        assert!(flags[1..].iter().all(|&c| c));
        assert!(rebuilt == input);
    }

    proptest! {
        #[test]
        fn regrouping_is_lossless(sizes in proptest::collection::vec(0usize..3000, 0..40), chunk in 1usize..1024) {
            let mut regrouper = ChunkRegrouper::new(chunk);
            let mut input = Vec::new();
            let mut out: Vec<Vec<u8>> = Vec::new();
            for (i, size) in sizes.iter().enumerate() {
                let piece: Vec<u8> = (0..*size).map(|j| (i * 31 + j) as u8).collect();
                input.extend_from_slice(&piece);
                regrouper.push(&piece, |c| out.push(c));
            }
            regrouper.flush(|c| out.push(c));
            if let Some((last, full)) = out.split_last() {
                prop_assert!(full.iter().all(|c| c.len() == chunk));
                prop_assert!(!last.is_empty() && last.len() <= chunk);
            }
            prop_assert_eq!(out.concat(), input);
        }
    }
}
