//! Lifecycle shared by every consumer of the raw byte stream.
//!
//! The orchestrator drives each processor through `initialize`, any number of
//! `process` calls in arrival order, one `finish`, then `wait_for_exit`.
//! `cancel` may arrive from any thread at any point and must be idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::error;

use crate::pipeline::ImagingError;
use crate::reader::RawChunk;

pub trait Processor: Send + Sync {
    fn name(&self) -> &str;
    fn initialize(&self) -> Result<(), ImagingError>;
    /// Takes ownership of the buffer; each processor gets its own copy.
    fn process(&self, chunk: RawChunk);
    /// False for processors fed from another processor instead of the
    /// device stream.
    fn consumes_raw(&self) -> bool {
        true
    }
    fn finish(&self);
    fn wait_for_exit(&self);
    fn cancel(&self);
}

/// What a processor's worker thread receives.
#[derive(Debug)]
pub enum Intake {
    Data(RawChunk),
    Finish,
}

/// Thread bookkeeping and the shared run flag for one processor.
pub struct WorkerCore {
    name:    String,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name:    name.into(),
            running: Arc::new(AtomicBool::new(true)),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn spawn<F>(&self, body: F) -> Result<(), ImagingError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(body)
            .map_err(|e| ImagingError::Setup(format!("cannot start {} worker: {e}", self.name)))?;
        self.threads.lock().push(handle);
        Ok(())
    }

    /// Block until every spawned thread has returned. The lock is held
    /// throughout, so a second caller only returns once the first is done.
    pub fn join(&self) {
        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            if handle.join().is_err() {
                error!(worker = %self.name, "worker thread panicked");
            }
        }
    }

    /// Ask the worker loop to exit at its next poll, then wait for it.
    pub fn cancel(&self) {
        self.running.store(false, Ordering::Release);
        self.join();
    }
}

/// Bounded intake queue owned by one processor.
pub struct IntakeQueue {
    tx: Sender<Intake>,
    rx: Receiver<Intake>,
}

impl IntakeQueue {
    pub fn bounded(depth: usize) -> Self {
        let (tx, rx) = channel::bounded(depth.max(1));
        Self { tx, rx }
    }

    pub fn receiver(&self) -> Receiver<Intake> {
        self.rx.clone()
    }

    /// Blocks while the queue is full, giving up once `running` clears.
    pub fn push(&self, item: Intake, running: &AtomicBool, poll: Duration) -> bool {
        send_while(&self.tx, item, running, poll)
    }
}

/// Send with backpressure, re-checking `running` every `poll`. Returns false
/// if the item was dropped because the worker stopped or the receiver went
/// away.
pub fn send_while<T>(tx: &Sender<T>, mut item: T, running: &AtomicBool, poll: Duration) -> bool {
    loop {
        if !running.load(Ordering::Acquire) {
            return false;
        }
        match tx.send_timeout(item, poll) {
            Ok(())                                   => return true,
            Err(SendTimeoutError::Timeout(back))     => item = back,
            Err(SendTimeoutError::Disconnected(_))   => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cancel_stops_a_polling_worker() {
        let core = WorkerCore::new("poller");
        let running = core.running();
        let ticks = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&ticks);
        core.spawn(move || {
            while running.load(Ordering::Acquire) {
                seen.fetch_add(1, Ordering::Relaxed);
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();
        thread::sleep(Duration::from_millis(10));
        core.cancel();
        core.cancel();
        assert!(!core.is_running());
        assert!(ticks.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn cancel_during_join_waits_for_the_worker() {
        let core = Arc::new(WorkerCore::new("slow"));
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        core.spawn(move || {
            thread::sleep(Duration::from_millis(100));
            flag.store(true, Ordering::Release);
        })
        .unwrap();

        let joiner = {
            let core = Arc::clone(&core);
            thread::spawn(move || core.join())
        };
        thread::sleep(Duration::from_millis(10));
        core.cancel();
        assert!(done.load(Ordering::Acquire));
        joiner.join().unwrap();
    }

    #[test]
    fn full_queue_send_gives_up_when_stopped() {
        let queue = IntakeQueue::bounded(1);
        let running = AtomicBool::new(true);
        assert!(queue.push(Intake::Finish, &running, Duration::from_millis(5)));
        running.store(false, Ordering::Release);
        assert!(!queue.push(Intake::Finish, &running, Duration::from_millis(5)));
        assert!(matches!(queue.receiver().try_recv(), Ok(Intake::Finish)));
    }
}
