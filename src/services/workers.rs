//! Bounded worker pool feeding the ingestion pipeline.
//!
//! The transport pushes payloads into a bounded channel; a fixed set of named
//! threads drain it. A full queue blocks the producer.

use crate::ingest::pipeline::IngestPipeline;
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

// How long a submit waits before noting back-pressure in the log.
const QUEUE_FULL_WARN_AFTER: Duration = Duration::from_millis(500);

pub struct WorkerPool {
    tx: Sender<Vec<u8>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        pipeline: Arc<IngestPipeline>,
        workers: NonZeroUsize,
        queue_capacity: NonZeroUsize,
    ) -> Result<Self, String> {
        let (tx, rx) = bounded::<Vec<u8>>(queue_capacity.get());
        let mut handles = Vec::with_capacity(workers.get());
        for index in 0..workers.get() {
            let rx = rx.clone();
            let pipeline = pipeline.clone();
            let handle = thread::Builder::new()
                .name(format!("ingest-worker-{index}"))
                .spawn(move || worker_loop(index, rx, pipeline))
                .map_err(|e| format!("spawning ingest worker {} failed: {}", index, e))?;
            handles.push(handle);
        }
        info!(
            "Started {} ingest worker(s), queue capacity {}",
            workers.get(),
            queue_capacity.get()
        );
        Ok(WorkerPool { tx, handles })
    }

    /// Queue a payload, blocking while the queue is full.
    pub fn submit(&self, payload: Vec<u8>) -> Result<(), String> {
        match self.tx.send_timeout(payload, QUEUE_FULL_WARN_AFTER) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(payload)) => {
                warn!(
                    "Ingest queue full ({} pending); waiting for a free worker",
                    self.tx.len()
                );
                self.tx
                    .send(payload)
                    .map_err(|_| "all ingest workers have exited".to_string())
            }
            Err(SendTimeoutError::Disconnected(_)) => Err("all ingest workers have exited".to_string()),
        }
    }

    pub fn pending(&self) -> usize {
        self.tx.len()
    }

    /// Stop accepting work, let the workers drain the queue, and wait for them.
    pub fn shutdown(self) {
        let WorkerPool { tx, handles } = self;
        drop(tx);
        for handle in handles {
            let name = handle.thread().name().unwrap_or("ingest-worker").to_string();
            if handle.join().is_err() {
                error!("{} terminated abnormally", name);
            }
        }
    }
}

fn worker_loop(index: usize, rx: Receiver<Vec<u8>>, pipeline: Arc<IngestPipeline>) {
    debug!("ingest-worker-{} ready", index);
    for payload in rx.iter() {
        let result = panic::catch_unwind(AssertUnwindSafe(|| pipeline.handle(&payload)));
        if result.is_err() {
            pipeline.record_panic();
            error!(
                "ingest-worker-{} recovered from a panic while handling a {}-byte message",
                index,
                payload.len()
            );
        }
    }
    debug!("ingest-worker-{} exiting", index);
}
