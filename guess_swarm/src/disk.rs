//! Offloads trailer I/O bursts onto a worker pool so the event loop thread
//! never blocks on disk (see CONCURRENCY & RESOURCE MODEL). Mirrors the
//! disk manager's `Sink`/`Stream` split over a `CpuPool`: callers push
//! `ITrailerMessage`s in, and drain completions as `OTrailerMessage`s.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::sync::mpsc::{self, Receiver, Sender};
use futures::{Async, AsyncSink, Poll, Sink, StartSend, Stream};
use futures_cpupool::{Builder, CpuPool};

use crate::trailer::Trailer;

/// Messages accepted by the `TrailerManager`.
#[derive(Debug)]
pub enum ITrailerMessage {
    /// Flush `trailer` to the file at `path`.
    Flush { path: PathBuf, trailer: Trailer },
}

/// Messages emitted by the `TrailerManager`.
#[derive(Debug)]
pub enum OTrailerMessage {
    /// `path`'s trailer was flushed successfully.
    Flushed { path: PathBuf },
    /// `path`'s trailer failed to flush; `reason` is the error's rendering
    /// (the error type itself isn't `Send` across the pool boundary).
    FlushFailed { path: PathBuf, reason: String },
}

/// Bounds how many flushes may be outstanding on the pool at once, so a
/// burst of dirty `FileInfo`s can't starve the pool's queue indefinitely.
#[derive(Clone)]
struct Context {
    out_send: Sender<OTrailerMessage>,
    max_concurrent: usize,
    in_flight: Arc<AtomicUsize>,
}

impl Context {
    fn can_submit_work(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) < self.max_concurrent
    }
}

/// Runs trailer flushes on a `CpuPool`, keeping the event loop thread free.
pub struct TrailerManager {
    pool: CpuPool,
    context: Context,
    stream: Receiver<OTrailerMessage>,
}

pub(crate) const DEFAULT_MAX_CONCURRENT: usize = 4;
pub(crate) const DEFAULT_COMPLETED_BUFFER: usize = 16;

impl TrailerManager {
    pub fn new() -> TrailerManager {
        TrailerManager::with_worker_config(Builder::new(), DEFAULT_MAX_CONCURRENT)
    }

    pub fn with_worker_config(mut builder: Builder, max_concurrent: usize) -> TrailerManager {
        let (out_send, out_recv) = mpsc::channel(DEFAULT_COMPLETED_BUFFER);

        TrailerManager {
            pool: builder.create(),
            context: Context {
                out_send,
                max_concurrent,
                in_flight: Arc::new(AtomicUsize::new(0)),
            },
            stream: out_recv,
        }
    }

    /// Build a manager whose concurrency cap and completion buffer are
    /// driven by a `SwarmConfig` rather than the built-in defaults.
    pub fn with_config(mut builder: Builder, config: &crate::config::SwarmConfig) -> TrailerManager {
        let (out_send, out_recv) = mpsc::channel(config.completed_buffer_size);

        TrailerManager {
            pool: builder.create(),
            context: Context {
                out_send,
                max_concurrent: config.max_concurrent_flushes,
                in_flight: Arc::new(AtomicUsize::new(0)),
            },
            stream: out_recv,
        }
    }

    /// Submit a flush if the pool has room; returns `false` if the caller
    /// should retry later (mirrors `DiskManagerSink::start_send`'s
    /// `AsyncSink::NotReady`).
    pub fn submit(&mut self, message: ITrailerMessage) -> bool {
        if !self.context.can_submit_work() {
            return false;
        }

        self.context.in_flight.fetch_add(1, Ordering::SeqCst);
        execute_on_pool(message, &self.pool, self.context.clone());
        true
    }

    /// Drain one completed flush, if any are ready.
    pub fn poll(&mut self) -> Poll<Option<OTrailerMessage>, ()> {
        self.stream.poll()
    }
}

impl Sink for TrailerManager {
    type SinkItem = ITrailerMessage;
    type SinkError = ();

    fn start_send(&mut self, item: ITrailerMessage) -> StartSend<ITrailerMessage, ()> {
        if self.submit(item) {
            Ok(AsyncSink::Ready)
        } else {
            Err(())
        }
    }

    fn poll_complete(&mut self) -> Poll<(), ()> {
        Ok(Async::Ready(()))
    }
}

impl Stream for TrailerManager {
    type Item = OTrailerMessage;
    type Error = ();

    fn poll(&mut self) -> Poll<Option<OTrailerMessage>, ()> {
        TrailerManager::poll(self)
    }
}

fn execute_on_pool(message: ITrailerMessage, pool: &CpuPool, context: Context) {
    pool.spawn_fn(move || -> Result<(), ()> {
        let out_message = match message {
            ITrailerMessage::Flush { path, trailer } => match trailer.write_to(&path) {
                Ok(()) => OTrailerMessage::Flushed { path },
                Err(error) => OTrailerMessage::FlushFailed {
                    path,
                    reason: error.to_string(),
                },
            },
        };

        context.in_flight.fetch_sub(1, Ordering::SeqCst);
        let _ = context.out_send.clone().try_send(out_message);

        Ok(())
    });
}
