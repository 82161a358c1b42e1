//! Output buffer queue between the buffer owner and the capture worker

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::capture::dma::SgTable;
use crate::capture::frame::FrameInfo;
use crate::error::CaptureError;

/// Externally owned output buffer. The core only touches the descriptor
/// list, and always restores it before handing the buffer back.
#[derive(Debug)]
pub struct PendingBuffer {
    /// Owner's handle for the underlying memory
    pub index: u32,
    pub sgt: SgTable,
    /// Payload size set by `Channel::prepare_buffer`
    pub payload: usize,
}

impl PendingBuffer {
    pub fn new(index: u32, sgt: SgTable) -> Self {
        Self {
            index,
            sgt,
            payload: 0,
        }
    }
}

/// How a buffer is handed back to its owner
#[derive(Debug)]
pub enum BufferState {
    Done(FrameInfo),
    Error(CaptureError),
    /// Returned unused because streaming never started; the owner may queue it again.
    Queued,
}

/// Completion path back to the buffer owner.
pub trait BufferSink: Send + Sync {
    fn buffer_done(&self, channel: usize, buffer: PendingBuffer, state: BufferState);
}

/// Completion record delivered over a `flume` channel
#[derive(Debug)]
pub struct Completion {
    pub channel: usize,
    pub buffer: PendingBuffer,
    pub state: BufferState,
}

impl BufferSink for flume::Sender<Completion> {
    fn buffer_done(&self, channel: usize, buffer: PendingBuffer, state: BufferState) {
        // A dropped receiver means the owner is gone; the buffer dies with it.
        let _ = self.send(Completion {
            channel,
            buffer,
            state,
        });
    }
}

/// FIFO of buffers waiting to be filled. One short-held lock protects the
/// list; nothing blocks or performs I/O while it is held.
#[derive(Debug, Default)]
pub struct OutputBufferQueue {
    list: Mutex<VecDeque<PendingBuffer>>,
    ready: Condvar,
}

impl OutputBufferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer: append to the tail and wake the worker
    pub fn push(&self, buffer: PendingBuffer) {
        self.list.lock().push_back(buffer);
        self.ready.notify_one();
    }

    /// Consumer: take the head if there is one
    pub fn pop_nonblocking(&self) -> Option<PendingBuffer> {
        self.list.lock().pop_front()
    }

    /// Empty the queue in one step so the caller can return every buffer.
    pub fn drain_all(&self, reason: &str) -> Vec<PendingBuffer> {
        let drained: Vec<_> = self.list.lock().drain(..).collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), reason, "drained output queue");
        }
        drained
    }

    /// Block until a buffer is queued or `stop` is raised. Returns `false`
    /// when stopping.
    pub fn wait_ready(&self, stop: &AtomicBool) -> bool {
        let mut list = self.list.lock();
        self.ready
            .wait_while(&mut list, |l| l.is_empty() && !stop.load(Ordering::SeqCst));
        !stop.load(Ordering::SeqCst)
    }

    /// Wake a waiter so it re-checks its stop flag. Taking the lock orders
    /// the wake after any in-progress predicate check.
    pub fn wake(&self) {
        let _list = self.list.lock();
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }
}
