//! Per-channel capture stream: start/stop state machine and worker loop.
//!
//! ```text
//!   Idle --start()--> Streaming --stop()--> Stopping --joined--> Idle
//! ```
//!
//! The worker repeats: wait for a queued buffer, wait for the next sync
//! edge, transfer one frame, hand the buffer back. A failed frame fails only
//! its buffer; the stream keeps going.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::dma::{DmaBackend, DmaFrameTransfer, WarmupBuffer};
use super::frame::{FormatRequest, FrameGeometry, FrameInfo};
use super::sync::FrameSyncSignal;
use crate::error::{CaptureError, Result};
use crate::hw::{ControlPlane, ExclusiveAccess, HwArbiter};
use crate::pipeline::queue::{BufferSink, BufferState, OutputBufferQueue, PendingBuffer};
use crate::pipeline::stats::{StatsCounters, StatsSnapshot};
use crate::ratelimited;
use crate::utils::RateLimiter;
use crate::CaptureConfig;

/// Fewest buffers a stream is set up with
pub const MIN_BUFFERS: u32 = 4;

/// Runtime-adjustable channel controls. The worker reloads them for every
/// frame, so a new edge timeout applies from the next buffer on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelControls {
    pub test_pattern: bool,
    /// Warm-up frames discarded at start
    pub skip: u32,
    pub vsync_timeout: Duration,
}

impl From<&CaptureConfig> for ChannelControls {
    fn from(cfg: &CaptureConfig) -> Self {
        Self {
            test_pattern: cfg.test_pattern,
            skip: cfg.skip,
            vsync_timeout: Duration::from_millis(cfg.vsync_timeout_ms.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle = 0,
    Streaming = 1,
    Stopping = 2,
}

impl StreamPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => StreamPhase::Streaming,
            2 => StreamPhase::Stopping,
            _ => StreamPhase::Idle,
        }
    }
}

/// Hardware resources assigned to a channel at attach time
#[derive(Debug, Clone)]
pub(crate) struct ChannelParams {
    pub index: usize,
    pub engine: u32,
    pub irq_line: u32,
    pub controls: ChannelControls,
    pub transfer_timeout: Duration,
    pub cpu: Option<usize>,
}

/// State reachable from the worker thread and the event callback.
struct Shared {
    index: usize,
    queue: OutputBufferQueue,
    sync: FrameSyncSignal,
    stats: Arc<StatsCounters>,
    stopping: AtomicBool,
    controls: ArcSwap<ChannelControls>,
}

struct Streaming {
    worker: JoinHandle<()>,
    warmup: Option<WarmupBuffer>,
    access: Option<ExclusiveAccess>,
}

/// Guarded by the channel lock; geometry only changes while idle.
struct ChannelState {
    geometry: FrameGeometry,
    stream: Option<Streaming>,
}

/// One capture stream bound to a DMA engine and a sync event line
pub struct Channel {
    engine: u32,
    irq_line: u32,
    transfer_timeout: Duration,
    cpu: Option<usize>,
    control: Arc<ControlPlane>,
    arbiter: Arc<HwArbiter>,
    backend: Arc<dyn DmaBackend>,
    sink: Arc<dyn BufferSink>,
    xfer: Arc<DmaFrameTransfer>,
    shared: Arc<Shared>,
    phase: AtomicU8,
    state: Mutex<ChannelState>,
}

impl Channel {
    pub(crate) fn new(
        params: ChannelParams,
        control: Arc<ControlPlane>,
        arbiter: Arc<HwArbiter>,
        backend: Arc<dyn DmaBackend>,
        sink: Arc<dyn BufferSink>,
    ) -> Self {
        let stats = Arc::new(StatsCounters::new(params.index));
        let xfer = Arc::new(DmaFrameTransfer::new(
            Arc::clone(&backend),
            params.engine,
            Arc::clone(&stats),
        ));
        let shared = Arc::new(Shared {
            index: params.index,
            queue: OutputBufferQueue::new(),
            sync: FrameSyncSignal::new(Arc::clone(&stats)),
            stats,
            stopping: AtomicBool::new(false),
            controls: ArcSwap::from_pointee(params.controls),
        });

        Self {
            engine: params.engine,
            irq_line: params.irq_line,
            transfer_timeout: params.transfer_timeout,
            cpu: params.cpu,
            control,
            arbiter,
            backend,
            sink,
            xfer,
            shared,
            phase: AtomicU8::new(StreamPhase::Idle as u8),
            state: Mutex::new(ChannelState {
                geometry: FrameGeometry::default(),
                stream: None,
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn engine(&self) -> u32 {
        self.engine
    }

    pub fn irq_line(&self) -> u32 {
        self.irq_line
    }

    pub fn irq_mask(&self) -> u32 {
        1 << self.irq_line
    }

    pub fn phase(&self) -> StreamPhase {
        StreamPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_streaming(&self) -> bool {
        self.phase() != StreamPhase::Idle
    }

    /// Frame-sync edge callback for this channel's event line.
    #[inline]
    pub fn on_edge(&self) {
        self.shared.sync.on_edge();
    }

    pub fn controls(&self) -> ChannelControls {
        ChannelControls::clone(&self.shared.controls.load())
    }

    pub fn set_controls(&self, controls: ChannelControls) {
        debug!(channel = self.index(), ?controls, "controls updated");
        self.shared.controls.store(Arc::new(controls));
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn dump_stats(&self, tag: &str) {
        self.shared.stats.dump(tag);
    }

    pub fn format(&self) -> FrameGeometry {
        self.state.lock().geometry
    }

    pub fn try_format(&self, req: &FormatRequest) -> FrameGeometry {
        req.resolve()
    }

    /// Apply a new format and push it to the FPGA. Rejected while this
    /// channel streams, and on shared registers while another channel does.
    pub fn set_format(&self, req: &FormatRequest) -> Result<FrameGeometry> {
        let mut state = self.state.lock();
        if state.stream.is_some() || self.is_streaming() {
            return Err(CaptureError::Busy);
        }
        if let Some(owner) = self.arbiter.active().filter(|&ch| ch != self.index()) {
            debug!(channel = self.index(), owner, "format registers held by another channel");
            return Err(CaptureError::Busy);
        }

        let geometry = req.resolve();
        state.geometry = geometry;
        self.control.set_format(self.engine, geometry.format)?;
        Ok(geometry)
    }

    /// Buffer count and size for a stream of the current format.
    pub fn queue_setup(&self, requested: u32) -> (u32, usize) {
        (requested.max(MIN_BUFFERS), self.format().size)
    }

    /// Check a buffer can hold one frame and set its payload size.
    pub fn prepare_buffer(&self, buffer: &mut PendingBuffer) -> Result<()> {
        let required = self.format().size;
        let available = buffer.sgt.dma_len();
        if available < required {
            return Err(CaptureError::InvalidBuffer {
                required,
                available,
            });
        }
        buffer.payload = required;
        Ok(())
    }

    /// Hand an empty buffer to the capture queue.
    pub fn queue_buffer(&self, buffer: PendingBuffer) {
        self.shared.queue.push(buffer);
    }

    /// Start streaming. On failure every completed step is undone and queued
    /// buffers are handed back as [`BufferState::Queued`].
    #[instrument(skip(self), fields(channel = self.index()))]
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        // A stop still tearing down leaves the phase at Stopping.
        if state.stream.is_some() || self.is_streaming() {
            return Err(CaptureError::Busy);
        }

        let access = match self.arbiter.acquire(self.index()) {
            Ok(access) => access,
            Err(e) => {
                warn!(active = ?self.arbiter.active(), "shared registers held by another channel");
                self.return_all(true, "start busy");
                return Err(e);
            }
        };

        let shared = &self.shared;
        shared.stopping.store(false, Ordering::SeqCst);
        shared.sync.reset();
        shared.stats.reset();

        let geometry = state.geometry;
        let controls = shared.controls.load_full();

        if let Err(e) = self.backend.enable_events(self.irq_mask()) {
            error!(irq = self.irq_line, error = %e, "enable event line failed");
            self.return_all(true, "start failed");
            return Err(e.into());
        }

        if let Err(e) = self
            .control
            .enable(self.engine, geometry.format, controls.test_pattern)
        {
            error!(error = %e, "enable capture failed");
            self.backend.disable_events(self.irq_mask());
            self.return_all(true, "start failed");
            return Err(e);
        }

        let warmup = (controls.skip > 0).then(|| WarmupBuffer::new(geometry.size));
        if let Some(scratch) = &warmup {
            self.warm_up(scratch, controls.skip, controls.vsync_timeout);
        }

        let worker = match self.spawn_worker(geometry) {
            Ok(worker) => worker,
            Err(e) => {
                error!(error = %e, "spawn capture worker failed");
                if let Err(e) = self.control.disable(self.engine) {
                    warn!(error = %e, "disable capture failed");
                }
                drop(warmup);
                self.backend.disable_events(self.irq_mask());
                self.return_all(true, "start failed");
                return Err(e.into());
            }
        };

        state.stream = Some(Streaming {
            worker,
            warmup,
            access,
        });
        self.phase
            .store(StreamPhase::Streaming as u8, Ordering::Release);
        info!(
            engine = self.engine,
            irq = self.irq_line,
            width = geometry.width,
            height = geometry.height,
            format = geometry.format.description(),
            "streaming"
        );
        Ok(())
    }

    /// Stop streaming and wait for the worker to exit. Buffers still queued
    /// are failed back to the owner.
    ///
    /// The channel lock is released before joining, so the sink may call
    /// back into the channel from the worker thread. `start` and
    /// `set_format` see `Stopping` and return `Busy` until teardown ends.
    #[instrument(skip(self), fields(channel = self.index()))]
    pub fn stop(&self) {
        let Streaming {
            worker,
            warmup,
            access,
        } = {
            let mut state = self.state.lock();
            let Some(stream) = state.stream.take() else {
                return;
            };
            self.phase
                .store(StreamPhase::Stopping as u8, Ordering::Release);
            stream
        };

        // Both suspension points must observe the flag.
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.queue.wake();
        self.shared.sync.wake();
        if worker.join().is_err() {
            error!("capture worker panicked");
        }

        self.backend.disable_events(self.irq_mask());
        if let Err(e) = self.control.disable(self.engine) {
            warn!(error = %e, "disable capture failed");
        }
        drop(warmup);
        self.return_all(false, "streamoff");
        drop(access);

        self.phase.store(StreamPhase::Idle as u8, Ordering::Release);
        self.shared.stats.dump("streamoff");
    }

    /// Hand every queued buffer back, either for requeue (start never got
    /// going) or failed (stream stopped).
    fn return_all(&self, requeue: bool, reason: &str) {
        for buffer in self.shared.queue.drain_all(reason) {
            let state = if requeue {
                BufferState::Queued
            } else {
                BufferState::Error(CaptureError::Cancelled)
            };
            self.sink.buffer_done(self.index(), buffer, state);
        }
    }

    /// Discard `frames` frames into scratch memory. Failures end the warm-up
    /// early but never fail the start.
    fn warm_up(&self, scratch: &WarmupBuffer, frames: u32, timeout: Duration) {
        let shared = &self.shared;
        let mut seen = shared.sync.current();
        let mut limiter = RateLimiter::default();

        for frame in 0..frames {
            if let Err(e) = shared
                .sync
                .wait_for_next_edge(&mut seen, &shared.stopping, timeout)
            {
                ratelimited!(limiter, warn, frame, error = %e, "warm-up sync wait failed");
                return;
            }
            if let Err(e) = self.xfer.submit_scratch(scratch, self.transfer_timeout) {
                ratelimited!(limiter, warn, frame, error = %e, "warm-up transfer failed");
                return;
            }
        }
        debug!(frames, "warm-up complete");
    }

    fn spawn_worker(&self, geometry: FrameGeometry) -> std::io::Result<JoinHandle<()>> {
        let worker = Worker {
            shared: Arc::clone(&self.shared),
            xfer: Arc::clone(&self.xfer),
            sink: Arc::clone(&self.sink),
            frame_size: geometry.size,
            transfer_timeout: self.transfer_timeout,
            cpu: self.cpu,
        };
        thread::Builder::new()
            .name(format!("vidcap-cap{}", self.index()))
            .spawn(move || worker.run())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("index", &self.index())
            .field("engine", &self.engine)
            .field("irq_line", &self.irq_line)
            .field("phase", &self.phase())
            .finish()
    }
}

struct Worker {
    shared: Arc<Shared>,
    xfer: Arc<DmaFrameTransfer>,
    sink: Arc<dyn BufferSink>,
    frame_size: usize,
    transfer_timeout: Duration,
    cpu: Option<usize>,
}

impl Worker {
    fn run(self) {
        let shared = &*self.shared;
        let channel = shared.index;

        if let Some(id) = self.cpu {
            if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
                warn!(channel, cpu = id, "could not pin capture worker");
            }
        }

        // Sequence numbers count delivered frames only.
        let mut sequence = 0u64;
        let mut seen = shared.sync.current();
        let mut limiter = RateLimiter::default();
        debug!(channel, frame_size = self.frame_size, "capture worker running");

        while shared.queue.wait_ready(&shared.stopping) {
            let Some(mut buffer) = shared.queue.pop_nonblocking() else {
                continue;
            };

            let timeout = shared.controls.load().vsync_timeout;
            let result = shared
                .sync
                .wait_for_next_edge(&mut seen, &shared.stopping, timeout)
                .and_then(|()| {
                    self.xfer
                        .submit_frame(&mut buffer.sgt, self.frame_size, self.transfer_timeout)
                });

            match result {
                Ok(_) => {
                    let info = FrameInfo {
                        sequence,
                        timestamp: Instant::now(),
                        bytes_used: self.frame_size,
                    };
                    sequence += 1;
                    self.sink
                        .buffer_done(channel, buffer, BufferState::Done(info));
                }
                Err(e) => {
                    match &e {
                        CaptureError::Cancelled => debug!(channel, "frame cancelled by stop"),
                        CaptureError::Fault(what) => {
                            error!(channel, index = buffer.index, "capture fault: {what}")
                        }
                        CaptureError::Timeout => {
                            ratelimited!(limiter, error, channel, "vsync timeout")
                        }
                        _ => ratelimited!(limiter, error, channel, error = %e, "capture error"),
                    }
                    self.sink.buffer_done(channel, buffer, BufferState::Error(e));
                }
            }
        }

        debug!(channel, delivered = sequence, "capture worker exiting");
    }
}
