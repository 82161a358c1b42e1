//! Whole-frame device-to-host transfers into scatter-gather buffers.
//!
//! Output buffers are usually allocated at page granularity, so their
//! descriptor lists describe more bytes than one frame. The FPGA produces
//! exactly one frame per transfer; submitting the full list would leave the
//! engine waiting for bytes that never arrive. Each submission therefore
//! trims the list to the frame size and restores it afterwards.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tracing::trace;

use crate::error::{CaptureError, EngineError, Result};
use crate::pipeline::stats::StatsCounters;

/// One DMA-mapped segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    pub dma_addr: u64,
    pub length: u32,
    pub dma_len: u32,
}

impl SgEntry {
    pub fn new(dma_addr: u64, len: u32) -> Self {
        Self {
            dma_addr,
            length: len,
            dma_len: len,
        }
    }
}

/// Descriptor list of a buffer. `nents` segments are active; the rest are
/// kept so a trimmed table can be restored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SgTable {
    entries: Vec<SgEntry>,
    nents: usize,
}

impl SgTable {
    pub fn new(entries: Vec<SgEntry>) -> Self {
        let nents = entries.len();
        Self { entries, nents }
    }

    /// Describe `len` bytes at `base` as page-sized segments, rounding the
    /// tail up to a whole page like a page-granular allocator does.
    pub fn from_pages(base: u64, len: usize) -> Self {
        Self::with_page_size(base, len, page_size::get())
    }

    pub fn with_page_size(base: u64, len: usize, page: usize) -> Self {
        let pages = len.div_ceil(page);
        let entries = (0..pages)
            .map(|i| SgEntry::new(base + (i * page) as u64, page as u32))
            .collect();
        Self::new(entries)
    }

    /// Active segments
    pub fn entries(&self) -> &[SgEntry] {
        &self.entries[..self.nents]
    }

    pub fn nents(&self) -> usize {
        self.nents
    }

    pub fn orig_nents(&self) -> usize {
        self.entries.len()
    }

    /// Bytes described by the active segments
    pub fn dma_len(&self) -> usize {
        self.entries().iter().map(|e| e.dma_len as usize).sum()
    }

    /// Cap the table at exactly `target` bytes. The returned guard restores
    /// the original layout when dropped.
    fn trim_to(&mut self, target: usize) -> Result<Trimmed<'_>> {
        if target == 0 {
            return Err(CaptureError::Fault("zero-length frame"));
        }

        let active = self.nents;
        let mut remaining = target;
        let mut cut = None;
        for (i, seg) in self.entries[..active].iter().enumerate() {
            let seg_len = seg.dma_len as usize;
            if seg_len >= remaining {
                cut = Some((i, remaining, seg_len != remaining || i + 1 < active));
                break;
            }
            remaining -= seg_len;
        }
        let Some((last, len, applied)) = cut else {
            return Err(CaptureError::Fault("descriptor list shorter than frame"));
        };

        let saved = self.entries[last];
        self.entries[last].length = len as u32;
        self.entries[last].dma_len = len as u32;
        self.nents = last + 1;

        Ok(Trimmed {
            sgt: self,
            orig_nents: active,
            last,
            saved,
            applied,
        })
    }
}

struct Trimmed<'a> {
    sgt: &'a mut SgTable,
    orig_nents: usize,
    last: usize,
    saved: SgEntry,
    applied: bool,
}

impl Deref for Trimmed<'_> {
    type Target = SgTable;

    fn deref(&self) -> &SgTable {
        self.sgt
    }
}

impl Drop for Trimmed<'_> {
    fn drop(&mut self) {
        self.sgt.entries[self.last] = self.saved;
        self.sgt.nents = self.orig_nents;
    }
}

/// Lower DMA driver layer: engine transfers plus the event (user interrupt)
/// lines that carry the frame-sync edge.
pub trait DmaBackend: Send + Sync {
    /// Synchronous card-to-host transfer on `engine`. Returns the number of
    /// bytes moved.
    fn submit_c2h(
        &self,
        engine: u32,
        sgt: &SgTable,
        timeout: Duration,
    ) -> std::result::Result<usize, EngineError>;

    fn enable_events(&self, mask: u32) -> std::result::Result<(), EngineError>;

    fn disable_events(&self, mask: u32);
}

/// Per-channel frame transfer on one engine
pub struct DmaFrameTransfer {
    backend: Arc<dyn DmaBackend>,
    engine: u32,
    stats: Arc<StatsCounters>,
}

impl DmaFrameTransfer {
    pub fn new(backend: Arc<dyn DmaBackend>, engine: u32, stats: Arc<StatsCounters>) -> Self {
        Self {
            backend,
            engine,
            stats,
        }
    }

    pub fn engine(&self) -> u32 {
        self.engine
    }

    /// Transfer one frame of `target_bytes` into the buffer described by
    /// `sgt`. The table is byte-for-byte unchanged when this returns.
    pub fn submit_frame(
        &self,
        sgt: &mut SgTable,
        target_bytes: usize,
        timeout: Duration,
    ) -> Result<usize> {
        let trimmed = sgt.trim_to(target_bytes)?;
        if trimmed.applied {
            self.stats.dma_trim();
        }

        self.stats.dma_submit();
        trace!(engine = self.engine, nents = trimmed.nents(), target_bytes, "submit frame");
        let outcome = self.backend.submit_c2h(self.engine, &trimmed, timeout);
        drop(trimmed);

        match outcome {
            Err(e) => {
                self.stats.dma_error();
                Err(e.into())
            }
            Ok(n) if n < target_bytes => {
                self.stats.dma_short();
                Err(CaptureError::ShortTransfer {
                    expected: target_bytes,
                    actual: n,
                })
            }
            Ok(n) => Ok(n),
        }
    }

    /// Untrimmed, uncounted transfer used for warm-up frames.
    pub fn submit_scratch(&self, scratch: &WarmupBuffer, timeout: Duration) -> Result<usize> {
        Ok(self.backend.submit_c2h(self.engine, &scratch.sgt, timeout)?)
    }
}

/// Scratch frame buffer for discarded warm-up frames
#[derive(Debug)]
pub struct WarmupBuffer {
    mem: BytesMut,
    sgt: SgTable,
}

impl WarmupBuffer {
    pub fn new(size: usize) -> Self {
        let mem = BytesMut::zeroed(size);
        let sgt = SgTable::new(vec![SgEntry::new(mem.as_ptr() as u64, size as u32)]);
        Self { mem, sgt }
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDma, TransferOutcome};

    const PAGE: usize = 4096;

    fn transfer(dma: &Arc<SimDma>) -> (DmaFrameTransfer, Arc<StatsCounters>) {
        let stats = Arc::new(StatsCounters::new(0));
        (
            DmaFrameTransfer::new(dma.clone(), 2, stats.clone()),
            stats,
        )
    }

    #[test]
    fn page_rounded_table_is_trimmed_and_restored() {
        let dma = Arc::new(SimDma::new());
        let (xfer, stats) = transfer(&dma);
        let frame = 10_000;
        let mut sgt = SgTable::with_page_size(0x10_0000, frame + 5000, PAGE);
        let before = sgt.clone();
        assert_eq!(sgt.nents(), 4);

        assert_eq!(xfer.submit_frame(&mut sgt, frame, Duration::from_secs(1)).unwrap(), frame);
        assert_eq!(sgt, before);

        let calls = dma.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].engine, 2);
        let seen = &calls[0].entries;
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2].length, (frame - 2 * PAGE) as u32);
        assert_eq!(seen[2].dma_len, (frame - 2 * PAGE) as u32);
        assert_eq!(seen.iter().map(|e| e.dma_len as usize).sum::<usize>(), frame);

        let s = stats.snapshot();
        assert_eq!((s.dma_submit, s.dma_trim), (1, 1));
    }

    #[test]
    fn exact_table_is_not_counted_as_trim() {
        let dma = Arc::new(SimDma::new());
        let (xfer, stats) = transfer(&dma);
        let mut sgt = SgTable::with_page_size(0, 2 * PAGE, PAGE);
        xfer.submit_frame(&mut sgt, 2 * PAGE, Duration::from_secs(1)).unwrap();
        assert_eq!(stats.snapshot().dma_trim, 0);
        assert_eq!(dma.calls()[0].entries.len(), 2);
    }

    #[test]
    fn cut_on_segment_boundary_drops_tail() {
        let dma = Arc::new(SimDma::new());
        let (xfer, stats) = transfer(&dma);
        let mut sgt = SgTable::with_page_size(0, 3 * PAGE, PAGE);
        xfer.submit_frame(&mut sgt, PAGE, Duration::from_secs(1)).unwrap();
        assert_eq!(dma.calls()[0].entries.len(), 1);
        assert_eq!(stats.snapshot().dma_trim, 1);
        assert_eq!(sgt.nents(), 3);
    }

    #[test]
    fn short_table_faults_without_submitting() {
        let dma = Arc::new(SimDma::new());
        let (xfer, stats) = transfer(&dma);
        let mut sgt = SgTable::with_page_size(0, 2 * PAGE, PAGE);
        let before = sgt.clone();

        let r = xfer.submit_frame(&mut sgt, 2 * PAGE + 1, Duration::from_secs(1));
        assert!(matches!(r, Err(CaptureError::Fault(_))));
        assert!(dma.calls().is_empty());
        assert_eq!(sgt, before);
        assert_eq!(stats.snapshot().dma_submit, 0);
    }

    #[test]
    fn engine_error_and_short_count_restore_table() {
        let dma = Arc::new(SimDma::new());
        let (xfer, stats) = transfer(&dma);
        let mut sgt = SgTable::with_page_size(0, 3 * PAGE, PAGE);
        let before = sgt.clone();

        dma.script([TransferOutcome::Error(-5), TransferOutcome::Bytes(100)]);
        let r = xfer.submit_frame(&mut sgt, 2 * PAGE + 10, Duration::from_secs(1));
        assert!(matches!(r, Err(CaptureError::DeviceError { code: -5 })));
        assert_eq!(sgt, before);

        let r = xfer.submit_frame(&mut sgt, 2 * PAGE + 10, Duration::from_secs(1));
        assert!(matches!(
            r,
            Err(CaptureError::ShortTransfer {
                expected: 8202,
                actual: 100
            })
        ));
        assert_eq!(sgt, before);

        let s = stats.snapshot();
        assert_eq!((s.dma_submit, s.dma_error, s.dma_short), (2, 1, 1));
    }

    #[test]
    fn warmup_buffer_is_one_segment() {
        let w = WarmupBuffer::new(8192);
        assert_eq!(w.len(), 8192);
        assert_eq!(w.sgt.nents(), 1);
        assert_eq!(w.sgt.dma_len(), 8192);
    }
}
