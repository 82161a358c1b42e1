//! Lock-free per-channel transfer counters

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use tracing::info;

/// Diagnostic counters. Monotonic between stream starts; read without any
/// synchronisation beyond atomicity, so a snapshot is approximate.
#[derive(Debug)]
pub struct StatsCounters {
    channel: usize,
    // Written from the event callback; kept off the worker's cache line.
    vsync_isr: CachePadded<AtomicU64>,
    inner: CachePadded<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    vsync_wait: AtomicU64,
    vsync_timeout: AtomicU64,
    dma_submit: AtomicU64,
    dma_error: AtomicU64,
    dma_short: AtomicU64,
    dma_trim: AtomicU64,
}

/// Point-in-time copy of [`StatsCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub vsync_isr: u64,
    pub vsync_wait: u64,
    pub vsync_timeout: u64,
    pub dma_submit: u64,
    pub dma_error: u64,
    pub dma_short: u64,
    pub dma_trim: u64,
}

impl StatsCounters {
    pub fn new(channel: usize) -> Self {
        Self {
            channel,
            vsync_isr: CachePadded::new(AtomicU64::new(0)),
            inner: CachePadded::new(Counters::default()),
        }
    }

    pub fn reset(&self) {
        self.vsync_isr.store(0, Ordering::Relaxed);
        let c = &self.inner;
        for counter in [
            &c.vsync_wait,
            &c.vsync_timeout,
            &c.dma_submit,
            &c.dma_error,
            &c.dma_short,
            &c.dma_trim,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn vsync_isr(&self) {
        self.vsync_isr.fetch_add(1, Ordering::Relaxed);
    }

    pub fn vsync_wait(&self) {
        self.inner.vsync_wait.fetch_add(1, Ordering::Relaxed);
    }

    pub fn vsync_timeout(&self) {
        self.inner.vsync_timeout.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dma_submit(&self) {
        self.inner.dma_submit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dma_error(&self) {
        self.inner.dma_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dma_short(&self) {
        self.inner.dma_short.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dma_trim(&self) {
        self.inner.dma_trim.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = &self.inner;
        StatsSnapshot {
            vsync_isr: self.vsync_isr.load(Ordering::Relaxed),
            vsync_wait: c.vsync_wait.load(Ordering::Relaxed),
            vsync_timeout: c.vsync_timeout.load(Ordering::Relaxed),
            dma_submit: c.dma_submit.load(Ordering::Relaxed),
            dma_error: c.dma_error.load(Ordering::Relaxed),
            dma_short: c.dma_short.load(Ordering::Relaxed),
            dma_trim: c.dma_trim.load(Ordering::Relaxed),
        }
    }

    /// Log the counters and mirror them into the `metrics` facade.
    pub fn dump(&self, tag: &str) {
        let s = self.snapshot();
        info!(
            channel = self.channel,
            vsync_isr = s.vsync_isr,
            vsync_wait = s.vsync_wait,
            vsync_timeout = s.vsync_timeout,
            dma_submit = s.dma_submit,
            dma_error = s.dma_error,
            dma_short = s.dma_short,
            dma_trim = s.dma_trim,
            "{tag}"
        );
        s.publish(self.channel);
    }
}

impl StatsSnapshot {
    fn publish(&self, channel: usize) {
        let ch = channel.to_string();
        for (name, value) in [
            ("vidcap_vsync_isr_total", self.vsync_isr),
            ("vidcap_vsync_wait_total", self.vsync_wait),
            ("vidcap_vsync_timeout_total", self.vsync_timeout),
            ("vidcap_dma_submit_total", self.dma_submit),
            ("vidcap_dma_error_total", self.dma_error),
            ("vidcap_dma_short_total", self.dma_short),
            ("vidcap_dma_trim_total", self.dma_trim),
        ] {
            metrics::counter!(name, "channel" => ch.clone()).absolute(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_reset() {
        let stats = StatsCounters::new(0);
        stats.vsync_isr();
        stats.vsync_isr();
        stats.dma_submit();
        stats.dma_short();

        let s = stats.snapshot();
        assert_eq!(s.vsync_isr, 2);
        assert_eq!(s.dma_submit, 1);
        assert_eq!(s.dma_short, 1);
        assert_eq!(s.dma_error, 0);

        stats.dump("test");
        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
