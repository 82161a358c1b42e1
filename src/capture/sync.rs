//! Frame-sync edge signal shared between the event callback and the worker.
//!
//! The callback side only bumps an atomic sequence number and unparks the
//! registered waiter. Waiters compare against the last sequence they saw, so
//! an edge that fires while the worker is busy is picked up on the next wait
//! and several edges collapse into one "new edge since last check".

use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;

use crate::error::{CaptureError, Result};
use crate::pipeline::stats::StatsCounters;

#[derive(Debug)]
pub struct FrameSyncSignal {
    seq: AtomicU64,
    waiter: ArcSwapOption<Thread>,
    stats: Arc<StatsCounters>,
}

impl FrameSyncSignal {
    pub fn new(stats: Arc<StatsCounters>) -> Self {
        Self {
            seq: AtomicU64::new(0),
            waiter: ArcSwapOption::empty(),
            stats,
        }
    }

    /// Hardware edge callback. Never blocks, allocates, or touches registers.
    #[inline]
    pub fn on_edge(&self) {
        self.stats.vsync_isr();
        self.seq.fetch_add(1, Ordering::SeqCst);
        // Pairs with the fence after waiter registration: either the waiter
        // sees the new count or we see the waiter.
        fence(Ordering::SeqCst);
        if let Some(t) = self.waiter.load().as_ref() {
            t.unpark();
        }
    }

    /// Current edge count, the starting cursor for [`wait_for_next_edge`].
    ///
    /// [`wait_for_next_edge`]: FrameSyncSignal::wait_for_next_edge
    pub fn current(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.seq.store(0, Ordering::Release);
    }

    /// Block until the edge count moves past `*last_seen`, `stop` is raised,
    /// or `timeout` elapses. On success `*last_seen` is advanced to the
    /// current count. `Cancelled` wins over `Timeout`. A timeout too large to
    /// form a deadline waits without one.
    pub fn wait_for_next_edge(
        &self,
        last_seen: &mut u64,
        stop: &AtomicBool,
        timeout: Duration,
    ) -> Result<()> {
        self.stats.vsync_wait();
        let deadline = Instant::now().checked_add(timeout);

        // Register before the first check so an edge between the check and
        // park() leaves an unpark token behind.
        self.waiter.store(Some(Arc::new(thread::current())));
        fence(Ordering::SeqCst);
        let outcome = loop {
            if stop.load(Ordering::SeqCst) {
                break Err(CaptureError::Cancelled);
            }
            let seq = self.seq.load(Ordering::SeqCst);
            if seq != *last_seen {
                *last_seen = seq;
                break Ok(());
            }
            match deadline {
                None => thread::park(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.stats.vsync_timeout();
                        break Err(CaptureError::Timeout);
                    }
                    thread::park_timeout(deadline - now);
                }
            }
        };
        self.waiter.store(None);
        outcome
    }

    /// Unpark the waiter so it re-checks its stop flag. The flag must be
    /// stored before calling.
    pub fn wake(&self) {
        fence(Ordering::SeqCst);
        if let Some(t) = self.waiter.load().as_ref() {
            t.unpark();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal() -> Arc<FrameSyncSignal> {
        Arc::new(FrameSyncSignal::new(Arc::new(StatsCounters::new(0))))
    }

    #[test]
    fn times_out_without_edge() {
        let sync = signal();
        let stop = AtomicBool::new(false);
        let mut seen = sync.current();
        let start = Instant::now();
        let r = sync.wait_for_next_edge(&mut seen, &stop, Duration::from_millis(50));
        assert!(matches!(r, Err(CaptureError::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(sync.stats.snapshot().vsync_timeout, 1);
    }

    #[test]
    fn edge_during_wait_succeeds() {
        let sync = signal();
        let stop = AtomicBool::new(false);
        let mut seen = sync.current();

        let fire = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                sync.on_edge();
            })
        };
        let start = Instant::now();
        sync.wait_for_next_edge(&mut seen, &stop, Duration::from_secs(5))
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(seen, 1);
        fire.join().unwrap();
    }

    #[test]
    fn edge_while_busy_is_not_lost() {
        let sync = signal();
        let stop = AtomicBool::new(false);
        let mut seen = sync.current();

        // several edges before the worker gets to wait count as one
        sync.on_edge();
        sync.on_edge();
        sync.wait_for_next_edge(&mut seen, &stop, Duration::from_millis(10))
            .unwrap();
        assert_eq!(seen, 2);
        let r = sync.wait_for_next_edge(&mut seen, &stop, Duration::from_millis(10));
        assert!(matches!(r, Err(CaptureError::Timeout)));
    }

    #[test]
    fn stop_cancels_promptly() {
        let sync = signal();
        let stop = Arc::new(AtomicBool::new(false));

        let waiter = {
            let sync = Arc::clone(&sync);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut seen = sync.current();
                sync.wait_for_next_edge(&mut seen, &stop, Duration::from_secs(5))
            })
        };

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        stop.store(true, Ordering::Release);
        sync.wake();
        let r = waiter.join().unwrap();
        assert!(matches!(r, Err(CaptureError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn cancel_takes_precedence_over_pending_edge() {
        let sync = signal();
        let stop = AtomicBool::new(true);
        let mut seen = 0;
        sync.on_edge();
        let r = sync.wait_for_next_edge(&mut seen, &stop, Duration::ZERO);
        assert!(matches!(r, Err(CaptureError::Cancelled)));
    }

    #[test]
    fn unbounded_timeout_waits_without_deadline() {
        let sync = signal();
        let stop = Arc::new(AtomicBool::new(false));

        let fire = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                sync.on_edge();
            })
        };
        let mut seen = sync.current();
        sync.wait_for_next_edge(&mut seen, &stop, Duration::MAX)
            .unwrap();
        assert_eq!(seen, 1);
        fire.join().unwrap();

        let waiter = {
            let sync = Arc::clone(&sync);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut seen = sync.current();
                sync.wait_for_next_edge(&mut seen, &stop, Duration::MAX)
            })
        };
        thread::sleep(Duration::from_millis(30));
        stop.store(true, Ordering::SeqCst);
        sync.wake();
        assert!(matches!(waiter.join().unwrap(), Err(CaptureError::Cancelled)));
        assert_eq!(sync.stats.snapshot().vsync_timeout, 0);
    }

    #[test]
    fn racing_edges_always_wake_the_waiter() {
        let sync = signal();
        let stop = AtomicBool::new(false);
        let mut seen = sync.current();

        let start = Instant::now();
        for _ in 0..500 {
            let fire = {
                let sync = Arc::clone(&sync);
                thread::spawn(move || sync.on_edge())
            };
            sync.wait_for_next_edge(&mut seen, &stop, Duration::from_secs(5))
                .unwrap();
            fire.join().unwrap();
        }
        assert_eq!(seen, 500);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
