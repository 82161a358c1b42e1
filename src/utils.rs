use std::time::{Duration, Instant};

/// Default burst allowed per window, matching the usual kernel ratelimit.
pub const DEFAULT_BURST: u32 = 10;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Window-based limiter for noisy diagnostics.
///
/// Owned by a single thread (the capture worker), so no interior locking.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    burst: u32,
    window_start: Option<Instant>,
    emitted: u32,
    suppressed: u64,
}

/// Outcome of [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Emit the message. `suppressed` messages were dropped in the previous window.
    Emit { suppressed: u64 },
    Suppress,
}

impl RateLimiter {
    pub fn new(interval: Duration, burst: u32) -> Self {
        Self {
            interval,
            burst,
            window_start: None,
            emitted: 0,
            suppressed: 0,
        }
    }

    pub fn check(&mut self) -> Verdict {
        self.check_at(Instant::now())
    }

    pub fn check_at(&mut self, now: Instant) -> Verdict {
        let expired = match self.window_start {
            None => true,
            Some(start) => now.saturating_duration_since(start) >= self.interval,
        };

        let mut carried = 0;
        if expired {
            self.window_start = Some(now);
            self.emitted = 0;
            carried = std::mem::take(&mut self.suppressed);
        }

        if self.emitted < self.burst {
            self.emitted += 1;
            Verdict::Emit {
                suppressed: carried,
            }
        } else {
            self.suppressed += 1;
            Verdict::Suppress
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL, DEFAULT_BURST)
    }
}

/// Log through `tracing` at most as often as `$limiter` allows.
#[macro_export]
macro_rules! ratelimited {
    ($limiter:expr, $level:ident, $($arg:tt)+) => {
        match $limiter.check() {
            $crate::utils::Verdict::Emit { suppressed: 0 } => ::tracing::$level!($($arg)+),
            $crate::utils::Verdict::Emit { suppressed } => {
                ::tracing::$level!(suppressed, "callbacks suppressed");
                ::tracing::$level!($($arg)+);
            }
            $crate::utils::Verdict::Suppress => {}
        }
    };
}
