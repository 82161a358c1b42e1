pub mod queue;
pub mod stats;

pub use queue::{BufferSink, BufferState, Completion, OutputBufferQueue, PendingBuffer};
pub use stats::{StatsCounters, StatsSnapshot};
