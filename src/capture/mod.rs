pub mod dma;
pub mod frame;
pub mod sync;
pub mod worker;

pub use dma::{DmaBackend, DmaFrameTransfer, SgEntry, SgTable};
pub use frame::{FormatRequest, FrameGeometry, FrameInfo, PixelFormat};
pub use sync::FrameSyncSignal;
pub use worker::{Channel, ChannelControls, StreamPhase};
