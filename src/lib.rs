pub mod capture;
pub mod device;
pub mod error;
pub mod hw;
pub mod pipeline;
pub mod sim;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::{Channel, ChannelControls, FrameGeometry, FrameInfo, PixelFormat};
pub use device::{CaptureDevice, EngineLimits};
pub use error::{CaptureError, Result};
pub use pipeline::{BufferSink, BufferState, Completion, PendingBuffer};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub capture: CaptureConfig,
}

/// Engine and event-line assignment. Channel `i` uses engine
/// `c2h_channel + i` and event line `irq_index + i`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub c2h_channel: u32,
    pub irq_index: u32,
    /// 0 = as many channels as the engine reports
    pub num_channels: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub test_pattern: bool,
    /// Warm-up frames discarded after enable
    pub skip: u32,
    pub vsync_timeout_ms: u32,
    pub transfer_timeout_ms: u32,
    /// Optional core per channel for the capture worker
    pub cpu_affinity: Vec<usize>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            c2h_channel: 0,
            irq_index: 1,
            num_channels: 0,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            test_pattern: true,
            skip: 0,
            vsync_timeout_ms: 1000,
            transfer_timeout_ms: 1000,
            cpu_affinity: Vec::new(),
        }
    }
}

impl CaptureConfig {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms.into())
    }
}

impl Config {
    /// Layer an optional TOML file under `VIDCAP__SECTION__KEY` environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let cfg = builder
            .add_source(
                config::Environment::with_prefix("VIDCAP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(cfg)
    }
}
