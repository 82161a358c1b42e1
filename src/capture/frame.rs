use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::hw::regs;

pub const DEFAULT_WIDTH: u32 = 1920;
pub const DEFAULT_HEIGHT: u32 = 1080;
pub const FRAME_RATE: u32 = 60;

/// Pixel formats the FPGA can pack into a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 32-bit BGRX, fourcc `XR24`
    Xbgr32,
    /// Packed YUV 4:2:2, fourcc `YUYV`
    Yuyv,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 2] = [PixelFormat::Xbgr32, PixelFormat::Yuyv];

    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Xbgr32 => *b"XR24",
            PixelFormat::Yuyv => *b"YUYV",
        }
    }

    pub fn from_fourcc(fourcc: [u8; 4]) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.fourcc() == fourcc)
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Xbgr32 => 4,
            PixelFormat::Yuyv => 2,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            PixelFormat::Xbgr32 => "32-bit BGRX 8-8-8-8",
            PixelFormat::Yuyv => "YUYV 4:2:2",
        }
    }

    /// Format code written to the VID_FORMAT register
    pub fn hw_code(self) -> u32 {
        match self {
            PixelFormat::Yuyv => regs::VID_FMT_YUV422,
            PixelFormat::Xbgr32 => regs::VID_FMT_RGB888,
        }
    }
}

/// Current frame geometry of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub stride: u32,
    pub size: usize,
}

impl FrameGeometry {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let stride = width * format.bytes_per_pixel();
        Self {
            width,
            height,
            format,
            stride,
            size: stride as usize * height as usize,
        }
    }
}

impl Default for FrameGeometry {
    fn default() -> Self {
        Self::new(DEFAULT_WIDTH, DEFAULT_HEIGHT, PixelFormat::Xbgr32)
    }
}

/// Format requested by the collaborator; coerced by `FormatRequest::resolve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    pub width: u32,
    pub height: u32,
    pub fourcc: [u8; 4],
}

impl FormatRequest {
    /// Only the pixel format is negotiable; resolution is pinned to the
    /// default mode and unknown fourccs fall back to XBGR32.
    pub fn resolve(&self) -> FrameGeometry {
        let format = PixelFormat::from_fourcc(self.fourcc).unwrap_or(PixelFormat::Xbgr32);
        FrameGeometry::new(DEFAULT_WIDTH, DEFAULT_HEIGHT, format)
    }
}

pub fn frame_interval() -> Duration {
    Duration::from_secs(1) / FRAME_RATE
}

/// Metadata stamped on a successfully filled buffer
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    pub sequence: u64,
    pub timestamp: Instant,
    pub bytes_used: usize,
}
