//! FPGA register bank layout (user BAR, all registers 32-bit).

pub const REG_VERSION: u32 = 0x0000;
pub const REG_CONTROL: u32 = 0x0004;
pub const REG_CAPS: u32 = 0x0014;
pub const REG_VID_FORMAT: u32 = 0x0100;

pub const CTRL_ENABLE: u32 = 1 << 0;
pub const CTRL_TEST_MODE: u32 = 1 << 2;

pub const CAPS_FEAT_PER_CH_CTRL: u32 = 1 << 0;
pub const CAPS_FEAT_PER_CH_FMT: u32 = 1 << 1;
pub const CAPS_CH_COUNT_MASK: u32 = 0x0000_ff00;
pub const CAPS_CH_COUNT_SHIFT: u32 = 8;
pub const CAPS_CH_STRIDE_MASK: u32 = 0xffff_0000;
pub const CAPS_CH_STRIDE_SHIFT: u32 = 16;

/// Smallest per-channel window the capability probe accepts.
pub const MIN_CH_STRIDE: u32 = 0x20;

pub const REG_CH_BASE: u32 = 0x1000;
pub const REG_CH_OFF_CONTROL: u32 = 0x00;
pub const REG_CH_OFF_VID_FORMAT: u32 = 0x04;

pub const VID_FMT_RGB888: u32 = 0x00;
pub const VID_FMT_YUV422: u32 = 0x01;

/// Span of the register bank including the per-channel windows.
pub const USER_BAR_SIZE: usize = 0x2000;

/// Pack a REG_CAPS value.
pub const fn caps(features: u32, channels: u32, stride: u32) -> u32 {
    features
        | ((channels << CAPS_CH_COUNT_SHIFT) & CAPS_CH_COUNT_MASK)
        | ((stride << CAPS_CH_STRIDE_SHIFT) & CAPS_CH_STRIDE_MASK)
}
