//! FPGA control plane: capture enable and pixel-format registers.
//!
//! Older bitstreams expose one global CONTROL/VID_FORMAT pair shared by every
//! channel. Newer ones advertise per-channel windows through REG_CAPS. The
//! layout is probed once at attach and every register access resolves its
//! offset through it. On legacy layouts [`HwArbiter`] allows only one channel
//! to stream at a time.

pub mod mmio;
pub mod regs;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::capture::frame::PixelFormat;
use crate::error::{CaptureError, Result};

pub use mmio::MmioRegisters;

/// Flat 32-bit access to the FPGA register window.
pub trait RegisterAccess: Send + Sync {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
}

/// Per-channel register capability advertised by REG_CAPS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub channel_count: u32,
    pub window_stride: u32,
}

impl Capability {
    /// Decode a REG_CAPS value. Both per-channel feature bits are required,
    /// at least one channel, and a naturally aligned stride of at least
    /// [`regs::MIN_CH_STRIDE`].
    pub fn from_caps(caps: u32) -> Option<Self> {
        let want = regs::CAPS_FEAT_PER_CH_CTRL | regs::CAPS_FEAT_PER_CH_FMT;
        let channel_count = (caps & regs::CAPS_CH_COUNT_MASK) >> regs::CAPS_CH_COUNT_SHIFT;
        let window_stride = (caps & regs::CAPS_CH_STRIDE_MASK) >> regs::CAPS_CH_STRIDE_SHIFT;

        if caps & want != want {
            return None;
        }
        if channel_count == 0 {
            return None;
        }
        if window_stride < regs::MIN_CH_STRIDE || window_stride & 0x3 != 0 {
            return None;
        }

        Some(Self {
            channel_count,
            window_stride,
        })
    }
}

/// Read REG_CAPS once. `None` means legacy global registers.
pub fn detect_capability(regs: &dyn RegisterAccess) -> Option<Capability> {
    Capability::from_caps(regs.read32(regs::REG_CAPS))
}

/// Register layout selected at attach time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterLayout {
    Legacy,
    PerChannel(Capability),
}

impl RegisterLayout {
    pub fn is_per_channel(&self) -> bool {
        matches!(self, RegisterLayout::PerChannel(_))
    }

    fn resolve(&self, engine: u32, legacy: u32, window_off: u32) -> Result<u32> {
        match self {
            RegisterLayout::Legacy => Ok(legacy),
            RegisterLayout::PerChannel(cap) => {
                if engine >= cap.channel_count {
                    return Err(CaptureError::Fault("engine outside per-channel register windows"));
                }
                Ok(regs::REG_CH_BASE + engine * cap.window_stride + window_off)
            }
        }
    }

    pub fn control_offset(&self, engine: u32) -> Result<u32> {
        self.resolve(engine, regs::REG_CONTROL, regs::REG_CH_OFF_CONTROL)
    }

    pub fn format_offset(&self, engine: u32) -> Result<u32> {
        self.resolve(engine, regs::REG_VID_FORMAT, regs::REG_CH_OFF_VID_FORMAT)
    }
}

impl From<Option<Capability>> for RegisterLayout {
    fn from(cap: Option<Capability>) -> Self {
        cap.map_or(RegisterLayout::Legacy, RegisterLayout::PerChannel)
    }
}

/// Enable/disable and format writes for every channel of one device.
///
/// Channels are addressed by their DMA engine index, which is also the
/// index of their register window.
pub struct ControlPlane {
    regs: Arc<dyn RegisterAccess>,
    layout: RegisterLayout,
}

impl ControlPlane {
    pub fn probe(regs: Arc<dyn RegisterAccess>) -> Self {
        let layout = RegisterLayout::from(detect_capability(regs.as_ref()));
        match layout {
            RegisterLayout::PerChannel(cap) => info!(
                channels = cap.channel_count,
                stride = cap.window_stride,
                "per-channel register windows detected"
            ),
            RegisterLayout::Legacy => info!("legacy global registers, one stream at a time"),
        }
        Self { regs, layout }
    }

    pub fn layout(&self) -> RegisterLayout {
        self.layout
    }

    pub fn version(&self) -> (u8, u8, u16) {
        let v = self.regs.read32(regs::REG_VERSION);
        ((v >> 24) as u8, (v >> 16) as u8, v as u16)
    }

    pub fn set_format(&self, engine: u32, format: PixelFormat) -> Result<()> {
        let off = self.layout.format_offset(engine)?;
        debug!(engine, off, ?format, "write VID_FORMAT");
        self.regs.write32(off, format.hw_code());
        Ok(())
    }

    /// Start capture. The format register is written first so a channel that
    /// never negotiated a format still captures in its current one.
    pub fn enable(&self, engine: u32, format: PixelFormat, test_pattern: bool) -> Result<()> {
        self.set_format(engine, format)?;

        let mut ctrl = regs::CTRL_ENABLE;
        if test_pattern {
            ctrl |= regs::CTRL_TEST_MODE;
        }
        let off = self.layout.control_offset(engine)?;
        self.regs.write32(off, ctrl);
        Ok(())
    }

    pub fn disable(&self, engine: u32) -> Result<()> {
        let off = self.layout.control_offset(engine)?;
        self.regs.write32(off, 0);
        Ok(())
    }
}

/// Single "active channel" slot for devices without per-channel registers.
pub struct HwArbiter {
    shared: bool,
    active: Mutex<Option<usize>>,
}

/// Held by a streaming channel on a shared-register device; releases the
/// slot on drop.
#[derive(Debug)]
pub struct ExclusiveAccess {
    arbiter: Arc<HwArbiter>,
    channel: usize,
}

impl HwArbiter {
    pub fn new(layout: RegisterLayout) -> Arc<Self> {
        Arc::new(Self {
            shared: !layout.is_per_channel(),
            active: Mutex::new(None),
        })
    }

    /// Claim the control plane for `channel`. Returns `Ok(None)` when the
    /// registers are per-channel and no arbitration is needed.
    pub fn acquire(self: &Arc<Self>, channel: usize) -> Result<Option<ExclusiveAccess>> {
        if !self.shared {
            return Ok(None);
        }

        let mut active = self.active.lock();
        match *active {
            Some(owner) if owner != channel => Err(CaptureError::Busy),
            _ => {
                *active = Some(channel);
                Ok(Some(ExclusiveAccess {
                    arbiter: Arc::clone(self),
                    channel,
                }))
            }
        }
    }

    pub fn active(&self) -> Option<usize> {
        *self.active.lock()
    }
}

impl std::fmt::Debug for HwArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HwArbiter")
            .field("shared", &self.shared)
            .field("active", &self.active())
            .finish()
    }
}

impl Drop for ExclusiveAccess {
    fn drop(&mut self) {
        let mut active = self.arbiter.active.lock();
        if *active == Some(self.channel) {
            *active = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimRegisters;

    const BOTH: u32 = regs::CAPS_FEAT_PER_CH_CTRL | regs::CAPS_FEAT_PER_CH_FMT;

    #[test]
    fn capability_requires_both_feature_bits() {
        assert!(Capability::from_caps(regs::caps(regs::CAPS_FEAT_PER_CH_CTRL, 2, 0x100)).is_none());
        assert_eq!(
            Capability::from_caps(regs::caps(BOTH, 2, 0x100)),
            Some(Capability {
                channel_count: 2,
                window_stride: 0x100
            })
        );
    }

    #[test]
    fn capability_rejects_bad_stride_and_count() {
        assert!(Capability::from_caps(regs::caps(BOTH, 0, 0x100)).is_none());
        assert!(Capability::from_caps(regs::caps(BOTH, 2, 0x10)).is_none());
        assert!(Capability::from_caps(regs::caps(BOTH, 2, 0x102)).is_none());
        assert!(Capability::from_caps(0).is_none());
    }

    #[test]
    fn legacy_writes_go_to_global_block() {
        let bank = Arc::new(SimRegisters::new(0));
        let cp = ControlPlane::probe(bank.clone());
        assert_eq!(cp.layout(), RegisterLayout::Legacy);

        cp.enable(1, PixelFormat::Yuyv, true).unwrap();
        assert_eq!(bank.peek(regs::REG_VID_FORMAT), regs::VID_FMT_YUV422);
        assert_eq!(
            bank.peek(regs::REG_CONTROL),
            regs::CTRL_ENABLE | regs::CTRL_TEST_MODE
        );

        cp.disable(1).unwrap();
        assert_eq!(bank.peek(regs::REG_CONTROL), 0);
    }

    #[test]
    fn per_channel_writes_go_to_window() {
        let bank = Arc::new(SimRegisters::new(regs::caps(BOTH, 2, 0x100)));
        let cp = ControlPlane::probe(bank.clone());
        assert!(cp.layout().is_per_channel());

        cp.enable(1, PixelFormat::Xbgr32, false).unwrap();
        let base = regs::REG_CH_BASE + 0x100;
        assert_eq!(bank.peek(base + regs::REG_CH_OFF_CONTROL), regs::CTRL_ENABLE);
        assert_eq!(bank.peek(base + regs::REG_CH_OFF_VID_FORMAT), regs::VID_FMT_RGB888);
        assert_eq!(bank.peek(regs::REG_CONTROL), 0);

        // the format register is written before CONTROL
        let log = bank.write_log();
        assert_eq!(log[0].0, base + regs::REG_CH_OFF_VID_FORMAT);
        assert_eq!(log[1].0, base + regs::REG_CH_OFF_CONTROL);
    }

    #[test]
    fn per_channel_rejects_engine_without_window() {
        let bank = Arc::new(SimRegisters::new(regs::caps(BOTH, 1, 0x100)));
        let cp = ControlPlane::probe(bank);
        assert!(matches!(cp.disable(3), Err(CaptureError::Fault(_))));
    }

    #[test]
    fn arbiter_single_slot() {
        let arb = HwArbiter::new(RegisterLayout::Legacy);
        let a = arb.acquire(0).unwrap();
        assert!(a.is_some());
        assert!(matches!(arb.acquire(1), Err(CaptureError::Busy)));
        drop(a);
        assert_eq!(arb.active(), None);
        assert!(arb.acquire(1).unwrap().is_some());
    }

    #[test]
    fn arbiter_is_noop_for_per_channel() {
        let arb = HwArbiter::new(RegisterLayout::PerChannel(Capability {
            channel_count: 2,
            window_stride: 0x100,
        }));
        let _a = arb.acquire(0).unwrap();
        assert!(arb.acquire(1).unwrap().is_none());
        assert_eq!(arb.active(), None);
    }
}
