//! One attached capture card: the shared control plane plus its channels.
//!
//! The device is an explicitly owned `Arc` handed to whoever needs it (the
//! buffer framework, the interrupt layer); there is no process-wide instance.

use std::sync::Arc;

use tracing::{info, warn};

use crate::capture::dma::DmaBackend;
use crate::capture::worker::{ChannelParams, ChannelControls};
use crate::capture::Channel;
use crate::error::{CaptureError, Result};
use crate::hw::{ControlPlane, HwArbiter, RegisterAccess, RegisterLayout};
use crate::pipeline::queue::BufferSink;
use crate::Config;

/// Event lines the DMA driver can route to handlers
pub const MAX_EVENT_LINES: u32 = 16;

/// Resources the DMA driver reported when it opened the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineLimits {
    /// Card-to-host engines
    pub c2h_engines: u32,
    /// User event (interrupt) lines
    pub event_lines: u32,
}

pub struct CaptureDevice {
    control: Arc<ControlPlane>,
    arbiter: Arc<HwArbiter>,
    channels: Vec<Arc<Channel>>,
    event_mask: u32,
}

impl CaptureDevice {
    /// Probe the register layout and create one channel per usable engine.
    pub fn attach(
        regs: Arc<dyn RegisterAccess>,
        backend: Arc<dyn DmaBackend>,
        limits: EngineLimits,
        sink: Arc<dyn BufferSink>,
        config: &Config,
    ) -> Result<Arc<Self>> {
        let count = channel_count(limits, config)?;

        let control = Arc::new(ControlPlane::probe(regs));
        let (major, minor, patch) = control.version();
        info!(major, minor, patch, "FPGA register bank");
        let arbiter = HwArbiter::new(control.layout());

        let dev = &config.device;
        let mut channels = Vec::with_capacity(count as usize);
        let mut event_mask = 0;
        for i in 0..count {
            let params = ChannelParams {
                index: i as usize,
                engine: dev.c2h_channel + i,
                irq_line: dev.irq_index + i,
                controls: ChannelControls::from(&config.capture),
                transfer_timeout: config.capture.transfer_timeout(),
                cpu: config.capture.cpu_affinity.get(i as usize).copied(),
            };
            let channel = Channel::new(
                params,
                Arc::clone(&control),
                Arc::clone(&arbiter),
                Arc::clone(&backend),
                Arc::clone(&sink),
            );
            event_mask |= channel.irq_mask();
            info!(
                channel = channel.index(),
                engine = channel.engine(),
                irq = channel.irq_line(),
                "registered capture channel"
            );
            channel.dump_stats("attach");
            channels.push(Arc::new(channel));
        }

        Ok(Arc::new(Self {
            control,
            arbiter,
            channels,
            event_mask,
        }))
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    pub fn channel(&self, index: usize) -> Option<&Arc<Channel>> {
        self.channels.get(index)
    }

    pub fn layout(&self) -> RegisterLayout {
        self.control.layout()
    }

    /// Channel currently holding shared registers, on legacy layouts
    pub fn active_channel(&self) -> Option<usize> {
        self.arbiter.active()
    }

    /// Event lines owned by this device's channels
    pub fn event_mask(&self) -> u32 {
        self.event_mask
    }

    /// Route an event status word to the channels whose line fired. Safe to
    /// call from the interrupt path.
    pub fn dispatch_events(&self, status: u32) {
        for ch in &self.channels {
            if status & ch.irq_mask() != 0 {
                ch.on_edge();
            }
        }
    }

    /// Stop every stream ahead of removal.
    pub fn detach(&self) {
        for ch in &self.channels {
            ch.stop();
            ch.dump_stats("detach");
        }
    }
}

impl std::fmt::Debug for CaptureDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureDevice")
            .field("layout", &self.layout())
            .field("channels", &self.channels)
            .field("event_mask", &format_args!("{:#x}", self.event_mask))
            .finish()
    }
}

/// Work out how many channels fit the engines and event lines available,
/// clamping rather than failing when the request is too large.
fn channel_count(limits: EngineLimits, config: &Config) -> Result<u32> {
    let dev = &config.device;

    if dev.irq_index >= MAX_EVENT_LINES {
        return Err(CaptureError::InvalidArgument(format!(
            "irq_index {} out of range (max {})",
            dev.irq_index,
            MAX_EVENT_LINES - 1
        )));
    }
    if limits.c2h_engines == 0 {
        return Err(CaptureError::NoDevice("no card-to-host engines".into()));
    }
    if dev.c2h_channel >= limits.c2h_engines {
        return Err(CaptureError::InvalidArgument(format!(
            "c2h_channel {} out of range ({} engines)",
            dev.c2h_channel, limits.c2h_engines
        )));
    }

    let mut want = if dev.num_channels > 0 {
        dev.num_channels
    } else {
        limits.c2h_engines
    };

    let engines = limits.c2h_engines - dev.c2h_channel;
    if want > engines {
        warn!(want, avail = engines, c2h_channel = dev.c2h_channel, "clamping channel count to engines");
        want = engines;
    }

    let lines = limits
        .event_lines
        .min(MAX_EVENT_LINES)
        .saturating_sub(dev.irq_index);
    if lines == 0 {
        return Err(CaptureError::InvalidArgument(format!(
            "irq_index {} leaves no event lines ({} available)",
            dev.irq_index, limits.event_lines
        )));
    }
    if want > lines {
        warn!(want, avail = lines, irq_index = dev.irq_index, "clamping channel count to event lines");
        want = lines;
    }

    Ok(want)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::regs;
    use crate::pipeline::Completion;
    use crate::sim::{SimDma, SimRegisters};

    fn limits(c2h: u32, lines: u32) -> EngineLimits {
        EngineLimits {
            c2h_engines: c2h,
            event_lines: lines,
        }
    }

    #[test]
    fn auto_count_uses_every_engine() {
        let cfg = Config::default();
        assert_eq!(channel_count(limits(4, 16), &cfg).unwrap(), 4);
    }

    #[test]
    fn request_is_clamped_to_engines_and_lines() {
        let mut cfg = Config::default();
        cfg.device.num_channels = 8;
        cfg.device.c2h_channel = 1;
        assert_eq!(channel_count(limits(4, 16), &cfg).unwrap(), 3);

        cfg.device.irq_index = 14;
        assert_eq!(channel_count(limits(4, 16), &cfg).unwrap(), 2);
    }

    #[test]
    fn invalid_bases_are_rejected() {
        let mut cfg = Config::default();
        cfg.device.irq_index = 16;
        assert!(matches!(
            channel_count(limits(4, 16), &cfg),
            Err(CaptureError::InvalidArgument(_))
        ));

        let mut cfg = Config::default();
        cfg.device.c2h_channel = 4;
        assert!(matches!(
            channel_count(limits(4, 16), &cfg),
            Err(CaptureError::InvalidArgument(_))
        ));

        let cfg = Config::default();
        assert!(matches!(
            channel_count(limits(0, 16), &cfg),
            Err(CaptureError::NoDevice(_))
        ));
        assert!(matches!(
            channel_count(limits(2, 1), &cfg),
            Err(CaptureError::InvalidArgument(_))
        ));
    }

    #[test]
    fn attach_assigns_engines_and_event_lines() {
        let (tx, _rx) = flume::unbounded::<Completion>();
        let mut cfg = Config::default();
        cfg.device.c2h_channel = 1;
        cfg.device.irq_index = 2;
        let dev = CaptureDevice::attach(
            Arc::new(SimRegisters::new(0)),
            Arc::new(SimDma::new()),
            limits(3, 16),
            Arc::new(tx),
            &cfg,
        )
        .unwrap();

        assert_eq!(dev.channels().len(), 2);
        let ch1 = dev.channel(1).unwrap();
        assert_eq!((ch1.engine(), ch1.irq_line()), (2, 3));
        assert_eq!(dev.event_mask(), 0b1100);
        assert_eq!(dev.layout(), RegisterLayout::Legacy);
    }

    #[test]
    fn dispatch_routes_edges_by_line() {
        let (tx, _rx) = flume::unbounded::<Completion>();
        let caps = regs::caps(
            regs::CAPS_FEAT_PER_CH_CTRL | regs::CAPS_FEAT_PER_CH_FMT,
            2,
            0x100,
        );
        let dev = CaptureDevice::attach(
            Arc::new(SimRegisters::new(caps)),
            Arc::new(SimDma::new()),
            limits(2, 16),
            Arc::new(tx),
            &Config::default(),
        )
        .unwrap();
        assert!(dev.layout().is_per_channel());

        dev.dispatch_events(1 << 2);
        dev.dispatch_events((1 << 1) | (1 << 2));
        assert_eq!(dev.channel(0).unwrap().stats().vsync_isr, 1);
        assert_eq!(dev.channel(1).unwrap().stats().vsync_isr, 2);
    }
}
