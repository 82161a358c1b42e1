//! Simulated capture session: a 60 Hz sync generator drives channel 0 of a
//! simulated card while completed buffers are recycled back into the queue.

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info, warn};

use vidcap::capture::frame::frame_interval;
use vidcap::capture::worker::MIN_BUFFERS;
use vidcap::capture::SgTable;
use vidcap::sim::{SimDma, SimRegisters};
use vidcap::{BufferState, CaptureDevice, Completion, Config, EngineLimits, PendingBuffer};

/// Frames delivered before the session ends on its own
const SESSION_FRAMES: u64 = 600;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vidcap=debug"));

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::prelude::*;
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()))
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }

    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    info!(?config, "vidcap simulated session");

    let (tx, rx) = flume::unbounded::<Completion>();
    let device = CaptureDevice::attach(
        Arc::new(SimRegisters::new(0)),
        Arc::new(SimDma::new()),
        EngineLimits {
            c2h_engines: 1,
            event_lines: 16,
        },
        Arc::new(tx),
        &config,
    )?;
    let channel = Arc::clone(
        device
            .channel(0)
            .ok_or_else(|| eyre!("device has no capture channels"))?,
    );

    let (count, size) = channel.queue_setup(MIN_BUFFERS);
    for index in 0..count {
        let base = 0x4000_0000 + u64::from(index) * 0x0100_0000;
        let mut buffer = PendingBuffer::new(index, SgTable::from_pages(base, size));
        channel.prepare_buffer(&mut buffer)?;
        channel.queue_buffer(buffer);
    }
    channel.start()?;

    // Frame-sync edges from the simulated video source
    let edges = {
        let device = Arc::clone(&device);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(frame_interval());
            loop {
                tick.tick().await;
                device.dispatch_events(device.event_mask());
            }
        })
    };

    let recycle = {
        let device = Arc::clone(&device);
        async move {
            let mut delivered = 0u64;
            while let Ok(Completion {
                channel,
                buffer,
                state,
            }) = rx.recv_async().await
            {
                match state {
                    BufferState::Done(info) => {
                        delivered += 1;
                        debug!(channel, index = buffer.index, seq = info.sequence, "frame");
                    }
                    BufferState::Error(e) => warn!(channel, index = buffer.index, error = %e, "frame failed"),
                    BufferState::Queued => {}
                }
                if delivered >= SESSION_FRAMES {
                    break;
                }
                if let Some(ch) = device.channel(channel) {
                    ch.queue_buffer(buffer);
                }
            }
            delivered
        }
    };

    tokio::select! {
        delivered = recycle => info!(delivered, "session complete"),
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    edges.abort();
    let teardown = Arc::clone(&device);
    tokio::task::spawn_blocking(move || teardown.detach()).await?;

    info!("vidcap shutting down");
    Ok(())
}
