//! deckbridge demo: loopback capture preview and output feed

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use deckbridge::capture::{RawTimecode, SoftwareConverter, TimecodeFormat};
use deckbridge::device::CompletionResult;
use deckbridge::loopback::{LoopbackDevice, SyntheticFrame};
use deckbridge::{
    utils, CaptureChannel, Config, DeviceContext, Frame, OutputChannel, PixelFormat,
    TimecodeBundle,
};

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()),
    );

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

fn frame_period(fps: u32) -> Duration {
    Duration::from_micros(1_000_000 / u64::from(fps.max(1)))
}

fn timecode_for(frame: u64, fps: u32) -> RawTimecode {
    let fps = u64::from(fps.max(1));
    let seconds = frame / fps;
    RawTimecode {
        hours: ((seconds / 3600) % 24) as u8,
        minutes: ((seconds / 60) % 60) as u8,
        seconds: (seconds % 60) as u8,
        frames: (frame % fps) as u8,
        drop_frame: false,
        user_bits: frame as u32,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    init_tracing(&config.logging.filter);

    info!("deckbridge launching...");

    let context = Arc::new(DeviceContext::new(Arc::new(SoftwareConverter)));
    let events = context.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            info!("Device event: {:?}", event);
        }
    });

    let loopback = Arc::new(LoopbackDevice::builder("Loopback 1").build());
    context.device_arrived(loopback.clone());

    let (index, device) = utils::select_device(&context, config.capture.device_index)
        .ok_or_else(|| eyre!("No suitable capture device found"))?;
    info!("Using capture device {}: {}", index, device.display_name());

    let capture = CaptureChannel::new(&context, device.as_ref(), &config.capture)?;
    debug!("Display modes: {:?}", capture.display_mode_names());
    if !capture.start_index(config.capture.mode_index, config.capture.format_detection) {
        return Err(eyre!("Failed to start capture"));
    }
    let capture_mode = capture
        .current_mode()
        .ok_or_else(|| eyre!("Capture started without a mode"))?;

    let output = if config.output.enabled {
        let output = OutputChannel::new(device.as_ref(), &config.output)?;
        if !output.start(config.output.mode) {
            return Err(eyre!("Failed to start output"));
        }
        Some(output)
    } else {
        None
    };

    // Stand-in for the card's clock: inject frames at the capture rate
    let input = loopback
        .input_handle()
        .ok_or_else(|| eyre!("Loopback device has no input"))?;
    let generator = tokio::spawn({
        let (width, height, fps) = (capture_mode.width(), capture_mode.height(), capture_mode.fps());
        async move {
            let mut ticker = interval(frame_period(fps));
            for n in 0u64.. {
                ticker.tick().await;
                let luma = 16 + (n % 220) as u8;
                let frame = SyntheticFrame::uyvy(width, height, luma)
                    .with_timecode(TimecodeFormat::Rp188Ltc, timecode_for(n, fps));
                input.deliver(&frame);
            }
        }
    });

    let playout = match (&output, loopback.output_handle()) {
        (Some(output), Some(handle)) => {
            let fps = output.timing().fps;
            Some(tokio::spawn(async move {
                let mut ticker = interval(frame_period(fps));
                loop {
                    ticker.tick().await;
                    handle.complete_next(CompletionResult::Completed);
                }
            }))
        }
        _ => None,
    };

    let mut render = interval(Duration::from_millis(16));
    render.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stats_interval = interval(Duration::from_secs(5));

    let mut frame = Frame::default();
    let mut timecodes = TimecodeBundle::default();
    let mut surface = output
        .as_ref()
        .map(|o| Frame::new(o.resolution().width, o.resolution().height, PixelFormat::Bgra8Bit));
    let mut rendered = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            _ = render.tick() => {
                if !capture.fetch_frame(&mut frame, Some(&mut timecodes)) {
                    continue;
                }
                rendered += 1;
                let ltc = &timecodes.get(TimecodeFormat::Rp188Ltc).timecode;
                debug!("Frame {} {}x{} LTC {}", frame.sequence(), frame.width(), frame.height(), ltc);

                if let (Some(output), Some(surface)) = (&output, surface.as_mut()) {
                    let shade = (rendered % 256) as u8;
                    for px in surface.as_bytes_mut().chunks_exact_mut(4) {
                        px.copy_from_slice(&[shade, 0, 255 - shade, 255]);
                    }
                    if !output.submit(surface) {
                        warn!("Output rejected surface");
                    }
                }
            }
            _ = stats_interval.tick() => {
                let stats = capture.stats();
                info!(
                    "Capture: {} arrived, {} no signal, {} published, {} overwritten, {} rendered",
                    stats.arrived, stats.no_signal, stats.slot.published, stats.slot.overwritten, rendered
                );
                if let Some(output) = &output {
                    let stats = output.stats();
                    info!(
                        "Output: {} scheduled, {} late, {} dropped, {} blank",
                        stats.scheduled, stats.completed_late, stats.dropped_by_device, stats.dropped_blank
                    );
                }
            }
        }
    }

    generator.abort();
    if let Some(playout) = playout {
        playout.abort();
    }
    capture.stop();
    if let Some(output) = &output {
        output.stop();
    }

    info!("deckbridge shutting down");
    Ok(())
}
