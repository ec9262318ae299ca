//! Capture channel: hardware frame callbacks into a latest-frame slot.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use arc_swap::ArcSwapOption;
use crossbeam::atomic::AtomicCell;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::capture::convert::{FrameView, PixelConverter};
use crate::capture::frame::{Frame, PixelFormat};
use crate::capture::timecode::TimecodeBundle;
use crate::device::{
    DeckDevice, DetectedFormatFlags, DeviceContext, FormatChangeEvents, InputCallback, InputFlags,
    InputFrame, VideoInput,
};
use crate::error::{Error, Result};
use crate::modes::{DisplayMode, DisplayModeId, ModeCatalog, Resolution};
use crate::pipeline::{FrameSlot, SlotStats};
use crate::CaptureConfig;

/// Native format requested from the device when a capture starts.
const CAPTURE_FORMAT: PixelFormat = PixelFormat::Yuv8Bit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureState {
    #[default]
    Idle,
    Capturing,
}

/// Counters for one capture channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureStats {
    pub arrived: u64,
    pub no_signal: u64,
    pub conversion_failures: u64,
    pub slot: SlotStats,
}

/// Live capture from one device input.
pub struct CaptureChannel {
    name: String,
    input: Arc<dyn VideoInput>,
    modes: ModeCatalog,
    supports_format_detection: bool,
    handler: Arc<CaptureHandler>,
}

/// State shared with the device callback thread.
struct CaptureHandler {
    input: Weak<dyn VideoInput>,
    converter: Arc<dyn PixelConverter>,
    convert: bool,
    target_format: PixelFormat,

    /// Serializes start/stop and format-change restarts
    control: Mutex<()>,
    state: AtomicCell<CaptureState>,
    format_detection: AtomicBool,
    mode: ArcSwapOption<DisplayMode>,
    input_format: AtomicCell<PixelFormat>,

    slot: FrameSlot,
    /// Conversion target, touched only by the callback thread
    scratch: Mutex<(Frame, TimecodeBundle)>,
    sequence: AtomicU64,
    stats: CachePadded<Counters>,
}

#[derive(Default)]
struct Counters {
    arrived: AtomicU64,
    no_signal: AtomicU64,
    conversion_failures: AtomicU64,
}

impl CaptureChannel {
    /// Bind to a device's input. Fails if the device has no input interface.
    pub fn new(
        context: &DeviceContext,
        device: &dyn DeckDevice,
        config: &CaptureConfig,
    ) -> Result<Self> {
        let name = device.display_name();
        let input = device
            .input()
            .ok_or_else(|| Error::NoInputInterface(name.clone()))?;

        if config.convert && !config.target_format.is_four_byte() {
            return Err(Error::Conversion(format!(
                "capture target {:?} is not a 4-byte format",
                config.target_format
            )));
        }

        let modes = ModeCatalog::new(input.display_modes());
        let supports_format_detection = device.attributes().supports_format_detection;
        info!(
            "Capture channel on {}: {} display modes, format detection {}",
            name,
            modes.len(),
            if supports_format_detection { "supported" } else { "unsupported" }
        );

        let handler = Arc::new(CaptureHandler {
            input: Arc::downgrade(&input),
            converter: context.converter(),
            convert: config.convert,
            target_format: config.target_format,
            control: Mutex::new(()),
            state: AtomicCell::new(CaptureState::Idle),
            format_detection: AtomicBool::new(false),
            mode: ArcSwapOption::empty(),
            input_format: AtomicCell::new(CAPTURE_FORMAT),
            slot: FrameSlot::new(),
            scratch: Mutex::new((Frame::default(), TimecodeBundle::default())),
            sequence: AtomicU64::new(0),
            stats: CachePadded::new(Counters::default()),
        });

        Ok(Self {
            name,
            input,
            modes,
            supports_format_detection,
            handler,
        })
    }

    /// Enable the input at `mode`, start streaming and arm the callback.
    ///
    /// Returns false if already capturing or the device rejects the request;
    /// the reason is logged.
    #[instrument(skip(self), fields(device = %self.name))]
    pub fn start(&self, mode: DisplayModeId, enable_format_detection: bool) -> bool {
        let _control = self.handler.control.lock();

        if self.handler.state.load() == CaptureState::Capturing {
            warn!("Already capturing, aborting start");
            return false;
        }

        let detect = enable_format_detection && self.supports_format_detection;
        if enable_format_detection && !detect {
            warn!("Format detection requested but not supported by this device");
        }

        let flags = InputFlags {
            format_detection: detect,
        };
        if let Err(e) = self.input.enable_video_input(mode, CAPTURE_FORMAT, flags) {
            error!(
                "Unable to select display mode {}, the device may be in use: {}",
                mode, e
            );
            return false;
        }

        if let Err(e) = self.input.start_streams() {
            error!("Unable to start the capture, the device may be in use: {}", e);
            if let Err(e) = self.input.disable_video_input() {
                warn!("Failed to disable video input after aborted start: {}", e);
            }
            return false;
        }

        let display_mode = self
            .modes
            .find(mode)
            .cloned()
            .or_else(|| DisplayMode::standard(mode));
        self.handler.mode.store(display_mode.map(Arc::new));
        self.handler.input_format.store(CAPTURE_FORMAT);
        self.handler.format_detection.store(detect, Ordering::Release);
        self.handler.slot.discard();

        self.handler.state.store(CaptureState::Capturing);
        self.input
            .set_callback(Some(self.handler.clone() as Arc<dyn InputCallback>));

        info!("Capture started in mode {}", mode);
        true
    }

    /// Start from a position in the enumerated mode list.
    ///
    /// Out-of-range indices are logged and rejected before any device call.
    pub fn start_index(&self, index: i64, enable_format_detection: bool) -> bool {
        match self.modes.by_index(index) {
            Ok(mode) => self.start(mode.id, enable_format_detection),
            Err(e) => {
                error!("An invalid display mode was selected: {}", e);
                false
            }
        }
    }

    /// Disarm the callback and stop streaming. No-op when idle.
    pub fn stop(&self) {
        let _control = self.handler.control.lock();
        if self.handler.state.load() == CaptureState::Idle {
            return;
        }

        self.input.set_callback(None);
        if let Err(e) = self.input.stop_streams() {
            warn!("Failed to stop capture streams: {}", e);
        }
        if let Err(e) = self.input.disable_video_input() {
            warn!("Failed to disable video input: {}", e);
        }
        self.handler.state.store(CaptureState::Idle);
        info!("Capture stopped on {}", self.name);
    }

    /// Copy the latest frame out if it has not been fetched yet.
    ///
    /// Never blocks waiting for data.
    pub fn fetch_frame(&self, out: &mut Frame, timecodes: Option<&mut TimecodeBundle>) -> bool {
        self.handler.slot.fetch(out, timecodes)
    }

    /// Entry point for the device's frame-arrived callback.
    pub fn on_frame_arrived(&self, frame: &dyn InputFrame) {
        self.handler.frame_arrived(frame);
    }

    /// Entry point for the device's format-changed callback.
    pub fn on_format_changed(
        &self,
        events: FormatChangeEvents,
        new_mode: &DisplayMode,
        detected: DetectedFormatFlags,
    ) {
        self.handler.format_changed(events, new_mode, detected);
    }

    pub fn state(&self) -> CaptureState {
        self.handler.state.load()
    }

    pub fn is_capturing(&self) -> bool {
        self.state() == CaptureState::Capturing
    }

    /// Mode currently being captured, updated on format changes.
    pub fn current_mode(&self) -> Option<Arc<DisplayMode>> {
        self.handler.mode.load_full()
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.handler.mode.load_full().map(|m| m.resolution)
    }

    /// Native pixel format the input is currently enabled with.
    pub fn input_format(&self) -> PixelFormat {
        self.handler.input_format.load()
    }

    pub fn modes(&self) -> &ModeCatalog {
        &self.modes
    }

    pub fn display_mode_names(&self) -> Vec<String> {
        self.modes.names()
    }

    pub fn supports_format_detection(&self) -> bool {
        self.supports_format_detection
    }

    pub fn stats(&self) -> CaptureStats {
        let counters = &self.handler.stats;
        CaptureStats {
            arrived: counters.arrived.load(Ordering::Relaxed),
            no_signal: counters.no_signal.load(Ordering::Relaxed),
            conversion_failures: counters.conversion_failures.load(Ordering::Relaxed),
            slot: self.handler.slot.stats(),
        }
    }
}

impl Drop for CaptureChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

impl CaptureHandler {
    /// Fill the scratch frame from the device frame. Runs outside the slot lock.
    fn decode_into(&self, frame: &dyn InputFrame, dst: &mut Frame) -> bool {
        let view = FrameView {
            data: frame.bytes(),
            width: frame.width(),
            height: frame.height(),
            row_bytes: frame.row_bytes(),
            format: frame.pixel_format(),
        };

        if self.convert {
            let started = Instant::now();
            if let Err(e) = self.converter.convert(view, dst, self.target_format) {
                warn!("Dropping frame that failed conversion: {}", e);
                return false;
            }
            metrics::histogram!("deckbridge_convert_time_us")
                .record(started.elapsed().as_micros() as f64);
            return true;
        }

        let len = view.row_bytes * view.height as usize;
        if view.data.len() < len {
            warn!(
                "Dropping short frame: {} bytes for {}x{}",
                view.data.len(),
                view.width,
                view.height
            );
            return false;
        }
        dst.reshape(view.width, view.height, view.row_bytes, view.format);
        dst.as_bytes_mut().copy_from_slice(&view.data[..len]);
        true
    }
}

impl InputCallback for CaptureHandler {
    fn frame_arrived(&self, frame: &dyn InputFrame) {
        if self.state.load() != CaptureState::Capturing {
            trace!("Frame arrived while idle, ignoring");
            return;
        }
        self.stats.arrived.fetch_add(1, Ordering::Relaxed);

        if !frame.has_input_source() {
            self.stats.no_signal.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("deckbridge_frames_no_signal").increment(1);
            trace!("Frame has no input source, keeping previous frame");
            return;
        }

        let captured_at = Instant::now();
        let mut scratch = self.scratch.lock();
        let (buffer, timecodes) = &mut *scratch;

        timecodes.extract_from(frame);
        if !self.decode_into(frame, buffer) {
            self.stats.conversion_failures.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        buffer.stamp(sequence, captured_at);

        if self.slot.publish(buffer, timecodes) {
            metrics::counter!("deckbridge_frames_overwritten").increment(1);
        }
        metrics::counter!("deckbridge_frames_captured").increment(1);
    }

    fn format_changed(
        &self,
        events: FormatChangeEvents,
        new_mode: &DisplayMode,
        detected: DetectedFormatFlags,
    ) {
        if !self.format_detection.load(Ordering::Acquire) {
            debug!("Format change ignored, detection not enabled");
            return;
        }

        // A concurrent start/stop owns the device; let it win.
        let Some(_control) = self.control.try_lock() else {
            debug!("Format change ignored, start/stop in progress");
            return;
        };
        if self.state.load() != CaptureState::Capturing {
            return;
        }
        let Some(input) = self.input.upgrade() else {
            return;
        };

        let pixel_format = if detected.rgb444 {
            PixelFormat::Rgb10Bit
        } else {
            CAPTURE_FORMAT
        };
        info!(
            ?events,
            "Input format changed to {} ({:?}), restarting capture", new_mode.name, pixel_format
        );

        if let Err(e) = input.stop_streams() {
            warn!("Failed to stop streams for format change: {}", e);
        }

        let flags = InputFlags {
            format_detection: true,
        };
        let restarted = input
            .enable_video_input(new_mode.id, pixel_format, flags)
            .map_err(|e| ("select the new video mode", e))
            .and_then(|()| {
                input
                    .start_streams()
                    .map_err(|e| ("restart the capture", e))
            });

        match restarted {
            Ok(()) => {
                self.mode.store(Some(Arc::new(new_mode.clone())));
                self.input_format.store(pixel_format);
            }
            Err((step, e)) => {
                error!("Unable to {} after format change, capture stopped: {}", step, e);
                input.set_callback(None);
                if let Err(e) = input.disable_video_input() {
                    warn!("Failed to disable video input: {}", e);
                }
                self.state.store(CaptureState::Idle);
            }
        }
    }
}
