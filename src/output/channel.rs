//! Output channel: keeps the device's playback queue fed from the latest
//! application-submitted surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::atomic::AtomicCell;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::capture::frame::{Frame, PixelFormat};
use crate::device::{CompletionResult, DeckDevice, OutputCallback, OutputFrame, VideoOutput};
use crate::error::{Error, Result};
use crate::modes::{DisplayModeId, ModeCatalog, Resolution};
use crate::pipeline::SurfaceSlot;
use crate::OutputConfig;

/// Buffers queued before scheduled playback starts.
pub const PREROLL_FRAMES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputState {
    #[default]
    Idle,
    Running,
}

/// Frame timing derived from the selected display mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaybackTiming {
    pub frame_duration: i64,
    pub time_scale: i64,
    pub fps: u32,
}

/// Counters for one output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputStats {
    pub submitted: u64,
    pub rejected: u64,
    pub scheduled: u64,
    pub completed_late: u64,
    pub dropped_by_device: u64,
    /// Returned buffers not rescheduled because nothing was submitted yet
    pub dropped_blank: u64,
}

/// Scheduled playback to one device output.
pub struct OutputChannel {
    name: String,
    output: Arc<dyn VideoOutput>,
    modes: ModeCatalog,
    flip_vertical: bool,
    handler: Arc<OutputHandler>,
}

struct OutputHandler {
    output: Weak<dyn VideoOutput>,
    pixel_format: PixelFormat,

    control: Mutex<()>,
    state: AtomicCell<OutputState>,
    surface: SurfaceSlot,
    schedule: Mutex<Schedule>,
    stats: CachePadded<Counters>,
}

/// Touched only under the schedule lock.
#[derive(Default)]
struct Schedule {
    resolution: Resolution,
    timing: PlaybackTiming,
    frames_scheduled: u64,
}

impl Schedule {
    fn next_display_time(&self) -> i64 {
        self.frames_scheduled as i64 * self.timing.frame_duration
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    scheduled: AtomicU64,
    completed_late: AtomicU64,
    dropped_by_device: AtomicU64,
    dropped_blank: AtomicU64,
}

impl OutputChannel {
    /// Bind to a device's output. Fails if the device has no output interface.
    pub fn new(device: &dyn DeckDevice, config: &OutputConfig) -> Result<Self> {
        let name = device.display_name();
        let output = device
            .output()
            .ok_or_else(|| Error::NoOutputInterface(name.clone()))?;

        let modes = ModeCatalog::new(output.display_modes());
        info!("Output channel on {}: {} display modes", name, modes.len());

        let handler = Arc::new(OutputHandler {
            output: Arc::downgrade(&output),
            pixel_format: config.pixel_format,
            control: Mutex::new(()),
            state: AtomicCell::new(OutputState::Idle),
            surface: SurfaceSlot::new(),
            schedule: Mutex::new(Schedule::default()),
            stats: CachePadded::new(Counters::default()),
        });

        Ok(Self {
            name,
            output,
            modes,
            flip_vertical: config.flip_vertical,
            handler,
        })
    }

    /// Enable output at `mode`, preroll and start scheduled playback.
    ///
    /// Returns false if the mode is not in the device's list, the device
    /// rejects any step, or the channel is already running.
    #[instrument(skip(self), fields(device = %self.name))]
    pub fn start(&self, mode: DisplayModeId) -> bool {
        let _control = self.handler.control.lock();

        if self.handler.state.load() == OutputState::Running {
            warn!("Output already running, aborting start");
            return false;
        }

        let display_mode = match self.modes.get(mode) {
            Ok(display_mode) => display_mode,
            Err(e) => {
                error!("Cannot start output: {}", e);
                return false;
            }
        };
        let resolution = display_mode.resolution;
        let timing = PlaybackTiming {
            frame_duration: display_mode.frame_duration,
            time_scale: display_mode.time_scale,
            fps: display_mode.fps(),
        };

        if let Err(e) = self.output.enable_video_output(mode) {
            error!("Failed to enable video output: {}", e);
            return false;
        }

        self.handler
            .surface
            .configure(resolution, self.handler.pixel_format);
        {
            let mut schedule = self.handler.schedule.lock();
            *schedule = Schedule {
                resolution,
                timing,
                frames_scheduled: 0,
            };
        }

        self.handler.state.store(OutputState::Running);
        self.output
            .set_callback(Some(self.handler.clone() as Arc<dyn OutputCallback>));

        if let Err(e) = self.preroll() {
            error!("Failed to preroll output frames: {}", e);
            self.teardown();
            return false;
        }

        if let Err(e) = self
            .output
            .start_scheduled_playback(0, timing.time_scale, 1.0)
        {
            error!("Failed to start scheduled playback: {}", e);
            self.teardown();
            return false;
        }

        info!(
            "Output started in mode {} at {} fps ({}/{})",
            mode, timing.fps, timing.frame_duration, timing.time_scale
        );
        true
    }

    /// Queue the initial buffers so playback starts with a full window.
    fn preroll(&self) -> Result<()> {
        let mut schedule = self.handler.schedule.lock();
        let format = self.handler.pixel_format;
        let resolution = schedule.resolution;
        let row_bytes = format.row_bytes(resolution.width);

        for _ in 0..PREROLL_FRAMES {
            let mut frame = self.output.create_video_frame(
                resolution.width,
                resolution.height,
                row_bytes,
                format,
                self.flip_vertical,
            )?;
            let dst_row_bytes = frame.row_bytes();
            self.handler
                .surface
                .copy_latest_into(frame.bytes_mut(), dst_row_bytes);

            let timing = schedule.timing;
            self.output.schedule_video_frame(
                frame,
                schedule.next_display_time(),
                timing.frame_duration,
                timing.time_scale,
            )?;
            schedule.frames_scheduled += 1;
            self.handler.stats.scheduled.fetch_add(1, Ordering::Relaxed);
        }
        debug!("Prerolled {} frames", schedule.frames_scheduled);
        Ok(())
    }

    /// Stop playback and disable the output. Idempotent.
    pub fn stop(&self) {
        let _control = self.handler.control.lock();
        if self.handler.state.load() == OutputState::Idle {
            return;
        }
        self.teardown();
        info!("Output stopped on {}", self.name);
    }

    fn teardown(&self) {
        self.output.set_callback(None);
        self.handler.state.store(OutputState::Idle);
        if let Err(e) = self.output.stop_scheduled_playback() {
            warn!("Failed to stop scheduled playback: {}", e);
        }
        if let Err(e) = self.output.disable_video_output() {
            warn!("Failed to disable video output: {}", e);
        }
    }

    /// Replace the surface sent on subsequent completions.
    ///
    /// The image must match the output resolution and pixel layout exactly;
    /// anything else is logged and rejected.
    pub fn submit(&self, image: &Frame) -> bool {
        match self.handler.surface.submit(image) {
            Ok(generation) => {
                self.handler.stats.submitted.fetch_add(1, Ordering::Relaxed);
                trace!("Surface generation {}", generation);
                true
            }
            Err(e) => {
                self.handler.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Incompatible surface: {}", e);
                false
            }
        }
    }

    /// Entry point for the device's scheduled-frame-completed callback.
    pub fn on_scheduled_frame_completed(
        &self,
        frame: Box<dyn OutputFrame>,
        result: CompletionResult,
    ) {
        self.handler.scheduled_frame_completed(frame, result);
    }

    pub fn state(&self) -> OutputState {
        self.handler.state.load()
    }

    pub fn is_running(&self) -> bool {
        self.state() == OutputState::Running
    }

    pub fn timing(&self) -> PlaybackTiming {
        self.handler.schedule.lock().timing
    }

    pub fn resolution(&self) -> Resolution {
        self.handler.schedule.lock().resolution
    }

    /// Frames handed to the device since the last start, preroll included.
    pub fn frames_scheduled(&self) -> u64 {
        self.handler.schedule.lock().frames_scheduled
    }

    pub fn modes(&self) -> &ModeCatalog {
        &self.modes
    }

    pub fn stats(&self) -> OutputStats {
        let c = &self.handler.stats;
        OutputStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            scheduled: c.scheduled.load(Ordering::Relaxed),
            completed_late: c.completed_late.load(Ordering::Relaxed),
            dropped_by_device: c.dropped_by_device.load(Ordering::Relaxed),
            dropped_blank: c.dropped_blank.load(Ordering::Relaxed),
        }
    }
}

impl Drop for OutputChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

impl OutputCallback for OutputHandler {
    fn scheduled_frame_completed(&self, mut frame: Box<dyn OutputFrame>, result: CompletionResult) {
        match result {
            CompletionResult::Completed | CompletionResult::Flushed => {}
            CompletionResult::DisplayedLate => {
                self.stats.completed_late.fetch_add(1, Ordering::Relaxed);
                debug!("Frame displayed late");
            }
            CompletionResult::Dropped => {
                self.stats.dropped_by_device.fetch_add(1, Ordering::Relaxed);
                debug!("Frame dropped by device");
            }
        }

        if self.state.load() != OutputState::Running {
            trace!("Completion after stop, releasing frame");
            return;
        }
        let Some(output) = self.output.upgrade() else {
            return;
        };

        let mut schedule = self.schedule.lock();
        let dst_row_bytes = frame.row_bytes();
        if self
            .surface
            .copy_latest_into(frame.bytes_mut(), dst_row_bytes)
            .is_none()
        {
            self.stats.dropped_blank.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("deckbridge_frames_dropped_output").increment(1);
            trace!("No surface submitted yet, releasing returned frame");
            return;
        }

        let timing = schedule.timing;
        match output.schedule_video_frame(
            frame,
            schedule.next_display_time(),
            timing.frame_duration,
            timing.time_scale,
        ) {
            Ok(()) => {
                schedule.frames_scheduled += 1;
                self.stats.scheduled.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("deckbridge_frames_scheduled").increment(1);
            }
            Err(e) => error!("Failed to reschedule output frame: {}", e),
        }
    }

    fn playback_stopped(&self) {
        debug!("Scheduled playback stopped");
    }
}
