//! In-process software device.
//!
//! Implements the device traits without hardware: input frames are injected
//! with [`LoopbackInput::deliver`], format changes with
//! [`LoopbackInput::change_format`], and scheduled output frames are handed
//! back one at a time with [`LoopbackOutput::complete_next`]. Callbacks are
//! always invoked with no internal lock held, so a callback may call back
//! into the device.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::capture::frame::PixelFormat;
use crate::capture::timecode::{RawTimecode, TimecodeFormat};
use crate::device::{
    CompletionResult, DeckDevice, DetectedFormatFlags, DeviceAttributes, FormatChangeEvents,
    InputCallback, InputFlags, InputFrame, OutputCallback, OutputFrame, VideoInput, VideoOutput,
};
use crate::error::{HardwareError, HardwareResult};
use crate::modes::{DisplayMode, DisplayModeId};

pub struct LoopbackDevice {
    name: String,
    attributes: DeviceAttributes,
    input: Option<Arc<LoopbackInput>>,
    output: Option<Arc<LoopbackOutput>>,
}

pub struct LoopbackBuilder {
    name: String,
    sub_device_index: i64,
    input: bool,
    output: bool,
    format_detection: bool,
    modes: Option<Vec<DisplayMode>>,
}

impl LoopbackBuilder {
    pub fn sub_device_index(mut self, index: i64) -> Self {
        self.sub_device_index = index;
        self
    }

    pub fn input(mut self, enabled: bool) -> Self {
        self.input = enabled;
        self
    }

    pub fn output(mut self, enabled: bool) -> Self {
        self.output = enabled;
        self
    }

    pub fn format_detection(mut self, supported: bool) -> Self {
        self.format_detection = supported;
        self
    }

    /// Restrict the advertised modes. Defaults to every standard mode.
    pub fn modes(mut self, modes: Vec<DisplayMode>) -> Self {
        self.modes = Some(modes);
        self
    }

    pub fn build(self) -> LoopbackDevice {
        let modes = self.modes.unwrap_or_else(DisplayMode::all_standard);
        LoopbackDevice {
            name: self.name,
            attributes: DeviceAttributes {
                supports_format_detection: self.format_detection,
                sub_device_index: self.sub_device_index,
            },
            input: self.input.then(|| Arc::new(LoopbackInput::new(modes.clone()))),
            output: self.output.then(|| Arc::new(LoopbackOutput::new(modes))),
        }
    }
}

impl LoopbackDevice {
    /// Input and output, format detection supported, all standard modes.
    pub fn builder(name: impl Into<String>) -> LoopbackBuilder {
        LoopbackBuilder {
            name: name.into(),
            sub_device_index: 0,
            input: true,
            output: true,
            format_detection: true,
            modes: None,
        }
    }

    /// Concrete input handle for driving the device.
    pub fn input_handle(&self) -> Option<Arc<LoopbackInput>> {
        self.input.clone()
    }

    pub fn output_handle(&self) -> Option<Arc<LoopbackOutput>> {
        self.output.clone()
    }
}

impl DeckDevice for LoopbackDevice {
    fn display_name(&self) -> String {
        self.name.clone()
    }

    fn attributes(&self) -> DeviceAttributes {
        self.attributes
    }

    fn input(&self) -> Option<Arc<dyn VideoInput>> {
        self.input.clone().map(|i| i as Arc<dyn VideoInput>)
    }

    fn output(&self) -> Option<Arc<dyn VideoOutput>> {
        self.output.clone().map(|o| o as Arc<dyn VideoOutput>)
    }
}

fn find_mode(modes: &[DisplayMode], id: DisplayModeId) -> Option<&DisplayMode> {
    modes.iter().find(|m| m.id == id)
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

pub struct LoopbackInput {
    modes: Vec<DisplayMode>,
    state: Mutex<InputState>,
    callback: Mutex<Option<Arc<dyn InputCallback>>>,
    hardware_calls: AtomicU64,
}

#[derive(Default)]
struct InputState {
    enabled: Option<(DisplayModeId, PixelFormat, InputFlags)>,
    streaming: bool,
    busy: bool,
    fail_enable: u32,
    fail_start: u32,
}

impl LoopbackInput {
    fn new(modes: Vec<DisplayMode>) -> Self {
        Self {
            modes,
            state: Mutex::new(InputState::default()),
            callback: Mutex::new(None),
            hardware_calls: AtomicU64::new(0),
        }
    }

    fn count_call(&self) {
        self.hardware_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Hand a frame to the armed callback. Returns false, without calling
    /// anything, when not streaming or no callback is armed.
    pub fn deliver(&self, frame: &dyn InputFrame) -> bool {
        if !self.state.lock().streaming {
            return false;
        }
        let Some(callback) = self.callback.lock().clone() else {
            return false;
        };
        callback.frame_arrived(frame);
        true
    }

    /// Report a new incoming signal format. Only delivered when the input
    /// was enabled with format detection and a callback is armed.
    pub fn change_format(&self, mode: DisplayModeId, detected: DetectedFormatFlags) -> bool {
        let Some(new_mode) = find_mode(&self.modes, mode).cloned() else {
            return false;
        };
        let detecting = self
            .state
            .lock()
            .enabled
            .is_some_and(|(_, _, flags)| flags.format_detection);
        if !detecting {
            return false;
        }
        let Some(callback) = self.callback.lock().clone() else {
            return false;
        };

        debug!("Loopback input switching to {}", new_mode.name);
        let events = FormatChangeEvents {
            display_mode_changed: true,
            field_dominance_changed: false,
            colorspace_changed: detected.rgb444,
        };
        callback.format_changed(events, &new_mode, detected);
        true
    }

    /// Make the next `enable_video_input` fail.
    pub fn fail_next_enable(&self) {
        self.state.lock().fail_enable += 1;
    }

    /// Make the next `start_streams` fail.
    pub fn fail_next_start(&self) {
        self.state.lock().fail_start += 1;
    }

    /// Simulate another process holding the input.
    pub fn set_busy(&self, busy: bool) {
        self.state.lock().busy = busy;
    }

    pub fn enabled_mode(&self) -> Option<DisplayModeId> {
        self.state.lock().enabled.map(|(mode, _, _)| mode)
    }

    pub fn enabled_format(&self) -> Option<PixelFormat> {
        self.state.lock().enabled.map(|(_, format, _)| format)
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().streaming
    }

    pub fn callback_armed(&self) -> bool {
        self.callback.lock().is_some()
    }

    /// Number of device calls made, mode enumeration excluded.
    pub fn hardware_calls(&self) -> u64 {
        self.hardware_calls.load(Ordering::Relaxed)
    }
}

impl VideoInput for LoopbackInput {
    fn display_modes(&self) -> Vec<DisplayMode> {
        self.modes.clone()
    }

    fn enable_video_input(
        &self,
        mode: DisplayModeId,
        format: PixelFormat,
        flags: InputFlags,
    ) -> HardwareResult {
        self.count_call();
        let mut state = self.state.lock();
        if state.busy {
            return Err(HardwareError::Busy);
        }
        if state.fail_enable > 0 {
            state.fail_enable -= 1;
            return Err(HardwareError::Other("injected enable failure".into()));
        }
        if find_mode(&self.modes, mode).is_none() {
            return Err(HardwareError::UnsupportedMode(mode));
        }
        state.enabled = Some((mode, format, flags));
        Ok(())
    }

    fn disable_video_input(&self) -> HardwareResult {
        self.count_call();
        let mut state = self.state.lock();
        state.enabled = None;
        state.streaming = false;
        Ok(())
    }

    fn start_streams(&self) -> HardwareResult {
        self.count_call();
        let mut state = self.state.lock();
        if state.enabled.is_none() {
            return Err(HardwareError::InvalidState("input not enabled"));
        }
        if state.fail_start > 0 {
            state.fail_start -= 1;
            return Err(HardwareError::Other("injected start failure".into()));
        }
        state.streaming = true;
        Ok(())
    }

    fn stop_streams(&self) -> HardwareResult {
        self.count_call();
        self.state.lock().streaming = false;
        Ok(())
    }

    fn set_callback(&self, callback: Option<Arc<dyn InputCallback>>) {
        self.count_call();
        *self.callback.lock() = callback;
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

struct ScheduledFrame {
    frame: Box<dyn OutputFrame>,
    display_time: i64,
}

/// Display times retained by [`LoopbackOutput::schedule_history`].
pub const SCHEDULE_HISTORY_LIMIT: usize = 256;

pub struct LoopbackOutput {
    modes: Vec<DisplayMode>,
    state: Mutex<OutputState>,
    callback: Mutex<Option<Arc<dyn OutputCallback>>>,
    hardware_calls: AtomicU64,
}

#[derive(Default)]
struct OutputState {
    enabled: Option<DisplayModeId>,
    playback: Option<(i64, i64, f64)>,
    queue: VecDeque<ScheduledFrame>,
    history: VecDeque<i64>,
    frames_created: u64,
    last_flip_vertical: bool,
    fail_enable: u32,
    fail_schedule: u32,
    fail_playback: u32,
}

impl LoopbackOutput {
    fn new(modes: Vec<DisplayMode>) -> Self {
        Self {
            modes,
            state: Mutex::new(OutputState::default()),
            callback: Mutex::new(None),
            hardware_calls: AtomicU64::new(0),
        }
    }

    fn count_call(&self) {
        self.hardware_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Return the oldest scheduled frame through the armed callback.
    ///
    /// Returns false if nothing is queued. Without an armed callback the
    /// frame is released.
    pub fn complete_next(&self, result: CompletionResult) -> bool {
        let Some(scheduled) = self.state.lock().queue.pop_front() else {
            return false;
        };
        trace!("Loopback completing frame at {}", scheduled.display_time);
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback.scheduled_frame_completed(scheduled.frame, result);
        }
        true
    }

    pub fn fail_next_enable(&self) {
        self.state.lock().fail_enable += 1;
    }

    pub fn fail_next_schedule(&self) {
        self.state.lock().fail_schedule += 1;
    }

    pub fn fail_next_playback(&self) {
        self.state.lock().fail_playback += 1;
    }

    /// Frames queued and not yet completed.
    pub fn scheduled_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Display times of the queued frames, oldest first.
    pub fn scheduled_times(&self) -> Vec<i64> {
        self.state
            .lock()
            .queue
            .iter()
            .map(|s| s.display_time)
            .collect()
    }

    /// Display times of the most recent frames scheduled since the output
    /// was enabled, oldest first. Keeps at most [`SCHEDULE_HISTORY_LIMIT`].
    pub fn schedule_history(&self) -> Vec<i64> {
        self.state.lock().history.iter().copied().collect()
    }

    /// Contents of the most recently queued frame.
    pub fn last_scheduled_bytes(&self) -> Option<Vec<u8>> {
        self.state
            .lock()
            .queue
            .back()
            .map(|s| s.frame.bytes().to_vec())
    }

    pub fn frames_created(&self) -> u64 {
        self.state.lock().frames_created
    }

    pub fn last_flip_vertical(&self) -> bool {
        self.state.lock().last_flip_vertical
    }

    pub fn enabled_mode(&self) -> Option<DisplayModeId> {
        self.state.lock().enabled
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playback.is_some()
    }

    /// `(start_time, time_scale, speed)` of the running playback.
    pub fn playback_start(&self) -> Option<(i64, i64, f64)> {
        self.state.lock().playback
    }

    pub fn callback_armed(&self) -> bool {
        self.callback.lock().is_some()
    }

    pub fn hardware_calls(&self) -> u64 {
        self.hardware_calls.load(Ordering::Relaxed)
    }
}

impl VideoOutput for LoopbackOutput {
    fn display_modes(&self) -> Vec<DisplayMode> {
        self.modes.clone()
    }

    fn enable_video_output(&self, mode: DisplayModeId) -> HardwareResult {
        self.count_call();
        let mut state = self.state.lock();
        if state.fail_enable > 0 {
            state.fail_enable -= 1;
            return Err(HardwareError::Other("injected enable failure".into()));
        }
        if find_mode(&self.modes, mode).is_none() {
            return Err(HardwareError::UnsupportedMode(mode));
        }
        state.enabled = Some(mode);
        state.history.clear();
        Ok(())
    }

    fn disable_video_output(&self) -> HardwareResult {
        self.count_call();
        let mut state = self.state.lock();
        state.enabled = None;
        state.queue.clear();
        Ok(())
    }

    fn create_video_frame(
        &self,
        width: u32,
        height: u32,
        row_bytes: usize,
        format: PixelFormat,
        flip_vertical: bool,
    ) -> HardwareResult<Box<dyn OutputFrame>> {
        self.count_call();
        if row_bytes < format.row_bytes(width) {
            return Err(HardwareError::InvalidState("row stride too small"));
        }
        let mut state = self.state.lock();
        state.frames_created += 1;
        state.last_flip_vertical = flip_vertical;
        Ok(Box::new(LoopbackFrame::new(width, height, row_bytes, format)))
    }

    fn schedule_video_frame(
        &self,
        frame: Box<dyn OutputFrame>,
        display_time: i64,
        _duration: i64,
        _time_scale: i64,
    ) -> HardwareResult {
        self.count_call();
        let mut state = self.state.lock();
        if state.enabled.is_none() {
            return Err(HardwareError::InvalidState("output not enabled"));
        }
        if state.fail_schedule > 0 {
            state.fail_schedule -= 1;
            return Err(HardwareError::Other("injected schedule failure".into()));
        }
        state.queue.push_back(ScheduledFrame {
            frame,
            display_time,
        });
        if state.history.len() == SCHEDULE_HISTORY_LIMIT {
            state.history.pop_front();
        }
        state.history.push_back(display_time);
        Ok(())
    }

    fn start_scheduled_playback(
        &self,
        start_time: i64,
        time_scale: i64,
        speed: f64,
    ) -> HardwareResult {
        self.count_call();
        let mut state = self.state.lock();
        if state.enabled.is_none() {
            return Err(HardwareError::InvalidState("output not enabled"));
        }
        if state.fail_playback > 0 {
            state.fail_playback -= 1;
            return Err(HardwareError::Other("injected playback failure".into()));
        }
        state.playback = Some((start_time, time_scale, speed));
        Ok(())
    }

    fn stop_scheduled_playback(&self) -> HardwareResult {
        self.count_call();
        let was_playing = {
            let mut state = self.state.lock();
            state.queue.clear();
            state.playback.take().is_some()
        };
        if was_playing {
            let callback = self.callback.lock().clone();
            if let Some(callback) = callback {
                callback.playback_stopped();
            }
        }
        Ok(())
    }

    fn set_callback(&self, callback: Option<Arc<dyn OutputCallback>>) {
        self.count_call();
        *self.callback.lock() = callback;
    }
}

/// Playback buffer handed out by [`LoopbackOutput`].
pub struct LoopbackFrame {
    width: u32,
    height: u32,
    row_bytes: usize,
    format: PixelFormat,
    data: Vec<u8>,
}

impl LoopbackFrame {
    /// Zeroed buffer of `row_bytes * height` bytes.
    pub fn new(width: u32, height: u32, row_bytes: usize, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            row_bytes,
            format,
            data: vec![0; row_bytes * height as usize],
        }
    }
}

impl OutputFrame for LoopbackFrame {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn row_bytes(&self) -> usize {
        self.row_bytes
    }

    fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

// ---------------------------------------------------------------------------
// Synthetic input frames
// ---------------------------------------------------------------------------

/// A capture frame built in memory, for injection with
/// [`LoopbackInput::deliver`].
#[derive(Debug, Clone)]
pub struct SyntheticFrame {
    width: u32,
    height: u32,
    row_bytes: usize,
    format: PixelFormat,
    data: Vec<u8>,
    has_signal: bool,
    timecodes: HashMap<TimecodeFormat, RawTimecode>,
}

impl SyntheticFrame {
    /// Packed frame of `format` with every byte set to `value`.
    pub fn filled(width: u32, height: u32, format: PixelFormat, value: u8) -> Self {
        let row_bytes = format.row_bytes(width);
        Self {
            width,
            height,
            row_bytes,
            format,
            data: vec![value; row_bytes * height as usize],
            has_signal: true,
            timecodes: HashMap::new(),
        }
    }

    /// UYVY frame with every byte set to `value`.
    pub fn solid(width: u32, height: u32, value: u8) -> Self {
        Self::filled(width, height, PixelFormat::Yuv8Bit, value)
    }

    /// Grey UYVY frame of the given video-range luma.
    pub fn uyvy(width: u32, height: u32, luma: u8) -> Self {
        let mut frame = Self::solid(width, height, 128);
        for pair in frame.data.chunks_exact_mut(4) {
            pair[1] = luma;
            pair[3] = luma;
        }
        frame
    }

    /// BGRA frame of one colour.
    pub fn bgra(width: u32, height: u32, pixel: [u8; 4]) -> Self {
        let mut frame = Self::filled(width, height, PixelFormat::Bgra8Bit, 0);
        for px in frame.data.chunks_exact_mut(4) {
            px.copy_from_slice(&pixel);
        }
        frame
    }

    /// Frame flagged by the device as carrying no input signal.
    pub fn no_signal(width: u32, height: u32) -> Self {
        let mut frame = Self::solid(width, height, 0);
        frame.has_signal = false;
        frame
    }

    pub fn with_timecode(mut self, format: TimecodeFormat, timecode: RawTimecode) -> Self {
        self.timecodes.insert(format, timecode);
        self
    }

    /// Pad every row with `extra` trailing zero bytes.
    pub fn with_row_padding(mut self, extra: usize) -> Self {
        let packed = self.row_bytes;
        let padded = packed + extra;
        let mut data = vec![0; padded * self.height as usize];
        for (src, dst) in self.data.chunks_exact(packed).zip(data.chunks_exact_mut(padded)) {
            dst[..packed].copy_from_slice(src);
        }
        self.data = data;
        self.row_bytes = padded;
        self
    }
}

impl InputFrame for SyntheticFrame {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn row_bytes(&self) -> usize {
        self.row_bytes
    }

    fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    fn has_input_source(&self) -> bool {
        self.has_signal
    }

    fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn timecode(&self, format: TimecodeFormat) -> Option<RawTimecode> {
        self.timecodes.get(&format).copied()
    }
}
