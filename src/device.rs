//! Hardware device collaborator interfaces.
//!
//! The vendor SDK is reached only through these traits. Callbacks are
//! registered as `Arc<dyn …>` handles and cleared with `set_callback(None)`;
//! handler lifetime follows ordinary ownership.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::capture::convert::PixelConverter;
use crate::capture::frame::PixelFormat;
use crate::capture::timecode::{RawTimecode, TimecodeFormat};
use crate::error::HardwareResult;
use crate::modes::{DisplayMode, DisplayModeId};

/// A captured frame lent to the input callback for the duration of the call.
pub trait InputFrame {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn row_bytes(&self) -> usize;
    fn pixel_format(&self) -> PixelFormat;
    /// False when the device flagged the frame as having no input signal.
    fn has_input_source(&self) -> bool;
    fn bytes(&self) -> &[u8];
    fn timecode(&self, format: TimecodeFormat) -> Option<RawTimecode>;
}

/// A hardware-owned playback buffer. Ownership moves to the device when the
/// frame is scheduled and comes back through [`OutputCallback`].
pub trait OutputFrame: Send {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn row_bytes(&self) -> usize;
    fn pixel_format(&self) -> PixelFormat;
    fn bytes(&self) -> &[u8];
    fn bytes_mut(&mut self) -> &mut [u8];
}

/// What changed in the incoming signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormatChangeEvents {
    pub display_mode_changed: bool,
    pub field_dominance_changed: bool,
    pub colorspace_changed: bool,
}

/// Signal properties detected alongside a format change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DetectedFormatFlags {
    pub ycbcr422: bool,
    pub rgb444: bool,
    pub dual_stream_3d: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputFlags {
    pub format_detection: bool,
}

/// How the device disposed of a scheduled frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionResult {
    Completed,
    DisplayedLate,
    Dropped,
    Flushed,
}

/// Capability flags read once per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceAttributes {
    pub supports_format_detection: bool,
    pub sub_device_index: i64,
}

/// Receives capture events on a device-owned thread.
pub trait InputCallback: Send + Sync {
    fn frame_arrived(&self, frame: &dyn InputFrame);

    fn format_changed(
        &self,
        events: FormatChangeEvents,
        new_mode: &DisplayMode,
        detected: DetectedFormatFlags,
    );
}

/// Receives playback completions on a device-owned thread.
pub trait OutputCallback: Send + Sync {
    fn scheduled_frame_completed(&self, frame: Box<dyn OutputFrame>, result: CompletionResult);

    fn playback_stopped(&self) {}
}

pub trait VideoInput: Send + Sync {
    fn display_modes(&self) -> Vec<DisplayMode>;
    fn enable_video_input(
        &self,
        mode: DisplayModeId,
        format: PixelFormat,
        flags: InputFlags,
    ) -> HardwareResult;
    fn disable_video_input(&self) -> HardwareResult;
    fn start_streams(&self) -> HardwareResult;
    fn stop_streams(&self) -> HardwareResult;
    fn set_callback(&self, callback: Option<Arc<dyn InputCallback>>);
}

pub trait VideoOutput: Send + Sync {
    fn display_modes(&self) -> Vec<DisplayMode>;
    fn enable_video_output(&self, mode: DisplayModeId) -> HardwareResult;
    fn disable_video_output(&self) -> HardwareResult;
    fn create_video_frame(
        &self,
        width: u32,
        height: u32,
        row_bytes: usize,
        format: PixelFormat,
        flip_vertical: bool,
    ) -> HardwareResult<Box<dyn OutputFrame>>;
    /// Queue a frame for display. The frame is consumed even on failure.
    fn schedule_video_frame(
        &self,
        frame: Box<dyn OutputFrame>,
        display_time: i64,
        duration: i64,
        time_scale: i64,
    ) -> HardwareResult;
    fn start_scheduled_playback(&self, start_time: i64, time_scale: i64, speed: f64)
        -> HardwareResult;
    fn stop_scheduled_playback(&self) -> HardwareResult;
    fn set_callback(&self, callback: Option<Arc<dyn OutputCallback>>);
}

/// One physical (or virtual) card.
pub trait DeckDevice: Send + Sync {
    fn display_name(&self) -> String;
    fn attributes(&self) -> DeviceAttributes;
    fn input(&self) -> Option<Arc<dyn VideoInput>>;
    fn output(&self) -> Option<Arc<dyn VideoOutput>>;
}

/// Hot-plug notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Arrived { index: i64, name: String },
    Removed { index: i64, name: String },
}

/// Process-wide device state, constructed once by the application and
/// shared by reference with the channels that need it.
pub struct DeviceContext {
    devices: RwLock<BTreeMap<i64, Arc<dyn DeckDevice>>>,
    converter: Arc<dyn PixelConverter>,
    subscribers: Mutex<Vec<flume::Sender<DeviceEvent>>>,
}

impl DeviceContext {
    pub fn new(converter: Arc<dyn PixelConverter>) -> Self {
        Self {
            devices: RwLock::new(BTreeMap::new()),
            converter,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn converter(&self) -> Arc<dyn PixelConverter> {
        self.converter.clone()
    }

    /// Receive arrival/removal events from now on.
    pub fn subscribe(&self) -> flume::Receiver<DeviceEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Register a device under its sub-device index, replacing any previous
    /// device at that index.
    pub fn device_arrived(&self, device: Arc<dyn DeckDevice>) -> i64 {
        let index = device.attributes().sub_device_index;
        let name = device.display_name();
        info!("Device {} with index {} arrived", name, index);

        if self.devices.write().insert(index, device).is_some() {
            warn!("Replaced existing device at index {}", index);
        }
        self.notify(DeviceEvent::Arrived { index, name });
        index
    }

    pub fn device_removed(&self, index: i64) -> Option<Arc<dyn DeckDevice>> {
        let removed = self.devices.write().remove(&index)?;
        let name = removed.display_name();
        info!("Device {} removed", name);
        self.notify(DeviceEvent::Removed { index, name });
        Some(removed)
    }

    pub fn device(&self, index: i64) -> Option<Arc<dyn DeckDevice>> {
        self.devices.read().get(&index).cloned()
    }

    /// Devices in index order.
    pub fn devices(&self) -> Vec<(i64, Arc<dyn DeckDevice>)> {
        self.devices
            .read()
            .iter()
            .map(|(index, device)| (*index, device.clone()))
            .collect()
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices
            .read()
            .values()
            .map(|d| d.display_name())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    fn notify(&self, event: DeviceEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!("Dropping disconnected device event subscriber");
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::convert::SoftwareConverter;
    use crate::loopback::LoopbackDevice;

    fn context() -> DeviceContext {
        DeviceContext::new(Arc::new(SoftwareConverter))
    }

    #[test]
    fn test_arrival_is_broadcast() {
        let ctx = context();
        let events = ctx.subscribe();
        let device = LoopbackDevice::builder("Card A").sub_device_index(2).build();
        assert_eq!(ctx.device_arrived(Arc::new(device)), 2);
        assert_eq!(
            events.try_recv().unwrap(),
            DeviceEvent::Arrived {
                index: 2,
                name: "Card A".into()
            }
        );
        assert_eq!(ctx.device_names(), vec!["Card A".to_string()]);
    }

    #[test]
    fn test_removal() {
        let ctx = context();
        ctx.device_arrived(Arc::new(LoopbackDevice::builder("Card A").build()));
        let events = ctx.subscribe();
        assert!(ctx.device_removed(0).is_some());
        assert!(ctx.device_removed(0).is_none());
        assert!(matches!(
            events.try_recv().unwrap(),
            DeviceEvent::Removed { index: 0, .. }
        ));
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let ctx = context();
        drop(ctx.subscribe());
        ctx.device_arrived(Arc::new(LoopbackDevice::builder("Card A").build()));
        assert!(ctx.subscribers.lock().is_empty());
    }

    #[test]
    fn test_devices_in_index_order() {
        let ctx = context();
        ctx.device_arrived(Arc::new(LoopbackDevice::builder("B").sub_device_index(1).build()));
        ctx.device_arrived(Arc::new(LoopbackDevice::builder("A").sub_device_index(0).build()));
        let names: Vec<_> = ctx
            .devices()
            .into_iter()
            .map(|(_, d)| d.display_name())
            .collect();
        assert_eq!(names, vec!["A", "B"]);
    }
}
