use std::sync::Arc;

use tracing::{debug, info};

use crate::device::{DeckDevice, DeviceContext};

/// Pick the best registered device for capture.
///
/// Prefers a device whose input supports format detection, then any device
/// with an input, in index order.
pub fn auto_detect_device(context: &DeviceContext) -> Option<(i64, Arc<dyn DeckDevice>)> {
    info!("Auto-detecting capture devices...");

    let mut fallback = None;
    for (index, device) in context.devices() {
        if device.input().is_none() {
            debug!("Skipping {}: no video input", device.display_name());
            continue;
        }
        if device.attributes().supports_format_detection {
            info!(
                "Found device with format detection: {} (index {})",
                device.display_name(),
                index
            );
            return Some((index, device));
        }
        fallback.get_or_insert((index, device));
    }

    if let Some((index, device)) = &fallback {
        info!("Found capture device: {} (index {})", device.display_name(), index);
    }
    fallback
}

/// Resolve the configured device index, falling back to auto-detection.
pub fn select_device(
    context: &DeviceContext,
    index: Option<i64>,
) -> Option<(i64, Arc<dyn DeckDevice>)> {
    match index {
        Some(index) => context.device(index).map(|device| (index, device)),
        None => auto_detect_device(context),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SoftwareConverter;
    use crate::loopback::LoopbackDevice;

    fn context_with(devices: Vec<LoopbackDevice>) -> DeviceContext {
        let ctx = DeviceContext::new(Arc::new(SoftwareConverter));
        for device in devices {
            ctx.device_arrived(Arc::new(device));
        }
        ctx
    }

    #[test]
    fn test_prefers_format_detection() {
        let ctx = context_with(vec![
            LoopbackDevice::builder("plain")
                .sub_device_index(0)
                .format_detection(false)
                .build(),
            LoopbackDevice::builder("detecting").sub_device_index(1).build(),
        ]);
        let (index, device) = auto_detect_device(&ctx).unwrap();
        assert_eq!(index, 1);
        assert_eq!(device.display_name(), "detecting");
    }

    #[test]
    fn test_skips_output_only_devices() {
        let ctx = context_with(vec![
            LoopbackDevice::builder("playout").input(false).build(),
            LoopbackDevice::builder("plain")
                .sub_device_index(3)
                .format_detection(false)
                .build(),
        ]);
        assert_eq!(auto_detect_device(&ctx).unwrap().0, 3);
    }

    #[test]
    fn test_no_devices() {
        let ctx = context_with(Vec::new());
        assert!(auto_detect_device(&ctx).is_none());
        assert!(select_device(&ctx, Some(0)).is_none());
    }
}
