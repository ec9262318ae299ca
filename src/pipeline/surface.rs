//! Single "next frame to send" surface for the output side.

use parking_lot::Mutex;
use thiserror::Error;

use crate::capture::frame::{Frame, PixelFormat};
use crate::modes::Resolution;

/// Why a submission was not applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitRejection {
    #[error("output is not configured with a resolution yet")]
    NotConfigured,

    #[error("incompatible surface size {got:?}, output expects {expected:?}")]
    SizeMismatch {
        expected: Resolution,
        got: Resolution,
    },

    #[error("incompatible pixel layout {got:?}, output expects {expected:?}")]
    FormatMismatch {
        expected: PixelFormat,
        got: PixelFormat,
    },

    #[error("row stride {got} is shorter than a packed row of {needed} bytes")]
    StrideTooSmall { needed: usize, got: usize },
}

/// Latest application-submitted image, overwritten by every submission.
#[derive(Default)]
pub struct SurfaceSlot {
    inner: Mutex<SurfaceState>,
}

#[derive(Default)]
struct SurfaceState {
    resolution: Option<Resolution>,
    format: PixelFormat,
    surface: Option<Frame>,
    generation: u64,
}

impl SurfaceSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the accepted layout. A held surface of a different size is dropped.
    pub fn configure(&self, resolution: Resolution, format: PixelFormat) {
        let mut state = self.inner.lock();
        let stale = state.surface.as_ref().is_some_and(|s| {
            s.width() != resolution.width
                || s.height() != resolution.height
                || s.format() != format
        });
        if stale {
            state.surface = None;
        }
        state.resolution = Some(resolution);
        state.format = format;
    }

    /// Copy `image` into the owned surface, allocating it lazily.
    ///
    /// Returns the new generation number.
    pub fn submit(&self, image: &Frame) -> Result<u64, SubmitRejection> {
        let mut state = self.inner.lock();
        let expected = state.resolution.ok_or(SubmitRejection::NotConfigured)?;
        let got = Resolution::new(image.width(), image.height());
        if got != expected {
            return Err(SubmitRejection::SizeMismatch { expected, got });
        }
        if image.format() != state.format {
            return Err(SubmitRejection::FormatMismatch {
                expected: state.format,
                got: image.format(),
            });
        }
        let needed = state.format.row_bytes(expected.width);
        if image.row_bytes() < needed {
            return Err(SubmitRejection::StrideTooSmall {
                needed,
                got: image.row_bytes(),
            });
        }

        let format = state.format;
        let surface = state
            .surface
            .get_or_insert_with(|| Frame::new(expected.width, expected.height, format));
        let dst_row_bytes = surface.row_bytes();
        copy_rows(
            image.as_bytes(),
            image.row_bytes(),
            surface.as_bytes_mut(),
            dst_row_bytes,
            needed,
            expected.height,
        );
        state.generation += 1;
        Ok(state.generation)
    }

    /// Copy the latest surface into a hardware buffer.
    ///
    /// Returns `None`, leaving `dst` untouched, if nothing was ever submitted.
    pub fn copy_latest_into(&self, dst: &mut [u8], dst_row_bytes: usize) -> Option<u64> {
        let state = self.inner.lock();
        let surface = state.surface.as_ref()?;
        let packed = surface.format().row_bytes(surface.width());
        copy_rows(
            surface.as_bytes(),
            surface.row_bytes(),
            dst,
            dst_row_bytes,
            packed,
            surface.height(),
        );
        Some(state.generation)
    }

    pub fn has_surface(&self) -> bool {
        self.inner.lock().surface.is_some()
    }

    /// Number of accepted submissions so far.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }
}

/// Copy `height` rows of `row_len` bytes between buffers with different strides.
/// Rows that do not fit in either buffer are skipped.
pub(crate) fn copy_rows(
    src: &[u8],
    src_row_bytes: usize,
    dst: &mut [u8],
    dst_row_bytes: usize,
    row_len: usize,
    height: u32,
) {
    if src_row_bytes == dst_row_bytes && src_row_bytes == row_len {
        let len = (row_len * height as usize).min(src.len()).min(dst.len());
        dst[..len].copy_from_slice(&src[..len]);
        return;
    }
    for y in 0..height as usize {
        let (s, d) = (y * src_row_bytes, y * dst_row_bytes);
        if s + row_len > src.len() || d + row_len > dst.len() {
            break;
        }
        dst[d..d + row_len].copy_from_slice(&src[s..s + row_len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(width: u32, height: u32, value: u8) -> Frame {
        let mut frame = Frame::new(width, height, PixelFormat::Bgra8Bit);
        frame.as_bytes_mut().fill(value);
        frame
    }

    #[test]
    fn test_submit_before_configure_rejected() {
        let slot = SurfaceSlot::new();
        assert_eq!(
            slot.submit(&image(2, 2, 1)),
            Err(SubmitRejection::NotConfigured)
        );
    }

    #[test]
    fn test_submit_size_mismatch_rejected() {
        let slot = SurfaceSlot::new();
        slot.configure(Resolution::new(4, 4), PixelFormat::Bgra8Bit);
        assert!(matches!(
            slot.submit(&image(2, 2, 1)),
            Err(SubmitRejection::SizeMismatch { .. })
        ));
        assert!(!slot.has_surface());
    }

    #[test]
    fn test_submit_format_mismatch_rejected() {
        let slot = SurfaceSlot::new();
        slot.configure(Resolution::new(2, 2), PixelFormat::Bgra8Bit);
        let argb = Frame::new(2, 2, PixelFormat::Argb8Bit);
        assert!(matches!(
            slot.submit(&argb),
            Err(SubmitRejection::FormatMismatch { .. })
        ));
    }

    #[test]
    fn test_submit_and_copy_with_padded_destination() {
        let slot = SurfaceSlot::new();
        slot.configure(Resolution::new(2, 2), PixelFormat::Bgra8Bit);
        assert_eq!(slot.submit(&image(2, 2, 9)), Ok(1));

        let mut dst = vec![0u8; 2 * 12];
        assert_eq!(slot.copy_latest_into(&mut dst, 12), Some(1));
        assert_eq!(&dst[..8], &[9; 8]);
        assert_eq!(&dst[8..12], &[0; 4]);
        assert_eq!(&dst[12..20], &[9; 8]);
    }

    #[test]
    fn test_copy_without_surface_leaves_destination() {
        let slot = SurfaceSlot::new();
        slot.configure(Resolution::new(2, 2), PixelFormat::Bgra8Bit);
        let mut dst = vec![5u8; 16];
        assert_eq!(slot.copy_latest_into(&mut dst, 8), None);
        assert_eq!(dst, vec![5u8; 16]);
    }

    #[test]
    fn test_reconfigure_drops_stale_surface() {
        let slot = SurfaceSlot::new();
        slot.configure(Resolution::new(2, 2), PixelFormat::Bgra8Bit);
        slot.submit(&image(2, 2, 1)).unwrap();
        slot.configure(Resolution::new(2, 2), PixelFormat::Bgra8Bit);
        assert!(slot.has_surface());
        slot.configure(Resolution::new(4, 2), PixelFormat::Bgra8Bit);
        assert!(!slot.has_surface());
    }
}
